// Worker Pool
//
// Fixed number of tokio tasks draining the job queue. Each worker runs one job
// to completion before taking the next; an empty queue parks the worker until
// an enqueue, the idle timeout or shutdown.

use crate::extractor::{EventExtractor, ExtractReport, ExtractScope};
use crate::ledger::Ledger;
use crate::queue::{FailOutcome, JobQueue};
use crate::registry::PairRegistry;
use crate::scanner::RangeWalker;
use crate::store::{CursorStream, Store};
use crate::types::{Job, JobKind};
use eyre::eyre;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared dependencies of every worker
pub struct WorkerContext {
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<RwLock<PairRegistry>>,
    pub extractor: Arc<EventExtractor>,
    /// Backfill chunking (BACKFILL_RANGE wide)
    pub walker: RangeWalker,
    pub idle_wait: Duration,
}

/// How a job ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Done,
    /// Stopped by shutdown; progress is kept in the backfill cursor
    Interrupted,
}

impl WorkerContext {
    pub async fn execute(&self, job: &Job) -> eyre::Result<JobResult> {
        match job.kind {
            JobKind::Subscribe => self.subscribe(job).await,
            JobKind::Backfill => self.backfill(job).await,
        }
    }

    /// Register the pair for live extraction, then backfill whatever the
    /// live path may already have passed since the job was created.
    async fn subscribe(&self, job: &Job) -> eyre::Result<JobResult> {
        let pair = self
            .store
            .pair(job.pair)
            .await?
            .ok_or_else(|| eyre!("subscribe: pair {:#x} not stored", job.pair))?;

        let added = self.registry.write().await.register(pair);
        self.store.mark_subscribed(job.pair).await?;

        let tip = self.ledger.latest_block_number().await?;
        if tip >= job.from_block {
            let gap = Job::backfill(job.pair, job.from_block, Some(tip));
            self.store.save_job(&gap).await?;
            self.queue.enqueue(gap).await;
        }

        if added {
            info!("Subscribed pair {:#x} from block {}", job.pair, job.from_block);
        }
        Ok(JobResult::Done)
    }

    async fn backfill(&self, job: &Job) -> eyre::Result<JobResult> {
        let stream = CursorStream::Backfill {
            pair: job.pair,
            from_block: job.from_block,
        };
        let to = match job.to_block {
            Some(to) => to,
            None => self.ledger.latest_block_number().await?,
        };
        let from = match self.store.cursor(stream).await? {
            Some(done) => job.from_block.max(done + 1),
            None => job.from_block,
        };

        if from > to {
            debug!("Backfill {} already covered", job);
            return Ok(JobResult::Done);
        }

        let extractor = &self.extractor;
        let store = &self.store;
        let outcome = self
            .walker
            .run(from, to, |range| async move {
                let report = extractor.extract(range, ExtractScope::Pair(job.pair)).await?;
                store.advance_cursor(stream, range.to).await?;
                Ok(report)
            })
            .await;

        let mut total = ExtractReport::default();
        for (_, report) in &outcome.completed {
            total.merge(report);
        }

        if outcome.cancelled {
            info!(
                "Backfill {} interrupted after {} inserts",
                job, total.inserted
            );
            return Ok(JobResult::Interrupted);
        }
        if !outcome.skipped.is_empty() {
            warn!(
                "Backfill {} skipped {} chunks: {:?}",
                job,
                outcome.skipped.len(),
                outcome.skipped
            );
        }

        info!(
            "Backfill {} done: {} swaps, {} inserted, {} duplicates",
            job, total.matched, total.inserted, total.duplicates
        );
        Ok(JobResult::Done)
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    queue: Arc<JobQueue>,
}

impl WorkerPool {
    pub fn spawn(count: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) -> Self {
        let handles = (0..count.max(1))
            .map(|id| {
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(id, ctx, cancel).await })
            })
            .collect();

        info!("Started {} workers", count.max(1));
        Self {
            handles,
            cancel,
            queue: ctx.queue.clone(),
        }
    }

    /// Stop taking jobs and wait for in-flight ones to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.queue.wake_all();

        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    debug!("Worker {} started", id);

    while !cancel.is_cancelled() {
        let Some(job) = ctx.queue.dequeue().await else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ctx.queue.notified() => {}
                _ = tokio::time::sleep(ctx.idle_wait) => {}
            }
            continue;
        };

        debug!("Worker {} running {}", id, job);
        match ctx.execute(&job).await {
            Ok(JobResult::Done) => {
                ctx.queue.complete(&job.id).await;
                if let Err(e) = ctx.store.delete_job(&job.id).await {
                    warn!("Failed to delete finished job {}: {:#}", job.id, e);
                }
            }
            Ok(JobResult::Interrupted) => {
                // Left persisted so the next start resumes it
                ctx.queue.complete(&job.id).await;
            }
            Err(e) => {
                warn!("Job {} failed (attempt {}): {:#}", job, job.retries + 1, e);
                match ctx.queue.fail(job).await {
                    FailOutcome::Requeued(retried) => {
                        if let Err(e) = ctx.store.save_job(&retried).await {
                            warn!("Failed to persist retry of {}: {:#}", retried.id, e);
                        }
                    }
                    FailOutcome::Exhausted(dropped) => {
                        error!("Dropping job {} after {} retries", dropped, dropped.retries);
                        if let Err(e) = ctx.store.delete_job(&dropped.id).await {
                            warn!("Failed to delete dropped job {}: {:#}", dropped.id, e);
                        }
                    }
                }
            }
        }
    }

    debug!("Worker {} stopped", id);
}
