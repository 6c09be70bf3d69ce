// Pipeline Orchestrator
//
// Initializing -> Discovering -> CatchingUp -> Live{Idle|Busy} -> Stopped
//
// Catch-up extracts registered pairs' swaps in BLOCK_RANGE chunks up to a tip
// snapshot, refreshing the snapshot only once it is drained. Live mode reacts
// to block notifications; a notification that arrives while a pass is running
// is dropped because the next pass starts from the `trades` cursor anyway.

use crate::config::Config;
use crate::discovery::PairDiscovery;
use crate::extractor::{EventExtractor, ExtractReport, ExtractScope};
use crate::ledger::Ledger;
use crate::listener::BlockListener;
use crate::queue::JobQueue;
use crate::registry::PairRegistry;
use crate::scanner::{ChunkPolicy, RangeWalker};
use crate::store::{CursorStream, Store};
use crate::tokens::TokenCatalog;
use crate::types::{AllowList, Job};
use crate::worker::{WorkerContext, WorkerPool};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Idle,
    /// A pass is extracting up to `through`
    Busy { through: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Discovering,
    CatchingUp { target: u64 },
    Live(LiveState),
    Stopped,
}

/// Decision taken for one block notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Start a live pass ending at this block
    Run(u64),
    /// Busy or not live: ignore the notification
    Drop,
}

impl PipelineState {
    pub fn on_new_block(self, block: u64) -> (PipelineState, Gate) {
        match self {
            PipelineState::Live(LiveState::Idle) => (
                PipelineState::Live(LiveState::Busy { through: block }),
                Gate::Run(block),
            ),
            other => (other, Gate::Drop),
        }
    }

    pub fn on_pass_finished(self) -> PipelineState {
        match self {
            PipelineState::Live(LiveState::Busy { .. }) => PipelineState::Live(LiveState::Idle),
            other => other,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Initializing => f.write_str("initializing"),
            PipelineState::Discovering => f.write_str("discovering"),
            PipelineState::CatchingUp { target } => write!(f, "catching up to {target}"),
            PipelineState::Live(LiveState::Idle) => f.write_str("live (idle)"),
            PipelineState::Live(LiveState::Busy { through }) => {
                write!(f, "live (busy through {through})")
            }
            PipelineState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Resume point: explicit override, else after the `trades` cursor, else the
/// factory deployment block.
pub fn resolve_start(override_block: Option<u64>, trades_cursor: Option<u64>, deploy_block: u64) -> u64 {
    override_block
        .or(trades_cursor.map(|block| block + 1))
        .unwrap_or(deploy_block)
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: Config,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    registry: Arc<RwLock<PairRegistry>>,
    discovery: PairDiscovery,
    extractor: Arc<EventExtractor>,
    /// Catch-up and live chunking (BLOCK_RANGE wide)
    walker: RangeWalker,
    /// Backfill chunking (BACKFILL_RANGE wide)
    backfill_walker: RangeWalker,
    allow: AllowList,
    state: Mutex<PipelineState>,
    resume_from: AtomicU64,
    notifications: AtomicU64,
    cancel: CancellationToken,
    jobs_cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: Config,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
    ) -> Self {
        let allow = config.contracts.allow_list();
        let queue = Arc::new(JobQueue::new(config.max_job_retries));
        let registry = Arc::new(RwLock::new(PairRegistry::new()));
        let tokens = Arc::new(TokenCatalog::new(
            ledger.clone(),
            config.contracts.price_view,
            config.contracts.pinned_tokens.iter().copied(),
        ));

        let policy = |width: u64| {
            ChunkPolicy::new(width)
                .with_retries(config.max_chunk_retries)
                .with_backoff(config.retry_backoff)
                .with_throttle(config.chunk_delay)
        };
        let walker = RangeWalker::new(policy(config.block_range), cancel.clone());
        // Running backfills outlive the stop signal; only abort_jobs cuts them short
        let jobs_cancel = CancellationToken::new();
        let backfill_walker = RangeWalker::new(policy(config.backfill_range), jobs_cancel.clone());

        let extractor = Arc::new(EventExtractor::new(
            ledger.clone(),
            store.clone(),
            registry.clone(),
            tokens,
            allow.clone(),
        ));
        let discovery = PairDiscovery::new(
            ledger.clone(),
            store.clone(),
            queue.clone(),
            walker.clone(),
            config.contracts.factory,
            allow.clone(),
        );

        Self {
            config,
            ledger,
            store,
            queue,
            registry,
            discovery,
            extractor,
            walker,
            backfill_walker,
            allow,
            state: Mutex::new(PipelineState::Initializing),
            resume_from: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            cancel,
            jobs_cancel,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<RwLock<PairRegistry>> {
        &self.registry
    }

    pub async fn state(&self) -> PipelineState {
        *self.state.lock().await
    }

    /// Interrupt running backfills at their next chunk boundary. They stay
    /// persisted and resume from their cursor on the next start.
    pub fn abort_jobs(&self) {
        self.jobs_cancel.cancel();
    }

    async fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock().await;
        if *state != next {
            info!("Pipeline {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Worker context sharing this pipeline's queue, registry and extractor
    pub fn worker_context(&self) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            extractor: self.extractor.clone(),
            walker: self.backfill_walker.clone(),
            idle_wait: self.config.idle_wait,
        })
    }

    /// Seed the registry, restore jobs and resolve the resume block.
    pub async fn initialize(&self) -> eyre::Result<u64> {
        self.set_state(PipelineState::Initializing).await;

        let pairs = self.store.allowed_pairs(&self.allow).await?;
        let (subscribed, unsubscribed): (Vec<_>, Vec<_>) =
            pairs.into_iter().partition(|pair| pair.subscribed);
        self.registry.write().await.register_all(subscribed);

        let mut restored = 0;
        for job in self.store.pending_jobs().await? {
            if self.queue.enqueue(job).await {
                restored += 1;
            }
        }

        // Subscribe from the creation block: its gap backfill shares the
        // discovery backfill's id, so a pending one is not duplicated
        let mut regenerated = 0;
        for pair in unsubscribed {
            let job = Job::subscribe(pair.address, pair.created_block);
            if self.queue.enqueue(job.clone()).await {
                self.store.save_job(&job).await?;
                regenerated += 1;
            }
        }

        let trades_cursor = self.store.cursor(CursorStream::Trades).await?;
        let start = resolve_start(
            self.config.start_block,
            trades_cursor,
            self.config.contracts.factory_deploy_block,
        );
        self.resume_from.store(start, Ordering::SeqCst);

        info!(
            "Initialized: {} registered pairs, {} jobs restored, {} subscriptions regenerated, resuming at block {}",
            self.registry.read().await.stats().total_pairs,
            restored,
            regenerated,
            start
        );
        Ok(start)
    }

    /// Pair discovery from the `pairs` cursor up to `to`
    pub async fn discover(&self, to: u64) -> eyre::Result<()> {
        self.discovery
            .discover_to(self.config.contracts.factory_deploy_block, to)
            .await?;
        Ok(())
    }

    /// Extract registered pairs' swaps from `start` toward the tip. Returns
    /// the first block not yet extracted.
    pub async fn catch_up(&self, start: u64) -> eyre::Result<u64> {
        let mut next = start;

        while !self.cancel.is_cancelled() {
            let Some(tip) = self
                .walker
                .retry("Tip query", || self.ledger.latest_block_number())
                .await
            else {
                break;
            };

            self.set_state(PipelineState::Discovering).await;
            self.discover(tip).await?;

            if tip < next || tip - next + 1 < self.walker.policy().max_chunk {
                debug!("Within one chunk of tip {} at block {}", tip, next);
                break;
            }

            self.set_state(PipelineState::CatchingUp { target: tip }).await;
            let outcome = self
                .walker
                .run(next, tip, |range| {
                    self.extractor.extract(range, ExtractScope::Registered)
                })
                .await;

            let mut total = ExtractReport::default();
            for (_, report) in &outcome.completed {
                total.merge(report);
            }
            info!(
                "Catch-up {}-{}: {} inserted, {} duplicates, {} skipped chunks",
                next,
                tip,
                total.inserted,
                total.duplicates,
                outcome.skipped.len()
            );

            if let Some(last) = outcome.last_block() {
                next = last + 1;
            }
            if outcome.cancelled {
                break;
            }
        }

        Ok(next)
    }

    /// Handle one new-block notification through the busy gate.
    pub async fn on_new_block(&self, block: u64) -> eyre::Result<Option<ExtractReport>> {
        let gate = {
            let mut state = self.state.lock().await;
            let (next, gate) = state.on_new_block(block);
            *state = next;
            gate
        };

        let Gate::Run(block) = gate else {
            debug!("Block {} notification dropped, pass in progress", block);
            return Ok(None);
        };

        let result = self.live_pass(block).await;

        let mut state = self.state.lock().await;
        *state = state.on_pass_finished();
        result.map(Some)
    }

    async fn live_pass(&self, block: u64) -> eyre::Result<ExtractReport> {
        let seen = self.notifications.fetch_add(1, Ordering::SeqCst) + 1;
        if seen % self.config.discovery_every.max(1) == 0 {
            self.discover(block).await?;
        }

        let from = self
            .store
            .cursor(CursorStream::Trades)
            .await?
            .map(|done| done + 1)
            .unwrap_or_else(|| self.resume_from.load(Ordering::SeqCst));

        let mut total = ExtractReport::default();
        if from > block {
            return Ok(total);
        }

        let outcome = self
            .walker
            .run(from, block, |range| {
                self.extractor.extract(range, ExtractScope::Registered)
            })
            .await;
        for (_, report) in &outcome.completed {
            total.merge(report);
        }
        Ok(total)
    }

    /// Log queue depth (when non-empty) and counters
    pub async fn report_status(&self) {
        let status = self.queue.status().await;
        if status.total() > 0 {
            info!(
                "Queue status: {} queued, {} processing, {} total",
                status.queued,
                status.processing,
                status.total()
            );
        }

        let totals = self.extractor.totals();
        info!(
            "Stats: {} pairs discovered, {} swaps inserted, {} duplicates, {} failed, {} registered pairs",
            self.discovery.discovered(),
            totals.inserted.load(Ordering::Relaxed),
            totals.duplicates.load(Ordering::Relaxed),
            totals.failed.load(Ordering::Relaxed),
            self.registry.read().await.stats().total_pairs
        );
    }

    /// Run until cancelled: initialize, catch up, follow the tip, shut down.
    pub async fn run(self: Arc<Self>) -> eyre::Result<()> {
        let start = self.initialize().await?;

        let pool_cancel = self.cancel.child_token();
        let pool = WorkerPool::spawn(self.config.worker_count, self.worker_context(), pool_cancel);

        let status_task = {
            let this = self.clone();
            tokio::spawn(async move { this.status_loop().await })
        };

        let result = match self.catch_up(start).await {
            Ok(_) if !self.cancel.is_cancelled() => self.follow_tip().await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        // Fatal errors still stop the workers cleanly; in-flight jobs finish
        self.cancel.cancel();
        pool.stop().await;
        if let Err(e) = status_task.await {
            warn!("Status task ended abnormally: {}", e);
        }
        self.set_state(PipelineState::Stopped).await;
        result
    }

    async fn follow_tip(self: &Arc<Self>) -> eyre::Result<()> {
        self.set_state(PipelineState::Live(LiveState::Idle)).await;

        let (tx, mut rx) = mpsc::channel(16);
        let listener = BlockListener::new(
            self.ledger.clone(),
            self.config.poll_interval,
            self.cancel.clone(),
        );
        let listener_task = tokio::spawn(listener.run(tx));
        let tracker = TaskTracker::new();

        loop {
            let block = tokio::select! {
                _ = self.cancel.cancelled() => break,
                block = rx.recv() => block,
            };
            let Some(block) = block else { break };

            let this = self.clone();
            tracker.spawn(async move {
                if let Err(e) = this.on_new_block(block).await {
                    error!("Live pass for block {} failed: {:#}", block, e);
                }
            });
        }

        tracker.close();
        tracker.wait().await;
        if let Err(e) = listener_task.await {
            warn!("Block listener ended abnormally: {}", e);
        }
        Ok(())
    }

    async fn status_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.status_interval.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.report_status().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_runs_when_idle() {
        let (next, gate) = PipelineState::Live(LiveState::Idle).on_new_block(10);
        assert_eq!(gate, Gate::Run(10));
        assert_eq!(next, PipelineState::Live(LiveState::Busy { through: 10 }));
    }

    #[test]
    fn test_gate_drops_while_busy() {
        let busy = PipelineState::Live(LiveState::Busy { through: 10 });
        let (next, gate) = busy.on_new_block(11);
        assert_eq!(gate, Gate::Drop);
        assert_eq!(next, busy);

        assert_eq!(busy.on_pass_finished(), PipelineState::Live(LiveState::Idle));
    }

    #[test]
    fn test_gate_ignores_notifications_outside_live() {
        for state in [
            PipelineState::Initializing,
            PipelineState::Discovering,
            PipelineState::CatchingUp { target: 5 },
            PipelineState::Stopped,
        ] {
            assert_eq!(state.on_new_block(1), (state, Gate::Drop));
            assert_eq!(state.on_pass_finished(), state);
        }
    }

    #[test]
    fn test_resolve_start_precedence() {
        assert_eq!(resolve_start(Some(50), Some(900), 10), 50);
        assert_eq!(resolve_start(None, Some(900), 10), 901);
        assert_eq!(resolve_start(None, None, 10), 10);
    }
}
