// Pair Discovery
//
// Scans the factory for PairCreated events, keeps pairs that touch an
// allow-listed token and hands every newly stored pair to the worker pool as a
// Backfill (creation block -> tip) and a Subscribe (tip + 1 onward).

use crate::events::{decode_pair_created, PAIR_CREATED_TOPIC};
use crate::ledger::{Ledger, LogFilter};
use crate::queue::JobQueue;
use crate::scanner::RangeWalker;
use crate::store::{CursorStream, Store};
use crate::types::{AllowList, BlockRange, Job, PairRecord};
use alloy_primitives::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Pairs stored for the first time, in log order
    pub created: Vec<PairRecord>,
    /// Creation events touching no allow-listed token
    pub rejected: usize,
    /// Already known pairs seen again
    pub known: usize,
    /// Known pairs left without jobs by an earlier failure, scheduled again
    pub rescheduled: usize,
    pub undecodable: usize,
    pub skipped: Vec<BlockRange>,
}

#[derive(Debug, Default)]
struct ChunkReport {
    created: Vec<PairRecord>,
    rejected: usize,
    known: usize,
    rescheduled: usize,
    undecodable: usize,
}

pub struct PairDiscovery {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    walker: RangeWalker,
    factory: Address,
    allow: AllowList,
    discovered: AtomicU64,
}

impl PairDiscovery {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn Store>,
        queue: Arc<JobQueue>,
        walker: RangeWalker,
        factory: Address,
        allow: AllowList,
    ) -> Self {
        Self {
            ledger,
            store,
            queue,
            walker,
            factory,
            allow,
            discovered: AtomicU64::new(0),
        }
    }

    /// Pairs created by this process so far
    pub fn discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }

    /// Discover pairs created in `[from, to]`, advancing the `pairs` cursor
    /// after every chunk.
    pub async fn discover(&self, from: u64, to: u64) -> DiscoveryReport {
        let outcome = self
            .walker
            .run(from, to, |range| self.discover_chunk(range))
            .await;

        let mut report = DiscoveryReport {
            skipped: outcome.skipped,
            ..Default::default()
        };
        for (_, chunk) in outcome.completed {
            report.created.extend(chunk.created);
            report.rejected += chunk.rejected;
            report.known += chunk.known;
            report.rescheduled += chunk.rescheduled;
            report.undecodable += chunk.undecodable;
        }

        if from <= to {
            info!(
                "Discovery {}-{}: {} new pairs, {} rejected, {} skipped chunks",
                from,
                to,
                report.created.len(),
                report.rejected,
                report.skipped.len()
            );
        }
        report
    }

    /// Resume from the `pairs` cursor (or `default_from`) up to `to`.
    pub async fn discover_to(&self, default_from: u64, to: u64) -> eyre::Result<DiscoveryReport> {
        let from = self
            .store
            .cursor(CursorStream::Pairs)
            .await?
            .map(|block| block + 1)
            .unwrap_or(default_from);

        Ok(self.discover(from, to).await)
    }

    async fn discover_chunk(&self, range: BlockRange) -> eyre::Result<ChunkReport> {
        let filter = LogFilter::new(PAIR_CREATED_TOPIC, range).with_address(self.factory);
        let logs = self.ledger.logs(&filter).await?;
        let mut report = ChunkReport::default();

        // Read before any upsert so a failing tip query cannot strand a stored pair without jobs
        let tip = if logs.is_empty() {
            0
        } else {
            self.ledger.latest_block_number().await?
        };

        for record in logs {
            let Some(created) = decode_pair_created(&record.log) else {
                warn!(
                    "Undecodable PairCreated log at block {} tx {} index {}",
                    record.block_number, record.tx_hash, record.log_index
                );
                report.undecodable += 1;
                continue;
            };

            if !self.allow.is_allowed_pair(&created.token0, &created.token1) {
                debug!(
                    "Pair {:#x} ({:#x}/{:#x}) has no allowed token",
                    created.pair, created.token0, created.token1
                );
                report.rejected += 1;
                continue;
            }

            let pair = PairRecord::new(
                created.pair,
                created.token0,
                created.token1,
                record.block_number,
            );
            if !self.store.upsert_pair(&pair).await? {
                // A retried chunk may find the pair stored but its jobs never saved
                if let Some(stored) = self.store.pair(pair.address).await? {
                    if !stored.subscribed && !self.queue.has_pair(&stored.address).await {
                        warn!(
                            "Known pair {:#x} has no jobs and is not subscribed, rescheduling",
                            stored.address
                        );
                        self.schedule(&stored, tip).await?;
                        report.rescheduled += 1;
                        continue;
                    }
                }
                report.known += 1;
                continue;
            }

            self.schedule(&pair, tip).await?;
            self.discovered.fetch_add(1, Ordering::Relaxed);
            report.created.push(pair);
        }

        self.store
            .advance_cursor(CursorStream::Pairs, range.to)
            .await?;
        Ok(report)
    }

    /// Persist and enqueue the Backfill and Subscribe jobs of a new pair
    async fn schedule(&self, pair: &PairRecord, tip: u64) -> eyre::Result<()> {
        let jobs = [
            Job::backfill(pair.address, pair.created_block, Some(tip.max(pair.created_block))),
            Job::subscribe(pair.address, tip + 1),
        ];

        // Persist both before either is queued, so a failed save leaves the
        // pair without queued jobs and the retry reschedules it
        for job in &jobs {
            self.store.save_job(job).await?;
        }
        for job in jobs {
            self.queue.enqueue(job).await;
        }

        info!(
            "New pair {:#x} ({:#x}/{:#x}) at block {}, backfill to {}",
            pair.address, pair.token0, pair.token1, pair.created_block, tip
        );
        Ok(())
    }
}
