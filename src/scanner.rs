// Chunked Range Scanner
//
// Walks an inclusive block range in bounded chunks. A failed chunk is retried
// from the same start block at half the width (floor 1 block) after a backoff;
// a chunk still failing after `max_retries` retries is skipped and reported.
// Successful chunks let the width grow back toward `max_chunk`.
//
// The walker knows nothing about cursors: callers persist progress from inside
// the per-chunk operation.

use crate::ledger::{Ledger, LogFilter};
use crate::types::{BlockRange, LogRecord};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    /// Widest chunk requested, in blocks
    pub max_chunk: u64,
    /// Retries of one chunk before it is skipped
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further retry
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Pause between successful chunks
    pub throttle: Duration,
}

impl ChunkPolicy {
    pub fn new(max_chunk: u64) -> Self {
        Self {
            max_chunk: max_chunk.max(1),
            max_retries: 8,
            backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            throttle: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self.max_backoff = self.max_backoff.max(backoff);
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Result of walking a range
#[derive(Debug)]
pub struct RangeOutcome<T> {
    /// Chunks that succeeded, in block order, with the operation's output
    pub completed: Vec<(BlockRange, T)>,
    /// Chunks abandoned after exhausting their retries
    pub skipped: Vec<BlockRange>,
    /// Walk stopped early by cancellation
    pub cancelled: bool,
}

impl<T> Default for RangeOutcome<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
        }
    }
}

impl<T> RangeOutcome<T> {
    /// Highest block handled (completed or skipped)
    pub fn last_block(&self) -> Option<u64> {
        let completed = self.completed.last().map(|(range, _)| range.to);
        let skipped = self.skipped.last().map(|range| range.to);
        completed.max(skipped)
    }
}

#[derive(Clone)]
pub struct RangeWalker {
    policy: ChunkPolicy,
    cancel: CancellationToken,
}

impl RangeWalker {
    pub fn new(policy: ChunkPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    /// Run `op` over consecutive chunks covering `[from, to]`.
    pub async fn run<T, F, Fut>(&self, from: u64, to: u64, mut op: F) -> RangeOutcome<T>
    where
        F: FnMut(BlockRange) -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let mut outcome = RangeOutcome::default();
        if from > to {
            return outcome;
        }

        let max_chunk = self.policy.max_chunk.max(1);
        let mut start = from;
        let mut width = max_chunk;
        let mut retries = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let end = start.saturating_add(width - 1).min(to);
            let range = BlockRange::new(start, end);

            match op(range).await {
                Ok(value) => {
                    debug!("Chunk {} done ({} blocks)", range, range.len());
                    outcome.completed.push((range, value));
                    retries = 0;
                    width = width.saturating_mul(2).min(max_chunk);

                    if end >= to {
                        break;
                    }
                    start = end + 1;

                    if !self.pause(self.policy.throttle).await {
                        outcome.cancelled = true;
                        break;
                    }
                }
                Err(e) if retries >= self.policy.max_retries => {
                    warn!(
                        "Skipping blocks {} after {} retries: {:#}",
                        range, retries, e
                    );
                    outcome.skipped.push(range);
                    retries = 0;

                    if end >= to {
                        break;
                    }
                    start = end + 1;
                }
                Err(e) => {
                    retries += 1;
                    let narrowed = (width / 2).max(1);
                    let delay = self.policy.backoff_for(retries);
                    warn!(
                        "Chunk {} failed (retry {}/{}), narrowing {} -> {} blocks in {:?}: {:#}",
                        range, retries, self.policy.max_retries, width, narrowed, delay, e
                    );
                    width = narrowed;

                    if !self.pause(delay).await {
                        outcome.cancelled = true;
                        break;
                    }
                }
            }
        }

        outcome
    }

    /// Fetch every log matching `filter` over `[from, to]`.
    pub async fn scan_logs(
        &self,
        ledger: &dyn Ledger,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> RangeOutcome<Vec<LogRecord>> {
        self.run(from, to, |range| async move { ledger.logs(&filter.over(range)).await })
            .await
    }

    /// Retry `op` with the chunk backoff until it succeeds. `None` once
    /// cancelled.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.policy.backoff_for(attempt);
                    warn!(
                        "{} failed (attempt {}), retrying in {:?}: {:#}",
                        what, attempt, delay, e
                    );
                    if !self.pause(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep unless cancelled first; false on cancellation
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
