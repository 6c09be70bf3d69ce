// Relational Store
//
// Pairs, trades, progress cursors and persisted jobs. Every write is an
// idempotent upsert so replays after a crash or a retried chunk are harmless.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::types::{AllowList, Job, PairRecord, TradeRecord};
use alloy_primitives::Address;
use async_trait::async_trait;
use std::fmt;

/// Named progress stream with its own cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorStream {
    /// Pair discovery over factory logs
    Pairs,
    /// Swap extraction over all registered pairs
    Trades,
    /// One Backfill job of a pair, keyed by the job's start block so the
    /// discovery backfill and a later gap backfill never share progress
    Backfill { pair: Address, from_block: u64 },
}

impl CursorStream {
    pub fn name(&self) -> String {
        match self {
            CursorStream::Pairs => "pairs".to_string(),
            CursorStream::Trades => "trades".to_string(),
            CursorStream::Backfill { pair, from_block } => {
                format!("backfill:{pair:#x}:{from_block}")
            }
        }
    }
}

impl fmt::Display for CursorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a pair or fill in its creation block if still unknown (0).
    /// Tokens are never rewritten. Returns true when the row was created.
    async fn upsert_pair(&self, pair: &PairRecord) -> eyre::Result<bool>;

    async fn pair(&self, address: Address) -> eyre::Result<Option<PairRecord>>;

    /// Pairs with at least one allow-listed token
    async fn allowed_pairs(&self, allow: &AllowList) -> eyre::Result<Vec<PairRecord>>;

    async fn mark_subscribed(&self, address: Address) -> eyre::Result<()>;

    /// Returns false when `(tx_hash, log_index)` is already stored.
    async fn insert_trade(&self, trade: &TradeRecord) -> eyre::Result<bool>;

    async fn trade_count(&self) -> eyre::Result<u64>;

    /// Last processed block of `stream`, if any
    async fn cursor(&self, stream: CursorStream) -> eyre::Result<Option<u64>>;

    /// Move the cursor forward to `block`; lower values leave it unchanged.
    /// Returns the stored value afterwards.
    async fn advance_cursor(&self, stream: CursorStream, block: u64) -> eyre::Result<u64>;

    /// Insert or update (retry count, bounds) a job by id
    async fn save_job(&self, job: &Job) -> eyre::Result<()>;

    async fn delete_job(&self, id: &str) -> eyre::Result<()>;

    /// Persisted jobs in the order they were first saved
    async fn pending_jobs(&self) -> eyre::Result<Vec<Job>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_cursor_stream_names() {
        let pair = address!("00000000000000000000000000000000000000ab");
        assert_eq!(CursorStream::Pairs.name(), "pairs");
        assert_eq!(CursorStream::Trades.name(), "trades");
        assert_eq!(
            CursorStream::Backfill {
                pair,
                from_block: 100
            }
            .to_string(),
            "backfill:0x00000000000000000000000000000000000000ab:100"
        );
    }
}
