// Swap Event Extractor
//
// Fetches Swap logs for one block range, normalizes each into a TradeRecord
// (pair metadata, decimals, unit price, oracle prices, volume) and stores it
// idempotently. Callers chunk the range; one call is one ledger query.

use crate::contracts;
use crate::events::{decode_swap, SWAP_TOPIC};
use crate::ledger::{Ledger, LogFilter};
use crate::pricing;
use crate::registry::PairRegistry;
use crate::store::{CursorStream, Store};
use crate::tokens::TokenCatalog;
use crate::types::{AllowList, BlockRange, LogRecord, PairRecord, TradeRecord};
use alloy_primitives::Address;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Which pairs a pass extracts for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractScope {
    /// Every pair in the registry (catch-up and live passes)
    Registered,
    /// One pair (backfill)
    Pair(Address),
}

impl fmt::Display for ExtractScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractScope::Registered => f.write_str("registered"),
            ExtractScope::Pair(pair) => write!(f, "pair {pair:#x}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// Swap logs in scope
    pub matched: usize,
    pub inserted: usize,
    /// Already stored (replayed range)
    pub duplicates: usize,
    /// Pair has no allow-listed token
    pub discarded: usize,
    /// Undecodable log or unresolvable pair
    pub failed: usize,
    /// Highest block holding a stored or duplicate trade
    pub max_block: Option<u64>,
}

impl ExtractReport {
    pub fn merge(&mut self, other: &ExtractReport) {
        self.matched += other.matched;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.discarded += other.discarded;
        self.failed += other.failed;
        self.max_block = self.max_block.max(other.max_block);
    }
}

/// Process-wide counters across all passes
#[derive(Debug, Default)]
pub struct ExtractTotals {
    pub inserted: AtomicU64,
    pub duplicates: AtomicU64,
    pub failed: AtomicU64,
}

pub struct EventExtractor {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    registry: Arc<RwLock<PairRegistry>>,
    tokens: Arc<TokenCatalog>,
    allow: AllowList,
    totals: ExtractTotals,
}

impl EventExtractor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn Store>,
        registry: Arc<RwLock<PairRegistry>>,
        tokens: Arc<TokenCatalog>,
        allow: AllowList,
    ) -> Self {
        Self {
            ledger,
            store,
            registry,
            tokens,
            allow,
            totals: ExtractTotals::default(),
        }
    }

    pub fn totals(&self) -> &ExtractTotals {
        &self.totals
    }

    /// Extract swaps in `range` for `scope`.
    ///
    /// Ledger and store failures abort the call so the caller can retry the
    /// range; per-log problems are counted in the report. A Registered pass
    /// moves the `trades` cursor to the end of the range once it is stored.
    pub async fn extract(&self, range: BlockRange, scope: ExtractScope) -> eyre::Result<ExtractReport> {
        let logs = match scope {
            ExtractScope::Registered => {
                let registered = self.registry.read().await.snapshot();
                if registered.is_empty() {
                    Vec::new()
                } else {
                    // Topic-only query, the address list can outgrow provider limits
                    let filter = LogFilter::new(SWAP_TOPIC, range);
                    self.ledger
                        .logs(&filter)
                        .await?
                        .into_iter()
                        .filter(|record| registered.contains(&record.address()))
                        .collect()
                }
            }
            ExtractScope::Pair(pair) => {
                let filter = LogFilter::new(SWAP_TOPIC, range).with_address(pair);
                self.ledger.logs(&filter).await?
            }
        };

        let mut report = ExtractReport {
            matched: logs.len(),
            ..Default::default()
        };
        let mut timestamps: HashMap<u64, u64> = HashMap::new();

        for record in &logs {
            self.process(record, &mut timestamps, &mut report).await?;
        }

        self.totals
            .inserted
            .fetch_add(report.inserted as u64, Ordering::Relaxed);
        self.totals
            .duplicates
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.totals
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        if scope == ExtractScope::Registered {
            self.store
                .advance_cursor(CursorStream::Trades, range.to)
                .await?;
        }

        if report.matched > 0 {
            info!(
                "Swaps {} ({}): {} matched, {} inserted, {} duplicates, {} discarded, {} failed",
                range,
                scope,
                report.matched,
                report.inserted,
                report.duplicates,
                report.discarded,
                report.failed
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        record: &LogRecord,
        timestamps: &mut HashMap<u64, u64>,
        report: &mut ExtractReport,
    ) -> eyre::Result<()> {
        let Some(pair) = self.resolve_pair(record.address()).await? else {
            report.failed += 1;
            return Ok(());
        };

        if !pair.is_allowed(&self.allow) {
            debug!("Discarding swap on {:#x}: no allowed token", pair.address);
            report.discarded += 1;
            return Ok(());
        }

        let Some(swap) = decode_swap(&record.log) else {
            warn!(
                "Undecodable Swap log at block {} tx {} index {}",
                record.block_number, record.tx_hash, record.log_index
            );
            report.failed += 1;
            return Ok(());
        };

        let block_timestamp = match timestamps.get(&record.block_number) {
            Some(ts) => *ts,
            None => {
                let ts = self.ledger.block(record.block_number).await?.timestamp;
                timestamps.insert(record.block_number, ts);
                ts
            }
        };

        let decimals0 = self.tokens.decimals(pair.token0).await;
        let decimals1 = self.tokens.decimals(pair.token1).await;
        let token0_price = self.tokens.price(pair.token0, record.block_number).await;
        let token1_price = self.tokens.price(pair.token1, record.block_number).await;

        let trade = TradeRecord {
            tx_hash: record.tx_hash,
            log_index: record.log_index,
            block_number: record.block_number,
            block_timestamp,
            pair: pair.address,
            token0: pair.token0,
            token1: pair.token1,
            amount0_in: swap.amount0_in,
            amount1_in: swap.amount1_in,
            amount0_out: swap.amount0_out,
            amount1_out: swap.amount1_out,
            decimals0,
            decimals1,
            recipient: swap.recipient,
            price: pricing::unit_price(
                swap.amount0_in,
                swap.amount1_in,
                swap.amount0_out,
                swap.amount1_out,
            ),
            token0_price,
            token1_price,
            volume: pricing::volume(swap.amount0_in, swap.amount0_out, token0_price, decimals0),
        };

        if self.store.insert_trade(&trade).await? {
            report.inserted += 1;
        } else {
            debug!(
                "Trade {}:{} already stored",
                trade.tx_hash, trade.log_index
            );
            report.duplicates += 1;
        }
        report.max_block = report.max_block.max(Some(record.block_number));
        Ok(())
    }

    /// Registry, then store, then the pair contract itself
    async fn resolve_pair(&self, address: Address) -> eyre::Result<Option<PairRecord>> {
        if let Some(pair) = self.registry.read().await.get(&address) {
            return Ok(Some(pair.clone()));
        }
        if let Some(pair) = self.store.pair(address).await? {
            return Ok(Some(pair));
        }

        match contracts::pair_tokens(self.ledger.as_ref(), address).await {
            Ok((token0, token1)) => {
                let pair = PairRecord::new(address, token0, token1, 0);
                self.store.upsert_pair(&pair).await?;
                info!(
                    "Initialized unknown pair {:#x} ({:#x}/{:#x})",
                    address, token0, token1
                );
                Ok(Some(pair))
            }
            Err(e) => {
                warn!("Cannot resolve tokens of pair {:#x}: {:#}", address, e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{
        decimals_calldata, encode_return, token0_calldata, token1_calldata, token_price_calldata,
    };
    use crate::events::{encode_swap, DecodedSwap};
    use crate::ledger::MemoryLedger;
    use crate::pricing::ONE;
    use crate::store::MemoryStore;
    use alloy_primitives::{address, U256};

    const VIEW: Address = address!("00000000000000000000000000000000000000ee");
    const USDT: Address = address!("000000000000000000000000000000000000000a");
    const GOLD: Address = address!("000000000000000000000000000000000000000b");
    const JUNK: Address = address!("000000000000000000000000000000000000000c");
    const PAIR: Address = address!("00000000000000000000000000000000000000f1");

    struct Harness {
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryStore>,
        registry: Arc<RwLock<PairRegistry>>,
        extractor: EventExtractor,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MemoryLedger::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(RwLock::new(PairRegistry::new()));
        let tokens = Arc::new(TokenCatalog::new(ledger.clone(), VIEW, [USDT]));
        ledger.respond(USDT, decimals_calldata(), encode_return(6u16));
        ledger.respond(GOLD, decimals_calldata(), encode_return(18u16));

        let extractor = EventExtractor::new(
            ledger.clone(),
            store.clone(),
            registry.clone(),
            tokens,
            AllowList::new([USDT]),
        );
        Harness {
            ledger,
            store,
            registry,
            extractor,
        }
    }

    fn swap_log(pair: Address, a0_in: u64, a1_out: u64) -> alloy_primitives::Log {
        encode_swap(
            pair,
            &DecodedSwap {
                pair,
                sender: Address::ZERO,
                recipient: address!("00000000000000000000000000000000000000cc"),
                amount0_in: U256::from(a0_in),
                amount1_in: U256::ZERO,
                amount0_out: U256::ZERO,
                amount1_out: U256::from(a1_out),
            },
        )
    }

    #[tokio::test]
    async fn test_prices_and_volume() {
        let h = harness();
        h.registry
            .write()
            .await
            .register(PairRecord::new(PAIR, USDT, GOLD, 10));
        h.ledger.emit(500, swap_log(PAIR, 100, 50));

        let report = h
            .extractor
            .extract(BlockRange::new(400, 600), ExtractScope::Registered)
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.max_block, Some(500));

        let trade = &h.store.trades().await[0];
        assert_eq!(trade.decimals0, 6);
        assert_eq!(trade.price, Some(ONE / U256::from(2u64)));
        assert_eq!(trade.token0_price, Some(ONE));
        assert_eq!(trade.token1_price, None);
        assert_eq!(trade.volume, Some(U256::from(100_000_000_000_000u64)));
        assert_eq!(trade.block_timestamp, 500 * MemoryLedger::BLOCK_TIME);
        assert_eq!(
            h.store.cursor(CursorStream::Trades).await.unwrap(),
            Some(600)
        );
    }

    #[tokio::test]
    async fn test_oracle_queried_at_trade_block() {
        let h = harness();
        h.registry
            .write()
            .await
            .register(PairRecord::new(PAIR, USDT, GOLD, 10));
        h.ledger.respond_at(
            VIEW,
            token_price_calldata(GOLD),
            777,
            encode_return(ONE * U256::from(3u64)),
        );
        h.ledger.emit(777, swap_log(PAIR, 10, 30));

        h.extractor
            .extract(BlockRange::new(700, 800), ExtractScope::Registered)
            .await
            .unwrap();

        assert_eq!(
            h.store.trades().await[0].token1_price,
            Some(ONE * U256::from(3u64))
        );
    }

    #[tokio::test]
    async fn test_replay_reports_duplicates() {
        let h = harness();
        h.registry
            .write()
            .await
            .register(PairRecord::new(PAIR, USDT, GOLD, 10));
        let record = h.ledger.emit(500, swap_log(PAIR, 100, 50));

        let range = BlockRange::new(500, 500);
        h.extractor.extract(range, ExtractScope::Pair(PAIR)).await.unwrap();
        let replay = h.extractor.extract(range, ExtractScope::Pair(PAIR)).await.unwrap();

        assert_eq!((replay.inserted, replay.duplicates), (0, 1));
        assert_eq!(h.store.trades().await.len(), 1);
        assert_eq!(h.store.trades().await[0].log_index, record.log_index);
        // Pair scope leaves the registered-stream cursor alone
        assert_eq!(h.store.cursor(CursorStream::Trades).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unregistered_pairs_ignored_in_registered_scope() {
        let h = harness();
        h.registry
            .write()
            .await
            .register(PairRecord::new(PAIR, USDT, GOLD, 10));
        let other = address!("00000000000000000000000000000000000000f2");
        h.ledger.emit(500, swap_log(other, 1, 1));

        let report = h
            .extractor
            .extract(BlockRange::new(500, 500), ExtractScope::Registered)
            .await
            .unwrap();
        assert_eq!(report.matched, 0);
    }

    #[tokio::test]
    async fn test_empty_registry_skips_the_query() {
        let h = harness();
        let report = h
            .extractor
            .extract(BlockRange::new(0, 99), ExtractScope::Registered)
            .await
            .unwrap();

        assert_eq!(report, ExtractReport::default());
        assert!(h.ledger.log_requests().is_empty());
        assert_eq!(h.store.cursor(CursorStream::Trades).await.unwrap(), Some(99));
    }

    #[tokio::test]
    async fn test_unknown_pair_initialized_lazily() {
        let h = harness();
        h.ledger.respond(PAIR, token0_calldata(), encode_return(GOLD));
        h.ledger.respond(PAIR, token1_calldata(), encode_return(USDT));
        h.ledger.emit(500, swap_log(PAIR, 100, 50));

        let report = h
            .extractor
            .extract(BlockRange::new(500, 500), ExtractScope::Pair(PAIR))
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        let stored = h.store.pair(PAIR).await.unwrap().unwrap();
        assert_eq!((stored.token0, stored.token1, stored.created_block), (GOLD, USDT, 0));
    }

    #[tokio::test]
    async fn test_disallowed_pair_discarded() {
        let h = harness();
        h.store
            .upsert_pair(&PairRecord::new(PAIR, GOLD, JUNK, 10))
            .await
            .unwrap();
        h.ledger.emit(500, swap_log(PAIR, 100, 50));

        let report = h
            .extractor
            .extract(BlockRange::new(500, 500), ExtractScope::Pair(PAIR))
            .await
            .unwrap();

        assert_eq!((report.discarded, report.inserted), (1, 0));
        assert!(h.store.trades().await.is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_fetched_once_per_block() {
        let h = harness();
        h.registry
            .write()
            .await
            .register(PairRecord::new(PAIR, USDT, GOLD, 10));
        h.ledger.emit(500, swap_log(PAIR, 1, 1));
        h.ledger.emit(500, swap_log(PAIR, 2, 2));
        h.ledger.emit(501, swap_log(PAIR, 3, 3));

        h.extractor
            .extract(BlockRange::new(500, 501), ExtractScope::Registered)
            .await
            .unwrap();

        assert_eq!(h.ledger.block_requests(), vec![500, 501]);
    }

    #[tokio::test]
    async fn test_ledger_failure_aborts_the_range() {
        let h = harness();
        h.ledger.fail_logs_when(|_| true);

        let result = h
            .extractor
            .extract(BlockRange::new(0, 10), ExtractScope::Pair(PAIR))
            .await;
        assert!(result.is_err());
    }
}
