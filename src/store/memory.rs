// In-memory Store
//
// Same conflict semantics as the Postgres tables, held behind one async mutex.

use super::{CursorStream, Store};
use crate::types::{AllowList, Job, PairRecord, TradeRecord};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use eyre::eyre;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    pairs: BTreeMap<Address, PairRecord>,
    trades: Vec<TradeRecord>,
    trade_keys: HashSet<(B256, u64)>,
    cursors: HashMap<String, u64>,
    /// id -> (insertion sequence, job)
    jobs: HashMap<String, (u64, Job)>,
    job_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored trades in insertion order
    pub async fn trades(&self) -> Vec<TradeRecord> {
        self.tables.lock().await.trades.clone()
    }

    pub async fn pairs(&self) -> Vec<PairRecord> {
        self.tables.lock().await.pairs.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_pair(&self, pair: &PairRecord) -> eyre::Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.pairs.get_mut(&pair.address) {
            Some(existing) => {
                if existing.created_block == 0 {
                    existing.created_block = pair.created_block;
                }
                Ok(false)
            }
            None => {
                let mut row = pair.clone();
                row.subscribed = false;
                tables.pairs.insert(pair.address, row);
                Ok(true)
            }
        }
    }

    async fn pair(&self, address: Address) -> eyre::Result<Option<PairRecord>> {
        Ok(self.tables.lock().await.pairs.get(&address).cloned())
    }

    async fn allowed_pairs(&self, allow: &AllowList) -> eyre::Result<Vec<PairRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .pairs
            .values()
            .filter(|pair| pair.is_allowed(allow))
            .cloned()
            .collect())
    }

    async fn mark_subscribed(&self, address: Address) -> eyre::Result<()> {
        let mut tables = self.tables.lock().await;
        let pair = tables
            .pairs
            .get_mut(&address)
            .ok_or_else(|| eyre!("pair {address:#x} not found"))?;
        pair.subscribed = true;
        Ok(())
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> eyre::Result<bool> {
        let mut tables = self.tables.lock().await;
        let key = (trade.tx_hash, trade.log_index);
        if !tables.trade_keys.insert(key) {
            return Ok(false);
        }

        tables.trades.push(trade.clone());
        Ok(true)
    }

    async fn trade_count(&self) -> eyre::Result<u64> {
        Ok(self.tables.lock().await.trades.len() as u64)
    }

    async fn cursor(&self, stream: CursorStream) -> eyre::Result<Option<u64>> {
        Ok(self.tables.lock().await.cursors.get(&stream.name()).copied())
    }

    async fn advance_cursor(&self, stream: CursorStream, block: u64) -> eyre::Result<u64> {
        let mut tables = self.tables.lock().await;
        let stored = tables.cursors.entry(stream.name()).or_insert(block);
        *stored = (*stored).max(block);
        Ok(*stored)
    }

    async fn save_job(&self, job: &Job) -> eyre::Result<()> {
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        match tables.jobs.get_mut(&job.id) {
            Some((_, stored)) => *stored = job.clone(),
            None => {
                tables.job_seq += 1;
                let seq = tables.job_seq;
                tables.jobs.insert(job.id.clone(), (seq, job.clone()));
            }
        }
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> eyre::Result<()> {
        self.tables.lock().await.jobs.remove(id);
        Ok(())
    }

    async fn pending_jobs(&self) -> eyre::Result<Vec<Job>> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<&(u64, Job)> = tables.jobs.values().collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        Ok(jobs.into_iter().map(|(_, job)| job.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, U256};
    use std::sync::Arc;

    const PAIR: Address = address!("00000000000000000000000000000000000000f1");
    const TOKEN_A: Address = address!("000000000000000000000000000000000000000a");
    const TOKEN_C: Address = address!("000000000000000000000000000000000000000c");

    fn trade(log_index: u64) -> TradeRecord {
        TradeRecord {
            tx_hash: B256::from([7u8; 32]),
            log_index,
            block_number: 10,
            block_timestamp: 120,
            pair: PAIR,
            token0: TOKEN_A,
            token1: TOKEN_C,
            amount0_in: U256::from(100u64),
            amount1_in: U256::ZERO,
            amount0_out: U256::ZERO,
            amount1_out: U256::from(50u64),
            decimals0: 6,
            decimals1: 18,
            recipient: Address::ZERO,
            price: None,
            token0_price: None,
            token1_price: None,
            volume: None,
        }
    }

    #[tokio::test]
    async fn test_trade_insert_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.insert_trade(&trade(0)).await.unwrap());
        assert!(!store.insert_trade(&trade(0)).await.unwrap());
        assert!(store.insert_trade(&trade(1)).await.unwrap());
        assert_eq!(store.trade_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pair_upsert_preserves_tokens_and_fills_created_block() {
        let store = MemoryStore::new();
        assert!(store
            .upsert_pair(&PairRecord::new(PAIR, TOKEN_A, TOKEN_C, 0))
            .await
            .unwrap());

        // A later discovery carries the real creation block
        let rediscovered = PairRecord::new(PAIR, TOKEN_C, TOKEN_A, 500);
        assert!(!store.upsert_pair(&rediscovered).await.unwrap());
        assert!(!store
            .upsert_pair(&PairRecord::new(PAIR, TOKEN_A, TOKEN_C, 900))
            .await
            .unwrap());

        let stored = store.pair(PAIR).await.unwrap().unwrap();
        assert_eq!(stored.token0, TOKEN_A);
        assert_eq!(stored.token1, TOKEN_C);
        assert_eq!(stored.created_block, 500);
    }

    #[tokio::test]
    async fn test_cursor_never_regresses_under_concurrent_writers() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for block in [50u64, 10, 90, 30, 70] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.advance_cursor(CursorStream::Trades, block).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.cursor(CursorStream::Trades).await.unwrap(), Some(90));
        assert_eq!(store.advance_cursor(CursorStream::Trades, 40).await.unwrap(), 90);
        assert_eq!(store.cursor(CursorStream::Pairs).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_jobs_listed_in_save_order() {
        let store = MemoryStore::new();
        let backfill = Job::backfill(PAIR, 100, Some(200));
        let subscribe = Job::subscribe(PAIR, 201);
        store.save_job(&backfill).await.unwrap();
        store.save_job(&subscribe).await.unwrap();

        let mut retried = backfill.clone();
        retried.retries = 1;
        store.save_job(&retried).await.unwrap();

        let jobs = store.pending_jobs().await.unwrap();
        assert_eq!(jobs, vec![retried, subscribe.clone()]);

        store.delete_job(&backfill.id).await.unwrap();
        assert_eq!(store.pending_jobs().await.unwrap(), vec![subscribe]);
    }
}
