// In-memory Ledger
//
// Scriptable chain used by the test-suite: a movable tip, canned logs and call
// responses, injected log-query failures, and a record of every request made.

use super::{Ledger, LogFilter};
use crate::types::{BlockInfo, BlockRange, LogRecord};
use alloy_primitives::{Address, Bytes, Log, B256, U256};
use async_trait::async_trait;
use eyre::eyre;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

type LogFailure = Box<dyn Fn(&BlockRange) -> bool + Send + Sync>;

/// A recorded `call`: target, calldata, block
pub type RecordedCall = (Address, Bytes, Option<u64>);

#[derive(Default)]
struct LedgerState {
    tip: u64,
    timestamps: HashMap<u64, u64>,
    logs: Vec<LogRecord>,
    next_tx: u64,

    responses: HashMap<(Address, Bytes), Bytes>,
    block_responses: HashMap<(Address, Bytes, u64), Bytes>,
    fail_logs: Option<LogFailure>,

    log_requests: Vec<LogFilter>,
    block_requests: Vec<u64>,
    calls: Vec<RecordedCall>,
}

pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Seconds between blocks for blocks without an explicit timestamp
    pub const BLOCK_TIME: u64 = 12;

    pub fn new(tip: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                tip,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        // A panicking test thread must not wedge the other tasks sharing the ledger
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tip(&self) -> u64 {
        self.state().tip
    }

    pub fn set_tip(&self, tip: u64) {
        self.state().tip = tip;
    }

    pub fn set_timestamp(&self, block: u64, timestamp: u64) {
        self.state().timestamps.insert(block, timestamp);
    }

    /// Append `log` as the next entry of `block` under a fresh transaction hash.
    pub fn emit(&self, block: u64, log: Log) -> LogRecord {
        let mut state = self.state();
        state.next_tx += 1;
        let log_index = state
            .logs
            .iter()
            .filter(|record| record.block_number == block)
            .count() as u64;

        let record = LogRecord {
            block_number: block,
            tx_hash: B256::from(U256::from(state.next_tx)),
            log_index,
            log,
        };
        state.logs.push(record.clone());
        record
    }

    /// Append an already positioned record (for replaying the same log twice).
    pub fn push_log(&self, record: LogRecord) {
        self.state().logs.push(record);
    }

    /// Answer `call(to, calldata, _)` with `response` at any block.
    pub fn respond(&self, to: Address, calldata: Bytes, response: Bytes) {
        self.state().responses.insert((to, calldata), response);
    }

    /// Answer `call(to, calldata, Some(block))` only; takes precedence over `respond`.
    pub fn respond_at(&self, to: Address, calldata: Bytes, block: u64, response: Bytes) {
        self.state()
            .block_responses
            .insert((to, calldata, block), response);
    }

    /// Fail every log query whose range satisfies `predicate`.
    pub fn fail_logs_when<F>(&self, predicate: F)
    where
        F: Fn(&BlockRange) -> bool + Send + Sync + 'static,
    {
        self.state().fail_logs = Some(Box::new(predicate));
    }

    pub fn clear_failures(&self) {
        self.state().fail_logs = None;
    }

    /// Every log query received, including failed ones
    pub fn log_requests(&self) -> Vec<LogFilter> {
        self.state().log_requests.clone()
    }

    pub fn block_requests(&self) -> Vec<u64> {
        self.state().block_requests.clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn latest_block_number(&self) -> eyre::Result<u64> {
        Ok(self.state().tip)
    }

    async fn block(&self, number: u64) -> eyre::Result<BlockInfo> {
        let mut state = self.state();
        state.block_requests.push(number);
        if number > state.tip {
            return Err(eyre!("block {number} not found"));
        }

        let timestamp = state
            .timestamps
            .get(&number)
            .copied()
            .unwrap_or(number * Self::BLOCK_TIME);
        Ok(BlockInfo { number, timestamp })
    }

    async fn logs(&self, filter: &LogFilter) -> eyre::Result<Vec<LogRecord>> {
        let mut state = self.state();
        state.log_requests.push(filter.clone());

        if let Some(fail) = &state.fail_logs {
            if fail(&filter.range) {
                return Err(eyre!(
                    "query returned more than 10000 results for range {}",
                    filter.range
                ));
            }
        }

        let mut matched: Vec<LogRecord> = state
            .logs
            .iter()
            .filter(|record| filter.range.contains(record.block_number) && filter.matches(record))
            .cloned()
            .collect();
        matched.sort_by_key(|record| (record.block_number, record.log_index));
        Ok(matched)
    }

    async fn call(
        &self,
        to: Address,
        calldata: Bytes,
        block: Option<u64>,
    ) -> eyre::Result<Bytes> {
        let mut state = self.state();
        state.calls.push((to, calldata.clone(), block));

        if let Some(number) = block {
            if let Some(response) = state.block_responses.get(&(to, calldata.clone(), number)) {
                return Ok(response.clone());
            }
            // Block-scoped responses exist for this call: other blocks revert
            let scoped = state
                .block_responses
                .keys()
                .any(|(addr, data, _)| *addr == to && *data == calldata);
            if scoped {
                return Err(eyre!("execution reverted"));
            }
        }

        state
            .responses
            .get(&(to, calldata))
            .cloned()
            .ok_or_else(|| eyre!("execution reverted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{encode_pair_created, PAIR_CREATED_TOPIC, SWAP_TOPIC};
    use alloy_primitives::address;

    fn pair_created(n: u8) -> Log {
        let mut raw = [0u8; 20];
        raw[19] = n;
        encode_pair_created(
            address!("00000000000000000000000000000000000000fa"),
            Address::ZERO,
            Address::ZERO,
            Address::from(raw),
            n as u64,
        )
    }

    #[tokio::test]
    async fn test_logs_filtered_by_range_and_topic() {
        let ledger = MemoryLedger::new(100);
        ledger.emit(10, pair_created(1));
        ledger.emit(20, pair_created(2));
        let second = ledger.emit(20, pair_created(3));
        assert_eq!(second.log_index, 1);

        let filter = LogFilter::new(PAIR_CREATED_TOPIC, BlockRange::new(15, 30));
        let logs = ledger.logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 2);

        let swaps = LogFilter::new(SWAP_TOPIC, BlockRange::new(0, 100));
        assert!(ledger.logs(&swaps).await.unwrap().is_empty());
        assert_eq!(ledger.log_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_by_width() {
        let ledger = MemoryLedger::new(100);
        ledger.fail_logs_when(|range| range.len() > 10);

        let wide = LogFilter::new(SWAP_TOPIC, BlockRange::new(0, 50));
        assert!(ledger.logs(&wide).await.is_err());
        assert!(ledger.logs(&wide.over(BlockRange::new(0, 9))).await.is_ok());

        ledger.clear_failures();
        assert!(ledger.logs(&wide).await.is_ok());
    }

    #[tokio::test]
    async fn test_default_timestamps_and_unknown_blocks() {
        let ledger = MemoryLedger::new(5);
        ledger.set_timestamp(3, 1_000);

        assert_eq!(ledger.block(3).await.unwrap().timestamp, 1_000);
        assert_eq!(ledger.block(4).await.unwrap().timestamp, 4 * MemoryLedger::BLOCK_TIME);
        assert!(ledger.block(6).await.is_err());
        assert_eq!(ledger.block_requests(), vec![3, 4, 6]);
    }
}
