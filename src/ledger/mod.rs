// Ledger Access
//
// The pipeline reads the chain through this trait only: tip height, block
// timestamps, filtered logs and read-only contract calls.

mod memory;
mod rpc;

pub use memory::MemoryLedger;
pub use rpc::RpcLedger;

use crate::types::{BlockInfo, BlockRange, LogRecord};
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;

/// eth_getLogs filter: one event signature, optional emitter set, block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// Empty means "any emitter"
    pub addresses: Vec<Address>,
    pub topic0: B256,
    pub range: BlockRange,
}

impl LogFilter {
    pub fn new(topic0: B256, range: BlockRange) -> Self {
        Self {
            addresses: Vec::new(),
            topic0,
            range,
        }
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    /// Same filter over a different sub-range
    pub fn over(&self, range: BlockRange) -> Self {
        Self {
            range,
            ..self.clone()
        }
    }

    /// Whether a log matches the emitter set and topic (range is not checked)
    pub fn matches(&self, log: &LogRecord) -> bool {
        let topic_matches = log.log.topics().first() == Some(&self.topic0);
        let address_matches =
            self.addresses.is_empty() || self.addresses.contains(&log.address());
        topic_matches && address_matches
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Height of the current tip
    async fn latest_block_number(&self) -> eyre::Result<u64>;

    async fn block(&self, number: u64) -> eyre::Result<BlockInfo>;

    /// Logs matching `filter`, in ledger order
    async fn logs(&self, filter: &LogFilter) -> eyre::Result<Vec<LogRecord>>;

    /// Read-only call; `block = None` executes against the tip
    async fn call(&self, to: Address, calldata: Bytes, block: Option<u64>)
        -> eyre::Result<Bytes>;
}
