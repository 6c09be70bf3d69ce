// Pipeline Record Types
//
// Rows materialized into the store, jobs exchanged between pair discovery and
// the worker pool, and the ledger-facing block/log shapes.

use alloy_primitives::{Address, Log, B256, U256};
use eyre::eyre;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// LEDGER SHAPES
// ============================================================================

/// Inclusive block range `[from, to]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "inverted block range {from}-{to}");
        Self { from, to }
    }

    /// Number of blocks covered
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        self.from <= block && block <= self.to
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// Header fields the pipeline reads from a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

/// A log emitted at a known position in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub log: Log,
}

impl LogRecord {
    /// Emitting contract
    pub fn address(&self) -> Address {
        self.log.address
    }
}

// ============================================================================
// STORE ROWS
// ============================================================================

/// Tokens a pair must reference (at least one of) to be collected
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    tokens: HashSet<Address>,
}

impl AllowList {
    pub fn new(tokens: impl IntoIterator<Item = Address>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn is_allowed_token(&self, token: &Address) -> bool {
        self.tokens.contains(token)
    }

    /// True when either side of the pair is allow-listed
    pub fn is_allowed_pair(&self, token0: &Address, token1: &Address) -> bool {
        self.is_allowed_token(token0) || self.is_allowed_token(token1)
    }

    pub fn tokens(&self) -> Vec<Address> {
        let mut tokens: Vec<Address> = self.tokens.iter().copied().collect();
        tokens.sort();
        tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Pair metadata row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRecord {
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    /// 0 when the pair was initialized lazily from a swap rather than discovered
    pub created_block: u64,
    /// Set once a Subscribe job has registered the pair for live extraction
    pub subscribed: bool,
}

impl PairRecord {
    pub fn new(address: Address, token0: Address, token1: Address, created_block: u64) -> Self {
        Self {
            address,
            token0,
            token1,
            created_block,
            subscribed: false,
        }
    }

    pub fn is_allowed(&self, allow: &AllowList) -> bool {
        allow.is_allowed_pair(&self.token0, &self.token1)
    }
}

/// One decoded and priced swap, unique by `(tx_hash, log_index)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub pair: Address,
    pub token0: Address,
    pub token1: Address,

    /// Raw directional amounts (token base units)
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
    pub decimals0: u8,
    pub decimals1: u8,

    /// Swap recipient (`to` in the event)
    pub recipient: Address,

    /// All prices and the volume are fixed point with 18 decimals
    pub price: Option<U256>,
    pub token0_price: Option<U256>,
    pub token1_price: Option<U256>,
    pub volume: Option<U256>,
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Historical re-scan of one pair's swaps
    Backfill,
    /// Registration of a pair for live extraction
    Subscribe,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backfill => "backfill",
            JobKind::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backfill" => Ok(JobKind::Backfill),
            "subscribe" => Ok(JobKind::Subscribe),
            other => Err(eyre!("unknown job kind '{other}'")),
        }
    }
}

/// Unit of work owned by the job queue until a worker takes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Deterministic key: `<kind>:<pair>:<from_block>`
    pub id: String,
    pub kind: JobKind,
    pub pair: Address,
    pub from_block: u64,
    /// Backfill upper bound; `None` means "tip at dispatch time"
    pub to_block: Option<u64>,
    pub retries: u32,
}

impl Job {
    pub fn backfill(pair: Address, from_block: u64, to_block: Option<u64>) -> Self {
        Self::new(JobKind::Backfill, pair, from_block, to_block)
    }

    pub fn subscribe(pair: Address, from_block: u64) -> Self {
        Self::new(JobKind::Subscribe, pair, from_block, None)
    }

    fn new(kind: JobKind, pair: Address, from_block: u64, to_block: Option<u64>) -> Self {
        Self {
            id: Self::key(kind, &pair, from_block),
            kind,
            pair,
            from_block,
            to_block,
            retries: 0,
        }
    }

    pub fn key(kind: JobKind, pair: &Address, from_block: u64) -> String {
        format!("{}:{:#x}:{}", kind.as_str(), pair, from_block)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_block {
            Some(to) => write!(f, "{} {:#x} [{}-{}]", self.kind, self.pair, self.from_block, to),
            None => write!(f, "{} {:#x} [{}-]", self.kind, self.pair, self.from_block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_job_keys_are_deterministic() {
        let pair = address!("00000000000000000000000000000000000000aa");
        let a = Job::backfill(pair, 100, Some(200));
        let b = Job::backfill(pair, 100, Some(300));
        assert_eq!(a.id, b.id);
        assert_eq!(
            a.id,
            "backfill:0x00000000000000000000000000000000000000aa:100"
        );
        assert_ne!(a.id, Job::subscribe(pair, 100).id);
    }

    #[test]
    fn test_job_kind_roundtrip_through_str() {
        for kind in [JobKind::Backfill, JobKind::Subscribe] {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!("reorg".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_allow_list_matches_either_side() {
        let a = address!("000000000000000000000000000000000000000a");
        let b = address!("000000000000000000000000000000000000000b");
        let c = address!("000000000000000000000000000000000000000c");
        let allow = AllowList::new([a]);

        assert!(allow.is_allowed_pair(&a, &c));
        assert!(allow.is_allowed_pair(&c, &a));
        assert!(!allow.is_allowed_pair(&b, &c));
    }

    #[test]
    fn test_block_range_len() {
        let range = BlockRange::new(10, 19);
        assert_eq!(range.len(), 10);
        assert!(range.contains(10) && range.contains(19));
        assert!(!range.contains(20));
        assert_eq!(range.to_string(), "10-19");
    }
}
