// Swap Collector Library
//
// Exposes the pipeline modules for the binary and the integration tests

pub mod config;
pub mod contracts;
pub mod discovery;
pub mod events;
pub mod extractor;
pub mod ledger;
pub mod listener;
pub mod orchestrator;
pub mod pricing;
pub mod queue;
pub mod registry;
pub mod scanner;
pub mod store;
pub mod tokens;
pub mod types;
pub mod worker;

// Re-export commonly used items for testing
pub use config::{Config, Contracts};
pub use ledger::{Ledger, LogFilter, MemoryLedger, RpcLedger};
pub use orchestrator::{Pipeline, PipelineState};
pub use store::{CursorStream, MemoryStore, PgStore, Store};
pub use types::{AllowList, BlockRange, Job, JobKind, PairRecord, TradeRecord};
