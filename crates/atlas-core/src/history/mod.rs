//! History Store
//!
//! Durable, queryable ledger of execution attempts. `append` and a
//! single-shot `finalize` are the only mutations; finalized records are
//! immutable. Consumed by operators for audit and by the Execution Engine
//! for its open-run checks.

mod store;
mod types;

pub use store::HistoryStore;
pub use types::{ExecutionRecord, ExecutionStatus, HistoryFilter, HistoryPage};
