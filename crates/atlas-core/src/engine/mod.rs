//! Execution Engine
//!
//! Accepts run requests from the scheduler, manual triggers, and event
//! triggers; enforces the at-most-one-concurrent-run-per-attachment
//! invariant; invokes the pluggable collection unit with retry/backoff
//! discipline; and reports outcomes to the history store, the attachment
//! manager, and notification hooks.

mod collector;
mod engine;

#[cfg(test)]
mod tests;

pub use collector::{CollectError, CollectionContext, Collector, CollectorSet};
pub use engine::{EngineEvent, ExecutionEngine, TriggerMode, TriggerOutcome, TriggerPriority};
