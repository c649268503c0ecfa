//! Atlas Core - Controller Attachment & Execution Orchestration Engine
//!
//! Operators attach reusable data-collection controllers to nodes of a
//! geographic hierarchy (region → sub-region → record) and have them run on
//! a schedule, on demand, or in response to an event, with bounded retries,
//! durable execution history, and notification hooks.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐      ┌─────────────────────┐
//! │ ControllerRegistry │◄─────┤  AttachmentManager  │
//! │ (definitions,      │      │  (controller ↔ node │
//! │  policies, hooks)  │      │   bindings, nextRun)│
//! └─────────┬──────────┘      └──────────┬──────────┘
//!           │                            │
//!           │        ┌───────────────────┤
//!           ▼        ▼                   ▼
//! ┌────────────────────┐      ┌─────────────────────┐
//! │  ExecutionEngine   │◄─────┤      Scheduler      │
//! │  (run slots, retry │ due  │  (fixed tick scan)  │
//! │   loop, timeouts)  │      └─────────────────────┘
//! └─────────┬──────────┘
//!           │ invokes            ┌──────────────────┐
//!           ├────────────────────► Collector (per   │
//!           │                    │ controller kind) │
//!           │ appends            └──────────────────┘
//!           ▼
//! ┌────────────────────┐      ┌─────────────────────┐
//! │    HistoryStore    │      │   Notifier hooks    │
//! │ (attempt ledger)   │      │ (log, webhook, ...) │
//! └────────────────────┘      └─────────────────────┘
//! ```
//!
//! The [`Orchestrator`] facade wires the components together and exposes the
//! surface consumed by the UI/API layer. All state persists to one SQLite
//! database; the only shared mutable runtime state is the engine's
//! per-attachment run-slot table.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attachments;
pub mod cadence;
pub mod config;
pub mod controllers;
pub mod db;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod history;
pub mod notify;
pub mod orchestrator;
pub mod scheduler;

pub use attachments::{Attachment, AttachmentManager, AttachmentState, AttachmentStatus};
pub use cadence::Cadence;
pub use config::{AtlasConfig, EngineConfig, SchedulerConfig};
pub use controllers::{
    ConfigTemplate, Controller, ControllerKind, ControllerRegistry, ControllerUpdate,
    NewController, NotificationHook, NotificationTarget, RetryPolicy, SchedulePolicy,
};
pub use engine::{
    CollectError, CollectionContext, Collector, CollectorSet, EngineEvent, ExecutionEngine,
    TriggerMode, TriggerOutcome, TriggerPriority,
};
pub use error::{Error, Result};
pub use hierarchy::{HierarchyDirectory, ObjectRef, ObjectType, StaticHierarchy};
pub use history::{ExecutionRecord, ExecutionStatus, HistoryFilter, HistoryPage, HistoryStore};
pub use notify::{LogNotifier, Notifier, RunNotification};
pub use orchestrator::Orchestrator;
pub use scheduler::Scheduler;
