//! Collection unit seam
//!
//! The actual scraping/collection work is opaque to the engine: one
//! [`Collector`] implementation per controller kind, registered once at
//! startup into a [`CollectorSet`] and invoked with the merged run
//! configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::controllers::ControllerKind;
use crate::hierarchy::ObjectRef;

/// Failure of a collection attempt.
///
/// Transient failures are eligible for retry under the controller's policy;
/// terminal failures (bad credentials, gone endpoints) short-circuit the
/// remaining attempts.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Failed, but a retry may succeed
    #[error("collection failed: {0}")]
    Transient(String),

    /// Failed in a way no retry will fix
    #[error("collection failed terminally: {0}")]
    Terminal(String),
}

impl CollectError {
    /// Transient failure from any displayable error.
    pub fn transient(error: impl std::fmt::Display) -> Self {
        CollectError::Transient(error.to_string())
    }

    /// Terminal failure from any displayable error.
    pub fn terminal(error: impl std::fmt::Display) -> Self {
        CollectError::Terminal(error.to_string())
    }

    /// Whether remaining attempts should be skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CollectError::Terminal(_))
    }
}

/// Everything a collector gets to see about the run it serves.
///
/// The configuration is a snapshot merged at trigger time (template defaults
/// + attachment overlay); retries reuse it verbatim.
#[derive(Debug, Clone)]
pub struct CollectionContext {
    /// Correlation ID of the logical run
    pub run_id: Uuid,
    /// Attachment being executed
    pub attachment_id: Uuid,
    /// Controller the attachment is bound to
    pub controller_id: Uuid,
    /// Controller kind
    pub kind: ControllerKind,
    /// Hierarchy node the run targets
    pub object: ObjectRef,
    /// Merged run configuration
    pub config: Map<String, Value>,
    /// Attempt number, 1-indexed
    pub attempt: u32,
    /// When this attempt was admitted
    pub started_at: DateTime<Utc>,
}

/// The opaque unit of collection work.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Run one collection attempt. The returned string is the result summary
    /// stored on the execution record.
    async fn collect(&self, ctx: &CollectionContext) -> std::result::Result<String, CollectError>;
}

/// Kind → implementation lookup, resolved once at startup.
#[derive(Default)]
pub struct CollectorSet {
    by_kind: HashMap<ControllerKind, Arc<dyn Collector>>,
}

impl CollectorSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation for a kind, replacing any previous one.
    pub fn register(mut self, kind: ControllerKind, collector: Arc<dyn Collector>) -> Self {
        self.by_kind.insert(kind, collector);
        self
    }

    /// Implementation for a kind, if registered.
    pub fn get(&self, kind: ControllerKind) -> Option<Arc<dyn Collector>> {
        self.by_kind.get(&kind).cloned()
    }
}
