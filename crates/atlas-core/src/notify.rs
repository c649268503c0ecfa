//! Notification seam
//!
//! The engine fires a [`RunNotification`] at each terminal run outcome,
//! once per matching hook. Delivery is fire-and-forget: transport failures
//! are logged and never fail the run. Channel implementations live in
//! `atlas-channels`; [`LogNotifier`] ships here so the engine works without
//! any transport configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controllers::{ControllerKind, NotificationTarget};
use crate::hierarchy::ObjectRef;
use crate::history::ExecutionStatus;

/// Payload delivered to notification subscribers at a terminal run outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNotification {
    /// Correlation ID of the logical run
    pub run_id: Uuid,
    /// Attachment the run belonged to
    pub attachment_id: Uuid,
    /// Controller ID
    pub controller_id: Uuid,
    /// Controller name, for human-readable messages
    pub controller_name: String,
    /// Controller kind
    pub kind: ControllerKind,
    /// Hierarchy node the run targeted
    pub object: ObjectRef,
    /// Terminal status (Success or Failed)
    pub outcome: ExecutionStatus,
    /// How many attempts the run took
    pub attempts: u32,
    /// Result summary of the final attempt, if any
    pub summary: Option<String>,
    /// Error detail of the final attempt, if any
    pub error: Option<String>,
    /// When the final attempt finished
    pub finished_at: DateTime<Utc>,
}

/// Notification transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a payload to a target. Errors are logged by the engine, never
    /// propagated into the run.
    async fn notify(
        &self,
        target: &NotificationTarget,
        payload: &RunNotification,
    ) -> anyhow::Result<()>;
}

/// Fallback transport that writes every notification to the log, regardless
/// of target.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        _target: &NotificationTarget,
        payload: &RunNotification,
    ) -> anyhow::Result<()> {
        match payload.outcome {
            ExecutionStatus::Success => tracing::info!(
                "Run {} for {} on {} succeeded after {} attempt(s): {}",
                payload.run_id,
                payload.controller_name,
                payload.object,
                payload.attempts,
                payload.summary.as_deref().unwrap_or("-"),
            ),
            _ => tracing::warn!(
                "Run {} for {} on {} failed after {} attempt(s): {}",
                payload.run_id,
                payload.controller_name,
                payload.object,
                payload.attempts,
                payload.error.as_deref().unwrap_or("-"),
            ),
        }
        Ok(())
    }
}
