//! Attachment types
//!
//! An attachment binds one controller to one hierarchy node. The
//! (controller, object) tuple is unique; attaching again updates the
//! existing row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hierarchy::{ObjectRef, ObjectType};

/// Binding of a controller to a hierarchy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique attachment ID
    pub id: Uuid,
    /// Bound controller
    pub controller_id: Uuid,
    /// Hierarchy node the controller runs against
    pub object: ObjectRef,
    /// Per-attachment configuration overlay (merged over the template)
    pub overlay: Value,
    /// Whether this binding may run
    pub enabled: bool,
    /// When the last run finished
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the next scheduled run is due (recurring schedules only)
    pub next_run_at: Option<DateTime<Utc>>,
    /// Set when the schedule could not be evaluated; excludes the
    /// attachment from scans until the controller is corrected
    pub schedule_error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Live run state of an attachment, derived from the engine's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    /// No run in flight
    Idle,
    /// A collector invocation is in flight
    Running,
    /// A retry is armed and waiting out its backoff delay
    RetryPending,
}

/// Status snapshot returned by the orchestration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentStatus {
    /// Attachment ID
    pub attachment_id: Uuid,
    /// Whether the binding may run
    pub enabled: bool,
    /// When the last run finished
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the next scheduled run is due
    pub next_run_at: Option<DateTime<Utc>>,
    /// Live run state
    pub current_state: AttachmentState,
}

/// Internal row type for attachment queries
#[derive(FromRow)]
pub(crate) struct AttachmentRow {
    pub id: String,
    pub controller_id: String,
    pub object_type: String,
    pub object_id: String,
    pub overlay_json: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub schedule_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AttachmentRow> for Attachment {
    type Error = Error;

    fn try_from(row: AttachmentRow) -> Result<Self> {
        Ok(Attachment {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| Error::validation("id", format!("invalid attachment ID: {}", e)))?,
            controller_id: Uuid::parse_str(&row.controller_id)
                .map_err(|e| Error::validation("controller_id", format!("invalid UUID: {}", e)))?,
            object: ObjectRef {
                object_type: ObjectType::parse(&row.object_type).ok_or_else(|| {
                    Error::validation("object_type", format!("unknown: {}", row.object_type))
                })?,
                object_id: row.object_id,
            },
            overlay: serde_json::from_str(&row.overlay_json)?,
            enabled: row.enabled,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            schedule_error: row.schedule_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
