//! Execution history types
//!
//! One [`ExecutionRecord`] per attempt. Attempts belonging to the same
//! logical run share a `run_id`, so a run that retried twice reads as three
//! chained records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Armed for a future start (a pending retry)
    Scheduled,
    /// Collector invocation in flight
    Running,
    /// Attempt finished successfully
    Success,
    /// Attempt failed
    Failed,
}

impl ExecutionStatus {
    /// Stable snake_case label, used for storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Parse a stored label back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(ExecutionStatus::Scheduled),
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry for a single execution attempt. Immutable once
/// `finished_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Record ID
    pub id: Uuid,
    /// Correlation ID shared by all attempts of one logical run
    pub run_id: Uuid,
    /// Attachment the run belongs to
    pub attachment_id: Uuid,
    /// Controller the attachment is bound to
    pub controller_id: Uuid,
    /// Attempt number, 1-indexed
    pub attempt: u32,
    /// Current status
    pub status: ExecutionStatus,
    /// Actual start for Running records; intended start for Scheduled ones
    pub started_at: DateTime<Utc>,
    /// Set exactly once, when the attempt reaches a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Error detail for failed attempts
    pub error: Option<String>,
    /// Result summary for successful attempts
    pub summary: Option<String>,
    /// Outcome landed after the attachment was detached
    pub orphaned: bool,
}

impl ExecutionRecord {
    /// A Running record starting now (attempt admitted immediately).
    pub fn started(
        run_id: Uuid,
        attachment_id: Uuid,
        controller_id: Uuid,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            attachment_id,
            controller_id,
            attempt,
            status: ExecutionStatus::Running,
            started_at,
            finished_at: None,
            error: None,
            summary: None,
            orphaned: false,
        }
    }

    /// A Scheduled record armed for `due_at` (a deferred retry).
    pub fn scheduled(
        run_id: Uuid,
        attachment_id: Uuid,
        controller_id: Uuid,
        attempt: u32,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Scheduled,
            ..Self::started(run_id, attachment_id, controller_id, attempt, due_at)
        }
    }
}

/// Filter for [`crate::history::HistoryStore::query`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to one attachment
    pub attachment_id: Option<Uuid>,
    /// Restrict to one controller
    pub controller_id: Option<Uuid>,
    /// Restrict to one status
    pub status: Option<ExecutionStatus>,
    /// Records started at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Records started before this instant
    pub until: Option<DateTime<Utc>>,
    /// Page size (defaults to 50)
    pub limit: Option<i64>,
    /// Page offset
    pub offset: Option<i64>,
}

impl HistoryFilter {
    /// Filter scoped to one attachment.
    pub fn for_attachment(attachment_id: Uuid) -> Self {
        Self {
            attachment_id: Some(attachment_id),
            ..Self::default()
        }
    }

    /// Filter scoped to one controller.
    pub fn for_controller(controller_id: Uuid) -> Self {
        Self {
            controller_id: Some(controller_id),
            ..Self::default()
        }
    }
}

/// One page of history, ordered by `started_at` descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Records in this page
    pub records: Vec<ExecutionRecord>,
    /// Total records matching the filter (all pages)
    pub total: i64,
    /// Applied page size
    pub limit: i64,
    /// Applied offset
    pub offset: i64,
}

/// Internal row type for record queries
#[derive(FromRow)]
pub(crate) struct ExecutionRow {
    pub id: String,
    pub run_id: String,
    pub attachment_id: String,
    pub controller_id: String,
    pub attempt: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<String>,
    pub orphaned: bool,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let parse_id = |field: &'static str, value: &str| {
            Uuid::parse_str(value)
                .map_err(|e| Error::validation(field, format!("invalid UUID: {}", e)))
        };

        Ok(ExecutionRecord {
            id: parse_id("id", &row.id)?,
            run_id: parse_id("run_id", &row.run_id)?,
            attachment_id: parse_id("attachment_id", &row.attachment_id)?,
            controller_id: parse_id("controller_id", &row.controller_id)?,
            attempt: row.attempt as u32,
            status: ExecutionStatus::parse(&row.status)
                .ok_or_else(|| Error::validation("status", format!("unknown: {}", row.status)))?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error: row.error,
            summary: row.summary,
            orphaned: row.orphaned,
        })
    }
}
