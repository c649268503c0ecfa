//! Attachment manager backed by SQLite
//!
//! Owns the `attachments` table: the many-to-many binding between
//! controllers and hierarchy nodes, plus the lastRun/nextRun bookkeeping
//! mutated by the Execution Engine and the Scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::cadence::Cadence;
use crate::controllers::{Controller, ControllerRow, SchedulePolicy};
use crate::error::{Error, Result};
use crate::hierarchy::{HierarchyDirectory, ObjectRef};
use crate::history::HistoryStore;

use super::types::{Attachment, AttachmentRow};

/// An attachment due for execution, paired with its controller definition.
#[derive(Debug, Clone)]
pub struct DueAttachment {
    /// The due attachment
    pub attachment: Attachment,
    /// Its controller, already decoded
    pub controller: Controller,
}

/// SQLite-backed attachment manager.
pub struct AttachmentManager {
    pool: Pool<Sqlite>,
    directory: Arc<dyn HierarchyDirectory>,
    history: HistoryStore,
}

impl AttachmentManager {
    /// Create the manager over an already-migrated pool (see [`crate::db`]).
    pub fn new(
        pool: Pool<Sqlite>,
        directory: Arc<dyn HierarchyDirectory>,
        history: HistoryStore,
    ) -> Self {
        Self {
            pool,
            directory,
            history,
        }
    }

    /// Attach a controller to a hierarchy node.
    ///
    /// Upserts on the unique (controller, object) tuple: attaching the same
    /// controller twice to the same object updates the overlay and re-enables
    /// the binding instead of duplicating it. Fails with NotFound when the
    /// controller or the referenced node does not exist.
    pub async fn attach(
        &self,
        controller_id: Uuid,
        object: ObjectRef,
        overlay: Value,
    ) -> Result<Attachment> {
        let controller = self.load_controller(controller_id).await?;

        if !self.directory.exists(&object).await? {
            return Err(Error::NotFound {
                entity: "hierarchy object",
                id: object.to_string(),
            });
        }

        let merged = controller.config.merged(&overlay);
        let missing = controller.config.missing_required(&merged);
        if !missing.is_empty() {
            return Err(Error::validation(
                "overlay",
                format!("missing required parameters: {}", missing.join(", ")),
            ));
        }

        let now = Utc::now();
        let (next_run_at, schedule_error) = match &controller.schedule {
            SchedulePolicy::Manual => (None, None),
            SchedulePolicy::Recurring {
                expression,
                timezone,
            } => match Cadence::parse(expression, timezone) {
                Ok(cadence) => (cadence.next_after(now), None),
                Err(message) => (None, Some(message)),
            },
        };

        sqlx::query(
            r#"
            INSERT INTO attachments (
                id, controller_id, object_type, object_id, overlay_json,
                enabled, last_run_at, next_run_at, schedule_error,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, TRUE, NULL, ?, ?, ?, ?)
            ON CONFLICT(controller_id, object_type, object_id) DO UPDATE SET
                overlay_json = excluded.overlay_json,
                enabled = TRUE,
                next_run_at = excluded.next_run_at,
                schedule_error = excluded.schedule_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(controller_id.to_string())
        .bind(object.object_type.as_str())
        .bind(&object.object_id)
        .bind(serde_json::to_string(&overlay)?)
        .bind(next_run_at)
        .bind(&schedule_error)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find(controller_id, &object)
            .await?
            .ok_or_else(|| Error::not_found("attachment", controller_id))
    }

    /// Detach a controller from a hierarchy node. Cancels any
    /// not-yet-started Scheduled execution record for the binding.
    pub async fn detach(&self, controller_id: Uuid, object: &ObjectRef) -> Result<()> {
        let attachment = self.find(controller_id, object).await?.ok_or_else(|| {
            Error::NotFound {
                entity: "attachment",
                id: format!("{} on {}", controller_id, object),
            }
        })?;

        sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(attachment.id.to_string())
            .execute(&self.pool)
            .await?;

        let cancelled = self.history.cancel_scheduled(attachment.id).await?;
        if cancelled > 0 {
            tracing::info!(
                "Cancelled {} pending retr{} for detached attachment {}",
                cancelled,
                if cancelled == 1 { "y" } else { "ies" },
                attachment.id
            );
        }

        Ok(())
    }

    /// Get an attachment by ID.
    pub async fn get(&self, id: Uuid) -> Result<Attachment> {
        let row: AttachmentRow = sqlx::query_as("SELECT * FROM attachments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("attachment", id))?;

        row.try_into()
    }

    /// Look up an attachment by its unique tuple.
    pub async fn find(
        &self,
        controller_id: Uuid,
        object: &ObjectRef,
    ) -> Result<Option<Attachment>> {
        let row: Option<AttachmentRow> = sqlx::query_as(
            r#"
            SELECT * FROM attachments
            WHERE controller_id = ? AND object_type = ? AND object_id = ?
            "#,
        )
        .bind(controller_id.to_string())
        .bind(object.object_type.as_str())
        .bind(&object.object_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Attachments bound to one hierarchy node (UI tree support).
    pub async fn list_for_object(&self, object: &ObjectRef) -> Result<Vec<Attachment>> {
        let rows: Vec<AttachmentRow> = sqlx::query_as(
            r#"
            SELECT * FROM attachments
            WHERE object_type = ? AND object_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(object.object_type.as_str())
        .bind(&object.object_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Attachments of one controller (UI tree support).
    pub async fn list_for_controller(&self, controller_id: Uuid) -> Result<Vec<Attachment>> {
        let rows: Vec<AttachmentRow> = sqlx::query_as(
            "SELECT * FROM attachments WHERE controller_id = ? ORDER BY created_at ASC",
        )
        .bind(controller_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Flip the enabled flag on a binding.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE attachments SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("attachment", id));
        }
        Ok(())
    }

    /// Record a finished run: update `last_run_at` and, for recurring
    /// schedules, recompute `next_run_at` from the completion time. The
    /// recompute never moves an already-advanced due time backwards, so a
    /// run finishing after the scheduler's own advance cannot re-arm a slot
    /// that was already emitted. Called exclusively by the Execution Engine.
    pub async fn record_completion(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let attachment = self.get(id).await?;
        let controller = self.load_controller(attachment.controller_id).await?;

        let computed = match &controller.schedule {
            SchedulePolicy::Manual => None,
            SchedulePolicy::Recurring {
                expression,
                timezone,
            } => Cadence::parse(expression, timezone)
                .ok()
                .and_then(|cadence| cadence.next_after(finished_at)),
        };

        sqlx::query(
            r#"
            UPDATE attachments SET
                last_run_at = ?1,
                next_run_at = CASE
                    WHEN ?2 IS NULL THEN next_run_at
                    WHEN next_run_at IS NULL OR next_run_at < ?2 THEN ?2
                    ELSE next_run_at
                END,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(finished_at)
        .bind(computed)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Enabled attachments of enabled controllers whose `next_run_at` has
    /// come due, paired with their decoded controllers. Scheduler only.
    pub async fn due_attachments(&self, now: DateTime<Utc>) -> Result<Vec<DueAttachment>> {
        let rows: Vec<AttachmentRow> = sqlx::query_as(
            r#"
            SELECT a.* FROM attachments a
            JOIN controllers c ON c.id = a.controller_id
            WHERE a.enabled = TRUE
              AND c.enabled = TRUE
              AND a.schedule_error IS NULL
              AND a.next_run_at IS NOT NULL
              AND a.next_run_at <= ?
            ORDER BY a.next_run_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let attachment: Attachment = row.try_into()?;
            let controller = self.load_controller(attachment.controller_id).await?;
            due.push(DueAttachment {
                attachment,
                controller,
            });
        }
        Ok(due)
    }

    /// Advance `next_run_at` after a due signal was emitted. Scheduler only.
    pub async fn advance_next_run(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE attachments SET next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Quarantine an attachment whose schedule cannot be evaluated. It stays
    /// out of scans until the controller's schedule is corrected.
    pub async fn mark_schedule_error(&self, id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE attachments SET schedule_error = ?, next_run_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_controller(&self, controller_id: Uuid) -> Result<Controller> {
        let row: ControllerRow = sqlx::query_as("SELECT * FROM controllers WHERE id = ?")
            .bind(controller_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("controller", controller_id))?;

        row.try_into()
    }
}
