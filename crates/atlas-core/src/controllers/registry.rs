//! Controller registry backed by SQLite
//!
//! Owns the `controllers` table. Attachments reference controllers by id
//! without owning them, so deletes are refused while references remain.

use chrono::Utc;
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::cadence::Cadence;
use crate::error::{Error, Result};

use super::types::{Controller, ControllerRow, ControllerUpdate, NewController, SchedulePolicy};

/// SQLite-backed registry of controller definitions.
pub struct ControllerRegistry {
    pool: Pool<Sqlite>,
}

impl ControllerRegistry {
    /// Create the registry over an already-migrated pool (see [`crate::db`]).
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Register a new controller.
    pub async fn create(&self, definition: NewController) -> Result<Controller> {
        if definition.name.trim().is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }
        let kind = definition
            .kind
            .ok_or_else(|| Error::validation("kind", "must be provided"))?;
        definition.retry.validate()?;
        definition.schedule.validate()?;

        let now = Utc::now();
        let controller = Controller {
            id: Uuid::new_v4(),
            name: definition.name,
            kind,
            config: definition.config,
            enabled: true,
            retry: definition.retry,
            schedule: definition.schedule,
            hooks: definition.hooks,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO controllers (
                id, name, kind, config_json, enabled,
                retry_json, schedule_json, hooks_json, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(controller.id.to_string())
        .bind(&controller.name)
        .bind(controller.kind.as_str())
        .bind(serde_json::to_string(&controller.config)?)
        .bind(controller.enabled)
        .bind(serde_json::to_string(&controller.retry)?)
        .bind(serde_json::to_string(&controller.schedule)?)
        .bind(serde_json::to_string(&controller.hooks)?)
        .bind(controller.created_at)
        .bind(controller.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, &controller.name))?;

        Ok(controller)
    }

    /// Get a controller by ID.
    pub async fn get(&self, id: Uuid) -> Result<Controller> {
        let row: ControllerRow = sqlx::query_as("SELECT * FROM controllers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("controller", id))?;

        row.try_into()
    }

    /// Apply a partial update, re-validating the resulting policies.
    ///
    /// A schedule change re-primes `next_run_at` on every attachment of the
    /// controller (or clears it when the schedule becomes manual-only).
    pub async fn update(&self, id: Uuid, update: ControllerUpdate) -> Result<Controller> {
        let mut controller = self.get(id).await?;

        let schedule_changed = update
            .schedule
            .as_ref()
            .map(|s| *s != controller.schedule)
            .unwrap_or(false);

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(Error::validation("name", "must not be empty"));
            }
            controller.name = name;
        }
        if let Some(config) = update.config {
            controller.config = config;
        }
        if let Some(retry) = update.retry {
            controller.retry = retry;
        }
        if let Some(schedule) = update.schedule {
            controller.schedule = schedule;
        }
        if let Some(hooks) = update.hooks {
            controller.hooks = hooks;
        }
        if let Some(enabled) = update.enabled {
            controller.enabled = enabled;
        }

        controller.retry.validate()?;
        controller.schedule.validate()?;
        controller.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE controllers SET
                name = ?, config_json = ?, enabled = ?,
                retry_json = ?, schedule_json = ?, hooks_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&controller.name)
        .bind(serde_json::to_string(&controller.config)?)
        .bind(controller.enabled)
        .bind(serde_json::to_string(&controller.retry)?)
        .bind(serde_json::to_string(&controller.schedule)?)
        .bind(serde_json::to_string(&controller.hooks)?)
        .bind(controller.updated_at)
        .bind(controller.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, &controller.name))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("controller", id));
        }

        if schedule_changed {
            self.reprime_attachments(&controller).await?;
        }

        Ok(controller)
    }

    /// Delete a controller. Fails with Conflict while attachments reference
    /// it.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE controller_id = ?")
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await?;

        if references > 0 {
            return Err(Error::Conflict(format!(
                "controller {} still has {} attachment(s)",
                id, references
            )));
        }

        let result = sqlx::query("DELETE FROM controllers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("controller", id));
        }

        Ok(())
    }

    /// Flip the enabled flag without deleting. The scheduler skips due-signal
    /// generation for disabled controllers.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Controller> {
        self.update(
            id,
            ControllerUpdate {
                enabled: Some(enabled),
                ..ControllerUpdate::default()
            },
        )
        .await
    }

    /// List all controllers.
    pub async fn list(&self) -> Result<Vec<Controller>> {
        let rows: Vec<ControllerRow> = sqlx::query_as("SELECT * FROM controllers ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Recompute attachment due times after a schedule change.
    async fn reprime_attachments(&self, controller: &Controller) -> Result<()> {
        let next_run_at = match &controller.schedule {
            SchedulePolicy::Manual => None,
            SchedulePolicy::Recurring {
                expression,
                timezone,
            } => {
                // Validated above, so parse cannot fail here.
                Cadence::parse(expression, timezone)
                    .ok()
                    .and_then(|cadence| cadence.next_after(Utc::now()))
            }
        };

        sqlx::query(
            r#"
            UPDATE attachments SET next_run_at = ?, schedule_error = NULL, updated_at = ?
            WHERE controller_id = ?
            "#,
        )
        .bind(next_run_at)
        .bind(Utc::now())
        .bind(controller.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Map a unique-constraint violation on `name` to a Conflict.
fn conflict_on_unique(error: sqlx::Error, name: &str) -> Error {
    match &error {
        sqlx::Error::Database(db)
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation =>
        {
            Error::Conflict(format!("controller named {:?} already exists", name))
        }
        _ => Error::Database(error),
    }
}
