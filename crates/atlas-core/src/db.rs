//! SQLite pool bootstrap and schema migration
//!
//! All atlas stores share one database file. The schema is created here in
//! one idempotent pass so that cross-table invariants (controller deletes
//! checking attachments, detach cancelling execution records) hold no matter
//! which component is constructed first.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};

use crate::error::{Error, Result};

/// Open (creating if necessary) the shared SQLite pool at `path`.
pub async fn connect(path: &Path) -> Result<Pool<Sqlite>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::Validation {
            field: "database_path",
            message: format!("failed to create directory: {}", e),
        })?;
    }

    let url = format!("sqlite:{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Open an in-memory pool, used by tests and short-lived embedders.
pub async fn connect_in_memory() -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Run database migrations
async fn migrate(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS controllers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            config_json TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            retry_json TEXT NOT NULL,
            schedule_json TEXT NOT NULL,
            hooks_json TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            controller_id TEXT NOT NULL REFERENCES controllers(id),
            object_type TEXT NOT NULL,
            object_id TEXT NOT NULL,
            overlay_json TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            last_run_at TIMESTAMP,
            next_run_at TIMESTAMP,
            schedule_error TEXT,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            UNIQUE(controller_id, object_type, object_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Execution records deliberately carry no foreign key to attachments:
    // history outlives detached attachments.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_records (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            attachment_id TEXT NOT NULL,
            controller_id TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            started_at TIMESTAMP NOT NULL,
            finished_at TIMESTAMP,
            error TEXT,
            summary TEXT,
            orphaned BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_controllers_enabled ON controllers(enabled)",
        "CREATE INDEX IF NOT EXISTS idx_attachments_controller ON attachments(controller_id)",
        "CREATE INDEX IF NOT EXISTS idx_attachments_object ON attachments(object_type, object_id)",
        "CREATE INDEX IF NOT EXISTS idx_attachments_next_run ON attachments(next_run_at)",
        "CREATE INDEX IF NOT EXISTS idx_records_attachment ON execution_records(attachment_id)",
        "CREATE INDEX IF NOT EXISTS idx_records_controller ON execution_records(controller_id)",
        "CREATE INDEX IF NOT EXISTS idx_records_status ON execution_records(status)",
        "CREATE INDEX IF NOT EXISTS idx_records_started ON execution_records(started_at)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
