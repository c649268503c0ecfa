//! Error types for atlas-core
//!
//! One taxonomy for the orchestration API surface. Failures inside a
//! collection run (transient vs. terminal) live in
//! [`crate::engine::CollectError`] and never leave the retry loop.

use thiserror::Error;
use uuid::Uuid;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input shape or an internally inconsistent policy
    #[error("validation error: {field}: {message}")]
    Validation {
        /// Offending field name
        field: &'static str,
        /// Detailed message
        message: String,
    },

    /// Missing controller, attachment, record, or hierarchy object
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("controller", "attachment", ...)
        entity: &'static str,
        /// Identifier that failed to resolve
        id: String,
    },

    /// Delete-with-references or duplicate create
    #[error("conflict: {0}")]
    Conflict(String),

    /// Trigger on a disabled controller or attachment
    #[error("{entity} is disabled: {id}")]
    Disabled {
        /// Entity kind ("controller", "attachment")
        entity: &'static str,
        /// Identifier of the disabled entity
        id: Uuid,
    },

    /// Manual trigger collided with a run already in flight
    #[error("a run is already in flight for attachment {attachment_id}")]
    AlreadyRunning {
        /// Attachment whose run slot is occupied
        attachment_id: Uuid,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] with a UUID identifier.
    pub(crate) fn not_found(entity: &'static str, id: Uuid) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for a [`Error::Validation`].
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
