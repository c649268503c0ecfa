//! Attachment Manager
//!
//! Owns the many-to-many binding between controllers and hierarchy nodes.
//! The (controller, objectType, objectId) tuple is unique; attach is an
//! idempotent upsert and detach also cancels any pending scheduled retry.

mod manager;
mod types;

pub use manager::{AttachmentManager, DueAttachment};
pub use types::{Attachment, AttachmentState, AttachmentStatus};
