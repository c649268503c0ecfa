//! Atlas Channels - Notification Transports
//!
//! This crate provides the notification transports behind the core
//! [`atlas_core::Notifier`] seam:
//! - Log: structured log lines (always available)
//! - Webhook: JSON POSTs via reqwest
//!
//! Delivery is fire-and-forget from the engine's point of view: failures are
//! logged, never propagated into the run.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod router;
pub mod webhook;

pub use error::{Error, Result};
pub use router::ChannelRouter;
pub use webhook::WebhookChannel;
