//! Channel router
//!
//! Implements the core [`Notifier`] seam by dispatching each notification
//! target to its transport.

use async_trait::async_trait;
use atlas_core::{ExecutionStatus, NotificationTarget, Notifier, RunNotification};

use crate::webhook::WebhookChannel;

/// Dispatches notifications to the transport matching their target.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    webhook: WebhookChannel,
}

impl ChannelRouter {
    /// Create a router with default transports.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for ChannelRouter {
    async fn notify(
        &self,
        target: &NotificationTarget,
        payload: &RunNotification,
    ) -> anyhow::Result<()> {
        match target {
            NotificationTarget::Log => {
                match payload.outcome {
                    ExecutionStatus::Success => tracing::info!(
                        "Run {} for {} on {} succeeded after {} attempt(s)",
                        payload.run_id,
                        payload.controller_name,
                        payload.object,
                        payload.attempts,
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
            NotificationTarget::Webhook { url } => {
                self.webhook.send(url, payload).await?;
                Ok(())
            }
        }
    }
}
