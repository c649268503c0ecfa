//! Webhook channel
//!
//! Delivers run notifications as JSON POSTs. Non-2xx responses count as
//! delivery failures so the engine can log them.

use std::time::Duration;

use atlas_core::RunNotification;
use serde_json::json;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP webhook sender.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a sender with its own connection pool.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// POST the payload to `url`.
    pub async fn send(&self, url: &str, payload: &RunNotification) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(&payload_json(payload))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Webhook(format!(
                "{} responded {}",
                url,
                response.status()
            )));
        }

        Ok(())
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire shape of the webhook body.
pub(crate) fn payload_json(payload: &RunNotification) -> serde_json::Value {
    json!({
        "event": "run_finished",
        "run_id": payload.run_id,
        "controller": {
            "id": payload.controller_id,
            "name": payload.controller_name,
            "kind": payload.kind,
        },
        "attachment_id": payload.attachment_id,
        "object": payload.object,
        "outcome": payload.outcome,
        "attempts": payload.attempts,
        "summary": payload.summary,
        "error": payload.error,
        "finished_at": payload.finished_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{ControllerKind, ExecutionStatus, ObjectRef, ObjectType};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn payload_shape_is_stable() {
        let payload = RunNotification {
            run_id: Uuid::new_v4(),
            attachment_id: Uuid::new_v4(),
            controller_id: Uuid::new_v4(),
            controller_name: "fulton-tax-sales".to_string(),
            kind: ControllerKind::TaxSale,
            object: ObjectRef::new(ObjectType::SubRegion, "GA/fulton"),
            outcome: ExecutionStatus::Failed,
            attempts: 3,
            summary: None,
            error: Some("upstream returned 503".to_string()),
            finished_at: Utc::now(),
        };

        let body = payload_json(&payload);
        assert_eq!(body["event"], "run_finished");
        assert_eq!(body["controller"]["kind"], "tax_sale");
        assert_eq!(body["outcome"], "failed");
        assert_eq!(body["attempts"], 3);
        assert_eq!(body["object"]["object_type"], "sub_region");
    }
}
