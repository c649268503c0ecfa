//! Controller definitions and policy types
//!
//! A controller is a reusable data-collection job definition: a kind tag,
//! a configuration template, a retry policy, a schedule policy, and the
//! notification hooks fired on terminal run outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Supported controller kinds. Each kind maps to one registered
/// [`crate::engine::Collector`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// Delinquent tax sale listings
    TaxSale,
    /// Parcel / boundary map layers
    Map,
    /// Property detail records
    Property,
    /// Census and demographic figures
    Demographics,
}

impl ControllerKind {
    /// Stable snake_case label, used for storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerKind::TaxSale => "tax_sale",
            ControllerKind::Map => "map",
            ControllerKind::Property => "property",
            ControllerKind::Demographics => "demographics",
        }
    }

    /// Parse a stored label back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tax_sale" => Some(ControllerKind::TaxSale),
            "map" => Some(ControllerKind::Map),
            "property" => Some(ControllerKind::Property),
            "demographics" => Some(ControllerKind::Demographics),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration template: parameter names a collection run expects, plus
/// template-level defaults that per-attachment overlays may override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigTemplate {
    /// Parameters that must be present in the merged run configuration
    #[serde(default)]
    pub required: Vec<String>,
    /// Parameters that may be present
    #[serde(default)]
    pub optional: Vec<String>,
    /// Template-level default values
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

impl ConfigTemplate {
    /// Merge template defaults with a per-attachment overlay. Overlay keys
    /// win; non-object overlays contribute nothing.
    pub fn merged(&self, overlay: &Value) -> Map<String, Value> {
        let mut merged = self.defaults.clone();
        if let Value::Object(entries) = overlay {
            for (key, value) in entries {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Required parameters absent from a merged configuration.
    pub fn missing_required(&self, merged: &Map<String, Value>) -> Vec<String> {
        self.required
            .iter()
            .filter(|name| !merged.contains_key(*name))
            .cloned()
            .collect()
    }
}

/// Retry backoff policy for failed collection attempts.
///
/// The delay before retry `n` (1-indexed) is
/// `base_delay_secs × multiplier^(n−1)`, clamped to `max_delay_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,
    /// Maximum attempt count, including the first (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    /// Multiplicative growth factor per additional retry (>= 1.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Ceiling on any single delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_retry_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: default_retry_enabled(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-indexed: 1 = delay between
    /// attempts 1 and 2). Non-finite or overflowing products clamp to the
    /// ceiling.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let max_secs = self.max_delay_secs as f64;
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_secs as f64 * self.multiplier.powi(exponent);

        if !raw.is_finite() || raw < 0.0 || raw > max_secs {
            Duration::from_secs(self.max_delay_secs)
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::validation("retry.max_attempts", "must be >= 1"));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(Error::validation("retry.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }
}

/// Schedule policy: manual-only, or a recurring cron cadence in a timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Runs only on manual or event triggers
    Manual,
    /// Runs on a recurring cron cadence
    Recurring {
        /// Cron expression ("minute hour day month weekday", seconds field
        /// optional)
        expression: String,
        /// IANA timezone name the expression is evaluated in
        timezone: String,
    },
}

impl SchedulePolicy {
    /// Whether this policy can ever produce a run-due signal.
    pub fn is_recurring(&self) -> bool {
        matches!(self, SchedulePolicy::Recurring { .. })
    }

    /// Check the expression and timezone parse.
    pub fn validate(&self) -> Result<()> {
        if let SchedulePolicy::Recurring {
            expression,
            timezone,
        } = self
        {
            crate::cadence::Cadence::parse(expression, timezone)
                .map_err(|e| Error::validation("schedule", e))?;
        }
        Ok(())
    }
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        SchedulePolicy::Manual
    }
}

/// Destination for a notification hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationTarget {
    /// Structured log line (always available)
    Log,
    /// HTTP webhook receiving a JSON payload
    Webhook {
        /// URL the payload is POSTed to
        url: String,
    },
}

/// A success/failure subscriber configured on a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationHook {
    /// Where the notification goes
    pub target: NotificationTarget,
    /// Fire on terminal Success
    #[serde(default)]
    pub on_success: bool,
    /// Fire on terminal Failed (after retries are exhausted)
    #[serde(default = "default_on_failure")]
    pub on_failure: bool,
}

fn default_on_failure() -> bool {
    true
}

/// A registered controller definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    /// Unique controller ID
    pub id: Uuid,
    /// Human-readable name
    pub name: String,
    /// Controller kind tag
    pub kind: ControllerKind,
    /// Configuration template
    pub config: ConfigTemplate,
    /// Whether the controller may run at all
    pub enabled: bool,
    /// Retry policy applied to failed attempts
    pub retry: RetryPolicy,
    /// Schedule policy
    pub schedule: SchedulePolicy,
    /// Notification subscribers
    pub hooks: Vec<NotificationHook>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::controllers::ControllerRegistry::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewController {
    /// Human-readable name (required, non-empty)
    pub name: String,
    /// Controller kind tag
    pub kind: Option<ControllerKind>,
    /// Configuration template
    #[serde(default)]
    pub config: ConfigTemplate,
    /// Retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Schedule policy
    #[serde(default)]
    pub schedule: SchedulePolicy,
    /// Notification subscribers
    #[serde(default)]
    pub hooks: Vec<NotificationHook>,
}

/// Partial update for [`crate::controllers::ControllerRegistry::update`].
/// `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ControllerUpdate {
    /// New name
    pub name: Option<String>,
    /// New configuration template
    pub config: Option<ConfigTemplate>,
    /// New retry policy
    pub retry: Option<RetryPolicy>,
    /// New schedule policy
    pub schedule: Option<SchedulePolicy>,
    /// New notification subscribers
    pub hooks: Option<Vec<NotificationHook>>,
    /// New enabled flag
    pub enabled: Option<bool>,
}

/// Internal row type for controller queries
#[derive(FromRow)]
pub(crate) struct ControllerRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub config_json: String,
    pub enabled: bool,
    pub retry_json: String,
    pub schedule_json: String,
    pub hooks_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ControllerRow> for Controller {
    type Error = Error;

    fn try_from(row: ControllerRow) -> Result<Self> {
        Ok(Controller {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| Error::validation("id", format!("invalid controller ID: {}", e)))?,
            name: row.name,
            kind: ControllerKind::parse(&row.kind)
                .ok_or_else(|| Error::validation("kind", format!("unknown kind: {}", row.kind)))?,
            config: serde_json::from_str(&row.config_json)?,
            enabled: row.enabled,
            retry: serde_json::from_str(&row.retry_json)?,
            schedule: serde_json::from_str(&row.schedule_json)?,
            hooks: serde_json::from_str(&row.hooks_json)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
