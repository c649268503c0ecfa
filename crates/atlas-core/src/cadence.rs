//! Schedule cadence evaluation
//!
//! Parses a cron expression plus IANA timezone once into a [`Cadence`] whose
//! [`Cadence::next_after`] is a pure function. The scheduler tick loop never
//! touches parsing or timezone math; it only asks "next occurrence strictly
//! after this instant", which also makes skipped-occurrence semantics (no
//! catch-up bursts) fall out for free.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

/// A parsed recurring schedule: cron grid evaluated in a fixed timezone.
#[derive(Debug, Clone)]
pub struct Cadence {
    schedule: Schedule,
    timezone: Tz,
}

impl Cadence {
    /// Parse `expression` (5-field crontab or 6/7-field with seconds) in
    /// `timezone`. Returns a human-readable message on failure; callers map
    /// it into a validation error or an attachment's `schedule_error`.
    pub fn parse(expression: &str, timezone: &str) -> std::result::Result<Self, String> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| format!("unknown timezone: {}", timezone))?;

        let normalized = normalize_expression(expression);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression {:?}: {}", expression, e))?;

        Ok(Self { schedule, timezone })
    }

    /// Next occurrence strictly after `after`, in UTC. `None` for schedules
    /// that never fire again (e.g. a fully pinned date in the past).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|occurrence| occurrence.with_timezone(&Utc))
    }
}

/// Crontab expressions carry five fields; the parser wants an explicit
/// seconds column, so pin it to zero.
fn normalize_expression(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}
