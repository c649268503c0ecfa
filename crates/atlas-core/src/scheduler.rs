//! Scheduler
//!
//! Background scan on a fixed tick: every enabled attachment of an enabled
//! controller with a recurring schedule and `next_run_at <= now` gets exactly
//! one run-due signal, then its `next_run_at` advances strictly past now.
//! Occurrences missed while the process was down are skipped, never burst.
//!
//! The scan shares no state with foreground triggers beyond the engine's
//! per-attachment run slots, so manual triggers compose safely with the tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attachments::AttachmentManager;
use crate::cadence::Cadence;
use crate::config::SchedulerConfig;
use crate::controllers::SchedulePolicy;
use crate::engine::{ExecutionEngine, TriggerMode, TriggerOutcome, TriggerPriority};
use crate::error::{Error, Result};

/// Fixed-tick scheduler emitting run-due signals into the engine.
pub struct Scheduler {
    attachments: Arc<AttachmentManager>,
    engine: ExecutionEngine,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        attachments: Arc<AttachmentManager>,
        engine: ExecutionEngine,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            attachments,
            engine,
            config,
        }
    }

    /// Run the tick loop until `shutdown` fires. A failing scan is logged
    /// and the loop resumes on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Scheduler starting (tick every {:?})",
            self.config.check_interval()
        );
        let check_interval = self.config.check_interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    if let Err(e) = self.scan_once(Utc::now()).await {
                        error!("Scheduler scan failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One scan pass at the given instant. Returns how many run-due signals
    /// were accepted by the engine. Public so embedders and tests can drive
    /// the scheduler on a simulated clock.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.attachments.due_attachments(now).await?;
        if due.is_empty() {
            debug!("No attachments due");
            return Ok(0);
        }

        let mut emitted = 0;
        for entry in due {
            let attachment = entry.attachment;
            let (expression, timezone) = match &entry.controller.schedule {
                SchedulePolicy::Recurring {
                    expression,
                    timezone,
                } => (expression, timezone),
                SchedulePolicy::Manual => {
                    // Stale due time left behind by an earlier schedule.
                    // A manual-only policy never yields due signals.
                    if let Err(e) = self.attachments.advance_next_run(attachment.id, None).await {
                        warn!("Failed to clear stale due time on {}: {}", attachment.id, e);
                    }
                    continue;
                }
            };

            let cadence = match Cadence::parse(expression, timezone) {
                Ok(cadence) => cadence,
                Err(message) => {
                    warn!(
                        "Attachment {} has an unusable schedule ({}); excluding from scans",
                        attachment.id, message
                    );
                    if let Err(e) = self
                        .attachments
                        .mark_schedule_error(attachment.id, &message)
                        .await
                    {
                        warn!("Failed to quarantine attachment {}: {}", attachment.id, e);
                    }
                    continue;
                }
            };

            match self
                .engine
                .trigger(attachment.id, TriggerMode::Scheduled, TriggerPriority::Normal)
                .await
            {
                Ok(TriggerOutcome::Accepted { run_id }) => {
                    debug!("Emitted run {} for attachment {}", run_id, attachment.id);
                    emitted += 1;
                }
                Ok(TriggerOutcome::Coalesced) => {
                    debug!(
                        "Attachment {} already has a run in flight; due signal dropped",
                        attachment.id
                    );
                }
                // Raced with a disable between the scan query and the
                // trigger; nothing to do.
                Err(Error::Disabled { .. }) => {
                    debug!("Attachment {} disabled mid-scan", attachment.id)
                }
                Err(e) => warn!("Failed to trigger attachment {}: {}", attachment.id, e),
            }

            // Advance strictly past now whether or not the signal was
            // accepted; missed occurrences are skipped.
            let next = cadence.next_after(now);
            if let Err(e) = self.attachments.advance_next_run(attachment.id, next).await {
                warn!("Failed to advance due time on {}: {}", attachment.id, e);
            }
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::Attachment;
    use crate::config::EngineConfig;
    use crate::controllers::{
        Controller, ControllerKind, ControllerRegistry, NewController, RetryPolicy,
    };
    use crate::db;
    use crate::engine::{CollectError, CollectionContext, Collector, CollectorSet};
    use crate::hierarchy::{ObjectRef, ObjectType, StaticHierarchy};
    use crate::history::{ExecutionStatus, HistoryFilter, HistoryStore};
    use crate::notify::LogNotifier;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;
    use sqlx::{Pool, Sqlite};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingCollector {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Collector for CountingCollector {
        async fn collect(&self, _ctx: &CollectionContext) -> std::result::Result<String, CollectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("scan run".to_string())
        }
    }

    struct TestContext {
        pool: Pool<Sqlite>,
        registry: Arc<ControllerRegistry>,
        manager: Arc<AttachmentManager>,
        history: HistoryStore,
        scheduler: Scheduler,
        calls: Arc<AtomicU32>,
        _dir: TempDir,
    }

    async fn create_test_context() -> TestContext {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("atlas.db")).await.unwrap();

        let registry = Arc::new(ControllerRegistry::new(pool.clone()));
        let history = HistoryStore::new(pool.clone());
        let directory = Arc::new(StaticHierarchy::with_objects([ObjectRef::new(
            ObjectType::Record,
            "GA/fulton/14-0012-0008",
        )]));
        let manager = Arc::new(AttachmentManager::new(
            pool.clone(),
            directory,
            history.clone(),
        ));

        let calls = Arc::new(AtomicU32::new(0));
        let collectors = CollectorSet::new().register(
            ControllerKind::TaxSale,
            Arc::new(CountingCollector {
                calls: calls.clone(),
            }),
        );

        let engine = ExecutionEngine::new(
            registry.clone(),
            manager.clone(),
            history.clone(),
            Arc::new(collectors),
            Arc::new(LogNotifier),
            EngineConfig::default(),
        );

        let scheduler = Scheduler::new(manager.clone(), engine, SchedulerConfig::default());

        TestContext {
            pool,
            registry,
            manager,
            history,
            scheduler,
            calls,
            _dir: dir,
        }
    }

    async fn minutely_attachment(ctx: &TestContext) -> (Controller, Attachment) {
        let controller = ctx
            .registry
            .create(NewController {
                name: format!("minutely-{}", uuid::Uuid::new_v4()),
                kind: Some(ControllerKind::TaxSale),
                retry: RetryPolicy {
                    enabled: false,
                    ..RetryPolicy::default()
                },
                schedule: SchedulePolicy::Recurring {
                    expression: "* * * * *".to_string(),
                    timezone: "UTC".to_string(),
                },
                ..NewController::default()
            })
            .await
            .unwrap();

        let attachment = ctx
            .manager
            .attach(
                controller.id,
                ObjectRef::new(ObjectType::Record, "GA/fulton/14-0012-0008"),
                Value::Null,
            )
            .await
            .unwrap();

        (controller, attachment)
    }

    #[tokio::test(start_paused = true)]
    async fn due_attachment_gets_exactly_one_signal_and_advances() {
        let ctx = create_test_context().await;
        let (_, attachment) = minutely_attachment(&ctx).await;

        let due_at = attachment.next_run_at.unwrap();
        let scan_at = due_at + ChronoDuration::seconds(1);

        let emitted = ctx.scheduler.scan_once(scan_at).await.unwrap();
        assert_eq!(emitted, 1);

        let advanced = ctx.manager.get(attachment.id).await.unwrap();
        assert!(advanced.next_run_at.unwrap() > scan_at);

        // The same instant scans clean: the due time moved past it.
        assert_eq!(ctx.scheduler.scan_once(scan_at).await.unwrap(), 0);

        // The emitted signal actually ran.
        for _ in 0..200 {
            if ctx.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_occurrences_do_not_burst() {
        let ctx = create_test_context().await;
        let (_, attachment) = minutely_attachment(&ctx).await;

        // Pretend the process slept through an hour of occurrences.
        let late = attachment.next_run_at.unwrap() + ChronoDuration::hours(1);
        let emitted = ctx.scheduler.scan_once(late).await.unwrap();
        assert_eq!(emitted, 1);

        let advanced = ctx.manager.get(attachment.id).await.unwrap();
        let next = advanced.next_run_at.unwrap();
        assert!(next > late);
        assert!(next <= late + ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn manual_schedule_never_yields_signals() {
        let ctx = create_test_context().await;
        let controller = ctx
            .registry
            .create(NewController {
                name: "manual-only".to_string(),
                kind: Some(ControllerKind::TaxSale),
                ..NewController::default()
            })
            .await
            .unwrap();
        let attachment = ctx
            .manager
            .attach(
                controller.id,
                ObjectRef::new(ObjectType::Record, "GA/fulton/14-0012-0008"),
                Value::Null,
            )
            .await
            .unwrap();

        // Force a stale due time into the past, as if the schedule had been
        // recurring once.
        let past = Utc::now() - ChronoDuration::hours(2);
        ctx.manager
            .advance_next_run(attachment.id, Some(past))
            .await
            .unwrap();

        let emitted = ctx.scheduler.scan_once(Utc::now()).await.unwrap();
        assert_eq!(emitted, 0);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);

        // The stale due time was cleared, not advanced.
        let cleared = ctx.manager.get(attachment.id).await.unwrap();
        assert!(cleared.next_run_at.is_none());
    }

    #[tokio::test]
    async fn disabled_controller_is_skipped_even_when_past_due() {
        let ctx = create_test_context().await;
        let (controller, attachment) = minutely_attachment(&ctx).await;

        ctx.registry.set_enabled(controller.id, false).await.unwrap();

        let late = attachment.next_run_at.unwrap() + ChronoDuration::hours(1);
        assert_eq!(ctx.scheduler.scan_once(late).await.unwrap(), 0);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unusable_schedule_is_quarantined() {
        let ctx = create_test_context().await;
        let (controller, attachment) = minutely_attachment(&ctx).await;

        // Corrupt the stored schedule behind the registry's back; the scan
        // must contain the damage rather than crash the tick.
        sqlx::query("UPDATE controllers SET schedule_json = ? WHERE id = ?")
            .bind(r#"{"type":"recurring","expression":"bogus","timezone":"UTC"}"#)
            .bind(controller.id.to_string())
            .execute(&ctx.pool)
            .await
            .unwrap();

        let late = attachment.next_run_at.unwrap() + ChronoDuration::minutes(5);
        assert_eq!(ctx.scheduler.scan_once(late).await.unwrap(), 0);

        let quarantined = ctx.manager.get(attachment.id).await.unwrap();
        assert!(quarantined.schedule_error.is_some());
        assert!(quarantined.next_run_at.is_none());

        // And it stays out of subsequent scans.
        assert_eq!(ctx.scheduler.scan_once(late).await.unwrap(), 0);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subsequent_due_times_emit_again() {
        let ctx = create_test_context().await;
        let (_, attachment) = minutely_attachment(&ctx).await;

        let due_at = attachment.next_run_at.unwrap();
        let first = due_at + ChronoDuration::seconds(1);
        assert_eq!(ctx.scheduler.scan_once(first).await.unwrap(), 1);

        for _ in 0..200 {
            let page = ctx
                .history
                .query(&HistoryFilter {
                    attachment_id: Some(attachment.id),
                    status: Some(ExecutionStatus::Success),
                    ..HistoryFilter::default()
                })
                .await
                .unwrap();
            if page.total == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A later scan emits again once the due time comes around.
        let second = first + ChronoDuration::minutes(1);
        assert_eq!(ctx.scheduler.scan_once(second).await.unwrap(), 1);
    }
}
