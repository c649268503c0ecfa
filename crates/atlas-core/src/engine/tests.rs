use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::attachments::{Attachment, AttachmentManager, AttachmentState};
use crate::config::EngineConfig;
use crate::controllers::{
    Controller, ControllerKind, ControllerRegistry, NewController, NotificationHook,
    NotificationTarget, RetryPolicy,
};
use crate::db;
use crate::error::Error;
use crate::hierarchy::{ObjectRef, ObjectType, StaticHierarchy};
use crate::history::{ExecutionRecord, ExecutionStatus, HistoryFilter, HistoryStore};
use crate::notify::{Notifier, RunNotification};

use super::*;

struct TestContext {
    registry: Arc<ControllerRegistry>,
    manager: Arc<AttachmentManager>,
    history: HistoryStore,
    notifications: Arc<Mutex<Vec<RunNotification>>>,
    _dir: TempDir,
}

struct RecordingNotifier {
    sink: Arc<Mutex<Vec<RunNotification>>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        _target: &NotificationTarget,
        payload: &RunNotification,
    ) -> anyhow::Result<()> {
        self.sink.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct CountingCollector {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Collector for CountingCollector {
    async fn collect(&self, _ctx: &CollectionContext) -> Result<String, CollectError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("collected on call {}", n))
    }
}

struct AlwaysFailing {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Collector for AlwaysFailing {
    async fn collect(&self, _ctx: &CollectionContext) -> Result<String, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CollectError::transient("upstream returned 503"))
    }
}

struct TerminalFailing {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Collector for TerminalFailing {
    async fn collect(&self, _ctx: &CollectionContext) -> Result<String, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CollectError::terminal("credentials rejected"))
    }
}

struct BlockingCollector {
    started: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl Collector for BlockingCollector {
    async fn collect(&self, _ctx: &CollectionContext) -> Result<String, CollectError> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok("released".to_string())
    }
}

struct SlowCollector {
    duration: Duration,
}

#[async_trait]
impl Collector for SlowCollector {
    async fn collect(&self, _ctx: &CollectionContext) -> Result<String, CollectError> {
        tokio::time::sleep(self.duration).await;
        Ok("too late".to_string())
    }
}

async fn create_test_context(
    collectors: CollectorSet,
    config: EngineConfig,
) -> (TestContext, ExecutionEngine) {
    let dir = TempDir::new().unwrap();
    let pool = db::connect(&dir.path().join("atlas.db")).await.unwrap();

    let registry = Arc::new(ControllerRegistry::new(pool.clone()));
    let history = HistoryStore::new(pool.clone());
    let directory = Arc::new(StaticHierarchy::with_objects([
        ObjectRef::new(ObjectType::Region, "GA"),
        ObjectRef::new(ObjectType::Record, "GA/fulton/14-0012-0008"),
    ]));
    let manager = Arc::new(AttachmentManager::new(pool, directory, history.clone()));

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(RecordingNotifier {
        sink: notifications.clone(),
    });

    let engine = ExecutionEngine::new(
        registry.clone(),
        manager.clone(),
        history.clone(),
        Arc::new(collectors),
        notifier,
        config,
    );

    (
        TestContext {
            registry,
            manager,
            history,
            notifications,
            _dir: dir,
        },
        engine,
    )
}

async fn attached(
    ctx: &TestContext,
    retry: RetryPolicy,
    hooks: Vec<NotificationHook>,
) -> (Controller, Attachment) {
    let controller = ctx
        .registry
        .create(NewController {
            name: format!("controller-{}", Uuid::new_v4()),
            kind: Some(ControllerKind::Property),
            retry,
            hooks,
            ..NewController::default()
        })
        .await
        .unwrap();

    let attachment = ctx
        .manager
        .attach(
            controller.id,
            ObjectRef::new(ObjectType::Region, "GA"),
            Value::Null,
        )
        .await
        .unwrap();

    (controller, attachment)
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        enabled: false,
        ..RetryPolicy::default()
    }
}

fn failure_hook() -> Vec<NotificationHook> {
    vec![NotificationHook {
        target: NotificationTarget::Log,
        on_success: false,
        on_failure: true,
    }]
}

/// Poll history until the attachment has `expected` records with the given
/// status, advancing the (possibly paused) clock while waiting.
async fn wait_for_records(
    ctx: &TestContext,
    attachment_id: Uuid,
    status: ExecutionStatus,
    expected: i64,
) {
    for _ in 0..400 {
        let page = ctx
            .history
            .query(&HistoryFilter {
                attachment_id: Some(attachment_id),
                status: Some(status),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        if page.total >= expected {
            assert_eq!(page.total, expected);
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "timed out waiting for {} {} record(s) on attachment {}",
        expected, status, attachment_id
    );
}

#[tokio::test(start_paused = true)]
async fn manual_success_updates_history_and_bookkeeping() {
    let calls = Arc::new(AtomicU32::new(0));
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(CountingCollector {
            calls: calls.clone(),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (_, attachment) = attached(&ctx, no_retry(), vec![]).await;

    let outcome = engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Accepted { .. }));

    wait_for_records(&ctx, attachment.id, ExecutionStatus::Success, 1).await;

    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].attempt, 1);
    assert_eq!(
        page.records[0].summary.as_deref(),
        Some("collected on call 1")
    );
    assert!(!page.records[0].orphaned);

    // The slot release and lastRun bookkeeping land just after the record
    // finalizes; give the run task a moment to settle.
    for _ in 0..100 {
        let settled = ctx.manager.get(attachment.id).await.unwrap().last_run_at.is_some()
            && engine.current_state(attachment.id) == AttachmentState::Idle;
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let refreshed = ctx.manager.get(attachment.id).await.unwrap();
    assert!(refreshed.last_run_at.is_some());
    assert_eq!(engine.current_state(attachment.id), AttachmentState::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_entities_are_rejected_without_records() {
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(CountingCollector {
            calls: Arc::new(AtomicU32::new(0)),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (controller, attachment) = attached(&ctx, no_retry(), vec![]).await;

    ctx.registry.set_enabled(controller.id, false).await.unwrap();
    assert!(matches!(
        engine
            .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
            .await,
        Err(Error::Disabled { entity: "controller", .. })
    ));

    ctx.registry.set_enabled(controller.id, true).await.unwrap();
    ctx.manager.set_enabled(attachment.id, false).await.unwrap();
    assert!(matches!(
        engine
            .trigger(attachment.id, TriggerMode::Scheduled, TriggerPriority::Normal)
            .await,
        Err(Error::Disabled { entity: "attachment", .. })
    ));

    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_coalesce_to_one_run() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(BlockingCollector {
            started: started.clone(),
            gate: gate.clone(),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (_, attachment) = attached(&ctx, no_retry(), vec![]).await;

    let outcome = engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Accepted { .. }));
    started.notified().await;
    assert_eq!(engine.current_state(attachment.id), AttachmentState::Running);

    // Manual collision is an error the operator sees.
    assert!(matches!(
        engine
            .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
            .await,
        Err(Error::AlreadyRunning { .. })
    ));

    // Scheduler and event triggers are silently dropped.
    assert_eq!(
        engine
            .trigger(attachment.id, TriggerMode::Scheduled, TriggerPriority::Normal)
            .await
            .unwrap(),
        TriggerOutcome::Coalesced
    );
    assert_eq!(
        engine
            .trigger(attachment.id, TriggerMode::Event, TriggerPriority::Normal)
            .await
            .unwrap(),
        TriggerOutcome::Coalesced
    );

    gate.notify_one();
    wait_for_records(&ctx, attachment.id, ExecutionStatus::Success, 1).await;

    // Exactly one record for the whole volley.
    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff_and_notify_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(AlwaysFailing {
            calls: calls.clone(),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (_, attachment) = attached(
        &ctx,
        RetryPolicy {
            enabled: true,
            max_attempts: 3,
            base_delay_secs: 1,
            multiplier: 2.0,
            max_delay_secs: 3600,
        },
        failure_hook(),
    )
    .await;

    let mut events = engine.subscribe();
    let virtual_start = tokio::time::Instant::now();

    engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();

    wait_for_records(&ctx, attachment.id, ExecutionStatus::Failed, 3).await;

    // 1s + 2s of backoff must have elapsed on the virtual clock.
    assert!(virtual_start.elapsed() >= Duration::from_secs(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The armed delays follow base × multiplier^(n-1).
    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::RetryScheduled { delay, .. } = event {
            delays.push(delay);
        }
    }
    assert_eq!(
        delays,
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );

    // Exactly one failure notification, after the final attempt.
    for _ in 0..100 {
        if !ctx.notifications.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let notifications = ctx.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].outcome, ExecutionStatus::Failed);
    assert_eq!(notifications[0].attempts, 3);

    // All three attempts share one run correlation id.
    drop(notifications);
    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    let run_ids: std::collections::HashSet<_> =
        page.records.iter().map(|r| r.run_id).collect();
    assert_eq!(run_ids.len(), 1);
    assert_eq!(
        page.records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
}

#[tokio::test(start_paused = true)]
async fn terminal_error_short_circuits_remaining_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(TerminalFailing {
            calls: calls.clone(),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (_, attachment) = attached(
        &ctx,
        RetryPolicy {
            enabled: true,
            max_attempts: 5,
            base_delay_secs: 1,
            multiplier: 2.0,
            max_delay_secs: 3600,
        },
        failure_hook(),
    )
    .await;

    engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();

    wait_for_records(&ctx, attachment.id, ExecutionStatus::Failed, 1).await;
    // Let any stray retry arming surface before asserting.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let notifications = ctx.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_is_a_failed_attempt() {
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(SlowCollector {
            duration: Duration::from_secs(600),
        }),
    );
    let config = EngineConfig::new().with_run_timeout(1);
    let (ctx, engine) = create_test_context(collectors, config).await;
    let (_, attachment) = attached(&ctx, no_retry(), vec![]).await;

    engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();

    wait_for_records(&ctx, attachment.id, ExecutionStatus::Failed, 1).await;

    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert!(page.records[0]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn detach_cancels_pending_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(AlwaysFailing {
            calls: calls.clone(),
        }),
    );
    let config = EngineConfig::new().with_run_timeout(3600);
    let (ctx, engine) = create_test_context(collectors, config).await;
    let (controller, attachment) = attached(
        &ctx,
        RetryPolicy {
            enabled: true,
            max_attempts: 3,
            base_delay_secs: 60,
            multiplier: 2.0,
            max_delay_secs: 3600,
        },
        failure_hook(),
    )
    .await;

    engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();

    // First attempt fails and the retry is armed.
    wait_for_records(&ctx, attachment.id, ExecutionStatus::Failed, 1).await;
    wait_for_records(&ctx, attachment.id, ExecutionStatus::Scheduled, 1).await;
    assert_eq!(
        engine.current_state(attachment.id),
        AttachmentState::RetryPending
    );

    ctx.manager.detach(controller.id, &attachment.object).await.unwrap();

    // Ride well past the backoff; the cancelled retry must not run.
    tokio::time::sleep(Duration::from_secs(180)).await;

    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].status, ExecutionStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.current_state(attachment.id), AttachmentState::Idle);
    assert!(ctx.notifications.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disable_during_backoff_suppresses_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(AlwaysFailing {
            calls: calls.clone(),
        }),
    );
    let config = EngineConfig::new().with_run_timeout(3600);
    let (ctx, engine) = create_test_context(collectors, config).await;
    let (_, attachment) = attached(
        &ctx,
        RetryPolicy {
            enabled: true,
            max_attempts: 3,
            base_delay_secs: 60,
            multiplier: 2.0,
            max_delay_secs: 3600,
        },
        vec![],
    )
    .await;

    engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();

    wait_for_records(&ctx, attachment.id, ExecutionStatus::Scheduled, 1).await;
    ctx.manager.set_enabled(attachment.id, false).await.unwrap();

    tokio::time::sleep(Duration::from_secs(180)).await;

    // The armed record was finalized as suppressed; the collector never ran
    // a second time.
    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert!(page
        .records
        .iter()
        .any(|r| r.error.as_deref().map_or(false, |e| e.contains("suppressed"))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn outcome_after_detach_is_orphaned() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(BlockingCollector {
            started: started.clone(),
            gate: gate.clone(),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (controller, attachment) = attached(
        &ctx,
        no_retry(),
        vec![NotificationHook {
            target: NotificationTarget::Log,
            on_success: true,
            on_failure: true,
        }],
    )
    .await;

    engine
        .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
        .await
        .unwrap();
    started.notified().await;

    // Detach while the collector is in flight: the run is not aborted.
    ctx.manager.detach(controller.id, &attachment.object).await.unwrap();
    gate.notify_one();

    wait_for_records(&ctx, attachment.id, ExecutionStatus::Success, 1).await;

    let page = ctx
        .history
        .query(&HistoryFilter::for_attachment(attachment.id))
        .await
        .unwrap();
    assert!(page.records[0].orphaned);
    // Orphaned outcomes do not notify.
    assert!(ctx.notifications.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_collector_is_a_validation_error() {
    let (ctx, engine) = create_test_context(CollectorSet::new(), EngineConfig::default()).await;
    let (_, attachment) = attached(&ctx, no_retry(), vec![]).await;

    assert!(matches!(
        engine
            .trigger(attachment.id, TriggerMode::Manual, TriggerPriority::Normal)
            .await,
        Err(Error::Validation { field: "kind", .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn recover_finalizes_interrupted_and_rearms_scheduled() {
    let calls = Arc::new(AtomicU32::new(0));
    let collectors = CollectorSet::new().register(
        ControllerKind::Property,
        Arc::new(CountingCollector {
            calls: calls.clone(),
        }),
    );
    let (ctx, engine) = create_test_context(collectors, EngineConfig::default()).await;
    let (controller, attachment) = attached(&ctx, RetryPolicy::default(), vec![]).await;

    // State left behind by a dead process: an attempt that was mid-flight,
    // and an armed retry that never started.
    let interrupted =
        ExecutionRecord::started(Uuid::new_v4(), attachment.id, controller.id, 1, Utc::now());
    ctx.history.append(&interrupted).await.unwrap();

    let (_, other_attachment) = attached(&ctx, RetryPolicy::default(), vec![]).await;
    let armed = ExecutionRecord::scheduled(
        Uuid::new_v4(),
        other_attachment.id,
        other_attachment.controller_id,
        2,
        Utc::now() - chrono::Duration::seconds(5),
    );
    ctx.history.append(&armed).await.unwrap();

    engine.recover().await.unwrap();

    let failed = ctx.history.get(interrupted.id).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("interrupted"));

    wait_for_records(&ctx, other_attachment.id, ExecutionStatus::Success, 1).await;
    let recovered = ctx.history.get(armed.id).await.unwrap();
    assert_eq!(recovered.status, ExecutionStatus::Success);
    assert_eq!(recovered.attempt, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
