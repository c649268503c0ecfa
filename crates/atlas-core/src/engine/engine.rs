//! Execution engine
//!
//! Single entry point for starting runs (scheduled, manual, or event
//! triggered), with:
//! - at-most-one concurrent run per attachment (atomic keyed slots)
//! - an engine-wide concurrency gate for collector invocations
//! - per-invocation timeouts
//! - deferred backoff retries, never inline
//! - exactly-once terminal notifications

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attachments::{AttachmentManager, AttachmentState};
use crate::config::EngineConfig;
use crate::controllers::{Controller, ControllerRegistry};
use crate::error::{Error, Result};
use crate::history::{ExecutionRecord, ExecutionStatus, HistoryStore};
use crate::notify::{Notifier, RunNotification};

use super::collector::{CollectError, CollectionContext, Collector, CollectorSet};

/// How a run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Operator-initiated
    Manual,
    /// Emitted by the scheduler's scan
    Scheduled,
    /// Reaction to an external event
    Event,
}

/// Scheduling weight of a trigger. High-priority runs skip the engine-wide
/// concurrency gate instead of waiting for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerPriority {
    /// Waits for a concurrency slot
    #[default]
    Normal,
    /// Bypasses the concurrency gate
    High,
}

/// Result of a trigger call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new run was admitted
    Accepted {
        /// Correlation ID of the admitted run
        run_id: Uuid,
    },
    /// A scheduled/event trigger found a run already in flight and was
    /// silently dropped
    Coalesced,
}

/// Engine lifecycle events, broadcast to any number of subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An attempt started executing
    RunStarted {
        /// Attachment being executed
        attachment_id: Uuid,
        /// Run correlation ID
        run_id: Uuid,
        /// Attempt number
        attempt: u32,
    },
    /// A retry was armed after a failed attempt
    RetryScheduled {
        /// Attachment being executed
        attachment_id: Uuid,
        /// Run correlation ID
        run_id: Uuid,
        /// Attempt number the retry will carry
        attempt: u32,
        /// Backoff delay before it starts
        delay: std::time::Duration,
    },
    /// A logical run reached a terminal outcome
    RunFinished {
        /// Attachment that was executed
        attachment_id: Uuid,
        /// Run correlation ID
        run_id: Uuid,
        /// Terminal status
        status: ExecutionStatus,
        /// Attempts the run took
        attempts: u32,
    },
}

/// Occupied while a logical run (including armed retries) is in flight.
struct RunSlot {
    run_id: Uuid,
    state: AttachmentState,
}

/// Frees the per-attachment slot when the logical run ends, however it ends.
struct SlotGuard {
    slots: Arc<DashMap<Uuid, RunSlot>>,
    attachment_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.remove(&self.attachment_id);
    }
}

/// Orchestrates run admission, execution, retries, and outcome reporting.
///
/// Cheap to clone: every field is a shared handle, so spawned run tasks
/// carry their own copy.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<ControllerRegistry>,
    attachments: Arc<AttachmentManager>,
    history: HistoryStore,
    collectors: Arc<CollectorSet>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    slots: Arc<DashMap<Uuid, RunSlot>>,
    semaphore: Arc<Semaphore>,
    events: broadcast::Sender<EngineEvent>,
}

impl ExecutionEngine {
    /// Create a new engine.
    pub fn new(
        registry: Arc<ControllerRegistry>,
        attachments: Arc<AttachmentManager>,
        history: HistoryStore,
        collectors: Arc<CollectorSet>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            registry,
            attachments,
            history,
            collectors,
            notifier,
            config,
            slots: Arc::new(DashMap::new()),
            semaphore,
            events,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Live run state of an attachment.
    pub fn current_state(&self, attachment_id: Uuid) -> AttachmentState {
        self.slots
            .get(&attachment_id)
            .map(|slot| slot.state)
            .unwrap_or(AttachmentState::Idle)
    }

    /// Request a run for an attachment.
    ///
    /// Fails with `Disabled` when the attachment or its controller is
    /// disabled, with `AlreadyRunning` when a manual trigger collides with a
    /// run in flight; scheduled/event triggers colliding the same way are
    /// coalesced instead. An accepted trigger snapshots the merged
    /// configuration and executes on its own task; this call never waits for
    /// the run.
    pub async fn trigger(
        &self,
        attachment_id: Uuid,
        mode: TriggerMode,
        priority: TriggerPriority,
    ) -> Result<TriggerOutcome> {
        let attachment = self.attachments.get(attachment_id).await?;
        let controller = self.registry.get(attachment.controller_id).await?;

        if !controller.enabled {
            return Err(Error::Disabled {
                entity: "controller",
                id: controller.id,
            });
        }
        if !attachment.enabled {
            return Err(Error::Disabled {
                entity: "attachment",
                id: attachment.id,
            });
        }

        let collector = self.collectors.get(controller.kind).ok_or_else(|| {
            Error::validation(
                "kind",
                format!("no collector registered for kind {}", controller.kind),
            )
        })?;

        let config = controller.config.merged(&attachment.overlay);
        let missing = controller.config.missing_required(&config);
        if !missing.is_empty() {
            return Err(Error::validation(
                "config",
                format!("missing required parameters: {}", missing.join(", ")),
            ));
        }

        // Atomic check-and-set on the per-attachment slot. This is the only
        // state shared between the scheduler's scan and foreground triggers.
        let run_id = Uuid::new_v4();
        match self.slots.entry(attachment_id) {
            Entry::Occupied(_) => {
                return match mode {
                    TriggerMode::Manual => Err(Error::AlreadyRunning { attachment_id }),
                    _ => {
                        debug!(
                            "Coalesced {:?} trigger for attachment {}: run already in flight",
                            mode, attachment_id
                        );
                        Ok(TriggerOutcome::Coalesced)
                    }
                };
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RunSlot {
                    run_id,
                    state: AttachmentState::Running,
                });
            }
        }
        let guard = SlotGuard {
            slots: self.slots.clone(),
            attachment_id,
        };

        let started_at = Utc::now();
        let record =
            ExecutionRecord::started(run_id, attachment_id, controller.id, 1, started_at);
        // Guard drops on error, freeing the slot.
        self.history.append(&record).await?;

        let ctx = CollectionContext {
            run_id,
            attachment_id,
            controller_id: controller.id,
            kind: controller.kind,
            object: attachment.object.clone(),
            config,
            attempt: 1,
            started_at,
        };

        info!(
            "Starting run {} for controller {} on {} ({:?} trigger)",
            run_id, controller.name, attachment.object, mode
        );

        let engine = self.clone();
        let record_id = record.id;
        tokio::spawn(async move {
            engine
                .attempt_loop(guard, controller, collector, ctx, priority, record_id)
                .await;
        });

        Ok(TriggerOutcome::Accepted { run_id })
    }

    /// Re-attach in-flight state found in the history at startup: interrupted
    /// Running records are finalized Failed, armed Scheduled retries are
    /// re-armed.
    pub async fn recover(&self) -> Result<()> {
        let open = self.history.non_terminal().await?;
        for record in open {
            match record.status {
                ExecutionStatus::Running => {
                    self.history
                        .finalize(
                            record.id,
                            ExecutionStatus::Failed,
                            Some("interrupted by shutdown"),
                            None,
                            false,
                        )
                        .await?;
                    warn!(
                        "Finalized interrupted execution record {} (run {})",
                        record.id, record.run_id
                    );
                }
                ExecutionStatus::Scheduled => {
                    let record_id = record.id;
                    if let Err(e) = self.rearm(record).await {
                        warn!("Dropping unrecoverable retry record {}: {}", record_id, e);
                        let _ = self
                            .history
                            .finalize(
                                record_id,
                                ExecutionStatus::Failed,
                                Some(&format!("not recoverable: {}", e)),
                                None,
                                false,
                            )
                            .await;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-arm one recovered Scheduled record.
    ///
    /// The original trigger-time snapshot is gone with the process, so the
    /// retry re-merges the current template and overlay.
    async fn rearm(&self, record: ExecutionRecord) -> Result<()> {
        let attachment = self.attachments.get(record.attachment_id).await?;
        let controller = self.registry.get(record.controller_id).await?;
        if !controller.enabled || !attachment.enabled {
            return Err(Error::Disabled {
                entity: "attachment",
                id: attachment.id,
            });
        }
        let collector = self.collectors.get(controller.kind).ok_or_else(|| {
            Error::validation(
                "kind",
                format!("no collector registered for kind {}", controller.kind),
            )
        })?;

        match self.slots.entry(record.attachment_id) {
            Entry::Occupied(_) => {
                return Err(Error::AlreadyRunning {
                    attachment_id: record.attachment_id,
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RunSlot {
                    run_id: record.run_id,
                    state: AttachmentState::RetryPending,
                });
            }
        }
        let guard = SlotGuard {
            slots: self.slots.clone(),
            attachment_id: record.attachment_id,
        };

        let ctx = CollectionContext {
            run_id: record.run_id,
            attachment_id: record.attachment_id,
            controller_id: record.controller_id,
            kind: controller.kind,
            object: attachment.object.clone(),
            config: controller.config.merged(&attachment.overlay),
            attempt: record.attempt,
            started_at: record.started_at,
        };

        let delay = (record.started_at - Utc::now()).to_std().unwrap_or_default();
        info!(
            "Re-armed recovered retry {} (run {}, attempt {}) due in {:?}",
            record.id, record.run_id, record.attempt, delay
        );

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let started_at = Utc::now();
            match engine.history.mark_running(record.id, started_at).await {
                Ok(true) => {
                    let mut ctx = ctx;
                    ctx.started_at = started_at;
                    engine
                        .attempt_loop(
                            guard,
                            controller,
                            collector,
                            ctx,
                            TriggerPriority::Normal,
                            record.id,
                        )
                        .await;
                }
                Ok(false) => debug!("Recovered retry {} was cancelled before start", record.id),
                Err(e) => error!("Failed to start recovered retry {}: {}", record.id, e),
            }
        });

        Ok(())
    }

    /// Drive one logical run to its terminal outcome. `record_id` must refer
    /// to a record already in Running state.
    async fn attempt_loop(
        &self,
        _guard: SlotGuard,
        controller: Controller,
        collector: Arc<dyn Collector>,
        mut ctx: CollectionContext,
        priority: TriggerPriority,
        mut record_id: Uuid,
    ) {
        loop {
            self.set_slot_state(ctx.attachment_id, ctx.run_id, AttachmentState::Running);
            self.publish(EngineEvent::RunStarted {
                attachment_id: ctx.attachment_id,
                run_id: ctx.run_id,
                attempt: ctx.attempt,
            });

            let outcome = self.invoke_collector(collector.as_ref(), &ctx, priority).await;

            // A detach issued while the collector ran does not abort it, but
            // it orphans the outcome and suppresses retries.
            let orphaned = self.attachments.get(ctx.attachment_id).await.is_err();

            match outcome {
                Ok(summary) => {
                    self.finalize_quietly(
                        record_id,
                        ExecutionStatus::Success,
                        None,
                        Some(&summary),
                        orphaned,
                    )
                    .await;

                    if orphaned {
                        warn!(
                            "Run {} finished after detachment; outcome recorded as orphaned",
                            ctx.run_id
                        );
                    } else {
                        if let Err(e) = self
                            .attachments
                            .record_completion(ctx.attachment_id, Utc::now())
                            .await
                        {
                            error!(
                                "Failed to record completion for attachment {}: {}",
                                ctx.attachment_id, e
                            );
                        }
                        self.dispatch_hooks(
                            &controller,
                            &ctx,
                            ExecutionStatus::Success,
                            Some(summary),
                            None,
                        );
                    }

                    self.publish(EngineEvent::RunFinished {
                        attachment_id: ctx.attachment_id,
                        run_id: ctx.run_id,
                        status: ExecutionStatus::Success,
                        attempts: ctx.attempt,
                    });
                    return;
                }
                Err(err) => {
                    let detail = err.to_string();
                    self.finalize_quietly(
                        record_id,
                        ExecutionStatus::Failed,
                        Some(&detail),
                        None,
                        orphaned,
                    )
                    .await;

                    let policy = &controller.retry;
                    let retryable =
                        !err.is_terminal() && policy.enabled && ctx.attempt < policy.max_attempts;

                    if orphaned || !retryable {
                        if orphaned {
                            warn!(
                                "Run {} failed after detachment; retries suppressed",
                                ctx.run_id
                            );
                        } else {
                            info!(
                                "Run {} failed terminally after {} attempt(s): {}",
                                ctx.run_id, ctx.attempt, detail
                            );
                            self.dispatch_hooks(
                                &controller,
                                &ctx,
                                ExecutionStatus::Failed,
                                None,
                                Some(detail),
                            );
                        }
                        self.publish(EngineEvent::RunFinished {
                            attachment_id: ctx.attachment_id,
                            run_id: ctx.run_id,
                            status: ExecutionStatus::Failed,
                            attempts: ctx.attempt,
                        });
                        return;
                    }

                    // Arm the next attempt. The retry is a deferred task, not
                    // an inline loop over the collector.
                    let delay = policy.delay_for_retry(ctx.attempt);
                    let due_at = Utc::now()
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(policy.max_delay_secs as i64));
                    let scheduled = ExecutionRecord::scheduled(
                        ctx.run_id,
                        ctx.attachment_id,
                        ctx.controller_id,
                        ctx.attempt + 1,
                        due_at,
                    );
                    if let Err(e) = self.history.append(&scheduled).await {
                        error!("Failed to arm retry for run {}: {}", ctx.run_id, e);
                        self.dispatch_hooks(
                            &controller,
                            &ctx,
                            ExecutionStatus::Failed,
                            None,
                            Some(detail),
                        );
                        self.publish(EngineEvent::RunFinished {
                            attachment_id: ctx.attachment_id,
                            run_id: ctx.run_id,
                            status: ExecutionStatus::Failed,
                            attempts: ctx.attempt,
                        });
                        return;
                    }

                    record_id = scheduled.id;
                    ctx.attempt += 1;
                    self.set_slot_state(
                        ctx.attachment_id,
                        ctx.run_id,
                        AttachmentState::RetryPending,
                    );
                    self.publish(EngineEvent::RetryScheduled {
                        attachment_id: ctx.attachment_id,
                        run_id: ctx.run_id,
                        attempt: ctx.attempt,
                        delay,
                    });
                    debug!(
                        "Run {} attempt {} failed ({}); retrying in {:?}",
                        ctx.run_id,
                        ctx.attempt - 1,
                        detail,
                        delay
                    );

                    tokio::time::sleep(delay).await;

                    // A detach during the backoff deleted the armed record;
                    // stop without appending anything further.
                    let started_at = Utc::now();
                    match self.history.mark_running(record_id, started_at).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("Retry for run {} was cancelled; stopping", ctx.run_id);
                            return;
                        }
                        Err(e) => {
                            error!("Failed to start retry for run {}: {}", ctx.run_id, e);
                            return;
                        }
                    }

                    // A disable (without detach) during the backoff also
                    // suppresses the retry.
                    if !self.still_runnable(&controller, ctx.attachment_id).await {
                        self.finalize_quietly(
                            record_id,
                            ExecutionStatus::Failed,
                            Some("retry suppressed: attachment or controller disabled"),
                            None,
                            false,
                        )
                        .await;
                        self.publish(EngineEvent::RunFinished {
                            attachment_id: ctx.attachment_id,
                            run_id: ctx.run_id,
                            status: ExecutionStatus::Failed,
                            attempts: ctx.attempt,
                        });
                        return;
                    }

                    ctx.started_at = started_at;
                }
            }
        }
    }

    /// Invoke the collector under the concurrency gate and timeout.
    async fn invoke_collector(
        &self,
        collector: &dyn Collector,
        ctx: &CollectionContext,
        priority: TriggerPriority,
    ) -> std::result::Result<String, CollectError> {
        let _permit = match priority {
            TriggerPriority::High => None,
            TriggerPriority::Normal => match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Err(CollectError::transient("engine is shutting down")),
            },
        };

        let timeout = self.config.run_timeout();
        match tokio::time::timeout(timeout, collector.collect(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Transient(format!(
                "timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Whether the attachment and its controller are still attached and
    /// enabled (re-read, not the trigger-time copies).
    async fn still_runnable(&self, controller: &Controller, attachment_id: Uuid) -> bool {
        let attachment_ok = matches!(
            self.attachments.get(attachment_id).await,
            Ok(attachment) if attachment.enabled
        );
        let controller_ok = matches!(
            self.registry.get(controller.id).await,
            Ok(current) if current.enabled
        );
        attachment_ok && controller_ok
    }

    /// Fire matching notification hooks, fire-and-forget.
    fn dispatch_hooks(
        &self,
        controller: &Controller,
        ctx: &CollectionContext,
        outcome: ExecutionStatus,
        summary: Option<String>,
        error: Option<String>,
    ) {
        let targets: Vec<_> = controller
            .hooks
            .iter()
            .filter(|hook| match outcome {
                ExecutionStatus::Success => hook.on_success,
                _ => hook.on_failure,
            })
            .map(|hook| hook.target.clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        let payload = RunNotification {
            run_id: ctx.run_id,
            attachment_id: ctx.attachment_id,
            controller_id: controller.id,
            controller_name: controller.name.clone(),
            kind: controller.kind,
            object: ctx.object.clone(),
            outcome,
            attempts: ctx.attempt,
            summary,
            error,
            finished_at: Utc::now(),
        };

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            for target in targets {
                if let Err(e) = notifier.notify(&target, &payload).await {
                    warn!("Notification delivery failed: {}", e);
                }
            }
        });
    }

    async fn finalize_quietly(
        &self,
        record_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        summary: Option<&str>,
        orphaned: bool,
    ) {
        match self
            .history
            .finalize(record_id, status, error, summary, orphaned)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Record {} already finalized or cancelled", record_id),
            Err(e) => error!("Failed to finalize record {}: {}", record_id, e),
        }
    }

    fn set_slot_state(&self, attachment_id: Uuid, run_id: Uuid, state: AttachmentState) {
        if let Some(mut slot) = self.slots.get_mut(&attachment_id) {
            slot.run_id = run_id;
            slot.state = state;
        }
    }

    fn publish(&self, event: EngineEvent) {
        // send() errors when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }
}
