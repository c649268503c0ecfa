//! Orchestrator facade
//!
//! Wires the registry, attachment manager, history store, execution engine,
//! and scheduler into one object exposing the orchestration surface the
//! UI/API layer consumes.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::attachments::{Attachment, AttachmentManager, AttachmentStatus};
use crate::config::AtlasConfig;
use crate::controllers::{
    Controller, ControllerRegistry, ControllerUpdate, NewController,
};
use crate::db;
use crate::engine::{
    CollectorSet, EngineEvent, ExecutionEngine, TriggerMode, TriggerOutcome, TriggerPriority,
};
use crate::error::Result;
use crate::hierarchy::{HierarchyDirectory, ObjectRef};
use crate::history::{HistoryFilter, HistoryPage, HistoryStore};
use crate::notify::Notifier;
use crate::scheduler::Scheduler;

/// The assembled orchestration engine.
pub struct Orchestrator {
    registry: Arc<ControllerRegistry>,
    attachments: Arc<AttachmentManager>,
    history: HistoryStore,
    engine: ExecutionEngine,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    /// Open the database named by `config` and assemble the orchestrator.
    pub async fn open(
        config: AtlasConfig,
        directory: Arc<dyn HierarchyDirectory>,
        collectors: CollectorSet,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let pool = db::connect(&config.database_path).await?;
        Ok(Self::with_pool(pool, config, directory, collectors, notifier))
    }

    /// Assemble the orchestrator over an already-migrated pool.
    pub fn with_pool(
        pool: sqlx::Pool<sqlx::Sqlite>,
        config: AtlasConfig,
        directory: Arc<dyn HierarchyDirectory>,
        collectors: CollectorSet,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = Arc::new(ControllerRegistry::new(pool.clone()));
        let history = HistoryStore::new(pool.clone());
        let attachments = Arc::new(AttachmentManager::new(pool, directory, history.clone()));

        let engine = ExecutionEngine::new(
            registry.clone(),
            attachments.clone(),
            history.clone(),
            Arc::new(collectors),
            notifier,
            config.engine,
        );

        let scheduler = Arc::new(Scheduler::new(
            attachments.clone(),
            engine.clone(),
            config.scheduler,
        ));

        Self {
            registry,
            attachments,
            history,
            engine,
            scheduler,
        }
    }

    /// Recover in-flight state from the history and spawn the scheduler's
    /// tick loop. Returns once the background task is running.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.engine.recover().await?;

        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(shutdown).await {
                error!("Scheduler error: {}", e);
            }
        });

        Ok(())
    }

    // ----- controllers -----

    /// Register a controller.
    pub async fn create_controller(&self, definition: NewController) -> Result<Controller> {
        self.registry.create(definition).await
    }

    /// Partially update a controller.
    pub async fn update_controller(
        &self,
        id: Uuid,
        update: ControllerUpdate,
    ) -> Result<Controller> {
        self.registry.update(id, update).await
    }

    /// Delete a controller with no remaining attachments.
    pub async fn delete_controller(&self, id: Uuid) -> Result<()> {
        self.registry.delete(id).await
    }

    /// Get a controller.
    pub async fn get_controller(&self, id: Uuid) -> Result<Controller> {
        self.registry.get(id).await
    }

    /// List all controllers.
    pub async fn list_controllers(&self) -> Result<Vec<Controller>> {
        self.registry.list().await
    }

    // ----- attachments -----

    /// Attach a controller to a hierarchy node (idempotent upsert).
    pub async fn attach(
        &self,
        controller_id: Uuid,
        object: ObjectRef,
        overlay: serde_json::Value,
    ) -> Result<Attachment> {
        self.attachments.attach(controller_id, object, overlay).await
    }

    /// Detach a controller from a hierarchy node.
    pub async fn detach(&self, controller_id: Uuid, object: &ObjectRef) -> Result<()> {
        self.attachments.detach(controller_id, object).await
    }

    /// Attachments bound to one hierarchy node.
    pub async fn list_attachments_for_object(
        &self,
        object: &ObjectRef,
    ) -> Result<Vec<Attachment>> {
        self.attachments.list_for_object(object).await
    }

    /// Attachments of one controller.
    pub async fn list_attachments_for_controller(
        &self,
        controller_id: Uuid,
    ) -> Result<Vec<Attachment>> {
        self.attachments.list_for_controller(controller_id).await
    }

    // ----- execution -----

    /// Request a run for an attachment.
    pub async fn trigger_execution(
        &self,
        attachment_id: Uuid,
        mode: TriggerMode,
        priority: TriggerPriority,
    ) -> Result<TriggerOutcome> {
        self.engine.trigger(attachment_id, mode, priority).await
    }

    /// Query the execution history.
    pub async fn get_execution_history(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        self.history.query(filter).await
    }

    /// Status snapshot of one attachment.
    pub async fn get_attachment_status(&self, attachment_id: Uuid) -> Result<AttachmentStatus> {
        let attachment = self.attachments.get(attachment_id).await?;
        Ok(AttachmentStatus {
            attachment_id,
            enabled: attachment.enabled,
            last_run_at: attachment.last_run_at,
            next_run_at: attachment.next_run_at,
            current_state: self.engine.current_state(attachment_id),
        })
    }

    /// Subscribe to engine lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe()
    }

    /// The scheduler, for embedders that drive scans on their own clock.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
