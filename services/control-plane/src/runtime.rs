//! Wiring of the control plane's long-running parts.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent_client::WorkerAgentClient;
use crate::api;
use crate::config::{Config, StoreBackend};
use crate::controller::{
    ControllerWorker, HeartbeatProcessor, LivenessMonitor, ModelReconciler, ReconcileTrigger,
};
use crate::db::{Database, MemoryStore, PgStore, StateStore, StoreError};
use crate::scheduler::Scheduler;
use crate::state::AppState;

/// Opens the configured store, running migrations in dev mode.
pub async fn open_store(config: &Config) -> Result<Arc<dyn StateStore>, StoreError> {
    match config.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let db = Database::connect(&config.database).await?;
            info!("Database connection established");
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                db.run_migrations().await?;
            }
            Ok(Arc::new(PgStore::new(db)))
        }
    }
}

/// HTTP API plus the background loops, not yet running.
pub struct ControlPlane {
    state: AppState,
    controller: ControllerWorker,
    liveness: LivenessMonitor,
}

/// Handles of the spawned background loops.
pub struct BackgroundTasks {
    controller: JoinHandle<()>,
    liveness: JoinHandle<()>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn StateStore>,
        agents: Arc<dyn WorkerAgentClient>,
        config: &Config,
    ) -> Self {
        let (trigger, triggers) = ReconcileTrigger::new();
        let reconciler = Arc::new(ModelReconciler::new(
            store.clone(),
            agents.clone(),
            Scheduler::new(config.weights),
            config.controller.clone(),
        ));
        let heartbeats = Arc::new(HeartbeatProcessor::new(
            store.clone(),
            trigger.clone(),
            config.liveness.clone(),
        ));
        let liveness =
            LivenessMonitor::new(store.clone(), agents, heartbeats.clone(), trigger.clone());
        let controller = ControllerWorker::new(reconciler, store.clone(), triggers);
        let state = AppState::new(store, trigger, heartbeats, config.agent_token.clone());

        Self {
            state,
            controller,
            liveness,
        }
    }

    pub fn router(&self) -> Router {
        api::create_router(self.state.clone())
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> BackgroundTasks {
        let controller = tokio::spawn(self.controller.run(shutdown.clone()));
        let liveness = self.liveness;
        let liveness = tokio::spawn(async move { liveness.run(shutdown).await });
        BackgroundTasks {
            controller,
            liveness,
        }
    }
}

impl BackgroundTasks {
    /// Waits for the loops to stop after shutdown was signaled.
    pub async fn join(self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.controller).await.is_err() {
            warn!("Controller worker did not shut down in time");
        }
        if tokio::time::timeout(timeout, self.liveness).await.is_err() {
            warn!("Liveness monitor did not shut down in time");
        }
    }
}
