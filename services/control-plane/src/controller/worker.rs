//! Controller background worker.
//!
//! Runs one reconcile loop per model. A loop reconciles when it is poked by
//! a trigger (model applied, heartbeat changed an instance, worker lost), when
//! its own requeue delay elapses and at least once per reconcile interval.
//! Pokes that arrive while a pass is running collapse into one follow-up
//! pass, so a model is never reconciled concurrently with itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gpufleet_id::ModelId;
use gpufleet_reconcile::Backoff;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, Instrument};

use super::{ModelLoopState, ModelReconciler};
use crate::db::StateStore;

/// Handle for requesting an immediate reconcile of a model.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::UnboundedSender<ModelId>,
}

impl ReconcileTrigger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ModelId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, model_id: ModelId) {
        // The receiver is gone only during shutdown.
        let _ = self.tx.send(model_id);
    }
}

struct ModelTask {
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct ControllerWorker {
    reconciler: Arc<ModelReconciler>,
    store: Arc<dyn StateStore>,
    triggers: mpsc::UnboundedReceiver<ModelId>,
    tasks: HashMap<ModelId, ModelTask>,
}

impl ControllerWorker {
    pub fn new(
        reconciler: Arc<ModelReconciler>,
        store: Arc<dyn StateStore>,
        triggers: mpsc::UnboundedReceiver<ModelId>,
    ) -> Self {
        Self {
            reconciler,
            store,
            triggers,
            tasks: HashMap::new(),
        }
    }

    /// Run until shutdown is signaled, then wait for the model loops to stop.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.reconciler.config().reconcile_interval;
        info!(interval_secs = interval.as_secs(), "Starting controller worker");

        self.discover(&shutdown).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                Some(model_id) = self.triggers.recv() => {
                    self.wake(model_id, &shutdown);
                }
                _ = ticker.tick() => {
                    self.discover(&shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
            }
        }

        for (model_id, task) in self.tasks.drain() {
            task.wake.notify_one();
            if tokio::time::timeout(Duration::from_secs(10), task.handle)
                .await
                .is_err()
            {
                error!(%model_id, "Model loop did not stop in time");
            }
        }
    }

    /// Starts loops for models that have none, e.g. after a restart.
    async fn discover(&mut self, shutdown: &watch::Receiver<bool>) {
        self.tasks.retain(|_, task| !task.handle.is_finished());
        match self.store.list_models().await {
            Ok(models) => {
                for model in models {
                    if !self.tasks.contains_key(&model.id) {
                        self.spawn(model.id, shutdown.clone());
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to list models"),
        }
    }

    fn wake(&mut self, model_id: ModelId, shutdown: &watch::Receiver<bool>) {
        match self.tasks.get(&model_id) {
            Some(task) if !task.handle.is_finished() => task.wake.notify_one(),
            _ => self.spawn(model_id, shutdown.clone()),
        }
    }

    fn spawn(&mut self, model_id: ModelId, shutdown: watch::Receiver<bool>) {
        debug!(%model_id, "Starting model loop");
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(
            model_loop(self.reconciler.clone(), model_id, wake.clone(), shutdown)
                .instrument(tracing::info_span!("model_loop", %model_id)),
        );
        self.tasks.insert(model_id, ModelTask { wake, handle });
    }
}

async fn model_loop(
    reconciler: Arc<ModelReconciler>,
    model_id: ModelId,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = reconciler.config().clone();
    let mut state = ModelLoopState::new(&config);
    let mut errors = Backoff::new(config.backoff_base, config.backoff_cap);

    loop {
        if *shutdown.borrow() {
            break;
        }
        let wait = match reconciler.reconcile(model_id, &mut state, Utc::now()).await {
            Ok(report) if report.gone => {
                debug!("Model gone; stopping loop");
                break;
            }
            Ok(report) => {
                errors.reset();
                report
                    .requeue_after
                    .map_or(config.reconcile_interval, |d| d.min(config.reconcile_interval))
            }
            Err(e) => {
                let delay = errors.next_delay();
                error!(error = %e, retry_in_ms = delay.as_millis() as u64, "Reconcile failed");
                delay
            }
        };

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
