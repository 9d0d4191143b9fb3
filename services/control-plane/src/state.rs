//! Application state shared across request handlers.

use std::sync::Arc;

use crate::controller::{HeartbeatProcessor, ReconcileTrigger};
use crate::db::StateStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn StateStore>,
    trigger: ReconcileTrigger,
    heartbeats: Arc<HeartbeatProcessor>,
    agent_token: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StateStore>,
        trigger: ReconcileTrigger,
        heartbeats: Arc<HeartbeatProcessor>,
        agent_token: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                trigger,
                heartbeats,
                agent_token,
            }),
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.inner.store.as_ref()
    }

    /// An owned handle, for work that outlives the request.
    pub fn shared_store(&self) -> Arc<dyn StateStore> {
        self.inner.store.clone()
    }

    /// Asks the controller to reconcile a model now.
    pub fn trigger(&self) -> &ReconcileTrigger {
        &self.inner.trigger
    }

    pub fn heartbeats(&self) -> &HeartbeatProcessor {
        &self.inner.heartbeats
    }

    /// Token workers must present; `None` disables the check.
    pub fn agent_token(&self) -> Option<&str> {
        self.inner.agent_token.as_deref()
    }
}
