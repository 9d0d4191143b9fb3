//! In-process backend that speaks a small OpenAI-compatible API.
//!
//! Serves `/health`, `/v1/models`, `/v1/completions` and
//! `/v1/chat/completions`. Completions stream as server-sent events when the
//! request asks for `"stream": true`. Every response carries an
//! `x-fleet-instance` header naming the instance that produced it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use gpufleet_id::InstanceId;
use gpufleet_types::BackendKind;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use super::{Backend, Exit, Launch, Process, BIND_HOST};

pub const INSTANCE_HEADER: &str = "x-fleet-instance";

/// Tunables of the simulated engine.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// `/health` answers 503 until this much time has passed.
    pub ready_after: Duration,
    pub stream_chunks: usize,
    pub chunk_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            ready_after: Duration::ZERO,
            stream_chunks: 4,
            chunk_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug)]
struct MockControl {
    healthy: AtomicBool,
    crash: Notify,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    behavior: MockBehavior,
    controls: Mutex<HashMap<InstanceId, Arc<MockControl>>>,
}

impl MockBackend {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            controls: Mutex::new(HashMap::new()),
        }
    }

    fn control(&self, instance_id: InstanceId) -> Option<Arc<MockControl>> {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance_id)
            .cloned()
    }

    /// Makes `/health` of a running mock fail or recover.
    pub fn set_healthy(&self, instance_id: InstanceId, healthy: bool) -> bool {
        match self.control(instance_id) {
            Some(control) => {
                control.healthy.store(healthy, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stops the server as if the engine died.
    pub fn crash(&self, instance_id: InstanceId) -> bool {
        match self.control(instance_id) {
            Some(control) => {
                control.crash.notify_one();
                true
            }
            None => false,
        }
    }
}

/// A running mock server.
#[derive(Debug)]
pub struct MockServer {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub fn try_exit(&self) -> Option<Exit> {
        self.task.is_finished().then(|| Exit {
            code: Some(1),
            message: "mock backend stopped".to_string(),
        })
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.task).await;
    }
}

#[derive(Clone)]
struct ServerState {
    instance_id: InstanceId,
    model_name: String,
    started: Instant,
    behavior: MockBehavior,
    control: Arc<MockControl>,
}

impl ServerState {
    fn tagged(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if let Ok(value) = HeaderValue::from_str(&self.instance_id.to_string()) {
            response.headers_mut().insert(INSTANCE_HEADER, value);
        }
        response
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    async fn start(&self, launch: &Launch) -> Result<Process> {
        let instance_id = launch.instance_id();
        let listener = tokio::net::TcpListener::bind((BIND_HOST, launch.port))
            .await
            .with_context(|| format!("mock backend failed to bind port {}", launch.port))?;

        let control = Arc::new(MockControl {
            healthy: AtomicBool::new(true),
            crash: Notify::new(),
        });
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id, control.clone());

        let state = ServerState {
            instance_id,
            model_name: launch.request.model_name.clone(),
            started: Instant::now(),
            behavior: self.behavior.clone(),
            control: control.clone(),
        };
        let app = Router::new()
            .route("/health", get(health))
            .route("/v1/models", get(models))
            .route("/v1/completions", post(completions))
            .route("/v1/chat/completions", post(completions))
            .with_state(state);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                tokio::select! {
                    _ = rx => {}
                    _ = control.crash.notified() => {}
                }
            };
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await;
        });

        info!(instance_id = %instance_id, port = launch.port, "Mock backend listening");
        Ok(Process::InProcess(MockServer {
            shutdown: Some(tx),
            task,
        }))
    }

    fn forget(&self, instance_id: InstanceId) {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance_id);
    }
}

async fn health(State(state): State<ServerState>) -> Response {
    if !state.control.healthy.load(Ordering::SeqCst) {
        return state.tagged((StatusCode::SERVICE_UNAVAILABLE, "unhealthy"));
    }
    if state.started.elapsed() < state.behavior.ready_after {
        return state.tagged((StatusCode::SERVICE_UNAVAILABLE, "loading"));
    }
    state.tagged(Json(json!({ "status": "ok" })))
}

async fn models(State(state): State<ServerState>) -> Response {
    state.tagged(Json(json!({
        "object": "list",
        "data": [{ "id": state.model_name, "object": "model" }],
    })))
}

async fn completions(State(state): State<ServerState>, Json(request): Json<Value>) -> Response {
    let streaming = request.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let id = format!("cmpl-{}", state.instance_id.short());

    if !streaming {
        return state.tagged(Json(json!({
            "id": id,
            "object": "chat.completion",
            "model": state.model_name,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "hello from gpufleet" },
                "finish_reason": "stop",
            }],
        })));
    }

    let delay = state.behavior.chunk_delay;
    let model = state.model_name.clone();
    let chunks = stream::iter(0..state.behavior.stream_chunks)
        .then(move |i| {
            let chunk = json!({
                "id": id,
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{ "index": 0, "delta": { "content": format!("tok{i} ") } }],
            });
            async move {
                tokio::time::sleep(delay).await;
                Ok::<_, Infallible>(Bytes::from(format!("data: {chunk}\n\n")))
            }
        })
        .chain(stream::once(async {
            Ok::<_, Infallible>(Bytes::from_static(b"data: [DONE]\n\n"))
        }));

    state.tagged((
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(chunks),
    ))
}
