//! Control plane synchronization.
//!
//! The proxy takes one routing snapshot from `GET /v1/routes`, then tails
//! `GET /v1/events` from the snapshot's cursor and applies instance and
//! model events to the route table. None of this runs on the request path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use gpufleet_events::{
    event_types, EventEnvelope, EventPage, InstanceDeletedPayload, InstanceStateChangedPayload,
    ModelDeletedPayload, ModelRevisedPayload,
};
use gpufleet_id::EventId;
use gpufleet_types::{RouteEndpoint, RoutesSnapshot};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::persistence::StatePersistence;
use crate::routing::{Balancer, RouteTable};

pub struct RouteSync {
    client: reqwest::Client,
    base_url: String,
    config: SyncConfig,
    table: Arc<RouteTable>,
    balancer: Arc<Balancer>,
    persistence: Option<StatePersistence>,
    cursor: EventId,
    /// Set once the table reflects some control plane state.
    ready: Arc<AtomicBool>,
    snapshot_taken: bool,
}

impl RouteSync {
    pub fn new(
        control_plane_url: &str,
        token: Option<&str>,
        config: SyncConfig,
        table: Arc<RouteTable>,
        balancer: Arc<Balancer>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let raw = token.trim();
            let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
                raw.to_string()
            } else {
                format!("Bearer {raw}")
            };
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer).context("Invalid control-plane token format")?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("gpufleet-proxy/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let persistence = config.state_file.clone().map(StatePersistence::new);

        Ok(Self {
            client,
            base_url: control_plane_url.trim_end_matches('/').to_string(),
            config,
            table,
            balancer,
            persistence,
            cursor: EventId::default(),
            ready: Arc::new(AtomicBool::new(false)),
            snapshot_taken: false,
        })
    }

    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// Restores the last persisted table, if any.
    pub fn restore(&mut self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let state = persistence.load()?;
        if state.cursor.value() == 0 && state.routes.is_empty() {
            return Ok(());
        }
        self.table.replace(state.routes);
        self.cursor = state.cursor;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Replaces the table with a fresh control plane snapshot.
    pub async fn take_snapshot(&mut self) -> Result<()> {
        let url = format!("{}/v1/routes", self.base_url);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("routes query failed (status={status}): {body}");
        }
        let snapshot: RoutesSnapshot = resp.json().await?;

        info!(
            cursor = %snapshot.cursor,
            model_count = snapshot.routes.len(),
            "Route snapshot loaded"
        );
        self.table.replace(snapshot.routes);
        self.cursor = snapshot.cursor;
        self.snapshot_taken = true;
        self.ready.store(true, Ordering::Release);
        self.persist();
        Ok(())
    }

    async fn fetch_events(&self) -> Result<EventPage> {
        let url = format!("{}/v1/events", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(&[
                ("after_event_id", self.cursor.value()),
                ("limit", i64::from(self.config.fetch_limit)),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("events query failed (status={status}): {body}");
        }
        Ok(resp.json::<EventPage>().await?)
    }

    /// Fetches and applies one page of events. Returns how many were read.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let page = self.fetch_events().await?;
        let count = page.events.len();
        for event in &page.events {
            self.apply(event);
            self.cursor = event.event_id;
        }
        self.cursor = page.next_cursor.max(self.cursor);
        if count > 0 {
            self.persist();
        }
        Ok(count)
    }

    /// Applies one event to the route table.
    pub fn apply(&self, event: &EventEnvelope) {
        let event_id = event.event_id;
        match event.event_type.as_str() {
            event_types::INSTANCE_STATE_CHANGED => {
                let payload: InstanceStateChangedPayload = match event.decode() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(event_id = %event_id, error = %e, "Skipping malformed event");
                        return;
                    }
                };
                match (payload.is_routable(), payload.endpoint) {
                    (true, Some(endpoint)) => {
                        self.table.upsert(
                            &payload.model_name,
                            RouteEndpoint {
                                instance_id: payload.instance_id,
                                revision: payload.revision,
                                endpoint,
                            },
                        );
                        self.balancer.clear_suspect(payload.instance_id);
                        info!(
                            event_id = %event_id,
                            model = %payload.model_name,
                            instance_id = %payload.instance_id,
                            revision = payload.revision,
                            "Instance routable"
                        );
                    }
                    _ => {
                        if self.table.remove_instance(payload.instance_id) {
                            info!(
                                event_id = %event_id,
                                model = %payload.model_name,
                                instance_id = %payload.instance_id,
                                state = %payload.state.as_str(),
                                "Instance left rotation"
                            );
                        }
                        self.balancer.forget(payload.instance_id);
                    }
                }
            }
            event_types::INSTANCE_DELETED => match event.decode::<InstanceDeletedPayload>() {
                Ok(payload) => {
                    self.table.remove_instance(payload.instance_id);
                    self.balancer.forget(payload.instance_id);
                }
                Err(e) => warn!(event_id = %event_id, error = %e, "Skipping malformed event"),
            },
            event_types::MODEL_DELETED => match event.decode::<ModelDeletedPayload>() {
                Ok(payload) => {
                    self.table.remove_model(&payload.model_name);
                    info!(event_id = %event_id, model = %payload.model_name, "Model removed");
                }
                Err(e) => warn!(event_id = %event_id, error = %e, "Skipping malformed event"),
            },
            event_types::MODEL_REVISED => {
                if let Ok(payload) = event.decode::<ModelRevisedPayload>() {
                    debug!(
                        event_id = %event_id,
                        model = %payload.model_name,
                        revision = payload.revision,
                        "Model revised"
                    );
                }
            }
            _ => {}
        }
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(self.cursor, self.table.entries()) {
                warn!(error = %e, "Failed to persist route state");
            }
        }
    }

    /// Keeps the table in sync until shutdown.
    #[instrument(skip_all, fields(control_plane = %self.base_url))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Ignoring unreadable route state file");
        }

        loop {
            let wait = if !self.snapshot_taken && self.cursor.value() == 0 {
                match self.take_snapshot().await {
                    Ok(()) => std::time::Duration::ZERO,
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch route snapshot; retrying");
                        self.config.poll_interval
                    }
                }
            } else {
                match self.poll_once().await {
                    Ok(count) if count >= self.config.fetch_limit as usize => {
                        std::time::Duration::ZERO
                    }
                    Ok(_) => self.config.poll_interval,
                    Err(e) => {
                        warn!(error = %e, cursor = %self.cursor, "Failed to fetch events; retrying");
                        self.config.poll_interval
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(cursor = %self.cursor, "Route sync shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::BalancePolicy;
    use chrono::Utc;
    use gpufleet_events::NewEvent;
    use gpufleet_id::{InstanceId, ModelId, WorkerId};
    use gpufleet_types::{Endpoint, InstanceState, RouteEntry};
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_changed(
        instance_id: InstanceId,
        state: InstanceState,
        event_id: i64,
    ) -> EventEnvelope {
        let payload = InstanceStateChangedPayload {
            instance_id,
            model_id: ModelId::new(),
            model_name: "qwen".into(),
            revision: 1,
            state,
            endpoint: Some(Endpoint::new("10.0.0.3", 40001)),
            worker_id: Some(WorkerId::new()),
            reason: None,
        };
        NewEvent::from_payload(&payload)
            .unwrap()
            .into_envelope(EventId::new(event_id), Utc::now())
    }

    fn sync(url: &str) -> RouteSync {
        RouteSync::new(
            url,
            Some("s3cret"),
            SyncConfig {
                fetch_limit: 10,
                poll_interval: Duration::from_millis(50),
                state_file: None,
            },
            Arc::new(RouteTable::new()),
            Arc::new(Balancer::new(BalancePolicy::RoundRobin, Duration::from_secs(30))),
        )
        .unwrap()
    }

    #[test]
    fn only_running_instances_stay_routable() {
        let sync = sync("http://127.0.0.1:1");
        let id = InstanceId::new();

        sync.apply(&state_changed(id, InstanceState::Running, 1));
        assert_eq!(sync.table.lookup("qwen", None).len(), 1);

        sync.apply(&state_changed(id, InstanceState::Unhealthy, 2));
        assert!(sync.table.lookup("qwen", None).is_empty());

        sync.apply(&state_changed(id, InstanceState::Running, 3));
        sync.apply(&state_changed(id, InstanceState::Terminating, 4));
        assert!(sync.table.lookup("qwen", None).is_empty());
    }

    #[test]
    fn running_event_clears_suspect() {
        let sync = sync("http://127.0.0.1:1");
        let id = InstanceId::new();
        sync.apply(&state_changed(id, InstanceState::Running, 1));
        sync.balancer.mark_suspect(id);
        sync.apply(&state_changed(id, InstanceState::Running, 2));
        assert!(!sync.balancer.is_suspect(id));
    }

    #[tokio::test]
    async fn snapshot_then_events() {
        let server = MockServer::start().await;
        let kept = InstanceId::new();
        let dropped = InstanceId::new();
        let snapshot = RoutesSnapshot {
            cursor: EventId::new(5),
            routes: vec![RouteEntry {
                model_name: "qwen".into(),
                endpoints: [kept, dropped]
                    .into_iter()
                    .map(|instance_id| RouteEndpoint {
                        instance_id,
                        revision: 1,
                        endpoint: Endpoint::new("10.0.0.3", 40001),
                    })
                    .collect(),
            }],
        };
        Mock::given(method("GET"))
            .and(path("/v1/routes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&snapshot))
            .expect(1)
            .mount(&server)
            .await;
        let page = EventPage {
            events: vec![state_changed(dropped, InstanceState::Terminating, 6)],
            next_cursor: EventId::new(6),
        };
        Mock::given(method("GET"))
            .and(path("/v1/events"))
            .and(query_param("after_event_id", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&page))
            .expect(1)
            .mount(&server)
            .await;

        let mut sync = sync(&server.uri());
        sync.take_snapshot().await.unwrap();
        assert!(sync.ready_flag().load(Ordering::Acquire));
        assert_eq!(sync.table.lookup("qwen", None).len(), 2);

        assert_eq!(sync.poll_once().await.unwrap(), 1);
        assert_eq!(sync.cursor(), EventId::new(6));
        let left: Vec<InstanceId> = sync
            .table
            .lookup("qwen", None)
            .iter()
            .map(|ep| ep.instance_id)
            .collect();
        assert_eq!(left, vec![kept]);

        let received = server.received_requests().await.unwrap();
        assert!(received
            .iter()
            .all(|r| r.headers.get("authorization").unwrap() == "Bearer s3cret"));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let mut sync = sync(&server.uri());
        assert!(sync.poll_once().await.is_err());
        assert_eq!(sync.cursor(), EventId::new(0));
        assert!(!sync.ready_flag().load(Ordering::Acquire));
    }
}
