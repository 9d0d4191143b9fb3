//! `watch=true` on a list endpoint: changes to that kind of resource as
//! server-sent events.
//!
//! The stream tails the event log from the moment it opens. Every event for
//! the watched kind becomes one SSE event named `created`, `updated` or
//! `deleted`, carrying the resource as the list endpoint renders it (or the
//! deletion payload once the resource is gone). A resource is `created` the
//! first time the stream sees it and `updated` afterwards.

use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use gpufleet_events::{event_types, AggregateType, EventEnvelope};
use gpufleet_id::{EventId, ModelId};
use serde::Serialize;
use tracing::{debug, warn};

use super::list::name_matches;
use super::models::ModelResponse;
use super::workers::WorkerResponse;
use crate::db::{StateStore, StoreError};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const BATCH: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Serialize)]
struct Change {
    #[serde(rename = "type")]
    kind: ChangeKind,
    data: serde_json::Value,
}

/// What a watch stream follows.
#[derive(Debug, Clone, Copy)]
pub enum Watched {
    Models,
    Workers,
    /// Instances, optionally of one model.
    Instances(Option<ModelId>),
}

impl Watched {
    fn aggregate(self) -> AggregateType {
        match self {
            Watched::Models => AggregateType::Model,
            Watched::Workers => AggregateType::Worker,
            Watched::Instances(_) => AggregateType::Instance,
        }
    }

    async fn existing(self, store: &dyn StateStore) -> Result<HashSet<String>, StoreError> {
        Ok(match self {
            Watched::Models => store
                .list_models()
                .await?
                .iter()
                .map(|m| m.id.to_string())
                .collect(),
            Watched::Workers => store
                .list_workers()
                .await?
                .iter()
                .map(|w| w.id.to_string())
                .collect(),
            Watched::Instances(model) => store
                .list_instances(model)
                .await?
                .iter()
                .map(|i| i.id.to_string())
                .collect(),
        })
    }

    /// The resource as its list endpoint renders it, if it still exists.
    async fn load(
        self,
        store: &dyn StateStore,
        id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let value = match self {
            Watched::Models => match id.parse() {
                Ok(id) => store
                    .get_model(id)
                    .await?
                    .map(|m| serde_json::to_value(ModelResponse::from(m))),
                Err(_) => None,
            },
            Watched::Workers => match id.parse() {
                Ok(id) => match store.get_worker(id).await? {
                    Some(worker) => {
                        let reservations = store.list_reservations().await?;
                        Some(serde_json::to_value(WorkerResponse::new(worker, &reservations)))
                    }
                    None => None,
                },
                Err(_) => None,
            },
            Watched::Instances(_) => match id.parse() {
                Ok(id) => store.get_instance(id).await?.map(serde_json::to_value),
                Err(_) => None,
            },
        };
        Ok(value.transpose()?)
    }

    fn keeps(self, data: &serde_json::Value, search: Option<&str>) -> bool {
        if let Watched::Instances(Some(model)) = self {
            if data["model_id"].as_str() != Some(model.to_string().as_str()) {
                return false;
            }
        }
        let name = data
            .get("name")
            .or_else(|| data.get("model_name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        name_matches(search, name)
    }
}

fn is_deletion(envelope: &EventEnvelope) -> bool {
    envelope.event_type == event_types::MODEL_DELETED
        || envelope.event_type == event_types::INSTANCE_DELETED
}

struct Watcher {
    store: Arc<dyn StateStore>,
    watched: Watched,
    search: Option<String>,
    cursor: EventId,
    known: HashSet<String>,
    ready: VecDeque<Event>,
}

impl Watcher {
    async fn poll(&mut self) -> Result<(), StoreError> {
        let page = self.store.events_after(self.cursor, BATCH).await?;
        self.cursor = page.next_cursor;
        for envelope in page.events {
            if envelope.aggregate_type != self.watched.aggregate() {
                continue;
            }
            let id = envelope.aggregate_id.clone();
            let (kind, data) = if is_deletion(&envelope) {
                self.known.remove(&id);
                (ChangeKind::Deleted, envelope.payload)
            } else {
                // Gone already: its deletion event follows.
                let Some(data) = self.watched.load(self.store.as_ref(), &id).await? else {
                    continue;
                };
                let kind = if self.known.insert(id) {
                    ChangeKind::Created
                } else {
                    ChangeKind::Updated
                };
                (kind, data)
            };
            if !self.watched.keeps(&data, self.search.as_deref()) {
                continue;
            }
            match Event::default()
                .event(kind.as_str())
                .id(envelope.event_id.to_string())
                .json_data(Change { kind, data })
            {
                Ok(event) => self.ready.push_back(event),
                Err(e) => warn!(error = %e, "Failed to encode watch event"),
            }
        }
        Ok(())
    }
}

/// Opens a watch stream starting after the newest event in the log.
pub async fn watch(
    store: Arc<dyn StateStore>,
    watched: Watched,
    search: Option<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StoreError> {
    // Cursor first: a change landing between the two reads is replayed, not
    // lost.
    let cursor = store.latest_event_id().await?;
    let known = watched.existing(store.as_ref()).await?;
    debug!(?watched, %cursor, "Watch stream opened");

    let watcher = Watcher {
        store,
        watched,
        search,
        cursor,
        known,
        ready: VecDeque::new(),
    };
    let events = stream::unfold(watcher, |mut watcher| async move {
        loop {
            if let Some(event) = watcher.ready.pop_front() {
                return Some((Ok::<_, Infallible>(event), watcher));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            if let Err(e) = watcher.poll().await {
                warn!(error = %e, "Watch poll failed; retrying");
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use axum::body::BodyDataStream;
    use axum::http::{header, StatusCode};
    use chrono::Utc;
    use futures_util::StreamExt;
    use gpufleet_types::ModelInstance;
    use tower::ServiceExt;

    use crate::api::test_support::{api, get, TestApi};
    use crate::controller::testing::spec;
    use crate::db::StateStore;

    async fn open(t: &TestApi, uri: &str) -> BodyDataStream {
        let response = t.router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
        response.into_body().into_data_stream()
    }

    /// Next SSE event as (name, decoded data), skipping keep-alive comments.
    async fn next_change(body: &mut BodyDataStream) -> (String, serde_json::Value) {
        let mut buffer = String::new();
        loop {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
                .await
                .expect("no watch event within 5s")
                .expect("stream ended")
                .unwrap();
            buffer.push_str(std::str::from_utf8(&chunk).unwrap());
            let Some(end) = buffer.find("\n\n") else {
                continue;
            };
            let frame: String = buffer.drain(..end + 2).collect();
            let mut name = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = Some(serde_json::from_str(v.trim()).unwrap());
                }
            }
            if let (Some(name), Some(data)) = (name, data) {
                return (name, data);
            }
        }
    }

    #[tokio::test]
    async fn model_watch_reports_create_then_update() {
        let t = api(None);
        let mut body = open(&t, "/v1/models?watch=true").await;

        let now = Utc::now();
        t.store.apply_model(spec("qwen", 1, 1), now).await.unwrap();
        let (name, change) = next_change(&mut body).await;
        assert_eq!(name, "created");
        assert_eq!(change["type"], "created");
        assert_eq!(change["data"]["name"], "qwen");

        t.store.apply_model(spec("qwen", 2, 1), now).await.unwrap();
        let (name, change) = next_change(&mut body).await;
        assert_eq!(name, "updated");
        assert_eq!(change["data"]["revision"], 2);
    }

    #[tokio::test]
    async fn watch_skips_names_not_matching_search() {
        let t = api(None);
        let mut body = open(&t, "/v1/models?watch=true&search=QW").await;

        let now = Utc::now();
        t.store.apply_model(spec("llama", 1, 1), now).await.unwrap();
        t.store.apply_model(spec("qwen", 1, 1), now).await.unwrap();
        let (_, change) = next_change(&mut body).await;
        assert_eq!(change["data"]["name"], "qwen");
    }

    #[tokio::test]
    async fn instance_watch_follows_one_model_until_deletion() {
        let t = api(None);
        let now = Utc::now();
        let qwen = t.store.apply_model(spec("qwen", 1, 1), now).await.unwrap().model;
        let llama = t.store.apply_model(spec("llama", 1, 1), now).await.unwrap().model;
        let mut body = open(&t, "/v1/instances?watch=true&model=qwen").await;

        t.store
            .create_instance(&ModelInstance::pending(&llama, now))
            .await
            .unwrap();
        let inst = t
            .store
            .create_instance(&ModelInstance::pending(&qwen, now))
            .await
            .unwrap();
        let (name, change) = next_change(&mut body).await;
        assert_eq!(name, "created");
        assert_eq!(change["data"]["id"], inst.id.to_string());
        assert_eq!(change["data"]["state"], "pending");

        t.store.delete_instance(inst.id).await.unwrap();
        let (name, change) = next_change(&mut body).await;
        assert_eq!(name, "deleted");
        assert_eq!(change["data"]["instance_id"], inst.id.to_string());
    }
}
