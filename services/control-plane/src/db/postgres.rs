use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpufleet_events::{
    EventEnvelope, EventPage, EventPayload, InstanceDeletedPayload, ModelDeletedPayload,
    ModelRevisedPayload, NewEvent, WorkerHealthChangedPayload,
};
use gpufleet_id::{EventId, InstanceId, ModelId, WorkerId};
use gpufleet_types::{
    Capacity, HeartbeatReport, InstanceState, Model, ModelInstance, ModelSpec, ModelStatus,
    PlacementDecision, Reservation, Usage, Worker, WorkerHealth,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use super::{
    instance_event, prepare_instance_update, template_hash, ApplyOutcome, ApplyResult, Database,
    StateStore, StoreError, WorkerChange,
};

/// Key for the transaction-scoped advisory lock that orders event appends.
/// Holding it until commit keeps event ids visible in increasing order.
const EVENT_LOG_LOCK: i64 = 0x6770_7566_6c65_6574;

const MODEL_COLUMNS: &str = r#"
    m.id, m.name, m.revision, m.template_hash, m.deleting, m.status,
    m.created_at, m.updated_at, s.spec
"#;

const WORKER_COLUMNS: &str =
    "id, name, address, capacity, labels, health, last_heartbeat_at, created_at";

const RESERVATION_COLUMNS: &str =
    "instance_id, worker_id, gpu_indexes, memory_bytes, cpu_millis, expires_at";

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what()),
        _ => StoreError::Query(err),
    }
}

struct ModelRow {
    id: String,
    revision: i64,
    template_hash: String,
    deleting: bool,
    status: Json<ModelStatus>,
    spec: Json<ModelSpec>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ModelRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            revision: row.try_get("revision")?,
            template_hash: row.try_get("template_hash")?,
            deleting: row.try_get("deleting")?,
            status: row.try_get("status")?,
            spec: row.try_get("spec")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl ModelRow {
    fn into_model(self) -> Result<Model, StoreError> {
        Ok(Model {
            id: self.id.parse().map_err(|e| corrupt("model id", e))?,
            revision: self.revision as u64,
            spec: self.spec.0,
            template_hash: self.template_hash,
            deleting: self.deleting,
            status: self.status.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct WorkerRow {
    id: String,
    name: String,
    address: String,
    capacity: Json<Capacity>,
    labels: Json<BTreeMap<String, String>>,
    health: String,
    last_heartbeat_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for WorkerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            capacity: row.try_get("capacity")?,
            labels: row.try_get("labels")?,
            health: row.try_get("health")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl WorkerRow {
    fn into_worker(self) -> Result<Worker, StoreError> {
        Ok(Worker {
            id: self.id.parse().map_err(|e| corrupt("worker id", e))?,
            name: self.name,
            address: self.address,
            capacity: self.capacity.0,
            labels: self.labels.0,
            health: self.health.parse().map_err(|e| corrupt("worker health", e))?,
            last_heartbeat_at: self.last_heartbeat_at,
            created_at: self.created_at,
        })
    }
}

struct InstanceRow {
    data: Json<ModelInstance>,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            data: row.try_get("data")?,
            version: row.try_get("version")?,
        })
    }
}

impl InstanceRow {
    fn into_instance(self) -> ModelInstance {
        let mut instance = self.data.0;
        instance.version = self.version;
        instance
    }
}

struct ReservationRow {
    instance_id: String,
    worker_id: String,
    gpu_indexes: Vec<i32>,
    memory_bytes: i64,
    cpu_millis: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ReservationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            worker_id: row.try_get("worker_id")?,
            gpu_indexes: row.try_get("gpu_indexes")?,
            memory_bytes: row.try_get("memory_bytes")?,
            cpu_millis: row.try_get("cpu_millis")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl ReservationRow {
    fn into_reservation(self) -> Result<Reservation, StoreError> {
        Ok(Reservation {
            instance_id: self
                .instance_id
                .parse()
                .map_err(|e| corrupt("reservation instance id", e))?,
            worker_id: self
                .worker_id
                .parse()
                .map_err(|e| corrupt("reservation worker id", e))?,
            gpu_indexes: self.gpu_indexes.into_iter().map(|i| i as u32).collect(),
            memory_bytes: self.memory_bytes as u64,
            cpu_millis: self.cpu_millis as u64,
            expires_at: self.expires_at,
        })
    }
}

struct EventRow {
    event_id: i64,
    occurred_at: DateTime<Utc>,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            occurred_at: row.try_get("occurred_at")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl EventRow {
    fn into_envelope(self) -> Result<EventEnvelope, StoreError> {
        Ok(EventEnvelope {
            event_id: EventId::new(self.event_id),
            occurred_at: self.occurred_at,
            aggregate_type: self
                .aggregate_type
                .parse()
                .map_err(|e| corrupt("aggregate type", e))?,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
        })
    }
}

async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewEvent,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(EVENT_LOG_LOCK)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO event_log (aggregate_type, aggregate_id, event_type, payload)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(event.aggregate_type.as_str())
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_payload<P: EventPayload>(
    tx: &mut Transaction<'_, Postgres>,
    payload: &P,
) -> Result<(), StoreError> {
    let event = NewEvent::from_payload(payload).map_err(|e| corrupt("event payload", e))?;
    append_event(tx, &event).await
}

fn worker_ids_of(instance: &ModelInstance) -> Vec<String> {
    instance
        .placement
        .as_ref()
        .map(|p| p.worker_ids().map(|w| w.to_string()).collect())
        .unwrap_or_default()
}

async fn write_instance(
    tx: &mut Transaction<'_, Postgres>,
    instance: &ModelInstance,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE model_instances
        SET state = $2, worker_ids = $3, data = $4, version = $5, updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(instance.id.to_string())
    .bind(instance.state.as_str())
    .bind(worker_ids_of(instance))
    .bind(Json(instance))
    .bind(instance.version)
    .bind(instance.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_instance(
    tx: &mut Transaction<'_, Postgres>,
    id: InstanceId,
) -> Result<ModelInstance, StoreError> {
    let row: Option<InstanceRow> =
        sqlx::query_as("SELECT data, version FROM model_instances WHERE id = $1 FOR UPDATE")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
    row.map(InstanceRow::into_instance)
        .ok_or_else(|| StoreError::NotFound(format!("instance {id}")))
}

/// Postgres-backed [`StateStore`].
///
/// Reservation inserts lock the affected worker rows in id order, so two
/// placements touching the same worker are serialized and cannot deadlock.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch_model(&self, column: &str, value: &str) -> Result<Option<Model>, StoreError> {
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models m \
             JOIN model_specs s ON s.model_id = m.id AND s.revision = m.revision \
             WHERE m.{column} = $1"
        );
        let row: Option<ModelRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(ModelRow::into_model).transpose()
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(self.db.pool()).await?;
        Ok(())
    }

    async fn apply_model(
        &self,
        spec: ModelSpec,
        now: DateTime<Utc>,
    ) -> Result<ApplyResult, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models m \
             JOIN model_specs s ON s.model_id = m.id AND s.revision = m.revision \
             WHERE m.name = $1 FOR UPDATE OF m"
        );
        let existing: Option<ModelRow> = sqlx::query_as(&sql)
            .bind(&spec.name)
            .fetch_optional(&mut *tx)
            .await?;
        let existing = existing.map(ModelRow::into_model).transpose()?;

        let (model, outcome) = match existing {
            Some(mut model) if model.spec == spec => {
                if !model.deleting {
                    tx.commit().await?;
                    return Ok(ApplyResult {
                        model,
                        outcome: ApplyOutcome::Unchanged,
                    });
                }
                model.deleting = false;
                model.updated_at = now;
                sqlx::query("UPDATE models SET deleting = FALSE, updated_at = $2 WHERE id = $1")
                    .bind(model.id.to_string())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                (model, ApplyOutcome::Revised)
            }
            Some(mut model) => {
                model.revision += 1;
                model.template_hash = template_hash(&spec);
                model.spec = spec;
                model.deleting = false;
                model.updated_at = now;
                sqlx::query(
                    r#"
                    UPDATE models
                    SET revision = $2, template_hash = $3, deleting = FALSE, updated_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(model.id.to_string())
                .bind(model.revision as i64)
                .bind(&model.template_hash)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO model_specs (model_id, revision, spec, created_at) VALUES ($1, $2, $3, $4)",
                )
                .bind(model.id.to_string())
                .bind(model.revision as i64)
                .bind(Json(&model.spec))
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (model, ApplyOutcome::Revised)
            }
            None => {
                let model = Model {
                    id: ModelId::new(),
                    revision: 1,
                    template_hash: template_hash(&spec),
                    spec,
                    deleting: false,
                    status: ModelStatus::default(),
                    created_at: now,
                    updated_at: now,
                };
                sqlx::query(
                    r#"
                    INSERT INTO models (id, name, revision, template_hash, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $6)
                    "#,
                )
                .bind(model.id.to_string())
                .bind(&model.spec.name)
                .bind(model.revision as i64)
                .bind(&model.template_hash)
                .bind(Json(&model.status))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    conflict_on_unique(e, || format!("model {} was created concurrently", model.spec.name))
                })?;
                sqlx::query(
                    "INSERT INTO model_specs (model_id, revision, spec, created_at) VALUES ($1, $2, $3, $4)",
                )
                .bind(model.id.to_string())
                .bind(model.revision as i64)
                .bind(Json(&model.spec))
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (model, ApplyOutcome::Created)
            }
        };

        append_payload(
            &mut tx,
            &ModelRevisedPayload {
                model_id: model.id,
                model_name: model.spec.name.clone(),
                revision: model.revision,
                replicas: model.spec.replicas,
            },
        )
        .await?;
        tx.commit().await?;
        debug!(model = %model.spec.name, revision = model.revision, ?outcome, "Applied model spec");
        Ok(ApplyResult { model, outcome })
    }

    async fn get_model(&self, id: ModelId) -> Result<Option<Model>, StoreError> {
        self.fetch_model("id", &id.to_string()).await
    }

    async fn get_model_by_name(&self, name: &str) -> Result<Option<Model>, StoreError> {
        self.fetch_model("name", name).await
    }

    async fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models m \
             JOIN model_specs s ON s.model_id = m.id AND s.revision = m.revision \
             ORDER BY m.name"
        );
        let rows: Vec<ModelRow> = sqlx::query_as(&sql).fetch_all(self.db.pool()).await?;
        rows.into_iter().map(ModelRow::into_model).collect()
    }

    async fn model_spec(
        &self,
        id: ModelId,
        revision: u64,
    ) -> Result<Option<ModelSpec>, StoreError> {
        let row: Option<(Json<ModelSpec>,)> =
            sqlx::query_as("SELECT spec FROM model_specs WHERE model_id = $1 AND revision = $2")
                .bind(id.to_string())
                .bind(revision as i64)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(spec,)| spec.0))
    }

    async fn mark_model_deleting(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, StoreError> {
        let updated = sqlx::query("UPDATE models SET deleting = TRUE, updated_at = $2 WHERE name = $1")
            .bind(name)
            .bind(now)
            .execute(self.db.pool())
            .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_model_by_name(name).await
    }

    async fn update_model_status(
        &self,
        id: ModelId,
        status: &ModelStatus,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE models SET status = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(Json(status))
            .execute(self.db.pool())
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("model {id}")));
        }
        Ok(())
    }

    async fn purge_model(&self, id: ModelId) -> Result<bool, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT name, deleting FROM models WHERE id = $1 FOR UPDATE")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((name, true)) = row else {
            return Ok(false);
        };
        let deleted = sqlx::query(
            r#"
            DELETE FROM models
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM model_instances WHERE model_id = $1)
            "#,
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        if deleted.rows_affected() == 0 {
            return Ok(false);
        }
        append_payload(
            &mut tx,
            &ModelDeletedPayload {
                model_id: id,
                model_name: name,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_heartbeat(
        &self,
        report: &HeartbeatReport,
        now: DateTime<Utc>,
    ) -> Result<WorkerChange, StoreError> {
        let health = if report.draining {
            WorkerHealth::Draining
        } else {
            WorkerHealth::Ready
        };
        let mut tx = self.db.pool().begin().await?;
        let previous: Option<(String,)> =
            sqlx::query_as("SELECT health FROM workers WHERE id = $1 FOR UPDATE")
                .bind(report.worker_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let previous = previous
            .map(|(h,)| h.parse::<WorkerHealth>())
            .transpose()
            .map_err(|e| corrupt("worker health", e))?;

        let sql = format!(
            r#"
            INSERT INTO workers ({WORKER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                address = EXCLUDED.address,
                capacity = EXCLUDED.capacity,
                labels = EXCLUDED.labels,
                health = EXCLUDED.health,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            RETURNING {WORKER_COLUMNS}
            "#
        );
        let row: WorkerRow = sqlx::query_as(&sql)
            .bind(report.worker_id.to_string())
            .bind(&report.name)
            .bind(&report.address)
            .bind(Json(&report.capacity))
            .bind(Json(&report.labels))
            .bind(health.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        let change = WorkerChange {
            worker: row.into_worker()?,
            previous,
        };
        if change.health_changed() {
            append_payload(
                &mut tx,
                &WorkerHealthChangedPayload {
                    worker_id: change.worker.id,
                    name: change.worker.name.clone(),
                    previous,
                    health,
                },
            )
            .await?;
        }
        tx.commit().await?;
        Ok(change)
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1");
        let row: Option<WorkerRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(WorkerRow::into_worker).transpose()
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id");
        let rows: Vec<WorkerRow> = sqlx::query_as(&sql).fetch_all(self.db.pool()).await?;
        rows.into_iter().map(WorkerRow::into_worker).collect()
    }

    async fn set_worker_health(
        &self,
        id: WorkerId,
        health: WorkerHealth,
    ) -> Result<Option<WorkerChange>, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1 FOR UPDATE");
        let row: Option<WorkerRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(mut worker) = row.map(WorkerRow::into_worker).transpose()? else {
            return Ok(None);
        };
        if worker.health == health {
            return Ok(None);
        }

        let previous = worker.health;
        worker.health = health;
        sqlx::query("UPDATE workers SET health = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(health.as_str())
            .execute(&mut *tx)
            .await?;
        append_payload(
            &mut tx,
            &WorkerHealthChangedPayload {
                worker_id: id,
                name: worker.name.clone(),
                previous: Some(previous),
                health,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(Some(WorkerChange {
            worker,
            previous: Some(previous),
        }))
    }

    async fn remove_worker(&self, id: WorkerId) -> Result<bool, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM workers
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM reservations WHERE worker_id = $1)
            "#,
        )
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn create_instance(&self, instance: &ModelInstance) -> Result<ModelInstance, StoreError> {
        let mut stored = instance.clone();
        stored.version = 1;

        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO model_instances
                (id, model_id, revision, state, worker_ids, data, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(stored.id.to_string())
        .bind(stored.model_id.to_string())
        .bind(stored.revision as i64)
        .bind(stored.state.as_str())
        .bind(worker_ids_of(&stored))
        .bind(Json(&stored))
        .bind(stored.version)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::NotFound(format!("model {}", stored.model_id))
            }
            _ => conflict_on_unique(e, || format!("instance {} already exists", stored.id)),
        })?;

        if let Some(event) = instance_event(None, &stored)? {
            append_event(&mut tx, &event).await?;
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<ModelInstance>, StoreError> {
        let row: Option<InstanceRow> =
            sqlx::query_as("SELECT data, version FROM model_instances WHERE id = $1")
                .bind(id.to_string())
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(InstanceRow::into_instance))
    }

    async fn list_instances(
        &self,
        model: Option<ModelId>,
    ) -> Result<Vec<ModelInstance>, StoreError> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"
            SELECT data, version FROM model_instances
            WHERE $1::TEXT IS NULL OR model_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(model.map(|m| m.to_string()))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(InstanceRow::into_instance).collect())
    }

    async fn instances_on_worker(
        &self,
        worker: WorkerId,
    ) -> Result<Vec<ModelInstance>, StoreError> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"
            SELECT data, version FROM model_instances
            WHERE $1 = ANY(worker_ids)
            ORDER BY created_at, id
            "#,
        )
        .bind(worker.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(InstanceRow::into_instance).collect())
    }

    async fn update_instance(
        &self,
        instance: &ModelInstance,
    ) -> Result<ModelInstance, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        let stored = lock_instance(&mut tx, instance.id).await?;
        let out = prepare_instance_update(&stored, instance)?;

        write_instance(&mut tx, &out).await?;
        if out.placement.is_none() {
            sqlx::query("DELETE FROM reservations WHERE instance_id = $1")
                .bind(out.id.to_string())
                .execute(&mut *tx)
                .await?;
        } else if out.reservation_expires_at != stored.reservation_expires_at {
            sqlx::query("UPDATE reservations SET expires_at = $2 WHERE instance_id = $1")
                .bind(out.id.to_string())
                .bind(out.reservation_expires_at)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(event) = instance_event(Some(&stored), &out)? {
            append_event(&mut tx, &event).await?;
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn commit_placement(
        &self,
        decision: &PlacementDecision,
        expected_version: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ModelInstance, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        let stored = lock_instance(&mut tx, decision.instance_id).await?;
        if stored.version != expected_version || stored.state != InstanceState::Pending {
            return Err(StoreError::Conflict(format!(
                "instance {} is no longer pending at version {expected_version}",
                stored.id
            )));
        }

        let ids: BTreeSet<WorkerId> = decision.slices.iter().map(|s| s.worker_id).collect();
        if ids.len() != decision.slices.len() {
            return Err(StoreError::Conflict(
                "a worker appears twice in one placement".to_string(),
            ));
        }
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        );
        let rows: Vec<WorkerRow> = sqlx::query_as(&sql)
            .bind(ids.iter().map(|w| w.to_string()).collect::<Vec<_>>())
            .fetch_all(&mut *tx)
            .await?;
        let workers: BTreeMap<WorkerId, Worker> = rows
            .into_iter()
            .map(|r| r.into_worker().map(|w| (w.id, w)))
            .collect::<Result<_, _>>()?;

        for slice in &decision.slices {
            let worker = workers
                .get(&slice.worker_id)
                .filter(|w| w.health == WorkerHealth::Ready)
                .ok_or(StoreError::WorkerUnavailable(slice.worker_id))?;
            let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE worker_id = $1");
            let held: Vec<ReservationRow> = sqlx::query_as(&sql)
                .bind(slice.worker_id.to_string())
                .fetch_all(&mut *tx)
                .await?;
            let held = held
                .into_iter()
                .map(ReservationRow::into_reservation)
                .collect::<Result<Vec<_>, _>>()?;
            Usage::from_reservations(&held)
                .admit(&worker.capacity, slice)
                .map_err(|violation| StoreError::Capacity {
                    worker_id: slice.worker_id,
                    violation,
                })?;
        }

        let Some(placement) = decision.clone().into_placement() else {
            return Err(StoreError::Conflict("empty placement".to_string()));
        };
        let mut out = stored.clone();
        out.transition(InstanceState::Scheduled, now)?;
        out.placement = Some(placement);
        out.endpoint = None;
        out.start_acknowledged = false;
        out.reservation_expires_at = Some(expires_at);
        out.version += 1;

        for slice in &decision.slices {
            sqlx::query(
                r#"
                INSERT INTO reservations
                    (instance_id, worker_id, gpu_indexes, memory_bytes, cpu_millis, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(out.id.to_string())
            .bind(slice.worker_id.to_string())
            .bind(slice.gpu_indexes.iter().map(|&i| i as i32).collect::<Vec<_>>())
            .bind(slice.memory_bytes as i64)
            .bind(slice.cpu_millis as i64)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }
        write_instance(&mut tx, &out).await?;
        if let Some(event) = instance_event(Some(&stored), &out)? {
            append_event(&mut tx, &event).await?;
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn delete_instance(&self, id: InstanceId) -> Result<bool, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        let row: Option<InstanceRow> =
            sqlx::query_as("DELETE FROM model_instances WHERE id = $1 RETURNING data, version")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(instance) = row.map(InstanceRow::into_instance) else {
            return Ok(false);
        };
        append_payload(
            &mut tx,
            &InstanceDeletedPayload {
                instance_id: id,
                model_id: instance.model_id,
                model_name: instance.model_name,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations ORDER BY worker_id, instance_id");
        let rows: Vec<ReservationRow> = sqlx::query_as(&sql).fetch_all(self.db.pool()).await?;
        rows.into_iter().map(ReservationRow::into_reservation).collect()
    }

    async fn events_after(&self, cursor: EventId, limit: u32) -> Result<EventPage, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT event_id, occurred_at, aggregate_type, aggregate_id, event_type, payload
            FROM event_log
            WHERE event_id > $1
            ORDER BY event_id
            LIMIT $2
            "#,
        )
        .bind(cursor.value())
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        let events = rows
            .into_iter()
            .map(EventRow::into_envelope)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = events.last().map(|e| e.event_id).unwrap_or(cursor);
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn latest_event_id(&self) -> Result<EventId, StoreError> {
        let (id,): (Option<i64>,) = sqlx::query_as("SELECT MAX(event_id) FROM event_log")
            .fetch_one(self.db.pool())
            .await?;
        Ok(id.map(EventId::new).unwrap_or_default())
    }
}
