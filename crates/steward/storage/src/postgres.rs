//! PostgreSQL adapter for Steward storage.
//!
//! This adapter is the durable backend. Records are stored as JSONB documents
//! next to the indexed columns queries need. Per-run ordering for checkpoints
//! and events is enforced with transaction-scoped advisory locks keyed by run id.

use crate::traits::{ApprovalStore, CheckpointStore, EventStore, RunStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Row};
use steward_types::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, Checkpoint, CheckpointId, ExecutionEvent,
    RequestId, Run, RunFilter, RunId, StepId,
};

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresStewardStorage {
    pool: PgPool,
}

impl PostgresStewardStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS steward_runs (
                run_id TEXT PRIMARY KEY,
                graph_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS steward_runs_status_idx ON steward_runs (status)",
            r#"
            CREATE TABLE IF NOT EXISTS steward_checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                seq BIGINT NOT NULL,
                step_id TEXT NOT NULL,
                state_blob JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (run_id, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_checkpoint_counters (
                run_id TEXT PRIMARY KEY,
                last_seq BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_approval_requests (
                request_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS steward_one_open_request_per_run
                ON steward_approval_requests (run_id) WHERE status = 'open'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steward_events (
                run_id TEXT NOT NULL,
                seq BIGINT NOT NULL,
                event_type TEXT NOT NULL,
                step_id TEXT,
                timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (run_id, seq)
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Schema bootstrap failed");
                    StorageError::Backend(format!("schema init failed: {e}"))
                })?;
        }
        tracing::debug!(statements = ddl.len(), "Schema bootstrap complete");
        Ok(())
    }

    /// Load a request row under `FOR UPDATE`, apply `f`, and write it back.
    async fn mutate_request<T, F>(&self, request_id: &RequestId, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut ApprovalRequest) -> StorageResult<(T, bool)> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let conn = tx.acquire().await.map_err(backend)?;

        let row = sqlx::query(
            "SELECT data FROM steward_approval_requests WHERE request_id = $1 FOR UPDATE",
        )
        .bind(request_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?
        .ok_or_else(|| StorageError::NotFound(format!("approval request {request_id} not found")))?;

        let mut request: ApprovalRequest = decode_json(&row, "data")?;
        let (out, changed) = f(&mut request)?;

        if changed {
            sqlx::query(
                "UPDATE steward_approval_requests SET status = $2, data = $3 WHERE request_id = $1",
            )
            .bind(request_id.as_str())
            .bind(request.status.as_str())
            .bind(serde_json::to_value(&request)?)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(out)
    }
}

#[async_trait]
impl RunStore for PostgresStewardStorage {
    async fn insert_run(&self, run: &Run) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steward_runs (run_id, graph_id, status, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.graph_id.as_str())
        .bind(run.status.as_str())
        .bind(serde_json::to_value(run)?)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE steward_runs
               SET status = $2, data = $3, updated_at = $4
             WHERE run_id = $1
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.status.as_str())
        .bind(serde_json::to_value(run)?)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("run {} not found", run.run_id)));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<Option<Run>> {
        let row = sqlx::query("SELECT data FROM steward_runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| decode_json(&row, "data")).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        let limit = if filter.limit == 0 {
            i64::MAX
        } else {
            to_i64(filter.limit)?
        };
        let rows = sqlx::query(
            r#"
            SELECT data FROM steward_runs
             WHERE ($1::TEXT IS NULL OR status = $1)
               AND ($2::TEXT IS NULL OR graph_id = $2)
               AND (NOT $3 OR status NOT IN ('completed', 'failed', 'cancelled'))
             ORDER BY created_at DESC, run_id ASC
             LIMIT $4
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.graph_id.as_ref().map(|g| g.as_str().to_string()))
        .bind(filter.active_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(|row| decode_json(row, "data")).collect()
    }
}

#[async_trait]
impl CheckpointStore for PostgresStewardStorage {
    async fn save_checkpoint(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        state_blob: Value,
    ) -> StorageResult<CheckpointId> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let conn = tx.acquire().await.map_err(backend)?;

        // Counter row doubles as the per-run lock
        let seq: i64 = sqlx::query(
            r#"
            INSERT INTO steward_checkpoint_counters (run_id, last_seq) VALUES ($1, 1)
            ON CONFLICT (run_id) DO UPDATE
                SET last_seq = steward_checkpoint_counters.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(run_id.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(backend)?
        .try_get("last_seq")
        .map_err(backend)?;

        let checkpoint_id = CheckpointId::generate();
        sqlx::query(
            r#"
            INSERT INTO steward_checkpoints
                (checkpoint_id, run_id, seq, step_id, state_blob, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(checkpoint_id.0.clone())
        .bind(run_id.as_str())
        .bind(seq)
        .bind(step_id.as_str())
        .bind(state_blob)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit().await.map_err(backend)?;
        Ok(checkpoint_id)
    }

    async fn load_latest_checkpoint(&self, run_id: &RunId) -> StorageResult<Checkpoint> {
        let row = sqlx::query(
            r#"
            SELECT checkpoint_id, run_id, seq, step_id, state_blob, created_at
              FROM steward_checkpoints
             WHERE run_id = $1
             ORDER BY seq DESC
             LIMIT 1
            "#,
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StorageError::NotFound(format!("no checkpoint for run {run_id}")))?;
        row_to_checkpoint(&row)
    }

    async fn list_checkpoints(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> StorageResult<Vec<Checkpoint>> {
        let limit = if limit == 0 { i64::MAX } else { to_i64(limit)? };
        let rows = sqlx::query(
            r#"
            SELECT checkpoint_id, run_id, seq, step_id, state_blob, created_at
              FROM steward_checkpoints
             WHERE run_id = $1
             ORDER BY seq DESC
             LIMIT $2
            "#,
        )
        .bind(run_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn delete_checkpoints(&self, run_id: &RunId) -> StorageResult<()> {
        sqlx::query("DELETE FROM steward_checkpoints WHERE run_id = $1")
            .bind(run_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for PostgresStewardStorage {
    async fn open_request(&self, request: &ApprovalRequest) -> StorageResult<()> {
        if !request.is_open() {
            return Err(StorageError::InvalidInput(format!(
                "request {} is not open",
                request.request_id
            )));
        }
        // The partial unique index rejects a second open request for the run
        sqlx::query(
            r#"
            INSERT INTO steward_approval_requests (request_id, run_id, status, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(request.request_id.as_str())
        .bind(request.run_id.as_str())
        .bind(request.status.as_str())
        .bind(serde_json::to_value(request)?)
        .bind(request.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<ApprovalRequest>> {
        let row = sqlx::query("SELECT data FROM steward_approval_requests WHERE request_id = $1")
            .bind(request_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| decode_json(&row, "data")).transpose()
    }

    async fn open_request_for_run(
        &self,
        run_id: &RunId,
    ) -> StorageResult<Option<ApprovalRequest>> {
        let row = sqlx::query(
            "SELECT data FROM steward_approval_requests WHERE run_id = $1 AND status = 'open'",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|row| decode_json(&row, "data")).transpose()
    }

    async fn record_response(&self, response: ApprovalResponse) -> StorageResult<ApprovalRequest> {
        let request_id = response.request_id.clone();
        self.mutate_request(&request_id, move |request| {
            request.apply_response(response)?;
            Ok((request.clone(), true))
        })
        .await
    }

    async fn escalate_request(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ApprovalRequest>> {
        self.mutate_request(request_id, move |request| {
            Ok(match request.escalate(now) {
                Some(_) => (Some(request.clone()), true),
                None => (None, false),
            })
        })
        .await
    }

    async fn close_request(
        &self,
        request_id: &RequestId,
        status: ApprovalStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ApprovalRequest>> {
        if !matches!(status, ApprovalStatus::Expired | ApprovalStatus::Cancelled) {
            return Err(StorageError::InvalidInput(format!(
                "requests are closed as {status} only by decisions"
            )));
        }
        self.mutate_request(request_id, move |request| {
            let closed = request.close(status, at);
            Ok((closed.then(|| request.clone()), closed))
        })
        .await
    }

    async fn list_open_requests(&self) -> StorageResult<Vec<ApprovalRequest>> {
        let rows = sqlx::query(
            "SELECT data FROM steward_approval_requests WHERE status = 'open' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| decode_json(row, "data")).collect()
    }

    async fn list_requests_for_run(&self, run_id: &RunId) -> StorageResult<Vec<ApprovalRequest>> {
        let rows = sqlx::query(
            "SELECT data FROM steward_approval_requests WHERE run_id = $1 ORDER BY created_at",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| decode_json(row, "data")).collect()
    }
}

#[async_trait]
impl EventStore for PostgresStewardStorage {
    async fn append_event(&self, mut event: ExecutionEvent) -> StorageResult<ExecutionEvent> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let conn = tx.acquire().await.map_err(backend)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(event.run_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(backend)?;

        let last: Option<i64> =
            sqlx::query("SELECT MAX(seq) AS last FROM steward_events WHERE run_id = $1")
                .bind(event.run_id.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(backend)?
                .try_get("last")
                .map_err(backend)?;
        let seq = last.unwrap_or(0) + 1;

        sqlx::query(
            r#"
            INSERT INTO steward_events (run_id, seq, event_type, step_id, timestamp, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.run_id.as_str())
        .bind(seq)
        .bind(event.event_type.as_str())
        .bind(event.step_id.as_ref().map(|s| s.as_str().to_string()))
        .bind(event.timestamp)
        .bind(event.payload.clone())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit().await.map_err(backend)?;
        event.seq = seq as u64;
        Ok(event)
    }

    async fn list_events(
        &self,
        run_id: &RunId,
        after_seq: u64,
    ) -> StorageResult<Vec<ExecutionEvent>> {
        let after = i64::try_from(after_seq)
            .map_err(|_| StorageError::InvalidInput("sequence too large".to_string()))?;
        let rows = sqlx::query(
            r#"
            SELECT run_id, seq, event_type, step_id, timestamp, payload
              FROM steward_events
             WHERE run_id = $1 AND seq > $2
             ORDER BY seq ASC
            "#,
        )
        .bind(run_id.as_str())
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn last_event(&self, run_id: &RunId) -> StorageResult<Option<ExecutionEvent>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, seq, event_type, step_id, timestamp, payload
              FROM steward_events
             WHERE run_id = $1
             ORDER BY seq DESC
             LIMIT 1
            "#,
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_event).transpose()
    }
}

fn row_to_checkpoint(row: &PgRow) -> StorageResult<Checkpoint> {
    let seq: i64 = row.try_get("seq").map_err(backend)?;
    Ok(Checkpoint {
        checkpoint_id: CheckpointId::new(row.try_get::<String, _>("checkpoint_id").map_err(backend)?),
        run_id: RunId::new(row.try_get::<String, _>("run_id").map_err(backend)?),
        step_id: StepId::new(row.try_get::<String, _>("step_id").map_err(backend)?),
        seq: seq as u64,
        state_blob: row.try_get("state_blob").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn row_to_event(row: &PgRow) -> StorageResult<ExecutionEvent> {
    let seq: i64 = row.try_get("seq").map_err(backend)?;
    let raw_type: String = row.try_get("event_type").map_err(backend)?;
    let step_id: Option<String> = row.try_get("step_id").map_err(backend)?;
    Ok(ExecutionEvent {
        seq: seq as u64,
        event_type: raw_type.parse().map_err(StorageError::Serialization)?,
        run_id: RunId::new(row.try_get::<String, _>("run_id").map_err(backend)?),
        step_id: step_id.map(StepId::new),
        timestamp: row.try_get("timestamp").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> StorageResult<T> {
    let value: Value = row.try_get(column).map_err(backend)?;
    Ok(serde_json::from_value(value)?)
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            tracing::debug!(constraint = ?db_err.constraint(), "Unique constraint conflict");
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::InvalidInput("limit too large".to_string()))
}
