//! Concrete `TaskStore` against Postgres via `sqlx`.
//!
//! Row locking follows spec: `get_first_pending` uses `FOR UPDATE SKIP
//! LOCKED` (concurrent pops skip each other's rows rather than waiting),
//! `get_processing_by_id` uses `FOR UPDATE NOWAIT` (fail fast -- a row
//! locked by another transaction surfaces as `StoreError::NotFound` rather
//! than blocking).
//!
//! A method participates in the caller's scope only if a transaction is
//! already cached there (via [`get_or_open_tx`]); with no active scope it
//! runs straight against the pool, matching `QueueService::push`'s
//! single-statement, scope-free call.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use taskqueue_core::domain::{Task, TaskStatus};
use taskqueue_core::store::{StoreError, StoreResult, TaskStore};
use taskqueue_core::tx::Scope;

const SCOPE_TX_KEY: &str = "taskqueue_postgres::tx";

type SharedTx = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Returns the transaction cached in `scope`, opening and registering
    /// one on first use -- every subsequent call within the same scope
    /// shares it, so the row lock taken by `get_first_pending`/
    /// `get_processing_by_id` is held until the scope commits or rolls
    /// back.
    async fn get_or_open_tx(&self, scope: &Scope) -> StoreResult<SharedTx> {
        if let Some(tx) = scope.value::<SharedTx>(SCOPE_TX_KEY) {
            return Ok(tx);
        }

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let shared: SharedTx = Arc::new(Mutex::new(Some(tx)));

        scope.set_value(SCOPE_TX_KEY, shared.clone());

        let commit_handle = shared.clone();
        scope.add_commit(move || async move {
            let tx = commit_handle.lock().await.take();
            match tx {
                Some(tx) => tx.commit().await.map_err(|e| e.to_string()),
                None => Ok(()),
            }
        });

        let rollback_handle = shared.clone();
        scope.add_rollback(move || async move {
            let tx = rollback_handle.lock().await.take();
            match tx {
                Some(tx) => tx.rollback().await.map_err(|e| e.to_string()),
                None => Ok(()),
            }
        });

        Ok(shared)
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    queue_name: String,
    payload: String,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    locked_until: Option<chrono::DateTime<chrono::Utc>>,
    last_fail_duration: Option<i64>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> StoreResult<Self> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(StoreError::Backend)?;

        Ok(Task {
            id: Some(row.id),
            queue_name: row.queue_name,
            payload: row.payload,
            status,
            created_at: Some(row.created_at),
            locked_until: row.locked_until,
            last_fail_duration: row.last_fail_duration.map(|s| std::time::Duration::from_secs(s as u64)),
        })
    }
}

const SELECT_COLUMNS: &str = "id, queue_name, payload, status, created_at, locked_until, last_fail_duration";

#[async_trait::async_trait]
impl TaskStore for PgTaskStore {
    async fn get_first_pending(&self, scope: &Scope, queue_name: &str) -> StoreResult<Task> {
        let shared = self.get_or_open_tx(scope).await?;
        let mut guard = shared.lock().await;
        let tx = guard.as_mut().expect("tx present immediately after open");

        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE queue_name = $1 \
               AND (status = 'pending' OR (status IN ('processing', 'failed') AND locked_until <= now())) \
             ORDER BY created_at ASC \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1"
        );

        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(queue_name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.ok_or(StoreError::NotFound)?.try_into()
    }

    async fn get_processing_by_id(&self, scope: &Scope, id: Uuid) -> StoreResult<Task> {
        let shared = self.get_or_open_tx(scope).await?;
        let mut guard = shared.lock().await;
        let tx = guard.as_mut().expect("tx present immediately after open");

        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE id = $1 AND status = 'processing' AND locked_until > now() \
             FOR UPDATE NOWAIT"
        );

        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| {
                // A lock-not-available error behaves like NotFound: fail
                // fast rather than wait, per the NOWAIT contract.
                if is_lock_not_available(&e) {
                    StoreError::NotFound
                } else {
                    StoreError::Backend(e.to_string())
                }
            });

        match row {
            Ok(Some(row)) => row.try_into(),
            Ok(None) => Err(StoreError::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn insert(&self, scope: &Scope, task: &mut Task) -> StoreResult<()> {
        let query = "INSERT INTO tasks (queue_name, payload, status) VALUES ($1, $2, $3) \
                      RETURNING id, created_at";

        let row = if let Some(shared) = scope.value::<SharedTx>(SCOPE_TX_KEY) {
            let mut guard = shared.lock().await;
            let tx = guard.as_mut().expect("tx present");
            sqlx::query(query)
                .bind(&task.queue_name)
                .bind(&task.payload)
                .bind(task.status.as_str())
                .fetch_one(&mut **tx)
                .await
        } else {
            sqlx::query(query)
                .bind(&task.queue_name)
                .bind(&task.payload)
                .bind(task.status.as_str())
                .fetch_one(&self.pool)
                .await
        }
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        task.id = Some(row.get("id"));
        task.created_at = Some(row.get("created_at"));
        Ok(())
    }

    async fn update(&self, scope: &Scope, task: &Task) -> StoreResult<()> {
        let id = task.id.ok_or(StoreError::NotFound)?;
        let last_fail_seconds = task.last_fail_duration.map(|d| d.as_secs() as i64);

        let query = "UPDATE tasks SET status = $1, locked_until = $2, last_fail_duration = $3 WHERE id = $4";

        let result = if let Some(shared) = scope.value::<SharedTx>(SCOPE_TX_KEY) {
            let mut guard = shared.lock().await;
            let tx = guard.as_mut().expect("tx present");
            sqlx::query(query)
                .bind(task.status.as_str())
                .bind(task.locked_until)
                .bind(last_fail_seconds)
                .bind(id)
                .execute(&mut **tx)
                .await
        } else {
            sqlx::query(query)
                .bind(task.status.as_str())
                .bind(task.locked_until)
                .bind(last_fail_seconds)
                .bind(id)
                .execute(&self.pool)
                .await
        }
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, scope: &Scope, id: Uuid) -> StoreResult<()> {
        let query = "DELETE FROM tasks WHERE id = $1";

        let result = if let Some(shared) = scope.value::<SharedTx>(SCOPE_TX_KEY) {
            let mut guard = shared.lock().await;
            let tx = guard.as_mut().expect("tx present");
            sqlx::query(query).bind(id).execute(&mut **tx).await
        } else {
            sqlx::query(query).bind(id).execute(&self.pool).await
        }
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Postgres signals `FOR UPDATE NOWAIT` lock contention as SQLSTATE 55P03.
fn is_lock_not_available(err: &sqlx::Error) -> bool {
    matches!(err.as_database_error().and_then(|e| e.code()), Some(code) if code == "55P03")
}
