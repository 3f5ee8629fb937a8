//! The durable storage contract. Concrete backends (e.g. `taskqueue-postgres`)
//! implement this against their own connection/transaction types; the
//! domain services in this crate only ever see `dyn TaskStore`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::Task;
use crate::tx::Scope;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage of tasks with row-level locking.
///
/// `get_first_pending` and `get_processing_by_id` must participate in the
/// caller's transaction scope when one is active (see `tx::Scope`), so that
/// the row lock they take is held until the scope commits or rolls back.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Oldest-by-created_at task in `queue_name` eligible for lease: either
    /// pending, or processing/failed with an expired lease. Locks the row
    /// for the scope, skipping rows locked by other transactions.
    async fn get_first_pending(&self, scope: &Scope, queue_name: &str) -> StoreResult<Task>;

    /// The task only if it is currently `processing` with a live lease.
    /// Locks the row non-blocking: a row locked elsewhere surfaces as
    /// `StoreError::NotFound` rather than waiting.
    async fn get_processing_by_id(&self, scope: &Scope, id: Uuid) -> StoreResult<Task>;

    /// Assigns `id` and `created_at` and writes every field.
    async fn insert(&self, scope: &Scope, task: &mut Task) -> StoreResult<()>;

    /// Overwrites status, locked_until and last_fail_duration by id.
    async fn update(&self, scope: &Scope, task: &Task) -> StoreResult<()>;

    /// Removes the row unconditionally; callers gate on status.
    async fn delete(&self, scope: &Scope, id: Uuid) -> StoreResult<()>;

    /// Dispatches to `insert` when `task.id` is absent, `update` otherwise.
    async fn save(&self, scope: &Scope, task: &mut Task) -> StoreResult<()> {
        if task.id.is_none() {
            self.insert(scope, task).await
        } else {
            self.update(scope, task).await
        }
    }
}
