//! Ack (complete) and Nack (report failure) -- the consumer-facing half of
//! the broker, operating on a single task by id.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{fold_run_result, Error, Result};
use crate::idempotency::IdempotencyCache;
use crate::store::{StoreError, TaskStore};
use crate::tx::TxCoordinator;

pub struct TaskService {
    clock: Arc<dyn Clock>,
    idempotency: Arc<IdempotencyCache>,
    store: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(clock: Arc<dyn Clock>, idempotency: Arc<IdempotencyCache>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            clock,
            idempotency,
            store,
        }
    }

    /// Completes a task by deleting its row. A processing row that's
    /// already gone (already acked, or its lease expired and it was
    /// re-leased to someone else) is treated as success, not an error --
    /// the caller's goal ("this task is done") is already satisfied.
    /// Any other store failure still surfaces.
    pub async fn ack(&self, id: Uuid, idempotency_key: Option<String>) -> Result<()> {
        if let Some(key) = &idempotency_key {
            if self.idempotency.has_ack(key) {
                return Ok(());
            }
        }

        let store = self.store.clone();
        let (result, rollback_err) = TxCoordinator::run(None, move |scope| {
            let store = store.clone();
            async move {
                match store.get_processing_by_id(&scope, id).await {
                    Ok(_) => {}
                    Err(StoreError::NotFound) => return Ok(()),
                    Err(e) => return Err(Error::GetProcessingById(e)),
                }
                match store.delete(&scope, id).await {
                    Ok(()) => Ok(()),
                    Err(StoreError::NotFound) => Ok(()),
                    Err(e) => Err(Error::SaveTask(e)),
                }
            }
        })
        .await;

        let outcome = fold_run_result("task.ack", result, rollback_err);
        if outcome.is_ok() {
            if let Some(key) = idempotency_key {
                self.idempotency.put_ack(key);
            }
        }
        outcome
    }

    /// Reports a processing task as failed, moving it to `failed` with the
    /// next back-off applied. A processing row that's already gone is a
    /// no-op success, matching `ack`'s semantics.
    pub async fn nack(&self, id: Uuid, idempotency_key: Option<String>) -> Result<()> {
        if let Some(key) = &idempotency_key {
            if self.idempotency.has_nack(key) {
                return Ok(());
            }
        }

        let now = self.clock.now();
        let store = self.store.clone();
        let (result, rollback_err) = TxCoordinator::run(None, move |scope| {
            let store = store.clone();
            async move {
                let mut task = match store.get_processing_by_id(&scope, id).await {
                    Ok(task) => task,
                    Err(StoreError::NotFound) => return Ok(()),
                    Err(e) => return Err(Error::GetProcessingById(e)),
                };

                task.to_failed(now);
                store.save(&scope, &mut task).await.map_err(Error::SaveTask)?;
                Ok(())
            }
        })
        .await;

        let outcome = fold_run_result("task.nack", result, rollback_err);
        if outcome.is_ok() {
            if let Some(key) = idempotency_key {
                self.idempotency.put_nack(key);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::{Task, TaskStatus};
    use crate::testing::InMemoryStore;

    fn service(store: Arc<InMemoryStore>) -> TaskService {
        TaskService::new(Arc::new(SystemClock), Arc::new(IdempotencyCache::new()), store)
    }

    #[tokio::test]
    async fn ack_deletes_processing_task() {
        let store = Arc::new(InMemoryStore::new());
        let mut task = Task::new("q", "p");
        task.to_processing(chrono::Utc::now());
        let id = store.seed(task);

        let svc = service(store.clone());
        svc.ack(id, None).await.unwrap();
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn ack_on_missing_task_is_a_no_op_success() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store);
        svc.ack(Uuid::new_v4(), None).await.unwrap();
    }

    #[tokio::test]
    async fn nack_moves_processing_to_failed_with_first_backoff() {
        let store = Arc::new(InMemoryStore::new());
        let mut task = Task::new("q", "p");
        task.to_processing(chrono::Utc::now());
        let id = store.seed(task);

        let svc = service(store.clone());
        svc.nack(id, None).await.unwrap();

        let task = store.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_fail_duration, Some(crate::domain::FIRST_FAIL_BACKOFF));
    }

    #[tokio::test]
    async fn repeated_nack_with_same_key_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let mut task = Task::new("q", "p");
        task.to_processing(chrono::Utc::now());
        let id = store.seed(task);

        let svc = service(store.clone());
        svc.nack(id, Some("k".into())).await.unwrap();
        let after_first = store.get(id).unwrap().last_fail_duration;

        // Second nack is swallowed by the idempotency cache, not applied
        // again -- the store still says `id` is `failed`, not re-failed.
        svc.nack(id, Some("k".into())).await.unwrap();
        let after_second = store.get(id).unwrap().last_fail_duration;

        assert_eq!(after_first, after_second);
    }
}
