//! Push (enqueue) and Pop (lease) -- the producer- and poller-facing half
//! of the broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::domain::Task;
use crate::error::{fold_run_result, Error, Result};
use crate::idempotency::IdempotencyCache;
use crate::store::{StoreError, TaskStore};
use crate::tx::TxCoordinator;

/// Poll interval used by `subscribe_stream` while a queue is empty.
const SUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct PushRequest {
    pub queue_name: String,
    pub payload: String,
    pub idempotency_key: Option<String>,
}

pub struct QueueService {
    clock: Arc<dyn Clock>,
    idempotency: Arc<IdempotencyCache>,
    store: Arc<dyn TaskStore>,
}

impl QueueService {
    pub fn new(clock: Arc<dyn Clock>, idempotency: Arc<IdempotencyCache>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            clock,
            idempotency,
            store,
        }
    }

    /// Enqueues a new pending task. A single mutation, so no transaction
    /// scope is required. Idempotent retries (same key within the TTL)
    /// return the first call's task unchanged rather than inserting again.
    pub async fn push(&self, req: PushRequest) -> Result<Task> {
        if let Some(key) = &req.idempotency_key {
            if let Some(task) = self.idempotency.get_push(key) {
                return Ok(task);
            }
        }

        let mut task = Task::new(req.queue_name, req.payload);
        let scope = TxCoordinator::begin(None);
        self.store
            .save(&scope, &mut task)
            .await
            .map_err(Error::SaveTask)?;

        if let Some(key) = req.idempotency_key {
            self.idempotency.put_push(key, task.clone());
        }

        Ok(task)
    }

    /// Leases the oldest eligible task in `queue_name`, or `None` if the
    /// queue has nothing ready. Runs inside a fresh transaction scope so
    /// the row lock `get_first_pending` takes is held until the subsequent
    /// `save` commits.
    pub async fn pop(&self, queue_name: &str) -> Result<Option<Task>> {
        let now = self.clock.now();
        let store = self.store.clone();
        let queue_name = queue_name.to_string();

        let (result, rollback_err) = TxCoordinator::run(None, move |scope| {
            let store = store.clone();
            async move {
                let mut task = match store.get_first_pending(&scope, &queue_name).await {
                    Ok(task) => task,
                    Err(StoreError::NotFound) => return Ok(None),
                    Err(e) => return Err(Error::GetFirstPending(e)),
                };

                task.to_processing(now);
                store.save(&scope, &mut task).await.map_err(Error::SaveTask)?;
                Ok(Some(task))
            }
        })
        .await;

        fold_run_result("queue.pop", result, rollback_err)
    }

    /// A stream of freshly-leased tasks for `queue_name`: polls `pop` under
    /// a small delay when the queue is empty. Every value handed back has
    /// already been transitioned to `processing` -- delivery implies an
    /// active lease. The channel closes when `cancel` fires.
    pub fn subscribe_stream(
        self: &Arc<Self>,
        queue_name: String,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Task> {
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match this.pop(&queue_name).await {
                    Ok(Some(task)) => {
                        if tx.send(task).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(SUBSCRIBE_POLL_INTERVAL) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue_name, error = %e, "subscribe_stream pop error");
                        tokio::select! {
                            _ = tokio::time::sleep(SUBSCRIBE_POLL_INTERVAL) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryStore;

    fn service(store: Arc<InMemoryStore>) -> QueueService {
        QueueService::new(
            Arc::new(crate::clock::SystemClock),
            Arc::new(IdempotencyCache::new()),
            store,
        )
    }

    #[tokio::test]
    async fn push_then_pop() {
        let svc = service(Arc::new(InMemoryStore::new()));

        let pushed = svc
            .push(PushRequest {
                queue_name: "q".into(),
                payload: "p".into(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        assert_eq!(pushed.status, crate::domain::TaskStatus::Pending);

        let popped = svc.pop("q").await.unwrap().expect("task available");
        assert_eq!(popped.id, pushed.id);
        assert_eq!(popped.status, crate::domain::TaskStatus::Processing);
        assert!(popped.locked_until.is_some());
    }

    #[tokio::test]
    async fn pop_on_empty_queue_returns_none() {
        let svc = service(Arc::new(InMemoryStore::new()));
        assert!(svc.pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotent_push_returns_first_task_and_one_row() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store.clone());

        let first = svc
            .push(PushRequest {
                queue_name: "q".into(),
                payload: "first".into(),
                idempotency_key: Some("k".into()),
            })
            .await
            .unwrap();

        let second = svc
            .push(PushRequest {
                queue_name: "q".into(),
                payload: "second".into(),
                idempotency_key: Some("k".into()),
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.payload, "first");
        assert_eq!(store.len(), 1);
    }
}
