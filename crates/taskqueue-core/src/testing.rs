//! An in-memory `TaskStore` fixture. Exercises the same eligibility,
//! locking and transaction-scoping contract a real backend must honor,
//! without a database -- used by this crate's own service tests and by
//! other crates' tests via a dev-dependency on `taskqueue-core`.
//!
//! Row locks are simulated with a `locked_by` marker keyed on the owning
//! `Scope`'s identity (see `Scope::id`): `get_first_pending`/
//! `get_processing_by_id` set it when they select a row and release it via
//! a registered rollback/commit action, the same way `PgTaskStore` holds a
//! real `FOR UPDATE` lock open until its transaction ends. Writes made
//! within an active scope are staged and only applied to the map by the
//! scope's commit action (rolling back discards them); a scope that never
//! opens a row lock (e.g. `QueueService::push`'s single-statement scope)
//! has no staging to do and applies its write immediately, mirroring
//! `PgTaskStore`'s pool-fallback path for calls outside any transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{Task, TaskStatus};
use crate::store::{StoreError, StoreResult, TaskStore};
use crate::tx::Scope;

/// Marks a scope as having taken a row lock against this store, so a later
/// `insert`/`update`/`delete` on that scope knows to stage rather than
/// apply directly.
const SCOPE_ACTIVE_KEY: &str = "taskqueue_core::testing::active";

struct Row {
    task: Task,
    locked_by: Option<usize>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tasks: Arc<Mutex<HashMap<Uuid, Row>>>,
}

fn is_eligible(task: &Task, now: chrono::DateTime<Utc>) -> bool {
    match task.status {
        TaskStatus::Pending => true,
        TaskStatus::Processing | TaskStatus::Failed => task.locked_until.map(|lu| lu <= now).unwrap_or(false),
    }
}

fn mark_scope_active(scope: &Scope) {
    if scope.value::<bool>(SCOPE_ACTIVE_KEY).is_none() {
        scope.set_value(SCOPE_ACTIVE_KEY, true);
    }
}

fn scope_is_active(scope: &Scope) -> bool {
    scope.value::<bool>(SCOPE_ACTIVE_KEY).is_some()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `task` directly, assigning an id/created_at if absent, and
    /// returns the id. Bypasses eligibility rules and scope staging --
    /// for test setup only.
    pub fn seed(&self, mut task: Task) -> Uuid {
        let id = task.id.unwrap_or_else(Uuid::new_v4);
        task.id = Some(id);
        task.created_at.get_or_insert_with(Utc::now);
        self.tasks.lock().unwrap().insert(id, Row { task, locked_by: None });
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().unwrap().get(&id).map(|row| row.task.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Registers the scope actions that release a row lock taken by
    /// `get_first_pending`/`get_processing_by_id`: on commit, release only
    /// if still held by this scope (a write may already have released it);
    /// on rollback, release unconditionally so the row becomes selectable
    /// again.
    fn release_lock_on_scope_end(&self, scope: &Scope, id: Uuid, scope_id: usize) {
        let for_commit = self.tasks.clone();
        scope.add_commit(move || async move {
            if let Some(row) = for_commit.lock().unwrap().get_mut(&id) {
                if row.locked_by == Some(scope_id) {
                    row.locked_by = None;
                }
            }
            Ok(())
        });

        let for_rollback = self.tasks.clone();
        scope.add_rollback(move || async move {
            if let Some(row) = for_rollback.lock().unwrap().get_mut(&id) {
                row.locked_by = None;
            }
            Ok(())
        });
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn get_first_pending(&self, scope: &Scope, queue_name: &str) -> StoreResult<Task> {
        let now = Utc::now();
        let scope_id = scope.id();
        let mut tasks = self.tasks.lock().unwrap();

        let mut candidates: Vec<(Uuid, chrono::DateTime<Utc>)> = tasks
            .iter()
            .filter(|(_, row)| {
                row.locked_by.map_or(true, |owner| owner == scope_id)
                    && row.task.queue_name == queue_name
                    && is_eligible(&row.task, now)
            })
            .map(|(id, row)| (*id, row.task.created_at.unwrap_or(now)))
            .collect();
        candidates.sort_by_key(|(_, created_at)| *created_at);

        let (id, _) = candidates.into_iter().next().ok_or(StoreError::NotFound)?;
        let row = tasks.get_mut(&id).expect("candidate id came from this map");
        row.locked_by = Some(scope_id);
        let task = row.task.clone();
        drop(tasks);

        mark_scope_active(scope);
        self.release_lock_on_scope_end(scope, id, scope_id);

        Ok(task)
    }

    async fn get_processing_by_id(&self, scope: &Scope, id: Uuid) -> StoreResult<Task> {
        let now = Utc::now();
        let scope_id = scope.id();
        let mut tasks = self.tasks.lock().unwrap();

        let row = tasks.get_mut(&id).ok_or(StoreError::NotFound)?;
        if row.locked_by.is_some_and(|owner| owner != scope_id) {
            // another scope is holding the row -- fail fast, matching
            // `FOR UPDATE NOWAIT` rather than blocking.
            return Err(StoreError::NotFound);
        }
        if row.task.status != TaskStatus::Processing || !row.task.locked_until.is_some_and(|lu| lu > now) {
            return Err(StoreError::NotFound);
        }

        row.locked_by = Some(scope_id);
        let task = row.task.clone();
        drop(tasks);

        mark_scope_active(scope);
        self.release_lock_on_scope_end(scope, id, scope_id);

        Ok(task)
    }

    async fn insert(&self, scope: &Scope, task: &mut Task) -> StoreResult<()> {
        let id = Uuid::new_v4();
        task.id = Some(id);
        task.created_at = Some(Utc::now());

        if !scope_is_active(scope) {
            self.tasks.lock().unwrap().insert(id, Row { task: task.clone(), locked_by: None });
            return Ok(());
        }

        let staged = task.clone();
        let tasks = self.tasks.clone();
        scope.add_commit(move || async move {
            tasks.lock().unwrap().insert(id, Row { task: staged, locked_by: None });
            Ok(())
        });
        scope.add_rollback(|| async { Ok(()) });

        Ok(())
    }

    async fn update(&self, scope: &Scope, task: &Task) -> StoreResult<()> {
        let id = task.id.ok_or(StoreError::NotFound)?;
        if !self.tasks.lock().unwrap().contains_key(&id) {
            return Err(StoreError::NotFound);
        }

        if !scope_is_active(scope) {
            let mut tasks = self.tasks.lock().unwrap();
            let row = tasks.get_mut(&id).ok_or(StoreError::NotFound)?;
            row.task = task.clone();
            return Ok(());
        }

        let staged = task.clone();
        let tasks = self.tasks.clone();
        scope.add_commit(move || async move {
            if let Some(row) = tasks.lock().unwrap().get_mut(&id) {
                row.task = staged;
            }
            Ok(())
        });
        scope.add_rollback(|| async { Ok(()) });

        Ok(())
    }

    async fn delete(&self, scope: &Scope, id: Uuid) -> StoreResult<()> {
        if !self.tasks.lock().unwrap().contains_key(&id) {
            return Err(StoreError::NotFound);
        }

        if !scope_is_active(scope) {
            self.tasks.lock().unwrap().remove(&id);
            return Ok(());
        }

        let tasks = self.tasks.clone();
        scope.add_commit(move || async move {
            tasks.lock().unwrap().remove(&id);
            Ok(())
        });
        scope.add_rollback(|| async { Ok(()) });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxCoordinator;

    #[tokio::test]
    async fn rolled_back_update_leaves_store_unchanged() {
        let store = InMemoryStore::new();
        let mut task = Task::new("q", "original");
        task.to_processing(Utc::now());
        let id = store.seed(task);

        let (result, _rollback_err): (Result<(), crate::tx::RunError<&str>>, _) =
            TxCoordinator::run(None, |scope| {
                let store = &store;
                async move {
                    let mut leased = store.get_processing_by_id(&scope, id).await.unwrap();
                    leased.payload = "mutated".to_string();
                    store.update(&scope, &leased).await.unwrap();
                    Err("abort after staging the write")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.get(id).unwrap().payload, "original");
    }

    #[tokio::test]
    async fn committed_update_is_visible_after_commit() {
        let store = InMemoryStore::new();
        let mut task = Task::new("q", "original");
        task.to_processing(Utc::now());
        let id = store.seed(task);

        let (result, _): (Result<(), crate::tx::RunError<()>>, _) = TxCoordinator::run(None, |scope| {
            let store = &store;
            async move {
                let mut leased = store.get_processing_by_id(&scope, id).await.unwrap();
                leased.payload = "mutated".to_string();
                store.update(&scope, &leased).await.unwrap();
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(store.get(id).unwrap().payload, "mutated");
    }

    #[tokio::test]
    async fn locked_row_is_invisible_to_a_concurrent_scope() {
        let store = InMemoryStore::new();
        let mut task = Task::new("q", "p");
        task.to_processing(chrono::Utc::now() - chrono::Duration::seconds(1));
        let id = store.seed(task);

        let holder = TxCoordinator::begin(None);
        let leased = store.get_processing_by_id(&holder, id).await.unwrap();
        assert_eq!(leased.id, Some(id));

        let other = TxCoordinator::begin(None);
        assert!(matches!(
            store.get_processing_by_id(&other, id).await,
            Err(StoreError::NotFound)
        ));

        holder.rollback().await.unwrap();
        assert!(store.get_processing_by_id(&other, id).await.is_ok());
    }

    #[tokio::test]
    async fn push_style_insert_outside_any_scope_staging_is_applied_immediately() {
        let store = InMemoryStore::new();
        let scope = TxCoordinator::begin(None);
        let mut task = Task::new("q", "p");

        store.insert(&scope, &mut task).await.unwrap();

        // never committed, but visible: this scope never locked a row, so
        // `insert` applied it directly rather than staging it.
        assert_eq!(store.len(), 1);
    }
}
