//! Process-local dedup cache for push/ack/nack, keyed by caller-supplied
//! idempotency key. Entries expire after `TTL`; non-persistent and
//! unreplicated by design (see SPEC_FULL.md §9 -- abstracting this behind an
//! external store is left to multi-instance deployments, out of scope here).

use std::time::Duration;

use dashmap::DashMap;

use crate::domain::Task;

pub const TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct IdempotencyCache {
    push: DashMap<String, Task>,
    ack: DashMap<String, ()>,
    nack: DashMap<String, ()>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_push(&self, key: &str) -> Option<Task> {
        self.push.get(key).map(|r| r.clone())
    }

    pub fn put_push(self: &std::sync::Arc<Self>, key: String, task: Task) {
        self.push.insert(key.clone(), task);
        self.schedule_expiry(key, CacheKind::Push);
    }

    pub fn has_ack(&self, key: &str) -> bool {
        self.ack.contains_key(key)
    }

    pub fn put_ack(self: &std::sync::Arc<Self>, key: String) {
        self.ack.insert(key.clone(), ());
        self.schedule_expiry(key, CacheKind::Ack);
    }

    pub fn has_nack(&self, key: &str) -> bool {
        self.nack.contains_key(key)
    }

    pub fn put_nack(self: &std::sync::Arc<Self>, key: String) {
        self.nack.insert(key.clone(), ());
        self.schedule_expiry(key, CacheKind::Nack);
    }

    fn schedule_expiry(self: &std::sync::Arc<Self>, key: String, kind: CacheKind) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TTL).await;
            match kind {
                CacheKind::Push => {
                    this.push.remove(&key);
                }
                CacheKind::Ack => {
                    this.ack.remove(&key);
                }
                CacheKind::Nack => {
                    this.nack.remove(&key);
                }
            }
        });
    }
}

enum CacheKind {
    Push,
    Ack,
    Nack,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn push_entry_expires_after_ttl() {
        let cache = Arc::new(IdempotencyCache::new());
        cache.put_push("k".into(), Task::new("q", "p"));
        assert!(cache.get_push("k").is_some());

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert!(cache.get_push("k").is_none());
    }

    #[tokio::test]
    async fn ack_and_nack_are_independent_namespaces() {
        let cache = Arc::new(IdempotencyCache::new());
        cache.put_ack("k".into());
        assert!(cache.has_ack("k"));
        assert!(!cache.has_nack("k"));
    }
}
