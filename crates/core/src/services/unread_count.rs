//! Cache-aside unread notification counts.

use std::sync::Arc;

use tidings_common::{AppResult, SharedClock};
use tracing::{debug, warn};

use super::notification_store::NotificationStore;
use crate::store::{SharedStoreRef, keys};

/// Per-user unread counter in the shared store.
///
/// The cached value is a hint: increments and decrements only touch a key
/// that already exists, and a miss recounts from the durable store. Store
/// failures never reach the caller.
#[derive(Clone)]
pub struct UnreadCountCache {
    store: SharedStoreRef,
    notifications: Arc<dyn NotificationStore>,
    clock: SharedClock,
    ttl_secs: u64,
}

impl UnreadCountCache {
    #[must_use]
    pub fn new(
        store: SharedStoreRef,
        notifications: Arc<dyn NotificationStore>,
        clock: SharedClock,
        ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            notifications,
            clock,
            ttl_secs,
        }
    }

    /// Unread, non-expired notifications of `user_id`.
    pub async fn get_unread_count(&self, user_id: &str) -> AppResult<u64> {
        let key = keys::unread_count(user_id);

        let cache_ok = match self.store.get(&key).await {
            Ok(Some(raw)) => match raw.parse::<u64>() {
                Ok(count) => return Ok(count),
                Err(_) => {
                    warn!(user_id, value = %raw, "Discarding malformed unread count");
                    true
                }
            },
            Ok(None) => true,
            Err(e) => {
                warn!(user_id, error = %e, "Unread count cache read failed");
                false
            }
        };

        let count = self
            .notifications
            .count_unread(user_id, self.clock.now())
            .await?;

        if cache_ok {
            if let Err(e) = self
                .store
                .set_with_ttl(&key, &count.to_string(), self.ttl_secs)
                .await
            {
                warn!(user_id, error = %e, "Failed to cache unread count");
            } else {
                debug!(user_id, count, "Cached unread count");
            }
        }

        Ok(count)
    }

    /// +1 if the count is cached.
    pub async fn increment(&self, user_id: &str) {
        self.adjust(user_id, 1).await;
    }

    /// -1 if the count is cached, never below zero.
    pub async fn decrement(&self, user_id: &str) {
        self.adjust(user_id, -1).await;
    }

    async fn adjust(&self, user_id: &str, delta: i64) {
        if let Err(e) = self
            .store
            .adjust_if_exists(&keys::unread_count(user_id), delta)
            .await
        {
            warn!(user_id, delta, error = %e, "Failed to adjust unread count");
        }
    }

    /// Drop the cached count; the next read recounts.
    pub async fn invalidate(&self, user_id: &str) {
        if let Err(e) = self.store.delete(&keys::unread_count(user_id)).await {
            warn!(user_id, error = %e, "Failed to invalidate unread count");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use crate::testing::{InMemoryNotificationStore, unread_notification};
    use tidings_common::{Clock, ManualClock};

    struct Fixture {
        cache: UnreadCountCache,
        store: Arc<MemoryStore>,
        notifications: Arc<InMemoryNotificationStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let notifications = Arc::new(InMemoryNotificationStore::new());
        let cache = UnreadCountCache::new(store.clone(), notifications.clone(), clock.clone(), 300);
        Fixture {
            cache,
            store,
            notifications,
            clock,
        }
    }

    #[tokio::test]
    async fn test_miss_recounts_and_caches() {
        let f = fixture();
        f.notifications.seed(unread_notification("n1", "u1", f.clock.now()));
        f.notifications.seed(unread_notification("n2", "u1", f.clock.now()));

        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 2);
        assert_eq!(
            f.store.get(&keys::unread_count("u1")).await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_hit_is_served_from_cache() {
        let f = fixture();
        f.store
            .set_with_ttl(&keys::unread_count("u1"), "9", 300)
            .await
            .unwrap();

        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_increment_never_seeds() {
        let f = fixture();
        f.cache.increment("u1").await;
        assert!(f.store.get(&keys::unread_count("u1")).await.unwrap().is_none());

        f.notifications.seed(unread_notification("n1", "u1", f.clock.now()));
        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 1);
        f.cache.increment("u1").await;
        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_decrement_clamps_at_zero() {
        let f = fixture();
        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 0);

        f.cache.decrement("u1").await;
        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_self_heals() {
        let f = fixture();
        f.store
            .set_with_ttl(&keys::unread_count("u1"), "42", 300)
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::seconds(301));
        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let f = fixture();
        f.store
            .set_with_ttl(&keys::unread_count("u1"), "5", 300)
            .await
            .unwrap();

        f.cache.invalidate("u1").await;
        assert_eq!(f.cache.get_unread_count("u1").await.unwrap(), 0);
    }
}
