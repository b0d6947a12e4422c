//! In-process shared store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidings_common::{AppResult, SharedClock, SystemClock};
use tokio::sync::broadcast;

use super::{SessionTransition, SharedStore, SlidingWindowOutcome, keys};

const CHANNEL_CAPACITY: usize = 1024;

struct Expiring<T> {
    value: T,
    expires_at_ms: Option<i64>,
}

impl<T> Expiring<T> {
    const fn forever(value: T) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}

/// Live entry for `key`, dropping it first if it has expired.
fn live<'a, T>(
    map: &'a mut HashMap<String, Expiring<T>>,
    key: &str,
    now_ms: i64,
) -> Option<&'a mut Expiring<T>> {
    if map.get(key).is_some_and(|e| !e.is_live(now_ms)) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Expiring<String>>,
    zsets: HashMap<String, Expiring<Vec<(i64, String)>>>,
    sets: HashMap<String, HashSet<String>>,
    versions: HashMap<String, u64>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl State {
    fn zset(&mut self, key: &str, now_ms: i64) -> &mut Expiring<Vec<(i64, String)>> {
        live(&mut self.zsets, key, now_ms);
        self.zsets
            .entry(key.to_string())
            .or_insert_with(|| Expiring::forever(Vec::new()))
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(members) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = members.remove(member);
        if members.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    fn transition(&mut self, user_id: &str, changed: bool) -> SessionTransition {
        let sessions = self
            .sets
            .get(&keys::sessions(user_id))
            .map_or(0, |s| s.len() as u64);
        let version = self.versions.entry(user_id.to_string()).or_default();
        if changed {
            *version += 1;
        }
        SessionTransition {
            changed,
            sessions,
            version: *version,
        }
    }
}

/// Shared store kept in process memory.
///
/// All operations run under one mutex, which makes every per-key
/// read-modify-write atomic. Expiry is evaluated lazily against the
/// injected clock.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: SharedClock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(std::sync::Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let state = self.state.lock();
        let strings = state.strings.values().filter(|e| e.is_live(now_ms)).count();
        let zsets = state.zsets.values().filter(|e| e.is_live(now_ms)).count();
        strings + zsets + state.sets.len()
    }

    /// Whether the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ttl_deadline(now_ms: i64, ttl_secs: u64) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        Ok(live(&mut state.strings, key, now_ms).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        let now_ms = self.clock.now_millis();
        self.state.lock().strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at_ms: Some(ttl_deadline(now_ms, ttl_secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.zsets.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn adjust_if_exists(&self, key: &str, delta: i64) -> AppResult<Option<i64>> {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        let Some(entry) = live(&mut state.strings, key, now_ms) else {
            return Ok(None);
        };
        let current = entry.value.parse::<i64>().unwrap_or(0);
        let next = current.saturating_add(delta).max(0);
        entry.value = next.to_string();
        Ok(Some(next))
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> AppResult<i64> {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(entry) = live(&mut state.strings, key, now_ms) {
            let next = entry.value.parse::<i64>().unwrap_or(0).saturating_add(1);
            entry.value = next.to_string();
            return Ok(next);
        }
        state.strings.insert(
            key.to_string(),
            Expiring {
                value: "1".to_string(),
                expires_at_ms: Some(ttl_deadline(now_ms, ttl_secs)),
            },
        );
        Ok(1)
    }

    async fn sliding_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max: u64,
    ) -> AppResult<SlidingWindowOutcome> {
        let clock_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        let entry = state.zset(key, clock_ms);
        let log = &mut entry.value;

        log.retain(|(score, _)| *score > now_ms - window_ms);

        let allowed = (log.len() as u64) < max;
        if allowed {
            let at = log.partition_point(|(score, _)| *score <= now_ms);
            log.insert(at, (now_ms, member.to_string()));
        }
        let oldest_ms = log.first().map(|(score, _)| *score);
        let count = log.len() as u64;

        entry.expires_at_ms = Some(clock_ms.saturating_add(window_ms));

        Ok(SlidingWindowOutcome {
            allowed,
            count,
            oldest_ms,
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> AppResult<()> {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        let members = &mut state.zset(key, now_ms).value;
        members.retain(|(_, m)| m != member);
        let at = members.partition_point(|(s, _)| *s <= score);
        members.insert(at, (score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<()> {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        let now_empty = live(&mut state.zsets, key, now_ms).is_some_and(|e| {
            e.value.retain(|(_, m)| m != member);
            e.value.is_empty()
        });
        if now_empty {
            state.zsets.remove(key);
        }
        Ok(())
    }

    async fn zrange(&self, key: &str) -> AppResult<Vec<String>> {
        let now_ms = self.clock.now_millis();
        let mut state = self.state.lock();
        Ok(live(&mut state.zsets, key, now_ms)
            .map(|e| e.value.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn open_session(&self, user_id: &str, session: &str) -> AppResult<SessionTransition> {
        let mut state = self.state.lock();
        let added = state
            .sets
            .entry(keys::sessions(user_id))
            .or_default()
            .insert(session.to_string());
        state
            .sets
            .entry(keys::ONLINE_USERS.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(state.transition(user_id, added))
    }

    async fn close_session(
        &self,
        user_id: &str,
        session: &str,
    ) -> AppResult<SessionTransition> {
        let mut state = self.state.lock();
        let removed = state.srem(&keys::sessions(user_id), session);
        if !state.sets.contains_key(&keys::sessions(user_id)) {
            state.srem(keys::ONLINE_USERS, user_id);
        }
        Ok(state.transition(user_id, removed))
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .is_some_and(|members| members.contains(member)))
    }

    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let state = self.state.lock();
        if let Some(tx) = state.channels.get(channel) {
            // No receivers is not an error for Pub/Sub.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>> {
        let mut state = self.state.lock();
        let tx = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use tidings_common::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (clock, store) = store();
        store.set_with_ttl("k", "v", 10).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::seconds(10));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_adjust_only_when_present_and_clamped() {
        let (_clock, store) = store();
        assert_eq!(store.adjust_if_exists("n", 1).await.unwrap(), None);
        assert!(store.get("n").await.unwrap().is_none());

        store.set_with_ttl("n", "1", 60).await.unwrap();
        assert_eq!(store.adjust_if_exists("n", -1).await.unwrap(), Some(0));
        assert_eq!(store.adjust_if_exists("n", -1).await.unwrap(), Some(0));
        assert_eq!(store.adjust_if_exists("n", 3).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_incr_with_expiry() {
        let (clock, store) = store();
        assert_eq!(store.incr_with_expiry("c", 5).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("c", 5).await.unwrap(), 2);

        clock.advance(Duration::seconds(5));
        assert_eq!(store.incr_with_expiry("c", 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sliding_window_evicts_and_rejects() {
        let (_clock, store) = store();
        for (i, at) in [1_000, 1_500].into_iter().enumerate() {
            let out = store
                .sliding_window("w", &format!("m{i}"), at, 1_000, 2)
                .await
                .unwrap();
            assert!(out.allowed);
        }

        let rejected = store.sliding_window("w", "m2", 1_900, 1_000, 2).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.count, 2);
        assert_eq!(rejected.oldest_ms, Some(1_000));

        // 1_000 is evicted once it is a full window old
        let admitted = store.sliding_window("w", "m3", 2_000, 1_000, 2).await.unwrap();
        assert!(admitted.allowed);
        assert_eq!(admitted.oldest_ms, Some(1_500));
    }

    #[tokio::test]
    async fn test_sorted_set_last_write_wins() {
        let (_clock, store) = store();
        store.zadd("loc", "alice", 10).await.unwrap();
        store.zadd("loc", "bob", 5).await.unwrap();
        store.zadd("loc", "alice", 1).await.unwrap();

        assert_eq!(store.zrange("loc").await.unwrap(), vec!["alice", "bob"]);

        store.zrem("loc", "alice").await.unwrap();
        store.zrem("loc", "bob").await.unwrap();
        assert!(store.zrange("loc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_counted_per_user() {
        let (_clock, store) = store();
        let first = store.open_session("alice", "a1").await.unwrap();
        assert!(first.came_online());
        assert!(store.sismember(keys::ONLINE_USERS, "alice").await.unwrap());

        let second = store.open_session("alice", "b1").await.unwrap();
        assert!(!second.came_online());
        assert_eq!(second.sessions, 2);
        assert!(second.version > first.version);

        let closed = store.close_session("alice", "a1").await.unwrap();
        assert!(!closed.went_offline());
        assert!(store.sismember(keys::ONLINE_USERS, "alice").await.unwrap());

        let last = store.close_session("alice", "b1").await.unwrap();
        assert!(last.went_offline());
        assert!(!store.sismember(keys::ONLINE_USERS, "alice").await.unwrap());

        // Closing an unknown session changes nothing.
        let again = store.close_session("alice", "b1").await.unwrap();
        assert!(!again.changed);
        assert!(!again.went_offline());
        assert_eq!(again.version, last.version);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let (_clock, store) = store();
        store.publish("ch", "dropped").await.unwrap();

        let mut rx = store.subscribe("ch").await.unwrap();
        store.publish("ch", "hello").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
