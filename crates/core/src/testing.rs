//! In-memory fakes for the engine's external seams.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tidings_common::{AppError, AppResult, SharedClock};
use tidings_db::entities::{
    notification::{self, NotificationType},
    notification_preference, notification_queue,
    user::UserRole,
};
use tidings_db::repositories::NotificationFilter;
use tokio::sync::{Notify, broadcast};

use crate::services::directory::{UserDirectory, UserSummary};
use crate::services::notification_store::NotificationStore;
use crate::store::{MemoryStore, SessionTransition, SharedStore, SlidingWindowOutcome};

/// Preferences with every category and the email/push channels enabled.
#[must_use]
pub fn default_preferences(user_id: &str) -> notification_preference::Model {
    notification_preference::Model {
        user_id: user_id.to_string(),
        post_likes: true,
        comments: true,
        new_followers: true,
        mentions: true,
        direct_messages: true,
        group_invites: true,
        event_reminders: true,
        marketing: false,
        weekly_digest: true,
        email_notifications: true,
        push_notifications: true,
        sms_notifications: false,
        updated_at: Utc::now().into(),
    }
}

/// An unread, non-expiring mention.
#[must_use]
pub fn unread_notification(id: &str, user_id: &str, created_at: DateTime<Utc>) -> notification::Model {
    notification::Model {
        id: id.to_string(),
        user_id: user_id.to_string(),
        actor_id: None,
        notification_type: NotificationType::Mention,
        entity_id: None,
        entity_type: None,
        title: "Mentioned".to_string(),
        message: String::new(),
        data: None,
        image_url: None,
        action_url: None,
        priority: 1,
        is_read: false,
        read_at: None,
        expires_at: None,
        created_at: created_at.into(),
    }
}

fn is_live(n: &notification::Model, now: DateTime<Utc>) -> bool {
    n.expires_at.is_none_or(|at| at.with_timezone(&Utc) > now)
}

/// [`NotificationStore`] kept in memory.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    notifications: Mutex<Vec<notification::Model>>,
    preferences: Mutex<HashMap<String, notification_preference::Model>>,
    queue: Mutex<Vec<notification_queue::Model>>,
    transient_failures: AtomicU32,
    lost_acks: AtomicU32,
}

impl InMemoryNotificationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly.
    pub fn seed(&self, model: notification::Model) {
        self.notifications.lock().push(model);
    }

    pub fn set_preferences(&self, prefs: notification_preference::Model) {
        self.preferences.lock().insert(prefs.user_id.clone(), prefs);
    }

    /// Make the next `count` idempotent writes fail with a transient conflict.
    pub fn fail_next_writes(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` read-state writes commit and then still fail
    /// with a transient conflict, as when the acknowledgement is lost.
    pub fn lose_next_acks(&self, count: u32) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<notification::Model> {
        self.notifications.lock().iter().find(|n| n.id == id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<notification::Model> {
        self.notifications.lock().clone()
    }

    #[must_use]
    pub fn queued(&self) -> Vec<notification_queue::Model> {
        self.queue.lock().clone()
    }

    fn injected_failure(&self) -> AppResult<()> {
        Self::take_failure(&self.transient_failures)
    }

    fn lost_ack(&self) -> AppResult<()> {
        Self::take_failure(&self.lost_acks)
    }

    fn take_failure(counter: &AtomicU32) -> AppResult<()> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(AppError::TransientConflict(
                "could not serialize access due to concurrent update".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, model: notification::Model) -> AppResult<notification::Model> {
        self.notifications.lock().push(model.clone());
        Ok(model)
    }

    async fn insert_many(
        &self,
        models: Vec<notification::Model>,
    ) -> AppResult<Vec<notification::Model>> {
        self.notifications.lock().extend(models.iter().cloned());
        Ok(models)
    }

    async fn find_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>> {
        Ok(self
            .notifications
            .lock()
            .iter()
            .find(|n| n.id == id && n.user_id == user_id)
            .cloned())
    }

    async fn list(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<notification::Model>> {
        let mut rows: Vec<_> = self
            .notifications
            .lock()
            .iter()
            .filter(|n| n.user_id == user_id && is_live(n, now))
            .filter(|n| !filter.unread_only || !n.is_read)
            .filter(|n| filter.types.is_empty() || filter.types.contains(&n.notification_type))
            .filter(|n| filter.until_id.as_ref().is_none_or(|until| n.id < *until))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(usize::try_from(filter.limit).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn count_unread(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        Ok(self
            .notifications
            .lock()
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read && is_live(n, now))
            .count() as u64)
    }

    async fn mark_read(&self, id: &str, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        self.injected_failure()?;
        let changed = {
            let mut rows = self.notifications.lock();
            match rows
                .iter_mut()
                .find(|n| n.id == id && n.user_id == user_id && !n.is_read)
            {
                Some(n) => {
                    n.is_read = true;
                    n.read_at = Some(now.into());
                    1
                }
                None => 0,
            }
        };
        self.lost_ack()?;
        Ok(changed)
    }

    async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        self.injected_failure()?;
        let mut changed = 0;
        for n in self.notifications.lock().iter_mut() {
            if n.user_id == user_id && !n.is_read && is_live(n, now) {
                n.is_read = true;
                n.read_at = Some(now.into());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>> {
        self.injected_failure()?;
        let mut rows = self.notifications.lock();
        Ok(rows
            .iter()
            .position(|n| n.id == id && n.user_id == user_id)
            .map(|pos| rows.remove(pos)))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.injected_failure()?;
        let mut rows = self.notifications.lock();
        let before = rows.len();
        rows.retain(|n| n.expires_at.is_none_or(|at| at.with_timezone(&Utc) >= now));
        Ok((before - rows.len()) as u64)
    }

    async fn find_preferences(
        &self,
        user_id: &str,
    ) -> AppResult<Option<notification_preference::Model>> {
        Ok(self.preferences.lock().get(user_id).cloned())
    }

    async fn find_preferences_many(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<notification_preference::Model>> {
        let prefs = self.preferences.lock();
        Ok(user_ids.iter().filter_map(|id| prefs.get(id).cloned()).collect())
    }

    async fn enqueue(&self, items: Vec<notification_queue::Model>) -> AppResult<u64> {
        let count = items.len() as u64;
        self.queue.lock().extend(items);
        Ok(count)
    }
}

/// [`UserDirectory`] over a fixed set of users.
#[derive(Default)]
pub struct StaticUserDirectory {
    users: Mutex<HashMap<String, (UserSummary, String)>>,
    follows: Mutex<Vec<(String, String)>>,
}

impl StaticUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user whose bearer token is `token`.
    pub fn add_user(&self, id: &str, token: &str) {
        let summary = UserSummary {
            id: id.to_string(),
            username: id.to_string(),
            name: None,
            avatar_url: None,
            role: UserRole::User,
        };
        self.users
            .lock()
            .insert(id.to_string(), (summary, token.to_string()));
    }

    /// `follower` follows `followee`.
    pub fn follow(&self, follower: &str, followee: &str) {
        self.follows
            .lock()
            .push((follower.to_string(), followee.to_string()));
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn authenticate(&self, token: &str) -> AppResult<Option<UserSummary>> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .users
            .lock()
            .values()
            .find(|(_, t)| t == token)
            .map(|(u, _)| u.clone()))
    }

    async fn find_users(&self, ids: &[String]) -> AppResult<Vec<UserSummary>> {
        let users = self.users.lock();
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(|(u, _)| u.clone()))
            .collect())
    }

    async fn followee_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        Ok(self
            .follows
            .lock()
            .iter()
            .filter(|(follower, _)| follower == user_id)
            .map(|(_, followee)| followee.clone())
            .collect())
    }

    async fn follower_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        Ok(self
            .follows
            .lock()
            .iter()
            .filter(|(_, followee)| followee == user_id)
            .map(|(follower, _)| follower.clone())
            .collect())
    }
}

/// Pause points handed out by [`FaultyStore::hold_next_close`].
#[derive(Clone, Default)]
pub struct SessionGate {
    /// Notified once the session is closed in the store.
    pub entered: Arc<Notify>,
    /// Notify to let the close call return.
    pub release: Arc<Notify>,
}

/// [`SharedStore`] over a [`MemoryStore`] with switchable faults.
pub struct FaultyStore {
    inner: MemoryStore,
    cache_down: AtomicBool,
    close_gate: Mutex<Option<SessionGate>>,
}

impl FaultyStore {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: MemoryStore::new(clock),
            cache_down: AtomicBool::new(false),
            close_gate: Mutex::new(None),
        }
    }

    /// Fail every unread-count cache operation with `CacheUnavailable`.
    pub fn fail_cache(&self, down: bool) {
        self.cache_down.store(down, Ordering::SeqCst);
    }

    /// Park the next `close_session` after it has been applied, until the
    /// returned gate is released.
    #[must_use]
    pub fn hold_next_close(&self) -> SessionGate {
        let gate = SessionGate::default();
        *self.close_gate.lock() = Some(gate.clone());
        gate
    }

    fn cache(&self) -> AppResult<()> {
        if self.cache_down.load(Ordering::SeqCst) {
            Err(AppError::CacheUnavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for FaultyStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.cache()?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        self.cache()?;
        self.inner.set_with_ttl(key, value, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.cache()?;
        self.inner.delete(key).await
    }

    async fn adjust_if_exists(&self, key: &str, delta: i64) -> AppResult<Option<i64>> {
        self.cache()?;
        self.inner.adjust_if_exists(key, delta).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> AppResult<i64> {
        self.inner.incr_with_expiry(key, ttl_secs).await
    }

    async fn sliding_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max: u64,
    ) -> AppResult<SlidingWindowOutcome> {
        self.inner
            .sliding_window(key, member, now_ms, window_ms, max)
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> AppResult<()> {
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<()> {
        self.inner.zrem(key, member).await
    }

    async fn zrange(&self, key: &str) -> AppResult<Vec<String>> {
        self.inner.zrange(key).await
    }

    async fn open_session(&self, user_id: &str, session: &str) -> AppResult<SessionTransition> {
        self.inner.open_session(user_id, session).await
    }

    async fn close_session(
        &self,
        user_id: &str,
        session: &str,
    ) -> AppResult<SessionTransition> {
        let transition = self.inner.close_session(user_id, session).await?;
        let gate = self.close_gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(transition)
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        self.inner.sismember(key, member).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>> {
        self.inner.subscribe(channel).await
    }
}
