//! Durable notification storage seam.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, Set};
use tidings_common::AppResult;
use tidings_db::{
    entities::{notification, notification_preference, notification_queue},
    repositories::{
        NotificationFilter, NotificationPreferenceRepository, NotificationQueueRepository,
        NotificationRepository,
    },
};

/// Everything the notification pipeline reads from or writes to the
/// relational store.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist one notification.
    async fn insert(&self, model: notification::Model) -> AppResult<notification::Model>;

    /// Persist many notifications atomically.
    async fn insert_many(
        &self,
        models: Vec<notification::Model>,
    ) -> AppResult<Vec<notification::Model>>;

    /// A notification, only if it belongs to `user_id`.
    async fn find_owned(&self, id: &str, user_id: &str)
    -> AppResult<Option<notification::Model>>;

    /// Non-expired notifications of a user, newest first.
    async fn list(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<notification::Model>>;

    /// Unread, non-expired notifications of a user.
    async fn count_unread(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64>;

    /// Flip one owned unread notification to read. Returns rows changed.
    async fn mark_read(&self, id: &str, user_id: &str, now: DateTime<Utc>) -> AppResult<u64>;

    /// Flip every unread, non-expired notification of a user to read.
    async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64>;

    /// Delete one owned notification, returning it.
    async fn delete_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>>;

    /// Delete notifications with `expires_at < now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;

    /// Preferences of one user.
    async fn find_preferences(
        &self,
        user_id: &str,
    ) -> AppResult<Option<notification_preference::Model>>;

    /// Preferences of many users. Users without a row are absent.
    async fn find_preferences_many(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<notification_preference::Model>>;

    /// Hand items to the out-of-band delivery workers.
    async fn enqueue(&self, items: Vec<notification_queue::Model>) -> AppResult<u64>;
}

/// [`NotificationStore`] over the sea-orm repositories.
#[derive(Clone)]
pub struct DbNotificationStore {
    notifications: NotificationRepository,
    preferences: NotificationPreferenceRepository,
    queue: NotificationQueueRepository,
}

impl DbNotificationStore {
    /// Create a store on a shared connection pool.
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            notifications: NotificationRepository::new(Arc::clone(&db)),
            preferences: NotificationPreferenceRepository::new(Arc::clone(&db)),
            queue: NotificationQueueRepository::new(db),
        }
    }
}

fn to_active(m: notification::Model) -> notification::ActiveModel {
    notification::ActiveModel {
        id: Set(m.id),
        user_id: Set(m.user_id),
        actor_id: Set(m.actor_id),
        notification_type: Set(m.notification_type),
        entity_id: Set(m.entity_id),
        entity_type: Set(m.entity_type),
        title: Set(m.title),
        message: Set(m.message),
        data: Set(m.data),
        image_url: Set(m.image_url),
        action_url: Set(m.action_url),
        priority: Set(m.priority),
        is_read: Set(m.is_read),
        read_at: Set(m.read_at),
        expires_at: Set(m.expires_at),
        created_at: Set(m.created_at),
    }
}

fn queue_to_active(m: notification_queue::Model) -> notification_queue::ActiveModel {
    notification_queue::ActiveModel {
        id: Set(m.id),
        user_id: Set(m.user_id),
        notification_type: Set(m.notification_type),
        channel: Set(m.channel),
        payload: Set(m.payload),
        priority: Set(m.priority),
        created_at: Set(m.created_at),
    }
}

#[async_trait]
impl NotificationStore for DbNotificationStore {
    async fn insert(&self, model: notification::Model) -> AppResult<notification::Model> {
        self.notifications.create(to_active(model)).await
    }

    async fn insert_many(
        &self,
        models: Vec<notification::Model>,
    ) -> AppResult<Vec<notification::Model>> {
        self.notifications
            .create_many(models.into_iter().map(to_active).collect())
            .await
    }

    async fn find_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>> {
        self.notifications.find_owned(id, user_id).await
    }

    async fn list(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<notification::Model>> {
        self.notifications.find_by_user(user_id, filter, now).await
    }

    async fn count_unread(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        self.notifications.count_unread(user_id, now).await
    }

    async fn mark_read(&self, id: &str, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        self.notifications.mark_as_read(id, user_id, now).await
    }

    async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        self.notifications.mark_all_as_read(user_id, now).await
    }

    async fn delete_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>> {
        self.notifications.delete_owned(id, user_id).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.notifications.delete_expired(now).await
    }

    async fn find_preferences(
        &self,
        user_id: &str,
    ) -> AppResult<Option<notification_preference::Model>> {
        self.preferences.find_by_user(user_id).await
    }

    async fn find_preferences_many(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<notification_preference::Model>> {
        self.preferences.find_by_users(user_ids).await
    }

    async fn enqueue(&self, items: Vec<notification_queue::Model>) -> AppResult<u64> {
        self.queue
            .enqueue_many(items.into_iter().map(queue_to_active).collect())
            .await
    }
}
