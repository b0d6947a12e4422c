//! Notification pipeline.
//!
//! Creation runs in two phases. The durable write is the only part that can
//! fail the call; the unread-count bump, the real-time push, the channel
//! queue items and the bus event that follow are best-effort and logged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tidings_common::{AppError, AppResult, IdGenerator, SharedClock};
use tidings_db::{
    entities::{
        notification::{self, NotificationType, Priority},
        notification_preference,
        notification_queue::{self, QueueChannel},
    },
    repositories::NotificationFilter,
};
use tracing::{debug, info, warn};
use validator::Validate;

use super::batching::BatchingPublisher;
use super::directory::{UserDirectory, UserSummary};
use super::event_bus::{BusEvent, EventBus};
use super::notification_store::NotificationStore;
use super::presence::{OutboundMessage, PresenceTracker};
use super::retry::RetryPolicy;
use super::unread_count::UnreadCountCache;

/// Priority from which SMS delivery is considered.
pub const SMS_MIN_PRIORITY: Priority = Priority::High;

const DEFAULT_PAGE_SIZE: u64 = 20;

/// What a notification says, independent of its recipient.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,

    #[validate(length(min = 1, max = 200))]
    pub title: String,

    #[validate(length(max = 2000))]
    #[serde(default)]
    pub message: String,

    pub actor_id: Option<String>,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub data: Option<Value>,

    #[validate(length(max = 2048))]
    pub image_url: Option<String>,

    #[validate(length(max = 2048))]
    pub action_url: Option<String>,

    #[serde(default)]
    pub priority: Priority,
}

impl NotificationContent {
    /// Minimal content with normal priority.
    #[must_use]
    pub fn new(
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            notification_type,
            title: title.into(),
            message: message.into(),
            actor_id: None,
            entity_id: None,
            entity_type: None,
            data: None,
            image_url: None,
            action_url: None,
            priority: Priority::Normal,
        }
    }
}

/// Input for creating one notification.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationInput {
    #[validate(length(min = 1))]
    pub user_id: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub content: NotificationContent,
}

/// Per-call channel switches. `None` falls back to the user's preference.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ChannelOverrides {
    pub email: Option<bool>,
    pub push: Option<bool>,
    pub sms: Option<bool>,
}

/// Listing parameters.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<u64>,
    /// Return notifications older than this id.
    pub until_id: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub types: Vec<NotificationType>,
}

/// Notification with its actor resolved.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationWithActor {
    #[serde(flatten)]
    pub notification: notification::Model,
    pub actor: Option<UserSummary>,
}

/// Whether `prefs` lets a notification of type `ty` through.
#[must_use]
pub const fn preference_allows(
    prefs: &notification_preference::Model,
    ty: NotificationType,
) -> bool {
    match ty {
        NotificationType::PostLiked => prefs.post_likes,
        NotificationType::PostCommented | NotificationType::CommentReplied => prefs.comments,
        NotificationType::UserFollowed => prefs.new_followers,
        NotificationType::Mention => prefs.mentions,
        NotificationType::DirectMessage => prefs.direct_messages,
        NotificationType::GroupInvite => prefs.group_invites,
        NotificationType::EventReminder => prefs.event_reminders,
        NotificationType::Promotion => prefs.marketing,
        NotificationType::WeeklyDigest => prefs.weekly_digest,
        // No category of their own; gated on the email master switch.
        NotificationType::System
        | NotificationType::Achievement
        | NotificationType::LevelUp
        | NotificationType::FeaturedContent
        | NotificationType::Milestone => prefs.email_notifications,
    }
}

/// Lifetime of a notification of type `ty`.
#[must_use]
pub fn expiry_for(ty: NotificationType) -> Duration {
    match ty {
        NotificationType::System | NotificationType::FeaturedContent => Duration::days(30),
        NotificationType::Achievement | NotificationType::LevelUp | NotificationType::Milestone => {
            Duration::days(90)
        }
        NotificationType::PostLiked
        | NotificationType::PostCommented
        | NotificationType::CommentReplied
        | NotificationType::UserFollowed
        | NotificationType::Mention
        | NotificationType::DirectMessage
        | NotificationType::GroupInvite
        | NotificationType::EventReminder
        | NotificationType::Promotion
        | NotificationType::WeeklyDigest => Duration::days(7),
    }
}

/// Channels a notification goes out on.
fn enabled_channels(
    prefs: Option<&notification_preference::Model>,
    overrides: &ChannelOverrides,
    priority: Priority,
) -> Vec<QueueChannel> {
    let email = overrides
        .email
        .unwrap_or_else(|| prefs.is_some_and(|p| p.email_notifications));
    let push = overrides
        .push
        .unwrap_or_else(|| prefs.is_some_and(|p| p.push_notifications));
    let sms = priority >= SMS_MIN_PRIORITY
        && overrides
            .sms
            .unwrap_or_else(|| prefs.is_some_and(|p| p.sms_notifications));

    [
        (email, QueueChannel::Email),
        (push, QueueChannel::Push),
        (sms, QueueChannel::Sms),
    ]
    .into_iter()
    .filter_map(|(on, channel)| on.then_some(channel))
    .collect()
}

/// Notification pipeline service.
#[derive(Clone)]
pub struct NotificationService {
    notifications: Arc<dyn NotificationStore>,
    directory: Arc<dyn UserDirectory>,
    unread: UnreadCountCache,
    presence: Arc<PresenceTracker>,
    bus: EventBus,
    batcher: Option<BatchingPublisher>,
    clock: SharedClock,
    retry: RetryPolicy,
    id_gen: IdGenerator,
}

impl NotificationService {
    /// Create a new notification service.
    #[must_use]
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        directory: Arc<dyn UserDirectory>,
        unread: UnreadCountCache,
        presence: Arc<PresenceTracker>,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            notifications,
            directory,
            unread,
            presence,
            bus,
            batcher: None,
            clock,
            retry: RetryPolicy::default(),
            id_gen: IdGenerator::new(),
        }
    }

    /// Route bulk-creation events through a batching wrapper.
    #[must_use]
    pub fn with_batcher(mut self, batcher: BatchingPublisher) -> Self {
        self.batcher = Some(batcher);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build(
        &self,
        user_id: &str,
        content: &NotificationContent,
        now: DateTime<Utc>,
    ) -> notification::Model {
        notification::Model {
            id: self.id_gen.generate(),
            user_id: user_id.to_string(),
            actor_id: content.actor_id.clone(),
            notification_type: content.notification_type,
            entity_id: content.entity_id.clone(),
            entity_type: content.entity_type.clone(),
            title: content.title.clone(),
            message: content.message.clone(),
            data: content.data.clone(),
            image_url: content.image_url.clone(),
            action_url: content.action_url.clone(),
            priority: content.priority.as_i32(),
            is_read: false,
            read_at: None,
            expires_at: Some((now + expiry_for(content.notification_type)).into()),
            created_at: now.into(),
        }
    }

    /// Create a notification for one recipient.
    ///
    /// Returns `Ok(None)` when the recipient has no preference row or has
    /// turned this category off.
    pub async fn create(
        &self,
        input: CreateNotificationInput,
        overrides: ChannelOverrides,
    ) -> AppResult<Option<notification::Model>> {
        input.validate()?;
        let ty = input.content.notification_type;

        let Some(prefs) = self.notifications.find_preferences(&input.user_id).await? else {
            warn!(user_id = %input.user_id, kind = ty.as_str(), "No notification preferences, skipping");
            return Ok(None);
        };
        if !preference_allows(&prefs, ty) {
            debug!(user_id = %input.user_id, kind = ty.as_str(), "Suppressed by preferences");
            return Ok(None);
        }

        let model = self.build(&input.user_id, &input.content, self.clock.now());
        let stored = self.notifications.insert(model).await?;

        let items = self.deliver(&stored, Some(&prefs), &overrides).await;
        self.enqueue(items).await;
        self.bus.publish(BusEvent::NotificationCreated {
            notification: stored.clone(),
        });

        info!(id = %stored.id, user_id = %stored.user_id, kind = ty.as_str(), "Notification created");
        Ok(Some(stored))
    }

    /// Create the same notification for many recipients in one transaction.
    ///
    /// Duplicate recipients are collapsed. Preferences only pick the
    /// delivery channels here; they never suppress a recipient.
    pub async fn create_bulk(
        &self,
        user_ids: &[String],
        content: NotificationContent,
        overrides: ChannelOverrides,
    ) -> AppResult<Vec<notification::Model>> {
        content.validate()?;

        let mut seen = HashSet::new();
        let recipients: Vec<String> = user_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let models = recipients
            .iter()
            .map(|user_id| self.build(user_id, &content, now))
            .collect();
        let stored = self.notifications.insert_many(models).await?;

        let prefs: HashMap<String, notification_preference::Model> = match self
            .notifications
            .find_preferences_many(&recipients)
            .await
        {
            Ok(rows) => rows.into_iter().map(|p| (p.user_id.clone(), p)).collect(),
            Err(e) => {
                warn!(error = %e, "Preference lookup failed, using overrides only");
                HashMap::new()
            }
        };

        let mut items = Vec::new();
        for n in &stored {
            items.extend(self.deliver(n, prefs.get(&n.user_id), &overrides).await);
        }
        self.enqueue(items).await;

        for n in &stored {
            let event = BusEvent::NotificationCreated {
                notification: n.clone(),
            };
            match &self.batcher {
                Some(batcher) => batcher.publish(event),
                None => {
                    self.bus.publish(event);
                }
            }
        }

        info!(
            count = stored.len(),
            kind = content.notification_type.as_str(),
            "Bulk notifications created"
        );
        Ok(stored)
    }

    /// Cache bump and real-time push. Returns the channel queue items.
    async fn deliver(
        &self,
        n: &notification::Model,
        prefs: Option<&notification_preference::Model>,
        overrides: &ChannelOverrides,
    ) -> Vec<notification_queue::Model> {
        self.unread.increment(&n.user_id).await;

        if self.presence.is_online(&n.user_id).await {
            match serde_json::to_value(n) {
                Ok(body) => {
                    self.presence
                        .notify_user(&n.user_id, OutboundMessage::new("notification", body))
                        .await;
                }
                Err(e) => warn!(id = %n.id, error = %e, "Failed to serialize notification"),
            }
        }

        let payload = json!({
            "notificationId": n.id,
            "title": n.title,
            "message": n.message,
            "actionUrl": n.action_url,
            "imageUrl": n.image_url,
            "data": n.data,
        });
        enabled_channels(prefs, overrides, n.priority_level())
            .into_iter()
            .map(|channel| notification_queue::Model {
                id: self.id_gen.generate(),
                user_id: n.user_id.clone(),
                notification_type: n.notification_type,
                channel,
                payload: payload.clone(),
                priority: n.priority,
                created_at: n.created_at,
            })
            .collect()
    }

    async fn enqueue(&self, items: Vec<notification_queue::Model>) {
        if items.is_empty() {
            return;
        }
        let count = items.len();
        if let Err(e) = self.notifications.enqueue(items).await {
            warn!(count, error = %e, "Failed to enqueue channel deliveries");
        }
    }

    /// A page of a user's notifications, newest first.
    pub async fn get_notifications(
        &self,
        user_id: &str,
        query: NotificationQuery,
    ) -> AppResult<Vec<NotificationWithActor>> {
        query.validate()?;
        let filter = NotificationFilter {
            limit: query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            until_id: query.until_id,
            unread_only: query.unread_only,
            types: query.types,
        };

        let rows = self
            .notifications
            .list(user_id, &filter, self.clock.now())
            .await?;

        let actor_ids: Vec<String> = rows
            .iter()
            .filter_map(|n| n.actor_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let actors: HashMap<String, UserSummary> = if actor_ids.is_empty() {
            HashMap::new()
        } else {
            match self.directory.find_users(&actor_ids).await {
                Ok(users) => users.into_iter().map(|u| (u.id.clone(), u)).collect(),
                Err(e) => {
                    warn!(user_id, error = %e, "Actor lookup failed");
                    HashMap::new()
                }
            }
        };

        Ok(rows
            .into_iter()
            .map(|notification| {
                let actor = notification
                    .actor_id
                    .as_ref()
                    .and_then(|id| actors.get(id).cloned());
                NotificationWithActor {
                    notification,
                    actor,
                }
            })
            .collect())
    }

    /// Mark one notification read.
    ///
    /// Returns `false` when it was already read. Someone else's notification
    /// is reported as not found.
    ///
    /// A retried write that finds the row already read may be seeing its own
    /// earlier attempt, so the cached count is invalidated in that case.
    pub async fn mark_as_read(&self, id: &str, user_id: &str) -> AppResult<bool> {
        let now = self.clock.now();
        let store = &self.notifications;
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let changed = self
            .retry
            .run("mark_as_read", move || {
                attempts_ref.fetch_add(1, Ordering::Relaxed);
                store.mark_read(id, user_id, now)
            })
            .await?;

        if changed == 0 {
            return match self.notifications.find_owned(id, user_id).await? {
                Some(_) => {
                    if attempts.load(Ordering::Relaxed) > 1 {
                        debug!(id, user_id, "Read state unclear after retry");
                        self.unread.invalidate(user_id).await;
                    }
                    Ok(false)
                }
                None => Err(AppError::NotFound(format!("notification {id}"))),
            };
        }

        self.unread.decrement(user_id).await;
        self.bus.publish(BusEvent::NotificationRead {
            id: id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(true)
    }

    /// Mark every unread notification of a user read.
    pub async fn mark_all_as_read(&self, user_id: &str) -> AppResult<u64> {
        let now = self.clock.now();
        let store = &self.notifications;
        let count = self
            .retry
            .run("mark_all_as_read", move || store.mark_all_read(user_id, now))
            .await?;

        self.unread.invalidate(user_id).await;
        self.bus.publish(BusEvent::NotificationAllRead {
            user_id: user_id.to_string(),
            count,
        });
        debug!(user_id, count, "Marked all notifications read");
        Ok(count)
    }

    pub async fn get_unread_count(&self, user_id: &str) -> AppResult<u64> {
        self.unread.get_unread_count(user_id).await
    }

    /// Delete one of the user's notifications.
    pub async fn delete_notification(&self, id: &str, user_id: &str) -> AppResult<()> {
        let store = &self.notifications;
        let deleted = self
            .retry
            .run("delete_notification", move || store.delete_owned(id, user_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("notification {id}")))?;

        if !deleted.is_read {
            self.unread.decrement(user_id).await;
        }
        self.bus.publish(BusEvent::NotificationDeleted {
            id: id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Remove expired notifications. Cached counts are left to their TTL.
    pub async fn cleanup_expired(&self) -> AppResult<u64> {
        let now = self.clock.now();
        let store = &self.notifications;
        let count = self
            .retry
            .run("cleanup_expired", move || store.delete_expired(now))
            .await?;

        if count > 0 {
            info!(count, "Expired notifications removed");
            self.bus.publish(BusEvent::NotificationsExpired { count });
        }
        Ok(count)
    }
}
