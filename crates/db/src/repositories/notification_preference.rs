//! Notification preference repository.

use std::sync::Arc;

use crate::entities::{NotificationPreference, notification_preference};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tidings_common::{AppError, AppResult};

/// Read access to per-user notification preferences.
#[derive(Clone)]
pub struct NotificationPreferenceRepository {
    db: Arc<DatabaseConnection>,
}

impl NotificationPreferenceRepository {
    /// Create a new preference repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Preferences of a single user.
    pub async fn find_by_user(
        &self,
        user_id: &str,
    ) -> AppResult<Option<notification_preference::Model>> {
        NotificationPreference::find_by_id(user_id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Preferences of many users in one query. Users without a row are absent.
    pub async fn find_by_users(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<notification_preference::Model>> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        NotificationPreference::find()
            .filter(notification_preference::Column::UserId.is_in(user_ids.to_vec()))
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn prefs(user_id: &str) -> notification_preference::Model {
        notification_preference::Model {
            user_id: user_id.to_string(),
            post_likes: false,
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

    #[tokio::test]
    async fn test_find_by_user() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[prefs("u1")]])
                .into_connection(),
        );

        let repo = NotificationPreferenceRepository::new(db);
        let found = repo.find_by_user("u1").await.unwrap().unwrap();

        assert!(!found.post_likes);
        assert!(found.comments);
    }

    #[tokio::test]
    async fn test_find_by_users_partial() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[prefs("u1")]])
                .into_connection(),
        );

        let repo = NotificationPreferenceRepository::new(db);
        let found = repo
            .find_by_users(&["u1".to_string(), "u2".to_string()])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "u1");
    }
}
