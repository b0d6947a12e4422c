//! Out-of-band delivery queue repository.

use std::sync::Arc;

use crate::entities::{NotificationQueue, notification_queue};
use sea_orm::{DatabaseConnection, EntityTrait};
use tidings_common::{AppError, AppResult};

/// Write access to the email/push/SMS delivery queue.
#[derive(Clone)]
pub struct NotificationQueueRepository {
    db: Arc<DatabaseConnection>,
}

impl NotificationQueueRepository {
    /// Create a new queue repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert queue items in a single statement.
    pub async fn enqueue_many(
        &self,
        items: Vec<notification_queue::ActiveModel>,
    ) -> AppResult<u64> {
        let count = items.len() as u64;
        if count == 0 {
            return Ok(0);
        }

        NotificationQueue::insert_many(items)
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entities::{notification::NotificationType, notification_queue::QueueChannel};
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Set};

    #[tokio::test]
    async fn test_enqueue_many() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 2,
                }])
                .into_connection(),
        );

        let item = |id: &str, channel| notification_queue::ActiveModel {
            id: Set(id.to_string()),
            user_id: Set("u1".to_string()),
            notification_type: Set(NotificationType::Mention),
            channel: Set(channel),
            payload: Set(serde_json::json!({ "title": "hi" })),
            priority: Set(1),
            created_at: Set(Utc::now().into()),
        };

        let repo = NotificationQueueRepository::new(db);
        let count = repo
            .enqueue_many(vec![
                item("q1", QueueChannel::Email),
                item("q2", QueueChannel::Push),
            ])
            .await
            .unwrap();

        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_enqueue_nothing() {
        let db = Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection());

        let repo = NotificationQueueRepository::new(db);
        assert_eq!(repo.enqueue_many(Vec::new()).await.unwrap(), 0);
    }
}
