//! Following repository.

use std::sync::Arc;

use crate::entities::{Following, following};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use tidings_common::{AppError, AppResult};

/// Following repository for database operations.
///
/// The delivery engine only reads the follow graph; writes belong to the
/// social layer that owns the table.
#[derive(Clone)]
pub struct FollowingRepository {
    db: Arc<DatabaseConnection>,
}

impl FollowingRepository {
    /// Create a new following repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// IDs of the users `user_id` follows.
    pub async fn followee_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        let rows = Following::find()
            .filter(following::Column::FollowerId.eq(user_id))
            .order_by_asc(following::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|f| f.followee_id).collect())
    }

    /// IDs of the users following `user_id`.
    pub async fn follower_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        let rows = Following::find()
            .filter(following::Column::FolloweeId.eq(user_id))
            .order_by_asc(following::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|f| f.follower_id).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn edge(follower_id: &str, followee_id: &str) -> following::Model {
        following::Model {
            follower_id: follower_id.to_string(),
            followee_id: followee_id.to_string(),
            created_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_followee_ids() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[
                    edge("alice", "bob"),
                    edge("alice", "carol"),
                ]])
                .into_connection(),
        );

        let repo = FollowingRepository::new(db);
        let ids = repo.followee_ids("alice").await.unwrap();

        assert_eq!(ids, vec!["bob".to_string(), "carol".to_string()]);
    }

    #[tokio::test]
    async fn test_follower_ids_empty() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<following::Model>::new()])
                .into_connection(),
        );

        let repo = FollowingRepository::new(db);
        let ids = repo.follower_ids("nobody").await.unwrap();

        assert!(ids.is_empty());
    }
}
