//! User repository.

use std::sync::Arc;

use crate::entities::{User, user};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tidings_common::{AppError, AppResult};

/// User repository for database operations.
#[derive(Clone)]
pub struct UserRepository {
    db: Arc<DatabaseConnection>,
}

impl UserRepository {
    /// Create a new user repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a user by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<user::Model>> {
        User::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find users by IDs.
    pub async fn find_by_ids(&self, ids: &[String]) -> AppResult<Vec<user::Model>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        User::find()
            .filter(user::Column::Id.is_in(ids.to_vec()))
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find a user by bearer token.
    pub async fn find_by_token(&self, token: &str) -> AppResult<Option<user::Model>> {
        User::find()
            .filter(user::Column::Token.eq(token))
            .one(self.db.as_ref())
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

    fn create_test_user(id: &str, username: &str) -> user::Model {
        user::Model {
            id: id.to_string(),
            username: username.to_string(),
            name: Some(format!("{username} display")),
            avatar_url: None,
            role: user::UserRole::User,
            token: Some(format!("token-{id}")),
            created_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_find_by_token_found() {
        let user = create_test_user("u1", "alice");

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[user.clone()]])
                .into_connection(),
        );

        let repo = UserRepository::new(db);
        let result = repo.find_by_token("token-u1").await.unwrap();

        assert_eq!(result.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_find_by_token_not_found() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<user::Model>::new()])
                .into_connection(),
        );

        let repo = UserRepository::new(db);
        let result = repo.find_by_token("bogus").await.unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_find_by_ids_empty_skips_query() {
        let db = Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection());

        let repo = UserRepository::new(db);
        let result = repo.find_by_ids(&[]).await.unwrap();

        assert!(result.is_empty());
    }
}
