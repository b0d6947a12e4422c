//! User directory seam.
//!
//! Authentication and the follow graph belong to the wider platform; the
//! delivery engine only reads them.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tidings_common::AppResult;
use tidings_db::{
    entities::user::{self, UserRole},
    repositories::{FollowingRepository, UserRepository},
};

/// Public view of a user, used for actor enrichment and connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: UserRole,
}

impl From<user::Model> for UserSummary {
    fn from(u: user::Model) -> Self {
        Self {
            id: u.id,
            username: u.username,
            name: u.name,
            avatar_url: u.avatar_url,
            role: u.role,
        }
    }
}

/// Read access to users and the follow graph.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a bearer token to its user.
    async fn authenticate(&self, token: &str) -> AppResult<Option<UserSummary>>;

    /// Users with the given ids. Unknown ids are skipped.
    async fn find_users(&self, ids: &[String]) -> AppResult<Vec<UserSummary>>;

    /// Users that `user_id` follows.
    async fn followee_ids(&self, user_id: &str) -> AppResult<Vec<String>>;

    /// Users that follow `user_id`.
    async fn follower_ids(&self, user_id: &str) -> AppResult<Vec<String>>;
}

/// [`UserDirectory`] over the `user` and `following` tables.
#[derive(Clone)]
pub struct DbUserDirectory {
    users: UserRepository,
    following: FollowingRepository,
}

impl DbUserDirectory {
    /// Create a directory on a shared connection pool.
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            users: UserRepository::new(Arc::clone(&db)),
            following: FollowingRepository::new(db),
        }
    }
}

#[async_trait]
impl UserDirectory for DbUserDirectory {
    async fn authenticate(&self, token: &str) -> AppResult<Option<UserSummary>> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self.users.find_by_token(token).await?.map(UserSummary::from))
    }

    async fn find_users(&self, ids: &[String]) -> AppResult<Vec<UserSummary>> {
        Ok(self
            .users
            .find_by_ids(ids)
            .await?
            .into_iter()
            .map(UserSummary::from)
            .collect())
    }

    async fn followee_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        self.following.followee_ids(user_id).await
    }

    async fn follower_ids(&self, user_id: &str) -> AppResult<Vec<String>> {
        self.following.follower_ids(user_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[tokio::test]
    async fn test_authenticate_maps_summary() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[user::Model {
                    id: "u1".to_string(),
                    username: "alice".to_string(),
                    name: Some("Alice".to_string()),
                    avatar_url: None,
                    role: UserRole::Moderator,
                    token: Some("secret".to_string()),
                    created_at: Utc::now().into(),
                }]])
                .into_connection(),
        );

        let directory = DbUserDirectory::new(db);
        let user = directory.authenticate("secret").await.unwrap().unwrap();

        assert_eq!(user.username, "alice");
        assert_eq!(user.role, UserRole::Moderator);
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected_without_query() {
        let db = Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection());

        let directory = DbUserDirectory::new(db);
        assert!(directory.authenticate("").await.unwrap().is_none());
    }
}
