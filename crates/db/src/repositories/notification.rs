//! Notification repository.

use std::sync::Arc;

use crate::entities::{
    Notification,
    notification::{self, NotificationType},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait, sea_query::Expr,
};
use tidings_common::{AppError, AppResult};

/// Listing filter for a user's notifications.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    /// Maximum number of rows.
    pub limit: u64,
    /// Only rows with an id lower than this one (newest-first cursor).
    pub until_id: Option<String>,
    /// Only unread rows.
    pub unread_only: bool,
    /// Restrict to these types (empty means all).
    pub types: Vec<NotificationType>,
}

/// Notification repository for database operations.
#[derive(Clone)]
pub struct NotificationRepository {
    db: Arc<DatabaseConnection>,
}

fn map_db_err(e: impl std::fmt::Display) -> AppError {
    AppError::from_db_message(e.to_string())
}

/// Rows that have not expired at `now`.
fn not_expired(now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(notification::Column::ExpiresAt.is_null())
        .add(notification::Column::ExpiresAt.gt(now))
}

impl NotificationRepository {
    /// Create a new notification repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a notification by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<notification::Model>> {
        Notification::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(map_db_err)
    }

    /// Find a notification by ID, only if it belongs to `user_id`.
    pub async fn find_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>> {
        Notification::find_by_id(id)
            .filter(notification::Column::UserId.eq(user_id))
            .one(self.db.as_ref())
            .await
            .map_err(map_db_err)
    }

    /// Create a new notification.
    pub async fn create(&self, model: notification::ActiveModel) -> AppResult<notification::Model> {
        model.insert(self.db.as_ref()).await.map_err(map_db_err)
    }

    /// Insert a batch of notifications in a single transaction.
    ///
    /// Either every row is written or none is.
    pub async fn create_many(
        &self,
        models: Vec<notification::ActiveModel>,
    ) -> AppResult<Vec<notification::Model>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }

        self.db
            .transaction::<_, Vec<notification::Model>, DbErr>(|txn| {
                Box::pin(async move {
                    let mut created = Vec::with_capacity(models.len());
                    for model in models {
                        created.push(model.insert(txn).await?);
                    }
                    Ok(created)
                })
            })
            .await
            .map_err(map_db_err)
    }

    /// Get non-expired notifications for a user, newest first.
    pub async fn find_by_user(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<notification::Model>> {
        let mut query = Notification::find()
            .filter(notification::Column::UserId.eq(user_id))
            .filter(not_expired(now))
            .order_by_desc(notification::Column::Id);

        if let Some(id) = &filter.until_id {
            query = query.filter(notification::Column::Id.lt(id.as_str()));
        }

        if filter.unread_only {
            query = query.filter(notification::Column::IsRead.eq(false));
        }

        if !filter.types.is_empty() {
            query = query.filter(notification::Column::NotificationType.is_in(filter.types.clone()));
        }

        query
            .limit(filter.limit)
            .all(self.db.as_ref())
            .await
            .map_err(map_db_err)
    }

    /// Mark one unread notification as read.
    ///
    /// Ownership and unread state are part of the update predicate, so the
    /// returned row count is 1 only when this call flipped the flag.
    pub async fn mark_as_read(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = Notification::update_many()
            .col_expr(notification::Column::IsRead, Expr::value(true))
            .col_expr(notification::Column::ReadAt, Expr::value(now.fixed_offset()))
            .filter(notification::Column::Id.eq(id))
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .exec(self.db.as_ref())
            .await
            .map_err(map_db_err)?;

        Ok(result.rows_affected)
    }

    /// Mark all unread, non-expired notifications as read for a user.
    pub async fn mark_all_as_read(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        let result = Notification::update_many()
            .col_expr(notification::Column::IsRead, Expr::value(true))
            .col_expr(notification::Column::ReadAt, Expr::value(now.fixed_offset()))
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .filter(not_expired(now))
            .exec(self.db.as_ref())
            .await
            .map_err(map_db_err)?;

        Ok(result.rows_affected)
    }

    /// Count unread, non-expired notifications for a user.
    pub async fn count_unread(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<u64> {
        Notification::find()
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .filter(not_expired(now))
            .count(self.db.as_ref())
            .await
            .map_err(map_db_err)
    }

    /// Delete a notification owned by `user_id`.
    ///
    /// Returns the deleted row, or `None` if nothing matched.
    pub async fn delete_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<notification::Model>> {
        let Some(existing) = self.find_owned(id, user_id).await? else {
            return Ok(None);
        };

        let result = Notification::delete_many()
            .filter(notification::Column::Id.eq(id))
            .filter(notification::Column::UserId.eq(user_id))
            .exec(self.db.as_ref())
            .await
            .map_err(map_db_err)?;

        Ok((result.rows_affected > 0).then_some(existing))
    }

    /// Delete every notification that expired before `now`.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = Notification::delete_many()
            .filter(notification::Column::ExpiresAt.lt(now))
            .exec(self.db.as_ref())
            .await
            .map_err(map_db_err)?;

        Ok(result.rows_affected)
    }
}
