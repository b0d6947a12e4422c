//! Out-of-band delivery queue entity.
//!
//! Rows are written by the notification pipeline and consumed (then
//! deleted) by the email/push/SMS workers.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::notification::NotificationType;

/// Delivery channel of a queued item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum QueueChannel {
    #[sea_orm(string_value = "email")]
    Email,
    #[sea_orm(string_value = "push")]
    Push,
    #[sea_orm(string_value = "sms")]
    Sms,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notification_queue")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub user_id: String,

    pub notification_type: NotificationType,

    #[sea_orm(indexed)]
    pub channel: QueueChannel,

    /// Serialized delivery payload
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    #[sea_orm(default_value = 1)]
    pub priority: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_delete = "Cascade"
    )]
    User,
}

impl ActiveModelBehavior for ActiveModel {}
