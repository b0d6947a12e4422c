//! Notification preference entity (one row per user).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notification_preference")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: String,

    // Categories
    #[sea_orm(default_value = true)]
    pub post_likes: bool,
    #[sea_orm(default_value = true)]
    pub comments: bool,
    #[sea_orm(default_value = true)]
    pub new_followers: bool,
    #[sea_orm(default_value = true)]
    pub mentions: bool,
    #[sea_orm(default_value = true)]
    pub direct_messages: bool,
    #[sea_orm(default_value = true)]
    pub group_invites: bool,
    #[sea_orm(default_value = true)]
    pub event_reminders: bool,
    #[sea_orm(default_value = false)]
    pub marketing: bool,
    #[sea_orm(default_value = true)]
    pub weekly_digest: bool,

    // Channel master switches
    #[sea_orm(default_value = true)]
    pub email_notifications: bool,
    #[sea_orm(default_value = true)]
    pub push_notifications: bool,
    #[sea_orm(default_value = false)]
    pub sms_notifications: bool,

    pub updated_at: DateTimeWithTimeZone,
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
