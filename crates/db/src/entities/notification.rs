//! Notification entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Notification types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    #[sea_orm(string_value = "POST_LIKED")]
    PostLiked,
    #[sea_orm(string_value = "POST_COMMENTED")]
    PostCommented,
    #[sea_orm(string_value = "COMMENT_REPLIED")]
    CommentReplied,
    #[sea_orm(string_value = "USER_FOLLOWED")]
    UserFollowed,
    #[sea_orm(string_value = "MENTION")]
    Mention,
    #[sea_orm(string_value = "DIRECT_MESSAGE")]
    DirectMessage,
    #[sea_orm(string_value = "GROUP_INVITE")]
    GroupInvite,
    #[sea_orm(string_value = "EVENT_REMINDER")]
    EventReminder,
    #[sea_orm(string_value = "PROMOTION")]
    Promotion,
    #[sea_orm(string_value = "WEEKLY_DIGEST")]
    WeeklyDigest,
    #[sea_orm(string_value = "SYSTEM")]
    System,
    #[sea_orm(string_value = "ACHIEVEMENT")]
    Achievement,
    #[sea_orm(string_value = "LEVEL_UP")]
    LevelUp,
    #[sea_orm(string_value = "FEATURED_CONTENT")]
    FeaturedContent,
    #[sea_orm(string_value = "MILESTONE")]
    Milestone,
}

impl NotificationType {
    /// Wire name, identical to the stored value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PostLiked => "POST_LIKED",
            Self::PostCommented => "POST_COMMENTED",
            Self::CommentReplied => "COMMENT_REPLIED",
            Self::UserFollowed => "USER_FOLLOWED",
            Self::Mention => "MENTION",
            Self::DirectMessage => "DIRECT_MESSAGE",
            Self::GroupInvite => "GROUP_INVITE",
            Self::EventReminder => "EVENT_REMINDER",
            Self::Promotion => "PROMOTION",
            Self::WeeklyDigest => "WEEKLY_DIGEST",
            Self::System => "SYSTEM",
            Self::Achievement => "ACHIEVEMENT",
            Self::LevelUp => "LEVEL_UP",
            Self::FeaturedContent => "FEATURED_CONTENT",
            Self::Milestone => "MILESTONE",
        }
    }
}

/// Named priority levels.
///
/// The column stores the plain integer so that ordering comparisons
/// (`priority >= High`) keep working for values written by older clients.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// Stored integer value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a stored integer back to a level, saturating out-of-range values.
    #[must_use]
    pub const fn from_i32(value: i32) -> Self {
        match value {
            i32::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Urgent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notification")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// The user receiving the notification
    #[sea_orm(indexed)]
    pub user_id: String,

    /// The user who triggered the notification
    #[sea_orm(nullable)]
    pub actor_id: Option<String>,

    pub notification_type: NotificationType,

    /// Related entity (post, comment, group, event, ...)
    #[sea_orm(nullable)]
    pub entity_id: Option<String>,

    #[sea_orm(nullable)]
    pub entity_type: Option<String>,

    pub title: String,

    #[sea_orm(column_type = "Text")]
    pub message: String,

    /// Free-form payload for the client
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub data: Option<Json>,

    #[sea_orm(nullable)]
    pub image_url: Option<String>,

    #[sea_orm(nullable)]
    pub action_url: Option<String>,

    /// See [`Priority`]
    #[sea_orm(default_value = 1)]
    pub priority: i32,

    #[sea_orm(default_value = false)]
    pub is_read: bool,

    #[sea_orm(nullable)]
    pub read_at: Option<DateTimeWithTimeZone>,

    /// NULL never expires
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    /// Priority as a named level.
    #[must_use]
    pub const fn priority_level(&self) -> Priority {
        Priority::from_i32(self.priority)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_delete = "Cascade"
    )]
    Recipient,

    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::ActorId",
        to = "super::user::Column::Id",
        on_delete = "SetNull"
    )]
    Actor,
}

impl ActiveModelBehavior for ActiveModel {}
