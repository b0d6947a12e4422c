//! User entity.
//!
//! Only the directory columns the delivery engine reads are mapped here.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Account role.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[sea_orm(string_value = "user")]
    User,
    #[sea_orm(string_value = "moderator")]
    Moderator,
    #[sea_orm(string_value = "admin")]
    Admin,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(unique)]
    pub username: String,

    /// Display name
    #[sea_orm(nullable)]
    pub name: Option<String>,

    /// Avatar URL
    #[sea_orm(nullable)]
    pub avatar_url: Option<String>,

    pub role: UserRole,

    /// Bearer token for API and streaming access
    #[sea_orm(unique, nullable)]
    #[serde(skip_serializing)]
    pub token: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
