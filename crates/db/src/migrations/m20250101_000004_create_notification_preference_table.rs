//! Create notification preference table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

fn flag(col: NotificationPreference, default: bool) -> ColumnDef {
    ColumnDef::new(col)
        .boolean()
        .not_null()
        .default(default)
        .to_owned()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NotificationPreference::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NotificationPreference::UserId)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(flag(NotificationPreference::PostLikes, true))
                    .col(flag(NotificationPreference::Comments, true))
                    .col(flag(NotificationPreference::NewFollowers, true))
                    .col(flag(NotificationPreference::Mentions, true))
                    .col(flag(NotificationPreference::DirectMessages, true))
                    .col(flag(NotificationPreference::GroupInvites, true))
                    .col(flag(NotificationPreference::EventReminders, true))
                    .col(flag(NotificationPreference::Marketing, false))
                    .col(flag(NotificationPreference::WeeklyDigest, true))
                    .col(flag(NotificationPreference::EmailNotifications, true))
                    .col(flag(NotificationPreference::PushNotifications, true))
                    .col(flag(NotificationPreference::SmsNotifications, false))
                    .col(
                        ColumnDef::new(NotificationPreference::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_notification_preference_user")
                            .from(NotificationPreference::Table, NotificationPreference::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NotificationPreference::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NotificationPreference {
    Table,
    UserId,
    PostLikes,
    Comments,
    NewFollowers,
    Mentions,
    DirectMessages,
    GroupInvites,
    EventReminders,
    Marketing,
    WeeklyDigest,
    EmailNotifications,
    PushNotifications,
    SmsNotifications,
    UpdatedAt,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}
