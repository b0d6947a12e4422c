//! Create notification queue table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NotificationQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NotificationQueue::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(NotificationQueue::UserId)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NotificationQueue::NotificationType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NotificationQueue::Channel)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NotificationQueue::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NotificationQueue::Priority)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(NotificationQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_notification_queue_user")
                            .from(NotificationQueue::Table, NotificationQueue::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Workers poll per channel, highest priority first
        manager
            .create_index(
                Index::create()
                    .name("idx_notification_queue_channel_priority")
                    .table(NotificationQueue::Table)
                    .col(NotificationQueue::Channel)
                    .col(NotificationQueue::Priority)
                    .col(NotificationQueue::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NotificationQueue::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NotificationQueue {
    Table,
    Id,
    UserId,
    NotificationType,
    Channel,
    Payload,
    Priority,
    CreatedAt,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}
