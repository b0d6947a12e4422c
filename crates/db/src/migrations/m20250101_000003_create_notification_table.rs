//! Create notification table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Notification::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Notification::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Notification::UserId).string_len(32).not_null())
                    .col(ColumnDef::new(Notification::ActorId).string_len(32))
                    .col(
                        ColumnDef::new(Notification::NotificationType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Notification::EntityId).string_len(32))
                    .col(ColumnDef::new(Notification::EntityType).string_len(32))
                    .col(ColumnDef::new(Notification::Title).string_len(200).not_null())
                    .col(ColumnDef::new(Notification::Message).text().not_null())
                    .col(ColumnDef::new(Notification::Data).json_binary())
                    .col(ColumnDef::new(Notification::ImageUrl).string_len(2048))
                    .col(ColumnDef::new(Notification::ActionUrl).string_len(2048))
                    .col(
                        ColumnDef::new(Notification::Priority)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Notification::IsRead)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Notification::ReadAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Notification::ExpiresAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Notification::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_notification_user")
                            .from(Notification::Table, Notification::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_notification_actor")
                            .from(Notification::Table, Notification::ActorId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Listing and unread count
        manager
            .create_index(
                Index::create()
                    .name("idx_notification_user_is_read")
                    .table(Notification::Table)
                    .col(Notification::UserId)
                    .col(Notification::IsRead)
                    .to_owned(),
            )
            .await?;

        // Expiry sweep
        manager
            .create_index(
                Index::create()
                    .name("idx_notification_expires_at")
                    .table(Notification::Table)
                    .col(Notification::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Notification::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Notification {
    Table,
    Id,
    UserId,
    ActorId,
    NotificationType,
    EntityId,
    EntityType,
    Title,
    Message,
    Data,
    ImageUrl,
    ActionUrl,
    Priority,
    IsRead,
    ReadAt,
    ExpiresAt,
    CreatedAt,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}
