//! Test utilities for database-backed tests.
//!
//! Integration tests talk to a disposable `PostgreSQL` database. Each
//! [`TestDatabase`] runs the migrations on connect and offers seed helpers
//! for the tables the delivery engine reads.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, Set,
    Statement,
};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use crate::entities::{following, notification_preference, user};
use crate::migrations::Migrator;

/// Test database configuration.
#[derive(Debug, Clone)]
pub struct TestDbConfig {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database username.
    pub username: String,
    /// Database password.
    pub password: String,
    /// Database name.
    pub database: String,
}

impl Default for TestDbConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("TEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("TEST_DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5433),
            username: std::env::var("TEST_DB_USER").unwrap_or_else(|_| "tidings_test".to_string()),
            password: std::env::var("TEST_DB_PASSWORD")
                .unwrap_or_else(|_| "tidings_test".to_string()),
            database: std::env::var("TEST_DB_NAME").unwrap_or_else(|_| "tidings_test".to_string()),
        }
    }
}

impl TestDbConfig {
    /// Get the database URL.
    #[must_use]
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    /// URL of the maintenance database used to create and drop test databases.
    #[must_use]
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/postgres",
            self.username, self.password, self.host, self.port
        )
    }
}

/// A migrated test database.
pub struct TestDatabase {
    /// Database connection.
    pub conn: DatabaseConnection,
    /// Database configuration.
    pub config: TestDbConfig,
}

impl TestDatabase {
    /// Connect to the configured test database and run migrations.
    pub async fn new() -> Result<Self, DbErr> {
        Self::with_config(TestDbConfig::default()).await
    }

    /// Connect with a custom configuration and run migrations.
    pub async fn with_config(config: TestDbConfig) -> Result<Self, DbErr> {
        let conn = Database::connect(&config.database_url()).await?;
        Migrator::up(&conn, None).await?;

        info!(database = %config.database, "Connected to migrated test database");

        Ok(Self { conn, config })
    }

    /// Create a uniquely named database so tests can run in parallel.
    pub async fn create_unique() -> Result<Self, DbErr> {
        let mut config = TestDbConfig::default();
        let unique_suffix = uuid::Uuid::new_v4().simple().to_string();
        config.database = format!("tidings_test_{}", &unique_suffix[..8]);

        let postgres_conn = Database::connect(&config.postgres_url()).await?;
        let create_db = format!("CREATE DATABASE \"{}\"", config.database);
        postgres_conn
            .execute(Statement::from_string(DatabaseBackend::Postgres, create_db))
            .await?;
        postgres_conn.close().await?;

        Self::with_config(config).await
    }

    /// Get the database connection.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Open a second, shareable connection to the same database.
    ///
    /// Repositories take an `Arc<DatabaseConnection>`; the mock backend
    /// makes the connection type non-`Clone`, so tests connect again.
    pub async fn shared_connection(&self) -> Result<Arc<DatabaseConnection>, DbErr> {
        Ok(Arc::new(Database::connect(&self.config.database_url()).await?))
    }

    /// Truncate every engine table, keeping the migration history.
    pub async fn cleanup(&self) -> Result<(), DbErr> {
        self.conn
            .execute(Statement::from_string(
                DatabaseBackend::Postgres,
                "TRUNCATE TABLE \"notification_queue\", \"notification\", \
                 \"notification_preference\", \"following\", \"user\" CASCADE"
                    .to_string(),
            ))
            .await?;

        info!("Cleaned up test database");
        Ok(())
    }

    /// Drop a database created by [`Self::create_unique`].
    pub async fn drop_database(self) -> Result<(), DbErr> {
        self.conn.close().await?;

        let postgres_conn = Database::connect(&self.config.postgres_url()).await?;
        let drop_db = format!(
            "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
            self.config.database
        );
        postgres_conn
            .execute(Statement::from_string(DatabaseBackend::Postgres, drop_db))
            .await?;
        postgres_conn.close().await?;

        info!(database = %self.config.database, "Dropped test database");
        Ok(())
    }

    /// Insert a user whose bearer token is `token-{id}`.
    pub async fn seed_user(&self, id: &str, username: &str) -> Result<user::Model, DbErr> {
        user::ActiveModel {
            id: Set(id.to_string()),
            username: Set(username.to_string()),
            name: Set(None),
            avatar_url: Set(None),
            role: Set(user::UserRole::User),
            token: Set(Some(format!("token-{id}"))),
            created_at: Set(Utc::now().into()),
        }
        .insert(&self.conn)
        .await
    }

    /// Insert a follow edge.
    pub async fn seed_follow(&self, follower_id: &str, followee_id: &str) -> Result<(), DbErr> {
        following::ActiveModel {
            follower_id: Set(follower_id.to_string()),
            followee_id: Set(followee_id.to_string()),
            created_at: Set(Utc::now().into()),
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }

    /// Insert a preference row with every category and the email and push
    /// channels enabled.
    pub async fn seed_preferences(
        &self,
        user_id: &str,
    ) -> Result<notification_preference::Model, DbErr> {
        notification_preference::ActiveModel {
            user_id: Set(user_id.to_string()),
            post_likes: Set(true),
            comments: Set(true),
            new_followers: Set(true),
            mentions: Set(true),
            direct_messages: Set(true),
            group_invites: Set(true),
            event_reminders: Set(true),
            marketing: Set(true),
            weekly_digest: Set(true),
            email_notifications: Set(true),
            push_notifications: Set(true),
            sms_notifications: Set(false),
            updated_at: Set(Utc::now().into()),
        }
        .insert(&self.conn)
        .await
    }
}
