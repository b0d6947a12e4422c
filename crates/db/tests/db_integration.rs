//! Database integration tests.
//!
//! These tests require a running `PostgreSQL` instance.
//! Run with: `cargo test -p tidings-db --features test-utils --test db_integration -- --ignored`
//!
//! Environment variables:
//!   `TEST_DB_HOST` (default: localhost)
//!   `TEST_DB_PORT` (default: 5433)
//!   `TEST_DB_USER` (default: `tidings_test`)
//!   `TEST_DB_PASSWORD` (default: `tidings_test`)
//!   `TEST_DB_NAME` (default: `tidings_test`)

#![allow(clippy::unwrap_used)]


use chrono::{Duration, Utc};
use sea_orm::Set;
use tidings_db::{
    entities::notification::{self, NotificationType},
    repositories::{FollowingRepository, NotificationFilter, NotificationRepository},
    test_utils::{TestDatabase, TestDbConfig},
};

fn new_notification(id: &str, user_id: &str, expires_in: Duration) -> notification::ActiveModel {
    let now = Utc::now();
    notification::ActiveModel {
        id: Set(id.to_string()),
        user_id: Set(user_id.to_string()),
        actor_id: Set(None),
        notification_type: Set(NotificationType::PostLiked),
        entity_id: Set(None),
        entity_type: Set(None),
        title: Set("Liked".to_string()),
        message: Set("Your post was liked".to_string()),
        data: Set(None),
        image_url: Set(None),
        action_url: Set(None),
        priority: Set(1),
        is_read: Set(false),
        read_at: Set(None),
        expires_at: Set(Some((now + expires_in).into())),
        created_at: Set(now.into()),
    }
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_notification_lifecycle() {
    let db = TestDatabase::create_unique().await.unwrap();
    db.seed_user("alice", "alice").await.unwrap();

    let repo = NotificationRepository::new(db.shared_connection().await.unwrap());
    repo.create_many(vec![
        new_notification("01a", "alice", Duration::days(7)),
        new_notification("01b", "alice", Duration::days(7)),
        new_notification("01c", "alice", Duration::days(-1)),
    ])
    .await
    .unwrap();

    let now = Utc::now();
    assert_eq!(repo.count_unread("alice", now).await.unwrap(), 2);

    let listed = repo
        .find_by_user(
            "alice",
            &NotificationFilter {
                limit: 10,
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(
        listed.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
        vec!["01b", "01a"]
    );

    assert_eq!(repo.mark_as_read("01a", "alice", now).await.unwrap(), 1);
    assert_eq!(repo.mark_as_read("01a", "alice", now).await.unwrap(), 0);
    assert_eq!(repo.mark_as_read("01b", "mallory", now).await.unwrap(), 0);

    assert_eq!(repo.delete_expired(now).await.unwrap(), 1);
    assert_eq!(repo.count_unread("alice", now).await.unwrap(), 1);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_follow_graph() {
    let db = TestDatabase::create_unique().await.unwrap();
    db.seed_user("alice", "alice").await.unwrap();
    db.seed_user("bob", "bob").await.unwrap();
    db.seed_follow("bob", "alice").await.unwrap();

    let repo = FollowingRepository::new(db.shared_connection().await.unwrap());
    assert_eq!(repo.follower_ids("alice").await.unwrap(), vec!["bob"]);
    assert_eq!(repo.followee_ids("bob").await.unwrap(), vec!["alice"]);
    assert!(repo.followee_ids("alice").await.unwrap().is_empty());

    db.drop_database().await.unwrap();
}

#[test]
fn test_config_from_env() {
    let config = TestDbConfig::default();
    assert!(!config.host.is_empty());
    assert!(config.port > 0);
    assert!(!config.username.is_empty());
    assert!(!config.database.is_empty());
}
