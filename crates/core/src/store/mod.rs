//! Shared in-memory store.
//!
//! Rate-limit windows, cached unread counts, the online set and location
//! records live here. Production runs on Redis ([`RedisStore`]); a single
//! process can run on [`MemoryStore`], which is also what the tests use.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;
use tidings_common::AppResult;
use tokio::sync::broadcast;

/// Shared store handle.
pub type SharedStoreRef = Arc<dyn SharedStore>;

/// Result of one atomic sliding-window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    /// Whether the request was admitted and recorded.
    pub allowed: bool,
    /// Requests in the window, including this one when admitted.
    pub count: u64,
    /// Timestamp (ms) of the oldest request still in the window.
    pub oldest_ms: Option<i64>,
}

/// Result of opening or closing one presence session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTransition {
    /// Whether the session set actually changed.
    pub changed: bool,
    /// Sessions the user holds across all processes afterwards.
    pub sessions: u64,
    /// Per-user counter bumped on every change. Orders transitions
    /// observed by different processes.
    pub version: u64,
}

impl SessionTransition {
    /// The user went from no sessions to one.
    #[must_use]
    pub const fn came_online(&self) -> bool {
        self.changed && self.sessions == 1
    }

    /// The user's last session closed.
    #[must_use]
    pub const fn went_offline(&self) -> bool {
        self.changed && self.sessions == 0
    }
}

/// Operations the engine needs from the shared store.
///
/// Every multi-step operation is atomic per key: Redis runs it as a Lua
/// script, the in-memory backend under a single lock.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Write a string value that expires after `ttl_secs`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()>;

    /// Remove a key of any type.
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Add `delta` to an integer value only if the key exists.
    ///
    /// The result is clamped at zero. Returns the new value, or `None` when
    /// the key was absent (nothing is written in that case).
    async fn adjust_if_exists(&self, key: &str, delta: i64) -> AppResult<Option<i64>>;

    /// Increment a counter, setting `ttl_secs` when the key is created.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> AppResult<i64>;

    /// Evict entries scored `<= now_ms - window_ms`, then admit `member`
    /// at `now_ms` if fewer than `max` entries remain.
    async fn sliding_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max: u64,
    ) -> AppResult<SlidingWindowOutcome>;

    /// Upsert a sorted-set member. Last write wins.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> AppResult<()>;

    /// Remove a sorted-set member.
    async fn zrem(&self, key: &str, member: &str) -> AppResult<()>;

    /// All sorted-set members, ascending by score.
    async fn zrange(&self, key: &str) -> AppResult<Vec<String>>;

    /// Record `session` for `user_id` and add the user to
    /// [`keys::ONLINE_USERS`].
    async fn open_session(&self, user_id: &str, session: &str) -> AppResult<SessionTransition>;

    /// Drop `session`. When it was the user's last one, the session set is
    /// deleted and the user leaves [`keys::ONLINE_USERS`].
    async fn close_session(&self, user_id: &str, session: &str)
    -> AppResult<SessionTransition>;

    /// Set membership test.
    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool>;

    /// Publish a message on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()>;

    /// Receive every message subsequently published on `channel`.
    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>>;
}

/// Key layout.
pub mod keys {
    /// Set of online user ids.
    pub const ONLINE_USERS: &str = "presence:online";

    /// Live session ids of one user, across processes.
    #[must_use]
    pub fn sessions(user_id: &str) -> String {
        format!("presence:sessions:{user_id}")
    }

    /// Transition counter of one user.
    #[must_use]
    pub fn presence_version(user_id: &str) -> String {
        format!("presence:version:{user_id}")
    }

    /// Pub/Sub channel for cross-process room pushes.
    pub const ROOM_CHANNEL: &str = "tidings:rooms";

    /// Cached unread count of a user.
    #[must_use]
    pub fn unread_count(user_id: &str) -> String {
        format!("unread:{user_id}")
    }

    /// Viewers of a content or party location.
    #[must_use]
    pub fn location(room: &str) -> String {
        format!("presence:location:{room}")
    }

    /// Sliding-window log.
    #[must_use]
    pub fn sliding_window(scope: &str, identifier: &str) -> String {
        format!("ratelimit:{scope}:{identifier}")
    }

    /// Fixed-window counter for one bucket.
    #[must_use]
    pub fn fixed_window(scope: &str, identifier: &str, bucket: i64) -> String {
        format!("ratelimit:{scope}:{identifier}:{bucket}")
    }
}
