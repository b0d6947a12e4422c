//! Notification and presence delivery engine.
//!
//! - [`services::EventBus`]: typed in-process publish/subscribe
//! - [`services::RateLimiter`]: sliding and fixed windows over the shared store
//! - [`services::UnreadCountCache`]: cache-aside unread counters
//! - [`services::NotificationService`]: creation, read state and expiry
//! - [`services::PresenceTracker`]: connections, rooms and online status

pub mod services;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use services::*;
pub use store::{MemoryStore, RedisStore, SessionTransition, SharedStore, SharedStoreRef};
