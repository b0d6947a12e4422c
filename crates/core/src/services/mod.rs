//! Engine services.

pub mod batching;
pub mod directory;
pub mod event_bus;
pub mod notification;
pub mod notification_store;
pub mod presence;
pub mod rate_limit;
pub mod relay;
pub mod retry;
pub mod unread_count;

pub use batching::BatchingPublisher;
pub use directory::{DbUserDirectory, UserDirectory, UserSummary};
pub use event_bus::{BusEvent, EventBus, EventKind, SubscriptionId};
pub use notification::{
    ChannelOverrides, CreateNotificationInput, NotificationContent, NotificationQuery,
    NotificationService, NotificationWithActor,
};
pub use notification_store::{DbNotificationStore, NotificationStore};
pub use presence::{ConnectionSink, ConnectionState, OutboundMessage, PresenceTracker, Room};
pub use rate_limit::{
    RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RateLimitScope, RateLimiter, limits,
};
pub use relay::RoomRelay;
pub use retry::RetryPolicy;
pub use unread_count::UnreadCountCache;
