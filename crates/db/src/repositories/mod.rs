//! Database repositories.

mod following;
mod notification;
mod notification_preference;
mod notification_queue;
mod user;

pub use following::FollowingRepository;
pub use notification::{NotificationFilter, NotificationRepository};
pub use notification_preference::NotificationPreferenceRepository;
pub use notification_queue::NotificationQueueRepository;
pub use user::UserRepository;
