//! Database entities.

#![allow(missing_docs)]

pub mod following;
pub mod notification;
pub mod notification_preference;
pub mod notification_queue;
pub mod user;

pub use following::Entity as Following;
pub use notification::Entity as Notification;
pub use notification_preference::Entity as NotificationPreference;
pub use notification_queue::Entity as NotificationQueue;
pub use user::Entity as User;
