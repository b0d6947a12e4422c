//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// ID generator for records and connections.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID.
    ///
    /// Notification ids double as the pagination cursor, so they must sort
    /// by creation time; ULIDs do within millisecond precision.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate an opaque id for a live connection or a process node.
    #[must_use]
    pub fn generate_connection_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}
