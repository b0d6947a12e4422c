//! Common utilities and shared types for tidings.
//!
//! This crate provides foundational components used across all tidings crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Time**: Injectable wall clock via [`Clock`]
//!
//! # Example
//!
//! ```no_run
//! use tidings_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let id = id_gen.generate();
//!     println!("Generated ID: {} for port {}", id, config.server.port);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
