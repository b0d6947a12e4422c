//! Application configuration.

use serde::Deserialize;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Notification pipeline settings.
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Event bus batching settings.
    #[serde(default)]
    pub event_bus: EventBusConfig,
    /// Rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Presence tracker settings.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
///
/// Without a URL the engine runs on the in-process store, which is only
/// correct for a single server process.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefix: default_redis_prefix(),
        }
    }
}

/// Notification pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// TTL of cached unread counts, in seconds.
    #[serde(default = "default_unread_ttl")]
    pub unread_cache_ttl_secs: u64,
    /// Interval between expiry sweeps, in seconds. Zero disables the sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            unread_cache_ttl_secs: default_unread_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Event bus batching configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    /// Flush after this many buffered events.
    #[serde(default = "default_batch_max_events")]
    pub batch_max_events: usize,
    /// Flush after the oldest buffered event has waited this long.
    #[serde(default = "default_batch_max_delay_ms")]
    pub batch_max_delay_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            batch_max_events: default_batch_max_events(),
            batch_max_delay_ms: default_batch_max_delay_ms(),
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Whether the API middleware enforces limits at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Give up on the shared store after this long and fail open.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// Presence tracker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresenceConfig {
    /// Relay room pushes to other server processes over Redis Pub/Sub.
    #[serde(default)]
    pub relay_enabled: bool,
    /// Identifier of this process on the relay. Generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    100
}

const fn default_min_connections() -> u32 {
    5
}

fn default_redis_prefix() -> String {
    "tidings".to_string()
}

const fn default_unread_ttl() -> u64 {
    300
}

const fn default_sweep_interval() -> u64 {
    3600
}

const fn default_batch_max_events() -> usize {
    100
}

const fn default_batch_max_delay_ms() -> u64 {
    50
}

const fn default_store_timeout_ms() -> u64 {
    250
}

const fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `TIDINGS_ENV`)
    /// 4. Environment variables with `TIDINGS_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("TIDINGS_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("TIDINGS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TIDINGS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
