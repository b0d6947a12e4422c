//! Tidings server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tidings_api::{AppState, RateLimiterState, router};
use tidings_common::{Config, IdGenerator, SharedClock, SystemClock};
use tidings_core::{
    BatchingPublisher, DbNotificationStore, DbUserDirectory, EventBus, MemoryStore,
    NotificationService, PresenceTracker, RateLimiter, RedisStore, RoomRelay, SharedStoreRef,
    UnreadCountCache,
};
use tokio::signal;
use tokio::task::JoinHandle;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tidings=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Periodically delete expired notifications.
fn spawn_expiry_sweep(service: NotificationService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = service.cleanup_expired().await {
                warn!(error = %e, "Expiry sweep failed");
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;
    init_tracing(&config);

    info!("Starting tidings server...");

    // Connect to database
    let db = tidings_db::init(&config).await?;
    info!("Connected to database");

    info!("Running database migrations...");
    tidings_db::migrate(&db).await?;
    info!("Migrations completed");
    let db = Arc::new(db);

    let clock: SharedClock = Arc::new(SystemClock);

    // Shared store: Redis when configured, otherwise in-process
    let redis = match &config.redis.url {
        Some(url) => Some(RedisStore::connect(url, &config.redis.prefix).await?),
        None => {
            warn!("No Redis URL configured, using the in-process store");
            None
        }
    };
    let store: SharedStoreRef = match &redis {
        Some(redis) => Arc::new(redis.clone()),
        None => Arc::new(MemoryStore::new(Arc::clone(&clock))),
    };

    // Event bus
    let bus = EventBus::new();
    let batcher = BatchingPublisher::spawn(
        bus.clone(),
        config.event_bus.batch_max_events,
        Duration::from_millis(config.event_bus.batch_max_delay_ms),
    );

    // Seams onto the wider platform
    let notifications = Arc::new(DbNotificationStore::new(Arc::clone(&db)));
    let directory = Arc::new(DbUserDirectory::new(Arc::clone(&db)));

    // Presence, with the cross-process relay when enabled
    let mut presence = PresenceTracker::new(
        Arc::clone(&store),
        directory.clone(),
        bus.clone(),
        Arc::clone(&clock),
    );
    let relay = if config.presence.relay_enabled {
        let node_id = config
            .presence
            .node_id
            .clone()
            .unwrap_or_else(|| IdGenerator::new().generate_connection_id());
        let relay = RoomRelay::new(Arc::clone(&store), node_id);
        presence = presence.with_relay(relay.clone());
        Some(relay)
    } else {
        None
    };
    let presence = Arc::new(presence);
    let relay_task = match &relay {
        Some(relay) => Some(relay.start(Arc::clone(&presence)).await?),
        None => None,
    };

    // Notification pipeline
    let unread = UnreadCountCache::new(
        Arc::clone(&store),
        notifications.clone(),
        Arc::clone(&clock),
        config.notifications.unread_cache_ttl_secs,
    );
    let notification_service = NotificationService::new(
        notifications,
        directory.clone(),
        unread,
        Arc::clone(&presence),
        bus.clone(),
        Arc::clone(&clock),
    )
    .with_batcher(batcher.clone());

    let sweep_task = match config.notifications.sweep_interval_secs {
        0 => None,
        secs => Some(spawn_expiry_sweep(
            notification_service.clone(),
            Duration::from_secs(secs),
        )),
    };

    // Rate limiter
    let limiter = RateLimiter::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        Duration::from_millis(config.rate_limit.store_timeout_ms),
    );
    let rate_limiter = RateLimiterState::new(limiter, config.rate_limit.enabled);
    info!(enabled = config.rate_limit.enabled, "Initialized API rate limiter");

    let state = AppState {
        notification_service,
        presence,
        directory,
        rate_limiter,
    };

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let flushed = batcher.shutdown().await;
    info!(flushed, "Event batcher drained");

    if let Some(task) = sweep_task {
        task.abort();
    }
    if let Some(task) = relay_task {
        task.abort();
    }
    if let Some(redis) = redis {
        redis.quit().await;
    }

    info!("Server shutdown complete");
    Ok(())
}
