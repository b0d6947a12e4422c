//! In-process typed event bus.
//!
//! Handlers subscribe per [`EventKind`]. Synchronous handlers run inline in
//! `publish`, in descending priority and then registration order.
//! Asynchronous handlers are spawned by `publish`, or awaited together by
//! `publish_async`. A failing handler never stops the others: the failure
//! is logged and re-published as an [`BusEvent::Error`] event.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use tidings_common::{AppError, AppResult};
use tidings_db::entities::notification;
use tracing::{debug, warn};

/// Event kinds carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NotificationCreated,
    NotificationRead,
    NotificationAllRead,
    NotificationDeleted,
    NotificationsExpired,
    PresenceOnline,
    PresenceOffline,
    Error,
}

impl EventKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotificationCreated => "notification:created",
            Self::NotificationRead => "notification:read",
            Self::NotificationAllRead => "notification:all-read",
            Self::NotificationDeleted => "notification:deleted",
            Self::NotificationsExpired => "notifications:expired",
            Self::PresenceOnline => "presence:online",
            Self::PresenceOffline => "presence:offline",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published on the bus.
///
/// Serialized as `{"type": <EventKind wire name>, "body": {..}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "body")]
pub enum BusEvent {
    #[serde(rename = "notification:created")]
    NotificationCreated {
        notification: notification::Model,
    },
    #[serde(rename = "notification:read", rename_all = "camelCase")]
    NotificationRead { id: String, user_id: String },
    #[serde(rename = "notification:all-read", rename_all = "camelCase")]
    NotificationAllRead { user_id: String, count: u64 },
    #[serde(rename = "notification:deleted", rename_all = "camelCase")]
    NotificationDeleted { id: String, user_id: String },
    #[serde(rename = "notifications:expired")]
    NotificationsExpired { count: u64 },
    #[serde(rename = "presence:online", rename_all = "camelCase")]
    PresenceOnline { user_id: String },
    #[serde(rename = "presence:offline", rename_all = "camelCase")]
    PresenceOffline { user_id: String },
    /// A handler for `source` failed.
    #[serde(rename = "error")]
    Error { source: String, message: String },
}

impl BusEvent {
    /// Kind used for handler lookup.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::NotificationCreated { .. } => EventKind::NotificationCreated,
            Self::NotificationRead { .. } => EventKind::NotificationRead,
            Self::NotificationAllRead { .. } => EventKind::NotificationAllRead,
            Self::NotificationDeleted { .. } => EventKind::NotificationDeleted,
            Self::NotificationsExpired { .. } => EventKind::NotificationsExpired,
            Self::PresenceOnline { .. } => EventKind::PresenceOnline,
            Self::PresenceOffline { .. } => EventKind::PresenceOffline,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Synchronous handler.
pub type SyncHandler = Arc<dyn Fn(&BusEvent) -> AppResult<()> + Send + Sync>;

/// Asynchronous handler.
pub type AsyncHandler = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// Handle returned by every `subscribe*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    priority: i32,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    handlers: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

/// Typed publish/subscribe hub.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

impl EventBus {
    /// Create a bus with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        kind: EventKind,
        priority: i32,
        once: bool,
        handler: Handler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.inner.handlers.lock();
        let list = handlers.entry(kind).or_default();
        // Stable position: after every handler with priority >= ours.
        let at = list.partition_point(|r| r.priority >= priority);
        list.insert(
            at,
            Registration {
                id,
                priority,
                once,
                handler,
            },
        );
        id
    }

    /// Register a synchronous handler.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) -> AppResult<()> + Send + Sync + 'static,
    {
        self.register(kind, 0, false, Handler::Sync(Arc::new(handler)))
    }

    /// Register a synchronous handler with an explicit priority.
    ///
    /// Higher priorities run first; plain `subscribe` uses 0.
    pub fn subscribe_with_priority<F>(
        &self,
        kind: EventKind,
        priority: i32,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&BusEvent) -> AppResult<()> + Send + Sync + 'static,
    {
        self.register(kind, priority, false, Handler::Sync(Arc::new(handler)))
    }

    /// Register a synchronous handler that runs at most once.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) -> AppResult<()> + Send + Sync + 'static,
    {
        self.register(kind, 0, true, Handler::Sync(Arc::new(handler)))
    }

    /// Register an asynchronous handler.
    pub fn subscribe_async<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| handler(event).boxed());
        self.register(kind, 0, false, Handler::Async(handler))
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner.handlers.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Snapshot the handlers for `kind`, detaching once-handlers so that
    /// only this caller can run them.
    fn take_handlers(&self, kind: EventKind) -> Vec<Registration> {
        let mut handlers = self.inner.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return Vec::new();
        };
        let snapshot = list.clone();
        list.retain(|r| !r.once);
        snapshot
    }

    fn run_sync(&self, handler: &SyncHandler, event: &BusEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        self.report_failure(event.kind(), failure);
    }

    /// Build an async handler's future. A handler that panics before
    /// returning one is reported like any other failure.
    fn start_async(
        &self,
        handler: &AsyncHandler,
        event: &BusEvent,
    ) -> Option<BoxFuture<'static, AppResult<()>>> {
        match catch_unwind(AssertUnwindSafe(|| handler(event.clone()))) {
            Ok(fut) => Some(fut),
            Err(payload) => {
                self.report_failure(event.kind(), panic_message(payload.as_ref()));
                None
            }
        }
    }

    fn report_failure(&self, source: EventKind, message: String) {
        warn!(event = %source, error = %message, "Event handler failed");
        if source == EventKind::Error {
            return;
        }
        self.publish(BusEvent::Error {
            source: source.as_str().to_string(),
            message,
        });
    }

    /// Deliver an event.
    ///
    /// Synchronous handlers run before this returns; asynchronous ones are
    /// spawned on the current runtime. Returns the number of handlers
    /// dispatched.
    pub fn publish(&self, event: BusEvent) -> usize {
        let kind = event.kind();
        let registrations = self.take_handlers(kind);
        if registrations.is_empty() {
            return 0;
        }

        debug!(event = %kind, handlers = registrations.len(), "Publishing event");

        let mut dispatched = 0;
        for registration in &registrations {
            match &registration.handler {
                Handler::Sync(handler) => {
                    self.run_sync(handler, &event);
                    dispatched += 1;
                }
                Handler::Async(handler) => {
                    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                        warn!(event = %kind, "No runtime for async handler, skipped");
                        continue;
                    };
                    dispatched += 1;
                    let Some(fut) = self.start_async(handler, &event) else {
                        continue;
                    };
                    let bus = self.clone();
                    runtime.spawn(async move {
                        let failure = match AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(Ok(())) => return,
                            Ok(Err(e)) => e.to_string(),
                            Err(payload) => panic_message(payload.as_ref()),
                        };
                        bus.report_failure(kind, failure);
                    });
                }
            }
        }
        dispatched
    }

    /// Deliver an event and wait for every handler, including asynchronous
    /// ones. Returns whether at least one handler ran.
    pub async fn publish_async(&self, event: BusEvent) -> bool {
        let kind = event.kind();
        let registrations = self.take_handlers(kind);
        if registrations.is_empty() {
            return false;
        }

        let mut pending = Vec::new();
        for registration in &registrations {
            match &registration.handler {
                Handler::Sync(handler) => self.run_sync(handler, &event),
                Handler::Async(handler) => {
                    if let Some(fut) = self.start_async(handler, &event) {
                        pending.push(AssertUnwindSafe(fut).catch_unwind());
                    }
                }
            }
        }

        for outcome in join_all(pending).await {
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            self.report_failure(kind, failure);
        }
        true
    }
}

/// Handler result for a failure raised inside a handler.
pub fn handler_error(message: impl Into<String>) -> AppError {
    AppError::Internal(message.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn read_event() -> BusEvent {
        BusEvent::NotificationRead {
            id: "n1".to_string(),
            user_id: "u1".to_string(),
        }
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl Fn(&BusEvent) -> AppResult<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_: &BusEvent| {
            log.lock().push(tag);
            Ok(())
        }
    }

    #[test]
    fn test_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::NotificationRead, recorder(&log, "a"));
        bus.subscribe(EventKind::NotificationRead, recorder(&log, "b"));
        bus.subscribe(EventKind::NotificationRead, recorder(&log, "c"));

        assert_eq!(bus.publish(read_event()), 3);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_priority_order_keeps_ties_stable() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::NotificationRead, recorder(&log, "low"));
        bus.subscribe_with_priority(EventKind::NotificationRead, 10, recorder(&log, "high1"));
        bus.subscribe_with_priority(EventKind::NotificationRead, 10, recorder(&log, "high2"));
        bus.subscribe_with_priority(EventKind::NotificationRead, -5, recorder(&log, "last"));

        bus.publish(read_event());
        assert_eq!(*log.lock(), vec!["high1", "high2", "low", "last"]);
    }

    #[test]
    fn test_only_matching_kind_runs() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::PresenceOnline, recorder(&log, "presence"));

        assert_eq!(bus.publish(read_event()), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(EventKind::NotificationRead, recorder(&log, "a"));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(read_event());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_once_handler_runs_once() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_once(EventKind::NotificationRead, recorder(&log, "once"));

        bus.publish(read_event());
        bus.publish(read_event());
        assert_eq!(*log.lock(), vec!["once"]);
        assert_eq!(bus.handler_count(EventKind::NotificationRead), 0);
    }

    #[test]
    fn test_once_handler_under_concurrent_publish() {
        let bus = EventBus::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        bus.subscribe_once(EventKind::NotificationRead, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    bus.publish(read_event());
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others_and_raises_error_event() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::NotificationRead, |_| Err(handler_error("boom")));
        bus.subscribe(EventKind::NotificationRead, |_| panic!("kaboom"));
        bus.subscribe(EventKind::NotificationRead, recorder(&log, "after"));

        let sink = Arc::clone(&errors);
        bus.subscribe(EventKind::Error, move |event| {
            if let BusEvent::Error { source, message } = event {
                sink.lock().push(format!("{source}: {message}"));
            }
            Ok(())
        });

        bus.publish(read_event());

        assert_eq!(*log.lock(), vec!["after"]);
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("notification:read"));
        assert!(errors[0].contains("boom"));
        assert!(errors[1].contains("kaboom"));
    }

    #[test]
    fn test_error_handler_failure_does_not_recurse() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.subscribe(EventKind::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(handler_error("error handler broken"))
        });
        bus.subscribe(EventKind::NotificationRead, |_| Err(handler_error("boom")));

        bus.publish(read_event());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_async_awaits_all_handlers() {
        let bus = EventBus::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = Arc::clone(&done);
            bus.subscribe_async(EventKind::NotificationRead, move |_| {
                let done = Arc::clone(&done);
                async move {
                    tokio::task::yield_now().await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        bus.subscribe_async(EventKind::NotificationRead, |_| async {
            Err(handler_error("async failure"))
        });

        assert!(bus.publish_async(read_event()).await);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(!bus.publish_async(BusEvent::NotificationsExpired { count: 1 }).await);
    }

    #[tokio::test]
    async fn test_publish_spawns_async_handlers() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe_async(EventKind::PresenceOnline, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        });

        bus.publish(BusEvent::PresenceOnline {
            user_id: "u1".to_string(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), EventKind::PresenceOnline);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(BusEvent::NotificationAllRead {
            user_id: "u1".to_string(),
            count: 3,
        })
        .unwrap();

        assert_eq!(json["type"], "notification:all-read");
        assert_eq!(json["body"]["userId"], "u1");
        assert_eq!(json["body"]["count"], 3);
    }

    #[test]
    fn test_wire_type_matches_kind_name() {
        let events = [
            read_event(),
            BusEvent::NotificationAllRead {
                user_id: "u1".to_string(),
                count: 1,
            },
            BusEvent::NotificationDeleted {
                id: "n1".to_string(),
                user_id: "u1".to_string(),
            },
            BusEvent::NotificationsExpired { count: 2 },
            BusEvent::PresenceOnline {
                user_id: "u1".to_string(),
            },
            BusEvent::PresenceOffline {
                user_id: "u1".to_string(),
            },
            BusEvent::Error {
                source: "notification:read".to_string(),
                message: "boom".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind().as_str());
        }
    }

    #[tokio::test]
    async fn test_async_handler_panicking_before_its_future_is_contained() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        bus.subscribe(EventKind::Error, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe_async(
            EventKind::NotificationRead,
            |_| -> std::future::Ready<AppResult<()>> { panic!("factory") },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::NotificationRead, recorder(&log, "after"));

        assert_eq!(bus.publish(read_event()), 2);
        assert!(bus.publish_async(read_event()).await);

        assert_eq!(*log.lock(), vec!["after", "after"]);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }
}
