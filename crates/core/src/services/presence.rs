//! Presence and room tracking for live connections.
//!
//! Every authenticated connection joins its user's personal room and one
//! activity room per followed user. A user is online while at least one of
//! their connections is registered on any process; the online and offline
//! broadcasts fire only when the shared session count moves between zero
//! and one.
//!
//! The session arena holds this process's connections. Session counts live
//! in the shared store so every process agrees on online status; if the
//! store is unreachable the arena decides on its own. Transitions of one
//! user are serialized, so their broadcasts go out in the order the store
//! applied them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tidings_common::{AppError, AppResult, SharedClock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};

use super::directory::{UserDirectory, UserSummary};
use super::event_bus::{BusEvent, EventBus};
use super::relay::RoomRelay;
use crate::store::{SharedStoreRef, keys};

/// Message pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Value,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Self {
            kind: kind.into(),
            body,
        }
    }
}

/// Per-connection FIFO towards the transport.
pub type ConnectionSink = mpsc::UnboundedSender<OutboundMessage>;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Authenticating.
    Connecting,
    Connected,
    Disconnected,
}

/// Fan-out group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Every session of one user.
    User(String),
    /// Followers of one user.
    Activity(String),
    /// Viewers of a piece of content.
    Content { kind: String, id: String },
    /// Members of a party.
    Party(String),
}

impl Room {
    /// Whether joining records a location in the shared store.
    #[must_use]
    pub const fn is_location(&self) -> bool {
        matches!(self, Self::Content { .. } | Self::Party(_))
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Activity(id) => write!(f, "activity:{id}"),
            Self::Content { kind, id } => write!(f, "content:{kind}:{id}"),
            Self::Party(id) => write!(f, "party:{id}"),
        }
    }
}

impl FromStr for Room {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::Validation(format!("Invalid room: {s}"));
        let (prefix, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match prefix {
            "user" => Ok(Self::User(rest.to_string())),
            "activity" => Ok(Self::Activity(rest.to_string())),
            "party" => Ok(Self::Party(rest.to_string())),
            "content" => match rest.split_once(':') {
                Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::Content {
                    kind: kind.to_string(),
                    id: id.to_string(),
                }),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

struct Connection {
    user_id: String,
    sink: ConnectionSink,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct Arena {
    pending: HashSet<String>,
    connections: HashMap<String, Connection>,
    /// user id -> connection ids
    users: HashMap<String, HashSet<String>>,
    /// room -> connection ids
    rooms: HashMap<String, HashSet<String>>,
}

impl Arena {
    fn join(&mut self, conn_id: &str, room: String) {
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(conn_id.to_string());
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.rooms.insert(room);
        }
    }

    fn leave(&mut self, conn_id: &str, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.rooms.remove(room);
        }
    }

    /// Whether any connection of `user_id` other than `except` is in `room`.
    fn user_in_room(&self, user_id: &str, room: &str, except: &str) -> bool {
        self.users.get(user_id).is_some_and(|conns| {
            conns.iter().any(|c| {
                c != except
                    && self
                        .connections
                        .get(c)
                        .is_some_and(|conn| conn.rooms.contains(room))
            })
        })
    }
}

type TurnLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Exclusive right to change one user's presence. The lock entry is
/// dropped with the last holder.
struct Turn<'a> {
    locks: &'a TurnLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

/// Tracks live connections, their rooms and the users behind them.
pub struct PresenceTracker {
    arena: Mutex<Arena>,
    turns: TurnLocks,
    store: SharedStoreRef,
    directory: Arc<dyn UserDirectory>,
    bus: EventBus,
    clock: SharedClock,
    relay: Option<RoomRelay>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(
        store: SharedStoreRef,
        directory: Arc<dyn UserDirectory>,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            turns: Mutex::new(HashMap::new()),
            store,
            directory,
            bus,
            clock,
            relay: None,
        }
    }

    /// Also publish room pushes to other processes through `relay`.
    #[must_use]
    pub fn with_relay(mut self, relay: RoomRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Authenticate and register a connection.
    ///
    /// On failure nothing is registered and the connection ends up
    /// [`ConnectionState::Disconnected`].
    pub async fn connect(
        &self,
        conn_id: &str,
        token: &str,
        sink: ConnectionSink,
    ) -> AppResult<UserSummary> {
        self.arena.lock().pending.insert(conn_id.to_string());

        let resolved = self.resolve(token).await;
        let (user, followees) = match resolved {
            Ok(found) => found,
            Err(e) => {
                self.arena.lock().pending.remove(conn_id);
                debug!(conn_id, error = %e, "Connection rejected");
                return Err(e);
            }
        };

        let _turn = self.turn(&user.id).await;

        let local_first = {
            let mut arena = self.arena.lock();
            if !arena.pending.remove(conn_id) {
                // Disconnected while authenticating.
                return Err(AppError::NotFound(format!("connection {conn_id}")));
            }
            arena.connections.insert(
                conn_id.to_string(),
                Connection {
                    user_id: user.id.clone(),
                    sink,
                    rooms: HashSet::new(),
                },
            );
            arena.join(conn_id, Room::User(user.id.clone()).to_string());
            for followee in followees {
                arena.join(conn_id, Room::Activity(followee).to_string());
            }
            let sessions = arena.users.entry(user.id.clone()).or_default();
            sessions.insert(conn_id.to_string());
            sessions.len() == 1
        };

        let (came_online, version) = match self.store.open_session(&user.id, conn_id).await {
            Ok(transition) => (transition.came_online(), Some(transition.version)),
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Failed to record session");
                (local_first, None)
            }
        };

        info!(conn_id, user_id = %user.id, came_online, "Connection registered");

        if came_online {
            self.announce(&user.id, true, version).await;
        }

        Ok(user)
    }

    async fn turn(&self, user_id: &str) -> Turn<'_> {
        let lock = Arc::clone(self.turns.lock().entry(user_id.to_string()).or_default());
        let guard = lock.lock_owned().await;
        Turn {
            locks: &self.turns,
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Tell followers and bus subscribers about an online transition.
    ///
    /// `version` is the store's transition counter for the user, letting
    /// receivers drop a transition older than one they already applied.
    async fn announce(&self, user_id: &str, online: bool, version: Option<u64>) {
        let (kind, event) = if online {
            (
                "presence:online",
                BusEvent::PresenceOnline {
                    user_id: user_id.to_string(),
                },
            )
        } else {
            (
                "presence:offline",
                BusEvent::PresenceOffline {
                    user_id: user_id.to_string(),
                },
            )
        };
        let mut body = json!({ "userId": user_id });
        if let Some(version) = version {
            body["version"] = json!(version);
        }
        self.notify_followers(user_id, OutboundMessage::new(kind, body))
            .await;
        self.bus.publish(event);
    }

    async fn resolve(&self, token: &str) -> AppResult<(UserSummary, Vec<String>)> {
        let user = self
            .directory
            .authenticate(token)
            .await?
            .ok_or(AppError::Unauthorized)?;
        let followees = self.directory.followee_ids(&user.id).await?;
        Ok((user, followees))
    }

    #[must_use]
    pub fn state(&self, conn_id: &str) -> ConnectionState {
        let arena = self.arena.lock();
        if arena.pending.contains(conn_id) {
            ConnectionState::Connecting
        } else if arena.connections.contains_key(conn_id) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Join a content or party room and record the location.
    pub async fn join_room(&self, conn_id: &str, room: &Room) -> AppResult<()> {
        if !room.is_location() {
            return Err(AppError::Validation(format!("Room {room} cannot be joined")));
        }
        let name = room.to_string();
        let user_id = {
            let mut arena = self.arena.lock();
            let user_id = arena
                .connections
                .get(conn_id)
                .map(|c| c.user_id.clone())
                .ok_or_else(|| AppError::NotFound(format!("connection {conn_id}")))?;
            arena.join(conn_id, name.clone());
            user_id
        };

        debug!(conn_id, room = %name, "Joined room");
        if let Err(e) = self
            .store
            .zadd(&keys::location(&name), &user_id, self.clock.now_millis())
            .await
        {
            warn!(room = %name, error = %e, "Failed to record location");
        }
        Ok(())
    }

    /// Leave a content or party room.
    ///
    /// The location record is kept while another session of the same user
    /// is still in the room.
    pub async fn leave_room(&self, conn_id: &str, room: &Room) -> AppResult<()> {
        if !room.is_location() {
            return Err(AppError::Validation(format!("Room {room} cannot be left")));
        }
        let name = room.to_string();
        let (user_id, still_present) = {
            let mut arena = self.arena.lock();
            let user_id = arena
                .connections
                .get(conn_id)
                .map(|c| c.user_id.clone())
                .ok_or_else(|| AppError::NotFound(format!("connection {conn_id}")))?;
            arena.leave(conn_id, &name);
            let still_present = arena.user_in_room(&user_id, &name, conn_id);
            (user_id, still_present)
        };

        if !still_present {
            self.clear_location(&name, &user_id).await;
        }
        Ok(())
    }

    async fn clear_location(&self, room: &str, user_id: &str) {
        if let Err(e) = self.store.zrem(&keys::location(room), user_id).await {
            warn!(room, user_id, error = %e, "Failed to clear location");
        }
    }

    /// Users currently recorded at a content or party location, least
    /// recently seen first.
    pub async fn viewers(&self, room: &Room) -> AppResult<Vec<String>> {
        self.store.zrange(&keys::location(&room.to_string())).await
    }

    /// Remove a connection and everything it joined.
    ///
    /// Returns whether the user went offline, i.e. this was their last
    /// session on any process.
    pub async fn disconnect(&self, conn_id: &str) -> bool {
        let user_id = {
            let mut arena = self.arena.lock();
            arena.pending.remove(conn_id);
            match arena.connections.get(conn_id) {
                Some(conn) => conn.user_id.clone(),
                None => return false,
            }
        };

        let _turn = self.turn(&user_id).await;

        let (cleared, local_last) = {
            let mut arena = self.arena.lock();
            // Another disconnect of the same connection got here first.
            let Some(conn) = arena.connections.remove(conn_id) else {
                return false;
            };

            for room in &conn.rooms {
                if let Some(members) = arena.rooms.get_mut(room) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        arena.rooms.remove(room);
                    }
                }
            }

            let local_last = match arena.users.get_mut(&user_id) {
                Some(sessions) => {
                    sessions.remove(conn_id);
                    sessions.is_empty()
                }
                None => true,
            };
            if local_last {
                arena.users.remove(&user_id);
            }

            let cleared: Vec<String> = conn
                .rooms
                .iter()
                .filter(|room| room.parse::<Room>().is_ok_and(|r| r.is_location()))
                .filter(|room| !arena.user_in_room(&user_id, room, conn_id))
                .cloned()
                .collect();

            (cleared, local_last)
        };

        for room in &cleared {
            self.clear_location(room, &user_id).await;
        }

        let (went_offline, version) = match self.store.close_session(&user_id, conn_id).await {
            Ok(transition) => (transition.went_offline(), Some(transition.version)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to close session");
                (local_last, None)
            }
        };

        info!(conn_id, user_id = %user_id, went_offline, "Connection closed");

        if went_offline {
            self.announce(&user_id, false, version).await;
        }

        went_offline
    }

    /// Whether `user_id` has a live session here or, per the shared store,
    /// on another process.
    pub async fn is_online(&self, user_id: &str) -> bool {
        if self.arena.lock().users.contains_key(user_id) {
            return true;
        }
        match self.store.sismember(keys::ONLINE_USERS, user_id).await {
            Ok(online) => online,
            Err(e) => {
                warn!(user_id, error = %e, "Online lookup failed");
                false
            }
        }
    }

    /// Push to every session of a user.
    pub async fn notify_user(&self, user_id: &str, message: OutboundMessage) -> usize {
        self.notify_room(&Room::User(user_id.to_string()), message)
            .await
    }

    /// Push to every follower of a user.
    pub async fn notify_followers(&self, user_id: &str, message: OutboundMessage) -> usize {
        self.notify_room(&Room::Activity(user_id.to_string()), message)
            .await
    }

    /// Push to every member of a room. Returns local deliveries.
    pub async fn notify_room(&self, room: &Room, message: OutboundMessage) -> usize {
        let name = room.to_string();
        let delivered = self.deliver_local(&name, &message);
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.publish(&name, &message).await {
                warn!(room = %name, error = %e, "Failed to relay room push");
            }
        }
        delivered
    }

    /// Push to the members of `room` connected to this process.
    pub fn deliver_local(&self, room: &str, message: &OutboundMessage) -> usize {
        let arena = self.arena.lock();
        let Some(members) = arena.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|conn_id| arena.connections.get(conn_id))
            .filter(|conn| conn.sink.send(message.clone()).is_ok())
            .count()
    }

    /// Live connections on this process.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.arena.lock().connections.len()
    }

    /// Users with a live connection on this process.
    #[must_use]
    pub fn local_user_count(&self) -> usize {
        self.arena.lock().users.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventKind;
    use crate::store::{MemoryStore, SharedStore};
    use crate::testing::{FaultyStore, StaticUserDirectory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tidings_common::ManualClock;

    struct Fixture {
        tracker: PresenceTracker,
        store: Arc<MemoryStore>,
        bus: EventBus,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let directory = Arc::new(StaticUserDirectory::new());
        directory.add_user("alice", "alice-token");
        directory.add_user("bob", "bob-token");
        directory.add_user("carol", "carol-token");
        directory.follow("bob", "alice");

        let bus = EventBus::new();
        let tracker = PresenceTracker::new(store.clone(), directory, bus.clone(), clock.clone());
        Fixture {
            tracker,
            store,
            bus,
            clock,
        }
    }

    fn directory() -> Arc<StaticUserDirectory> {
        let directory = Arc::new(StaticUserDirectory::new());
        directory.add_user("alice", "alice-token");
        directory.add_user("bob", "bob-token");
        directory.follow("bob", "alice");
        directory
    }

    fn counter(bus: &EventBus, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    fn sink() -> (ConnectionSink, mpsc::UnboundedReceiver<OutboundMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_room_names() {
        let room: Room = "content:post:p1".parse().unwrap();
        assert_eq!(
            room,
            Room::Content {
                kind: "post".to_string(),
                id: "p1".to_string()
            }
        );
        assert_eq!(room.to_string(), "content:post:p1");
        assert_eq!("party:x".parse::<Room>().unwrap(), Room::Party("x".to_string()));
        assert!("content:post".parse::<Room>().is_err());
        assert!("lobby:1".parse::<Room>().is_err());
        assert!("user:".parse::<Room>().is_err());
    }

    #[tokio::test]
    async fn test_two_sessions_online_and_offline_fire_once() {
        let f = fixture();
        let online = counter(&f.bus, EventKind::PresenceOnline);
        let offline = counter(&f.bus, EventKind::PresenceOffline);

        let (tx1, _rx1) = sink();
        let (tx2, _rx2) = sink();
        f.tracker.connect("c1", "alice-token", tx1).await.unwrap();
        f.tracker.connect("c2", "alice-token", tx2).await.unwrap();

        assert_eq!(online.load(Ordering::SeqCst), 1);
        assert!(f.tracker.is_online("alice").await);
        assert!(f.store.sismember(keys::ONLINE_USERS, "alice").await.unwrap());

        assert!(!f.tracker.disconnect("c1").await);
        assert!(f.tracker.is_online("alice").await);
        assert_eq!(offline.load(Ordering::SeqCst), 0);

        assert!(f.tracker.disconnect("c2").await);
        assert!(!f.tracker.is_online("alice").await);
        assert_eq!(offline.load(Ordering::SeqCst), 1);
        assert_eq!(online.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_token_registers_nothing() {
        let f = fixture();
        let online = counter(&f.bus, EventKind::PresenceOnline);
        let (tx, _rx) = sink();

        let result = f.tracker.connect("c1", "wrong", tx).await;

        assert!(matches!(result, Err(AppError::Unauthorized)));
        assert_eq!(f.tracker.state("c1"), ConnectionState::Disconnected);
        assert_eq!(f.tracker.connection_count(), 0);
        assert_eq!(online.load(Ordering::SeqCst), 0);
        assert!(!f.tracker.disconnect("c1").await);
    }

    #[tokio::test]
    async fn test_followers_see_presence_transitions() {
        let f = fixture();
        let (bob_tx, mut bob_rx) = sink();
        f.tracker.connect("b1", "bob-token", bob_tx).await.unwrap();

        let (alice_tx, _alice_rx) = sink();
        f.tracker.connect("a1", "alice-token", alice_tx).await.unwrap();
        assert_eq!(f.tracker.state("a1"), ConnectionState::Connected);

        let msg = bob_rx.try_recv().unwrap();
        assert_eq!(msg.kind, "presence:online");
        assert_eq!(msg.body["userId"], "alice");

        f.tracker.disconnect("a1").await;
        let msg = bob_rx.try_recv().unwrap();
        assert_eq!(msg.kind, "presence:offline");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_user_reaches_every_session_in_order() {
        let f = fixture();
        let (tx1, mut rx1) = sink();
        let (tx2, mut rx2) = sink();
        f.tracker.connect("c1", "alice-token", tx1).await.unwrap();
        f.tracker.connect("c2", "alice-token", tx2).await.unwrap();

        for i in 0..3 {
            let delivered = f
                .tracker
                .notify_user("alice", OutboundMessage::new("notification", json!({ "n": i })))
                .await;
            assert_eq!(delivered, 2);
        }

        for rx in [&mut rx1, &mut rx2] {
            for i in 0..3 {
                assert_eq!(rx.try_recv().unwrap().body["n"], i);
            }
        }
    }

    #[tokio::test]
    async fn test_closed_sink_does_not_block_others() {
        let f = fixture();
        let (tx1, rx1) = sink();
        let (tx2, mut rx2) = sink();
        f.tracker.connect("c1", "alice-token", tx1).await.unwrap();
        f.tracker.connect("c2", "alice-token", tx2).await.unwrap();
        drop(rx1);

        let delivered = f
            .tracker
            .notify_user("alice", OutboundMessage::new("notification", json!({})))
            .await;

        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_location_tracking() {
        let f = fixture();
        let room = Room::Content {
            kind: "post".to_string(),
            id: "p1".to_string(),
        };
        let (a1, _r1) = sink();
        let (a2, _r2) = sink();
        let (b1, _r3) = sink();
        f.tracker.connect("a1", "alice-token", a1).await.unwrap();
        f.tracker.connect("a2", "alice-token", a2).await.unwrap();
        f.tracker.connect("b1", "bob-token", b1).await.unwrap();

        f.tracker.join_room("a1", &room).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(1));
        f.tracker.join_room("b1", &room).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(1));
        f.tracker.join_room("a2", &room).await.unwrap();

        // Re-join moves alice behind bob.
        assert_eq!(f.tracker.viewers(&room).await.unwrap(), vec!["bob", "alice"]);

        f.tracker.leave_room("a1", &room).await.unwrap();
        assert_eq!(f.tracker.viewers(&room).await.unwrap(), vec!["bob", "alice"]);

        f.tracker.disconnect("a2").await;
        assert_eq!(f.tracker.viewers(&room).await.unwrap(), vec!["bob"]);

        f.tracker.disconnect("b1").await;
        assert!(f.tracker.viewers(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_personal_rooms_cannot_be_joined() {
        let f = fixture();
        let (tx, _rx) = sink();
        f.tracker.connect("c1", "carol-token", tx).await.unwrap();

        let result = f.tracker.join_room("c1", &Room::User("alice".to_string())).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let result = f.tracker.join_room("missing", &Room::Party("x".to_string())).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_party_room_fan_out() {
        let f = fixture();
        let party = Room::Party("p".to_string());
        let (a, mut a_rx) = sink();
        let (c, mut c_rx) = sink();
        f.tracker.connect("a1", "alice-token", a).await.unwrap();
        f.tracker.connect("c1", "carol-token", c).await.unwrap();
        f.tracker.join_room("a1", &party).await.unwrap();

        let delivered = f
            .tracker
            .notify_room(&party, OutboundMessage::new("party:update", json!({})))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(a_rx.try_recv().unwrap().kind, "party:update");
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_online_status_is_shared_across_processes() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let node = || {
            let bus = EventBus::new();
            let tracker =
                PresenceTracker::new(store.clone(), directory(), bus.clone(), clock.clone());
            (tracker, bus)
        };
        let (a, a_bus) = node();
        let (b, b_bus) = node();
        let (c, _c_bus) = node();
        let a_offline = counter(&a_bus, EventKind::PresenceOffline);
        let b_online = counter(&b_bus, EventKind::PresenceOnline);

        let (tx_a, _rx_a) = sink();
        let (tx_b, _rx_b) = sink();
        a.connect("a1", "alice-token", tx_a).await.unwrap();
        b.connect("b1", "alice-token", tx_b).await.unwrap();
        // Already online through node A.
        assert_eq!(b_online.load(Ordering::SeqCst), 0);

        assert!(!a.disconnect("a1").await);
        assert_eq!(a_offline.load(Ordering::SeqCst), 0);
        assert!(c.is_online("alice").await);
        assert!(store.sismember(keys::ONLINE_USERS, "alice").await.unwrap());

        assert!(b.disconnect("b1").await);
        assert!(!c.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_reconnect_during_last_disconnect_ends_online() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(FaultyStore::new(clock.clone()));
        let tracker = Arc::new(PresenceTracker::new(
            store.clone(),
            directory(),
            EventBus::new(),
            clock,
        ));

        let (bob_tx, mut bob_rx) = sink();
        tracker.connect("b1", "bob-token", bob_tx).await.unwrap();
        let (a1, _r1) = sink();
        tracker.connect("a1", "alice-token", a1).await.unwrap();
        assert_eq!(bob_rx.try_recv().unwrap().kind, "presence:online");

        let gate = store.hold_next_close();
        let closing = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.disconnect("a1").await }
        });
        gate.entered.notified().await;

        let opening = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move {
                let (a2, _r2) = sink();
                tracker.connect("a2", "alice-token", a2).await
            }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The new tab waits for the closing one to finish announcing.
        assert_eq!(tracker.state("a2"), ConnectionState::Connecting);

        gate.release.notify_one();
        assert!(closing.await.unwrap());
        opening.await.unwrap().unwrap();

        let offline = bob_rx.try_recv().unwrap();
        let online = bob_rx.try_recv().unwrap();
        assert_eq!(offline.kind, "presence:offline");
        assert_eq!(online.kind, "presence:online");
        assert!(online.body["version"].as_u64() > offline.body["version"].as_u64());
        assert!(bob_rx.try_recv().is_err());
        assert!(tracker.is_online("alice").await);
        assert!(store.sismember(keys::ONLINE_USERS, "alice").await.unwrap());
    }
}
