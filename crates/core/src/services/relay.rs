//! Cross-process room relay.
//!
//! Room pushes are published on a shared-store channel tagged with the
//! sending node's id. Every node delivers envelopes from other nodes to its
//! own local room members.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tidings_common::AppResult;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::presence::{OutboundMessage, PresenceTracker};
use crate::store::{SharedStoreRef, keys};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayEnvelope {
    node_id: String,
    room: String,
    message: OutboundMessage,
}

/// Publishes and receives room pushes over the shared store.
#[derive(Clone)]
pub struct RoomRelay {
    store: SharedStoreRef,
    node_id: String,
}

impl RoomRelay {
    #[must_use]
    pub fn new(store: SharedStoreRef, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a room push for the other nodes.
    pub async fn publish(&self, room: &str, message: &OutboundMessage) -> AppResult<()> {
        let envelope = RelayEnvelope {
            node_id: self.node_id.clone(),
            room: room.to_string(),
            message: message.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.store.publish(keys::ROOM_CHANNEL, &payload).await
    }

    /// Start delivering remote pushes to `tracker`'s local members.
    ///
    /// Abort the returned handle to stop.
    pub async fn start(&self, tracker: Arc<PresenceTracker>) -> AppResult<JoinHandle<()>> {
        let mut rx = self.store.subscribe(keys::ROOM_CHANNEL).await?;
        let node_id = self.node_id.clone();
        info!(node_id = %node_id, "Room relay listening");

        Ok(tokio::spawn(async move {
            loop {
                let payload = match rx.recv().await {
                    Ok(payload) => payload,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Room relay lagged, pushes dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let envelope: RelayEnvelope = match serde_json::from_str(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed relay envelope");
                        continue;
                    }
                };
                if envelope.node_id == node_id {
                    continue;
                }

                let delivered = tracker.deliver_local(&envelope.room, &envelope.message);
                debug!(
                    from = %envelope.node_id,
                    room = %envelope.room,
                    delivered,
                    "Relayed room push"
                );
            }
            info!("Room relay stopped");
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBus;
    use crate::store::MemoryStore;
    use crate::testing::StaticUserDirectory;
    use serde_json::json;
    use std::time::Duration;
    use tidings_common::ManualClock;
    use tokio::sync::mpsc;

    fn node(store: &Arc<MemoryStore>, node_id: &str) -> (Arc<PresenceTracker>, RoomRelay) {
        let clock = Arc::new(ManualClock::starting_now());
        let directory = Arc::new(StaticUserDirectory::new());
        directory.add_user("alice", "alice-token");
        let relay = RoomRelay::new(store.clone(), node_id);
        let tracker = PresenceTracker::new(store.clone(), directory, EventBus::new(), clock)
            .with_relay(relay.clone());
        (Arc::new(tracker), relay)
    }

    #[tokio::test]
    async fn test_push_reaches_other_node_once() {
        let store = Arc::new(MemoryStore::default());
        let (a, relay_a) = node(&store, "node-a");
        let (b, relay_b) = node(&store, "node-b");
        let listener_a = relay_a.start(Arc::clone(&a)).await.unwrap();
        let listener_b = relay_b.start(Arc::clone(&b)).await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.connect("ca", "alice-token", tx_a).await.unwrap();
        b.connect("cb", "alice-token", tx_b).await.unwrap();

        a.notify_user("alice", OutboundMessage::new("notification", json!({ "id": "n1" })))
            .await;

        let remote = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.body["id"], "n1");

        let local = rx_a.recv().await.unwrap();
        assert_eq!(local.body["id"], "n1");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        listener_a.abort();
        listener_b.abort();
    }
}
