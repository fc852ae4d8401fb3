use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Mutex, RwLock,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::websocket::events::RoomEvent;

pub mod events;
pub mod frames;
pub mod handlers;
pub mod session;

/// Channel identity of one live connection within a room group.
///
/// Carried on every fan-out event so receivers can apply the no-echo rule:
/// a session never re-renders its own emission as incoming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<RoomEvent>,
}

#[derive(Default)]
struct RoomGroup {
    subscribers: Vec<Subscriber>,
    /// Set when the group is pruned from the map. A joiner that raced the
    /// prune and locked the orphaned group retries against a fresh entry
    /// instead of registering where no broadcast will ever look.
    closed: bool,
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<i64, Arc<Mutex<RoomGroup>>>,
    closed: bool,
}

/// Room membership registry for live connections.
///
/// The outer lock only guards the room map; delivery runs under a per-room
/// critical section so traffic in one room cannot stall another. A join
/// racing a broadcast either sees the event (registered before delivery
/// takes the room lock) or does not, but is never double-delivered.
#[derive(Default, Clone)]
pub struct RoomRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in a room group.
    ///
    /// Fails once `shutdown` has been called; joining sessions map that to
    /// close code 500 (fan-out backend unavailable).
    pub async fn join(
        &self,
        room_id: i64,
    ) -> Result<(SubscriberId, UnboundedReceiver<RoomEvent>), AppError> {
        loop {
            let group = {
                let mut state = self.inner.write().await;
                if state.closed {
                    return Err(AppError::FanoutUnavailable);
                }
                state.rooms.entry(room_id).or_default().clone()
            };

            let mut group = group.lock().await;
            if group.closed {
                // lost the race with a prune; the map entry is gone
                continue;
            }

            let (tx, rx) = unbounded_channel();
            let subscriber_id = SubscriberId::new();
            group.subscribers.push(Subscriber {
                id: subscriber_id,
                sender: tx,
            });
            tracing::debug!(
                room_id,
                members = group.subscribers.len(),
                "subscriber joined room group"
            );
            return Ok((subscriber_id, rx));
        }
    }

    /// Remove a connection from a room group. Always succeeds; stale or
    /// unknown ids are ignored so disconnect cleanup cannot fail.
    pub async fn leave(&self, room_id: i64, subscriber_id: SubscriberId) {
        let group = {
            let state = self.inner.read().await;
            match state.rooms.get(&room_id) {
                Some(group) => group.clone(),
                None => return,
            }
        };

        let emptied = {
            let mut group = group.lock().await;
            group.subscribers.retain(|s| s.id != subscriber_id);
            group.subscribers.is_empty()
        };

        if emptied {
            let mut state = self.inner.write().await;
            if let Some(group) = state.rooms.get(&room_id).cloned() {
                let mut group = group.lock().await;
                if group.subscribers.is_empty() {
                    group.closed = true;
                    drop(group);
                    state.rooms.remove(&room_id);
                    tracing::debug!(room_id, "removed empty room group");
                }
            }
        }
    }

    /// Deliver an event to every member registered at the time of the call,
    /// including the sender. No-echo filtering is the receiver's job.
    ///
    /// Per-sender emission order is preserved: each subscriber channel is
    /// FIFO and all sends for one broadcast happen under the room lock.
    pub async fn broadcast(&self, room_id: i64, event: RoomEvent) {
        let group = {
            let state = self.inner.read().await;
            match state.rooms.get(&room_id) {
                Some(group) => group.clone(),
                None => return,
            }
        };

        let mut group = group.lock().await;
        let before = group.subscribers.len();
        group
            .subscribers
            .retain(|s| s.sender.send(event.clone()).is_ok());
        let dropped = before - group.subscribers.len();
        if dropped > 0 {
            tracing::debug!(room_id, dropped, "pruned dead subscribers during broadcast");
        }
    }

    /// Deliver an event to a single member. A missing target is a no-op,
    /// not an error: the peer may have disconnected in between.
    pub async fn unicast(&self, room_id: i64, target: SubscriberId, event: RoomEvent) {
        let group = {
            let state = self.inner.read().await;
            match state.rooms.get(&room_id) {
                Some(group) => group.clone(),
                None => return,
            }
        };

        let group = group.lock().await;
        if let Some(subscriber) = group.subscribers.iter().find(|s| s.id == target) {
            let _ = subscriber.sender.send(event);
        }
    }

    /// Refuse further joins. Existing members keep their channels; this only
    /// flips the availability gate new sessions check.
    pub async fn shutdown(&self) {
        let mut state = self.inner.write().await;
        state.closed = true;
    }

    pub async fn member_count(&self, room_id: i64) -> usize {
        let state = self.inner.read().await;
        match state.rooms.get(&room_id) {
            Some(group) => group.lock().await.subscribers.len(),
            None => 0,
        }
    }
}
