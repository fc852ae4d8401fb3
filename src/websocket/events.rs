//! Server-side events fanned out through the room registry.
//!
//! Events are delivered to every live session in the room, sender included;
//! each receiver compares `origin` against its own subscriber id and drops
//! its own emissions (the no-echo rule).

use crate::models::MessageView;
use crate::websocket::SubscriberId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A new persisted message. `message.content` carries the ciphertext
    /// envelope; receivers decrypt with their own private key.
    Chat {
        origin: SubscriberId,
        message: MessageView,
    },

    /// Join/leave announcement.
    Presence {
        origin: SubscriberId,
        kind: PresenceKind,
        username: String,
    },

    /// Ephemeral typing signal, never persisted.
    Typing {
        origin: SubscriberId,
        username: String,
    },

    /// A delivered/read flag flip. `message.content` is already decrypted
    /// by the acting session for display.
    Receipt {
        origin: SubscriberId,
        kind: ReceiptKind,
        message_id: i64,
        username: String,
        message: MessageView,
    },
}

impl RoomEvent {
    pub fn origin(&self) -> SubscriberId {
        match self {
            RoomEvent::Chat { origin, .. }
            | RoomEvent::Presence { origin, .. }
            | RoomEvent::Typing { origin, .. }
            | RoomEvent::Receipt { origin, .. } => *origin,
        }
    }
}
