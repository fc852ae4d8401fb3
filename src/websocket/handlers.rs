//! Session logic behind the WebSocket actor: room resolution, key caching,
//! history assembly, frame handling and fan-out event rendering. Kept free
//! of actor plumbing so the protocol can be exercised directly in tests.

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::AppError;
use crate::models::{Identity, Room, StoredMessage};
use crate::services::directory::Directory;
use crate::services::encryption::{EncryptionManager, Envelope};
use crate::state::AppState;
use crate::websocket::events::{PresenceKind, ReceiptKind, RoomEvent};
use crate::websocket::frames::OutboundFrame;
use crate::websocket::SubscriberId;

/// Key material cached once at `Joined` entry.
///
/// The peer's private key is held because history replay must decrypt the
/// session owner's own sent messages, which were encrypted for the peer.
#[derive(Clone)]
pub struct SessionKeys {
    pub self_private: RsaPrivateKey,
    pub peer_private: RsaPrivateKey,
    pub peer_public: RsaPublicKey,
}

/// Everything a joined session owns. One instance per live connection,
/// never shared across connections.
#[derive(Clone)]
pub struct SessionCtx {
    pub me: Identity,
    pub peer: Identity,
    pub room: Room,
    pub subscriber_id: SubscriberId,
    pub keys: SessionKeys,
    /// Highest message id shipped in the `chat_history` frame. A chat event
    /// at or below this id was already delivered as history and is dropped
    /// at render time, so a broadcast racing the history fetch cannot be
    /// delivered twice.
    pub history_floor: i64,
}

/// Intersect the caller's rooms with the peer's and pick the shared one.
///
/// Tie-break when the pair shares several rooms: smallest room id. That is
/// deterministic and symmetric, so A→B and B→A resolve identically.
pub async fn resolve_shared_room(
    directory: &dyn Directory,
    me: &Identity,
    peer: &Identity,
) -> Result<Room, AppError> {
    let mine = directory.rooms_for(me.id).await?;
    let theirs = directory.rooms_for(peer.id).await?;

    mine.into_iter()
        .filter(|room| theirs.iter().any(|other| other.id == room.id))
        .min_by_key(|room| room.id)
        .ok_or_else(|| AppError::NoSharedRoom(peer.username.clone()))
}

/// Fetch and parse both parties' key material.
pub async fn load_session_keys(
    directory: &dyn Directory,
    me: &Identity,
    peer: &Identity,
) -> Result<SessionKeys, AppError> {
    let self_pair = directory.keypair_for(me.id).await?;
    let peer_pair = directory.keypair_for(peer.id).await?;

    Ok(SessionKeys {
        self_private: crate::services::encryption::parse_private_key(&self_pair.private_pem)?,
        peer_private: crate::services::encryption::parse_private_key(&peer_pair.private_pem)?,
        peer_public: crate::services::encryption::parse_public_key(&peer_pair.public_pem)?,
    })
}

/// Decrypt a stored message for display and name its sender.
///
/// Directionality: a message is encrypted for its recipient, so the key that
/// opens it belongs to whichever side did not send it.
fn decrypt_for_display(
    crypto: &EncryptionManager,
    ctx: &SessionCtx,
    stored: &StoredMessage,
) -> Result<(String, String), AppError> {
    let (sender_username, key) = if stored.sender_id == ctx.me.id {
        (ctx.me.username.clone(), &ctx.keys.peer_private)
    } else if stored.sender_id == ctx.peer.id {
        (ctx.peer.username.clone(), &ctx.keys.self_private)
    } else {
        // Pairwise protocol: a message from outside the pair was encrypted
        // for neither of our keys.
        return Err(AppError::Decryption(format!(
            "message {} from sender {} outside the pair",
            stored.id, stored.sender_id
        )));
    };

    let envelope = Envelope::from_json(&stored.content)?;
    let plaintext = crypto.decrypt(&envelope, key)?;
    Ok((sender_username, plaintext))
}

/// Build the `chat_history` frame: every persisted message for the room in
/// chronological order, decrypted per the directionality rule. An
/// undecryptable message is skipped, never fatal for the batch.
///
/// Also returns the highest persisted id in the batch (0 when empty); the
/// session records it as its history floor so live events already covered
/// by history are not rendered a second time.
pub async fn assemble_history(
    state: &AppState,
    ctx: &SessionCtx,
) -> Result<(OutboundFrame, i64), AppError> {
    let stored = state.store.history(ctx.room.id).await?;
    let floor = stored.iter().map(|m| m.id).max().unwrap_or(0);

    let mut messages = Vec::with_capacity(stored.len());
    for message in &stored {
        match decrypt_for_display(&state.crypto, ctx, message) {
            Ok((sender, plaintext)) => messages.push(message.view(&sender, plaintext)),
            Err(e) => {
                tracing::warn!(message_id = message.id, error = %e, "skipping undecryptable message in history");
            }
        }
    }

    Ok((OutboundFrame::ChatHistory { messages }, floor))
}

/// The explicit self-reply sent on join, distinct from the room broadcast so
/// the client can tell "I just joined" from "peer is already online".
pub fn self_presence_reply(ctx: &SessionCtx) -> OutboundFrame {
    OutboundFrame::OnlineAck {
        message: format!("connected to room {}", ctx.room.id),
        sender: ctx.me.username.clone(),
    }
}

/// Announce presence to the room and flip the directory flag (best-effort).
pub async fn announce_online(state: &AppState, ctx: &SessionCtx) {
    if let Err(e) = state.directory.set_online(ctx.me.id, true).await {
        tracing::debug!(error = %e, "failed to set online flag");
    }
    state
        .registry
        .broadcast(
            ctx.room.id,
            RoomEvent::Presence {
                origin: ctx.subscriber_id,
                kind: PresenceKind::Online,
                username: ctx.me.username.clone(),
            },
        )
        .await;
}

/// Disconnect cleanup: offline broadcast, presence flag, deregistration.
/// All best-effort; local cleanup always completes.
pub async fn announce_offline(state: &AppState, ctx: &SessionCtx) {
    state
        .registry
        .broadcast(
            ctx.room.id,
            RoomEvent::Presence {
                origin: ctx.subscriber_id,
                kind: PresenceKind::Offline,
                username: ctx.me.username.clone(),
            },
        )
        .await;
    if let Err(e) = state.directory.set_online(ctx.me.id, false).await {
        tracing::debug!(error = %e, "failed to clear online flag");
    }
    state.registry.leave(ctx.room.id, ctx.subscriber_id).await;
}

/// `chat_message`: encrypt for the peer, persist, then broadcast.
///
/// Persistence strictly precedes the broadcast; a message that failed to
/// persist is never fanned out.
pub async fn handle_chat_message(
    state: &AppState,
    ctx: &SessionCtx,
    plaintext: &str,
) -> Result<(), AppError> {
    let envelope = state.crypto.encrypt(plaintext, &ctx.keys.peer_public)?;
    let stored = state
        .store
        .create(ctx.me.id, ctx.room.id, &envelope.to_json()?)
        .await?;

    let view = stored.view(&ctx.me.username, stored.content.clone());
    state
        .registry
        .broadcast(
            ctx.room.id,
            RoomEvent::Chat {
                origin: ctx.subscriber_id,
                message: view,
            },
        )
        .await;
    Ok(())
}

/// `mark_delivered` / `mark_read`: flip the flag in storage, then broadcast
/// a receipt carrying the decrypted message for display.
///
/// The message must belong to the session's room; an id from any other room
/// reads as not-found and nothing is persisted or broadcast.
pub async fn handle_mark(
    state: &AppState,
    ctx: &SessionCtx,
    kind: ReceiptKind,
    message_id: i64,
) -> Result<(), AppError> {
    let existing = state
        .store
        .get(message_id)
        .await?
        .ok_or(AppError::MessageNotFound(message_id))?;
    if existing.room_id != ctx.room.id {
        return Err(AppError::MessageNotFound(message_id));
    }

    let stored = match kind {
        ReceiptKind::Delivered => state.store.set_delivered(message_id).await?,
        ReceiptKind::Read => state.store.set_read(message_id).await?,
    };

    let (sender_username, plaintext) = decrypt_for_display(&state.crypto, ctx, &stored)?;
    let view = stored.view(&sender_username, plaintext);

    state
        .registry
        .broadcast(
            ctx.room.id,
            RoomEvent::Receipt {
                origin: ctx.subscriber_id,
                kind,
                message_id,
                username: ctx.me.username.clone(),
                message: view,
            },
        )
        .await;
    Ok(())
}

/// `writing_indicator`: ephemeral broadcast, nothing persisted.
pub async fn handle_typing(state: &AppState, ctx: &SessionCtx) {
    state
        .registry
        .broadcast(
            ctx.room.id,
            RoomEvent::Typing {
                origin: ctx.subscriber_id,
                username: ctx.me.username.clone(),
            },
        )
        .await;
}

/// Turn a fan-out event into the client-facing frame for this session.
///
/// Applies the no-echo rule first: an event this session originated is
/// dropped for every event kind. Chat ciphertext is decrypted with the
/// session's own private key; an undecryptable message is skipped.
pub fn render_event(
    crypto: &EncryptionManager,
    ctx: &SessionCtx,
    event: RoomEvent,
) -> Option<OutboundFrame> {
    if event.origin() == ctx.subscriber_id {
        return None;
    }

    match event {
        RoomEvent::Chat { message, .. } => {
            // already shipped inside chat_history; history is a strict prefix
            if message.id <= ctx.history_floor {
                return None;
            }
            let envelope = match Envelope::from_json(&message.content) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(message_id = message.id, error = %e, "dropping malformed chat event");
                    return None;
                }
            };
            match crypto.decrypt(&envelope, &ctx.keys.self_private) {
                Ok(plaintext) => Some(OutboundFrame::ChatMessage {
                    message: crate::models::MessageView {
                        content: plaintext,
                        ..message
                    },
                }),
                Err(e) => {
                    tracing::warn!(message_id = message.id, error = %e, "dropping undecryptable chat event");
                    None
                }
            }
        }

        RoomEvent::Presence { kind, username, .. } => Some(match kind {
            PresenceKind::Online => OutboundFrame::OnlineAck {
                message: format!("{username} is online"),
                sender: username,
            },
            PresenceKind::Offline => OutboundFrame::OfflineAck {
                message: format!("{username} went offline"),
                sender: username,
            },
        }),

        RoomEvent::Typing { username, .. } => Some(OutboundFrame::WritingIndicator {
            message: format!("{username} is typing..."),
            sender: username,
        }),

        RoomEvent::Receipt {
            kind,
            message_id,
            username,
            message,
            ..
        } => Some(match kind {
            ReceiptKind::Delivered => OutboundFrame::DeliveryReceipt {
                message_id,
                sender: username,
                serialized_message: message,
            },
            ReceiptKind::Read => OutboundFrame::ReadReceipt {
                message_id,
                sender: username,
                serialized_message: message,
            },
        }),
    }
}
