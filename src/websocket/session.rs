//! One actor per live connection. The actor only does plumbing: it walks
//! the Connecting → Authenticated → RoomResolved → Joined → Closed machine,
//! feeds inbound frames to the handlers, and writes rendered events to its
//! own socket. It is the only writer to that socket.

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler, WrapFuture};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::AppError;
use crate::models::Identity;
use crate::state::AppState;
use crate::websocket::events::{ReceiptKind, RoomEvent};
use crate::websocket::frames::{InboundFrame, OutboundFrame};
use crate::websocket::handlers::{self, SessionCtx};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of the pre-join gate, decided before the actor starts.
///
/// The handshake always completes so rejections can reach the client as a
/// proper close frame with the protocol's close code.
pub enum Gate {
    Authenticated {
        identity: Identity,
        peer_username: String,
    },
    Rejected {
        code: u16,
        reason: String,
    },
}

pub struct WsSession {
    state: AppState,
    gate: Option<Gate>,
    session: Option<SessionCtx>,
    hb: Instant,
}

impl WsSession {
    pub fn new(state: AppState, gate: Gate) -> Self {
        Self {
            state,
            gate: Some(gate),
            session: None,
            hb: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!("websocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Authenticated → RoomResolved → Joined, or straight to Closed.
    ///
    /// Runs under `ctx.wait` so no inbound frame is processed until the
    /// history frame has been written: history is a strict prefix of
    /// everything delivered afterwards.
    fn join(&mut self, identity: Identity, peer_username: String, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let fut = async move {
            let peer = state
                .directory
                .identity_by_username(&peer_username)
                .await?
                .ok_or_else(|| AppError::NoSharedRoom(peer_username.clone()))?;
            let room =
                handlers::resolve_shared_room(state.directory.as_ref(), &identity, &peer).await?;
            let keys =
                handlers::load_session_keys(state.directory.as_ref(), &identity, &peer).await?;
            let (subscriber_id, rx) = state.registry.join(room.id).await?;

            let mut session = SessionCtx {
                me: identity,
                peer,
                room,
                subscriber_id,
                keys,
                history_floor: 0,
            };

            let (history, floor) = match handlers::assemble_history(&state, &session).await {
                Ok(history) => history,
                Err(e) => {
                    state.registry.leave(session.room.id, subscriber_id).await;
                    return Err(e);
                }
            };
            // a broadcast that raced the history fetch is already in the
            // frame above; the floor keeps it from rendering again
            session.history_floor = floor;
            handlers::announce_online(&state, &session).await;
            Ok((session, rx, history))
        };

        ctx.wait(fut.into_actor(self).map(join_completed));
    }

    fn dispatch(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.clone() else {
            tracing::warn!("frame received before join completed, dropping");
            return;
        };

        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed inbound frame");
                return;
            }
        };

        let state = self.state.clone();
        let fut = async move {
            match frame {
                InboundFrame::ChatMessage { message } => {
                    handlers::handle_chat_message(&state, &session, &message).await
                }
                InboundFrame::MarkDelivered { message_id } => {
                    handlers::handle_mark(&state, &session, ReceiptKind::Delivered, message_id)
                        .await
                }
                InboundFrame::MarkRead { message_id } => {
                    handlers::handle_mark(&state, &session, ReceiptKind::Read, message_id).await
                }
                InboundFrame::WritingIndicator => {
                    handlers::handle_typing(&state, &session).await;
                    Ok(())
                }
            }
        };

        // wait, not spawn: inbound frames are handled one at a time so the
        // sender's emission order survives into the fan-out.
        ctx.wait(fut.into_actor(self).map(|res, _act, ctx| {
            if let Err(e) = res {
                match e {
                    AppError::Persistence(_) | AppError::MessageNotFound(_) => {
                        // reported to the sender only; nothing was broadcast
                        ctx.text(
                            OutboundFrame::Error {
                                message: e.to_string(),
                            }
                            .to_json(),
                        );
                    }
                    other => tracing::warn!(error = %other, "failed to handle inbound frame"),
                }
            }
        }));
    }
}

type JoinOutcome = Result<(SessionCtx, UnboundedReceiver<RoomEvent>, OutboundFrame), AppError>;

fn join_completed(res: JoinOutcome, act: &mut WsSession, ctx: &mut ws::WebsocketContext<WsSession>) {
    match res {
        Ok((session, rx, history)) => {
            tracing::info!(
                user = %session.me.username,
                peer = %session.peer.username,
                room_id = session.room.id,
                "session joined room"
            );
            ctx.text(history.to_json());
            ctx.text(handlers::self_presence_reply(&session).to_json());
            ctx.add_stream(UnboundedReceiverStream::new(rx));
            act.session = Some(session);
        }
        Err(e) => {
            tracing::info!(error = %e, code = e.close_code(), "closing session");
            close_and_stop(ctx, e.close_code(), e.to_string());
        }
    }
}

fn close_and_stop(ctx: &mut ws::WebsocketContext<WsSession>, code: u16, description: String) {
    ctx.close(Some(ws::CloseReason {
        code: ws::CloseCode::Other(code),
        description: Some(description),
    }));
    ctx.stop();
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);

        match self.gate.take() {
            Some(Gate::Rejected { code, reason }) => {
                tracing::info!(code, %reason, "rejecting connection");
                close_and_stop(ctx, code, reason);
            }
            Some(Gate::Authenticated {
                identity,
                peer_username,
            }) => self.join(identity, peer_username, ctx),
            None => ctx.stop(),
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.session.take() {
            tracing::info!(
                user = %session.me.username,
                room_id = session.room.id,
                "session closed"
            );
            let state = self.state.clone();
            tokio::spawn(async move {
                handlers::announce_offline(&state, &session).await;
            });
        }
    }
}

/// Room events arriving from the registry channel.
impl StreamHandler<RoomEvent> for WsSession {
    fn handle(&mut self, event: RoomEvent, ctx: &mut Self::Context) {
        if let Some(session) = &self.session {
            if let Some(frame) = handlers::render_event(&self.state.crypto, session, event) {
                ctx.text(frame.to_json());
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        // registry channel closed; the socket may still be shutting down
    }
}

/// WebSocket protocol frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => self.dispatch(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary frames not supported, dropping");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "close frame received");
                ctx.stop();
            }
            _ => {}
        }
    }
}
