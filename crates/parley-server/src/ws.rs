//! WebSocket transport for hub sessions.
//!
//! One socket is one [`SessionHandle`]: the client authenticates with its
//! session token, the handle is registered for fan-out, and the loop below
//! pumps inbound binary frames into [`ConversationHub::submit`] and outbound
//! events back as binary frames. If the session's bounded queue ever drops a
//! durable event the client is told to resync and the socket is closed; the
//! client reconnects and backfills.
//!
//! [`SessionHandle`]: parley_hub::SessionHandle
//! [`ConversationHub::submit`]: parley_hub::ConversationHub::submit

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, info, warn};

use parley_hub::SessionHandle;
use parley_shared::error::HubError;
use parley_shared::protocol::{ClientCommand, ServerEvent};
use parley_shared::types::UserId;

use crate::api::AppState;
use crate::error::ServerError;

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    // Authenticate before upgrading so a bad token costs one HTTP response.
    let user = state
        .auth
        .verify(&query.token)
        .await
        .ok_or(ServerError::Unauthorized)?;

    Ok(ws.on_upgrade(move |socket| run_session(socket, state, user)))
}

async fn run_session(mut socket: WebSocket, state: AppState, user: UserId) {
    let (handle, mut events) = SessionHandle::new(user);
    state.hub.sessions().register(handle.clone()).await;

    info!(user = %user.short(), session = %handle.id(), "websocket session opened");

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(session = %handle.id(), error = %e, "websocket error");
                        break;
                    }
                    None => break,
                };

                match frame {
                    Message::Binary(data) => {
                        if !handle_frame(&mut socket, &state, &data, user).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Text, ping and pong frames carry no commands.
                    _ => {}
                }
            }

            outbound = events.recv() => {
                let Some(event) = outbound else { break };
                if !send_event(&mut socket, &event).await {
                    break;
                }

                // A durable event was lost to queue overflow; the live
                // stream has a gap this socket can no longer close.
                if handle.needs_resync() {
                    warn!(session = %handle.id(), "session overflowed, forcing resync");
                    let _ = send_event(&mut socket, &ServerEvent::ResyncRequired).await;
                    break;
                }
            }
        }
    }

    state.hub.sessions().unregister(user, handle.id()).await;
    info!(user = %user.short(), session = %handle.id(), "websocket session closed");
}

/// Decode and submit one inbound frame. Returns false when the socket is
/// beyond saving.
async fn handle_frame(
    socket: &mut WebSocket,
    state: &AppState,
    data: &[u8],
    user: UserId,
) -> bool {
    let cmd = match ClientCommand::from_bytes(data) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(user = %user.short(), error = %e, "malformed command frame");
            return send_event(
                socket,
                &ServerEvent::CommandRejected {
                    error: HubError::InvalidPayloadType("malformed frame".into()),
                },
            )
            .await;
        }
    };

    match state.hub.submit(cmd, user).await {
        Ok(Some(reply)) => send_event(socket, &reply).await,
        Ok(None) => true,
        // Losing a call race is normal, not an error the client acts on.
        Err(HubError::AlreadyResolved(call_id)) => {
            debug!(user = %user.short(), call = %call_id, "command lost a call race");
            true
        }
        Err(error) => send_event(socket, &ServerEvent::CommandRejected { error }).await,
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    let bytes = match event.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to encode event");
            return true;
        }
    };
    socket.send(Message::Binary(bytes)).await.is_ok()
}
