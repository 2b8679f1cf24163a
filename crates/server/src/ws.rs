use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use huddle_protocol::{ClientEvent, SocketId, decode_client_event, encode_event};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};

use crate::registry;
use crate::web::AppState;

/// Drive one client connection: pump registry events out, parse client
/// events in, keep the heartbeat. On any exit path the socket's memberships
/// are swept from the registry.
pub async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let socket_id = SocketId::generate();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    state.registry.attach(socket_id.clone(), tx);
    tracing::info!(%socket_id, "WebSocket connected");

    let mut ping_interval = interval(state.config.heartbeat.ping_interval());
    ping_interval.tick().await; // consume the immediate first tick
    let ping_timeout = state.config.heartbeat.ping_timeout();
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // Registry events destined for this socket, in arrival order
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let json = encode_event(&event);
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(%socket_id, "WebSocket send failed");
                    break;
                }
            }
            // Heartbeat: missed pongs terminate the transport
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > ping_timeout {
                    tracing::debug!(%socket_id, "WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    tracing::debug!(%socket_id, "WebSocket ping send failed");
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_event(&state, &socket_id, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(%socket_id, "WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%socket_id, "WebSocket error: {e}");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    registry::dispatch(state.registry.disconnect(&socket_id));
    tracing::info!(%socket_id, "WebSocket disconnected");
}

/// Decode one client frame and apply it to the registry. The registry
/// computes the deliveries under its lock; the sends happen here, after the
/// lock is gone. Malformed frames are logged and dropped, never fatal.
fn handle_event(state: &AppState, socket_id: &SocketId, text: &str) {
    let event = match decode_client_event(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(%socket_id, "Dropping malformed client event: {e}");
            return;
        }
    };

    let outbox = match event {
        ClientEvent::JoinRoom {
            room_id,
            user_id,
            nickname,
        } => state.registry.join(&room_id, &user_id, &nickname, socket_id),
        ClientEvent::LeaveRoom { room_id, user_id } => {
            state.registry.leave(&room_id, &user_id, socket_id)
        }
        ClientEvent::RequestParticipants { room_id } => {
            state.registry.request_members(&room_id, socket_id)
        }
        ClientEvent::Signal { to, from, signal } => {
            state.registry.route_signal(&to, &from, signal)
        }
        ClientEvent::Chat(message) => state.registry.relay_chat(message, socket_id),
    };
    registry::dispatch(outbox);
}
