//! Reconnecting WebSocket transport to the signaling server.
//!
//! Every successful connect re-emits `join-room`; the registry treats the
//! repeat as a rejoin, so peers see one `userRejoined` instead of a leave/
//! join pair.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientEvent, decode_server_event, encode_event};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::engine::EngineFactory;
use crate::session::RoomSession;

pub fn ws_url(server_url: &str) -> String {
    format!("{}/ws", server_url.trim_end_matches('/'))
}

/// Drive the signaling connection until the outbound channel closes (the
/// client is shutting down). Connection loss reconnects with exponential
/// backoff.
pub async fn run_signaling<F: EngineFactory>(
    session: Arc<RoomSession<F>>,
    server_url: &str,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        tracing::info!(url = server_url, "Connecting to signaling server");

        match connect_and_handle(&session, server_url, outbound).await {
            Ok(()) => {
                tracing::info!("Signaling connection closed, shutting down");
                break;
            }
            Err(e) => {
                tracing::warn!("Signaling connection error: {e:#}");
                tracing::info!("Reconnecting in {} seconds...", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

async fn connect_and_handle<F: EngineFactory>(
    session: &RoomSession<F>,
    server_url: &str,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> Result<()> {
    let url = ws_url(server_url);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("WebSocket connection failed")?;

    tracing::info!("Connected to signaling server");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // (Re)join. A repeat for the same (room, user) replaces the stale
    // membership server-side.
    ws_tx
        .send(Message::Text(encode_event(&session.join_event()).into()))
        .await
        .context("Failed to send join-room")?;

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match decode_server_event(&text) {
                            Ok(event) => session.handle_server_event(event).await,
                            Err(e) => {
                                tracing::warn!("Dropping malformed server event: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        bail!("connection closed by server");
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    // Session torn down locally; stop for good.
                    return Ok(());
                };
                ws_tx
                    .send(Message::Text(encode_event(&event).into()))
                    .await
                    .context("WebSocket send failed")?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_appends_path_once() {
        assert_eq!(ws_url("ws://localhost:3000"), "ws://localhost:3000/ws");
        assert_eq!(ws_url("ws://localhost:3000/"), "ws://localhost:3000/ws");
    }
}
