mod cli;

use std::sync::Arc;

use anyhow::Result;
use huddle_protocol::HuddleConfig;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use huddle_client::engine::LocalStream;
use huddle_client::manager::PeerManager;
use huddle_client::session::{RoomSession, SessionEvent};
use huddle_client::signaling;
use huddle_client::webrtc_engine::WebRtcFactory;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = HuddleConfig::default();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let stream_id = format!("stream-{}", args.user_id);
    let local_stream = if args.screen_share {
        LocalStream::screen_share(stream_id)
    } else {
        LocalStream::camera(stream_id)
    };

    let factory = WebRtcFactory::new(config.ice.stun_urls.clone());
    let manager = PeerManager::new(
        factory,
        config.peer.clone(),
        args.user_id.clone(),
        local_stream,
        outbound_tx.clone(),
    );
    let session = Arc::new(RoomSession::new(
        args.room.clone(),
        args.user_id.clone(),
        args.nickname.clone(),
        manager,
        outbound_tx,
        event_tx,
    ));

    // Surface roster and chat activity in the log.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::PeerJoined {
                    user,
                    nickname,
                    rejoined,
                } => {
                    tracing::info!(%user, nickname, rejoined, "Peer joined");
                }
                SessionEvent::PeerLeft { user } => {
                    tracing::info!(%user, "Peer left");
                }
                SessionEvent::ParticipantCount(count) => {
                    tracing::info!(count, "Room size changed");
                }
                SessionEvent::Chat(chat) => {
                    tracing::info!(from = %chat.sender_nickname, "Chat: {}", chat.content);
                }
            }
        }
    });

    // Lines typed on stdin go out as chat messages.
    let chat_session = Arc::clone(&session);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            chat_session.send_chat(line, unix_millis());
        }
    });

    tracing::info!(room = %args.room, user = %args.user_id, nickname = args.nickname, "Joining room");
    signaling::run_signaling(session, &args.server_url, &mut outbound_rx).await;
    Ok(())
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
