//! Glue between the server's room events and the peer manager: roster and
//! nickname bookkeeping, signal routing, chat surfacing.

use std::collections::HashMap;
use std::sync::Mutex;

use huddle_protocol::{
    ChatBroadcast, ChatMessage, ClientEvent, MessageId, RoomId, ServerEvent, SignalData, UserId,
};
use tokio::sync::mpsc;

use crate::engine::{EngineFactory, LocalStream};
use crate::manager::PeerManager;

/// What the embedding layer (UI, logs) observes from a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerJoined {
        user: UserId,
        nickname: String,
        rejoined: bool,
    },
    PeerLeft {
        user: UserId,
    },
    ParticipantCount(usize),
    Chat(ChatBroadcast),
}

pub struct RoomSession<F: EngineFactory> {
    room: RoomId,
    local_user: UserId,
    nickname: String,
    manager: PeerManager<F>,
    nicknames: Mutex<HashMap<UserId, String>>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<F: EngineFactory> RoomSession<F> {
    pub fn new(
        room: RoomId,
        local_user: UserId,
        nickname: String,
        manager: PeerManager<F>,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            room,
            local_user,
            nickname,
            manager,
            nicknames: Mutex::new(HashMap::new()),
            outbound,
            events,
        }
    }

    /// The join event the transport emits on every (re)connect. The registry
    /// turns a repeat into a rejoin.
    pub fn join_event(&self) -> ClientEvent {
        ClientEvent::JoinRoom {
            room_id: self.room.clone(),
            user_id: self.local_user.clone(),
            nickname: self.nickname.clone(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn manager(&self) -> &PeerManager<F> {
        &self.manager
    }

    /// Apply one server event.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ExistingParticipants(members) => {
                // The list may or may not include this client; filter by our
                // own user id so both shapes work.
                for member in members {
                    if member.user_id == self.local_user {
                        continue;
                    }
                    self.remember_nickname(&member.user_id, &member.nickname);
                    self.manager.initiate(&member.user_id).await;
                }
            }
            ServerEvent::UserJoined(member) => {
                if member.user_id == self.local_user {
                    return;
                }
                self.remember_nickname(&member.user_id, &member.nickname);
                self.manager.initiate(&member.user_id).await;
                let _ = self.events.send(SessionEvent::PeerJoined {
                    user: member.user_id,
                    nickname: member.nickname,
                    rejoined: false,
                });
            }
            ServerEvent::UserRejoined(member) => {
                if member.user_id == self.local_user {
                    return;
                }
                self.remember_nickname(&member.user_id, &member.nickname);
                // The old connection is pinned to a dead socket; rebuild.
                self.manager.remove(&member.user_id).await;
                self.manager.initiate(&member.user_id).await;
                let _ = self.events.send(SessionEvent::PeerJoined {
                    user: member.user_id,
                    nickname: member.nickname,
                    rejoined: true,
                });
            }
            ServerEvent::UserLeft { user_id } => {
                self.nicknames
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&user_id);
                self.manager.remove(&user_id).await;
                let _ = self.events.send(SessionEvent::PeerLeft { user: user_id });
            }
            ServerEvent::ParticipantCount(count) => {
                let _ = self.events.send(SessionEvent::ParticipantCount(count));
            }
            ServerEvent::Signal { from, signal } => match SignalData::from_value(&signal) {
                Ok(data) => self.manager.ingest_signal(&from, data).await,
                Err(e) => {
                    tracing::warn!(%from, "Dropping undecodable signal payload: {e}");
                }
            },
            ServerEvent::ReceiveMessage(chat) => {
                let _ = self.events.send(SessionEvent::Chat(chat));
            }
        }
    }

    /// Send a chat line to the room.
    pub fn send_chat(&self, content: impl Into<String>, timestamp: u64) {
        let message = ChatMessage {
            room_id: self.room.clone(),
            id: MessageId::generate(),
            sender_id: self.local_user.clone(),
            sender_nickname: self.nickname.clone(),
            content: content.into(),
            timestamp,
        };
        if self.outbound.send(ClientEvent::Chat(message)).is_err() {
            tracing::debug!("Outbound channel closed, dropping chat message");
        }
    }

    pub fn nickname_of(&self, user: &UserId) -> Option<String> {
        self.nicknames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
            .cloned()
    }

    /// Replace the local media source; the manager tears down and rebuilds
    /// every peer.
    pub async fn swap_local_stream(&self, stream: LocalStream) {
        self.manager.swap_local_stream(stream).await;
    }

    /// Leave the room and drop every peer.
    pub async fn leave(&self) {
        let _ = self.outbound.send(ClientEvent::LeaveRoom {
            room_id: self.room.clone(),
            user_id: self.local_user.clone(),
        });
        self.manager.close_all().await;
    }

    fn remember_nickname(&self, user: &UserId, nickname: &str) {
        self.nicknames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.clone(), nickname.to_string());
    }
}
