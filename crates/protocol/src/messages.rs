use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, RoomId, SocketId, UserId};

/// A room member as the registry advertises it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: UserId,
    pub socket_id: SocketId,
    pub nickname: String,
}

/// Chat message as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: RoomId,
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_nickname: String,
    pub content: String,
    /// Client clock, milliseconds since the Unix epoch. Opaque to the relay.
    pub timestamp: u64,
}

/// Chat payload fanned out to the room. Same fields as [`ChatMessage`]
/// minus the room id, which recipients already know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_nickname: String,
    pub content: String,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn into_broadcast(self) -> ChatBroadcast {
        ChatBroadcast {
            id: self.id,
            sender_id: self.sender_id,
            sender_nickname: self.sender_nickname,
            content: self.content,
            timestamp: self.timestamp,
        }
    }
}

/// Events a client sends to the server.
///
/// Adjacently tagged: the `signal` payload carries its own `type` tag, so a
/// flat internally-tagged representation would collide with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        user_id: UserId,
        nickname: String,
    },
    #[serde(rename = "leave-room", rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId, user_id: UserId },
    #[serde(rename = "request-participants", rename_all = "camelCase")]
    RequestParticipants { room_id: RoomId },
    /// Peer-to-peer signaling envelope. The `signal` value is routed without
    /// being inspected.
    #[serde(rename = "signal")]
    Signal {
        to: UserId,
        from: UserId,
        signal: Value,
    },
    #[serde(rename = "chat-message")]
    Chat(ChatMessage),
}

/// Events the server sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Full member list of a room, delivered to the requester only. Includes
    /// the requester itself on join; clients filter.
    #[serde(rename = "existing-participants")]
    ExistingParticipants(Vec<Member>),
    #[serde(rename = "userJoined")]
    UserJoined(Member),
    #[serde(rename = "userRejoined")]
    UserRejoined(Member),
    #[serde(rename = "userLeft", rename_all = "camelCase")]
    UserLeft { user_id: UserId },
    #[serde(rename = "participant-count")]
    ParticipantCount(usize),
    #[serde(rename = "signal")]
    Signal { from: UserId, signal: Value },
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(ChatBroadcast),
}

/// Typed peer-to-peer signal payload. Opaque to the server; both negotiation
/// endpoints agree on this shape inside the `signal` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalData {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

impl SignalData {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("signal payload serialization cannot fail")
    }

    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Parse a client→server text frame.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

/// Parse a server→client text frame.
pub fn decode_server_event(text: &str) -> Result<ServerEvent, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize an event for the wire.
pub fn encode_event<T: Serialize>(event: &T) -> String {
    serde_json::to_string(event).expect("event serialization cannot fail")
}
