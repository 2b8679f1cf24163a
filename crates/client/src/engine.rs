//! The seam between the negotiation core and the WebRTC runtime.
//!
//! The runtime owns ICE, DTLS, and media; the core only drives it. Everything
//! the state machines need from a peer connection is behind [`RtcEngine`], and
//! everything the runtime reports back arrives as [`EngineEvent`]s on a
//! channel owned by the peer's task.

use std::future::Future;

use anyhow::Result;
use huddle_protocol::UserId;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// JSEP signaling state as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate connection state of the peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE connectivity state, reported separately so a failed ICE round can be
/// restarted without tearing the transport down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// An inbound media track as the engine surfaces it, with the metadata the
/// track router classifies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    /// Capture-surface hint, present only for display capture.
    pub display_surface: Option<String>,
    pub width: u32,
    pub height: u32,
    pub enabled: bool,
}

/// The local media source. Shared by every peer; owned by the session layer,
/// the manager holds it only while it is the active source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub label: String,
}

impl LocalStream {
    /// Camera + microphone, the default capture shape.
    pub fn camera(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: vec![
                LocalTrack {
                    kind: TrackKind::Video,
                    label: "camera".to_string(),
                },
                LocalTrack {
                    kind: TrackKind::Audio,
                    label: "microphone".to_string(),
                },
            ],
        }
    }

    /// Screen capture plus the microphone.
    pub fn screen_share(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: vec![
                LocalTrack {
                    kind: TrackKind::Video,
                    label: "screen".to_string(),
                },
                LocalTrack {
                    kind: TrackKind::Audio,
                    label: "microphone".to_string(),
                },
            ],
        }
    }
}

/// Everything the runtime pushes at the core. Consumed by the per-peer task
/// alongside its command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Local tracks changed; the engine wants a (re)negotiation.
    NegotiationNeeded,
    /// A locally gathered candidate to trickle to the remote peer.
    IceCandidate(IceCandidate),
    /// An inbound media track arrived over the negotiated connection.
    Track(RemoteTrack),
    ConnectionState(TransportState),
    IceConnectionState(IceState),
}

/// One peer connection as the negotiation machine drives it.
///
/// Method futures carry an explicit `Send` bound because peer tasks are
/// spawned onto the multithreaded runtime.
pub trait RtcEngine: Send + Sync + 'static {
    fn create_offer(
        &self,
        ice_restart: bool,
    ) -> impl Future<Output = Result<SessionDescription>> + Send;

    fn create_answer(&self) -> impl Future<Output = Result<SessionDescription>> + Send;

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = Result<()>> + Send;

    /// `setLocalDescription({type: rollback})`: abandon a local offer so a
    /// remote one can be applied.
    fn rollback_local_description(&self) -> impl Future<Output = Result<()>> + Send;

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_ice_candidate(&self, candidate: IceCandidate) -> impl Future<Output = Result<()>> + Send;

    fn has_remote_description(&self) -> impl Future<Output = bool> + Send;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> TransportState;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Builds one engine per remote peer, its events wired to the given channel.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: RtcEngine;

    fn create(
        &self,
        remote: &UserId,
        local_stream: &LocalStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> impl Future<Output = Result<Self::Engine>> + Send;
}
