//! Production [`RtcEngine`] over the `webrtc` crate. Construction follows
//! the usual APIBuilder → MediaEngine → interceptor registry sequence; every
//! runtime callback is translated into an [`EngineEvent`] on the peer task's
//! channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use huddle_protocol::UserId;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::engine::{
    EngineEvent, EngineFactory, IceCandidate, IceState, LocalStream, RemoteTrack, RtcEngine,
    SdpKind, SessionDescription, SignalingState, TrackKind, TransportState,
};

/// Builds one [`WebRtcEngine`] per remote peer.
pub struct WebRtcFactory {
    stun_urls: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(stun_urls: Vec<String>) -> Self {
        Self { stun_urls }
    }
}

impl EngineFactory for WebRtcFactory {
    type Engine = WebRtcEngine;

    async fn create(
        &self,
        remote: &UserId,
        local_stream: &LocalStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<WebRtcEngine> {
        WebRtcEngine::new(self.stun_urls.clone(), remote, local_stream, events).await
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcEngine {
    async fn new(
        stun_urls: Vec<String>,
        remote: &UserId,
        local_stream: &LocalStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register codecs")?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_urls,
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        for track in &local_stream.tracks {
            let capability = match track.kind {
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.label.clone(),
                local_stream.id.clone(),
            ));
            pc.add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("Failed to add local track")?;
        }

        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EngineEvent::NegotiationNeeded).await;
            })
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx
                            .send(EngineEvent::IceCandidate(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {e}");
                    }
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = if track.kind() == RTPCodecType::Audio {
                    TrackKind::Audio
                } else {
                    TrackKind::Video
                };
                // Label and capture-surface metadata travel in the msid/
                // stream id; dimensions are unknown until frames decode, so
                // classification falls back to the label route.
                let remote_track = RemoteTrack {
                    id: track.id(),
                    kind,
                    label: track.stream_id(),
                    display_surface: None,
                    width: 0,
                    height: 0,
                    enabled: true,
                };
                let _ = tx.send(EngineEvent::Track(remote_track)).await;
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx
                    .send(EngineEvent::ConnectionState(map_connection_state(state)))
                    .await;
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx
                    .send(EngineEvent::IceConnectionState(map_ice_state(state)))
                    .await;
            })
        }));

        tracing::debug!(%remote, "WebRTC peer connection created");
        Ok(Self { pc })
    }
}

impl RtcEngine for WebRtcEngine {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .context("Failed to create offer")?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .context("Failed to set local description")
    }

    async fn rollback_local_description(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .context("Failed to roll back local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> TransportState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).context("Invalid offer SDP"),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).context("Invalid answer SDP"),
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}
