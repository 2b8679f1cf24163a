//! Per-peer perfect negotiation.
//!
//! One task per remote peer consumes a merged stream of manager commands and
//! engine events; `making_offer` and the pending-candidate queue are owned by
//! that task alone. The polite side (lexicographically smaller user id)
//! yields on glare by rolling back; the impolite side ignores the colliding
//! offer and lets its own stand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use huddle_protocol::{ClientEvent, SignalData, UserId};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::engine::{
    EngineEvent, IceCandidate, IceState, RtcEngine, SessionDescription, SignalingState,
    TransportState,
};
use crate::tracks::{RemoteStream, TrackSlot};

/// Commands from the manager to a peer task.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Inbound signal from the remote peer, relayed by the server.
    Signal(SignalData),
    /// Drive an offer now; used by the initiator role and pending retries.
    Initiate,
    /// Tear the peer down. The task closes the engine and exits.
    Close,
}

/// State changes a peer task reports back to the manager. Carries the peer
/// generation so stale reports are ignored after a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    Transport {
        user: UserId,
        generation: u64,
        state: TransportState,
    },
    TrackRouted {
        user: UserId,
        slot: TrackSlot,
    },
}

/// Decide the glare loser for a pair of user ids. Symmetric and
/// deterministic: both sides agree without coordination.
pub fn is_polite(local: &UserId, remote: &UserId) -> bool {
    local < remote
}

pub struct Negotiator<E: RtcEngine> {
    local: UserId,
    remote: UserId,
    generation: u64,
    polite: bool,
    engine: E,
    debounce: Duration,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    updates: mpsc::UnboundedSender<PeerUpdate>,
    remote_stream: Arc<std::sync::Mutex<RemoteStream>>,
    making_offer: bool,
    pending_ice: Vec<IceCandidate>,
}

impl<E: RtcEngine> Negotiator<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: UserId,
        remote: UserId,
        generation: u64,
        engine: E,
        debounce: Duration,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        updates: mpsc::UnboundedSender<PeerUpdate>,
        remote_stream: Arc<std::sync::Mutex<RemoteStream>>,
    ) -> Self {
        let polite = is_polite(&local, &remote);
        Self {
            local,
            remote,
            generation,
            polite,
            engine,
            debounce,
            outbound,
            updates,
            remote_stream,
            making_offer: false,
            pending_ice: Vec::new(),
        }
    }

    /// Serial event loop. Exits when the manager drops the command channel or
    /// sends `Close`; the engine is closed and the candidate queue discarded
    /// on the way out.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut engine_events: mpsc::Receiver<EngineEvent>,
    ) {
        let mut negotiate_deadline: Option<Instant> = None;
        loop {
            let deadline = negotiate_deadline;
            let debounce = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = debounce => {
                    negotiate_deadline = None;
                    self.on_negotiation_needed().await;
                }
                command = commands.recv() => match command {
                    Some(PeerCommand::Signal(data)) => self.on_signal(data).await,
                    Some(PeerCommand::Initiate) => self.make_offer(false, true).await,
                    Some(PeerCommand::Close) | None => break,
                },
                event = engine_events.recv() => match event {
                    Some(EngineEvent::NegotiationNeeded) => {
                        if !self.making_offer && negotiate_deadline.is_none() {
                            negotiate_deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(EngineEvent::IceCandidate(candidate)) => {
                        self.send_signal(SignalData::Candidate {
                            candidate: candidate.candidate,
                            sdp_mid: candidate.sdp_mid,
                            sdp_mline_index: candidate.sdp_mline_index,
                        });
                    }
                    Some(EngineEvent::Track(track)) => {
                        let slot = self
                            .remote_stream
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .route(track);
                        let _ = self.updates.send(PeerUpdate::TrackRouted {
                            user: self.remote.clone(),
                            slot,
                        });
                    }
                    Some(EngineEvent::ConnectionState(state)) => {
                        let _ = self.updates.send(PeerUpdate::Transport {
                            user: self.remote.clone(),
                            generation: self.generation,
                            state,
                        });
                    }
                    Some(EngineEvent::IceConnectionState(state)) => {
                        if state == IceState::Failed {
                            tracing::info!(remote = %self.remote, "ICE failed, restarting");
                            self.make_offer(true, true).await;
                        }
                    }
                    None => break,
                },
            }
        }
        self.pending_ice.clear();
        if let Err(e) = self.engine.close().await {
            tracing::debug!(remote = %self.remote, "Engine close failed: {e:#}");
        }
    }

    /// Debounced negotiation-needed. Bails while an offer attempt is in
    /// flight or the state is not stable; the next engine event re-arms it.
    async fn on_negotiation_needed(&mut self) {
        if self.making_offer {
            return;
        }
        if self.engine.signaling_state() != SignalingState::Stable {
            tracing::debug!(remote = %self.remote, "Skipping negotiation in non-stable state");
            return;
        }
        self.make_offer(false, false).await;
    }

    /// Create and send an offer. `force` skips the stable-state recheck and
    /// is used where a non-stable state is expected: the impolite fresh
    /// offer during glare, explicit initiation, and ICE restart.
    async fn make_offer(&mut self, ice_restart: bool, force: bool) {
        if self.making_offer {
            return;
        }
        self.making_offer = true;
        let result = self.try_offer(ice_restart, force).await;
        self.making_offer = false;
        if let Err(e) = result {
            tracing::warn!(remote = %self.remote, "Offer attempt failed: {e:#}");
            if ice_restart {
                // A failed restart is as good as a dead transport; hand the
                // peer to the manager's reconnect policy.
                let _ = self.updates.send(PeerUpdate::Transport {
                    user: self.remote.clone(),
                    generation: self.generation,
                    state: TransportState::Failed,
                });
            }
        }
    }

    async fn try_offer(&mut self, ice_restart: bool, force: bool) -> Result<()> {
        let offer = self.engine.create_offer(ice_restart).await?;
        if !force && self.engine.signaling_state() != SignalingState::Stable {
            tracing::debug!(remote = %self.remote, "State moved during offer creation, discarding");
            return Ok(());
        }
        self.engine.set_local_description(offer.clone()).await?;
        self.send_signal(SignalData::Offer { sdp: offer.sdp });
        Ok(())
    }

    async fn on_signal(&mut self, data: SignalData) {
        match data {
            SignalData::Offer { sdp } => self.on_offer(sdp).await,
            SignalData::Answer { sdp } => self.on_answer(sdp).await,
            SignalData::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.on_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                })
                .await;
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        let collision =
            self.making_offer || self.engine.signaling_state() != SignalingState::Stable;

        if collision && !self.polite {
            tracing::debug!(remote = %self.remote, "Glare: ignoring remote offer (impolite)");
            if !self.making_offer {
                // Make sure the remote side has our offer to answer.
                self.make_offer(false, true).await;
            }
            return;
        }
        if collision {
            tracing::debug!(remote = %self.remote, "Glare: rolling back local offer (polite)");
            if self.engine.signaling_state() == SignalingState::HaveLocalOffer {
                if let Err(e) = self.engine.rollback_local_description().await {
                    tracing::warn!(remote = %self.remote, "Rollback failed: {e:#}");
                    return;
                }
            }
            self.making_offer = false;
        }

        if let Err(e) = self
            .engine
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            tracing::warn!(remote = %self.remote, "Failed to apply remote offer: {e:#}");
            return;
        }
        self.drain_pending_ice().await;

        let answer = match self.engine.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(remote = %self.remote, "Failed to create answer: {e:#}");
                return;
            }
        };
        let sdp = answer.sdp.clone();
        if let Err(e) = self.engine.set_local_description(answer).await {
            tracing::warn!(remote = %self.remote, "Failed to apply local answer: {e:#}");
            return;
        }
        self.send_signal(SignalData::Answer { sdp });
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.engine.signaling_state() != SignalingState::HaveLocalOffer {
            tracing::debug!(remote = %self.remote, "Dropping answer outside have-local-offer");
            return;
        }
        if let Err(e) = self
            .engine
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            tracing::warn!(remote = %self.remote, "Failed to apply remote answer: {e:#}");
            return;
        }
        self.drain_pending_ice().await;
        self.making_offer = false;
    }

    /// Candidates arriving before the remote description are queued and
    /// retried exactly once, in arrival order, when a description applies.
    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.engine.has_remote_description().await {
            self.pending_ice.push(candidate);
            return;
        }
        if let Err(e) = self.engine.add_ice_candidate(candidate).await {
            tracing::warn!(remote = %self.remote, "Failed to add ICE candidate: {e:#}");
        }
    }

    async fn drain_pending_ice(&mut self) {
        for candidate in std::mem::take(&mut self.pending_ice) {
            if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                tracing::warn!(remote = %self.remote, "Failed to add queued ICE candidate: {e:#}");
            }
        }
    }

    fn send_signal(&self, data: SignalData) {
        let event = ClientEvent::Signal {
            to: self.remote.clone(),
            from: self.local.clone(),
            signal: data.to_value(),
        };
        if self.outbound.send(event).is_err() {
            tracing::debug!(remote = %self.remote, "Signaling channel closed, dropping signal");
        }
    }
}
