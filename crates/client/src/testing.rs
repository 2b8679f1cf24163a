//! Scripted engine double for the negotiation and manager tests. Follows the
//! JSEP signaling-state transitions strictly and fails loudly on any call
//! that a real engine would reject.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use huddle_protocol::UserId;
use tokio::sync::mpsc;

use crate::engine::{
    EngineEvent, EngineFactory, IceCandidate, LocalStream, RtcEngine, SdpKind, SessionDescription,
    SignalingState, TransportState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OfferRecord {
    pub ice_restart: bool,
}

#[derive(Debug)]
pub(crate) struct FakeInner {
    pub signaling: SignalingState,
    pub transport: TransportState,
    pub has_remote: bool,
    pub offers: Vec<OfferRecord>,
    pub answers_created: u32,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub added_candidates: Vec<IceCandidate>,
    pub rollbacks: u32,
    pub closed: bool,
    pub offers_in_flight: u32,
    pub max_offers_in_flight: u32,
    /// When set, the next add_ice_candidate call fails once.
    pub fail_candidates_once: bool,
    /// Simulated offer-creation latency, for overlap checks.
    pub offer_delay: Option<Duration>,
    counter: u32,
}

impl Default for FakeInner {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            transport: TransportState::New,
            has_remote: false,
            offers: Vec::new(),
            answers_created: 0,
            local_descriptions: Vec::new(),
            remote_descriptions: Vec::new(),
            added_candidates: Vec::new(),
            rollbacks: 0,
            closed: false,
            offers_in_flight: 0,
            max_offers_in_flight: 0,
            fail_candidates_once: false,
            offer_delay: None,
            counter: 0,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeShared {
    inner: Mutex<FakeInner>,
}

impl FakeShared {
    pub fn lock(&self) -> MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct FakeEngine {
    pub shared: Arc<FakeShared>,
}

impl RtcEngine for FakeEngine {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let delay = {
            let mut inner = self.shared.lock();
            inner.offers_in_flight += 1;
            inner.max_offers_in_flight = inner.max_offers_in_flight.max(inner.offers_in_flight);
            inner.offer_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.shared.lock();
        inner.offers_in_flight -= 1;
        inner.counter += 1;
        inner.offers.push(OfferRecord { ice_restart });
        Ok(SessionDescription::offer(format!("offer-{}", inner.counter)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.shared.lock();
        if inner.signaling != SignalingState::HaveRemoteOffer {
            bail!("create_answer in {:?}", inner.signaling);
        }
        inner.counter += 1;
        inner.answers_created += 1;
        Ok(SessionDescription::answer(format!("answer-{}", inner.counter)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.shared.lock();
        match desc.kind {
            SdpKind::Offer => {
                if !matches!(
                    inner.signaling,
                    SignalingState::Stable | SignalingState::HaveLocalOffer
                ) {
                    bail!("set_local_description(offer) in {:?}", inner.signaling);
                }
                inner.signaling = SignalingState::HaveLocalOffer;
            }
            SdpKind::Answer => {
                if inner.signaling != SignalingState::HaveRemoteOffer {
                    bail!("set_local_description(answer) in {:?}", inner.signaling);
                }
                inner.signaling = SignalingState::Stable;
            }
        }
        inner.local_descriptions.push(desc);
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.signaling != SignalingState::HaveLocalOffer {
            bail!("rollback in {:?}", inner.signaling);
        }
        inner.signaling = SignalingState::Stable;
        inner.rollbacks += 1;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.shared.lock();
        match desc.kind {
            SdpKind::Offer => {
                if !matches!(
                    inner.signaling,
                    SignalingState::Stable | SignalingState::HaveRemoteOffer
                ) {
                    bail!("set_remote_description(offer) in {:?}", inner.signaling);
                }
                inner.signaling = SignalingState::HaveRemoteOffer;
            }
            SdpKind::Answer => {
                if inner.signaling != SignalingState::HaveLocalOffer {
                    bail!("set_remote_description(answer) in {:?}", inner.signaling);
                }
                inner.signaling = SignalingState::Stable;
            }
        }
        inner.has_remote = true;
        inner.remote_descriptions.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.shared.lock();
        if !inner.has_remote {
            bail!("add_ice_candidate before remote description");
        }
        if inner.fail_candidates_once {
            inner.fail_candidates_once = false;
            bail!("injected candidate failure");
        }
        inner.added_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.shared.lock().has_remote
    }

    fn signaling_state(&self) -> SignalingState {
        self.shared.lock().signaling
    }

    fn connection_state(&self) -> TransportState {
        self.shared.lock().transport
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        inner.closed = true;
        inner.signaling = SignalingState::Closed;
        inner.transport = TransportState::Closed;
        Ok(())
    }
}

/// One engine handed out by [`FakeFactory`], with the handles a test needs
/// to script it.
pub(crate) struct FakeEndpoint {
    pub remote: UserId,
    pub shared: Arc<FakeShared>,
    pub events: mpsc::Sender<EngineEvent>,
    pub local_stream: LocalStream,
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub endpoints: Arc<Mutex<Vec<FakeEndpoint>>>,
}

impl EngineFactory for FakeFactory {
    type Engine = FakeEngine;

    async fn create(
        &self,
        remote: &UserId,
        local_stream: &LocalStream,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<FakeEngine> {
        let shared = Arc::new(FakeShared::default());
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.push(FakeEndpoint {
            remote: remote.clone(),
            shared: Arc::clone(&shared),
            events,
            local_stream: local_stream.clone(),
        });
        Ok(FakeEngine { shared })
    }
}
