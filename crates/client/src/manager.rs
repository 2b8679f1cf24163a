//! Ownership of the peer table: capacity, GC, reconnect policy, and the
//! local-stream swap. Every scheduled continuation re-checks the peer's
//! generation before acting, so work scheduled against a replaced or removed
//! peer dies quietly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use huddle_protocol::{ClientEvent, PeerConfig, SignalData, UserId};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::engine::{EngineFactory, LocalStream, TransportState};
use crate::negotiation::{self, Negotiator, PeerCommand, PeerUpdate};
use crate::tracks::RemoteStream;

struct PeerHandle {
    generation: u64,
    created_at: Instant,
    commands: mpsc::UnboundedSender<PeerCommand>,
    remote_stream: Arc<std::sync::Mutex<RemoteStream>>,
    last_transport: TransportState,
}

struct ManagerState {
    peers: HashMap<UserId, PeerHandle>,
    pending: HashSet<UserId>,
    local_stream: LocalStream,
    next_generation: u64,
}

struct Shared<F: EngineFactory> {
    factory: F,
    settings: PeerConfig,
    local_user: UserId,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    updates: mpsc::UnboundedSender<PeerUpdate>,
    state: Mutex<ManagerState>,
}

pub struct PeerManager<F: EngineFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: EngineFactory> Clone for PeerManager<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: EngineFactory> PeerManager<F> {
    /// Build the manager and start its background loops (peer-update
    /// consumer and the stale-connection sweep).
    pub fn new(
        factory: F,
        settings: PeerConfig,
        local_user: UserId,
        local_stream: LocalStream,
        outbound: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let manager = Self {
            shared: Arc::new(Shared {
                factory,
                settings,
                local_user,
                outbound,
                updates: update_tx,
                state: Mutex::new(ManagerState {
                    peers: HashMap::new(),
                    pending: HashSet::new(),
                    local_stream,
                    next_generation: 0,
                }),
            }),
        };
        tokio::spawn(manager.clone().consume_updates(update_rx));
        tokio::spawn(manager.clone().run_sweep());
        manager
    }

    /// Ensure a peer connection exists for `remote`. The impolite side
    /// drives the first offer; the polite side has its tracks attached and
    /// lets negotiation-needed do it.
    pub async fn initiate(&self, remote: &UserId) {
        if remote == &self.shared.local_user {
            return;
        }
        let mut state = self.shared.state.lock().await;
        state.pending.remove(remote);
        if state.peers.contains_key(remote) {
            return;
        }
        self.spawn_peer(&mut state, remote, true).await;
    }

    /// Route an inbound signal to the per-peer task, creating the peer first
    /// if this is the opening signal of a remote-initiated negotiation.
    pub async fn ingest_signal(&self, from: &UserId, data: SignalData) {
        let mut state = self.shared.state.lock().await;
        if !state.peers.contains_key(from) {
            self.spawn_peer(&mut state, from, false).await;
        }
        if let Some(handle) = state.peers.get(from) {
            let _ = handle.commands.send(PeerCommand::Signal(data));
        }
    }

    /// Replace the local media source: tear down every peer, wait out the
    /// swap delay, then re-initiate to every previously connected remote and
    /// retry anything that was pending.
    pub async fn swap_local_stream(&self, new_stream: LocalStream) {
        let targets: Vec<UserId> = {
            let mut state = self.shared.state.lock().await;
            let mut targets: Vec<UserId> = state.peers.keys().cloned().collect();
            targets.extend(state.pending.drain());
            for user in targets.iter() {
                Self::remove_locked(&mut state, user);
            }
            state.local_stream = new_stream;
            targets
        };
        tracing::info!(peers = targets.len(), "Local stream swapped, rebuilding peers");
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.shared.settings.stream_swap_delay()).await;
            for user in targets {
                manager.initiate(&user).await;
            }
        });
    }

    /// Tear down one peer: transport closed, candidate queue dropped with
    /// the task, pending retry cancelled.
    pub async fn remove(&self, remote: &UserId) {
        let mut state = self.shared.state.lock().await;
        state.pending.remove(remote);
        Self::remove_locked(&mut state, remote);
    }

    /// Idempotent full teardown.
    pub async fn close_all(&self) {
        let mut state = self.shared.state.lock().await;
        let users: Vec<UserId> = state.peers.keys().cloned().collect();
        for user in users {
            Self::remove_locked(&mut state, &user);
        }
        state.pending.clear();
    }

    pub async fn has_peer(&self, remote: &UserId) -> bool {
        self.shared.state.lock().await.peers.contains_key(remote)
    }

    pub async fn peer_users(&self) -> Vec<UserId> {
        self.shared.state.lock().await.peers.keys().cloned().collect()
    }

    pub async fn pending_users(&self) -> Vec<UserId> {
        self.shared
            .state
            .lock()
            .await
            .pending
            .iter()
            .cloned()
            .collect()
    }

    /// The live remote stream for a peer, shared with its task.
    pub async fn remote_stream(
        &self,
        remote: &UserId,
    ) -> Option<Arc<std::sync::Mutex<RemoteStream>>> {
        self.shared
            .state
            .lock()
            .await
            .peers
            .get(remote)
            .map(|h| Arc::clone(&h.remote_stream))
    }

    async fn spawn_peer(
        &self,
        state: &mut ManagerState,
        remote: &UserId,
        kick_initiator: bool,
    ) {
        // Capacity: evict the oldest connection into the pending set until
        // there is room.
        while state.peers.len() >= self.shared.settings.max_peer_connections {
            let Some(oldest) = state
                .peers
                .iter()
                .min_by_key(|(_, h)| h.created_at)
                .map(|(user, _)| user.clone())
            else {
                break;
            };
            tracing::info!(%oldest, "Peer table full, evicting oldest into pending");
            Self::remove_locked(state, &oldest);
            state.pending.insert(oldest);
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::channel(64);
        let engine = match self
            .shared
            .factory
            .create(remote, &state.local_stream, engine_tx)
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!(%remote, "Failed to create peer engine: {e:#}");
                state.pending.insert(remote.clone());
                return;
            }
        };
        let remote_stream = Arc::new(std::sync::Mutex::new(RemoteStream::default()));
        let negotiator = Negotiator::new(
            self.shared.local_user.clone(),
            remote.clone(),
            generation,
            engine,
            self.shared.settings.negotiation_debounce(),
            self.shared.outbound.clone(),
            self.shared.updates.clone(),
            Arc::clone(&remote_stream),
        );
        tokio::spawn(negotiator.run(command_rx, engine_rx));

        if kick_initiator && !negotiation::is_polite(&self.shared.local_user, remote) {
            let _ = command_tx.send(PeerCommand::Initiate);
        }
        tracing::info!(%remote, generation, "Peer connection created");
        state.peers.insert(
            remote.clone(),
            PeerHandle {
                generation,
                created_at: Instant::now(),
                commands: command_tx,
                remote_stream,
                last_transport: TransportState::New,
            },
        );
    }

    fn remove_locked(state: &mut ManagerState, user: &UserId) {
        if let Some(handle) = state.peers.remove(user) {
            // The task closes the engine and discards its candidate queue.
            let _ = handle.commands.send(PeerCommand::Close);
        }
    }

    async fn consume_updates(self, mut updates: mpsc::UnboundedReceiver<PeerUpdate>) {
        while let Some(update) = updates.recv().await {
            match update {
                PeerUpdate::Transport {
                    user,
                    generation,
                    state,
                } => self.on_transport(user, generation, state).await,
                PeerUpdate::TrackRouted { user, slot } => {
                    tracing::debug!(%user, ?slot, "Remote track routed");
                }
            }
        }
    }

    async fn on_transport(&self, user: UserId, generation: u64, transport: TransportState) {
        {
            let mut state = self.shared.state.lock().await;
            let Some(handle) = state.peers.get_mut(&user) else {
                return;
            };
            if handle.generation != generation {
                return;
            }
            handle.last_transport = transport;
        }
        match transport {
            TransportState::Disconnected => {
                // Give ICE a grace period to recover before tearing down.
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(manager.shared.settings.disconnect_grace()).await;
                    let still_down = {
                        let state = manager.shared.state.lock().await;
                        matches!(
                            state.peers.get(&user),
                            Some(h) if h.generation == generation
                                && matches!(
                                    h.last_transport,
                                    TransportState::Disconnected | TransportState::Failed
                                )
                        )
                    };
                    if still_down {
                        manager.recycle(user, generation).await;
                    }
                });
            }
            TransportState::Failed => {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.recycle(user, generation).await;
                });
            }
            _ => {}
        }
    }

    /// Remove a peer, park it in the pending set, and re-initiate after the
    /// reconnect delay. Aborts if the peer was replaced in the meantime.
    async fn recycle(&self, user: UserId, generation: u64) {
        {
            let mut state = self.shared.state.lock().await;
            match state.peers.get(&user) {
                Some(handle) if handle.generation == generation => {}
                _ => return,
            }
            Self::remove_locked(&mut state, &user);
            state.pending.insert(user.clone());
        }
        tracing::info!(%user, "Peer connection recycled, reconnecting after delay");
        tokio::time::sleep(self.shared.settings.reconnect_delay()).await;
        self.initiate(&user).await;
    }

    /// Periodic sweep: drop connections past the stale threshold whose
    /// transport never recovered.
    async fn run_sweep(self) {
        let mut interval = tokio::time::interval(self.shared.settings.cleanup_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            let mut state = self.shared.state.lock().await;
            let stale: Vec<UserId> = state
                .peers
                .iter()
                .filter(|(_, h)| {
                    h.created_at.elapsed() > self.shared.settings.stale_threshold()
                        && matches!(
                            h.last_transport,
                            TransportState::Disconnected | TransportState::Failed
                        )
                })
                .map(|(user, _)| user.clone())
                .collect();
            for user in stale {
                tracing::info!(%user, "Sweeping stale peer connection");
                Self::remove_locked(&mut state, &user);
            }
        }
    }

    #[cfg(test)]
    async fn force_transport(&self, user: &UserId, transport: TransportState) {
        let mut state = self.shared.state.lock().await;
        if let Some(handle) = state.peers.get_mut(user) {
            handle.last_transport = transport;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFactory;
    use std::time::Duration;

    fn settings() -> PeerConfig {
        PeerConfig::default()
    }

    struct Rig {
        manager: PeerManager<FakeFactory>,
        factory_endpoints: Arc<std::sync::Mutex<Vec<crate::testing::FakeEndpoint>>>,
        #[allow(dead_code)]
        outbound: mpsc::UnboundedReceiver<ClientEvent>,
    }

    fn rig_with(local: &str, settings: PeerConfig) -> Rig {
        let factory = FakeFactory::default();
        let endpoints = Arc::clone(&factory.endpoints);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let manager = PeerManager::new(
            factory,
            settings,
            UserId::from(local),
            LocalStream::camera("local"),
            outbound_tx,
        );
        Rig {
            manager,
            factory_endpoints: endpoints,
            outbound: outbound_rx,
        }
    }

    fn rig(local: &str) -> Rig {
        rig_with(local, settings())
    }

    impl Rig {
        fn created(&self) -> usize {
            self.factory_endpoints
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len()
        }

        fn endpoint(
            &self,
            index: usize,
        ) -> (
            Arc<crate::testing::FakeShared>,
            mpsc::Sender<crate::engine::EngineEvent>,
        ) {
            let endpoints = self
                .factory_endpoints
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            (
                Arc::clone(&endpoints[index].shared),
                endpoints[index].events.clone(),
            )
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn settle_for(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn impolite_side_drives_the_first_offer() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("a")).await;
        settle().await;

        let (shared, _) = rig.endpoint(0);
        assert_eq!(shared.lock().offers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polite_side_waits_for_negotiation_needed() {
        let rig = rig("a");
        rig.manager.initiate(&UserId::from("b")).await;
        settle().await;

        let (shared, events) = rig.endpoint(0);
        assert!(shared.lock().offers.is_empty());

        // Track attachment fires negotiation-needed; the offer follows.
        events
            .send(crate::engine::EngineEvent::NegotiationNeeded)
            .await
            .unwrap();
        settle_for(Duration::from_secs(1)).await;
        assert_eq!(shared.lock().offers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initiate_is_idempotent_and_skips_self() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("b")).await;
        assert_eq!(rig.created(), 0);

        rig.manager.initiate(&UserId::from("a")).await;
        rig.manager.initiate(&UserId::from("a")).await;
        assert_eq!(rig.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_into_pending() {
        let mut config = settings();
        config.max_peer_connections = 2;
        let rig = rig_with("m", config);

        rig.manager.initiate(&UserId::from("a")).await;
        settle_for(Duration::from_millis(10)).await;
        rig.manager.initiate(&UserId::from("b")).await;
        settle_for(Duration::from_millis(10)).await;
        rig.manager.initiate(&UserId::from("c")).await;
        settle().await;

        let mut peers = rig.manager.peer_users().await;
        peers.sort();
        assert_eq!(peers, vec![UserId::from("b"), UserId::from("c")]);
        assert_eq!(rig.manager.pending_users().await, vec![UserId::from("a")]);

        // The evicted peer's engine was closed.
        let (shared, _) = rig.endpoint(0);
        assert!(shared.lock().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_signal_creates_peer_and_answers() {
        let rig = rig("a"); // polite: would never offer first
        rig.manager
            .ingest_signal(
                &UserId::from("b"),
                SignalData::Offer {
                    sdp: "remote-offer".to_string(),
                },
            )
            .await;
        settle().await;

        assert!(rig.manager.has_peer(&UserId::from("b")).await);
        let (shared, _) = rig.endpoint(0);
        let inner = shared.lock();
        assert_eq!(inner.answers_created, 1);
        assert!(inner.offers.is_empty(), "ingest must not kick an offer");
    }

    #[tokio::test(start_paused = true)]
    async fn remove_closes_engine_and_clears_pending() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("a")).await;
        settle().await;
        rig.manager.remove(&UserId::from("a")).await;
        settle().await;

        assert!(!rig.manager.has_peer(&UserId::from("a")).await);
        let (shared, _) = rig.endpoint(0);
        assert!(shared.lock().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_is_idempotent() {
        let rig = rig("m");
        rig.manager.initiate(&UserId::from("a")).await;
        rig.manager.initiate(&UserId::from("b")).await;
        settle().await;

        rig.manager.close_all().await;
        rig.manager.close_all().await;
        settle().await;

        assert!(rig.manager.peer_users().await.is_empty());
        assert!(rig.manager.pending_users().await.is_empty());
        for index in 0..rig.created() {
            let (shared, _) = rig.endpoint(index);
            assert!(shared.lock().closed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn swap_local_stream_rebuilds_peers_after_delay() {
        let rig = rig("m");
        rig.manager.initiate(&UserId::from("a")).await;
        rig.manager.initiate(&UserId::from("b")).await;
        settle().await;
        assert_eq!(rig.created(), 2);

        rig.manager
            .swap_local_stream(LocalStream::screen_share("local"))
            .await;
        settle_for(Duration::from_secs(2)).await;

        // Old engines closed, two fresh ones built with the new stream.
        assert_eq!(rig.created(), 4);
        for index in 0..2 {
            let (shared, _) = rig.endpoint(index);
            assert!(shared.lock().closed);
        }
        let endpoints = rig
            .factory_endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        assert_eq!(endpoints[2].local_stream, LocalStream::screen_share("local"));
        assert_eq!(endpoints[3].local_stream, LocalStream::screen_share("local"));
        let mut rebuilt: Vec<&UserId> = endpoints[2..].iter().map(|e| &e.remote).collect();
        rebuilt.sort();
        assert_eq!(rebuilt, vec![&UserId::from("a"), &UserId::from("b")]);
        drop(endpoints);

        let mut peers = rig.manager.peer_users().await;
        peers.sort();
        assert_eq!(peers, vec![UserId::from("a"), UserId::from("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn swap_retries_pending_peers() {
        let mut config = settings();
        config.max_peer_connections = 1;
        let rig = rig_with("m", config);

        rig.manager.initiate(&UserId::from("a")).await;
        settle_for(Duration::from_millis(10)).await;
        rig.manager.initiate(&UserId::from("b")).await; // evicts "a"
        settle().await;
        assert_eq!(rig.manager.pending_users().await, vec![UserId::from("a")]);

        rig.manager
            .swap_local_stream(LocalStream::screen_share("local"))
            .await;
        settle_for(Duration::from_secs(2)).await;

        // Both the live and the pending peer were re-initiated; capacity
        // then applies as usual.
        assert!(rig.manager.pending_users().await.len() <= 1);
        assert_eq!(rig.manager.peer_users().await.len(), 1);
        assert!(rig.created() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_peer_recycles_after_grace_and_delay() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("a")).await;
        settle().await;

        let (_, events) = rig.endpoint(0);
        events
            .send(crate::engine::EngineEvent::ConnectionState(
                TransportState::Disconnected,
            ))
            .await
            .unwrap();
        // 5 s grace + 2 s reconnect delay, with slack.
        settle_for(Duration::from_secs(10)).await;

        assert_eq!(rig.created(), 2, "peer must be rebuilt");
        let (old, _) = rig.endpoint(0);
        assert!(old.lock().closed);
        assert!(rig.manager.has_peer(&UserId::from("a")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_peer_is_not_recycled() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("a")).await;
        settle().await;

        let (_, events) = rig.endpoint(0);
        events
            .send(crate::engine::EngineEvent::ConnectionState(
                TransportState::Disconnected,
            ))
            .await
            .unwrap();
        settle().await;
        events
            .send(crate::engine::EngineEvent::ConnectionState(
                TransportState::Connected,
            ))
            .await
            .unwrap();
        settle_for(Duration::from_secs(10)).await;

        assert_eq!(rig.created(), 1, "recovered peer must be left alone");
        let (shared, _) = rig.endpoint(0);
        assert!(!shared.lock().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_peer_recycles_immediately() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("a")).await;
        settle().await;

        let (_, events) = rig.endpoint(0);
        events
            .send(crate::engine::EngineEvent::ConnectionState(
                TransportState::Failed,
            ))
            .await
            .unwrap();
        settle_for(Duration::from_secs(3)).await;

        assert_eq!(rig.created(), 2);
        assert!(rig.manager.has_peer(&UserId::from("a")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_old_disconnected_peers() {
        let rig = rig("b");
        rig.manager.initiate(&UserId::from("a")).await;
        settle().await;

        // A peer whose transport degraded without the state-change event
        // reaching the reconnect policy: only the sweep catches it.
        rig.manager
            .force_transport(&UserId::from("a"), TransportState::Disconnected)
            .await;
        settle_for(Duration::from_secs(95)).await;

        assert!(!rig.manager.has_peer(&UserId::from("a")).await);
        let (shared, _) = rig.endpoint(0);
        assert!(shared.lock().closed);
    }
}
