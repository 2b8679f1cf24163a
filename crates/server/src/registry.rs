use std::collections::HashMap;
use std::sync::Mutex;

use huddle_protocol::{ChatMessage, Member, RoomId, ServerEvent, SocketId, UserId};
use serde_json::Value;
use tokio::sync::mpsc;

/// Per-socket delivery channel. Unbounded so registry operations never block
/// on a slow client; the socket task drains it in FIFO order, which is what
/// gives per-recipient ordering.
pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

/// A computed delivery: send `event` to the socket behind the sender.
/// Operations build these under the registry lock; the actual sends happen
/// after the lock is released (see [`dispatch`]).
pub type Outbound = (OutboundSender, ServerEvent);

/// Authoritative room-membership state plus the signal-routing index and the
/// socket delivery table, all behind one mutex. Every mutation is serialized,
/// so a disconnect sweep can never be observed half-done.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<RoomId, Room>,
    /// Routing index for `signal` envelopes. Holds the socket of the user's
    /// most recent join; never a user who is in no room (with the one
    /// documented exception around stale leaves, see [`Registry::leave`]).
    user_index: HashMap<UserId, SocketId>,
    sockets: HashMap<SocketId, OutboundSender>,
}

/// Insertion-ordered member list, unique by user id. A rejoin replaces the
/// member in place, keeping its position.
#[derive(Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn position(&self, user_id: &UserId) -> Option<usize> {
        self.members.iter().position(|m| &m.user_id == user_id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a socket's delivery channel. Called once per connection,
    /// before any event from that socket is processed.
    pub fn attach(&self, socket_id: SocketId, sender: OutboundSender) {
        let mut inner = self.lock();
        inner.sockets.insert(socket_id, sender);
    }

    /// Add (or re-add) a user to a room.
    ///
    /// A join for a `(room, user)` pair that is already present is a rejoin:
    /// the member is replaced in place and the prior socket is forgotten but
    /// not closed; its transport will be reaped by the heartbeat. Delivery
    /// order: member list to the joiner, joined/rejoined to the others, then
    /// the member count to the whole room.
    pub fn join(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        nickname: &str,
        socket_id: &SocketId,
    ) -> Vec<Outbound> {
        let mut inner = self.lock();
        let member = Member {
            user_id: user_id.clone(),
            socket_id: socket_id.clone(),
            nickname: nickname.to_string(),
        };

        let room = inner.rooms.entry(room_id.clone()).or_default();
        let rejoin = match room.position(user_id) {
            Some(pos) => {
                room.members[pos] = member.clone();
                true
            }
            None => {
                room.members.push(member.clone());
                false
            }
        };
        let members = room.members.clone();

        inner
            .user_index
            .insert(user_id.clone(), socket_id.clone());

        if rejoin {
            tracing::info!(%room_id, %user_id, %socket_id, "User rejoined room");
        } else {
            tracing::info!(%room_id, %user_id, %socket_id, "User joined room");
        }

        let mut outbox = Vec::new();
        if let Some(tx) = inner.sockets.get(socket_id) {
            outbox.push((
                tx.clone(),
                ServerEvent::ExistingParticipants(members.clone()),
            ));
        }
        let announce = if rejoin {
            ServerEvent::UserRejoined(member)
        } else {
            ServerEvent::UserJoined(member)
        };
        for m in members.iter().filter(|m| &m.socket_id != socket_id) {
            if let Some(tx) = inner.sockets.get(&m.socket_id) {
                outbox.push((tx.clone(), announce.clone()));
            }
        }
        for m in &members {
            if let Some(tx) = inner.sockets.get(&m.socket_id) {
                outbox.push((tx.clone(), ServerEvent::ParticipantCount(members.len())));
            }
        }
        outbox
    }

    /// Remove a user from a room. Unknown `(room, user)` pairs are a silent
    /// no-op. The routing index entry is removed only when it still points at
    /// the leaving socket: a leave arriving on a stale socket after a rejoin
    /// leaves the rejoined index entry alone. A stale entry can linger in
    /// that case; existing clients depend on the filter being socket-based,
    /// so it stays.
    pub fn leave(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        socket_id: &SocketId,
    ) -> Vec<Outbound> {
        let mut inner = self.lock();
        let Some(room) = inner.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        let Some(pos) = room.position(user_id) else {
            return Vec::new();
        };
        room.members.remove(pos);
        let remaining = room.members.clone();
        if remaining.is_empty() {
            inner.rooms.remove(room_id);
            tracing::info!(%room_id, "Room destroyed (empty)");
        }
        if inner.user_index.get(user_id) == Some(socket_id) {
            inner.user_index.remove(user_id);
        }
        tracing::info!(%room_id, %user_id, "User left room");

        let mut outbox = Vec::new();
        for m in &remaining {
            if let Some(tx) = inner.sockets.get(&m.socket_id) {
                outbox.push((
                    tx.clone(),
                    ServerEvent::UserLeft {
                        user_id: user_id.clone(),
                    },
                ));
            }
        }
        if !remaining.is_empty() {
            for m in &remaining {
                if let Some(tx) = inner.sockets.get(&m.socket_id) {
                    outbox.push((tx.clone(), ServerEvent::ParticipantCount(remaining.len())));
                }
            }
        }
        outbox
    }

    /// Reply to the caller alone with the room's member list, or an empty
    /// list for a room that does not exist.
    pub fn request_members(&self, room_id: &RoomId, socket_id: &SocketId) -> Vec<Outbound> {
        let inner = self.lock();
        let members = inner
            .rooms
            .get(room_id)
            .map(|r| r.members.clone())
            .unwrap_or_default();
        let Some(tx) = inner.sockets.get(socket_id) else {
            return Vec::new();
        };
        vec![(tx.clone(), ServerEvent::ExistingParticipants(members))]
    }

    /// Forward a signaling payload to the target user's socket, exactly once.
    /// The payload is never inspected. Unknown targets are logged and dropped;
    /// the sending peer recovers through ICE timeouts.
    pub fn route_signal(&self, to: &UserId, from: &UserId, signal: Value) -> Vec<Outbound> {
        let inner = self.lock();
        let Some(target_socket) = inner.user_index.get(to) else {
            tracing::warn!(%to, %from, "Dropping signal for unknown target");
            return Vec::new();
        };
        // Membership of the sender is checked for the log line only; the
        // signal is forwarded regardless.
        let sender_in_room = inner
            .rooms
            .values()
            .any(|r| r.position(from).is_some());
        if !sender_in_room {
            tracing::debug!(%from, "Routing signal from a user present in no room");
        }
        let Some(tx) = inner.sockets.get(target_socket) else {
            tracing::warn!(%to, %target_socket, "Signal target socket has no delivery channel");
            return Vec::new();
        };
        vec![(
            tx.clone(),
            ServerEvent::Signal {
                from: from.clone(),
                signal,
            },
        )]
    }

    /// Fan a chat message out to every socket in the room except the one it
    /// arrived on.
    pub fn relay_chat(&self, message: ChatMessage, sender_socket: &SocketId) -> Vec<Outbound> {
        let inner = self.lock();
        let Some(room) = inner.rooms.get(&message.room_id) else {
            tracing::debug!(room_id = %message.room_id, "Dropping chat for unknown room");
            return Vec::new();
        };
        let event = ServerEvent::ReceiveMessage(message.into_broadcast());
        let mut outbox = Vec::new();
        for m in room.members.iter().filter(|m| &m.socket_id != sender_socket) {
            if let Some(tx) = inner.sockets.get(&m.socket_id) {
                outbox.push((tx.clone(), event.clone()));
            }
        }
        outbox
    }

    /// Sweep every room for members pinned to a closed socket. Equivalent to
    /// a `leave` for each such membership, executed atomically, plus removal
    /// of the socket's delivery channel and any index entries mapping to it.
    pub fn disconnect(&self, socket_id: &SocketId) -> Vec<Outbound> {
        let mut inner = self.lock();
        let mut outbox = Vec::new();

        let room_ids: Vec<RoomId> = inner.rooms.keys().cloned().collect();
        for room_id in room_ids {
            let Some(room) = inner.rooms.get_mut(&room_id) else {
                continue;
            };
            let leavers: Vec<UserId> = room
                .members
                .iter()
                .filter(|m| &m.socket_id == socket_id)
                .map(|m| m.user_id.clone())
                .collect();
            if leavers.is_empty() {
                continue;
            }
            room.members.retain(|m| &m.socket_id != socket_id);
            let remaining = room.members.clone();
            let destroyed = remaining.is_empty();
            if destroyed {
                inner.rooms.remove(&room_id);
                tracing::info!(%room_id, "Room destroyed (empty)");
            }
            for user_id in leavers {
                tracing::info!(%room_id, %user_id, %socket_id, "User left room (disconnect)");
                for m in &remaining {
                    if let Some(tx) = inner.sockets.get(&m.socket_id) {
                        outbox.push((
                            tx.clone(),
                            ServerEvent::UserLeft {
                                user_id: user_id.clone(),
                            },
                        ));
                    }
                }
            }
            if !destroyed {
                for m in &remaining {
                    if let Some(tx) = inner.sockets.get(&m.socket_id) {
                        outbox.push((tx.clone(), ServerEvent::ParticipantCount(remaining.len())));
                    }
                }
            }
        }

        inner.user_index.retain(|_, s| s != socket_id);
        inner.sockets.remove(socket_id);
        outbox
    }

    /// Member lists of every live room, for the HTTP surface.
    pub fn rooms_snapshot(&self) -> Vec<(RoomId, Vec<Member>)> {
        let inner = self.lock();
        inner
            .rooms
            .iter()
            .map(|(id, room)| (id.clone(), room.members.clone()))
            .collect()
    }

    pub fn room_snapshot(&self, room_id: &RoomId) -> Option<Vec<Member>> {
        let inner = self.lock();
        inner.rooms.get(room_id).map(|r| r.members.clone())
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    #[cfg(test)]
    fn indexed_socket(&self, user_id: &UserId) -> Option<SocketId> {
        self.lock().user_index.get(user_id).cloned()
    }

    /// Structural invariants checked after every step of the sequence tests:
    /// no empty rooms, per-room user uniqueness, and index consistency with
    /// room membership.
    #[cfg(test)]
    fn assert_invariants(&self) {
        use std::collections::HashSet;
        let inner = self.lock();
        let mut users_in_rooms: HashSet<UserId> = HashSet::new();
        for (room_id, room) in &inner.rooms {
            assert!(!room.members.is_empty(), "empty room {room_id} exists");
            let mut seen = HashSet::new();
            for m in &room.members {
                assert!(
                    seen.insert(m.user_id.clone()),
                    "duplicate user {} in room {room_id}",
                    m.user_id
                );
                users_in_rooms.insert(m.user_id.clone());
            }
        }
        for (user_id, socket_id) in &inner.user_index {
            assert!(
                users_in_rooms.contains(user_id),
                "index holds {user_id} who is in no room"
            );
            let consistent = inner.rooms.values().any(|r| {
                r.members
                    .iter()
                    .any(|m| &m.user_id == user_id && &m.socket_id == socket_id)
            });
            assert!(
                consistent,
                "index socket for {user_id} matches no room membership"
            );
        }
    }
}

/// Deliver a computed outbox. Sends are fire-and-forget: a closed channel
/// means the socket task is already gone and its disconnect sweep will run.
pub fn dispatch(outbox: Vec<Outbound>) {
    for (tx, event) in outbox {
        if tx.send(event).is_err() {
            tracing::debug!("Dropping event for a closed socket channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::MessageId;

    struct TestClient {
        socket: SocketId,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl TestClient {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn connect(registry: &Registry) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = SocketId::generate();
        registry.attach(socket.clone(), tx);
        TestClient { socket, rx }
    }

    fn room(id: &str) -> RoomId {
        RoomId::from(id)
    }

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    #[test]
    fn single_user_join() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);

        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        registry.assert_invariants();

        let events = c1.drain();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ServerEvent::ExistingParticipants(members) => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].user_id, user("u1"));
                assert_eq!(members[0].socket_id, c1.socket);
                assert_eq!(members[0].nickname, "A");
            }
            other => panic!("expected ExistingParticipants, got {other:?}"),
        }
        assert_eq!(events[1], ServerEvent::ParticipantCount(1));
    }

    #[test]
    fn second_join_announces_to_first() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        let mut c2 = connect(&registry);

        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        c1.drain();
        dispatch(registry.join(&room("R"), &user("u2"), "B", &c2.socket));
        registry.assert_invariants();

        let u1_events = c1.drain();
        assert_eq!(
            u1_events,
            vec![
                ServerEvent::UserJoined(Member {
                    user_id: user("u2"),
                    socket_id: c2.socket.clone(),
                    nickname: "B".to_string(),
                }),
                ServerEvent::ParticipantCount(2),
            ]
        );

        let u2_events = c2.drain();
        match &u2_events[0] {
            ServerEvent::ExistingParticipants(members) => {
                let ids: Vec<&str> = members.iter().map(|m| m.user_id.as_str()).collect();
                assert_eq!(ids, vec!["u1", "u2"]);
            }
            other => panic!("expected ExistingParticipants, got {other:?}"),
        }
        assert_eq!(u2_events[1], ServerEvent::ParticipantCount(2));
    }

    #[test]
    fn signal_routed_to_target_byte_identical() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        let c2 = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        dispatch(registry.join(&room("R"), &user("u2"), "B", &c2.socket));
        c1.drain();

        let payload: Value =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\nm=audio"}"#).unwrap();
        dispatch(registry.route_signal(&user("u1"), &user("u2"), payload.clone()));

        let events = c1.drain();
        assert_eq!(
            events,
            vec![ServerEvent::Signal {
                from: user("u2"),
                signal: payload,
            }]
        );
    }

    #[test]
    fn signal_to_unknown_target_is_dropped() {
        let registry = Registry::new();
        let c1 = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        let outbox = registry.route_signal(&user("ghost"), &user("u1"), Value::Null);
        assert!(outbox.is_empty());
    }

    #[test]
    fn rejoin_replaces_member_in_place() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        let mut c2 = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        dispatch(registry.join(&room("R"), &user("u2"), "B", &c2.socket));
        c1.drain();
        c2.drain();

        // u1 reconnects on a new socket and re-emits join-room.
        let mut c1b = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1b.socket));
        registry.assert_invariants();

        let u2_events = c2.drain();
        let rejoined: Vec<_> = u2_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::UserRejoined(_)))
            .collect();
        assert_eq!(rejoined.len(), 1, "exactly one userRejoined expected");
        match rejoined[0] {
            ServerEvent::UserRejoined(member) => {
                assert_eq!(member.user_id, user("u1"));
                assert_eq!(member.socket_id, c1b.socket);
            }
            _ => unreachable!(),
        }
        assert!(u2_events.contains(&ServerEvent::ParticipantCount(2)));
        assert!(
            !u2_events
                .iter()
                .any(|e| matches!(e, ServerEvent::UserJoined(_))),
            "a rejoin must not be announced as a fresh join"
        );

        // Replacement keeps the member's position.
        let members = registry.room_snapshot(&room("R")).unwrap();
        assert_eq!(members[0].user_id, user("u1"));
        assert_eq!(members[0].socket_id, c1b.socket);
        assert_eq!(members[1].user_id, user("u2"));
        assert_eq!(registry.indexed_socket(&user("u1")), Some(c1b.socket.clone()));

        // The rejoin event still reaches the joiner's own list.
        let u1b_events = c1b.drain();
        assert!(matches!(
            &u1b_events[0],
            ServerEvent::ExistingParticipants(m) if m.len() == 2
        ));
    }

    #[test]
    fn disconnect_cleans_up_rooms_and_index() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        let c2 = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        dispatch(registry.join(&room("R"), &user("u2"), "B", &c2.socket));
        c1.drain();

        dispatch(registry.disconnect(&c2.socket));
        registry.assert_invariants();

        let events = c1.drain();
        assert_eq!(
            events,
            vec![
                ServerEvent::UserLeft {
                    user_id: user("u2")
                },
                ServerEvent::ParticipantCount(1),
            ]
        );
        assert_eq!(registry.indexed_socket(&user("u2")), None);
    }

    #[test]
    fn disconnect_of_last_member_destroys_room() {
        let registry = Registry::new();
        let c1 = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        dispatch(registry.disconnect(&c1.socket));
        registry.assert_invariants();
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.indexed_socket(&user("u1")), None);
    }

    #[test]
    fn leave_for_unknown_pair_is_noop() {
        let registry = Registry::new();
        let c1 = connect(&registry);
        assert!(registry.leave(&room("R"), &user("u1"), &c1.socket).is_empty());
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        assert!(
            registry
                .leave(&room("R"), &user("ghost"), &c1.socket)
                .is_empty()
        );
        registry.assert_invariants();
    }

    #[test]
    fn leave_on_stale_socket_spares_rejoined_index_entry() {
        // u1 joins on s1, rejoins on s2; a late leave-room arriving on s1
        // removes the membership but must not de-index the s2 entry.
        let registry = Registry::new();
        let c1 = connect(&registry);
        let c2 = connect(&registry);
        let other = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        dispatch(registry.join(&room("R"), &user("u2"), "B", &other.socket));
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c2.socket));
        assert_eq!(registry.indexed_socket(&user("u1")), Some(c2.socket.clone()));

        dispatch(registry.leave(&room("R"), &user("u1"), &c1.socket));
        // Membership is gone, the index entry keyed by the new socket stays.
        // Documented protocol quirk, not fixed here.
        assert!(
            registry
                .room_snapshot(&room("R"))
                .unwrap()
                .iter()
                .all(|m| m.user_id != user("u1"))
        );
        assert_eq!(registry.indexed_socket(&user("u1")), Some(c2.socket.clone()));
    }

    #[test]
    fn socket_may_sit_in_multiple_rooms() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        dispatch(registry.join(&room("R1"), &user("u1"), "A", &c1.socket));
        dispatch(registry.join(&room("R2"), &user("u1"), "A", &c1.socket));
        registry.assert_invariants();
        assert_eq!(registry.room_count(), 2);

        c1.drain();
        dispatch(registry.disconnect(&c1.socket));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn chat_relayed_to_room_minus_sender() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        let mut c2 = connect(&registry);
        let mut c3 = connect(&registry);
        dispatch(registry.join(&room("R"), &user("u1"), "A", &c1.socket));
        dispatch(registry.join(&room("R"), &user("u2"), "B", &c2.socket));
        dispatch(registry.join(&room("R"), &user("u3"), "C", &c3.socket));
        c1.drain();
        c2.drain();
        c3.drain();

        let message = ChatMessage {
            room_id: room("R"),
            id: MessageId::from("m1"),
            sender_id: user("u2"),
            sender_nickname: "B".to_string(),
            content: "hello".to_string(),
            timestamp: 42,
        };
        dispatch(registry.relay_chat(message.clone(), &c2.socket));

        let expected = ServerEvent::ReceiveMessage(message.into_broadcast());
        assert_eq!(c1.drain(), vec![expected.clone()]);
        assert_eq!(c3.drain(), vec![expected]);
        assert!(c2.drain().is_empty(), "sender must not receive its own chat");
    }

    #[test]
    fn request_members_for_unknown_room_is_empty_list() {
        let registry = Registry::new();
        let mut c1 = connect(&registry);
        dispatch(registry.request_members(&room("nope"), &c1.socket));
        assert_eq!(
            c1.drain(),
            vec![ServerEvent::ExistingParticipants(Vec::new())]
        );
    }

    #[test]
    fn disconnect_is_equivalent_to_leaving_each_membership() {
        let build = || {
            let registry = Registry::new();
            let c1 = connect(&registry);
            let c2 = connect(&registry);
            dispatch(registry.join(&room("R1"), &user("u1"), "A", &c1.socket));
            dispatch(registry.join(&room("R2"), &user("u1"), "A", &c1.socket));
            dispatch(registry.join(&room("R1"), &user("u2"), "B", &c2.socket));
            (registry, c1, c2)
        };

        let (by_disconnect, c1, _keep1) = build();
        dispatch(by_disconnect.disconnect(&c1.socket));

        let (by_leaves, c1b, _keep2) = build();
        dispatch(by_leaves.leave(&room("R1"), &user("u1"), &c1b.socket));
        dispatch(by_leaves.leave(&room("R2"), &user("u1"), &c1b.socket));

        let mut a = by_disconnect.rooms_snapshot();
        let mut b = by_leaves.rooms_snapshot();
        a.sort_by(|x, y| x.0.cmp(&y.0));
        b.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(a, b);
        assert_eq!(
            by_disconnect.indexed_socket(&user("u1")),
            by_leaves.indexed_socket(&user("u1"))
        );
    }

    /// Deterministic pseudo-random op sequences; invariants must hold after
    /// every step.
    #[test]
    fn invariants_hold_under_random_sequences() {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let registry = Registry::new();
        let rooms = ["R1", "R2", "R3"];
        let users = ["u1", "u2", "u3", "u4", "u5"];
        let mut clients: Vec<TestClient> = (0..4).map(|_| connect(&registry)).collect();
        // Current socket per user, so leaves use the socket that owns the
        // membership (the stale-socket case is covered separately above).
        let mut current: HashMap<UserId, SocketId> = HashMap::new();

        for _ in 0..500 {
            let r = room(rooms[(next() % 3) as usize]);
            let u = user(users[(next() % 5) as usize]);
            let c = (next() % 4) as usize;
            match next() % 4 {
                0 | 1 => {
                    let socket = clients[c].socket.clone();
                    dispatch(registry.join(&r, &u, "nick", &socket));
                    current.insert(u, socket);
                }
                2 => {
                    if let Some(socket) = current.get(&u) {
                        dispatch(registry.leave(&r, &u, socket));
                    }
                }
                _ => {
                    let socket = clients[c].socket.clone();
                    dispatch(registry.disconnect(&socket));
                    current.retain(|_, s| s != &socket);
                    // Reconnect so later joins have a live channel.
                    clients[c] = connect(&registry);
                }
            }
            registry.assert_invariants();
            for client in clients.iter_mut() {
                client.drain();
            }
        }
    }
}
