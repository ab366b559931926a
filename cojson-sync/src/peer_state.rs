//! What we believe each peer knows.

use cojson_types::{CoId, KnownState, PeerId};
use std::collections::{HashMap, HashSet};

/// Which side of the connection a peer is on, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Serves values we do not have; we load from it and push to it.
    Server,
    /// Asks us for values.
    Client,
}

/// Lifecycle of one peer connection.
///
/// `Connecting -> Reconciling -> Steady -> Disconnected`; peers without
/// storage reconciliation go straight to `Steady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Reconciling,
    Steady,
    Disconnected,
}

#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    persistent: bool,
    connection: PeerConnectionState,
    /// What the peer told us it has.
    confirmed: HashMap<CoId, KnownState>,
    /// `confirmed` plus everything we sent since.
    optimistic: HashMap<CoId, KnownState>,
    told_known_state: HashSet<CoId>,
    load_request_sent: HashSet<CoId>,
    subscribed: HashSet<CoId>,
}

impl PeerState {
    pub fn new(id: PeerId, role: PeerRole, persistent: bool) -> Self {
        Self {
            id,
            role,
            persistent,
            connection: PeerConnectionState::Connecting,
            confirmed: HashMap::new(),
            optimistic: HashMap::new(),
            told_known_state: HashSet::new(),
            load_request_sent: HashSet::new(),
            subscribed: HashSet::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == PeerRole::Server
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn connection(&self) -> PeerConnectionState {
        self.connection
    }

    pub fn set_connection(&mut self, connection: PeerConnectionState) {
        self.connection = connection;
    }

    pub fn is_connected(&self) -> bool {
        self.connection != PeerConnectionState::Disconnected
    }

    /// Our best guess of the peer's state, counting content in flight.
    pub fn known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    pub fn confirmed_known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.confirmed.get(id)
    }

    /// Replaces both views, as after a correction.
    pub fn set_known_state(&mut self, state: KnownState) {
        self.optimistic.insert(state.id.clone(), state.clone());
        self.confirmed.insert(state.id.clone(), state);
    }

    /// Merges a state the peer reported.
    pub fn combine_known_state(&mut self, state: &KnownState) {
        combine(&mut self.confirmed, state);
        combine(&mut self.optimistic, state);
    }

    /// Records content we just sent.
    pub fn update_optimistic(&mut self, state: &KnownState) {
        combine(&mut self.optimistic, state);
    }

    pub fn mark_told_known_state(&mut self, id: &CoId) -> bool {
        self.told_known_state.insert(id.clone())
    }

    pub fn has_told_known_state(&self, id: &CoId) -> bool {
        self.told_known_state.contains(id)
    }

    pub fn mark_load_request_sent(&mut self, id: &CoId) -> bool {
        self.load_request_sent.insert(id.clone())
    }

    pub fn load_request_sent(&self, id: &CoId) -> bool {
        self.load_request_sent.contains(id)
    }

    pub fn subscribe(&mut self, id: &CoId) {
        self.subscribed.insert(id.clone());
    }

    pub fn is_subscribed(&self, id: &CoId) -> bool {
        self.subscribed.contains(id)
    }

    /// Whether the peer confirmed having at least `ours`.
    pub fn is_synced(&self, ours: &KnownState) -> bool {
        self.confirmed
            .get(&ours.id)
            .is_some_and(|theirs| ours.is_subset_of(theirs))
    }
}

fn combine(map: &mut HashMap<CoId, KnownState>, state: &KnownState) {
    map.entry(state.id.clone())
        .or_insert_with(|| KnownState::empty(state.id.clone()))
        .combine_with(state);
}
