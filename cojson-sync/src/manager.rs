//! The sync manager: routes messages between a node, its storage and its peers.
//!
//! Every peer gets two tasks. The reader applies incoming messages in
//! order; the writer drains the peer's [`PriorityQueue`] into its transport.
//! All shared state sits behind std mutexes that are never held across an
//! `.await`, so handlers can call into the node and storage freely.

use crate::ack::{AckTracker, ReadyAck};
use crate::error::{SyncError, SyncResult};
use crate::loader::SyncLoader;
use crate::peer_state::{PeerConnectionState, PeerRole, PeerState};
use crate::protocol::SyncConfig;
use crate::queue::PriorityQueue;
use crate::transport::{Peer, PeerEvent};
use cojson_core::{CoreError, LocalNode};
use cojson_crypto::{Signature, short_hash};
use cojson_storage::{EraserScheduler, StorageApi, StoreOutcome, SyncStateUpdate};
use cojson_types::{
    CoId, ContentMessage, KnownMessage, KnownState, PeerId, ReconcileAckMessage,
    ReconcileMessage, SessionId, SessionNewContent, SyncMessage, Transaction,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Storage loads that trigger further loads (an account behind a session
/// author, say) stop after this many levels.
const MAX_DEPENDENCY_DEPTH: usize = 8;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hash of a known state as exchanged in `reconcile` messages.
pub fn reconcile_hash(state: &KnownState) -> Option<String> {
    short_hash(&state.sessions).ok()
}

// ── Outgoing queue ───────────────────────────────────────────────

#[derive(Default)]
struct OutgoingQueue {
    items: Mutex<PriorityQueue<SyncMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutgoingQueue {
    fn push(&self, msg: SyncMessage) {
        lock(&self.items).push(msg.priority(), msg);
        self.notify.notify_one();
    }

    fn shift(&self) -> Option<SyncMessage> {
        lock(&self.items).shift()
    }

    fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct PeerEntry {
    state: PeerState,
    queue: Arc<OutgoingQueue>,
    /// Distinguishes reconnections under the same id.
    connection: u64,
}

struct Waiter {
    peer: PeerId,
    tx: oneshot::Sender<bool>,
}

enum Slice {
    Gap,
    Nothing,
    New { after: u32, txs: Vec<Transaction> },
}

// ── Shared state ─────────────────────────────────────────────────

pub(crate) struct Inner {
    node: LocalNode,
    storage: Option<Arc<dyn StorageApi>>,
    config: SyncConfig,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    acks: Mutex<AckTracker>,
    waiters: Mutex<HashMap<CoId, Vec<Waiter>>>,
    /// `expectContentUntil` of values still arriving in pieces.
    expectations: Mutex<HashMap<CoId, BTreeMap<SessionId, u32>>>,
    eraser: Option<EraserScheduler>,
    next_connection: AtomicU64,
    next_batch: AtomicU64,
    shutdown: CancellationToken,
}

/// Keeps a [`LocalNode`] in sync with storage and any number of peers.
///
/// Must be created inside a tokio runtime. Installs itself as the node's
/// loader, so `node.load(id)` falls through to storage and server peers.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("peers", &lock(&self.inner.peers).len())
            .field("storage", &self.inner.storage.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    pub fn new(node: LocalNode, storage: Option<Arc<dyn StorageApi>>, config: SyncConfig) -> Self {
        let eraser = storage
            .as_ref()
            .map(|storage| EraserScheduler::for_storage(Arc::clone(storage), config.eraser.clone()));
        let inner = Arc::new(Inner {
            node: node.clone(),
            storage,
            config,
            peers: Mutex::new(HashMap::new()),
            acks: Mutex::new(AckTracker::new()),
            waiters: Mutex::new(HashMap::new()),
            expectations: Mutex::new(HashMap::new()),
            eraser,
            next_connection: AtomicU64::new(0),
            next_batch: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        node.set_loader(Arc::new(SyncLoader::new(Arc::downgrade(&inner))));
        if let Some(eraser) = &inner.eraser {
            eraser.start();
        }
        match node.take_local_changes() {
            Some(changes) => {
                tokio::spawn(Arc::clone(&inner).run_local_changes(changes));
            }
            None => warn!("local changes already taken, local edits will not be synced"),
        }
        Self { inner }
    }

    pub fn node(&self) -> &LocalNode {
        &self.inner.node
    }

    /// Starts syncing with `peer`. A peer with an id already in use
    /// replaces the old connection.
    pub fn add_peer(&self, peer: Peer) {
        self.inner.add_peer(peer);
    }

    /// Closes the connection to `peer`.
    pub fn disconnect(&self, peer: &PeerId) -> SyncResult<()> {
        let connection = self
            .inner
            .with_peer(peer, |entry| entry.connection)
            .ok_or_else(|| SyncError::PeerNotFound(peer.clone()))?;
        self.inner.handle_disconnect(peer, connection);
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        lock(&self.inner.peers).keys().cloned().collect()
    }

    pub fn peer_connection_state(&self, peer: &PeerId) -> Option<PeerConnectionState> {
        self.inner.with_peer(peer, |entry| entry.state.connection())
    }

    /// What `peer` has confirmed holding of `id`.
    pub fn peer_known_state(&self, peer: &PeerId, id: &CoId) -> Option<KnownState> {
        self.inner
            .with_peer(peer, |entry| entry.state.confirmed_known_state(id).cloned())
            .flatten()
    }

    /// Whether `peer` confirmed everything we hold of `id`.
    pub fn is_synced(&self, id: &CoId, peer: &PeerId) -> bool {
        let Some(ours) = self.inner.node.known_state(id) else {
            return false;
        };
        self.inner
            .with_peer(peer, |entry| entry.state.is_synced(&ours))
            .unwrap_or(false)
    }

    /// Polls [`is_synced`](Self::is_synced) until it holds or `timeout` passes.
    pub async fn wait_for_sync(&self, id: &CoId, peer: &PeerId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_synced(id, peer) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops background work and drops every peer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(eraser) = &self.inner.eraser {
            eraser.dispose();
        }
        let connections: Vec<(PeerId, u64)> = lock(&self.inner.peers)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.connection))
            .collect();
        for (peer, connection) in connections {
            self.inner.handle_disconnect(&peer, connection);
        }
    }
}

impl Inner {
    pub(crate) fn node(&self) -> &LocalNode {
        &self.node
    }

    fn with_peer<T>(&self, peer: &PeerId, f: impl FnOnce(&mut PeerEntry) -> T) -> Option<T> {
        lock(&self.peers).get_mut(peer).map(f)
    }

    fn enqueue(&self, peer: &PeerId, msg: SyncMessage) -> bool {
        self.with_peer(peer, |entry| {
            if entry.state.is_connected() {
                entry.queue.push(msg);
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Connected server peers, minus `exclude`.
    pub(crate) fn server_peers(&self, exclude: Option<&PeerId>) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.peers)
            .iter()
            .filter(|(id, entry)| {
                entry.state.is_server() && entry.state.is_connected() && Some(*id) != exclude
            })
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    fn our_known_state(&self, id: &CoId) -> KnownState {
        self.node
            .known_state(id)
            .unwrap_or_else(|| KnownState::empty(id.clone()))
    }

    // ── Peer lifecycle ───────────────────────────────────────────

    fn add_peer(self: &Arc<Self>, peer: Peer) {
        let Peer {
            id,
            role,
            incoming,
            outgoing,
            persistent,
        } = peer;
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(OutgoingQueue::default());
        let mut state = PeerState::new(id.clone(), role, persistent);
        state.set_connection(PeerConnectionState::Connecting);

        let previous = lock(&self.peers).insert(
            id.clone(),
            PeerEntry {
                state,
                queue: Arc::clone(&queue),
                connection,
            },
        );
        if let Some(previous) = previous {
            debug!(peer = %id, "replacing previous connection");
            previous.queue.close();
        }
        info!(peer = %id, role = ?role, persistent, "peer added");

        tokio::spawn(Arc::clone(self).write_loop(id.clone(), queue, outgoing));
        tokio::spawn(Arc::clone(self).read_loop(id.clone(), connection, incoming));

        if role != PeerRole::Server {
            self.set_connection(&id, PeerConnectionState::Steady);
            return;
        }
        for covalue in self.node.covalue_ids() {
            self.send_load(&id, &covalue);
        }
        match &self.storage {
            Some(_) if persistent => {
                self.set_connection(&id, PeerConnectionState::Reconciling);
                tokio::spawn(Arc::clone(self).reconcile_batch(id.clone(), 0));
                tokio::spawn(Arc::clone(self).resume_unsynced(id));
            }
            _ => self.set_connection(&id, PeerConnectionState::Steady),
        }
    }

    fn set_connection(&self, peer: &PeerId, connection: PeerConnectionState) {
        self.with_peer(peer, |entry| entry.state.set_connection(connection));
    }

    fn handle_disconnect(&self, peer: &PeerId, connection: u64) {
        {
            let mut peers = lock(&self.peers);
            let Some(entry) = peers.get_mut(peer) else {
                return;
            };
            if entry.connection != connection {
                return;
            }
            entry.queue.close();
            entry.state.set_connection(PeerConnectionState::Disconnected);
            if !entry.state.is_persistent() {
                peers.remove(peer);
            }
        }
        lock(&self.acks).drop_peer(peer);

        let failed: Vec<Waiter> = {
            let mut waiters = lock(&self.waiters);
            let mut failed = Vec::new();
            for list in waiters.values_mut() {
                let (theirs, others): (Vec<_>, Vec<_>) =
                    std::mem::take(list).into_iter().partition(|w| &w.peer == peer);
                *list = others;
                failed.extend(theirs);
            }
            waiters.retain(|_, list| !list.is_empty());
            failed
        };
        for waiter in failed {
            let _ = waiter.tx.send(false);
        }
        info!(peer = %peer, "peer disconnected");
    }

    async fn read_loop(self: Arc<Self>, peer: PeerId, connection: u64, mut incoming: mpsc::Receiver<PeerEvent>) {
        let budget = self.config.incoming_time_budget;
        let mut slice_start = Instant::now();
        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = incoming.recv() => event,
            };
            match event {
                Some(PeerEvent::Message(msg)) => {
                    self.handle_message(&peer, msg).await;
                    if slice_start.elapsed() > budget {
                        tokio::task::yield_now().await;
                        slice_start = Instant::now();
                    }
                }
                Some(PeerEvent::PingTimeout) => {
                    warn!(peer = %peer, "ping timeout");
                    break;
                }
                Some(PeerEvent::Disconnected) | None => break,
            }
        }
        self.handle_disconnect(&peer, connection);
    }

    async fn write_loop(self: Arc<Self>, peer: PeerId, queue: Arc<OutgoingQueue>, outgoing: mpsc::Sender<SyncMessage>) {
        while !queue.is_closed() {
            match queue.shift() {
                Some(msg) => {
                    trace!(peer = %peer, action = msg.action(), "outgoing");
                    if outgoing.send(msg).await.is_err() {
                        debug!(peer = %peer, "transport closed");
                        break;
                    }
                }
                None => {
                    let ready = lock(&self.acks).on_drained(&peer);
                    ready.into_iter().for_each(ReadyAck::fire);
                    queue.notify.notified().await;
                }
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    async fn handle_message(self: &Arc<Self>, peer: &PeerId, msg: SyncMessage) {
        trace!(peer = %peer, action = msg.action(), "incoming");
        match msg {
            SyncMessage::Load(state) => self.handle_load(peer, state).await,
            SyncMessage::Known(known) => self.handle_known(peer, known).await,
            SyncMessage::Content(content) => self.handle_content(peer, content, false).await,
            SyncMessage::Done(done) => debug!(peer = %peer, id = %done.id, "peer done"),
            SyncMessage::Reconcile(reconcile) => self.handle_reconcile(peer, reconcile).await,
            SyncMessage::ReconcileAck(ack) => self.handle_reconcile_ack(peer, &ack.id),
        }
    }

    async fn handle_load(self: &Arc<Self>, peer: &PeerId, theirs: KnownState) {
        let id = theirs.id.clone();
        self.with_peer(peer, |entry| {
            entry.state.set_known_state(theirs);
            entry.state.subscribe(&id);
        });
        if !self.node.has(&id) {
            self.load_from_storage(&id, 0).await;
        }
        if self.node.has(&id) {
            self.send_new_content(peer, &id, true);
            return;
        }

        // other servers may take a while; keep reading from this peer meanwhile
        let inner = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move {
            let sources = inner.server_peers(Some(&peer));
            if inner.load_from_sources(&id, sources).await {
                inner.send_new_content(&peer, &id, true);
            } else {
                debug!(id = %id, peer = %peer, "covalue not found");
                inner.enqueue(
                    &peer,
                    SyncMessage::Known(KnownMessage::from_state(KnownState::empty(id), false)),
                );
            }
        });
    }

    async fn handle_known(&self, peer: &PeerId, known: KnownMessage) {
        let theirs = known.to_state();
        let id = theirs.id.clone();
        let persistent_server = self.with_peer(peer, |entry| {
            if known.is_correction {
                entry.state.set_known_state(theirs);
            } else {
                entry.state.combine_known_state(&theirs);
            }
            entry.state.is_server() && entry.state.is_persistent()
        });
        let Some(persistent_server) = persistent_server else {
            return;
        };

        if !self.node.has(&id) {
            if !known.header {
                self.resolve_waiters(&id, false, Some(peer));
            }
            return;
        }
        self.send_new_content(peer, &id, false);

        let synced = persistent_server && self.storage.is_some() && {
            let ours = self.our_known_state(&id);
            self.with_peer(peer, |entry| entry.state.is_synced(&ours))
                .unwrap_or(false)
        };
        if let (true, Some(storage)) = (synced, &self.storage) {
            let update = SyncStateUpdate {
                id: id.clone(),
                peer: peer.clone(),
                synced: true,
            };
            if let Err(e) = storage.track_sync_state(vec![update]).await {
                error!(id = %id, peer = %peer, error = %e, "failed to record sync state");
            }
        }
    }

    async fn handle_content(self: &Arc<Self>, peer: &PeerId, msg: ContentMessage, retried: bool) {
        let id = msg.id.clone();
        if !self.node.has(&id) {
            self.load_from_storage(&id, 0).await;
        }

        let mut created = false;
        if !self.node.has(&id) {
            let Some(header) = msg.header.clone() else {
                debug!(id = %id, peer = %peer, "content for unknown covalue without header, requesting all of it");
                let empty = KnownState::empty(id.clone());
                self.with_peer(peer, |entry| entry.state.set_known_state(empty.clone()));
                self.enqueue(peer, SyncMessage::Known(KnownMessage::from_state(empty, true)));
                return;
            };
            match self.node.ensure_header(&id, header) {
                Ok(new) => created = new,
                Err(e) => {
                    warn!(id = %id, peer = %peer, error = %e, "rejecting header");
                    return;
                }
            }
        }
        if let Some(until) = &msg.expect_content_until {
            lock(&self.expectations).insert(id.clone(), until.clone());
        }

        let mut accepted = ContentMessage::new(id.clone(), msg.priority);
        if created {
            accepted.header = msg.header.clone();
        }
        let mut gap = false;
        let mut missing = None;
        for (session_id, content) in &msg.new {
            let (after, txs) = match self.slice_new(&id, session_id, content) {
                Slice::Gap => {
                    debug!(id = %id, session = %session_id, after = content.after, "gap in received content");
                    gap = true;
                    continue;
                }
                Slice::Nothing => continue,
                Slice::New { after, txs } => (after, txs),
            };
            let signature = match Signature::parse(&content.last_signature) {
                Ok(signature) => signature,
                Err(e) => {
                    warn!(id = %id, session = %session_id, error = %e, "unparseable signature");
                    continue;
                }
            };
            match self
                .node
                .try_add_transactions(&id, session_id, txs.clone(), &signature, false)
            {
                Ok(_) => {
                    accepted.new.insert(
                        session_id.clone(),
                        SessionNewContent {
                            after,
                            new_transactions: txs,
                            last_signature: content.last_signature.clone(),
                        },
                    );
                }
                Err(CoreError::MissingDependency { dependency, .. }) => missing = Some(dependency),
                Err(e @ CoreError::InvalidSignature { .. }) => {
                    warn!(id = %id, peer = %peer, error = %e, "rejected content");
                }
                Err(e) => debug!(id = %id, peer = %peer, error = %e, "content not applied"),
            }
        }

        self.with_peer(peer, |entry| entry.state.combine_known_state(&msg.known_state()));

        let changed = !accepted.is_empty();
        if changed {
            let deletes = accepted.new.keys().any(SessionId::is_delete);
            self.persist(accepted).await;
            if deletes {
                self.persist_deletion(&id).await;
            }
        }

        let ours = self.our_known_state(&id);
        self.enqueue(peer, SyncMessage::Known(KnownMessage::from_state(ours, gap)));

        if changed {
            self.broadcast(&id, Some(peer));
        }
        if missing.is_none() {
            self.resolve_if_complete(&id);
        }

        if let Some(dependency) = missing {
            if retried {
                debug!(id = %id, dependency = %dependency, "dependency still missing, dropping content");
            } else {
                tokio::spawn(Arc::clone(self).retry_content(peer.clone(), msg, dependency));
            }
        }
    }

    fn retry_content(self: Arc<Self>, peer: PeerId, msg: ContentMessage, dependency: CoId) -> BoxFuture<'static, ()> {
        async move {
            debug!(id = %msg.id, dependency = %dependency, "loading dependency before applying content");
            let mut sources = vec![peer.clone()];
            sources.extend(self.server_peers(Some(&peer)));
            if self.load_from_sources(&dependency, sources).await {
                self.handle_content(&peer, msg, true).await;
            } else {
                warn!(id = %msg.id, dependency = %dependency, "dependency unavailable");
            }
        }
        .boxed()
    }

    async fn handle_reconcile(self: &Arc<Self>, peer: &PeerId, reconcile: ReconcileMessage) {
        let mut mismatched = 0usize;
        for (id, hash) in &reconcile.values {
            if !self.node.has(id) {
                self.load_from_storage(id, 0).await;
            }
            let ours = self.node.known_state(id);
            let matches = ours
                .as_ref()
                .and_then(reconcile_hash)
                .is_some_and(|ours| &ours == hash);
            if !matches {
                mismatched += 1;
                self.with_peer(peer, |entry| {
                    entry.state.subscribe(id);
                    entry.state.mark_load_request_sent(id);
                });
                let state = ours.unwrap_or_else(|| KnownState::empty(id.clone()));
                self.enqueue(peer, SyncMessage::Load(state));
            }
        }
        debug!(peer = %peer, batch = %reconcile.id, values = reconcile.values.len(), mismatched, "reconciled batch");
        self.enqueue(peer, SyncMessage::ReconcileAck(ReconcileAckMessage { id: reconcile.id }));
    }

    fn handle_reconcile_ack(&self, peer: &PeerId, batch_id: &str) {
        let drained = self
            .with_peer(peer, |entry| entry.queue.is_empty())
            .unwrap_or(true);
        let ready = lock(&self.acks).handle_ack(batch_id, peer, drained);
        if let Some(ready) = ready {
            ready.fire();
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Sends whatever `peer` is missing of `id`. With `force_known`, a peer
    /// that is missing nothing still gets a `known` reply.
    fn send_new_content(&self, peer: &PeerId, id: &CoId, force_known: bool) {
        let Some(theirs) = self.with_peer(peer, |entry| entry.state.known_state(id).cloned()) else {
            return;
        };
        match self.node.new_content_since(id, theirs.as_ref()) {
            Some(pieces) => {
                self.with_peer(peer, |entry| {
                    if !entry.state.is_connected() {
                        return;
                    }
                    for piece in pieces {
                        entry.state.update_optimistic(&piece.known_state());
                        entry.queue.push(SyncMessage::Content(piece));
                    }
                });
            }
            None if force_known => {
                let ours = self.our_known_state(id);
                self.with_peer(peer, |entry| {
                    entry.state.mark_told_known_state(id);
                });
                self.enqueue(peer, SyncMessage::Known(KnownMessage::from_state(ours, false)));
            }
            None => {}
        }
    }

    /// Asks a server peer for `id`, announcing what we already have.
    fn send_load(&self, peer: &PeerId, id: &CoId) {
        let ours = self.our_known_state(id);
        self.with_peer(peer, |entry| {
            entry.state.subscribe(id);
            entry.state.mark_load_request_sent(id);
        });
        self.enqueue(peer, SyncMessage::Load(ours));
    }

    /// Pushes `id` to subscribed peers, and asks server peers that have not
    /// heard of it yet to load it.
    fn broadcast(&self, id: &CoId, except: Option<&PeerId>) {
        let targets: Vec<(PeerId, bool)> = lock(&self.peers)
            .iter()
            .filter(|(peer, entry)| entry.state.is_connected() && Some(*peer) != except)
            .filter_map(|(peer, entry)| {
                if entry.state.is_subscribed(id) {
                    Some((peer.clone(), false))
                } else if entry.state.is_server() {
                    Some((peer.clone(), true))
                } else {
                    None
                }
            })
            .collect();
        for (peer, needs_load) in targets {
            if needs_load {
                self.send_load(&peer, id);
            } else {
                self.send_new_content(&peer, id, false);
            }
        }
    }

    // ── Loading ──────────────────────────────────────────────────

    /// Storage first, then each of `peers` in turn.
    pub(crate) async fn load_from_sources(&self, id: &CoId, peers: Vec<PeerId>) -> bool {
        if self.node.has(id) {
            return true;
        }
        if self.load_from_storage(id, 0).await {
            return true;
        }
        for peer in peers {
            if self.load_from_peer(&peer, id).await {
                return true;
            }
        }
        self.node.has(id)
    }

    async fn load_from_peer(&self, peer: &PeerId, id: &CoId) -> bool {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).entry(id.clone()).or_default().push(Waiter {
            peer: peer.clone(),
            tx,
        });
        if self.node.has(id) && !lock(&self.expectations).contains_key(id) {
            return true;
        }
        let connected = self
            .with_peer(peer, |entry| entry.state.is_connected())
            .unwrap_or(false);
        if !connected {
            return false;
        }
        debug!(id = %id, peer = %peer, "loading from peer");
        self.send_load(peer, id);
        match tokio::time::timeout(self.config.peer_load_timeout, rx).await {
            Ok(Ok(found)) => found && self.node.has(id),
            Ok(Err(_)) => self.node.has(id),
            Err(_) => {
                debug!(id = %id, peer = %peer, "peer did not answer load in time");
                self.node.has(id)
            }
        }
    }

    fn load_from_storage<'a>(&'a self, id: &'a CoId, depth: usize) -> BoxFuture<'a, bool> {
        async move {
            let Some(storage) = &self.storage else {
                return false;
            };
            let pieces = match storage.load(id).await {
                Ok(pieces) => pieces,
                Err(e) => {
                    error!(id = %id, error = %e, "failed to load from storage");
                    return false;
                }
            };
            if pieces.is_empty() {
                return false;
            }
            for piece in pieces {
                let Some(dependency) = self.apply_trusted(&piece) else {
                    continue;
                };
                if depth < MAX_DEPENDENCY_DEPTH && self.load_from_storage(&dependency, depth + 1).await {
                    self.apply_trusted(&piece);
                }
            }
            debug!(id = %id, "loaded from storage");
            self.node.has(id)
        }
        .boxed()
    }

    /// Applies content from our own storage without verifying signatures.
    /// Returns a dependency that has to be loaded first, if any.
    fn apply_trusted(&self, msg: &ContentMessage) -> Option<CoId> {
        if let Some(header) = &msg.header {
            if let Err(e) = self.node.ensure_header(&msg.id, header.clone()) {
                warn!(id = %msg.id, error = %e, "stored header rejected");
                return None;
            }
        }
        let mut missing = None;
        for (session_id, content) in &msg.new {
            let Slice::New { txs, .. } = self.slice_new(&msg.id, session_id, content) else {
                continue;
            };
            let signature = match Signature::parse(&content.last_signature) {
                Ok(signature) => signature,
                Err(e) => {
                    warn!(id = %msg.id, session = %session_id, error = %e, "stored signature unparseable");
                    continue;
                }
            };
            match self.node.try_add_transactions(&msg.id, session_id, txs, &signature, true) {
                Ok(_) => {}
                Err(CoreError::MissingDependency { dependency, .. }) => missing = Some(dependency),
                Err(e) => warn!(id = %msg.id, session = %session_id, error = %e, "stored content not applied"),
            }
        }
        missing
    }

    /// The part of `content` we do not have yet.
    fn slice_new(&self, id: &CoId, session_id: &SessionId, content: &SessionNewContent) -> Slice {
        let ours = self
            .node
            .with_core(id, |core| core.transaction_count(session_id))
            .unwrap_or(0);
        if content.after > ours {
            return Slice::Gap;
        }
        let skip = (ours - content.after) as usize;
        if skip >= content.new_transactions.len() {
            return Slice::Nothing;
        }
        Slice::New {
            after: ours,
            txs: content.new_transactions[skip..].to_vec(),
        }
    }

    fn resolve_if_complete(&self, id: &CoId) {
        let Some(ours) = self.node.known_state(id) else {
            return;
        };
        let complete = {
            let mut expectations = lock(&self.expectations);
            let complete = expectations
                .get(id)
                .is_none_or(|until| until.iter().all(|(session, &count)| ours.count(session) >= count));
            if complete {
                expectations.remove(id);
            }
            complete
        };
        if complete {
            self.resolve_waiters(id, true, None);
        }
    }

    fn resolve_waiters(&self, id: &CoId, found: bool, only: Option<&PeerId>) {
        let ready: Vec<Waiter> = {
            let mut waiters = lock(&self.waiters);
            let Some(list) = waiters.remove(id) else {
                return;
            };
            let (ready, keep): (Vec<_>, Vec<_>) = list
                .into_iter()
                .partition(|w| only.is_none_or(|peer| &w.peer == peer));
            if !keep.is_empty() {
                waiters.insert(id.clone(), keep);
            }
            ready
        };
        for waiter in ready {
            let _ = waiter.tx.send(found);
        }
    }

    // ── Storage ──────────────────────────────────────────────────

    async fn persist(&self, msg: ContentMessage) {
        let Some(storage) = &self.storage else {
            return;
        };
        let id = msg.id.clone();
        match storage.store(msg).await {
            Ok(StoreOutcome::Stored) => {}
            Ok(StoreOutcome::Correction(known)) => {
                debug!(id = %id, "storage is behind, sending it everything it lacks");
                for piece in self.node.new_content_since(&id, Some(&known)).unwrap_or_default() {
                    match storage.store(piece).await {
                        Ok(StoreOutcome::Stored) => {}
                        Ok(StoreOutcome::Correction(_)) => {
                            error!(id = %id, "storage rejected corrected content");
                            return;
                        }
                        Err(e) => {
                            error!(id = %id, error = %e, "failed to store content");
                            return;
                        }
                    }
                }
            }
            Err(e) => error!(id = %id, error = %e, "failed to store content"),
        }
    }

    /// Stores whatever storage does not have of `id` yet.
    async fn persist_since(&self, id: &CoId) {
        let Some(storage) = &self.storage else {
            return;
        };
        let known = match storage.load_known_state(id).await {
            Ok(known) => known,
            Err(e) => {
                error!(id = %id, error = %e, "failed to read stored state");
                return;
            }
        };
        for piece in self.node.new_content_since(id, known.as_ref()).unwrap_or_default() {
            self.persist(piece).await;
        }
    }

    async fn persist_deletion(&self, id: &CoId) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.mark_delete_as_valid(id).await {
            Ok(()) => {
                if let Some(eraser) = &self.eraser {
                    eraser.on_enqueue();
                }
            }
            Err(e) => error!(id = %id, error = %e, "failed to mark deletion"),
        }
    }

    async fn run_local_changes(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<CoId>) {
        loop {
            let id = tokio::select! {
                () = self.shutdown.cancelled() => break,
                id = changes.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            self.persist_since(&id).await;
            if self.node.is_deleted(&id) {
                self.persist_deletion(&id).await;
            }
            self.track_unsynced(&id).await;
            self.broadcast(&id, None);
        }
        debug!("local change loop stopped");
    }

    async fn track_unsynced(&self, id: &CoId) {
        let Some(storage) = &self.storage else {
            return;
        };
        let updates: Vec<SyncStateUpdate> = lock(&self.peers)
            .iter()
            .filter(|(_, entry)| entry.state.is_server() && entry.state.is_persistent())
            .map(|(peer, _)| SyncStateUpdate {
                id: id.clone(),
                peer: peer.clone(),
                synced: false,
            })
            .collect();
        if updates.is_empty() {
            return;
        }
        if let Err(e) = storage.track_sync_state(updates).await {
            error!(id = %id, error = %e, "failed to track unsynced covalue");
        }
    }

    async fn resume_unsynced(self: Arc<Self>, peer: PeerId) {
        let Some(storage) = &self.storage else {
            return;
        };
        let ids = match storage.get_unsynced_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(peer = %peer, error = %e, "failed to read unsynced covalues");
                return;
            }
        };
        if !ids.is_empty() {
            info!(peer = %peer, count = ids.len(), "resuming sync of unsynced covalues");
        }
        for id in ids {
            if !self.node.has(&id) {
                self.load_from_storage(&id, 0).await;
            }
            if self.node.has(&id) {
                self.send_load(&peer, &id);
            }
        }
    }

    // ── Storage reconciliation ───────────────────────────────────

    /// Offers the next batch of stored values to a persistent server peer.
    /// The batch after it starts once the peer acked and our queue to it drained.
    fn reconcile_batch(self: Arc<Self>, peer: PeerId, offset: usize) -> BoxFuture<'static, ()> {
        async move {
            let Some(storage) = self.storage.clone() else {
                return;
            };
            let connected = self
                .with_peer(&peer, |entry| entry.state.is_connected())
                .unwrap_or(false);
            if !connected {
                return;
            }
            let limit = self.config.reconciliation_batch_size.max(1);
            let ids = match storage.covalue_ids(limit, offset).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!(peer = %peer, error = %e, "failed to list stored covalues");
                    Vec::new()
                }
            };
            if ids.is_empty() {
                self.with_peer(&peer, |entry| {
                    if entry.state.connection() == PeerConnectionState::Reconciling {
                        entry.state.set_connection(PeerConnectionState::Steady);
                    }
                });
                debug!(peer = %peer, "storage reconciliation finished");
                return;
            }

            let mut values = Vec::with_capacity(ids.len());
            for id in &ids {
                // values in memory were offered with a `load` already
                if self.node.has(id) {
                    continue;
                }
                match storage.load_known_state(id).await {
                    Ok(Some(state)) => {
                        if let Some(hash) = reconcile_hash(&state) {
                            values.push((id.clone(), hash));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!(id = %id, error = %e, "failed to read stored state"),
                }
            }

            let batch = format!("{peer}-{}", self.next_batch.fetch_add(1, Ordering::Relaxed));
            let next = Arc::clone(&self);
            let next_peer = peer.clone();
            let runtime = tokio::runtime::Handle::current();
            {
                let mut acks = lock(&self.acks);
                acks.track_batch(batch.clone(), peer.clone(), offset + ids.len());
                acks.wait_for_ack(
                    &batch,
                    Box::new(move |next_offset| {
                        runtime.spawn(next.reconcile_batch(next_peer, next_offset));
                    }),
                );
            }
            debug!(peer = %peer, batch = %batch, values = values.len(), "sending reconcile batch");
            self.enqueue(&peer, SyncMessage::Reconcile(ReconcileMessage { id: batch, values }));
        }
        .boxed()
    }
}
