//! HTTP surface of the sync server: a health check, and a websocket peer
//! on every other path.

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use cojson_sync::{
    FrameSink, Peer, PeerEvent, PeerRole, PingMode, SyncConfig, SyncError, SyncManager,
    SyncResult, TransportOptions, connect_framed,
};
use cojson_types::PeerId;
use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, StreamExt, future};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Shared by every connection.
pub struct ServerState {
    sync: SyncManager,
    config: SyncConfig,
    /// Probability of dropping each incoming message, when set.
    flaky_drop_rate: Option<f64>,
    next_client: AtomicU64,
}

impl ServerState {
    pub fn new(sync: SyncManager, config: SyncConfig, flaky_drop_rate: Option<f64>) -> Self {
        Self {
            sync,
            config,
            flaky_drop_rate,
            next_client: AtomicU64::new(0),
        }
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// Adds a client speaking the framed protocol over `sink` and `frames`.
    pub fn connect_client<S: FrameSink>(&self, sink: S, frames: BoxStream<'static, String>) -> PeerId {
        let n = self.next_client.fetch_add(1, Ordering::Relaxed);
        let id = PeerId::new(format!("client-{n}"));
        let options = TransportOptions::from_config(&self.config, PingMode::Send(self.config.ping_interval));
        let mut peer = connect_framed(id.clone(), PeerRole::Client, false, sink, frames, options);
        if let Some(rate) = self.flaky_drop_rate {
            peer = flaky(peer, rate);
        }
        info!(peer = %id, "client connected");
        self.sync.add_peer(peer);
        id
    }
}

/// Drops each incoming message with probability `drop_rate`.
fn flaky(peer: Peer, drop_rate: f64) -> Peer {
    let (tx, rx) = mpsc::channel(1024);
    let mut incoming = peer.incoming;
    let id = peer.id.clone();
    tokio::spawn(async move {
        while let Some(event) = incoming.recv().await {
            if matches!(event, PeerEvent::Message(_)) && rand::random::<f64>() < drop_rate {
                debug!(peer = %id, "dropping message");
                continue;
            }
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    Peer { incoming: rx, ..peer }
}

struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: String) -> SyncResult<()> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let frames = stream
            .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(text.to_string()),
                    _ => None,
                })
            })
            .boxed();
        state.connect_client(WsSink { sink }, frames);
    })
}

/// `GET /health` answers `ok`; any other path upgrades to a sync peer.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(upgrade)
        .with_state(state)
}
