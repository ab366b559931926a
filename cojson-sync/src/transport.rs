//! Peers and the framed transport that carries their messages.
//!
//! A [`Peer`] is a pair of channels: [`PeerEvent`]s in, [`SyncMessage`]s
//! out. [`connect_framed`] bridges such a pair to any text-frame socket,
//! batching outgoing messages and handling pings. [`connected_peers`] links
//! two in-process peers through the same machinery.

use crate::error::{SyncError, SyncResult};
use crate::peer_state::PeerRole;
use crate::protocol::{
    ControlMessage, FrameBuilder, FrameLine, SyncConfig, decode_frame, encode_control,
    encode_message, frame_line_count,
};
use async_trait::async_trait;
use cojson_types::{PeerId, SyncMessage};
use futures::stream::BoxStream;
use futures::{StreamExt, stream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Capacity of the per-peer channels.
const CHANNEL_CAPACITY: usize = 1024;

/// What arrives from a peer. Disconnects are events, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Message(SyncMessage),
    Disconnected,
    PingTimeout,
}

/// A connected peer, ready to hand to a [`SyncManager`](crate::SyncManager).
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub role: PeerRole,
    pub incoming: mpsc::Receiver<PeerEvent>,
    pub outgoing: mpsc::Sender<SyncMessage>,
    /// Whether content must be confirmed by this peer before it counts as synced.
    pub persistent: bool,
}

/// The sending half of a text-frame socket.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: String) -> SyncResult<()>;

    /// Resolves once the socket can send.
    async fn wait_open(&mut self) -> SyncResult<()> {
        Ok(())
    }

    /// Bytes accepted but not yet written out.
    fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&mut self);
}

/// Ping behaviour of one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMode {
    None,
    /// Send a ping at this interval.
    Send(Duration),
    /// Report [`PeerEvent::PingTimeout`] after this long without a frame.
    Expect(Duration),
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub ping: PingMode,
    /// Start with batching on rather than waiting for the remote to batch.
    pub batching: bool,
    pub max_outgoing_chunk_bytes: usize,
    pub high_water_mark: usize,
}

impl TransportOptions {
    pub fn from_config(config: &SyncConfig, ping: PingMode) -> Self {
        Self {
            ping,
            batching: false,
            max_outgoing_chunk_bytes: config.max_outgoing_chunk_bytes,
            high_water_mark: config.high_water_mark,
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default(), PingMode::None)
    }
}

/// Bridges a frame socket to a [`Peer`].
///
/// Spawns a reader and a writer task on the current tokio runtime. Dropping
/// the peer's `outgoing` sender flushes and closes the socket.
pub fn connect_framed<S>(
    id: PeerId,
    role: PeerRole,
    persistent: bool,
    sink: S,
    frames: BoxStream<'static, String>,
    options: TransportOptions,
) -> Peer
where
    S: FrameSink,
{
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let batching = Arc::new(AtomicBool::new(options.batching));

    tokio::spawn(read_loop(
        id.clone(),
        frames,
        event_tx,
        Arc::clone(&batching),
        options.ping,
    ));
    tokio::spawn(write_loop(id.clone(), sink, out_rx, batching, options));

    Peer {
        id,
        role,
        incoming: event_rx,
        outgoing: out_tx,
        persistent,
    }
}

async fn read_loop(
    peer: PeerId,
    mut frames: BoxStream<'static, String>,
    events: mpsc::Sender<PeerEvent>,
    batching: Arc<AtomicBool>,
    ping: PingMode,
) {
    let timeout = match ping {
        PingMode::Expect(timeout) => Some(timeout),
        _ => None,
    };
    let mut deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let frame = match deadline {
            Some(at) => tokio::select! {
                frame = frames.next() => frame,
                () = tokio::time::sleep_until(at) => {
                    warn!(peer = %peer, "no ping received, giving up on peer");
                    let _ = events.send(PeerEvent::PingTimeout).await;
                    return;
                }
            },
            None => frames.next().await,
        };
        let Some(frame) = frame else {
            debug!(peer = %peer, "peer stream ended");
            let _ = events.send(PeerEvent::Disconnected).await;
            return;
        };
        if let Some(timeout) = timeout {
            deadline = Some(Instant::now() + timeout);
        }
        if frame_line_count(&frame) > 1 && !batching.swap(true, Ordering::Relaxed) {
            debug!(peer = %peer, "peer batches frames, enabling batching");
        }
        for line in decode_frame(&frame) {
            match line {
                Ok(FrameLine::Message(msg)) => {
                    if events.send(PeerEvent::Message(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(FrameLine::Control(ControlMessage::Ping { .. })) => trace!(peer = %peer, "ping"),
                Err(e) => warn!(peer = %peer, error = %e, "dropping undecodable line"),
            }
        }
    }
}

async fn write_loop<S: FrameSink>(
    peer: PeerId,
    mut sink: S,
    mut outgoing: mpsc::Receiver<SyncMessage>,
    batching: Arc<AtomicBool>,
    options: TransportOptions,
) {
    if let Err(e) = sink.wait_open().await {
        warn!(peer = %peer, error = %e, "socket never opened");
        return;
    }
    let mut ticker = match options.ping {
        PingMode::Send(interval) => {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
        _ => None,
    };

    loop {
        let next = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                msg = outgoing.recv() => Some(msg),
                _ = ticker.tick() => None,
            },
            None => Some(outgoing.recv().await),
        };
        let result = match next {
            None => match encode_control(&ControlMessage::ping()) {
                Ok(ping) => send(&mut sink, ping, options.high_water_mark).await,
                Err(e) => Err(e),
            },
            Some(None) => break,
            Some(Some(first)) => {
                write_batch(&mut sink, first, &mut outgoing, &batching, &options).await
            }
        };
        if let Err(e) = result {
            warn!(peer = %peer, error = %e, "send failed, closing");
            break;
        }
    }
    sink.close().await;
    debug!(peer = %peer, "writer closed");
}

/// Sends `first` plus whatever is already queued, as few frames as the
/// chunk limit allows when batching is on.
async fn write_batch<S: FrameSink>(
    sink: &mut S,
    first: SyncMessage,
    outgoing: &mut mpsc::Receiver<SyncMessage>,
    batching: &AtomicBool,
    options: &TransportOptions,
) -> SyncResult<()> {
    let line = encode_message(&first)?;
    if !batching.load(Ordering::Relaxed) {
        return send(sink, line, options.high_water_mark).await;
    }
    let mut builder = FrameBuilder::new(options.max_outgoing_chunk_bytes);
    builder.push(&line);
    while !builder.is_full() {
        let Ok(msg) = outgoing.try_recv() else {
            break;
        };
        if let Some(frame) = builder.push(&encode_message(&msg)?) {
            send(sink, frame, options.high_water_mark).await?;
        }
    }
    match builder.take() {
        Some(frame) => send(sink, frame, options.high_water_mark).await,
        None => Ok(()),
    }
}

async fn send<S: FrameSink>(sink: &mut S, frame: String, high_water_mark: usize) -> SyncResult<()> {
    while sink.buffered_amount() > high_water_mark {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    sink.send_frame(frame).await
}

// ── In-process channel transport ────────────────────────────────

/// A [`FrameSink`] writing into a channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: String) -> SyncResult<()> {
        let tx = self.tx.as_ref().ok_or(SyncError::ChannelClosed)?;
        tx.send(frame).map_err(|_| SyncError::ChannelClosed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

/// Frames received on a channel as a stream.
pub fn channel_frames(rx: mpsc::UnboundedReceiver<String>) -> BoxStream<'static, String> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) }).boxed()
}

/// Links two in-process nodes.
///
/// Returns `(first, second)`: `first` represents `first_id` and is meant
/// for the node called `second_id`, and the other way round. Both sides
/// batch outgoing frames.
pub fn connected_peers(
    first_id: impl Into<String>,
    second_id: impl Into<String>,
    first_role: PeerRole,
    second_role: PeerRole,
    persistent: bool,
) -> (Peer, Peer) {
    let (to_first_tx, to_first_rx) = mpsc::unbounded_channel();
    let (to_second_tx, to_second_rx) = mpsc::unbounded_channel();
    let options = TransportOptions {
        batching: true,
        ..TransportOptions::default()
    };
    // what the second node sends through `first` goes to the first node
    let first = connect_framed(
        PeerId::new(first_id),
        first_role,
        persistent,
        ChannelSink::new(to_first_tx),
        channel_frames(to_second_rx),
        options.clone(),
    );
    let second = connect_framed(
        PeerId::new(second_id),
        second_role,
        persistent,
        ChannelSink::new(to_second_tx),
        channel_frames(to_first_rx),
        options,
    );
    (first, second)
}
