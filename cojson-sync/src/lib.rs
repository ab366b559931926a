//! Sync of cojson values between nodes, and between a node and its storage.
//!
//! # Architecture
//!
//! - [`transport`] turns any text-frame socket into a [`Peer`]: channels of
//!   [`PeerEvent`]s in and [`SyncMessage`](cojson_types::SyncMessage)s out,
//!   with batching and ping liveness
//! - [`SyncManager`] owns a [`LocalNode`](cojson_core::LocalNode), optional
//!   storage and the peers, and runs the `load` / `known` / `content` /
//!   `reconcile` protocol
//! - [`PeerState`] tracks what each peer is known to hold
//! - [`PriorityQueue`] orders outgoing messages by value priority
//! - [`AckTracker`] paces storage reconciliation batches
//!
//! ## Sync process
//!
//! 1. A client adds a server peer and sends `load` for every value it holds
//! 2. A persistent server with local storage is also offered every stored
//!    value in `reconcile` batches, one batch per ack
//! 3. Each side answers with the content the other is missing, and `known`
//!    to confirm what it received
//! 4. Local edits are stored, then pushed to subscribed peers

pub mod ack;
mod error;
mod loader;
pub mod manager;
pub mod peer_state;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use ack::{AckCallback, AckTracker, ReadyAck};
pub use error::{SyncError, SyncResult};
pub use manager::{SyncManager, reconcile_hash};
pub use peer_state::{PeerConnectionState, PeerRole, PeerState};
pub use protocol::{
    ControlMessage, FrameBuilder, FrameLine, HIGH_WATER_MARK, MAX_OUTGOING_CHUNK_BYTES, SyncConfig,
    decode_frame, encode_control, encode_message,
};
pub use queue::{Handle, LinkedList, PriorityQueue};
pub use transport::{
    ChannelSink, FrameSink, Peer, PeerEvent, PingMode, TransportOptions, channel_frames,
    connect_framed, connected_peers,
};
