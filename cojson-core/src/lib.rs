//! Replication core for cojson.
//!
//! - [`session_log`] - per-session append-only logs with hash chains and signatures
//! - [`covalue`] - a value's header plus its sessions, verification and deletion
//! - [`content`] - reducers that fold valid transactions into maps, lists, streams and text
//! - [`permissions`] - roles, group validation and key resolution
//! - [`node`] - the [`LocalNode`] registry that ties it all together

pub mod content;
pub mod covalue;
pub mod error;
pub mod node;
pub mod permissions;
pub mod session_log;

pub use content::{
    AccountContent, CoList, CoMap, CoPlainText, CoStream, Content, DecodedTx, GroupContent,
    LIST_COMPACTION_INTERVAL, ListOp, ListRef, MapOp, StreamItem,
};
pub use covalue::{CoValueCore, delete_marker, id_for_header};
pub use error::{CoreError, CoreResult};
pub use node::{
    CoValueLoader, CoValueState, LoadError, LocalNode, NodeConfig, Privacy, Subscription,
};
pub use permissions::{GroupLookup, Identity, ParentMapping, Role};
pub use session_log::{MAX_RECOMMENDED_TX_SIZE, SessionLog, SessionLogConfig};
