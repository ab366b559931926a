//! The [`CoValueLoader`] the sync manager installs into its node.

use crate::manager::Inner;
use async_trait::async_trait;
use cojson_core::CoValueLoader;
use cojson_types::CoId;
use std::sync::Weak;
use tracing::trace;

/// Loads from storage first, then asks each connected server peer in turn.
///
/// Holds the manager weakly so a node can outlive it.
pub(crate) struct SyncLoader {
    inner: Weak<Inner>,
}

impl SyncLoader {
    pub(crate) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl CoValueLoader for SyncLoader {
    async fn load(&self, id: &CoId) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        if inner.node().has(id) {
            return true;
        }
        let peers = inner.server_peers(None);
        trace!(id = %id, servers = peers.len(), "loading covalue");
        inner.load_from_sources(id, peers).await
    }
}
