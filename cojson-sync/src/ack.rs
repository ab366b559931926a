//! Acknowledgement of `reconcile` batches.
//!
//! A batch counts as done once the peer acked it **and** everything we
//! queued for that peer in response has left the outgoing queue. Only then
//! does the next batch start.

use cojson_types::PeerId;
use std::collections::HashMap;

/// Called with the storage offset the next batch starts from.
pub type AckCallback = Box<dyn FnOnce(usize) + Send>;

struct Batch {
    peer: PeerId,
    next_offset: usize,
    acked: bool,
    callback: Option<AckCallback>,
}

#[derive(Default)]
pub struct AckTracker {
    batches: HashMap<String, Batch>,
}

impl std::fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTracker")
            .field("batches", &self.batches.len())
            .finish()
    }
}

/// A callback ready to run, returned so callers can invoke it outside their locks.
pub struct ReadyAck {
    callback: AckCallback,
    next_offset: usize,
}

impl ReadyAck {
    pub fn fire(self) {
        (self.callback)(self.next_offset);
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_batch(&mut self, batch_id: impl Into<String>, peer: PeerId, next_offset: usize) {
        self.batches.insert(
            batch_id.into(),
            Batch {
                peer,
                next_offset,
                acked: false,
                callback: None,
            },
        );
    }

    pub fn wait_for_ack(&mut self, batch_id: &str, callback: AckCallback) {
        if let Some(batch) = self.batches.get_mut(batch_id) {
            batch.callback = Some(callback);
        }
    }

    /// Records the peer's ack. The callback is ready when the peer's queue
    /// is already drained; otherwise it waits for [`on_drained`](Self::on_drained).
    pub fn handle_ack(&mut self, batch_id: &str, peer: &PeerId, queue_drained: bool) -> Option<ReadyAck> {
        let batch = self.batches.get_mut(batch_id)?;
        if &batch.peer != peer {
            return None;
        }
        batch.acked = true;
        if queue_drained { self.take_ready(batch_id) } else { None }
    }

    /// The outgoing queue of `peer` just emptied.
    pub fn on_drained(&mut self, peer: &PeerId) -> Vec<ReadyAck> {
        let ready: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, b)| &b.peer == peer && b.acked && b.callback.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ready.iter().filter_map(|id| self.take_ready(id)).collect()
    }

    /// Forgets every batch of a disconnected peer.
    pub fn drop_peer(&mut self, peer: &PeerId) {
        self.batches.retain(|_, b| &b.peer != peer);
    }

    pub fn pending(&self) -> usize {
        self.batches.len()
    }

    fn take_ready(&mut self, batch_id: &str) -> Option<ReadyAck> {
        let batch = self.batches.get_mut(batch_id)?;
        let callback = batch.callback.take()?;
        let next_offset = batch.next_offset;
        self.batches.remove(batch_id);
        Some(ReadyAck {
            callback,
            next_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn recorder() -> (Arc<AtomicUsize>, AckCallback) {
        let seen = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&seen);
        (seen, Box::new(move |offset| inner.store(offset, Ordering::SeqCst)))
    }

    #[test]
    fn fires_immediately_when_drained() {
        let mut acks = AckTracker::new();
        let peer = PeerId::new("server");
        let (seen, callback) = recorder();
        acks.track_batch("b1", peer.clone(), 100);
        acks.wait_for_ack("b1", callback);

        acks.handle_ack("b1", &peer, true).unwrap().fire();
        assert_eq!(seen.load(Ordering::SeqCst), 100);
        assert_eq!(acks.pending(), 0);
    }

    #[test]
    fn waits_for_queue_to_drain() {
        let mut acks = AckTracker::new();
        let peer = PeerId::new("server");
        let (seen, callback) = recorder();
        acks.track_batch("b1", peer.clone(), 200);
        acks.wait_for_ack("b1", callback);

        assert!(acks.handle_ack("b1", &peer, false).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let ready = acks.on_drained(&peer);
        assert_eq!(ready.len(), 1);
        ready.into_iter().for_each(ReadyAck::fire);
        assert_eq!(seen.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn drain_without_ack_does_nothing() {
        let mut acks = AckTracker::new();
        let peer = PeerId::new("server");
        let (_seen, callback) = recorder();
        acks.track_batch("b1", peer.clone(), 1);
        acks.wait_for_ack("b1", callback);
        assert!(acks.on_drained(&peer).is_empty());
        assert_eq!(acks.pending(), 1);
    }

    #[test]
    fn ack_from_other_peer_is_ignored() {
        let mut acks = AckTracker::new();
        let (_seen, callback) = recorder();
        acks.track_batch("b1", PeerId::new("server"), 1);
        acks.wait_for_ack("b1", callback);
        assert!(acks.handle_ack("b1", &PeerId::new("intruder"), true).is_none());
        acks.drop_peer(&PeerId::new("server"));
        assert_eq!(acks.pending(), 0);
    }
}
