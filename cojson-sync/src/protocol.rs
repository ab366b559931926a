//! Wire framing of sync messages.
//!
//! A frame is one or more JSON objects separated by `\n`. Each line is
//! either a [`SyncMessage`] (tagged by `action`) or a control line
//! (tagged by `type`), of which only `ping` exists.

use crate::error::{SyncError, SyncResult};
use cojson_storage::EraserConfig;
use cojson_types::SyncMessage;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest frame the batching transport builds.
pub const MAX_OUTGOING_CHUNK_BYTES: usize = 25_000;

/// Buffered bytes above which sending pauses.
pub const HIGH_WATER_MARK: usize = 256 * 1024;

/// Configuration for the sync layer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_outgoing_chunk_bytes: usize,
    pub high_water_mark: usize,
    /// How often servers ping their clients.
    pub ping_interval: Duration,
    /// Silence after which a client expecting pings gives up on a peer.
    pub ping_timeout: Duration,
    /// Values per `reconcile` message.
    pub reconciliation_batch_size: usize,
    /// Processing time per peer before yielding to other tasks.
    pub incoming_time_budget: Duration,
    /// How long to wait for one server peer to answer a `load`.
    pub peer_load_timeout: Duration,
    pub eraser: EraserConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_outgoing_chunk_bytes: MAX_OUTGOING_CHUNK_BYTES,
            high_water_mark: HIGH_WATER_MARK,
            ping_interval: Duration::from_millis(1500),
            ping_timeout: Duration::from_secs(10),
            reconciliation_batch_size: 100,
            incoming_time_budget: Duration::from_millis(50),
            peer_load_timeout: Duration::from_secs(10),
            eraser: EraserConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ping {
        time: u64,
        #[serde(default)]
        dc: String,
    },
}

impl ControlMessage {
    pub fn ping() -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self::Ping {
            time,
            dc: "cojson".into(),
        }
    }
}

/// One decoded line of a frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FrameLine {
    Message(SyncMessage),
    Control(ControlMessage),
}

pub fn encode_message(msg: &SyncMessage) -> SyncResult<String> {
    Ok(serde_json::to_string(msg)?)
}

pub fn encode_control(msg: &ControlMessage) -> SyncResult<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes every line of a frame. A bad line does not spoil the others.
pub fn decode_frame(frame: &str) -> Vec<SyncResult<FrameLine>> {
    frame
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<FrameLine>(line)
                .map_err(|e| SyncError::Protocol(format!("undecodable line: {e}")))
        })
        .collect()
}

/// Number of non-empty lines in a frame.
pub fn frame_line_count(frame: &str) -> usize {
    frame.split('\n').filter(|line| !line.trim().is_empty()).count()
}

/// Appends encoded lines into frames no larger than `max_bytes`.
///
/// A single line longer than `max_bytes` still goes out, alone.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    max_bytes: usize,
    current: String,
}

impl FrameBuilder {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            current: String::new(),
        }
    }

    /// Adds `line`, returning the previous frame if it had to be closed.
    pub fn push(&mut self, line: &str) -> Option<String> {
        let mut full = None;
        if !self.current.is_empty() && self.current.len() + 1 + line.len() > self.max_bytes {
            full = Some(std::mem::take(&mut self.current));
        }
        if !self.current.is_empty() {
            self.current.push('\n');
        }
        self.current.push_str(line);
        full
    }

    pub fn is_full(&self) -> bool {
        self.current.len() >= self.max_bytes
    }

    pub fn take(&mut self) -> Option<String> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_types::{CoId, KnownState};

    fn load(id: &str) -> SyncMessage {
        SyncMessage::Load(KnownState::empty(CoId::from_short_hash(id)))
    }

    #[test]
    fn frame_with_message_and_ping_decodes_both() {
        let frame = format!(
            "{}\n{}",
            encode_message(&load("a")).unwrap(),
            encode_control(&ControlMessage::ping()).unwrap()
        );
        let lines: Vec<FrameLine> = decode_frame(&frame).into_iter().map(Result::unwrap).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], FrameLine::Message(load("a")));
        assert!(matches!(lines[1], FrameLine::Control(ControlMessage::Ping { .. })));
    }

    #[test]
    fn bad_line_is_reported_alone() {
        let frame = format!("{{\"action\":\"nope\"}}\n{}", encode_message(&load("b")).unwrap());
        let lines = decode_frame(&frame);
        assert!(lines[0].is_err());
        assert!(lines[1].is_ok());
    }

    #[test]
    fn builder_splits_at_limit() {
        let mut builder = FrameBuilder::new(10);
        assert_eq!(builder.push("aaaa"), None);
        assert_eq!(builder.push("bbbb"), None);
        assert_eq!(builder.push("cccc"), Some("aaaa\nbbbb".to_string()));
        assert_eq!(builder.take(), Some("cccc".to_string()));
        assert_eq!(builder.take(), None);
    }

    #[test]
    fn oversized_line_goes_out_alone() {
        let mut builder = FrameBuilder::new(4);
        assert_eq!(builder.push("long line"), None);
        assert_eq!(builder.push("x"), Some("long line".to_string()));
        assert_eq!(frame_line_count("a\n\nb\n"), 2);
    }
}
