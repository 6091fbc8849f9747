//! `lt_tex`: the libtorrent tracker-exchange extension. Peers gossip
//! trackers they know about for a torrent instead of only the node's own
//! `announce-list`, which helps torrents recover when their original
//! trackers go dark.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerExchangeMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
}

impl TrackerExchangeMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).context("failed to serialize lt_tex message")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(bytes).context("failed to parse lt_tex message")
    }
}

/// Caps how many tracker URLs a single outgoing message carries, so a
/// chatty peer can't be used to smuggle an unbounded payload through this
/// extension.
pub const MAX_TRACKERS_PER_MESSAGE: usize = 50;

pub fn build_message(known_trackers: &[String], already_sent: &std::collections::HashSet<String>) -> Option<TrackerExchangeMessage> {
    let added: Vec<String> = known_trackers
        .iter()
        .filter(|t| !already_sent.contains(*t))
        .take(MAX_TRACKERS_PER_MESSAGE)
        .cloned()
        .collect();
    if added.is_empty() {
        None
    } else {
        Some(TrackerExchangeMessage { added })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn roundtrip() {
        let msg = TrackerExchangeMessage { added: vec!["http://a/announce".to_string()] };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(TrackerExchangeMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn build_message_skips_already_sent() {
        let known = vec!["http://a".to_string(), "http://b".to_string()];
        let mut sent = HashSet::new();
        sent.insert("http://a".to_string());
        let msg = build_message(&known, &sent).unwrap();
        assert_eq!(msg.added, vec!["http://b".to_string()]);
    }

    #[test]
    fn build_message_returns_none_when_nothing_new() {
        let known = vec!["http://a".to_string()];
        let mut sent = HashSet::new();
        sent.insert("http://a".to_string());
        assert!(build_message(&known, &sent).is_none());
    }
}
