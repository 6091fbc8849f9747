//! BEP-10 extension protocol: the handshake dictionary that negotiates
//! per-connection extension message ids, plus the two extensions this
//! engine speaks over it.

pub mod exchange;
pub mod lt_tex;
pub mod ut_metadata;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;

pub const UT_METADATA: &str = "ut_metadata";
pub const LT_TEX: &str = "lt_tex";

/// The `m` dictionary plus the handful of top-level keys this engine
/// fills in or reads back. Unrecognized extensions in a peer's `m` are
/// simply never dispatched to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    pub m: BTreeMap<String, u8>,
    #[serde(rename = "metadata_size", default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(rename = "reqq", default, skip_serializing_if = "Option::is_none")]
    pub max_request_queue: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yourip: Option<ByteBuf>,
}

impl ExtendedHandshake {
    /// `private` is the torrent's private flag (only meaningful once
    /// metadata is known; a magnet with no metadata yet is never private).
    /// Per spec §4.3, a private torrent MUST NOT advertise `ut_metadata` or
    /// `lt_tex` at all — both extensions leak peers/trackers outside the
    /// torrent's own swarm, which is exactly what `private` forbids.
    pub fn supporting(metadata_size: Option<u32>, private: bool) -> Self {
        let mut m = BTreeMap::new();
        if !private {
            m.insert(UT_METADATA.to_string(), 1);
            m.insert(LT_TEX.to_string(), 2);
        }
        ExtendedHandshake {
            m,
            metadata_size,
            listen_port: None,
            client_version: Some("torrent-core".to_string()),
            max_request_queue: Some(500),
            yourip: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).context("failed to serialize extended handshake")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(bytes).context("failed to parse extended handshake")
    }

    pub fn remote_id_for(&self, name: &str) -> Option<u8> {
        self.m.get(name).copied()
    }
}

/// Maps extension names to the local message ids this engine advertises,
/// and tracks the remote ids a peer advertised back so outgoing messages
/// use the id the peer actually expects.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    local: BTreeMap<String, u8>,
    remote: BTreeMap<String, u8>,
}

impl ExtensionRegistry {
    pub fn new(local: ExtendedHandshake) -> Self {
        ExtensionRegistry { local: local.m, remote: BTreeMap::new() }
    }

    pub fn note_remote_handshake(&mut self, remote: &ExtendedHandshake) {
        self.remote = remote.m.clone();
    }

    pub fn local_id(&self, name: &str) -> Option<u8> {
        self.local.get(name).copied()
    }

    pub fn remote_id(&self, name: &str) -> Option<u8> {
        self.remote.get(name).copied()
    }

    pub fn name_for_local_id(&self, id: u8) -> Option<&str> {
        self.local
            .iter()
            .find(|(_, &local_id)| local_id == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn supports(&self, name: &str) -> bool {
        self.remote.contains_key(name)
    }
}
