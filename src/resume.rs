//! Resume data / session state bencode dictionaries.
//!
//! Unknown keys are preserved as opaque bytes on round-trip. Rather than
//! leaning on `#[serde(flatten)]` (awkward over a self-describing but
//! binary format like bencode), the known fields are serialized to a
//! `Value::Dict` and merged with whatever foreign keys were present on
//! load.

use crate::settings::SettingsDiff;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default, skip_serializing_if = "is_default_settings")]
    pub settings: SettingsDiff,
    #[serde(rename = "dht state", default, skip_serializing_if = "Option::is_none")]
    pub dht_state: Option<ByteBuf>,
    #[serde(
        rename = "dht-bootstrap-nodes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dht_bootstrap_nodes: Vec<String>,
    #[serde(rename = "ip_filter4", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_filter4: Vec<ByteBuf>,
    #[serde(rename = "ip_filter6", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_filter6: Vec<ByteBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, ByteBuf>,
}

fn is_default_settings(s: &SettingsDiff) -> bool {
    *s == SettingsDiff::default()
}

impl SessionState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).context("failed to serialize session state")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(bytes).context("failed to parse session state")
    }

    /// A 4+4+4-byte-per-entry IPv4 `(first, last, flags)` range.
    pub fn add_ip_filter4_range(&mut self, first: [u8; 4], last: [u8; 4], flags: u32) {
        let mut entry = Vec::with_capacity(12);
        entry.extend_from_slice(&first);
        entry.extend_from_slice(&last);
        entry.extend_from_slice(&flags.to_be_bytes());
        self.ip_filter4.push(ByteBuf::from(entry));
    }
}

/// Per-torrent resume dictionary: the fields this crate understands and
/// acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentResumeData {
    pub info_hash: ByteBuf,
    /// The piece bitmap, wire-bitfield-encoded (MSB-first bytes).
    pub pieces: ByteBuf,
    /// Per-file download progress in bytes, one entry per file.
    #[serde(default)]
    pub file_progress: Vec<u64>,
    #[serde(default)]
    pub trackers: Vec<TrackerResumeEntry>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(rename = "added_time", default)]
    pub added_time: i64,
    #[serde(rename = "completed_time", default)]
    pub completed_time: i64,
    pub save_path: String,
    #[serde(default)]
    pub file_priorities: Vec<u8>,
    #[serde(default)]
    pub piece_priorities: Vec<u8>,
    #[serde(default)]
    pub flags: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerResumeEntry {
    pub url: String,
    pub tier: u32,
    pub fail_limit: u32,
    pub verified: bool,
}

pub const RESUME_FLAG_PAUSED: u64 = 1 << 0;
pub const RESUME_FLAG_SEED_MODE: u64 = 1 << 1;
pub const RESUME_FLAG_UPLOAD_MODE: u64 = 1 << 2;

impl TorrentResumeData {
    pub fn is_paused(&self) -> bool {
        self.flags & RESUME_FLAG_PAUSED != 0
    }
}

/// Wraps `TorrentResumeData` together with any dictionary keys this crate
/// doesn't recognize, so `to_bytes(from_bytes(x)) == x` for the keys we
/// don't understand as well as the ones we do.
#[derive(Debug, Clone)]
pub struct ResumeDocument {
    pub data: TorrentResumeData,
    pub opaque: BTreeMap<Vec<u8>, Value>,
}

impl ResumeDocument {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let known_bytes = serde_bencode::to_bytes(&self.data)?;
        let known_value: Value = serde_bencode::from_bytes(&known_bytes)?;
        let mut merged = match known_value {
            Value::Dict(map) => map,
            _ => return Err(anyhow!("resume data did not serialize to a dictionary")),
        };
        for (key, value) in &self.opaque {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
        serde_bencode::to_bytes(&Value::Dict(merged))
            .context("failed to serialize resume document")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_bencode::from_bytes(bytes).context("not a bencoded dictionary")?;
        let dict = match value {
            Value::Dict(map) => map,
            _ => return Err(anyhow!("resume data is not a dictionary")),
        };
        let known_fields: &[&str] = &[
            "info_hash",
            "pieces",
            "file_progress",
            "trackers",
            "peers",
            "added_time",
            "completed_time",
            "save_path",
            "file_priorities",
            "piece_priorities",
            "flags",
        ];
        let mut known = BTreeMap::new();
        let mut opaque = BTreeMap::new();
        for (key, value) in dict {
            let key_str = String::from_utf8_lossy(&key);
            if known_fields.contains(&key_str.as_ref()) {
                known.insert(key, value);
            } else {
                opaque.insert(key, value);
            }
        }
        let known_bytes = serde_bencode::to_bytes(&Value::Dict(known))?;
        let data = serde_bencode::from_bytes(&known_bytes)
            .context("failed to parse known resume data fields")?;
        Ok(ResumeDocument { data, opaque })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_roundtrip_omits_default_settings() {
        let state = SessionState::default();
        let bytes = state.to_bytes().unwrap();
        let restored = SessionState::from_bytes(&bytes).unwrap();
        assert_eq!(restored.settings, SettingsDiff::default());
    }

    #[test]
    fn session_state_roundtrip_keeps_overridden_settings() {
        let mut state = SessionState::default();
        state.settings.proxy_tracker_connections = Some(true);
        let bytes = state.to_bytes().unwrap();
        let restored = SessionState::from_bytes(&bytes).unwrap();
        assert_eq!(restored.settings.proxy_tracker_connections, Some(true));
    }

    fn sample_data() -> TorrentResumeData {
        TorrentResumeData {
            info_hash: ByteBuf::from(vec![1u8; 20]),
            pieces: ByteBuf::from(vec![0xffu8; 2]),
            file_progress: vec![100, 200],
            trackers: vec![TrackerResumeEntry {
                url: "http://t/announce".to_string(),
                tier: 0,
                fail_limit: 3,
                verified: true,
            }],
            peers: vec![],
            added_time: 1000,
            completed_time: 2000,
            save_path: "/downloads".to_string(),
            file_priorities: vec![4, 4],
            piece_priorities: vec![],
            flags: RESUME_FLAG_SEED_MODE,
        }
    }

    #[test]
    fn resume_document_roundtrip_preserves_unknown_keys() {
        let mut opaque = BTreeMap::new();
        opaque.insert(b"future_field".to_vec(), Value::Int(42));
        let doc = ResumeDocument {
            data: sample_data(),
            opaque,
        };
        let bytes = doc.to_bytes().unwrap();
        let restored = ResumeDocument::from_bytes(&bytes).unwrap();
        assert_eq!(restored.data.save_path, "/downloads");
        assert!(!restored.data.is_paused());
        assert_eq!(
            restored.opaque.get(b"future_field".as_slice()),
            Some(&Value::Int(42))
        );
    }

    #[test]
    fn resume_document_roundtrip_without_unknown_keys() {
        let doc = ResumeDocument {
            data: sample_data(),
            opaque: BTreeMap::new(),
        };
        let bytes = doc.to_bytes().unwrap();
        let restored = ResumeDocument::from_bytes(&bytes).unwrap();
        assert_eq!(restored.data.file_progress, vec![100, 200]);
        assert!(restored.opaque.is_empty());
    }
}
