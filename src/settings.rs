//! The session-wide settings pack: a flat struct of tunables with a
//! `Default` impl, plus a sparse diff type for persisting only the
//! overridden fields.

use serde::{Deserialize, Serialize};

/// `unchoke_slots_limit == -1` means unlimited, `0` means none. Modeled
/// as its own type instead of a bare `i32` so that meaning is visible at
/// call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnchokeSlots(pub i32);

impl UnchokeSlots {
    pub const UNLIMITED: UnchokeSlots = UnchokeSlots(-1);
    pub const NONE: UnchokeSlots = UnchokeSlots(0);

    pub fn limit(self) -> Option<u32> {
        match self.0 {
            -1 => None,
            n if n >= 0 => Some(n as u32),
            _ => Some(0),
        }
    }
}

impl Default for UnchokeSlots {
    fn default() -> Self {
        UnchokeSlots(8)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPack {
    pub unchoke_slots_limit: UnchokeSlots,
    pub max_out_request_queue: u32,
    pub max_allowed_in_request_queue: u32,
    pub request_timeout_secs: u32,

    pub cache_size_blocks: u32,
    pub write_cache_line_size: u32,
    pub read_cache_line_size: u32,
    pub cache_expiry_secs: u32,
    pub allow_partial_disk_writes: bool,
    pub max_queued_disk_bytes: u64,
    pub aio_threads: u32,
    pub file_pool_size: u32,

    pub announce_to_all_trackers: bool,
    pub announce_to_all_tiers: bool,
    pub tracker_fail_limit: u32,
    pub stop_tracker_timeout_secs: u32,
    pub ignore_min_interval: bool,
    pub min_announce_interval_secs: u32,

    pub proxy_peer_connections: bool,
    pub proxy_tracker_connections: bool,

    pub end_game_threshold_pieces: u32,
    pub whole_pieces_threshold_blocks: u32,

    pub alert_queue_size: u32,
    pub duplicate_is_error: bool,
}

impl Default for SettingsPack {
    fn default() -> Self {
        SettingsPack {
            unchoke_slots_limit: UnchokeSlots::default(),
            max_out_request_queue: 500,
            max_allowed_in_request_queue: 250,
            request_timeout_secs: 60,

            cache_size_blocks: 4096,
            write_cache_line_size: 16,
            read_cache_line_size: 32,
            cache_expiry_secs: 60,
            allow_partial_disk_writes: false,
            max_queued_disk_bytes: 64 * 1024 * 1024,
            aio_threads: 4,
            file_pool_size: 40,

            announce_to_all_trackers: false,
            announce_to_all_tiers: false,
            tracker_fail_limit: 3,
            stop_tracker_timeout_secs: 10,
            ignore_min_interval: false,
            min_announce_interval_secs: 30,

            proxy_peer_connections: false,
            proxy_tracker_connections: false,

            end_game_threshold_pieces: 20,
            whole_pieces_threshold_blocks: 20,

            alert_queue_size: 1000,
            duplicate_is_error: false,
        }
    }
}

impl SettingsPack {
    /// Only the fields that differ from `Default` — used when writing the
    /// `settings` key of the session-state dictionary.
    pub fn diff_from_default(&self) -> SettingsDiff {
        let default = SettingsPack::default();
        let mut diff = SettingsDiff::default();
        if self.unchoke_slots_limit != default.unchoke_slots_limit {
            diff.unchoke_slots_limit = Some(self.unchoke_slots_limit.0);
        }
        if self.aio_threads != default.aio_threads {
            diff.aio_threads = Some(self.aio_threads);
        }
        if self.proxy_peer_connections != default.proxy_peer_connections {
            diff.proxy_peer_connections = Some(self.proxy_peer_connections);
        }
        if self.proxy_tracker_connections != default.proxy_tracker_connections {
            diff.proxy_tracker_connections = Some(self.proxy_tracker_connections);
        }
        if self.stop_tracker_timeout_secs != default.stop_tracker_timeout_secs {
            diff.stop_tracker_timeout_secs = Some(self.stop_tracker_timeout_secs);
        }
        diff
    }

    pub fn apply_diff(&mut self, diff: &SettingsDiff) {
        if let Some(v) = diff.unchoke_slots_limit {
            self.unchoke_slots_limit = UnchokeSlots(v);
        }
        if let Some(v) = diff.aio_threads {
            self.aio_threads = v;
        }
        if let Some(v) = diff.proxy_peer_connections {
            self.proxy_peer_connections = v;
        }
        if let Some(v) = diff.proxy_tracker_connections {
            self.proxy_tracker_connections = v;
        }
        if let Some(v) = diff.stop_tracker_timeout_secs {
            self.stop_tracker_timeout_secs = v;
        }
    }
}

/// A sparse view of `SettingsPack` carrying only the overridden keys; this
/// is what actually gets bencoded into the session-state `settings` dict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unchoke_slots_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aio_threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_peer_connections: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_tracker_connections: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_tracker_timeout_secs: Option<u32>,
}
