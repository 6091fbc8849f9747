//! Stateful orchestration for the two extensions, on top of the
//! wire-format types in `ut_metadata`/`lt_tex`: which piece to request
//! next, per-peer backoff, and when metadata is complete and verified.
//! One instance of each state lives per torrent (metadata exchange stops
//! mattering once metadata is known; tracker exchange runs for the
//! torrent's whole life).

use crate::hashing::sha1_of;
use crate::ids::InfoHash;
use crate::peer::extensions::ut_metadata::{piece_count, METADATA_PIECE_SIZE};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub const METADATA_TOTAL_SIZE_CAP: u32 = 500 * 1024;
pub const MAX_OUTSTANDING_METADATA_REQUESTS_PER_PEER: u32 = 2;
const NO_DATA_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct MetadataExchangeState {
    total_size: Option<u32>,
    pieces: Vec<Option<Vec<u8>>>,
    request_counts: Vec<u32>,
    outstanding_per_peer: HashMap<u64, u32>,
    backed_off_until: HashMap<u64, Instant>,
}

impl MetadataExchangeState {
    pub fn new() -> Self {
        MetadataExchangeState {
            total_size: None,
            pieces: Vec::new(),
            request_counts: Vec::new(),
            outstanding_per_peer: HashMap::new(),
            backed_off_until: HashMap::new(),
        }
    }

    /// A peer's extended handshake reporting `metadata_size` initializes
    /// the piece table. Oversized metadata is rejected outright per the
    /// 500 KiB cap; the caller should disconnect the peer that offered it.
    pub fn on_metadata_size(&mut self, total_size: u32) -> Result<(), ()> {
        if total_size > METADATA_TOTAL_SIZE_CAP {
            return Err(());
        }
        if self.total_size.is_none() {
            self.total_size = Some(total_size);
            self.pieces = vec![None; piece_count(total_size) as usize];
            self.request_counts = vec![0; self.pieces.len()];
        }
        Ok(())
    }

    pub fn is_size_known(&self) -> bool {
        self.total_size.is_some()
    }

    /// Picks the least-requested missing piece (ties broken by lowest
    /// index), refusing to exceed the per-peer outstanding-request cap.
    /// Before the size is known, piece 0 is the only valid request (the
    /// empty-request-count-array special case from the source this was
    /// distilled from).
    pub fn next_request_for_peer(&mut self, peer: u64, now: Instant) -> Option<u32> {
        if let Some(&until) = self.backed_off_until.get(&peer) {
            if now < until {
                return None;
            }
        }
        let outstanding = self.outstanding_per_peer.entry(peer).or_insert(0);
        if *outstanding >= MAX_OUTSTANDING_METADATA_REQUESTS_PER_PEER {
            return None;
        }
        if !self.is_size_known() {
            *outstanding += 1;
            return Some(0);
        }
        let piece = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, data)| data.is_none())
            .min_by_key(|&(i, _)| (self.request_counts[i], i))
            .map(|(i, _)| i as u32)?;
        self.request_counts[piece as usize] += 1;
        *outstanding += 1;
        Some(piece)
    }

    pub fn on_reject(&mut self, peer: u64, now: Instant) {
        if let Some(count) = self.outstanding_per_peer.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }
        self.backed_off_until.insert(peer, now + NO_DATA_BACKOFF);
    }

    /// Stores a received chunk. Returns `Ok(Some(bytes))` once every piece
    /// has arrived (the caller still needs to verify the SHA-1 against
    /// the info-hash before trusting it).
    pub fn on_data(&mut self, peer: u64, piece: u32, payload: Vec<u8>) -> Option<Vec<u8>> {
        if let Some(count) = self.outstanding_per_peer.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            *slot = Some(payload);
        }
        if !self.pieces.is_empty() && self.pieces.iter().all(|p| p.is_some()) {
            Some(self.pieces.iter().flatten().flatten().copied().collect())
        } else {
            None
        }
    }

    /// Verifies assembled metadata bytes against the torrent's info-hash.
    /// On mismatch the caller should call `clear` and keep trying other
    /// peers, per spec's metadata-failed-keeps-retrying rule.
    pub fn verify(bytes: &[u8], info_hash: &InfoHash) -> bool {
        info_hash.v1().is_some_and(|expected| sha1_of(bytes) == *expected)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.pieces {
            *slot = None;
        }
        self.request_counts.iter_mut().for_each(|c| *c = 0);
    }
}

impl Default for MetadataExchangeState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct TrackerExchangeState {
    /// Every tracker URL this torrent has ever accepted, in the order
    /// learned — used both for `list_hash` and as the send candidate set.
    known: Vec<String>,
    shareable: HashSet<String>,
    already_sent: HashMap<u64, HashSet<String>>,
}

impl TrackerExchangeState {
    pub fn new() -> Self {
        TrackerExchangeState::default()
    }

    /// Registers a tracker this torrent knows about. `shareable` mirrors
    /// spec's `fail_limit != 0 || verified` filter: unverified trackers
    /// straight from the original `.torrent` (fail_limit 0 until they've
    /// either succeeded once or been retried) are tracked but withheld.
    pub fn add_known_tracker(&mut self, url: String, shareable: bool) {
        if !self.known.contains(&url) {
            self.known.push(url.clone());
        }
        if shareable {
            self.shareable.insert(url);
        } else {
            self.shareable.remove(&url);
        }
    }

    /// SHA-1 over the sorted, deduplicated URL list, included in this
    /// torrent's extension handshake under `tr` so two peers with an
    /// identical tracker set can skip exchanging anything at all.
    pub fn list_hash(&self) -> [u8; 20] {
        let mut sorted: Vec<&str> = self.known.iter().map(|s| s.as_str()).collect();
        sorted.sort_unstable();
        sorted.dedup();
        sha1_of(sorted.join("\n").as_bytes())
    }

    pub fn build_message_for_peer(&mut self, peer: u64, peer_list_hash: Option<[u8; 20]>) -> Option<crate::peer::extensions::lt_tex::TrackerExchangeMessage> {
        if peer_list_hash == Some(self.list_hash()) {
            return None;
        }
        let shareable: Vec<String> = self.known.iter().filter(|u| self.shareable.contains(*u)).cloned().collect();
        let sent = self.already_sent.entry(peer).or_default();
        let message = crate::peer::extensions::lt_tex::build_message(&shareable, sent)?;
        sent.extend(message.added.iter().cloned());
        Some(message)
    }

    /// Received trackers are added as tex-sourced per spec: `fail_limit =
    /// 3`, `send_stats = false`. The caller (torrent/session layer) is
    /// responsible for actually constructing the `AnnounceEntry`; this
    /// just reports which URLs are new.
    pub fn on_received(&mut self, added: Vec<String>) -> Vec<String> {
        added.into_iter().filter(|url| !self.known.contains(url)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_size_over_cap_is_rejected() {
        let mut state = MetadataExchangeState::new();
        assert!(state.on_metadata_size(METADATA_TOTAL_SIZE_CAP + 1).is_err());
    }

    #[test]
    fn unknown_size_always_requests_piece_zero() {
        let mut state = MetadataExchangeState::new();
        let now = Instant::now();
        assert_eq!(state.next_request_for_peer(1, now), Some(0));
    }

    #[test]
    fn per_peer_outstanding_cap_enforced() {
        let mut state = MetadataExchangeState::new();
        state.on_metadata_size(METADATA_PIECE_SIZE * 3).unwrap();
        let now = Instant::now();
        assert!(state.next_request_for_peer(1, now).is_some());
        assert!(state.next_request_for_peer(1, now).is_some());
        assert!(state.next_request_for_peer(1, now).is_none());
    }

    #[test]
    fn reject_backs_off_peer_for_a_minute() {
        let mut state = MetadataExchangeState::new();
        state.on_metadata_size(METADATA_PIECE_SIZE).unwrap();
        let now = Instant::now();
        state.next_request_for_peer(1, now);
        state.on_reject(1, now);
        assert!(state.next_request_for_peer(1, now).is_none());
        assert!(state.next_request_for_peer(1, now + Duration::from_secs(61)).is_some());
    }

    #[test]
    fn assembling_all_pieces_completes_and_verifies() {
        let mut state = MetadataExchangeState::new();
        let data = b"hello world metadata bytes".to_vec();
        state.on_metadata_size(data.len() as u32).unwrap();
        let assembled = state.on_data(1, 0, data.clone());
        assert_eq!(assembled, Some(data.clone()));
        let info_hash = InfoHash::V1(sha1_of(&data));
        assert!(MetadataExchangeState::verify(&data, &info_hash));
    }

    #[test]
    fn list_hash_is_stable_regardless_of_insertion_order() {
        let mut a = TrackerExchangeState::new();
        a.add_known_tracker("http://b".to_string(), true);
        a.add_known_tracker("http://a".to_string(), true);
        let mut b = TrackerExchangeState::new();
        b.add_known_tracker("http://a".to_string(), true);
        b.add_known_tracker("http://b".to_string(), true);
        assert_eq!(a.list_hash(), b.list_hash());
    }

    #[test]
    fn unshareable_tracker_withheld_from_message() {
        let mut state = TrackerExchangeState::new();
        state.add_known_tracker("http://original".to_string(), false);
        state.add_known_tracker("http://verified".to_string(), true);
        let msg = state.build_message_for_peer(1, None).unwrap();
        assert_eq!(msg.added, vec!["http://verified".to_string()]);
    }

    #[test]
    fn matching_list_hash_skips_sending_entirely() {
        let mut state = TrackerExchangeState::new();
        state.add_known_tracker("http://a".to_string(), true);
        let hash = state.list_hash();
        assert!(state.build_message_for_peer(1, Some(hash)).is_none());
    }
}
