//! Piece-selection policy. Placement mirrors the teacher's `picker.rs`
//! (a piece picker given a bitfield and peer connections), but the body
//! is new: the teacher's file was never filled in beyond its imports.
//!
//! `PiecePicker` only decides *which piece* (and, within a piece, which
//! block) to request next; actually sending the request and tracking
//! timeouts is `peer::session::PeerSession`'s job.

use crate::bitfield::Bitfield;
use crate::ids::{BlockIndex, PieceIndex, DEFAULT_BLOCK_SIZE};
use crate::torrent::Priority;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    RarestFirst,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub piece: PieceIndex,
    pub block: BlockIndex,
}

/// Per-piece bookkeeping the picker needs across peers: how many peers
/// have it (rarity), how many blocks are outstanding, and an optional
/// time-critical deadline.
#[derive(Debug, Clone, Default)]
struct PieceState {
    availability: u32,
    blocks_requested: u32,
    blocks_total: u32,
    deadline_rank: Option<u32>,
}

pub struct PiecePicker {
    mode: DownloadMode,
    end_game_threshold: usize,
    whole_pieces_threshold_blocks: u32,
    piece_states: Vec<PieceState>,
    /// Blocks currently outstanding to at least one peer, piece-affinity
    /// being "this piece already has blocks in flight".
    in_flight: HashMap<BlockId, Vec<u64>>,
    /// Monotonic ordering used to break rarity ties with a stable, not
    /// re-randomized-per-call, shuffle.
    tie_break: Vec<u32>,
}

impl PiecePicker {
    /// `total_size` is the torrent's total byte length, needed to compute
    /// the true (shorter) block count of the last piece — every other
    /// piece is exactly `piece_size` bytes.
    pub fn new(
        piece_count: usize,
        piece_size: u32,
        total_size: u64,
        end_game_threshold: usize,
        whole_pieces_threshold_blocks: u32,
        shuffle_seed: u64,
    ) -> Self {
        let mut piece_states = Vec::with_capacity(piece_count);
        for i in 0..piece_count {
            piece_states.push(PieceState {
                blocks_total: block_count(i, piece_size, total_size),
                ..PieceState::default()
            });
        }
        let mut tie_break: Vec<u32> = (0..piece_count as u32).collect();
        shuffle_stable(&mut tie_break, shuffle_seed);
        PiecePicker {
            mode: DownloadMode::RarestFirst,
            end_game_threshold,
            whole_pieces_threshold_blocks,
            piece_states,
            in_flight: HashMap::new(),
            tie_break,
        }
    }

    pub fn set_mode(&mut self, mode: DownloadMode) {
        self.mode = mode;
    }

    pub fn on_peer_have(&mut self, piece: usize) {
        if let Some(state) = self.piece_states.get_mut(piece) {
            state.availability += 1;
        }
    }

    pub fn on_peer_lost(&mut self, piece: usize) {
        if let Some(state) = self.piece_states.get_mut(piece) {
            state.availability = state.availability.saturating_sub(1);
        }
    }

    pub fn set_deadline(&mut self, piece: usize, rank: u32) {
        if let Some(state) = self.piece_states.get_mut(piece) {
            state.deadline_rank = Some(rank);
        }
    }

    /// Picks the next block to request from a peer offering `peer_has`,
    /// skipping pieces that are fully present, priority-zero, or (outside
    /// end-game) already fully requested. `in_flight_peer` identifies the
    /// requesting peer so a single peer isn't handed the same block twice.
    pub fn pick_block(
        &mut self,
        peer_has: &Bitfield,
        present: &Bitfield,
        priorities: &[Priority],
        requesting_peer: u64,
    ) -> Option<BlockId> {
        let piece = self.pick_piece(peer_has, present, priorities)?;
        self.pick_block_in_piece(piece, requesting_peer)
    }

    fn pick_piece(&self, peer_has: &Bitfield, present: &Bitfield, priorities: &[Priority]) -> Option<usize> {
        let end_game = self.remaining_wanted(present, priorities) <= self.end_game_threshold;

        let candidates = self.tie_break.iter().map(|&i| i as usize).filter(|&piece| {
            if !peer_has.has_piece(piece) || present.has_piece(piece) {
                return false;
            }
            let wanted = priorities.get(piece).map(|p| p.is_wanted()).unwrap_or(true);
            if !wanted {
                return false;
            }
            let state = &self.piece_states[piece];
            let fully_requested = state.blocks_total > 0 && state.blocks_requested >= state.blocks_total;
            end_game || !fully_requested
        });

        // Deadlines always jump the queue. Filter to pieces that actually
        // have one first: `None` sorts below `Some(_)` in `Option`'s `Ord`,
        // so an unfiltered `min_by_key` would prefer a deadline-less piece.
        if let Some(piece) = candidates
            .clone()
            .filter(|&p| self.piece_states[p].deadline_rank.is_some())
            .min_by_key(|&p| self.piece_states[p].deadline_rank)
        {
            return Some(piece);
        }

        if self.mode == DownloadMode::Sequential {
            return candidates.min();
        }

        let top_priority = candidates
            .clone()
            .map(|p| priorities.get(p).copied().unwrap_or_default())
            .max()?;

        let at_top_priority: Vec<usize> = candidates
            .filter(|&p| priorities.get(p).copied().unwrap_or_default() == top_priority)
            .collect();

        // Whole-pieces / partial-piece affinity: prefer a piece that
        // already has blocks in flight (at or above the configured
        // threshold counts the same as "prefer", just stronger).
        if let Some(&affine) = at_top_priority
            .iter()
            .filter(|&&p| self.piece_states[p].blocks_requested > 0)
            .max_by_key(|&&p| self.piece_states[p].blocks_requested.min(self.whole_pieces_threshold_blocks))
        {
            return Some(affine);
        }

        // Rarest-first among the rest.
        at_top_priority
            .into_iter()
            .min_by_key(|&p| self.piece_states[p].availability)
    }

    /// Picks the first never-requested block in `piece`. Handing out a
    /// second copy of an already-outstanding block is `duplicate_request`'s
    /// job, not this one's.
    fn pick_block_in_piece(&mut self, piece: usize, requesting_peer: u64) -> Option<BlockId> {
        let state = self.piece_states.get_mut(piece)?;
        for block in 0..state.blocks_total {
            let id = BlockId { piece: piece as u32, block };
            let holders = self.in_flight.entry(id).or_default();
            if holders.is_empty() {
                state.blocks_requested += 1;
                holders.push(requesting_peer);
                return Some(id);
            }
        }
        None
    }

    /// End-game duplication: once under threshold, hand out a copy of an
    /// already-outstanding block to a second peer. The first delivery
    /// should cancel the rest via `on_block_cancel_others`.
    pub fn duplicate_request(&mut self, present: &Bitfield, priorities: &[Priority], requesting_peer: u64) -> Option<BlockId> {
        if self.in_flight_count() == 0 || self.remaining_wanted(present, priorities) > self.end_game_threshold {
            return None;
        }
        let candidate = self
            .in_flight
            .iter()
            .find(|(id, holders)| {
                !present.has_piece(id.piece as usize) && !holders.contains(&requesting_peer)
            })
            .map(|(&id, _)| id)?;
        self.in_flight.get_mut(&candidate)?.push(requesting_peer);
        Some(candidate)
    }

    pub fn on_block_received(&mut self, id: BlockId) {
        self.in_flight.remove(&id);
    }

    /// Returns the set of peers whose now-redundant requests for `id`
    /// should be cancelled, having already received the block elsewhere.
    pub fn on_block_delivered_elsewhere(&mut self, id: BlockId, deliverer: u64) -> Vec<u64> {
        match self.in_flight.remove(&id) {
            Some(holders) => holders.into_iter().filter(|&p| p != deliverer).collect(),
            None => Vec::new(),
        }
    }

    /// A failed hash verification frees every block of the piece so it
    /// can be re-requested, per spec's `async_clear_piece` behavior.
    pub fn clear_piece(&mut self, piece: usize) {
        if let Some(state) = self.piece_states.get_mut(piece) {
            state.blocks_requested = 0;
        }
        self.in_flight.retain(|id, _| id.piece as usize != piece);
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn remaining_wanted(&self, present: &Bitfield, priorities: &[Priority]) -> usize {
        (0..present.len())
            .filter(|&i| !present.has_piece(i) && priorities.get(i).map(|p| p.is_wanted()).unwrap_or(true))
            .count()
    }
}

/// Every piece is `piece_size` bytes except (possibly) the last, which is
/// whatever's left of `total_size` — per spec §3, total size exceeds
/// `(piece_count - 1) * piece_length` by at most `piece_length`.
fn block_count(piece_index: usize, piece_size: u32, total_size: u64) -> u32 {
    let piece_start = piece_index as u64 * piece_size as u64;
    let piece_len = total_size.saturating_sub(piece_start).min(piece_size as u64).max(1);
    (piece_len as u32).div_ceil(DEFAULT_BLOCK_SIZE).max(1)
}

/// Deterministic Fisher-Yates using a splitmix64-derived stream, so tie
/// ordering is stable across runs given the same seed rather than
/// re-randomized every pick.
fn shuffle_stable(items: &mut [u32], seed: u64) {
    let mut state = seed;
    for i in (1..items.len()).rev() {
        state = state.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
        let r = (state >> 33) as usize % (i + 1);
        items.swap(i, r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bitfield(n: usize) -> Bitfield {
        let mut bf = Bitfield::new(n);
        for i in 0..n {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn sequential_mode_picks_lowest_index() {
        let mut picker = PiecePicker::new(4, 16 * 1024, 4 * 16 * 1024, 0, 4, 1);
        picker.set_mode(DownloadMode::Sequential);
        let peer_has = full_bitfield(4);
        let present = Bitfield::new(4);
        let priorities = vec![Priority::default(); 4];
        let block = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        assert_eq!(block.piece, 0);
    }

    #[test]
    fn priority_zero_piece_never_picked() {
        let mut picker = PiecePicker::new(2, 16 * 1024, 2 * 16 * 1024, 0, 4, 1);
        let peer_has = full_bitfield(2);
        let present = Bitfield::new(2);
        let priorities = vec![Priority::DO_NOT_DOWNLOAD, Priority::TOP];
        let block = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        assert_eq!(block.piece, 1);
    }

    #[test]
    fn rarest_first_prefers_less_available_piece() {
        let mut picker = PiecePicker::new(2, 16 * 1024, 2 * 16 * 1024, 0, 4, 1);
        picker.on_peer_have(0);
        picker.on_peer_have(0);
        picker.on_peer_have(1);
        let peer_has = full_bitfield(2);
        let present = Bitfield::new(2);
        let priorities = vec![Priority::default(); 2];
        let block = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        assert_eq!(block.piece, 1);
    }

    #[test]
    fn same_block_not_handed_twice_to_same_peer() {
        let piece_size = DEFAULT_BLOCK_SIZE * 2;
        let mut picker = PiecePicker::new(1, piece_size, piece_size as u64, 0, 8, 1);
        let peer_has = full_bitfield(1);
        let present = Bitfield::new(1);
        let priorities = vec![Priority::default(); 1];
        let first = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        let second = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn end_game_duplicates_outstanding_block() {
        let mut picker = PiecePicker::new(1, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE as u64, 1, 8, 1);
        let peer_has = full_bitfield(1);
        let present = Bitfield::new(1);
        let priorities = vec![Priority::default(); 1];
        let first = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        let dup = picker.duplicate_request(&present, &priorities, 2).unwrap();
        assert_eq!(first, dup);
    }

    #[test]
    fn clear_piece_frees_blocks_for_rerequest() {
        let mut picker = PiecePicker::new(1, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE as u64, 0, 8, 1);
        let peer_has = full_bitfield(1);
        let present = Bitfield::new(1);
        let priorities = vec![Priority::default(); 1];
        picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        picker.clear_piece(0);
        let again = picker.pick_block(&peer_has, &present, &priorities, 2);
        assert!(again.is_some());
    }

    #[test]
    fn last_piece_shorter_than_piece_size_has_fewer_blocks() {
        // Two pieces of 2 blocks each, but total_size only covers 1 block
        // of the second piece — the last piece must report 1 block, not 2,
        // or pick_block_in_piece would hand out a request for bytes past EOF.
        let piece_size = DEFAULT_BLOCK_SIZE * 2;
        let total_size = piece_size as u64 + DEFAULT_BLOCK_SIZE as u64;
        let mut picker = PiecePicker::new(2, piece_size, total_size, 0, 8, 1);
        let peer_has = full_bitfield(2);
        let present = Bitfield::new(2);
        let priorities = vec![Priority::default(); 2];

        let mut seen = Vec::new();
        while let Some(block) = picker.pick_block(&peer_has, &present, &priorities, 1) {
            seen.push(block);
        }
        let last_piece_blocks: Vec<_> = seen.iter().filter(|b| b.piece == 1).collect();
        assert_eq!(last_piece_blocks.len(), 1);
        assert!(last_piece_blocks.iter().all(|b| b.block == 0));
    }

    #[test]
    fn delivered_elsewhere_returns_other_holders_to_cancel() {
        let mut picker = PiecePicker::new(1, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE as u64, 1, 8, 1);
        let peer_has = full_bitfield(1);
        let present = Bitfield::new(1);
        let priorities = vec![Priority::default(); 1];
        let id = picker.pick_block(&peer_has, &present, &priorities, 1).unwrap();
        picker.duplicate_request(&present, &priorities, 2);
        let to_cancel = picker.on_block_delivered_elsewhere(id, 1);
        assert_eq!(to_cancel, vec![2]);
    }
}
