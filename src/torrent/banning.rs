//! Smart-ban: attribute a hash-failed piece to the specific peer that
//! served the divergent block, instead of banning everyone who touched
//! it. Grounded on `hashing::salted_crc32` (the same salting scheme
//! `peer::session::PeerSession::block_salted_crc` uses per-connection)
//! and spec.md §4.3's "Banning policy (smart-ban)".

use crate::ids::{BlockIndex, PeerId, PieceIndex};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Recorded {
    peer: PeerId,
    crc: u32,
}

/// Per-torrent smart-ban ledger. Only pieces that have actually failed
/// verification accumulate entries here — passing pieces are never
/// recorded, since nothing needs attributing.
#[derive(Default)]
pub struct SmartBan {
    // Recorded senders per (piece, block) of a piece that has failed at
    // least once. Cleared once the piece passes and is reconciled.
    suspects: HashMap<(PieceIndex, BlockIndex), Vec<Recorded>>,
    failed_pieces: HashMap<PieceIndex, ()>,
}

impl SmartBan {
    pub fn new() -> Self {
        SmartBan::default()
    }

    /// Call when a piece fails hash verification: every block delivered
    /// for that piece this round becomes a suspect, keyed by whichever
    /// peer sent it and the salted crc recorded at receive time.
    pub fn on_piece_hash_failed(&mut self, piece: PieceIndex, deliveries: &[(BlockIndex, PeerId, u32)]) {
        self.failed_pieces.insert(piece, ());
        for &(block, peer, crc) in deliveries {
            self.suspects
                .entry((piece, block))
                .or_default()
                .push(Recorded { peer, crc });
        }
    }

    pub fn has_failed_before(&self, piece: PieceIndex) -> bool {
        self.failed_pieces.contains_key(&piece)
    }

    /// Call once a previously-failed piece passes verification. `salt`
    /// and `reread` let the caller recompute the same salted crc against
    /// freshly re-read disk contents for each suspect block; any peer
    /// whose recorded crc disagrees with the re-read is returned to ban.
    /// The ledger for this piece is cleared either way, since a passing
    /// piece has no further use for its suspect list.
    pub fn reconcile_on_pass<F>(&mut self, piece: PieceIndex, mut reread_crc: F) -> Vec<PeerId>
    where
        F: FnMut(BlockIndex) -> u32,
    {
        self.failed_pieces.remove(&piece);
        let mut banned = Vec::new();
        let keys: Vec<(PieceIndex, BlockIndex)> = self
            .suspects
            .keys()
            .copied()
            .filter(|&(p, _)| p == piece)
            .collect();
        for key in keys {
            let Some(recorded) = self.suspects.remove(&key) else { continue };
            let actual = reread_crc(key.1);
            for r in recorded {
                if r.crc != actual {
                    banned.push(r.peer);
                }
            }
        }
        banned
    }

    /// Drops all suspect entries for a piece without reconciling —
    /// used when a piece is cleared and will be re-downloaded from
    /// scratch rather than patched.
    pub fn forget_piece(&mut self, piece: PieceIndex) {
        self.failed_pieces.remove(&piece);
        self.suspects.retain(|&(p, _), _| p != piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ArenaId;

    fn peer(i: u32) -> PeerId {
        ArenaId { index: i, generation: 0 }
    }

    #[test]
    fn corrupt_peer_banned_when_crc_mismatches_on_reread() {
        let mut ban = SmartBan::new();
        let good = peer(1);
        let bad = peer(2);
        ban.on_piece_hash_failed(0, &[(0, good, 111), (1, bad, 222)]);
        assert!(ban.has_failed_before(0));

        // Re-read shows block 0's contents hash to 111 (matches good peer,
        // no change), but block 1 now hashes to 999 (someone else's
        // correct data replaced what `bad` had sent) — 222 != 999.
        let banned = ban.reconcile_on_pass(0, |block| if block == 0 { 111 } else { 999 });
        assert_eq!(banned, vec![bad]);
        assert!(!ban.has_failed_before(0));
    }

    #[test]
    fn no_bans_when_all_recorded_crcs_match_reread() {
        let mut ban = SmartBan::new();
        let a = peer(1);
        ban.on_piece_hash_failed(0, &[(0, a, 42)]);
        let banned = ban.reconcile_on_pass(0, |_| 42);
        assert!(banned.is_empty());
    }

    #[test]
    fn forget_piece_clears_suspects_without_banning() {
        let mut ban = SmartBan::new();
        let a = peer(1);
        ban.on_piece_hash_failed(0, &[(0, a, 1)]);
        ban.forget_piece(0);
        assert!(!ban.has_failed_before(0));
        let banned = ban.reconcile_on_pass(0, |_| 0);
        assert!(banned.is_empty());
    }

    #[test]
    fn unrelated_piece_not_affected_by_reconcile() {
        let mut ban = SmartBan::new();
        let a = peer(1);
        ban.on_piece_hash_failed(0, &[(0, a, 1)]);
        ban.on_piece_hash_failed(1, &[(0, a, 2)]);
        ban.reconcile_on_pass(0, |_| 1);
        assert!(ban.has_failed_before(1));
    }
}
