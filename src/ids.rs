//! Identifiers used throughout the engine: info-hashes, wire peer ids, and
//! arena-indexed handles using generation-checked tokens instead of
//! reference counting.

use std::fmt;

/// 20-byte SHA-1 info-hash (v1) and/or 32-byte SHA-256 info-hash (v2).
///
/// Equality compares whichever variants both sides carry; a torrent is
/// considered "the same" if either hash matches.
#[derive(Debug, Clone, Eq)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
    Hybrid { v1: [u8; 20], v2: [u8; 32] },
}

impl InfoHash {
    pub fn v1(&self) -> Option<&[u8; 20]> {
        match self {
            InfoHash::V1(h) => Some(h),
            InfoHash::Hybrid { v1, .. } => Some(v1),
            InfoHash::V2(_) => None,
        }
    }

    pub fn v2(&self) -> Option<&[u8; 32]> {
        match self {
            InfoHash::V2(h) => Some(h),
            InfoHash::Hybrid { v2, .. } => Some(v2),
            InfoHash::V1(_) => None,
        }
    }

    /// Hex-encodes the v1 hash if present, else the v2 hash. Used for log
    /// lines and magnet round-tripping.
    pub fn to_hex(&self) -> String {
        match self {
            InfoHash::V1(h) => hex_encode(h),
            InfoHash::V2(h) => hex_encode(h),
            InfoHash::Hybrid { v1, .. } => hex_encode(v1),
        }
    }
}

impl PartialEq for InfoHash {
    fn eq(&self, other: &Self) -> bool {
        let v1_match = match (self.v1(), other.v1()) {
            (Some(a), Some(b)) => Some(a == b),
            _ => None,
        };
        let v2_match = match (self.v2(), other.v2()) {
            (Some(a), Some(b)) => Some(a == b),
            _ => None,
        };
        match (v1_match, v2_match) {
            (Some(a), Some(b)) => a || b,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => false,
        }
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// The 20-byte peer id exchanged on the wire, distinct from the session's
/// internal `PeerId` arena token.
pub type WirePeerId = [u8; 20];

pub fn generate_wire_peer_id() -> WirePeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-TC0001-");
    let mut rng = rand::thread_rng();
    rng.fill(&mut id[8..]);
    id
}

/// An opaque `(index, generation)` token. Slots are recycled on removal; a
/// handle whose generation no longer matches the live slot is treated as
/// invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

pub type TorrentId = ArenaId;
pub type PeerId = ArenaId;

pub type PieceIndex = u32;
pub type BlockIndex = u32;

pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_equality_v1_only() {
        let a = InfoHash::V1([1; 20]);
        let b = InfoHash::V1([1; 20]);
        let c = InfoHash::V1([2; 20]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn info_hash_equality_hybrid_matches_v1_side() {
        let hybrid = InfoHash::Hybrid { v1: [9; 20], v2: [7; 32] };
        let v1_only = InfoHash::V1([9; 20]);
        assert_eq!(hybrid, v1_only);
    }

    #[test]
    fn info_hash_equality_hybrid_matches_v2_side() {
        let hybrid = InfoHash::Hybrid { v1: [9; 20], v2: [7; 32] };
        let v2_only = InfoHash::V2([7; 32]);
        assert_eq!(hybrid, v2_only);
    }
}
