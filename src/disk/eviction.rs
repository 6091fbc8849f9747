//! Cache eviction: once the cache holds more blocks than
//! `cache_size_blocks` allows, clean (already-flushed) pieces with no
//! outstanding reader are evicted least-recently-used first. Dirty or
//! referenced pieces are never evicted — they must be flushed or released
//! first.

use crate::ids::PieceIndex;
use std::collections::HashMap;

pub struct EvictionTracker {
    last_touched: HashMap<PieceIndex, u64>,
    tick: u64,
}

impl EvictionTracker {
    pub fn new() -> Self {
        EvictionTracker { last_touched: HashMap::new(), tick: 0 }
    }

    pub fn touch(&mut self, piece: PieceIndex) {
        self.tick += 1;
        self.last_touched.insert(piece, self.tick);
    }

    pub fn forget(&mut self, piece: PieceIndex) {
        self.last_touched.remove(&piece);
    }

    /// Picks eviction candidates from `evictable` (pieces the caller has
    /// already filtered to clean + unreferenced) until `blocks_to_free`
    /// blocks worth of cache would be reclaimed, oldest-touched first.
    pub fn pick_victims(
        &self,
        evictable: &[(PieceIndex, u32)],
        mut blocks_to_free: u32,
    ) -> Vec<PieceIndex> {
        let mut ordered: Vec<&(PieceIndex, u32)> = evictable.iter().collect();
        ordered.sort_by_key(|(piece, _)| self.last_touched.get(piece).copied().unwrap_or(0));

        let mut victims = Vec::new();
        for (piece, block_count) in ordered {
            if blocks_to_free == 0 {
                break;
            }
            victims.push(*piece);
            blocks_to_free = blocks_to_free.saturating_sub(*block_count);
        }
        victims
    }
}

impl Default for EvictionTracker {
    fn default() -> Self {
        Self::new()
    }
}
