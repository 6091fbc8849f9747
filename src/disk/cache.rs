//! The piece cache: blocks accumulate in memory as they arrive from peers,
//! get hashed incrementally as their prefix fills in, and are flushed to
//! storage once a piece is complete (or the cache is under memory
//! pressure). Modeled as one `CachedPiece` per in-progress piece rather
//! than a single flat buffer, since several pieces are downloaded
//! concurrently.

use crate::hashing::IncrementalSha1;
use crate::ids::DEFAULT_BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    Dirty,
    InFlightWrite,
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PieceFlags(u8);

impl PieceFlags {
    pub const HASHING_IN_PROGRESS: PieceFlags = PieceFlags(1 << 0);
    pub const FLUSH_IN_PROGRESS: PieceFlags = PieceFlags(1 << 1);
    pub const HASH_RETURNED: PieceFlags = PieceFlags(1 << 2);
    pub const FORCE_FLUSH: PieceFlags = PieceFlags(1 << 3);

    pub fn empty() -> Self {
        PieceFlags(0)
    }

    pub fn contains(self, flag: PieceFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: PieceFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: PieceFlags) {
        self.0 &= !flag.0;
    }
}

/// One piece's worth of in-memory block state. `hasher_cursor` is the
/// number of leading bytes already folded into `hasher`; blocks only
/// advance it when they arrive strictly in order, since SHA-1 cannot
/// hash out of order.
pub struct CachedPiece {
    pub piece_index: u32,
    pub piece_length: u32,
    pub block_size: u32,
    blocks: Vec<Option<Vec<u8>>>,
    pub block_states: Vec<BlockState>,
    pub hasher: IncrementalSha1,
    pub hasher_cursor: u32,
    pub flush_cursor: u32,
    pub refcount: u32,
    pub flags: PieceFlags,
}

impl CachedPiece {
    pub fn new(piece_index: u32, piece_length: u32) -> Self {
        Self::with_block_size(piece_index, piece_length, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(piece_index: u32, piece_length: u32, block_size: u32) -> Self {
        let block_count = piece_length.div_ceil(block_size) as usize;
        CachedPiece {
            piece_index,
            piece_length,
            block_size,
            blocks: vec![None; block_count],
            block_states: vec![BlockState::Empty; block_count],
            hasher: IncrementalSha1::new(),
            hasher_cursor: 0,
            flush_cursor: 0,
            refcount: 0,
            flags: PieceFlags::empty(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block_len(&self, block_index: usize) -> u32 {
        let start = block_index as u32 * self.block_size;
        self.block_size.min(self.piece_length - start)
    }

    /// Stores an arrived block and advances the rolling hash over any
    /// newly-contiguous prefix.
    pub fn put_block(&mut self, block_index: usize, data: Vec<u8>) {
        if self.block_states[block_index] == BlockState::Empty {
            self.block_states[block_index] = BlockState::Dirty;
        }
        self.blocks[block_index] = Some(data);
        self.advance_hasher();
    }

    fn advance_hasher(&mut self) {
        let mut cursor_block = (self.hasher_cursor / self.block_size) as usize;
        while cursor_block < self.blocks.len() {
            match &self.blocks[cursor_block] {
                Some(data) => {
                    self.hasher.update(data);
                    self.hasher_cursor += data.len() as u32;
                    cursor_block += 1;
                }
                None => break,
            }
        }
    }

    pub fn is_hash_ready(&self) -> bool {
        self.hasher_cursor == self.piece_length
    }

    /// Consumes the incremental hasher and marks the piece as having
    /// returned its hash, so a caller can't request it twice.
    pub fn finalize_hash(&mut self) -> Option<[u8; 20]> {
        if !self.is_hash_ready() || self.flags.contains(PieceFlags::HASH_RETURNED) {
            return None;
        }
        self.flags.insert(PieceFlags::HASH_RETURNED);
        Some(std::mem::replace(&mut self.hasher, IncrementalSha1::new()).finalize())
    }

    pub fn is_complete(&self) -> bool {
        self.block_states.iter().all(|s| *s != BlockState::Empty)
    }

    pub fn mark_block_in_flight(&mut self, block_index: usize) {
        self.block_states[block_index] = BlockState::InFlightWrite;
    }

    pub fn mark_block_clean(&mut self, block_index: usize) {
        self.block_states[block_index] = BlockState::Clean;
        self.blocks[block_index] = None;
    }

    pub fn dirty_block_count(&self) -> usize {
        self.block_states.iter().filter(|s| **s == BlockState::Dirty).count()
    }

    /// Contiguous dirty blocks from `flush_cursor` onward, ready to be
    /// written out as a single writev call.
    pub fn flushable_range(&self) -> Option<(u32, Vec<u8>)> {
        let start_block = (self.flush_cursor / self.block_size) as usize;
        let mut bytes = Vec::new();
        let mut block = start_block;
        while block < self.blocks.len() {
            match &self.blocks[block] {
                Some(data) if self.block_states[block] == BlockState::Dirty => {
                    bytes.extend_from_slice(data);
                    block += 1;
                }
                _ => break,
            }
        }
        if bytes.is_empty() {
            None
        } else {
            Some((self.flush_cursor, bytes))
        }
    }

    pub fn advance_flush_cursor(&mut self, flushed_len: u32) {
        self.flush_cursor += flushed_len;
    }
}
