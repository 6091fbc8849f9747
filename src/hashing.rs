//! Black-box hash primitives. Everything here is a thin wrapper around
//! `sha1`/`sha2`/`crc32fast` so the rest of the crate never names a hash
//! library directly.

use sha1::{Digest, Sha1};
use sha2::Sha256;

pub fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha256_of(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A running SHA-1 hasher used by the disk cache's hashing pipeline so
/// blocks can be fed in one at a time as they arrive.
#[derive(Default)]
pub struct IncrementalSha1 {
    inner: Sha1,
}

impl IncrementalSha1 {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; 20] {
        self.inner.finalize().into()
    }
}

/// Salted CRC32 used by the smart-ban heuristic: the salt keeps a
/// malicious peer from pre-computing a colliding block for a crc it can
/// observe on the wire.
pub fn salted_crc32(salt: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(salt);
    hasher.update(data);
    hasher.finalize()
}
