//! `torrent-core`: a BitTorrent protocol engine core — wire protocol,
//! block-oriented disk cache, tracker/announce, and the session/torrent
//! public surface tying them together.

pub mod alerts;
pub mod arena;
pub mod bitfield;
pub mod disk;
pub mod error;
pub mod hashing;
pub mod ids;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod resume;
pub mod session;
pub mod settings;
pub mod torrent;
pub mod tracker;
