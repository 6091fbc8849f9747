//! Error *kinds*, not a single flat error type. Peer-local parsing errors
//! are matchable enums consumed by `handle_incoming`; the session-facing
//! surface wraps these in `anyhow` so callers get a readable chain.

use std::fmt;

/// Why a peer connection was torn down. Matched by the peer session and the
/// banning policy; never fatal to the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    InvalidInfoHash,
    InvalidMessage,
    UnknownMessageId(u8),
    MalformedHandshake,
    MetadataTooLarge,
    BannedForBadData,
    Timeout,
    ProtocolViolation(String),
    PeerClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::InvalidInfoHash => write!(f, "invalid_info_hash"),
            DisconnectReason::InvalidMessage => write!(f, "invalid_message"),
            DisconnectReason::UnknownMessageId(id) => write!(f, "unknown message id {id}"),
            DisconnectReason::MalformedHandshake => write!(f, "malformed handshake"),
            DisconnectReason::MetadataTooLarge => write!(f, "metadata too large"),
            DisconnectReason::BannedForBadData => {
                write!(f, "banning peer for sending bad data")
            }
            DisconnectReason::Timeout => write!(f, "timeout"),
            DisconnectReason::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            DisconnectReason::PeerClosed => write!(f, "peer closed connection"),
        }
    }
}

impl std::error::Error for DisconnectReason {}

/// Errors surfaced synchronously from `Session::add_torrent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTorrentError {
    MismatchingInfoHash,
    DuplicateTorrent,
    InvalidMagnet(String),
}

impl fmt::Display for AddTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddTorrentError::MismatchingInfoHash => write!(f, "mismatching_info_hash"),
            AddTorrentError::DuplicateTorrent => write!(f, "duplicate_torrent"),
            AddTorrentError::InvalidMagnet(reason) => write!(f, "invalid magnet: {reason}"),
        }
    }
}

impl std::error::Error for AddTorrentError {}

/// Raised by any session API call made against a removed/recycled handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTorrentHandle;

impl fmt::Display for InvalidTorrentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid_torrent_handle")
    }
}

impl std::error::Error for InvalidTorrentHandle {}

/// A storage-layer failure. The affected piece stays dirty in-cache so the
/// caller can retry after corrective action; this type just carries the
/// diagnostic through to the alert.
#[derive(Debug)]
pub struct StorageError {
    pub path_hint: Option<String>,
    pub source: std::io::Error,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path_hint {
            Some(path) => write!(f, "storage error on {path}: {}", self.source),
            None => write!(f, "storage error: {}", self.source),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
