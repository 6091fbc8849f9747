//! Per-peer protocol state: choke/interest bits, the outstanding request
//! queue with per-request timeouts, fast-extension bookkeeping, and the
//! smart-ban hash-comparison hook.

use crate::bitfield::Bitfield;
use crate::error::DisconnectReason;
use crate::hashing::salted_crc32;
use crate::ids::WirePeerId;
use crate::peer::connection::Connection;
use crate::peer::handshake::Capabilities;
use crate::peer::message::Message;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutstandingRequest {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// What handling one incoming wire message produced, for the owning
/// torrent/session loop to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    BlockReceived { piece: u32, begin: u32, data: Vec<u8> },
    BlockRequested { piece: u32, begin: u32, length: u32 },
    BlockCanceled { piece: u32, begin: u32, length: u32 },
    ExtendedMessage { ext_id: u8, payload: Vec<u8> },
}

struct PendingRequest {
    request: OutstandingRequest,
    requested_at: Instant,
}

pub struct PeerSession {
    pub connection: Connection,
    pub peer_id: Option<WirePeerId>,
    pub capabilities: Capabilities,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    pub peer_bitfield: Bitfield,
    /// Set once a fast-extension `have_all`/`have_none` is seen, so a
    /// later literal `bitfield` message is treated as a protocol error.
    pub fast_bitfield_seen: bool,
    pub peer_allowed_fast: HashSet<u32>,

    outstanding: VecDeque<PendingRequest>,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub request_timeout: Duration,

    /// Salts the per-block CRC used by the smart-ban heuristic so a
    /// malicious peer can't precompute a colliding block for a CRC it
    /// observed on the wire from another connection.
    smart_ban_salt: u32,
    pub suspected_bad_blocks: u32,
}

impl PeerSession {
    pub fn new(
        connection: Connection,
        piece_count: usize,
        request_timeout: Duration,
        smart_ban_salt: u32,
    ) -> PeerSession {
        PeerSession {
            connection,
            peer_id: None,
            capabilities: Capabilities::default(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: Bitfield::new(piece_count),
            fast_bitfield_seen: false,
            peer_allowed_fast: HashSet::new(),
            outstanding: VecDeque::new(),
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            request_timeout,
            smart_ban_salt,
            suspected_bad_blocks: 0,
        }
    }

    pub fn queue_request(&mut self, piece: u32, begin: u32, length: u32) {
        self.connection
            .queue_message(&Message::Request(piece, begin, length));
        self.outstanding.push_back(PendingRequest {
            request: OutstandingRequest { piece, begin, length },
            requested_at: Instant::now(),
        });
    }

    pub fn cancel_request(&mut self, piece: u32, begin: u32, length: u32) {
        self.connection
            .queue_message(&Message::Cancel(piece, begin, length));
        self.outstanding
            .retain(|r| r.request != OutstandingRequest { piece, begin, length });
    }

    /// Removes and returns every request that has been outstanding longer
    /// than `request_timeout`, for the caller to re-queue on another peer.
    pub fn timed_out_requests(&mut self) -> Vec<OutstandingRequest> {
        let now = Instant::now();
        let timeout = self.request_timeout;
        let mut expired = Vec::new();
        self.outstanding.retain(|r| {
            if now.duration_since(r.requested_at) > timeout {
                expired.push(r.request);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Salted CRC for a block this peer claimed to have sent, used by the
    /// smart-ban policy (session-level) to compare across peers.
    pub fn block_salted_crc(&self, piece: u32, begin: u32, data: &[u8]) -> u32 {
        let salt = self.smart_ban_salt ^ piece ^ begin;
        salted_crc32(salt, data)
    }

    /// Dispatches one decoded message, updating local protocol state and
    /// returning a `PeerEvent` for anything the caller needs to act on.
    pub fn handle_message(
        &mut self,
        message: Message,
    ) -> Result<Option<PeerEvent>, DisconnectReason> {
        match message {
            Message::KeepAlive => Ok(None),
            Message::Choke => {
                self.peer_choking = true;
                Ok(None)
            }
            Message::Unchoke => {
                self.peer_choking = false;
                Ok(None)
            }
            Message::Interested => {
                self.peer_interested = true;
                Ok(None)
            }
            Message::NotInterested => {
                self.peer_interested = false;
                Ok(None)
            }
            Message::Have(index) => {
                self.peer_bitfield.set(index as usize);
                Ok(None)
            }
            Message::Bitfield(payload) => {
                if self.fast_bitfield_seen {
                    return Err(DisconnectReason::ProtocolViolation(
                        "bitfield sent after have_all/have_none".to_string(),
                    ));
                }
                let piece_count = self.peer_bitfield.len();
                self.peer_bitfield = Bitfield::from_payload(&payload, piece_count)
                    .map_err(|_| DisconnectReason::InvalidMessage)?;
                Ok(None)
            }
            Message::Request(piece, begin, length) => {
                Ok(Some(PeerEvent::BlockRequested { piece, begin, length }))
            }
            Message::Piece(index, begin, block) => {
                let block_len = block.len() as u32;
                self.outstanding.retain(|r| {
                    r.request != OutstandingRequest { piece: index, begin, length: block_len }
                });
                self.downloaded_bytes += block.len() as u64;
                Ok(Some(PeerEvent::BlockReceived { piece: index, begin, data: block }))
            }
            Message::Cancel(piece, begin, length) => {
                Ok(Some(PeerEvent::BlockCanceled { piece, begin, length }))
            }
            Message::Port(_) | Message::Suggest(_) => Ok(None),
            Message::HaveAll => {
                if !self.capabilities.fast_extension {
                    return Err(DisconnectReason::ProtocolViolation(
                        "have_all without fast extension".to_string(),
                    ));
                }
                self.fast_bitfield_seen = true;
                for i in 0..self.peer_bitfield.len() {
                    self.peer_bitfield.set(i);
                }
                Ok(None)
            }
            Message::HaveNone => {
                if !self.capabilities.fast_extension {
                    return Err(DisconnectReason::ProtocolViolation(
                        "have_none without fast extension".to_string(),
                    ));
                }
                self.fast_bitfield_seen = true;
                Ok(None)
            }
            Message::Reject(piece, begin, length) => {
                self.outstanding
                    .retain(|r| r.request != OutstandingRequest { piece, begin, length });
                Ok(None)
            }
            Message::AllowedFast(index) => {
                self.peer_allowed_fast.insert(index);
                Ok(None)
            }
            Message::Extended(ext_id, payload) => {
                Ok(Some(PeerEvent::ExtendedMessage { ext_id, payload }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdStream};

    fn dummy_connection() -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = StdStream::connect(addr).unwrap();
        let (server_std, peer_addr) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        Connection::from_stream(mio::net::TcpStream::from_std(server_std), peer_addr)
    }

    fn session() -> PeerSession {
        PeerSession::new(dummy_connection(), 4, Duration::from_secs(30), 0xdead_beef)
    }

    #[test]
    fn choke_unchoke_updates_state() {
        let mut s = session();
        assert!(s.peer_choking);
        s.handle_message(Message::Unchoke).unwrap();
        assert!(!s.peer_choking);
        s.handle_message(Message::Choke).unwrap();
        assert!(s.peer_choking);
    }

    #[test]
    fn have_all_without_fast_extension_is_rejected() {
        let mut s = session();
        assert!(s.handle_message(Message::HaveAll).is_err());
    }

    #[test]
    fn have_all_with_fast_extension_marks_all_pieces() {
        let mut s = session();
        s.capabilities.fast_extension = true;
        s.handle_message(Message::HaveAll).unwrap();
        assert!(s.peer_bitfield.is_complete());
    }

    #[test]
    fn bitfield_after_have_all_is_protocol_violation() {
        let mut s = session();
        s.capabilities.fast_extension = true;
        s.handle_message(Message::HaveAll).unwrap();
        let payload = vec![0u8];
        assert!(s.handle_message(Message::Bitfield(payload)).is_err());
    }

    #[test]
    fn piece_message_clears_outstanding_request_and_emits_event() {
        let mut s = session();
        s.queue_request(0, 0, 4);
        assert_eq!(s.outstanding_count(), 1);
        let event = s
            .handle_message(Message::Piece(0, 0, vec![1, 2, 3, 4]))
            .unwrap();
        assert_eq!(s.outstanding_count(), 0);
        assert_eq!(
            event,
            Some(PeerEvent::BlockReceived { piece: 0, begin: 0, data: vec![1, 2, 3, 4] })
        );
    }

    #[test]
    fn request_from_peer_surfaces_as_event() {
        let mut s = session();
        let event = s.handle_message(Message::Request(1, 0, 16384)).unwrap();
        assert_eq!(event, Some(PeerEvent::BlockRequested { piece: 1, begin: 0, length: 16384 }));
    }
}
