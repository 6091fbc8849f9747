//! The fixed 68-byte handshake record. Reserved-byte bit flags are decoded
//! into a `Capabilities` struct instead of being thrown away, since the
//! peer session needs them to know whether to expect an extended
//! handshake, DHT port message, or fast-extension messages.

use std::io::{Error, ErrorKind};

pub const PROTOCOL_ID: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Capability bits carried in the handshake's 8 reserved bytes: extension
/// protocol (byte 5, bit 0x10), DHT (byte 7, bit 0x01), fast extension
/// (byte 7, bit 0x04), hybrid/v2 (byte 7, bit 0x08).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub extension_protocol: bool,
    pub dht: bool,
    pub fast_extension: bool,
    pub hybrid_v2: bool,
}

impl Capabilities {
    pub fn to_reserved_bytes(self) -> [u8; 8] {
        let mut reserved = [0u8; 8];
        if self.extension_protocol {
            reserved[5] |= 0x10;
        }
        if self.dht {
            reserved[7] |= 0x01;
        }
        if self.fast_extension {
            reserved[7] |= 0x04;
        }
        if self.hybrid_v2 {
            reserved[7] |= 0x08;
        }
        reserved
    }

    pub fn from_reserved_bytes(reserved: &[u8; 8]) -> Self {
        Capabilities {
            extension_protocol: reserved[5] & 0x10 != 0,
            dht: reserved[7] & 0x01 != 0,
            fast_extension: reserved[7] & 0x04 != 0,
            hybrid_v2: reserved[7] & 0x08 != 0,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], capabilities: Capabilities) -> Handshake {
        Handshake {
            reserved: capabilities.to_reserved_bytes(),
            info_hash,
            peer_id,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_reserved_bytes(&self.reserved)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() < HANDSHAKE_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake must be 68 bytes long",
            ));
        }
        if bytes[0] as usize != PROTOCOL_ID.len() || &bytes[1..20] != PROTOCOL_ID.as_bytes() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "unsupported protocol identifier",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HANDSHAKE_LEN];
        bytes[0] = PROTOCOL_ID.len() as u8;
        bytes[1..20].copy_from_slice(PROTOCOL_ID.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Checks the info-hash matches what we expect; returns `false` rather
    /// than disconnecting so the caller can pick the disconnect reason.
    pub fn matches_info_hash(&self, expected: &[u8; 20]) -> bool {
        &self.info_hash == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_fields() {
        let caps = Capabilities {
            extension_protocol: true,
            dht: true,
            fast_extension: true,
            hybrid_v2: false,
        };
        let hs = Handshake::new([7; 20], [9; 20], caps);
        let bytes = hs.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        let parsed = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, hs);
        assert_eq!(parsed.capabilities(), caps);
    }

    #[test]
    fn rejects_wrong_protocol_identifier() {
        let mut bytes = Handshake::new([1; 20], [2; 20], Capabilities::default()).to_bytes();
        bytes[1] = b'X';
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(Handshake::from_bytes(&[0; 10]).is_err());
    }

    #[test]
    fn matches_info_hash() {
        let hs = Handshake::new([5; 20], [1; 20], Capabilities::default());
        assert!(hs.matches_info_hash(&[5; 20]));
        assert!(!hs.matches_info_hash(&[6; 20]));
    }
}
