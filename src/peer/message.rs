//! Wire message framing for the peer protocol: the base BitTorrent
//! messages (ids 0-9), the fast extension (BEP-6, ids 13-17), and the
//! extended-message envelope (BEP-10, id 20) that carries ut_metadata and
//! lt_tex payloads.

use std::io::{Error, ErrorKind};

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
    // BEP-6 fast extension
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(u32, u32, u32),
    AllowedFast(u32),
    // BEP-10 extension protocol: raw payload, decoded by the extension
    // registry once the handshake dictionary has been exchanged.
    Extended(u8, Vec<u8>),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => frame(0, &[]),
            Message::Unchoke => frame(1, &[]),
            Message::Interested => frame(2, &[]),
            Message::NotInterested => frame(3, &[]),
            Message::Have(index) => frame(4, &index.to_be_bytes()),
            Message::Bitfield(bitfield) => frame(5, bitfield),
            Message::Request(index, begin, length) => {
                frame(6, &request_payload(*index, *begin, *length))
            }
            Message::Piece(index, begin, block) => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(7, &payload)
            }
            Message::Cancel(index, begin, length) => {
                frame(8, &request_payload(*index, *begin, *length))
            }
            Message::Port(port) => frame(9, &port.to_be_bytes()),
            Message::Suggest(index) => frame(13, &index.to_be_bytes()),
            Message::HaveAll => frame(14, &[]),
            Message::HaveNone => frame(15, &[]),
            Message::Reject(index, begin, length) => {
                frame(16, &request_payload(*index, *begin, *length))
            }
            Message::AllowedFast(index) => frame(17, &index.to_be_bytes()),
            Message::Extended(ext_id, payload) => {
                let mut body = Vec::with_capacity(1 + payload.len());
                body.push(*ext_id);
                body.extend_from_slice(payload);
                frame(20, &body)
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
        if data.len() < 4 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "message missing length prefix",
            ));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[0..4]);
        let declared_len = u32::from_be_bytes(len_bytes) as usize;
        if declared_len == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.len() < 4 + declared_len {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "message shorter than declared length",
            ));
        }

        let id = data[4];
        let payload = &data[5..4 + declared_len];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(read_u32(payload, "have")?),
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                let (index, begin, length) = read_request_payload(payload, "request")?;
                Message::Request(index, begin, length)
            }
            7 => {
                if payload.len() < 8 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "piece message too short",
                    ));
                }
                let index = read_u32(&payload[0..4], "piece index")?;
                let begin = read_u32(&payload[4..8], "piece begin")?;
                Message::Piece(index, begin, payload[8..].to_vec())
            }
            8 => {
                let (index, begin, length) = read_request_payload(payload, "cancel")?;
                Message::Cancel(index, begin, length)
            }
            9 => {
                if payload.len() != 2 {
                    return Err(Error::new(ErrorKind::InvalidData, "port message malformed"));
                }
                let mut port = [0u8; 2];
                port.copy_from_slice(payload);
                Message::Port(u16::from_be_bytes(port))
            }
            13 => Message::Suggest(read_u32(payload, "suggest")?),
            14 => Message::HaveAll,
            15 => Message::HaveNone,
            16 => {
                let (index, begin, length) = read_request_payload(payload, "reject")?;
                Message::Reject(index, begin, length)
            }
            17 => Message::AllowedFast(read_u32(payload, "allowed fast")?),
            20 => {
                if payload.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "extended message missing extension id",
                    ));
                }
                Message::Extended(payload[0], payload[1..].to_vec())
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown message id {id}"),
                ))
            }
        };
        Ok(msg)
    }

    pub fn id(&self) -> u8 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(_, _, _) => 6,
            Message::Piece(_, _, _) => 7,
            Message::Cancel(_, _, _) => 8,
            Message::Port(_) => 9,
            Message::Suggest(_) => 13,
            Message::HaveAll => 14,
            Message::HaveNone => 15,
            Message::Reject(_, _, _) => 16,
            Message::AllowedFast(_) => 17,
            Message::Extended(_, _) => 20,
        }
    }

    /// Size of the payload following the message id, not counting the
    /// 4-byte length prefix or the id byte itself.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bitfield) => bitfield.len(),
            Message::Request(_, _, _) => 12,
            Message::Piece(_, _, block) => 8 + block.len(),
            Message::Cancel(_, _, _) => 12,
            Message::Port(_) => 2,
            Message::Suggest(_) => 4,
            Message::HaveAll | Message::HaveNone => 0,
            Message::Reject(_, _, _) => 12,
            Message::AllowedFast(_) => 4,
            Message::Extended(_, payload) => 1 + payload.len(),
        }
    }
}

/// Builds the standard `<length u32><id u8><payload>` frame. The length
/// prefix covers the id byte plus the payload and must be a full 4-byte
/// big-endian `u32`, since payloads (bitfields, blocks) routinely exceed
/// 255 bytes.
fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = 1u32 + payload.len() as u32;
    let mut msg = Vec::with_capacity(4 + len as usize);
    msg.extend_from_slice(&len.to_be_bytes());
    msg.push(id);
    msg.extend_from_slice(payload);
    msg
}

fn request_payload(index: u32, begin: u32, length: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&index.to_be_bytes());
    buf[4..8].copy_from_slice(&begin.to_be_bytes());
    buf[8..12].copy_from_slice(&length.to_be_bytes());
    buf
}

fn read_u32(bytes: &[u8], what: &str) -> Result<u32, Error> {
    if bytes.len() != 4 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("{what} message malformed"),
        ));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(buf))
}

fn read_request_payload(payload: &[u8], what: &str) -> Result<(u32, u32, u32), Error> {
    if payload.len() != 12 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("{what} message malformed"),
        ));
    }
    let index = read_u32(&payload[0..4], what)?;
    let begin = read_u32(&payload[4..8], what)?;
    let length = read_u32(&payload[8..12], what)?;
    Ok((index, begin, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_roundtrip() {
        let msg = Message::KeepAlive;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn choke_roundtrip() {
        let msg = Message::Choke;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::Choke);
    }

    #[test]
    fn large_bitfield_length_prefix_does_not_truncate() {
        // A bitfield payload over 255 bytes exercises the bug where a u8
        // cast on the length prefix would wrap and corrupt framing.
        let bitfield = vec![0xffu8; 300];
        let msg = Message::Bitfield(bitfield.clone());
        let bytes = msg.serialize();
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[0..4]);
        assert_eq!(u32::from_be_bytes(len_bytes), 301);
        let parsed = Message::deserialize(&bytes).unwrap();
        assert_eq!(parsed, Message::Bitfield(bitfield));
    }

    #[test]
    fn large_piece_block_roundtrip() {
        let block = vec![0xabu8; 16384];
        let msg = Message::Piece(3, 0, block.clone());
        let bytes = msg.serialize();
        let parsed = Message::deserialize(&bytes).unwrap();
        assert_eq!(parsed, Message::Piece(3, 0, block));
    }

    #[test]
    fn fast_extension_messages_roundtrip() {
        for msg in [
            Message::Suggest(7),
            Message::HaveAll,
            Message::HaveNone,
            Message::Reject(1, 2, 3),
            Message::AllowedFast(9),
        ] {
            let bytes = msg.serialize();
            assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn extended_message_roundtrip() {
        let msg = Message::Extended(0, b"d1:md11:ut_metadatai1eee".to_vec());
        let bytes = msg.serialize();
        assert_eq!(bytes[4], 20);
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_message_id_is_an_error() {
        let bytes = vec![0, 0, 0, 1, 200];
        assert!(Message::deserialize(&bytes).is_err());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let bytes = vec![0, 0, 0, 13, 6, 1, 2, 3];
        assert!(Message::deserialize(&bytes).is_err());
    }
}
