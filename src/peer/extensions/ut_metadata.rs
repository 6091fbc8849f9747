//! BEP-9 `ut_metadata`: fetching `info` dict pieces from peers for
//! magnet-link torrents, 16 KiB at a time.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const METADATA_PIECE_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Request,
    Data,
    Reject,
}

impl MsgType {
    fn code(self) -> u8 {
        match self {
            MsgType::Request => 0,
            MsgType::Data => 1,
            MsgType::Reject => 2,
        }
    }

    fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(MsgType::Request),
            1 => Ok(MsgType::Data),
            2 => Ok(MsgType::Reject),
            other => Err(anyhow!("unknown ut_metadata msg_type {other}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    msg_type: i64,
    piece: i64,
    #[serde(default, rename = "total_size", skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UtMetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, payload: Vec<u8> },
    Reject { piece: u32 },
}

impl UtMetadataMessage {
    /// `ut_metadata` messages are a bencoded dict immediately followed (for
    /// `Data`) by the raw metadata bytes with no length prefix of its own —
    /// the bencode dict's natural termination on `e` marks the boundary.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            UtMetadataMessage::Request { piece } => serde_bencode::to_bytes(&Header {
                msg_type: MsgType::Request.code() as i64,
                piece: *piece as i64,
                total_size: None,
            })
            .context("failed to serialize ut_metadata request"),
            UtMetadataMessage::Reject { piece } => serde_bencode::to_bytes(&Header {
                msg_type: MsgType::Reject.code() as i64,
                piece: *piece as i64,
                total_size: None,
            })
            .context("failed to serialize ut_metadata reject"),
            UtMetadataMessage::Data { piece, total_size, payload } => {
                let mut bytes = serde_bencode::to_bytes(&Header {
                    msg_type: MsgType::Data.code() as i64,
                    piece: *piece as i64,
                    total_size: Some(*total_size as i64),
                })
                .context("failed to serialize ut_metadata data header")?;
                bytes.extend_from_slice(payload);
                Ok(bytes)
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // Parse only the leading bencode dict; any trailing bytes are the
        // raw metadata payload for a `Data` message. serde_bencode has no
        // streaming entry point that reports how much it consumed, so the
        // dict boundary is found by hand before handing that slice to it.
        let consumed = bencode_dict_end(bytes)?;
        let header: Header = serde_bencode::from_bytes(&bytes[..consumed])
            .context("malformed ut_metadata header")?;
        let piece = header.piece as u32;
        match MsgType::from_code(header.msg_type)? {
            MsgType::Request => Ok(UtMetadataMessage::Request { piece }),
            MsgType::Reject => Ok(UtMetadataMessage::Reject { piece }),
            MsgType::Data => {
                let total_size = header
                    .total_size
                    .ok_or_else(|| anyhow!("ut_metadata data missing total_size"))?
                    as u32;
                Ok(UtMetadataMessage::Data {
                    piece,
                    total_size,
                    payload: bytes[consumed..].to_vec(),
                })
            }
        }
    }
}

/// How many 16 KiB pieces make up a metadata blob of `total_size` bytes.
pub fn piece_count(total_size: u32) -> u32 {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Returns the index just past the end of the single bencoded value (dict,
/// list, int, or string) starting at `bytes[0]`, without deserializing it.
fn bencode_value_end(bytes: &[u8]) -> Result<usize> {
    match bytes.first() {
        Some(b'd') | Some(b'l') => {
            let mut pos = 1;
            loop {
                if bytes.get(pos) == Some(&b'e') {
                    return Ok(pos + 1);
                }
                if pos >= bytes.len() {
                    return Err(anyhow!("truncated bencode container"));
                }
                pos += bencode_value_end(&bytes[pos..])?;
            }
        }
        Some(b'i') => {
            let end = bytes
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| anyhow!("truncated bencode integer"))?;
            Ok(end + 1)
        }
        Some(b'0'..=b'9') => {
            let colon = bytes
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| anyhow!("malformed bencode string length"))?;
            let len: usize = std::str::from_utf8(&bytes[..colon])?.parse()?;
            let start = colon + 1;
            if start + len > bytes.len() {
                return Err(anyhow!("truncated bencode string"));
            }
            Ok(start + len)
        }
        _ => Err(anyhow!("unrecognized bencode value")),
    }
}

fn bencode_dict_end(bytes: &[u8]) -> Result<usize> {
    if bytes.first() != Some(&b'd') {
        return Err(anyhow!("ut_metadata message does not start with a dict"));
    }
    bencode_value_end(bytes)
}
