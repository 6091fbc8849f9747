//! Parsed `.torrent` metainfo: tiered tracker lists, pad files, and v1/v2
//! hash handling on top of the `Info`/`File` field set deserialized with
//! `serde_bencode`.

use crate::hashing::sha1_of;
use crate::ids::InfoHash;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize)]
pub struct Node(pub String, pub i64);

/// One file within a (possibly multi-file) torrent.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    /// v1 BEP-47 pad files: bytes inserted only to align the next real file
    /// to a piece boundary. Pad files are never wanted.
    #[serde(default, rename = "attr")]
    pub attr: Option<String>,
    /// Per-file SHA-256 root, present on v2/hybrid torrents.
    #[serde(default, rename = "pieces root")]
    pub pieces_root: Option<ByteBuf>,
}

impl FileEntry {
    pub fn is_pad_file(&self) -> bool {
        self.attr.as_deref().is_some_and(|a| a.contains('p'))
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    #[serde(default)]
    pub pieces: Option<ByteBuf>,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default)]
    pub private: Option<u8>,
    #[serde(default)]
    pub path: Option<Vec<String>>,
    /// v2 BEP-52 root hash of the file tree's merkle tree.
    #[serde(default, rename = "meta version")]
    pub meta_version: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MetaInfo {
    pub info: Info,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    httpseeds: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    #[serde(rename = "comment")]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
    /// BEP-19 web seeds, carried end-to-end but not fetched from by this
    /// core.
    #[serde(default, rename = "url-list")]
    url_list: Option<UrlList>,
}

/// `url-list` may be a single string or a list of strings in the wild.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl MetaInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let meta: MetaInfo = from_bytes(bytes).context("failed to deserialize torrent")?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// Invariants: piece_count * piece_length >= total_size >
    /// (piece_count - 1) * piece_length; every file has a non-empty path;
    /// total size is the sum of file sizes.
    fn validate(&self) -> Result<()> {
        if self.info.piece_length <= 0 || !(self.info.piece_length as u64).is_power_of_two() {
            bail!("piece length must be a power of two");
        }
        const MAX_PIECE_LENGTH: i64 = 16 * 1024 * 1024;
        if self.info.piece_length > MAX_PIECE_LENGTH {
            bail!("piece length exceeds implementation limit");
        }
        for file in self.files() {
            if file.path.is_empty() || file.path.iter().any(|c| c.is_empty()) {
                bail!("file has an empty path component");
            }
        }
        if let Some(pieces) = &self.info.pieces {
            let piece_count = pieces.len() / 20;
            if piece_count > 0 {
                let total = self.length();
                let piece_length = self.info.piece_length;
                if (piece_count as i64) * piece_length < total
                    || total <= ((piece_count as i64) - 1) * piece_length
                {
                    bail!("piece count / piece length disagree with total size");
                }
            }
        }
        Ok(())
    }

    pub fn info_hash(&self) -> InfoHash {
        let bytes = to_bytes(&self.info).expect("info dict always serializes");
        InfoHash::V1(sha1_of(&bytes))
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    /// Tiered tracker list. Falls back to the single `announce` URL as
    /// tier 0 when no `announce-list` is present, per BEP-12.
    pub fn tiered_trackers(&self) -> Vec<Vec<String>> {
        if let Some(list) = &self.announce_list {
            if !list.is_empty() {
                return list.clone();
            }
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }

    pub fn web_seeds(&self) -> Vec<String> {
        match &self.url_list {
            Some(UrlList::One(s)) => vec![s.clone()],
            Some(UrlList::Many(v)) => v.clone(),
            None => Vec::new(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.info.private.unwrap_or(0) != 0
    }

    pub fn length(&self) -> i64 {
        if let Some(length) = self.info.length {
            length
        } else {
            self.info
                .files
                .as_ref()
                .map(|files| files.iter().map(|f| f.length).sum())
                .unwrap_or(0)
        }
    }

    pub fn piece_length(&self) -> i64 {
        self.info.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.info
            .pieces
            .as_ref()
            .map(|p| p.len() / 20)
            .unwrap_or(0)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        match &self.info.pieces {
            Some(pieces) => pieces
                .chunks(20)
                .map(|chunk| {
                    let mut array = [0u8; 20];
                    array.copy_from_slice(chunk);
                    array
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn is_v2(&self) -> bool {
        self.info.meta_version == Some(2)
    }

    /// Single- and multi-file torrents are normalized to one file list: a
    /// single-file torrent is presented as one `FileEntry` named after
    /// `info.name`.
    pub fn files(&self) -> Vec<FileEntry> {
        if let Some(files) = &self.info.files {
            files.clone()
        } else {
            vec![FileEntry {
                path: vec![self.info.name.clone()],
                length: self.info.length.unwrap_or(0),
                md5sum: self.info.md5sum.clone(),
                attr: None,
                pieces_root: None,
            }]
        }
    }
}

#[cfg(test)]
impl MetaInfo {
    /// Test-only constructor for other modules' fixtures: the wire fields
    /// are private so round-tripping always goes through `from_bytes`,
    /// but unit tests elsewhere need a cheap `Info`-only `MetaInfo`.
    pub(crate) fn for_tests(info: Info) -> Self {
        MetaInfo {
            info,
            announce: None,
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
            url_list: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetaInfo {
        MetaInfo {
            info: Info {
                name: "test".to_string(),
                pieces: Some(ByteBuf::from(vec![0u8; 40])),
                piece_length: 16384,
                md5sum: None,
                length: Some(20000),
                files: None,
                private: None,
                path: None,
                meta_version: None,
            },
            announce: Some("http://tracker.example/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: Some(vec![
                vec!["http://a/announce".to_string()],
                vec!["http://b/announce".to_string(), "http://c/announce".to_string()],
            ]),
            creation_date: None,
            comment: None,
            created_by: None,
            url_list: None,
        }
    }

    #[test]
    fn tiered_trackers_prefers_announce_list() {
        let meta = sample();
        let tiers = meta.tiered_trackers();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[1].len(), 2);
    }

    #[test]
    fn length_falls_back_to_announce_when_no_list() {
        let mut meta = sample();
        meta.announce_list = None;
        let tiers = meta.tiered_trackers();
        assert_eq!(tiers, vec![vec!["http://tracker.example/announce".to_string()]]);
    }

    #[test]
    fn single_file_normalized_into_files_list() {
        let meta = sample();
        let files = meta.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].length, 20000);
    }

    #[test]
    fn validate_rejects_non_power_of_two_piece_length() {
        let mut meta = sample();
        meta.info.piece_length = 12345;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn pad_file_detection() {
        let f = FileEntry {
            path: vec![".pad".to_string(), "0".to_string()],
            length: 100,
            md5sum: None,
            attr: Some("p".to_string()),
            pieces_root: None,
        };
        assert!(f.is_pad_file());
    }
}
