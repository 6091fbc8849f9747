//! Magnet URI parsing. Invalid `so` ranges are ignored rather than
//! rejected; `tr.<N>` tiers only apply when every suffix parses as an
//! integer, otherwise the untiered `tr` list is used instead.

use crate::ids::InfoHash;
use anyhow::{bail, Result};
use url::Url;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MagnetUri {
    pub info_hash: Option<InfoHash>,
    pub display_name: Option<String>,
    /// Flattened tier list; tier index 0 is highest priority.
    pub trackers: Vec<Vec<String>>,
    pub web_seeds: Vec<String>,
    pub peer_endpoints: Vec<String>,
    pub dht_nodes: Vec<String>,
    /// Inclusive file-index ranges selected via `so=`, already validated
    /// (reversed or open-ended ranges are dropped silently).
    pub select_only: Vec<(u32, u32)>,
    /// Whether an `so=` key was present at all. `select_only` alone can't
    /// distinguish "no `so` given" (every file wanted) from "`so` given
    /// but every range was invalid" (no file wanted, boundary case 12).
    pub select_only_present: bool,
}

pub fn parse(uri: &str) -> Result<MagnetUri> {
    let url = Url::parse(uri)?;
    if url.scheme() != "magnet" {
        bail!("not a magnet uri");
    }

    let mut magnet = MagnetUri::default();
    // tier index -> list of trackers, built from tr / tr.<N>
    let mut untiered_trackers = Vec::new();
    let mut numbered_tiers: Vec<(u32, String)> = Vec::new();
    let mut saw_non_numeric_tr_suffix = false;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => parse_xt(&value, &mut magnet)?,
            "dn" => magnet.display_name = Some(value.into_owned()),
            "tr" => untiered_trackers.push(value.into_owned()),
            "ws" => magnet.web_seeds.push(value.into_owned()),
            "x.pe" => magnet.peer_endpoints.push(value.into_owned()),
            "dht" => magnet.dht_nodes.push(value.into_owned()),
            "so" => {
                magnet.select_only = parse_select_only(&value);
                magnet.select_only_present = true;
            }
            k if k.starts_with("tr.") => {
                let suffix = &k[3..];
                match suffix.parse::<u32>() {
                    Ok(n) => numbered_tiers.push((n, value.into_owned())),
                    Err(_) => saw_non_numeric_tr_suffix = true,
                }
            }
            _ => {}
        }
    }

    if magnet.info_hash.is_none() {
        bail!("missing_info_hash_in_uri");
    }

    if !numbered_tiers.is_empty() && !saw_non_numeric_tr_suffix {
        numbered_tiers.sort_by_key(|(n, _)| *n);
        let mut tiers: Vec<Vec<String>> = Vec::new();
        for (n, url) in numbered_tiers {
            let idx = n as usize;
            while tiers.len() <= idx {
                tiers.push(Vec::new());
            }
            tiers[idx].push(url);
        }
        magnet.trackers = tiers.into_iter().filter(|t| !t.is_empty()).collect();
    } else if !untiered_trackers.is_empty() {
        magnet.trackers = untiered_trackers.into_iter().map(|u| vec![u]).collect();
    }

    Ok(magnet)
}

fn parse_xt(value: &str, magnet: &mut MagnetUri) -> Result<()> {
    if let Some(hex_or_b32) = value.strip_prefix("urn:btih:") {
        let v1 = decode_hash(hex_or_b32, 40, 20)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&v1);
        magnet.info_hash = Some(match magnet.info_hash.take() {
            Some(InfoHash::V2(v2)) | Some(InfoHash::Hybrid { v2, .. }) => {
                InfoHash::Hybrid { v1: arr, v2 }
            }
            Some(InfoHash::V1(_)) | None => InfoHash::V1(arr),
        });
    } else if let Some(hex) = value.strip_prefix("urn:btmh:1220") {
        let v2 = decode_hash(hex, 64, 32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&v2);
        magnet.info_hash = Some(match magnet.info_hash.take() {
            Some(InfoHash::V1(v1)) => InfoHash::Hybrid { v1, v2: arr },
            _ => InfoHash::V2(arr),
        });
    }
    Ok(())
}

fn decode_hash(raw: &str, hex_len: usize, byte_len: usize) -> Result<Vec<u8>> {
    // `url`'s query_pairs() already percent-decodes values, so by the time
    // we get here a URL-encoded hash looks the same as a plain one.
    let decoded = raw.to_string();
    if decoded.len() == hex_len && decoded.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut out = Vec::with_capacity(byte_len);
        let bytes = decoded.as_bytes();
        for chunk in bytes.chunks(2) {
            let s = std::str::from_utf8(chunk)?;
            out.push(u8::from_str_radix(s, 16)?);
        }
        return Ok(out);
    }
    if decoded.len() == 32 {
        if let Some(bytes) = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &decoded) {
            if bytes.len() == byte_len {
                return Ok(bytes);
            }
        }
    }
    bail!("invalid_info_hash")
}

/// Parses `so=2,4-7` into validated inclusive ranges. Reversed ranges
/// (end < start) are dropped, not errors.
fn parse_select_only(value: &str) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((a, b)) = part.split_once('-') {
            if b.is_empty() {
                // "3-" open-ended range: no upper bound is knowable here,
                // drop it rather than guess.
                continue;
            }
            match (a.parse::<u32>(), b.parse::<u32>()) {
                (Ok(start), Ok(end)) if start <= end => ranges.push((start, end)),
                _ => continue,
            }
        } else if let Ok(n) = part.parse::<u32>() {
            ranges.push((n, n));
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_hex_hash_with_tracker_and_name() {
        let uri = "magnet:?xt=urn:btih:cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd&dn=foo&tr=http://t/a&tr=http://t/b";
        let m = parse(uri).unwrap();
        assert_eq!(m.display_name.as_deref(), Some("foo"));
        assert_eq!(m.trackers, vec![vec!["http://t/a".to_string()], vec!["http://t/b".to_string()]]);
        assert!(matches!(m.info_hash, Some(InfoHash::V1(_))));
    }

    #[test]
    fn missing_hash_is_an_error() {
        let uri = "magnet:?dn=foo";
        assert!(parse(uri).is_err());
    }

    #[test]
    fn invalid_hash_length_is_an_error() {
        let uri = "magnet:?xt=urn:btih:deadbeef";
        assert!(parse(uri).is_err());
    }

    #[test]
    fn so_parses_indices_and_ranges_and_drops_reversed() {
        let uri = "magnet:?xt=urn:btih:cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd&so=2,4-7,9-3";
        let m = parse(uri).unwrap();
        assert_eq!(m.select_only, vec![(2, 2), (4, 7)]);
    }

    #[test]
    fn so_open_ended_range_yields_no_selection() {
        let uri = "magnet:?xt=urn:btih:cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd&so=3-";
        let m = parse(uri).unwrap();
        assert!(m.select_only.is_empty());
        assert!(m.select_only_present);
    }

    #[test]
    fn missing_so_is_not_present() {
        let uri = "magnet:?xt=urn:btih:cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";
        let m = parse(uri).unwrap();
        assert!(!m.select_only_present);
    }

    #[test]
    fn numbered_tiers_respected_only_when_all_numeric() {
        let uri = "magnet:?xt=urn:btih:cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd&tr.0=http://a&tr.1=http://b";
        let m = parse(uri).unwrap();
        assert_eq!(m.trackers, vec![vec!["http://a".to_string()], vec!["http://b".to_string()]]);
    }
}
