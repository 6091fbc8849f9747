//! Per-torrent state: the state machine, file/piece priorities and the
//! wanted set they imply, and the tiered tracker list. The piece-picker
//! policy itself lives in `picker`; the hash-failure attribution policy
//! lives in `banning`. This is the generalization of the teacher's
//! `torrent.rs`, which only ever held a parsed `.torrent` file — adding
//! the state machine and download bookkeeping spec.md §4.2 asks for.

pub mod banning;
pub mod picker;

use crate::bitfield::Bitfield;
use crate::ids::InfoHash;
use crate::metainfo::MetaInfo;
use crate::tracker::AnnounceEntry;
use serde::{Deserialize, Serialize};

/// File/piece download priority, 0 (do-not-download) through 7 (top,
/// served before anything else). Out-of-range values are clamped rather
/// than rejected, matching the tolerant handling the spec wants for
/// oversized `piece_priorities` arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const DO_NOT_DOWNLOAD: Priority = Priority(0);
    pub const TOP: Priority = Priority(7);

    pub fn new(value: u8) -> Priority {
        Priority(value.min(7))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_wanted(self) -> bool {
        self.0 > 0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(4)
    }
}

/// `spec.md` §4.2's eight states. Every variant but `Allocating` is
/// reachable through `Torrent::transition_*`; allocating is only entered
/// explicitly by a caller that pre-allocates disk space before checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    CheckingResumeData,
    DownloadingMetadata,
    CheckingFiles,
    CheckingFilesResume,
    Allocating,
    Downloading,
    Finished,
    Seeding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseMode {
    Running,
    /// Stops issuing new requests/announces but lets in-flight work and
    /// existing connections idle out naturally.
    Graceful,
    /// Stops immediately: no new requests, no new blocks accepted.
    Hard,
}

/// What `add_torrent` was given: either a fully parsed `.torrent`, or
/// just an info-hash (magnet state), plus the caller's overrides.
pub struct AddTorrentParams {
    pub info_hash: Option<InfoHash>,
    pub metainfo: Option<MetaInfo>,
    pub save_path: String,
    pub file_priorities: Vec<u8>,
    pub piece_priorities: Vec<u8>,
    pub trackers: Vec<Vec<String>>,
    /// Web seed URLs carried in end-to-end from a magnet's `ws=` params or
    /// resume data; merged with any the metainfo itself names once loaded.
    pub web_seeds: Vec<String>,
    /// Inclusive file-index ranges from a magnet's `so=`; applied to
    /// `file_priorities` once the file count is known (metainfo present,
    /// or later via `on_metadata_received`).
    pub select_only: Vec<(u32, u32)>,
    pub select_only_present: bool,
    pub paused: bool,
}

impl Default for AddTorrentParams {
    fn default() -> Self {
        AddTorrentParams {
            info_hash: None,
            metainfo: None,
            save_path: String::new(),
            file_priorities: Vec::new(),
            piece_priorities: Vec::new(),
            trackers: Vec::new(),
            web_seeds: Vec::new(),
            select_only: Vec::new(),
            select_only_present: false,
            paused: false,
        }
    }
}

pub struct Torrent {
    pub info_hash: InfoHash,
    pub metainfo: Option<MetaInfo>,
    pub save_path: String,
    pub state: TorrentState,
    pub pause_mode: PauseMode,
    /// True once a storage error has been observed on this torrent: pieces
    /// already on disk are still served, but nothing new is downloaded.
    pub upload_only: bool,

    pub pieces: Bitfield,
    pub file_priorities: Vec<Priority>,
    pub piece_priorities: Vec<Priority>,

    pub trackers: Vec<Vec<AnnounceEntry>>,
    pub web_seed_urls: Vec<String>,
    /// Web seeds supplied at add time (magnet `ws=` or resume data) that
    /// stay in effect even after metainfo-provided ones are merged in.
    magnet_web_seeds: Vec<String>,
    pub private: bool,

    pub select_only: Vec<(u32, u32)>,
    pub select_only_present: bool,

    pub added_time: i64,
    pub completed_time: i64,
}

impl Torrent {
    /// Builds the initial record for `add_torrent`. Does not itself
    /// decide `checking_resume_data` vs `downloading_metadata` — the
    /// session does that once it knows whether resume data was supplied,
    /// per the transition table in spec.md §4.2.
    pub fn new(params: AddTorrentParams, now_epoch: i64) -> Torrent {
        let private = params
            .metainfo
            .as_ref()
            .map(|m| m.is_private())
            .unwrap_or(false);
        let magnet_web_seeds = params.web_seeds.clone();
        let web_seed_urls = merge_web_seeds(
            params.metainfo.as_ref().map(|m| m.web_seeds()).unwrap_or_default(),
            &magnet_web_seeds,
        );
        let info_hash = params
            .info_hash
            .clone()
            .or_else(|| params.metainfo.as_ref().map(|m| m.info_hash()))
            .expect("add_torrent validates info_hash or metainfo is present");

        let piece_count = params.metainfo.as_ref().map(|m| m.piece_count()).unwrap_or(0);
        let file_count = params
            .metainfo
            .as_ref()
            .map(|m| m.files().len())
            .unwrap_or(0);

        let mut file_priorities = pad_or_truncate_priorities(&params.file_priorities, file_count);
        if file_count > 0 {
            apply_select_only(&mut file_priorities, &params.select_only, params.select_only_present);
        }

        let tracker_tiers: Vec<Vec<String>> = if !params.trackers.is_empty() {
            params.trackers.clone()
        } else {
            params
                .metainfo
                .as_ref()
                .map(|m| m.tiered_trackers())
                .unwrap_or_default()
        };
        let trackers = tracker_tiers
            .into_iter()
            .map(|tier| {
                tier.into_iter()
                    .map(|url| AnnounceEntry::new(url, 0, 3))
                    .collect()
            })
            .collect();

        let mut torrent = Torrent {
            info_hash,
            metainfo: params.metainfo,
            save_path: params.save_path,
            state: TorrentState::CheckingResumeData,
            pause_mode: if params.paused { PauseMode::Hard } else { PauseMode::Running },
            upload_only: false,
            pieces: Bitfield::new(piece_count),
            file_priorities,
            // A magnet without metadata discards any supplied piece
            // priorities and keeps them at zero until metadata arrives.
            piece_priorities: if piece_count == 0 {
                Vec::new()
            } else {
                truncate_to_piece_count(&params.piece_priorities, piece_count)
            },
            trackers,
            web_seed_urls,
            magnet_web_seeds,
            private,
            select_only: params.select_only,
            select_only_present: params.select_only_present,
            added_time: now_epoch,
            completed_time: 0,
        };
        if torrent.metainfo.is_none() {
            torrent.state = TorrentState::DownloadingMetadata;
        }
        torrent.recompute_piece_priorities_from_files();
        torrent
    }

    pub fn is_loaded(&self) -> bool {
        self.metainfo.is_some()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Recomputes `piece_priorities` from `file_priorities` whenever a
    /// file's priority changes, so the piece picker always consults a
    /// piece-indexed array instead of re-deriving it per pick. A piece
    /// spanned by files of different priorities takes the highest of the
    /// two, since downloading it serves the higher-priority file too.
    pub fn recompute_piece_priorities_from_files(&mut self) {
        let (Some(meta), false) = (&self.metainfo, self.file_priorities.is_empty()) else {
            return;
        };
        let piece_length = meta.piece_length().max(1);
        let piece_count = self.piece_count();
        if piece_count == 0 {
            return;
        }
        let mut priorities = vec![Priority::DO_NOT_DOWNLOAD; piece_count];
        let mut cursor: i64 = 0;
        for (file, &priority) in meta.files().iter().zip(self.file_priorities.iter()) {
            let file_priority = if file.is_pad_file() { Priority::DO_NOT_DOWNLOAD } else { priority };
            let start_piece = (cursor / piece_length) as usize;
            let end_piece = ((cursor + file.length - 1).max(cursor) / piece_length) as usize;
            for piece in start_piece..=end_piece.min(piece_count.saturating_sub(1)) {
                if file_priority > priorities[piece] {
                    priorities[piece] = file_priority;
                }
            }
            cursor += file.length;
        }
        self.piece_priorities = priorities;
    }

    pub fn set_file_priority(&mut self, file_index: usize, priority: Priority) {
        if let Some(slot) = self.file_priorities.get_mut(file_index) {
            *slot = priority;
            self.recompute_piece_priorities_from_files();
            self.reconcile_state_after_priority_change();
        }
    }

    /// Files with priority 0 are excluded from the wanted set.
    pub fn wanted_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count()).filter(|&i| {
            self.piece_priorities
                .get(i)
                .map(|p| p.is_wanted())
                .unwrap_or(true)
        })
    }

    pub fn is_wanted(&self, piece: usize) -> bool {
        self.piece_priorities.get(piece).map(|p| p.is_wanted()).unwrap_or(true)
    }

    /// True once every *wanted* piece is present (files with priority 0
    /// are excluded, per spec.md's `downloading -> finished` transition).
    pub fn has_all_wanted(&self) -> bool {
        self.wanted_pieces().all(|i| self.pieces.has_piece(i))
    }

    pub fn has_all_pieces(&self) -> bool {
        self.pieces.is_complete()
    }

    pub fn on_metadata_received(&mut self, meta: MetaInfo) {
        self.private = meta.is_private();
        self.web_seed_urls = merge_web_seeds(meta.web_seeds(), &self.magnet_web_seeds);
        let piece_count = meta.piece_count();
        self.pieces = Bitfield::new(piece_count);
        let file_count = meta.files().len();
        if self.file_priorities.is_empty() {
            self.file_priorities = vec![Priority::default(); file_count];
        } else {
            self.file_priorities = pad_or_truncate_priorities(
                &self.file_priorities.iter().map(|p| p.value()).collect::<Vec<_>>(),
                file_count,
            );
        }
        if file_count > 0 {
            apply_select_only(&mut self.file_priorities, &self.select_only, self.select_only_present);
        }
        self.metainfo = Some(meta);
        self.recompute_piece_priorities_from_files();
        self.state = TorrentState::CheckingResumeData;
    }

    /// Marks a piece as verified-present. Monotonic: once set without an
    /// intervening `force_recheck`, a piece never goes back to missing.
    pub fn on_piece_verified(&mut self, piece: usize) {
        self.pieces.set(piece);
        self.reconcile_state_after_priority_change();
    }

    fn reconcile_state_after_priority_change(&mut self) {
        match self.state {
            TorrentState::Downloading if self.has_all_wanted() => {
                self.state = if self.has_all_pieces() {
                    TorrentState::Seeding
                } else {
                    TorrentState::Finished
                };
            }
            TorrentState::Finished => {
                if self.has_all_pieces() {
                    self.state = TorrentState::Seeding;
                } else if !self.has_all_wanted() {
                    self.state = TorrentState::Downloading;
                }
            }
            TorrentState::Seeding if !self.has_all_wanted() => {
                self.state = TorrentState::Downloading;
            }
            _ => {}
        }
    }

    pub fn enter_downloading(&mut self) {
        self.state = if self.has_all_pieces() {
            TorrentState::Seeding
        } else if self.has_all_wanted() {
            TorrentState::Finished
        } else {
            TorrentState::Downloading
        };
    }

    /// Discards the piece bitmap and re-enters `checking_files`, reachable
    /// from any state.
    pub fn force_recheck(&mut self) {
        let piece_count = self.piece_count();
        self.pieces = Bitfield::new(piece_count);
        self.state = TorrentState::CheckingFiles;
    }

    pub fn set_pause_mode(&mut self, mode: PauseMode) {
        self.pause_mode = mode;
    }

    pub fn accepts_new_requests(&self) -> bool {
        matches!(self.pause_mode, PauseMode::Running)
    }

    pub fn accepts_new_blocks(&self) -> bool {
        !matches!(self.pause_mode, PauseMode::Hard)
    }
}

/// Trailing entries past `count` are dropped; a shorter array is padded
/// with the default priority, per spec.md §4.1's `file_priorities` rule.
fn pad_or_truncate_priorities(raw: &[u8], count: usize) -> Vec<Priority> {
    let mut out: Vec<Priority> = raw.iter().take(count).map(|&v| Priority::new(v)).collect();
    out.resize(count, Priority::default());
    out
}

/// `piece_priorities` longer than the piece count is truncated; shorter
/// is left as-is (pieces past the supplied length keep the default
/// priority assigned by `recompute_piece_priorities_from_files`).
fn truncate_to_piece_count(raw: &[u8], count: usize) -> Vec<Priority> {
    raw.iter().take(count).map(|&v| Priority::new(v)).collect()
}

/// Zeroes the priority of every file outside the selected index ranges.
/// An `so=` key with no valid ranges at all (boundary case: `so=3-` or a
/// reversed range) still forces every file to priority 0, since the key
/// was present — it just selected nothing.
fn apply_select_only(file_priorities: &mut [Priority], select_only: &[(u32, u32)], select_only_present: bool) {
    if !select_only_present {
        return;
    }
    for (i, priority) in file_priorities.iter_mut().enumerate() {
        let wanted = select_only
            .iter()
            .any(|&(start, end)| (start as usize..=end as usize).contains(&i));
        if !wanted {
            *priority = Priority::DO_NOT_DOWNLOAD;
        }
    }
}

/// Merges magnet/resume-supplied web seeds with metainfo-provided ones,
/// preserving metainfo order first and skipping duplicates.
fn merge_web_seeds(from_metainfo: Vec<String>, from_magnet: &[String]) -> Vec<String> {
    let mut merged = from_metainfo;
    for seed in from_magnet {
        if !merged.contains(seed) {
            merged.push(seed.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{FileEntry, Info, MetaInfo};
    use serde_bytes::ByteBuf;

    fn meta_with_files(files: Vec<(i64, bool)>, piece_length: i64) -> MetaInfo {
        let total: i64 = files.iter().map(|(l, _)| l).sum();
        let piece_count = ((total + piece_length - 1) / piece_length).max(1) as usize;
        let info = Info {
            name: "t".to_string(),
            pieces: Some(ByteBuf::from(vec![0u8; piece_count * 20])),
            piece_length,
            md5sum: None,
            length: None,
            files: Some(
                files
                    .into_iter()
                    .enumerate()
                    .map(|(i, (length, is_pad))| FileEntry {
                        path: vec![format!("f{i}")],
                        length,
                        md5sum: None,
                        attr: if is_pad { Some("p".to_string()) } else { None },
                        pieces_root: None,
                    })
                    .collect(),
            ),
            private: None,
            path: None,
            meta_version: None,
        };
        MetaInfo::for_tests(info)
    }

    #[test]
    fn file_priorities_array_longer_than_file_count_is_ignored() {
        let meta = meta_with_files(vec![(100, false)], 16 * 1024);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            file_priorities: vec![4, 4, 4],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert_eq!(torrent.file_priorities.len(), 1);
    }

    #[test]
    fn file_priorities_array_shorter_is_padded_with_default() {
        let meta = meta_with_files(vec![(100, false), (100, false)], 16 * 1024);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            file_priorities: vec![7],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert_eq!(torrent.file_priorities, vec![Priority::new(7), Priority::default()]);
    }

    #[test]
    fn priority_zero_file_excludes_its_pieces_from_wanted() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false), (piece_length, false)], piece_length);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            file_priorities: vec![0, 4],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert!(!torrent.is_wanted(0));
        assert!(torrent.is_wanted(1));
    }

    #[test]
    fn magnet_without_metadata_discards_piece_priorities() {
        let params = AddTorrentParams {
            info_hash: Some(InfoHash::V1([1; 20])),
            piece_priorities: vec![7, 7, 7],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert!(torrent.piece_priorities.is_empty());
        assert_eq!(torrent.state, TorrentState::DownloadingMetadata);
    }

    #[test]
    fn piece_priorities_longer_than_piece_count_is_truncated() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false)], piece_length);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            piece_priorities: vec![1, 2, 3, 4],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert_eq!(torrent.piece_priorities.len(), 1);
    }

    #[test]
    fn downloading_transitions_to_finished_then_seeding() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false), (piece_length, false)], piece_length);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            file_priorities: vec![4, 0],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let mut torrent = Torrent::new(params, 0);
        torrent.state = TorrentState::Downloading;
        torrent.on_piece_verified(0);
        assert_eq!(torrent.state, TorrentState::Finished);

        torrent.set_file_priority(1, Priority::new(4));
        assert_eq!(torrent.state, TorrentState::Downloading);
        torrent.on_piece_verified(1);
        assert_eq!(torrent.state, TorrentState::Seeding);
    }

    #[test]
    fn force_recheck_clears_bitmap_from_any_state() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false)], piece_length);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let mut torrent = Torrent::new(params, 0);
        torrent.state = TorrentState::Seeding;
        torrent.pieces.set(0);
        torrent.force_recheck();
        assert_eq!(torrent.state, TorrentState::CheckingFiles);
        assert!(!torrent.pieces.has_piece(0));
    }

    #[test]
    fn select_only_restricts_wanted_files_to_the_given_ranges() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(
            vec![(piece_length, false), (piece_length, false), (piece_length, false)],
            piece_length,
        );
        let params = AddTorrentParams {
            metainfo: Some(meta),
            select_only: vec![(1, 1)],
            select_only_present: true,
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert!(!torrent.is_wanted(0));
        assert!(torrent.is_wanted(1));
        assert!(!torrent.is_wanted(2));
    }

    #[test]
    fn select_only_present_with_no_valid_ranges_wants_nothing() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false), (piece_length, false)], piece_length);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            select_only: Vec::new(),
            select_only_present: true,
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert!(!torrent.is_wanted(0));
        assert!(!torrent.is_wanted(1));
    }

    #[test]
    fn select_only_applied_once_magnet_metadata_arrives() {
        let params = AddTorrentParams {
            info_hash: Some(InfoHash::V1([1; 20])),
            select_only: vec![(1, 1)],
            select_only_present: true,
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let mut torrent = Torrent::new(params, 0);
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false), (piece_length, false)], piece_length);
        torrent.on_metadata_received(meta);
        assert!(!torrent.is_wanted(0));
        assert!(torrent.is_wanted(1));
    }

    #[test]
    fn magnet_web_seeds_survive_metadata_merge_with_metainfo_seeds() {
        let params = AddTorrentParams {
            info_hash: Some(InfoHash::V1([1; 20])),
            web_seeds: vec!["http://magnet-seed/".to_string()],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let mut torrent = Torrent::new(params, 0);
        assert_eq!(torrent.web_seed_urls, vec!["http://magnet-seed/".to_string()]);

        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, false)], piece_length);
        torrent.on_metadata_received(meta);
        assert!(torrent.web_seed_urls.contains(&"http://magnet-seed/".to_string()));
    }

    #[test]
    fn pad_file_never_counted_wanted_even_at_default_priority() {
        let piece_length = 16 * 1024;
        let meta = meta_with_files(vec![(piece_length, true), (piece_length, false)], piece_length);
        let params = AddTorrentParams {
            metainfo: Some(meta),
            file_priorities: vec![4, 4],
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let torrent = Torrent::new(params, 0);
        assert!(!torrent.is_wanted(0));
        assert!(torrent.is_wanted(1));
    }
}
