//! The session coordinator (component A): owns settings, the torrent
//! table, the alert queue, and the peer id this process announces under.
//! Mirrors the teacher's top-level `Torrent::from_file` + ad-hoc `utils`
//! entry points, generalized into a long-lived object a CLI or any other
//! front-end drives instead of a one-shot `main`.

use crate::alerts::{AlertKind, AlertQueue};
use crate::arena::Arena;
use crate::error::{AddTorrentError, InvalidTorrentHandle};
use crate::ids::{generate_wire_peer_id, InfoHash, TorrentId, WirePeerId};
use crate::resume::{SessionState, TorrentResumeData};
use crate::settings::SettingsPack;
use crate::torrent::{AddTorrentParams, PauseMode, Torrent, TorrentState};
use crate::tracker::proxy::ProxySettings;
use log::{info, warn};
use std::net::IpAddr;

pub struct Session {
    pub settings: SettingsPack,
    pub proxy: ProxySettings,
    peer_id: WirePeerId,
    torrents: Arena<Torrent>,
    alerts: AlertQueue,
    ip_filter: IpFilter,
}

impl Session {
    pub fn new(settings: SettingsPack) -> Self {
        let alerts = AlertQueue::new(settings.alert_queue_size as usize);
        Session {
            settings,
            proxy: ProxySettings::default(),
            peer_id: generate_wire_peer_id(),
            torrents: Arena::new(),
            alerts,
            ip_filter: IpFilter::default(),
        }
    }

    /// True if the peer-connection acceptor should refuse `addr`, per the
    /// `ip_filter4`/`ip_filter6` ranges loaded from session state.
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        self.ip_filter.is_blocked(addr)
    }

    pub fn peer_id(&self) -> WirePeerId {
        self.peer_id
    }

    /// Info-hash equality is deliberately non-standard (a hybrid torrent
    /// matches on either its v1 or v2 side), which rules out a `HashMap`
    /// keyed by `InfoHash` — two hybrid entries with only a v2 hash in
    /// common would hash to different buckets and never collide. A
    /// linear scan over the (typically small) torrent arena keeps the
    /// same-either-side semantics correct.
    fn find_by_info_hash(&self, info_hash: &InfoHash) -> Option<TorrentId> {
        self.torrents
            .iter()
            .find(|(_, t)| &t.info_hash == info_hash)
            .map(|(id, _)| *id)
    }

    /// Adds a torrent per spec.md §4.1: an explicit `info_hash` and a
    /// parsed `metainfo` must agree if both are present; a torrent
    /// already tracked under the same info-hash is rejected as a
    /// duplicate unless `duplicate_is_error` is false, in which case the
    /// existing handle is returned instead of erroring.
    pub fn add_torrent(&mut self, params: AddTorrentParams, now_epoch: i64) -> Result<TorrentId, AddTorrentError> {
        if let (Some(explicit), Some(meta)) = (&params.info_hash, &params.metainfo) {
            if explicit != &meta.info_hash() {
                return Err(AddTorrentError::MismatchingInfoHash);
            }
        }
        let info_hash = params
            .info_hash
            .clone()
            .or_else(|| params.metainfo.as_ref().map(|m| m.info_hash()))
            .ok_or(AddTorrentError::InvalidMagnet("no info hash or metainfo supplied".to_string()))?;

        if let Some(existing) = self.find_by_info_hash(&info_hash) {
            if self.settings.duplicate_is_error {
                return Err(AddTorrentError::DuplicateTorrent);
            }
            return Ok(existing);
        }

        let torrent = Torrent::new(params, now_epoch);
        let id = self.torrents.insert(torrent);
        self.alerts.push(AlertKind::AddTorrent { id }, now_epoch as u64);
        info!("added torrent {} as {}", info_hash, id);
        Ok(id)
    }

    pub fn get(&self, id: TorrentId) -> Result<&Torrent, InvalidTorrentHandle> {
        self.torrents.get(id).ok_or(InvalidTorrentHandle)
    }

    pub fn get_mut(&mut self, id: TorrentId) -> Result<&mut Torrent, InvalidTorrentHandle> {
        self.torrents.get_mut(id).ok_or(InvalidTorrentHandle)
    }

    pub fn remove_torrent(&mut self, id: TorrentId) -> Result<(), InvalidTorrentHandle> {
        self.torrents.remove(id).map(|_| ()).ok_or(InvalidTorrentHandle)
    }

    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.torrents.iter().map(|(id, _)| id).collect()
    }

    pub fn pause(&mut self, id: TorrentId) -> Result<(), InvalidTorrentHandle> {
        self.get_mut(id)?.set_pause_mode(PauseMode::Hard);
        Ok(())
    }

    pub fn graceful_pause(&mut self, id: TorrentId) -> Result<(), InvalidTorrentHandle> {
        self.get_mut(id)?.set_pause_mode(PauseMode::Graceful);
        Ok(())
    }

    pub fn resume(&mut self, id: TorrentId) -> Result<(), InvalidTorrentHandle> {
        self.get_mut(id)?.set_pause_mode(PauseMode::Running);
        Ok(())
    }

    pub fn force_recheck(&mut self, id: TorrentId) -> Result<(), InvalidTorrentHandle> {
        self.get_mut(id)?.force_recheck();
        Ok(())
    }

    pub fn apply_settings(&mut self, settings: SettingsPack) {
        self.settings = settings;
    }

    pub fn pop_alerts(&mut self) -> Vec<crate::alerts::Alert> {
        self.alerts.pop_all()
    }

    /// Builds the session-wide state document for persistence: only the
    /// settings that diverge from default are kept, per
    /// `SettingsPack::diff_from_default`.
    pub fn save_session_state(&self) -> SessionState {
        SessionState {
            settings: self.settings.diff_from_default(),
            ..SessionState::default()
        }
    }

    pub fn load_session_state(&mut self, state: &SessionState) {
        self.settings.apply_diff(&state.settings);
        self.ip_filter = IpFilter::from_session_state(state);
    }

    /// Builds a torrent's resume dictionary from its live in-memory
    /// state, for the caller to bencode and write to disk.
    pub fn save_resume_data(&self, id: TorrentId) -> Result<TorrentResumeData, InvalidTorrentHandle> {
        let torrent = self.get(id)?;
        let mut flags = 0u64;
        if !matches!(torrent.pause_mode, crate::torrent::PauseMode::Running) {
            flags |= crate::resume::RESUME_FLAG_PAUSED;
        }
        if matches!(torrent.state, TorrentState::Seeding) {
            flags |= crate::resume::RESUME_FLAG_SEED_MODE;
        }
        Ok(TorrentResumeData {
            info_hash: serde_bytes::ByteBuf::from(
                torrent.info_hash.v1().map(|h| h.to_vec()).unwrap_or_default(),
            ),
            pieces: serde_bytes::ByteBuf::from(torrent.pieces.to_payload()),
            file_progress: Vec::new(),
            trackers: torrent
                .trackers
                .iter()
                .flatten()
                .map(|t| crate::resume::TrackerResumeEntry {
                    url: t.url.clone(),
                    tier: t.tier,
                    fail_limit: t.fail_limit,
                    verified: t.verified,
                })
                .collect(),
            peers: Vec::new(),
            added_time: torrent.added_time,
            completed_time: torrent.completed_time,
            save_path: torrent.save_path.clone(),
            file_priorities: torrent.file_priorities.iter().map(|p| p.value()).collect(),
            piece_priorities: torrent.piece_priorities.iter().map(|p| p.value()).collect(),
            flags,
        })
    }

    /// Emits a structured log alert in addition to the `log` facade line,
    /// matching the teacher's habit of logging at the call site while
    /// still surfacing user-facing alerts through the queue.
    pub fn log_alert(&mut self, message: impl Into<String>, timestamp_ms: u64) {
        let message = message.into();
        warn!("{message}");
        self.alerts.push(AlertKind::Log { message }, timestamp_ms);
    }
}

struct IpRange4 {
    first: [u8; 4],
    last: [u8; 4],
    flags: u32,
}

struct IpRange6 {
    first: [u8; 16],
    last: [u8; 16],
    flags: u32,
}

/// Blocked-address ranges loaded from `SessionState`'s opaque
/// `ip_filter4`/`ip_filter6` byte strings: 4+4+4 bytes per IPv4 entry,
/// 16+16+4 per IPv6 entry, each `(first, last, flags)`. Grounded in
/// libtorrent's `ip_filter` convention: bit 0 of `flags` means blocked.
#[derive(Default)]
struct IpFilter {
    v4: Vec<IpRange4>,
    v6: Vec<IpRange6>,
}

impl IpFilter {
    fn from_session_state(state: &SessionState) -> Self {
        let v4 = state
            .ip_filter4
            .iter()
            .filter_map(|entry| {
                if entry.len() != 12 {
                    return None;
                }
                let mut first = [0u8; 4];
                let mut last = [0u8; 4];
                first.copy_from_slice(&entry[0..4]);
                last.copy_from_slice(&entry[4..8]);
                let flags = u32::from_be_bytes(entry[8..12].try_into().unwrap());
                Some(IpRange4 { first, last, flags })
            })
            .collect();
        let v6 = state
            .ip_filter6
            .iter()
            .filter_map(|entry| {
                if entry.len() != 36 {
                    return None;
                }
                let mut first = [0u8; 16];
                let mut last = [0u8; 16];
                first.copy_from_slice(&entry[0..16]);
                last.copy_from_slice(&entry[16..32]);
                let flags = u32::from_be_bytes(entry[32..36].try_into().unwrap());
                Some(IpRange6 { first, last, flags })
            })
            .collect();
        IpFilter { v4, v6 }
    }

    fn is_blocked(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                self.v4
                    .iter()
                    .any(|r| r.flags & 1 != 0 && octets >= r.first && octets <= r.last)
            }
            IpAddr::V6(ip) => {
                let octets = ip.octets();
                self.v6
                    .iter()
                    .any(|r| r.flags & 1 != 0 && octets >= r.first && octets <= r.last)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InfoHash;

    fn params_with_hash(hash: [u8; 20]) -> AddTorrentParams {
        AddTorrentParams {
            info_hash: Some(InfoHash::V1(hash)),
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        }
    }

    #[test]
    fn add_torrent_assigns_a_handle() {
        let mut session = Session::new(SettingsPack::default());
        let id = session.add_torrent(params_with_hash([1; 20]), 0).unwrap();
        assert!(session.get(id).is_ok());
    }

    #[test]
    fn duplicate_add_returns_existing_handle_by_default() {
        let mut session = Session::new(SettingsPack::default());
        let first = session.add_torrent(params_with_hash([2; 20]), 0).unwrap();
        let second = session.add_torrent(params_with_hash([2; 20]), 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_add_errors_when_configured() {
        let mut settings = SettingsPack::default();
        settings.duplicate_is_error = true;
        let mut session = Session::new(settings);
        session.add_torrent(params_with_hash([3; 20]), 0).unwrap();
        let err = session.add_torrent(params_with_hash([3; 20]), 0).unwrap_err();
        assert_eq!(err, AddTorrentError::DuplicateTorrent);
    }

    #[test]
    fn remove_then_access_yields_invalid_handle() {
        let mut session = Session::new(SettingsPack::default());
        let id = session.add_torrent(params_with_hash([4; 20]), 0).unwrap();
        session.remove_torrent(id).unwrap();
        assert!(session.get(id).is_err());
    }

    #[test]
    fn mismatching_explicit_info_hash_and_metainfo_is_rejected() {
        let mut session = Session::new(SettingsPack::default());
        let meta = crate::metainfo::MetaInfo::for_tests(crate::metainfo::Info {
            name: "x".to_string(),
            pieces: Some(serde_bytes::ByteBuf::from(vec![0u8; 20])),
            piece_length: 16384,
            md5sum: None,
            length: Some(10),
            files: None,
            private: None,
            path: None,
            meta_version: None,
        });
        let params = AddTorrentParams {
            info_hash: Some(InfoHash::V1([9; 20])),
            metainfo: Some(meta),
            save_path: "/tmp".to_string(),
            ..AddTorrentParams::default()
        };
        let err = session.add_torrent(params, 0).unwrap_err();
        assert_eq!(err, AddTorrentError::MismatchingInfoHash);
    }

    #[test]
    fn pause_then_resume_round_trips_pause_mode() {
        let mut session = Session::new(SettingsPack::default());
        let id = session.add_torrent(params_with_hash([5; 20]), 0).unwrap();
        session.pause(id).unwrap();
        assert!(!session.get(id).unwrap().accepts_new_requests());
        session.resume(id).unwrap();
        assert!(session.get(id).unwrap().accepts_new_requests());
    }

    #[test]
    fn ip_filter_blocks_addresses_in_range_only_when_flagged() {
        let mut session = Session::new(SettingsPack::default());
        let mut state = crate::resume::SessionState::default();
        state.add_ip_filter4_range([10, 0, 0, 0], [10, 0, 0, 255], 1);
        session.load_session_state(&state);

        assert!(session.is_blocked("10.0.0.42".parse().unwrap()));
        assert!(!session.is_blocked("10.0.1.1".parse().unwrap()));
    }

    #[test]
    fn ip_filter_range_with_flags_zero_is_not_blocked() {
        let mut session = Session::new(SettingsPack::default());
        let mut state = crate::resume::SessionState::default();
        state.add_ip_filter4_range([192, 168, 0, 0], [192, 168, 255, 255], 0);
        session.load_session_state(&state);

        assert!(!session.is_blocked("192.168.1.1".parse().unwrap()));
    }
}
