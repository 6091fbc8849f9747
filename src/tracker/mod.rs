//! Tracker bookkeeping: per-tracker state, tiered announce-target
//! selection, and the failure back-off curve. The wire formats themselves
//! live in `http` and `udp`; `proxy` gates whether either is allowed to
//! run at all.

pub mod http;
pub mod proxy;
pub mod udp;

/// Where a tracker entry was learned from, carried into resume data and
/// used to apply different defaults (an `lt_tex`-received tracker starts
/// with `send_stats = false`, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerSource {
    Torrent,
    Tex,
}

/// Live, in-memory state for one tracker URL within a tier. The
/// bencode-persisted subset of this (`url`, `tier`, `fail_limit`,
/// `verified`) is `resume::TrackerResumeEntry`.
#[derive(Debug, Clone)]
pub struct AnnounceEntry {
    pub url: String,
    pub tier: u32,
    pub fail_count: u32,
    pub fail_limit: u32,
    pub verified: bool,
    pub scrape_supported: bool,
    pub send_stats: bool,
    pub source: TrackerSource,
    pub next_announce_epoch: u64,
    pub last_announce_epoch: Option<u64>,
}

impl AnnounceEntry {
    pub fn new(url: String, tier: u32, fail_limit: u32) -> Self {
        AnnounceEntry {
            url,
            tier,
            fail_count: 0,
            fail_limit,
            verified: false,
            scrape_supported: false,
            send_stats: true,
            source: TrackerSource::Torrent,
            next_announce_epoch: 0,
            last_announce_epoch: None,
        }
    }

    pub fn from_tex(url: String, tier: u32) -> Self {
        AnnounceEntry {
            fail_limit: 3,
            send_stats: false,
            source: TrackerSource::Tex,
            ..AnnounceEntry::new(url, tier, 3)
        }
    }

    /// A tracker with `fail_count >= fail_limit` is disabled until its
    /// back-off deadline passes, per `backoff_secs`.
    pub fn is_disabled(&self, now_epoch: u64) -> bool {
        self.fail_count >= self.fail_limit && now_epoch < self.next_announce_epoch
    }

    pub fn record_success(&mut self, interval_secs: u64, min_interval_secs: u64, now_epoch: u64) {
        self.fail_count = 0;
        self.verified = true;
        self.last_announce_epoch = Some(now_epoch);
        self.next_announce_epoch = now_epoch + interval_secs.max(min_interval_secs);
    }

    pub fn record_failure(&mut self, now_epoch: u64) {
        self.fail_count += 1;
        self.last_announce_epoch = Some(now_epoch);
        self.next_announce_epoch = now_epoch + backoff_secs(self.fail_count);
    }
}

/// `60 + fails² × 60` seconds, the same curve libtorrent uses for its
/// RSS feed retry path; kept monotonic in the fail count for trackers too
/// since the spec leaves the exact formula implementation-defined.
pub fn backoff_secs(fail_count: u32) -> u64 {
    60 + (fail_count as u64).pow(2) * 60
}

/// Chooses which `(tier_index, entry_index)` pairs to announce to this
/// round, given the `announce_to_all_trackers` / `announce_to_all_tiers`
/// policy combination. Disabled trackers (still in back-off) are skipped;
/// a tier counts as "successful" if it has at least one enabled tracker.
pub fn select_for_announce(
    tiers: &[Vec<AnnounceEntry>],
    announce_to_all_trackers: bool,
    announce_to_all_tiers: bool,
    now_epoch: u64,
) -> Vec<(usize, usize)> {
    let mut selected = Vec::new();
    for (tier_idx, tier) in tiers.iter().enumerate() {
        let enabled: Vec<usize> = tier
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_disabled(now_epoch))
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            continue;
        }

        if announce_to_all_trackers {
            for idx in &enabled {
                selected.push((tier_idx, *idx));
            }
        } else {
            selected.push((tier_idx, enabled[0]));
        }

        if !announce_to_all_tiers {
            // Standard behaviour: stop at the first tier with a usable
            // tracker. `announce_to_all_trackers` still fans out within
            // that one tier.
            break;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(urls: &[&str]) -> Vec<AnnounceEntry> {
        urls.iter()
            .map(|u| AnnounceEntry::new(u.to_string(), 0, 3))
            .collect()
    }

    #[test]
    fn default_policy_picks_first_tier_first_tracker_only() {
        let tiers = vec![tier(&["http://a", "http://b"]), tier(&["http://c"])];
        let selected = select_for_announce(&tiers, false, false, 0);
        assert_eq!(selected, vec![(0, 0)]);
    }

    #[test]
    fn announce_to_all_trackers_fans_out_within_first_tier() {
        let tiers = vec![tier(&["http://a", "http://b"]), tier(&["http://c"])];
        let selected = select_for_announce(&tiers, true, false, 0);
        assert_eq!(selected, vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn announce_to_all_tiers_picks_one_tracker_per_tier() {
        let tiers = vec![tier(&["http://a", "http://b"]), tier(&["http://c"])];
        let selected = select_for_announce(&tiers, false, true, 0);
        assert_eq!(selected, vec![(0, 0), (1, 0)]);
    }

    #[test]
    fn both_policies_fan_out_everywhere() {
        let tiers = vec![tier(&["http://a", "http://b"]), tier(&["http://c"])];
        let selected = select_for_announce(&tiers, true, true, 0);
        assert_eq!(selected, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn disabled_tier_is_skipped_in_favor_of_next() {
        let mut tiers = vec![tier(&["http://a"]), tier(&["http://b"])];
        tiers[0][0].fail_count = 3;
        tiers[0][0].next_announce_epoch = 1000;
        let selected = select_for_announce(&tiers, false, false, 10);
        assert_eq!(selected, vec![(1, 0)]);
    }

    #[test]
    fn backoff_grows_with_fail_count() {
        assert_eq!(backoff_secs(0), 60);
        assert_eq!(backoff_secs(1), 120);
        assert_eq!(backoff_secs(2), 300);
        assert!(backoff_secs(3) > backoff_secs(2));
    }

    #[test]
    fn record_failure_then_success_clears_disabled_state() {
        let mut entry = AnnounceEntry::new("http://a".to_string(), 0, 1);
        entry.record_failure(0);
        assert!(entry.is_disabled(10));
        entry.record_success(1800, 30, 100);
        assert!(!entry.is_disabled(100));
        assert_eq!(entry.fail_count, 0);
    }
}
