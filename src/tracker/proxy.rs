//! Privacy/proxy gating: when a proxy is configured for a traffic class
//! but can't carry it (no proxy at all, or a proxy flavor that doesn't
//! support UDP), that traffic is suppressed entirely rather than falling
//! back to a direct connection.

use crate::settings::SettingsPack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    None,
    Socks4,
    Socks5,
    Http,
}

impl ProxyKind {
    fn supports_udp(self) -> bool {
        matches!(self, ProxyKind::Socks5)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub configured: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings { kind: ProxyKind::None, configured: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResult {
    Allowed,
    SuppressedNoProxy,
    SuppressedUnsupportedFlow,
}

impl GateResult {
    pub fn is_allowed(self) -> bool {
        self == GateResult::Allowed
    }
}

/// Gates an outbound peer connection attempt. Peer connections are always
/// TCP, so the only failure mode is "no proxy configured at all".
pub fn gate_peer_connection(settings: &SettingsPack, proxy: &ProxySettings) -> GateResult {
    if !settings.proxy_peer_connections {
        return GateResult::Allowed;
    }
    if !proxy.configured {
        return GateResult::SuppressedNoProxy;
    }
    GateResult::Allowed
}

/// Gates a tracker exchange. UDP trackers additionally need a proxy
/// flavor that can carry UDP (e.g. SOCKS4 cannot).
pub fn gate_tracker_connection(
    settings: &SettingsPack,
    proxy: &ProxySettings,
    is_udp: bool,
) -> GateResult {
    if !settings.proxy_tracker_connections {
        return GateResult::Allowed;
    }
    if !proxy.configured {
        return GateResult::SuppressedNoProxy;
    }
    if is_udp && !proxy.kind.supports_udp() {
        return GateResult::SuppressedUnsupportedFlow;
    }
    GateResult::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(proxy_peers: bool, proxy_trackers: bool) -> SettingsPack {
        let mut s = SettingsPack::default();
        s.proxy_peer_connections = proxy_peers;
        s.proxy_tracker_connections = proxy_trackers;
        s
    }

    #[test]
    fn peer_connections_allowed_when_gating_disabled() {
        let settings = settings_with(false, false);
        let proxy = ProxySettings::default();
        assert_eq!(gate_peer_connection(&settings, &proxy), GateResult::Allowed);
    }

    #[test]
    fn peer_connections_suppressed_without_a_configured_proxy() {
        let settings = settings_with(true, false);
        let proxy = ProxySettings::default();
        assert_eq!(gate_peer_connection(&settings, &proxy), GateResult::SuppressedNoProxy);
    }

    #[test]
    fn udp_tracker_suppressed_behind_socks4() {
        let settings = settings_with(false, true);
        let proxy = ProxySettings { kind: ProxyKind::Socks4, configured: true };
        assert_eq!(
            gate_tracker_connection(&settings, &proxy, true),
            GateResult::SuppressedUnsupportedFlow
        );
    }

    #[test]
    fn udp_tracker_allowed_behind_socks5() {
        let settings = settings_with(false, true);
        let proxy = ProxySettings { kind: ProxyKind::Socks5, configured: true };
        assert_eq!(gate_tracker_connection(&settings, &proxy, true), GateResult::Allowed);
    }

    #[test]
    fn http_tracker_allowed_behind_socks4() {
        let settings = settings_with(false, true);
        let proxy = ProxySettings { kind: ProxyKind::Socks4, configured: true };
        assert_eq!(gate_tracker_connection(&settings, &proxy, false), GateResult::Allowed);
    }
}
