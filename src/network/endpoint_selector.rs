//! Active path selection
//!
//! The selector owns the `current` endpoint (where packets go) and the
//! `preferred` relay (where packets go when no direct path is better). It
//! measures each path with pings and moves `current` only when a candidate
//! beats it by a hysteresis margin, so two paths with similar RTTs do not
//! flap. A UDP connectivity probe at call start decides whether the relays
//! are reachable over UDP at all, falling back to TCP relays otherwise.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::endpoint::{Endpoint, EndpointKind, EndpointMap, RelayDescriptor, RESERVED_ID_BITS};
use super::sequence_tracker::ACK_WINDOW;
use crate::config::SessionConfig;
use crate::protocol::PeerTag;

// ============================================================================
// Ping plans
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    /// Encrypted ping answered by the peer
    Session { seq: u32 },
    /// Relay control ping answered by the relay itself
    Reflector { query_id: i64 },
}

/// A ping the session should send now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRequest {
    pub endpoint_id: u64,
    pub kind: PingKind,
}

// ============================================================================
// Path switches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    BetterRelay,
    P2pFaster,
    P2pDegraded,
    NatRebinding,
    UdpUnavailable,
    ReceiveTimeout,
    NetworkChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSwitch {
    pub from: Option<u64>,
    pub to: u64,
    pub reason: SwitchReason,
}

// ============================================================================
// UDP connectivity probe
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpConnectivity {
    Unknown,
    Probing,
    Good,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Still probing, or no probe running
    Pending,
    /// At least one UDP relay answered
    UdpGood,
    /// No UDP replies but a TCP relay answered; switched to it
    SwitchedToTcp(u64),
    /// Nothing answered at all
    NoReplies,
}

#[derive(Debug, Clone, Copy)]
struct UdpProbe {
    rounds_left: u32,
    udp_replies: u32,
    tcp_replies: u32,
}

/// Chooses the endpoint packets are sent to
pub struct EndpointSelector {
    endpoints: EndpointMap,
    current: Option<u64>,
    preferred_relay: Option<u64>,
    use_tcp: bool,
    allow_p2p: bool,
    relay_switch_threshold: f64,
    relay_to_p2p_switch_threshold: f64,
    p2p_to_relay_switch_threshold: f64,
    tcp_path_penalty: f64,
    ping_interval: Duration,
    probe_attempts: u32,
    probe: Option<UdpProbe>,
    udp_connectivity: UdpConnectivity,
    next_ping_seq: u32,
    next_query_id: i64,
}

impl EndpointSelector {
    pub fn new(endpoints: EndpointMap, config: &SessionConfig) -> Self {
        Self {
            endpoints,
            current: None,
            preferred_relay: None,
            use_tcp: false,
            allow_p2p: false,
            relay_switch_threshold: config.relay_switch_threshold,
            relay_to_p2p_switch_threshold: config.relay_to_p2p_switch_threshold,
            p2p_to_relay_switch_threshold: config.p2p_to_relay_switch_threshold,
            tcp_path_penalty: config.tcp_path_penalty,
            ping_interval: config.ping_interval(),
            probe_attempts: config.udp_probe_attempts,
            probe: None,
            udp_connectivity: UdpConnectivity::Unknown,
            next_ping_seq: 1,
            next_query_id: 1,
        }
    }

    /// Install the relay list; the first UDP relay becomes current
    pub fn set_relays(&mut self, relays: &[RelayDescriptor], allow_p2p: bool) {
        self.allow_p2p = allow_p2p;
        let mut first_udp = None;
        let mut first_tcp = None;
        for relay in relays {
            if relay.id & RESERVED_ID_BITS != 0 {
                warn!("Ignoring relay {:#x}: id uses reserved bits", relay.id);
                continue;
            }
            for endpoint in relay.expand() {
                match endpoint.kind {
                    EndpointKind::UdpRelay if first_udp.is_none() && !endpoint.is_ipv6() => {
                        first_udp = Some(endpoint.id)
                    }
                    EndpointKind::TcpRelay if first_tcp.is_none() => first_tcp = Some(endpoint.id),
                    _ => {}
                }
                self.endpoints.insert(endpoint);
            }
        }
        if first_udp.is_none() {
            first_udp = self
                .endpoints
                .snapshot()
                .into_iter()
                .find(|e| e.kind == EndpointKind::UdpRelay)
                .map(|e| e.id);
        }
        self.use_tcp = first_udp.is_none() && first_tcp.is_some();
        self.preferred_relay = first_udp.or(first_tcp);
        self.current = self.preferred_relay;
        info!(
            "Installed {} endpoint(s), current {:?}, use_tcp={}",
            self.endpoints.len(),
            self.current,
            self.use_tcp
        );
    }

    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.current.and_then(|id| self.endpoints.get(id))
    }

    pub fn preferred_relay(&self) -> Option<u64> {
        self.preferred_relay
    }

    pub fn use_tcp(&self) -> bool {
        self.use_tcp
    }

    pub fn allow_p2p(&self) -> bool {
        self.allow_p2p
    }

    pub fn udp_connectivity(&self) -> UdpConnectivity {
        self.udp_connectivity
    }

    /// Whether the current path is a relay
    pub fn on_relay(&self) -> bool {
        self.current_endpoint()
            .map_or(true, |e| e.kind.is_relay())
    }

    /// Routing tag for packets sent to `id`
    ///
    /// Direct paths carry the preferred relay's tag.
    pub fn routing_tag(&self, id: u64) -> Option<PeerTag> {
        let endpoint = self.endpoints.get(id)?;
        if endpoint.kind.is_relay() {
            return Some(endpoint.peer_tag);
        }
        self.preferred_relay
            .and_then(|r| self.endpoints.get(r))
            .map(|r| r.peer_tag)
            .or(Some(endpoint.peer_tag))
    }

    fn penalty(&self, kind: EndpointKind) -> f64 {
        if kind == EndpointKind::TcpRelay {
            self.tcp_path_penalty
        } else {
            1.0
        }
    }

    fn active_relay_kind(&self) -> EndpointKind {
        if self.use_tcp {
            EndpointKind::TcpRelay
        } else {
            EndpointKind::UdpRelay
        }
    }

    fn should_ping(&self, endpoint: &Endpoint) -> bool {
        match endpoint.kind {
            EndpointKind::UdpRelay | EndpointKind::TcpRelay => {
                self.probe.is_some() || endpoint.kind == self.active_relay_kind()
            }
            EndpointKind::P2pInet | EndpointKind::P2pLan => self.allow_p2p,
        }
    }

    fn alloc_query_id(&mut self) -> i64 {
        let id = self.next_query_id;
        self.next_query_id += 1;
        id
    }

    /// Pings for every eligible endpoint not pinged within the ping interval
    pub fn pings_due(&mut self, now: Instant) -> Vec<PingRequest> {
        let mut out = Vec::new();
        for endpoint in self.endpoints.snapshot() {
            if !self.should_ping(&endpoint) || !endpoint.ping_due(now, self.ping_interval) {
                continue;
            }
            let seq = self.next_ping_seq;
            self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
            let query_id = (endpoint.kind == EndpointKind::UdpRelay).then(|| self.alloc_query_id());
            self.endpoints.with(endpoint.id, |e| {
                e.record_ping(seq, now);
                if let Some(query_id) = query_id {
                    e.record_self_ping(query_id, now);
                }
            });
            out.push(PingRequest {
                endpoint_id: endpoint.id,
                kind: PingKind::Session { seq },
            });
            if let Some(query_id) = query_id {
                out.push(PingRequest {
                    endpoint_id: endpoint.id,
                    kind: PingKind::Reflector { query_id },
                });
            }
        }
        out
    }

    fn count_probe_reply(&mut self, kind: EndpointKind) {
        if let Some(probe) = self.probe.as_mut() {
            match kind {
                EndpointKind::UdpRelay => probe.udp_replies += 1,
                EndpointKind::TcpRelay => probe.tcp_replies += 1,
                _ => {}
            }
        }
    }

    /// Match a session pong; returns the path RTT
    pub fn on_pong(&mut self, id: u64, seq: u32, now: Instant) -> Option<Duration> {
        let (kind, rtt) = self
            .endpoints
            .with(id, |e| (e.kind, e.take_ping(seq, now)))?;
        let rtt = rtt?;
        self.count_probe_reply(kind);
        debug!("Pong from {} ({}): {:?}", id, kind.as_str(), rtt);
        Some(rtt)
    }

    /// Match a reflector reply; returns the RTT to the relay
    pub fn on_self_info(&mut self, id: u64, query_id: i64, now: Instant) -> Option<Duration> {
        let (kind, rtt) = self
            .endpoints
            .with(id, |e| (e.kind, e.take_self_ping(query_id, now)))?;
        let rtt = rtt?;
        self.count_probe_reply(kind);
        Some(rtt)
    }

    /// Begin (or restart) the UDP connectivity probe
    pub fn start_udp_probe(&mut self) {
        self.probe = Some(UdpProbe {
            rounds_left: self.probe_attempts,
            udp_replies: 0,
            tcp_replies: 0,
        });
        self.udp_connectivity = UdpConnectivity::Probing;
        debug!("UDP connectivity probe started");
    }

    pub fn probing(&self) -> bool {
        self.probe.is_some()
    }

    /// One probe round: reflector pings to every relay, or the verdict once
    /// UDP answered or the rounds ran out
    pub fn probe_round(&mut self, now: Instant) -> (Vec<PingRequest>, ProbeOutcome) {
        let Some(probe) = self.probe else {
            return (Vec::new(), ProbeOutcome::Pending);
        };

        if probe.udp_replies > 0 {
            self.probe = None;
            self.udp_connectivity = UdpConnectivity::Good;
            info!("UDP connectivity confirmed ({} replies)", probe.udp_replies);
            return (Vec::new(), ProbeOutcome::UdpGood);
        }

        if probe.rounds_left == 0 {
            self.probe = None;
            self.udp_connectivity = UdpConnectivity::Bad;
            if probe.tcp_replies == 0 {
                warn!("No relay answered the connectivity probe");
                return (Vec::new(), ProbeOutcome::NoReplies);
            }
            let best_tcp = self
                .endpoints
                .snapshot()
                .into_iter()
                .filter(|e| e.kind == EndpointKind::TcpRelay)
                .min_by(|a, b| rtt_order(a.average_rtt, b.average_rtt));
            return match best_tcp {
                Some(tcp) => {
                    warn!("UDP unavailable, switching to TCP relay {}", tcp.id);
                    self.use_tcp = true;
                    self.preferred_relay = Some(tcp.id);
                    self.current = Some(tcp.id);
                    (Vec::new(), ProbeOutcome::SwitchedToTcp(tcp.id))
                }
                None => (Vec::new(), ProbeOutcome::NoReplies),
            };
        }

        let mut pings = Vec::new();
        for endpoint in self.endpoints.snapshot() {
            if !endpoint.kind.is_relay() {
                continue;
            }
            let query_id = self.alloc_query_id();
            self.endpoints
                .with(endpoint.id, |e| e.record_self_ping(query_id, now));
            pings.push(PingRequest {
                endpoint_id: endpoint.id,
                kind: PingKind::Reflector { query_id },
            });
        }
        if let Some(p) = self.probe.as_mut() {
            p.rounds_left -= 1;
        }
        (pings, ProbeOutcome::Pending)
    }

    fn switch_to(&mut self, to: u64, reason: SwitchReason) -> Option<PathSwitch> {
        if self.current == Some(to) {
            return None;
        }
        let from = self.current;
        self.current = Some(to);
        info!("Path switch {:?} -> {} ({:?})", from, to, reason);
        Some(PathSwitch { from, to, reason })
    }

    /// Re-rank paths by RTT and move `current` if a candidate is clearly
    /// better
    pub fn evaluate_paths(&mut self) -> Option<PathSwitch> {
        let snapshot = self.endpoints.snapshot();
        let active_kind = self.active_relay_kind();

        // Relay preference
        let best_relay = snapshot
            .iter()
            .filter(|e| e.kind == active_kind && e.has_rtt())
            .min_by(|a, b| {
                rtt_order(
                    a.average_rtt * self.penalty(a.kind),
                    b.average_rtt * self.penalty(b.kind),
                )
            });
        let preferred = self
            .preferred_relay
            .and_then(|id| snapshot.iter().find(|e| e.id == id));
        if let Some(best) = best_relay {
            let best_score = best.average_rtt * self.penalty(best.kind);
            let switch = match preferred {
                Some(p) if p.id == best.id => false,
                Some(p) if p.has_rtt() && p.kind == active_kind => {
                    best_score < p.average_rtt * self.penalty(p.kind) * self.relay_switch_threshold
                }
                _ => true,
            };
            if switch {
                info!(
                    "Preferred relay {:?} -> {} ({:.0} ms)",
                    self.preferred_relay,
                    best.id,
                    best.average_rtt * 1000.0
                );
                self.preferred_relay = Some(best.id);
            }
        }

        let current = self
            .current
            .and_then(|id| snapshot.iter().find(|e| e.id == id));
        let preferred = self
            .preferred_relay
            .and_then(|id| snapshot.iter().find(|e| e.id == id));
        let (Some(current), Some(preferred)) = (current, preferred) else {
            return self
                .preferred_relay
                .and_then(|to| self.switch_to(to, SwitchReason::BetterRelay));
        };

        if current.kind.is_relay() {
            if self.allow_p2p {
                let best_p2p = snapshot
                    .iter()
                    .filter(|e| e.kind.is_p2p() && e.has_rtt())
                    .min_by(|a, b| rtt_order(a.average_rtt, b.average_rtt));
                let relay_rtt = if preferred.has_rtt() {
                    preferred.average_rtt
                } else {
                    current.average_rtt
                };
                if let Some(p2p) = best_p2p {
                    if relay_rtt > 0.0
                        && p2p.average_rtt < relay_rtt * self.relay_to_p2p_switch_threshold
                    {
                        return self.switch_to(p2p.id, SwitchReason::P2pFaster);
                    }
                }
            }
            if current.id != preferred.id {
                return self.switch_to(preferred.id, SwitchReason::BetterRelay);
            }
        } else if current.has_rtt()
            && preferred.has_rtt()
            && preferred.average_rtt < current.average_rtt * self.p2p_to_relay_switch_threshold
        {
            return self.switch_to(preferred.id, SwitchReason::P2pDegraded);
        }
        None
    }

    /// A valid packet arrived over `id`
    ///
    /// When the peer has stopped acknowledging us and traffic shows up on a
    /// different relay, our NAT mapping most likely changed: follow the peer
    /// there right away.
    pub fn on_packet_from(&mut self, id: u64, unacked_span: u32) -> Option<PathSwitch> {
        if self.current == Some(id) || unacked_span <= ACK_WINDOW {
            return None;
        }
        let endpoint = self.endpoints.get(id)?;
        if !endpoint.kind.is_relay() {
            return None;
        }
        if endpoint.kind == EndpointKind::TcpRelay {
            self.use_tcp = true;
        }
        self.preferred_relay = Some(id);
        self.switch_to(id, SwitchReason::NatRebinding)
    }

    pub fn reset_rtts(&self) {
        self.endpoints.for_each(Endpoint::reset_rtt);
    }

    /// Direct path went silent: return to the preferred relay
    pub fn fall_back_to_relay(&mut self) -> Option<PathSwitch> {
        self.reset_rtts();
        let to = self.preferred_relay?;
        self.switch_to(to, SwitchReason::ReceiveTimeout)
    }

    /// Local network changed: forget direct paths and re-probe UDP
    pub fn network_changed(&mut self) -> Option<PathSwitch> {
        let removed = self.endpoints.retain(|e| e.kind.is_relay());
        if !removed.is_empty() {
            debug!("Dropped {} direct endpoint(s)", removed.len());
        }
        self.reset_rtts();
        if self.use_tcp {
            let udp = self
                .endpoints
                .snapshot()
                .into_iter()
                .find(|e| e.kind == EndpointKind::UdpRelay && !e.is_ipv6());
            if let Some(udp) = udp {
                self.use_tcp = false;
                self.preferred_relay = Some(udp.id);
            }
        }
        self.start_udp_probe();
        let to = self.preferred_relay?;
        self.switch_to(to, SwitchReason::NetworkChanged)
    }

    /// Learn a direct address of the peer
    pub fn add_p2p(&mut self, id: u64, kind: EndpointKind, address: SocketAddr) {
        if !self.allow_p2p {
            return;
        }
        let tag = self
            .preferred_relay
            .and_then(|r| self.endpoints.get(r))
            .map(|r| r.peer_tag)
            .unwrap_or_default();
        if let Some(existing) = self.endpoints.get(id) {
            if existing.kind.is_relay() {
                warn!("Endpoint {:#x} is a relay, not replacing it with {}", id, address);
                return;
            }
            if existing.address == address {
                return;
            }
        }
        debug!("Direct endpoint {} ({}) at {}", id, kind.as_str(), address);
        self.endpoints.insert(Endpoint::new(id, kind, address, tag));
    }

    /// Whether `id` is currently used for sending
    pub fn is_current(&self, id: u64) -> bool {
        self.current == Some(id)
    }

    pub fn switch_to_tcp(&mut self, id: u64) -> Option<PathSwitch> {
        self.use_tcp = true;
        self.preferred_relay = Some(id);
        self.switch_to(id, SwitchReason::UdpUnavailable)
    }
}

/// Order RTTs, unknown (0) last
fn rtt_order(a: f64, b: f64) -> std::cmp::Ordering {
    let key = |v: f64| if v > 0.0 { v } else { f64::MAX };
    key(a).total_cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::endpoint::{P2P_INET_ID, P2P_LAN_ID, TCP_ID_TAG};
    use std::net::Ipv4Addr;

    fn relay(id: u64, last_octet: u8, tcp: bool) -> RelayDescriptor {
        RelayDescriptor {
            id,
            ipv4: Some(Ipv4Addr::new(192, 0, 2, last_octet)),
            ipv6: None,
            port: 1400,
            peer_tag: [id as u8; 16],
            tcp,
        }
    }

    fn selector(relays: &[RelayDescriptor], allow_p2p: bool) -> EndpointSelector {
        let mut selector = EndpointSelector::new(EndpointMap::new(), &SessionConfig::default());
        selector.set_relays(relays, allow_p2p);
        selector
    }

    fn set_rtt(selector: &EndpointSelector, id: u64, ms: u64) {
        selector.endpoints().with(id, |e| {
            e.reset_rtt();
            e.add_rtt_sample(Duration::from_millis(ms));
        });
    }

    #[test]
    fn test_initial_current_is_first_udp_relay() {
        let s = selector(&[relay(10, 1, true), relay(20, 2, false)], false);
        assert_eq!(s.current(), Some(10));
        assert_eq!(s.preferred_relay(), Some(10));
        assert!(!s.use_tcp());
        assert_eq!(s.routing_tag(10), Some([10; 16]));
    }

    #[test]
    fn test_relay_hysteresis_small_difference_keeps_preferred() {
        let mut s = selector(&[relay(10, 1, false), relay(20, 2, false)], false);
        set_rtt(&s, 10, 100);
        set_rtt(&s, 20, 96);
        assert_eq!(s.evaluate_paths(), None);
        assert_eq!(s.preferred_relay(), Some(10));
    }

    #[test]
    fn test_relay_hysteresis_large_difference_switches() {
        let mut s = selector(&[relay(10, 1, false), relay(20, 2, false)], false);
        set_rtt(&s, 10, 100);
        set_rtt(&s, 20, 70);
        let switch = s.evaluate_paths().unwrap();
        assert_eq!(switch.to, 20);
        assert_eq!(switch.reason, SwitchReason::BetterRelay);
        assert_eq!(s.preferred_relay(), Some(20));
        assert_eq!(s.current(), Some(20));
    }

    #[test]
    fn test_p2p_switch_and_fallback() {
        let mut s = selector(&[relay(10, 1, false)], true);
        s.add_p2p(P2P_INET_ID, EndpointKind::P2pInet, "198.51.100.7:5000".parse().unwrap());
        // Direct paths borrow the relay's tag
        assert_eq!(s.routing_tag(P2P_INET_ID), Some([10; 16]));

        set_rtt(&s, 10, 100);
        set_rtt(&s, P2P_INET_ID, 70);
        // 70 is not below 100 * 0.6
        assert_eq!(s.evaluate_paths(), None);

        set_rtt(&s, P2P_INET_ID, 40);
        let switch = s.evaluate_paths().unwrap();
        assert_eq!(switch.reason, SwitchReason::P2pFaster);
        assert!(!s.on_relay());

        // Relay preference changes never yank an active direct path
        set_rtt(&s, P2P_INET_ID, 200);
        let switch = s.evaluate_paths().unwrap();
        assert_eq!(switch.reason, SwitchReason::P2pDegraded);
        assert_eq!(s.current(), Some(10));
    }

    #[test]
    fn test_p2p_keeps_relay_with_low_id() {
        let mut s = selector(&[relay(1, 1, false), relay(2, 2, false)], true);
        s.add_p2p(P2P_INET_ID, EndpointKind::P2pInet, "198.51.100.7:5000".parse().unwrap());
        s.add_p2p(P2P_LAN_ID, EndpointKind::P2pLan, "10.0.0.7:5000".parse().unwrap());

        assert_eq!(s.endpoints().get(1).unwrap().kind, EndpointKind::UdpRelay);
        assert_eq!(s.endpoints().get(2).unwrap().kind, EndpointKind::UdpRelay);
        assert_eq!(s.current(), Some(1));
        assert!(s.on_relay());
        assert_eq!(s.routing_tag(P2P_INET_ID), Some([1; 16]));
        assert_eq!(s.endpoints().len(), 4);

        // A direct endpoint can never take over a relay's slot
        s.add_p2p(1, EndpointKind::P2pInet, "198.51.100.8:5000".parse().unwrap());
        assert_eq!(s.endpoints().get(1).unwrap().kind, EndpointKind::UdpRelay);
    }

    #[test]
    fn test_relay_with_reserved_id_bits_ignored() {
        let s = selector(&[relay(P2P_INET_ID, 1, false), relay(20, 2, false)], true);
        assert!(!s.endpoints().contains(P2P_INET_ID));
        assert_eq!(s.current(), Some(20));
    }

    #[test]
    fn test_p2p_ignored_when_not_allowed() {
        let mut s = selector(&[relay(10, 1, false)], false);
        s.add_p2p(P2P_INET_ID, EndpointKind::P2pInet, "198.51.100.7:5000".parse().unwrap());
        assert!(!s.endpoints().contains(P2P_INET_ID));
    }

    #[test]
    fn test_nat_rebinding_switch() {
        let mut s = selector(&[relay(10, 1, false), relay(20, 2, false)], false);
        assert_eq!(s.on_packet_from(20, 5), None);
        let switch = s.on_packet_from(20, ACK_WINDOW + 1).unwrap();
        assert_eq!(switch.reason, SwitchReason::NatRebinding);
        assert_eq!(s.current(), Some(20));
        assert_eq!(s.preferred_relay(), Some(20));
    }

    #[test]
    fn test_probe_falls_back_to_tcp() {
        let start = Instant::now();
        let mut s = selector(&[relay(10, 1, true), relay(20, 2, true)], false);
        s.start_udp_probe();

        let mut round = 0;
        loop {
            let now = start + Duration::from_millis(500 * round);
            let (pings, outcome) = s.probe_round(now);
            if outcome != ProbeOutcome::Pending {
                assert_eq!(outcome, ProbeOutcome::SwitchedToTcp(20 ^ TCP_ID_TAG));
                break;
            }
            // Only TCP relays answer; relay 20 is faster
            for ping in pings {
                let endpoint = s.endpoints().get(ping.endpoint_id).unwrap();
                if endpoint.kind != EndpointKind::TcpRelay {
                    continue;
                }
                if let PingKind::Reflector { query_id } = ping.kind {
                    let delay = if ping.endpoint_id == 20 ^ TCP_ID_TAG { 30 } else { 90 };
                    s.endpoints().with(ping.endpoint_id, |e| {
                        e.add_rtt_sample(Duration::from_millis(delay))
                    });
                    s.on_self_info(ping.endpoint_id, query_id, now + Duration::from_millis(delay));
                }
            }
            round += 1;
            assert!(round <= 7, "probe never finished");
        }

        assert!(s.use_tcp());
        assert_eq!(s.current(), Some(20 ^ TCP_ID_TAG));
        assert_eq!(s.udp_connectivity(), UdpConnectivity::Bad);
    }

    #[test]
    fn test_probe_confirms_udp() {
        let start = Instant::now();
        let mut s = selector(&[relay(10, 1, true)], false);
        s.start_udp_probe();
        let (pings, _) = s.probe_round(start);
        let udp_ping = pings.iter().find(|p| p.endpoint_id == 10).unwrap();
        if let PingKind::Reflector { query_id } = udp_ping.kind {
            assert!(s.on_self_info(10, query_id, start).is_some());
        }
        assert_eq!(s.probe_round(start).1, ProbeOutcome::UdpGood);
        assert!(!s.use_tcp());
        assert!(!s.probing());
    }

    #[test]
    fn test_pings_due_respect_interval() {
        let now = Instant::now();
        let mut s = selector(&[relay(10, 1, true)], false);
        let pings = s.pings_due(now);
        // Session + reflector ping to the UDP relay; TCP relay is idle
        assert_eq!(pings.len(), 2);
        assert!(pings.iter().all(|p| p.endpoint_id == 10));
        assert!(s.pings_due(now + Duration::from_secs(1)).is_empty());
        assert_eq!(s.pings_due(now + Duration::from_secs(10)).len(), 2);
    }

    #[test]
    fn test_pong_updates_rtt() {
        let now = Instant::now();
        let mut s = selector(&[relay(10, 1, false)], false);
        let pings = s.pings_due(now);
        let PingKind::Session { seq } = pings[0].kind else {
            panic!("expected session ping first");
        };
        let rtt = s.on_pong(10, seq, now + Duration::from_millis(55));
        assert_eq!(rtt, Some(Duration::from_millis(55)));
        assert!(s.endpoints().get(10).unwrap().has_rtt());
    }

    #[test]
    fn test_network_change_drops_direct_paths() {
        let mut s = selector(&[relay(10, 1, false)], true);
        s.add_p2p(P2P_INET_ID, EndpointKind::P2pInet, "198.51.100.7:5000".parse().unwrap());
        set_rtt(&s, 10, 100);
        set_rtt(&s, P2P_INET_ID, 10);
        s.evaluate_paths();
        assert_eq!(s.current(), Some(P2P_INET_ID));

        let switch = s.network_changed().unwrap();
        assert_eq!(switch.reason, SwitchReason::NetworkChanged);
        assert_eq!(s.current(), Some(10));
        assert!(!s.endpoints().contains(P2P_INET_ID));
        assert!(!s.endpoints().get(10).unwrap().has_rtt());
        assert!(s.probing());
    }
}
