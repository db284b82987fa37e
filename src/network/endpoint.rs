//! Network path candidates
//!
//! An [`Endpoint`] is one way of reaching the peer: a UDP or TCP relay, or a
//! direct address. Relays arrive as [`RelayDescriptor`]s and expand into up
//! to four endpoints (UDP/TCP over IPv4/IPv6) whose ids are the relay id
//! XOR-tagged by transport and family.
//!
//! The session keeps its endpoints in one [`EndpointMap`]. The receive loop
//! reads it to route TCP frames while the message task mutates it, so all
//! access goes through its mutex.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::history::History;
use super::transport::TcpLinkHandle;
use crate::protocol::PeerTag;

/// Id tag of relay endpoints reached over IPv6
pub const IPV6_ID_TAG: u64 = 1 << 63;
/// Id tag of relay endpoints reached over TCP
pub const TCP_ID_TAG: u64 = 1 << 62;

/// Id tag of direct peer endpoints; relay ids never carry it
pub const P2P_ID_TAG: u64 = 1 << 61;
/// Bits of an endpoint id that are not part of a relay id
pub const RESERVED_ID_BITS: u64 = IPV6_ID_TAG | TCP_ID_TAG | P2P_ID_TAG;

/// Reserved id of the peer's public IPv4 address
pub const P2P_INET_ID: u64 = P2P_ID_TAG | 1;
/// Reserved id of the peer's public IPv6 address
pub const P2P_INET6_ID: u64 = P2P_ID_TAG | 2;
/// Reserved id of the peer's LAN address
pub const P2P_LAN_ID: u64 = P2P_ID_TAG | 3;

const RTT_HISTORY_LEN: usize = 6;
const SELF_RTT_HISTORY_LEN: usize = 4;
/// Unanswered pings older than this are forgotten
pub const PENDING_PING_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    P2pInet,
    P2pLan,
    UdpRelay,
    TcpRelay,
}

impl EndpointKind {
    pub fn is_relay(self) -> bool {
        matches!(self, EndpointKind::UdpRelay | EndpointKind::TcpRelay)
    }

    pub fn is_p2p(self) -> bool {
        !self.is_relay()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::P2pInet => "p2p-inet",
            EndpointKind::P2pLan => "p2p-lan",
            EndpointKind::UdpRelay => "udp-relay",
            EndpointKind::TcpRelay => "tcp-relay",
        }
    }
}

/// One path to the peer
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: u64,
    pub kind: EndpointKind,
    pub address: SocketAddr,
    pub peer_tag: PeerTag,
    /// RTT through this path to the peer (seconds)
    pub rtt_history: History<f64>,
    /// RTT to the relay itself, from reflector pings (seconds)
    pub self_rtt_history: History<f64>,
    pub average_rtt: f64,
    pub last_ping_seq: u32,
    pub last_ping_time: Option<Instant>,
    pub pending_pings: HashMap<u32, Instant>,
    pub pending_self_pings: HashMap<i64, Instant>,
    pub udp_replies: u32,
    /// Open link, TCP relays only
    pub tcp: Option<TcpLinkHandle>,
}

impl Endpoint {
    pub fn new(id: u64, kind: EndpointKind, address: SocketAddr, peer_tag: PeerTag) -> Self {
        Self {
            id,
            kind,
            address,
            peer_tag,
            rtt_history: History::new(RTT_HISTORY_LEN),
            self_rtt_history: History::new(SELF_RTT_HISTORY_LEN),
            average_rtt: 0.0,
            last_ping_seq: 0,
            last_ping_time: None,
            pending_pings: HashMap::new(),
            pending_self_pings: HashMap::new(),
            udp_replies: 0,
            tcp: None,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Whether an RTT sample is known for this path
    pub fn has_rtt(&self) -> bool {
        self.average_rtt > 0.0
    }

    pub fn add_rtt_sample(&mut self, rtt: Duration) {
        // Keep zero-RTT loopback paths distinguishable from "unknown"
        self.rtt_history.add(rtt.as_secs_f64().max(1e-6));
        self.average_rtt = self.rtt_history.average();
    }

    pub fn reset_rtt(&mut self) {
        self.rtt_history.reset();
        self.self_rtt_history.reset();
        self.average_rtt = 0.0;
        self.pending_pings.clear();
        self.pending_self_pings.clear();
    }

    pub fn ping_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_ping_time
            .map_or(true, |t| now.saturating_duration_since(t) >= interval)
    }

    pub fn record_ping(&mut self, seq: u32, now: Instant) {
        self.last_ping_seq = seq;
        self.last_ping_time = Some(now);
        self.pending_pings
            .retain(|_, sent| now.saturating_duration_since(*sent) < PENDING_PING_MAX_AGE);
        self.pending_pings.insert(seq, now);
    }

    /// Match a pong; returns its RTT
    pub fn take_ping(&mut self, seq: u32, now: Instant) -> Option<Duration> {
        let sent = self.pending_pings.remove(&seq)?;
        let rtt = now.saturating_duration_since(sent);
        self.add_rtt_sample(rtt);
        Some(rtt)
    }

    pub fn record_self_ping(&mut self, query_id: i64, now: Instant) {
        self.pending_self_pings
            .retain(|_, sent| now.saturating_duration_since(*sent) < PENDING_PING_MAX_AGE);
        self.pending_self_pings.insert(query_id, now);
    }

    /// Match a reflector reply; returns the RTT to the relay
    pub fn take_self_ping(&mut self, query_id: i64, now: Instant) -> Option<Duration> {
        let sent = self.pending_self_pings.remove(&query_id)?;
        let rtt = now.saturating_duration_since(sent);
        self.self_rtt_history.add(rtt.as_secs_f64());
        Some(rtt)
    }
}

/// A relay as handed to the session by call setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    pub id: u64,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub peer_tag: PeerTag,
    /// Relay also accepts TCP connections on the same port
    pub tcp: bool,
}

impl RelayDescriptor {
    /// Build from a single socket address
    pub fn from_addr(id: u64, address: SocketAddr, peer_tag: PeerTag, tcp: bool) -> Self {
        let (ipv4, ipv6) = match address.ip() {
            IpAddr::V4(v4) => (Some(v4), None),
            IpAddr::V6(v6) => (None, Some(v6)),
        };
        Self {
            id,
            ipv4,
            ipv6,
            port: address.port(),
            peer_tag,
            tcp,
        }
    }

    /// All endpoints this relay offers
    pub fn expand(&self) -> Vec<Endpoint> {
        let mut out = Vec::with_capacity(4);
        let mut add = |id: u64, kind: EndpointKind, ip: IpAddr| {
            out.push(Endpoint::new(
                id,
                kind,
                SocketAddr::new(ip, self.port),
                self.peer_tag,
            ));
        };
        if let Some(v4) = self.ipv4 {
            add(self.id, EndpointKind::UdpRelay, IpAddr::V4(v4));
            if self.tcp {
                add(self.id ^ TCP_ID_TAG, EndpointKind::TcpRelay, IpAddr::V4(v4));
            }
        }
        if let Some(v6) = self.ipv6 {
            add(self.id ^ IPV6_ID_TAG, EndpointKind::UdpRelay, IpAddr::V6(v6));
            if self.tcp {
                add(
                    self.id ^ IPV6_ID_TAG ^ TCP_ID_TAG,
                    EndpointKind::TcpRelay,
                    IpAddr::V6(v6),
                );
            }
        }
        out
    }
}

/// Mutex-guarded endpoint set shared between session tasks
#[derive(Clone, Default)]
pub struct EndpointMap {
    inner: Arc<Mutex<HashMap<u64, Endpoint>>>,
}

impl EndpointMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping an already open TCP link
    pub fn insert(&self, mut endpoint: Endpoint) {
        let mut map = self.inner.lock();
        if let Some(old) = map.get_mut(&endpoint.id) {
            if endpoint.tcp.is_none() {
                endpoint.tcp = old.tcp.take();
            }
        }
        map.insert(endpoint.id, endpoint);
    }

    pub fn remove(&self, id: u64) -> Option<Endpoint> {
        self.inner.lock().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Endpoint> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Run `f` on one endpoint under the lock
    pub fn with<R>(&self, id: u64, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        self.inner.lock().get_mut(&id).map(f)
    }

    /// Run `f` on every endpoint under the lock
    pub fn for_each(&self, mut f: impl FnMut(&mut Endpoint)) {
        for endpoint in self.inner.lock().values_mut() {
            f(endpoint);
        }
    }

    /// Copy of all endpoints, ordered by id
    pub fn snapshot(&self) -> Vec<Endpoint> {
        let mut list: Vec<Endpoint> = self.inner.lock().values().cloned().collect();
        list.sort_by_key(|e| e.id);
        list
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Keep only endpoints matching `f`; returns the removed ones
    pub fn retain(&self, mut f: impl FnMut(&Endpoint) -> bool) -> Vec<Endpoint> {
        let mut map = self.inner.lock();
        let removed: Vec<u64> = map.values().filter(|e| !f(e)).map(|e| e.id).collect();
        removed.iter().filter_map(|id| map.remove(id)).collect()
    }

    /// Datagram endpoint with this source address
    pub fn find_udp_by_addr(&self, address: SocketAddr) -> Option<u64> {
        let address = normalize(address);
        self.inner
            .lock()
            .values()
            .filter(|e| e.kind != EndpointKind::TcpRelay)
            .find(|e| normalize(e.address) == address)
            .map(|e| e.id)
    }

    pub fn attach_tcp(&self, id: u64, link: TcpLinkHandle) -> bool {
        self.with(id, |e| e.tcp = Some(link)).is_some()
    }

    pub fn tcp_link(&self, id: u64) -> Option<TcpLinkHandle> {
        self.inner.lock().get(&id).and_then(|e| e.tcp.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Compare IPv4-mapped IPv6 addresses as plain IPv4
fn normalize(address: SocketAddr) -> SocketAddr {
    match address.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), address.port()),
            None => address,
        },
        IpAddr::V4(_) => address,
    }
}
