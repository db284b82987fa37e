//! Minimal relay for testing voxlink calls locally
//!
//! Forwards session packets between the two participants sharing a peer
//! tag, answers reflector pings with signed self-info and tells both
//! participants each other's address once they are known. Serves UDP and
//! obfuscated TCP on the same port.
//!
//! Run with:
//!   cargo run --bin relay-server -- --port 1400
//!
//! Environment variables:
//!   RELAY_PORT - Port to listen on (default: 1400)
//!   RUST_LOG - Log level (default: info)

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;

use voxlink::network::obfuscated_tcp::{self, HEADER_LEN};
use voxlink::network::UdpTransport;
use voxlink::protocol::{is_relay_control, PeerTag, RelayRequest, RelayResponse, PEER_TAG_LEN};

/// Relay for voxlink call testing
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Minimal UDP/TCP relay for voxlink calls")]
struct Args {
    /// Port to listen on (UDP and TCP)
    #[arg(short, long, default_value = "1400", env = "RELAY_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Forget participants idle for this many seconds
    #[arg(long, default_value = "60")]
    idle_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Frames queued per TCP client
const TCP_QUEUE: usize = 256;

/// Where a participant is reachable
#[derive(Debug, Clone)]
enum PeerLink {
    Udp(SocketAddr),
    Tcp {
        conn_id: u64,
        tx: mpsc::Sender<Vec<u8>>,
    },
}

impl PeerLink {
    fn same(&self, other: &PeerLink) -> bool {
        match (self, other) {
            (PeerLink::Udp(a), PeerLink::Udp(b)) => a == b,
            (PeerLink::Tcp { conn_id: a, .. }, PeerLink::Tcp { conn_id: b, .. }) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Participant {
    link: PeerLink,
    last_seen: Instant,
}

/// Participants per peer tag
#[derive(Debug, Default)]
struct RelayTable {
    rooms: HashMap<PeerTag, Vec<Participant>>,
    peer_info_sent: HashSet<PeerTag>,
}

impl RelayTable {
    /// Register the sender and return the other participant, if known
    ///
    /// A room holds two participants; a third link replaces the one heard
    /// from least recently (NAT rebinding, UDP to TCP switch).
    fn route(&mut self, tag: PeerTag, from: PeerLink, now: Instant) -> Option<PeerLink> {
        let room = self.rooms.entry(tag).or_default();
        match room.iter_mut().find(|p| p.link.same(&from)) {
            Some(participant) => participant.last_seen = now,
            None => {
                if room.len() >= 2 {
                    if let Some(oldest) = room
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| p.last_seen)
                        .map(|(i, _)| i)
                    {
                        room.remove(oldest);
                    }
                    self.peer_info_sent.remove(&tag);
                }
                room.push(Participant {
                    link: from.clone(),
                    last_seen: now,
                });
            }
        }
        room.iter()
            .find(|p| !p.link.same(&from))
            .map(|p| p.link.clone())
    }

    /// Both participants' UDP v4 addresses, once per pairing
    fn take_peer_info(&mut self, tag: PeerTag) -> Option<(SocketAddr, SocketAddr)> {
        if self.peer_info_sent.contains(&tag) {
            return None;
        }
        let room = self.rooms.get(&tag)?;
        let [a, b] = room.as_slice() else {
            return None;
        };
        match (&a.link, &b.link) {
            (PeerLink::Udp(a @ SocketAddr::V4(_)), PeerLink::Udp(b @ SocketAddr::V4(_))) => {
                self.peer_info_sent.insert(tag);
                Some((*a, *b))
            }
            _ => None,
        }
    }

    fn expire(&mut self, now: Instant, idle: Duration) -> usize {
        let mut removed = 0;
        self.rooms.retain(|_, room| {
            let before = room.len();
            room.retain(|p| now.saturating_duration_since(p.last_seen) < idle);
            removed += before - room.len();
            !room.is_empty()
        });
        let rooms = &self.rooms;
        self.peer_info_sent.retain(|tag| rooms.contains_key(tag));
        removed
    }
}

struct Relay {
    transport: Arc<UdpTransport>,
    table: Mutex<RelayTable>,
    packets_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
    control_requests: AtomicU64,
}

impl Relay {
    async fn send(&self, link: &PeerLink, data: Vec<u8>) {
        match link {
            PeerLink::Udp(addr) => {
                if let Err(e) = self.transport.send_to(&data, *addr).await {
                    warn!("Failed to send to {}: {}", addr, e);
                }
            }
            PeerLink::Tcp { conn_id, tx } => {
                if tx.try_send(data).is_err() {
                    debug!("TCP client {} queue full or closed", conn_id);
                }
            }
        }
    }

    /// Handle one packet from a participant reachable via `from`
    async fn handle(&self, data: Vec<u8>, from: PeerLink, public_addr: SocketAddr) {
        if is_relay_control(&data) {
            self.handle_control(&data, &from, public_addr).await;
            return;
        }
        if data.len() <= PEER_TAG_LEN {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut tag = [0u8; PEER_TAG_LEN];
        tag.copy_from_slice(&data[..PEER_TAG_LEN]);

        let (target, peer_info) = {
            let mut table = self.table.lock();
            let target = table.route(tag, from, Instant::now());
            (target, table.take_peer_info(tag))
        };

        if let Some((a, b)) = peer_info {
            self.send_peer_info(&tag, a, b).await;
        }

        match target {
            Some(target) => {
                trace!("Forwarding {} bytes from {}", data.len(), public_addr);
                self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                self.send(&target, data).await;
            }
            None => {
                trace!("No peer yet for packet from {}", public_addr);
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn handle_control(&self, data: &[u8], from: &PeerLink, public_addr: SocketAddr) {
        let (tag, request) = match RelayRequest::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Bad relay request from {}: {}", public_addr, e);
                return;
            }
        };
        self.control_requests.fetch_add(1, Ordering::Relaxed);
        let response = match request {
            RelayRequest::Ping { query_id } => RelayResponse::SelfInfo {
                date: unix_time(),
                query_id,
                public_addr,
            },
            RelayRequest::RequestPacketsInfo { query_id } => RelayResponse::LastPacketsInfo {
                date: unix_time(),
                query_id,
                // Payloads are opaque here, so there are no sequence numbers to report
                packet_ids: Vec::new(),
            },
        };
        self.send(from, response.encode(&tag)).await;
    }

    async fn send_peer_info(&self, tag: &PeerTag, a: SocketAddr, b: SocketAddr) {
        let (SocketAddr::V4(a4), SocketAddr::V4(b4)) = (a, b) else {
            return;
        };
        info!("Introducing {} and {}", a, b);
        let to_a = RelayResponse::PeerInfo {
            my_addr: a4,
            peer_addr: b4,
        };
        let to_b = RelayResponse::PeerInfo {
            my_addr: b4,
            peer_addr: a4,
        };
        self.send(&PeerLink::Udp(a), to_a.encode(tag)).await;
        self.send(&PeerLink::Udp(b), to_b.encode(tag)).await;
    }
}

fn unix_time() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}

async fn serve_tcp_client(relay: Arc<Relay>, conn_id: u64, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = run_tcp_client(relay, conn_id, stream, peer).await {
        debug!("TCP client {} ({}) ended: {}", conn_id, peer, e);
    }
}

async fn run_tcp_client(
    relay: Arc<Relay>,
    conn_id: u64,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut header = [0u8; HEADER_LEN];
    tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut header)).await??;
    let (mut sealer, mut opener) = obfuscated_tcp::server_handshake(&header)?;
    info!("TCP client {} connected from {}", conn_id, peer);

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(TCP_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let sealed = match sealer.seal(&frame) {
                Ok(sealed) => sealed,
                Err(e) => {
                    debug!("Dropping frame for TCP client {}: {}", conn_id, e);
                    continue;
                }
            };
            if writer.write_all(&sealed).await.is_err() {
                break;
            }
        }
    });

    let link = PeerLink::Tcp { conn_id, tx };
    let result = loop {
        match opener.read_frame(&mut reader).await {
            Ok(frame) => relay.handle(frame, link.clone(), peer).await,
            Err(e) => break Err(e.into()),
        }
    };
    writer_task.abort();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .compact()
        .init();

    let addr = format!("{}:{}", args.host, args.port);
    let transport = Arc::new(UdpTransport::bind(&addr).await?);
    let listener = TcpListener::bind(transport.local_addr()).await?;
    info!(
        "Relay listening on {} (UDP and TCP)",
        transport.local_addr()
    );

    let relay = Arc::new(Relay {
        transport: transport.clone(),
        table: Mutex::new(RelayTable::default()),
        packets_forwarded: AtomicU64::new(0),
        packets_dropped: AtomicU64::new(0),
        control_requests: AtomicU64::new(0),
    });
    let idle = Duration::from_secs(args.idle_timeout);

    let mut stats_interval = tokio::time::interval(Duration::from_secs(60));
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut next_conn_id = 1u64;

    loop {
        tokio::select! {
            result = transport.recv_from() => match result {
                Ok((data, from)) => relay.handle(data, PeerLink::Udp(from), from).await,
                Err(e) => debug!("Receive error: {}", e),
            },

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    tokio::spawn(serve_tcp_client(relay.clone(), conn_id, stream, peer));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },

            _ = stats_interval.tick() => {
                let expired = relay.table.lock().expire(Instant::now(), idle);
                info!(
                    "Stats: forwarded={}, dropped={}, control={}, rooms={}, expired={}",
                    relay.packets_forwarded.load(Ordering::Relaxed),
                    relay.packets_dropped.load(Ordering::Relaxed),
                    relay.control_requests.load(Ordering::Relaxed),
                    relay.table.lock().rooms.len(),
                    expired
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp(port: u16) -> PeerLink {
        PeerLink::Udp(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_route_pairs_two_participants() {
        let now = Instant::now();
        let mut table = RelayTable::default();
        let tag = [7u8; PEER_TAG_LEN];

        assert!(table.route(tag, udp(1), now).is_none());
        let to = table.route(tag, udp(2), now).unwrap();
        assert!(to.same(&udp(1)));
        let back = table.route(tag, udp(1), now).unwrap();
        assert!(back.same(&udp(2)));

        assert!(table.take_peer_info(tag).is_some());
        assert!(table.take_peer_info(tag).is_none());
    }

    #[test]
    fn test_third_link_replaces_stalest() {
        let start = Instant::now();
        let mut table = RelayTable::default();
        let tag = [1u8; PEER_TAG_LEN];
        table.route(tag, udp(1), start);
        table.route(tag, udp(2), start + Duration::from_secs(1));
        let to = table
            .route(tag, udp(3), start + Duration::from_secs(2))
            .unwrap();
        assert!(to.same(&udp(2)));
    }

    #[test]
    fn test_expire_idle_participants() {
        let start = Instant::now();
        let mut table = RelayTable::default();
        table.route([2u8; PEER_TAG_LEN], udp(1), start);
        assert_eq!(table.expire(start + Duration::from_secs(61), Duration::from_secs(60)), 1);
        assert!(table.rooms.is_empty());
    }
}
