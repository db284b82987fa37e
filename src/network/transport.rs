//! Socket layer
//!
//! One UDP socket carries every datagram path (relays and direct peers). TCP
//! relays get one obfuscated link each. Everything received is funneled into
//! a single [`TransportEvent`] channel read by the session's message task.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::error::NetworkError;
use super::obfuscated_tcp;
use super::socks5;
use crate::config::ProxyConfig;

const MAX_DATAGRAM: usize = 2048;
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_SEND_QUEUE: usize = 128;

/// Input for the message task
#[derive(Debug)]
pub enum TransportEvent {
    Datagram { from: SocketAddr, data: Vec<u8> },
    TcpConnected { endpoint_id: u64 },
    TcpFrame { endpoint_id: u64, data: Vec<u8> },
    TcpClosed { endpoint_id: u64, reason: String },
}

/// UDP transport for every datagram path
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// SOCKS5 UDP relay all datagrams are tunneled through, when set
    socks_relay: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    /// Bind with SO_REUSEADDR; an IPv6 wildcard bind is dual-stack
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = addr.parse()?;

        let domain = if parsed_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if parsed_addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&parsed_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            socks_relay: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tunnel all datagrams through a SOCKS5 UDP relay
    pub fn set_socks_relay(&self, relay: Option<SocketAddr>) {
        *self.socks_relay.lock() = relay;
    }

    /// IPv4 destinations on a dual-stack socket need the mapped form
    fn destination(&self, addr: SocketAddr) -> SocketAddr {
        match (self.local_addr.ip(), addr.ip()) {
            (IpAddr::V6(_), IpAddr::V4(v4)) => {
                SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port())
            }
            _ => addr,
        }
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        let relay = *self.socks_relay.lock();
        match relay {
            Some(relay) => {
                let wrapped = socks5::wrap_udp(addr, data);
                self.socket
                    .send_to(&wrapped, self.destination(relay))
                    .await?;
            }
            None => {
                self.socket.send_to(data, self.destination(addr)).await?;
            }
        }
        trace!("Sent {} bytes to {}", data.len(), addr);
        Ok(())
    }

    /// Receive one datagram, unwrapping the SOCKS header when tunneled
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), NetworkError> {
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            buf.truncate(len);

            let relay = *self.socks_relay.lock();
            if let Some(relay) = relay {
                if normalize(addr) == normalize(relay) {
                    match socks5::unwrap_udp(&buf) {
                        Some((from, payload)) => return Ok((payload.to_vec(), from)),
                        None => {
                            trace!("Dropping malformed SOCKS datagram");
                            continue;
                        }
                    }
                }
            }
            trace!("Received {} bytes from {}", len, addr);
            return Ok((buf, normalize(addr)));
        }
    }

    /// Forward received datagrams until `shutdown` fires or the channel closes
    pub fn start_receive_loop(
        self: Arc<Self>,
        tx: mpsc::Sender<TransportEvent>,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("Receive loop stopping");
                        break;
                    }
                    result = self.recv_from() => match result {
                        Ok((data, from)) => {
                            if tx.send(TransportEvent::Datagram { from, data }).await.is_err() {
                                debug!("Receive channel closed, stopping receive loop");
                                break;
                            }
                        }
                        // ICMP unreachable surfaces here on some platforms
                        Err(e) => debug!("Receive error: {}", e),
                    }
                }
            }
        })
    }
}

fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Sending side of an open (or opening) TCP relay link
///
/// The link task is aborted when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct TcpLinkHandle {
    endpoint_id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    _task: Arc<AbortOnDrop>,
}

impl TcpLinkHandle {
    /// Start connecting to a TCP relay; frames are queued until connected
    pub fn open(
        endpoint_id: u64,
        address: SocketAddr,
        proxy: Option<ProxyConfig>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(TCP_SEND_QUEUE);
        let task = tokio::spawn(async move {
            let reason = match run_link(endpoint_id, address, proxy, rx, &events).await {
                Ok(()) => "closed".to_string(),
                Err(e) => {
                    warn!("TCP relay link {} ({}) failed: {}", endpoint_id, address, e);
                    e.to_string()
                }
            };
            let _ = events
                .send(TransportEvent::TcpClosed {
                    endpoint_id,
                    reason,
                })
                .await;
        });
        Self {
            endpoint_id,
            tx,
            _task: Arc::new(AbortOnDrop(task)),
        }
    }

    pub fn endpoint_id(&self) -> u64 {
        self.endpoint_id
    }

    /// Queue one frame without waiting
    pub fn send(&self, data: Vec<u8>) -> Result<(), NetworkError> {
        self.tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_link(
    endpoint_id: u64,
    address: SocketAddr,
    proxy: Option<ProxyConfig>,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    events: &mpsc::Sender<TransportEvent>,
) -> Result<(), NetworkError> {
    let stream = match &proxy {
        Some(proxy) => socks5::connect(proxy, address).await?,
        None => tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::ConnectionTimeout)??,
    };
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let (header, mut sealer, mut opener) = obfuscated_tcp::client_handshake(&mut rand::thread_rng())?;
    writer.write_all(&header).await?;
    info!("TCP relay link {} connected to {}", endpoint_id, address);
    if events
        .send(TransportEvent::TcpConnected { endpoint_id })
        .await
        .is_err()
    {
        return Ok(());
    }

    // Reads are not cancel safe, so writing runs in its own task
    let mut write_task = AbortOnDrop(tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            let sealed = match sealer.seal(&frame) {
                Ok(sealed) => sealed,
                Err(e) => {
                    debug!("Dropping TCP frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&sealed).await {
                warn!("TCP link {} write failed: {}", endpoint_id, e);
                return;
            }
            trace!("TCP link {} sent {} bytes", endpoint_id, frame.len());
        }
    }));

    loop {
        tokio::select! {
            _ = &mut write_task.0 => return Ok(()),
            frame = opener.read_frame(&mut reader) => {
                let data = frame?;
                if events.send(TransportEvent::TcpFrame { endpoint_id, data }).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
