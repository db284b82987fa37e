//! SOCKS5 client (RFC 1928 / RFC 1929)
//!
//! TCP relays are reached with CONNECT. UDP ASSOCIATE opens a datagram relay
//! on the proxy; datagrams to and from it carry the SOCKS UDP header, and the
//! association lives as long as its control connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::error::NetworkError;
use crate::config::ProxyConfig;

const VERSION: u8 = 5;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn proxy_err(msg: impl Into<String>) -> NetworkError {
    NetworkError::Proxy(msg.into())
}

fn put_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
    }
    // SOCKS ports are network byte order
    out.extend_from_slice(&addr.port().to_be_bytes());
}

async fn read_addr(stream: &mut TcpStream) -> Result<SocketAddr, NetworkError> {
    let atyp = stream.read_u8().await?;
    let ip = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            // Bound addresses are expected to be literal IPs
            return Err(proxy_err("proxy replied with a domain name"));
        }
        other => return Err(proxy_err(format!("bad address type {other}"))),
    };
    let port = stream.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

async fn authenticate(stream: &mut TcpStream, proxy: &ProxyConfig) -> Result<(), NetworkError> {
    let with_password = proxy.username.is_some();
    let greeting: &[u8] = if with_password {
        &[VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[VERSION, 1, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(proxy_err("not a SOCKS5 proxy"));
    }
    match reply[1] {
        AUTH_NONE => Ok(()),
        AUTH_PASSWORD if with_password => {
            let user = proxy.username.as_deref().unwrap_or_default().as_bytes();
            let pass = proxy.password.as_deref().unwrap_or_default().as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(proxy_err("credentials too long"));
            }
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(1);
            req.push(user.len() as u8);
            req.extend_from_slice(user);
            req.push(pass.len() as u8);
            req.extend_from_slice(pass);
            stream.write_all(&req).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(proxy_err("authentication rejected"));
            }
            Ok(())
        }
        AUTH_UNACCEPTABLE => Err(proxy_err("no acceptable auth method")),
        other => Err(proxy_err(format!("unexpected auth method {other}"))),
    }
}

async fn command(
    stream: &mut TcpStream,
    cmd: u8,
    target: SocketAddr,
) -> Result<SocketAddr, NetworkError> {
    let mut req = vec![VERSION, cmd, 0];
    put_addr(&mut req, target);
    stream.write_all(&req).await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(proxy_err("bad reply version"));
    }
    if head[1] != 0 {
        return Err(proxy_err(format!("request failed with code {}", head[1])));
    }
    read_addr(stream).await
}

async fn open(proxy: &ProxyConfig) -> Result<TcpStream, NetworkError> {
    let mut stream = TcpStream::connect(proxy.address.as_str()).await?;
    stream.set_nodelay(true)?;
    authenticate(&mut stream, proxy).await?;
    Ok(stream)
}

/// Open a TCP connection to `target` through the proxy
pub async fn connect(proxy: &ProxyConfig, target: SocketAddr) -> Result<TcpStream, NetworkError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let mut stream = open(proxy).await?;
        command(&mut stream, CMD_CONNECT, target).await?;
        debug!("SOCKS5 CONNECT {} via {}", target, proxy.address);
        Ok::<_, NetworkError>(stream)
    })
    .await
    .map_err(|_| NetworkError::ConnectionTimeout)?
}

/// A UDP relay opened on the proxy
pub struct UdpAssociation {
    /// Keeps the association alive
    _control: TcpStream,
    pub relay_addr: SocketAddr,
}

/// Ask the proxy to relay UDP for datagrams sent from `local`
pub async fn udp_associate(
    proxy: &ProxyConfig,
    local: SocketAddr,
) -> Result<UdpAssociation, NetworkError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let mut control = open(proxy).await?;
        let mut relay_addr = command(&mut control, CMD_UDP_ASSOCIATE, local).await?;
        if relay_addr.ip().is_unspecified() {
            // Proxy means "same host as the control connection"
            relay_addr.set_ip(control.peer_addr()?.ip());
        }
        info!("SOCKS5 UDP relay at {}", relay_addr);
        Ok::<_, NetworkError>(UdpAssociation {
            _control: control,
            relay_addr,
        })
    })
    .await
    .map_err(|_| NetworkError::ConnectionTimeout)?
}

/// Prefix a datagram with the SOCKS UDP header
pub fn wrap_udp(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 22);
    out.extend_from_slice(&[0, 0, 0]);
    put_addr(&mut out, target);
    out.extend_from_slice(payload);
    out
}

/// Strip the SOCKS UDP header; fragmented datagrams are not supported
pub fn unwrap_udp(data: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if data.len() < 4 || data[2] != 0 {
        return None;
    }
    let (ip, rest) = match data[3] {
        ATYP_IPV4 if data.len() >= 10 => {
            let octets: [u8; 4] = data[4..8].try_into().ok()?;
            (IpAddr::V4(Ipv4Addr::from(octets)), &data[8..])
        }
        ATYP_IPV6 if data.len() >= 22 => {
            let octets: [u8; 16] = data[4..20].try_into().ok()?;
            (IpAddr::V6(Ipv6Addr::from(octets)), &data[20..])
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Some((SocketAddr::new(ip, port), &rest[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_udp_header() {
        let target: SocketAddr = "192.0.2.9:1400".parse().unwrap();
        let wrapped = wrap_udp(target, b"payload");
        assert_eq!(wrapped.len(), 10 + 7);
        let (addr, payload) = unwrap_udp(&wrapped).unwrap();
        assert_eq!(addr, target);
        assert_eq!(payload, b"payload");

        let v6: SocketAddr = "[2001:db8::2]:53".parse().unwrap();
        assert_eq!(unwrap_udp(&wrap_udp(v6, &[])).unwrap().0, v6);

        // Fragmented
        let mut frag = wrapped.clone();
        frag[2] = 1;
        assert!(unwrap_udp(&frag).is_none());
        assert!(unwrap_udp(&wrapped[..6]).is_none());
    }

    /// Minimal proxy: no auth, answers one CONNECT with a fixed bound address
    async fn fake_proxy(listener: TcpListener, reply_code: u8) {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        s.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [VERSION, 1, AUTH_NONE]);
        s.write_all(&[VERSION, AUTH_NONE]).await.unwrap();

        let mut req = [0u8; 10];
        s.read_exact(&mut req).await.unwrap();
        assert_eq!(req[1], CMD_CONNECT);
        s.write_all(&[VERSION, reply_code, 0, ATYP_IPV4, 10, 0, 0, 1, 0x05, 0x78])
            .await
            .unwrap();
        if reply_code == 0 {
            s.write_all(b"hi").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = ProxyConfig {
            address: listener.local_addr().unwrap().to_string(),
            username: None,
            password: None,
        };
        tokio::spawn(fake_proxy(listener, 0));

        let mut stream = connect(&proxy, "192.0.2.1:443".parse().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_refused_by_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = ProxyConfig {
            address: listener.local_addr().unwrap().to_string(),
            username: None,
            password: None,
        };
        tokio::spawn(fake_proxy(listener, 5));

        let err = connect(&proxy, "192.0.2.1:443".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Proxy(_)));
    }
}
