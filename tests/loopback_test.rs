//! Loopback call tests
//!
//! Two sessions call each other through a minimal UDP relay bound to
//! localhost.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use voxlink::audio::{NullSink, SilenceSource};
use voxlink::config::SessionConfig;
use voxlink::network::RelayDescriptor;
use voxlink::protocol::{is_relay_control, PeerTag, RelayRequest, RelayResponse};
use voxlink::session::{ConnectionState, ErrorCode, Session, SessionError};

const TAG: PeerTag = [0x33; 16];

fn call_key() -> Vec<u8> {
    (0..256u32).map(|i| (i * 13 + 1) as u8).collect()
}

/// Forward datagrams between the first two senders and answer reflector
/// pings with the sender's address
async fn spawn_relay() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut peers: Vec<SocketAddr> = Vec::new();
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let data = &buf[..len];
            if is_relay_control(data) {
                let Ok((tag, request)) = RelayRequest::decode(data) else {
                    continue;
                };
                let response = match request {
                    RelayRequest::Ping { query_id } => RelayResponse::SelfInfo {
                        date: 0,
                        query_id,
                        public_addr: from,
                    },
                    RelayRequest::RequestPacketsInfo { query_id } => {
                        RelayResponse::LastPacketsInfo {
                            date: 0,
                            query_id,
                            packet_ids: Vec::new(),
                        }
                    }
                };
                let _ = socket.send_to(&response.encode(&tag), from).await;
                continue;
            }
            if !peers.contains(&from) && peers.len() < 2 {
                peers.push(from);
            }
            if let Some(&other) = peers.iter().find(|&&p| p != from) {
                let _ = socket.send_to(data, other).await;
            }
        }
    });
    (addr, task)
}

async fn start_session(relay: SocketAddr, originator: bool) -> Session {
    let config = SessionConfig::default();
    let source = SilenceSource::new(config.audio_init_bitrate, config.frame_duration());
    let mut session = Session::new(config, &call_key(), originator).unwrap();
    session.set_bind_address("127.0.0.1:0");
    session
        .set_remote_endpoints(
            &[RelayDescriptor::from_addr(1, relay, TAG, false)],
            false,
            92,
        )
        .unwrap();
    session
        .connect(Box::new(source), Box::new(NullSink::default()))
        .await
        .unwrap();
    session
}

async fn wait_for_state(session: &Session, state: ConnectionState, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    session.state() == state
}

/// Test: Call over a local relay
/// Given a relay on localhost
/// When two sessions with the same key connect through it
/// Then both are established and audio reaches the other side
#[tokio::test]
async fn test_loopback_call_established() {
    let (relay, relay_task) = spawn_relay().await;
    let mut caller = start_session(relay, true).await;
    let mut callee = start_session(relay, false).await;

    assert!(
        wait_for_state(&caller, ConnectionState::Established, Duration::from_secs(10)).await,
        "caller stuck in {}",
        caller.state()
    );
    assert!(
        wait_for_state(&callee, ConnectionState::Established, Duration::from_secs(10)).await,
        "callee stuck in {}",
        callee.state()
    );

    // Let a few audio frames through
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = callee.stats().await.expect("stats while running");
    assert!(stats.udp_relay.bytes_received > 0);
    assert!(stats.jitter.frames_received > 0);
    assert_eq!(stats.decrypt_failures, 0);
    assert!(caller.debug_string().await.starts_with("state: "));

    caller.stop().await;
    callee.stop().await;
    relay_task.abort();
}

/// Test: Keys must match
/// Given two sessions with different keys
/// When they connect through the same relay
/// Then neither gets past the handshake
#[tokio::test]
async fn test_loopback_wrong_key_never_establishes() {
    let (relay, relay_task) = spawn_relay().await;
    let mut caller = start_session(relay, true).await;

    let config = SessionConfig::default();
    let source = SilenceSource::new(config.audio_init_bitrate, config.frame_duration());
    let other_key = vec![0x77u8; 256];
    let mut callee = Session::new(config, &other_key, false).unwrap();
    callee.set_bind_address("127.0.0.1:0");
    callee
        .set_remote_endpoints(&[RelayDescriptor::from_addr(1, relay, TAG, false)], false, 92)
        .unwrap();
    callee
        .connect(Box::new(source), Box::new(NullSink::default()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(caller.state().is_connecting());
    assert!(callee.state().is_connecting());
    assert_eq!(caller.last_error(), None);

    caller.stop().await;
    callee.stop().await;
    relay_task.abort();
}

/// Test: Connecting needs a relay
#[tokio::test]
async fn test_connect_without_endpoints_fails() {
    let mut session = Session::new(SessionConfig::default(), &call_key(), true).unwrap();
    let source = SilenceSource::new(16000, Duration::from_millis(60));
    let result = session
        .connect(Box::new(source), Box::new(NullSink::default()))
        .await;
    assert!(matches!(result, Err(SessionError::NoEndpoints)));
    assert_eq!(session.state(), ConnectionState::Created);
    assert_ne!(session.last_error(), Some(ErrorCode::Timeout));
}
