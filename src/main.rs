//! voxlink - encrypted relay/P2P voice call transport

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use voxlink::audio::{NullSink, SilenceSource};
use voxlink::config::SessionConfig;
use voxlink::network::{RelayDescriptor, UdpTransport, KEY_LEN};
use voxlink::protocol::{PeerTag, RelayRequest, RelayResponse, PEER_TAG_LEN};
use voxlink::session::{Action, ConnectionState, Session};

#[derive(Parser)]
#[command(name = "voxlink")]
#[command(about = "Encrypted relay/P2P voice call transport")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure the RTT to a relay and show our public address
    PingRelay {
        /// Relay address (IP:PORT)
        address: SocketAddr,

        /// Peer tag as 32 hex digits
        #[arg(long)]
        tag: String,

        /// Number of pings
        #[arg(short, long, default_value = "5")]
        count: u32,

        /// Seconds between pings
        #[arg(long, default_value = "1.0")]
        interval: f64,
    },

    /// Run a call with a synthetic audio source
    Call {
        /// JSON session config (missing fields use defaults)
        #[arg(long)]
        config: Option<String>,

        /// Shared call key as 512 hex digits
        #[arg(long, env = "VOXLINK_KEY")]
        key: String,

        /// Relay as ID@IP:PORT#TAGHEX (repeatable)
        #[arg(long = "relay", required = true)]
        relays: Vec<String>,

        /// Relays also accept TCP on the same port
        #[arg(long)]
        relay_tcp: bool,

        /// We placed the call
        #[arg(long)]
        outgoing: bool,

        /// Allow direct peer-to-peer paths
        #[arg(long)]
        allow_p2p: bool,

        /// Highest protocol layer of the call
        #[arg(long, default_value = "92")]
        max_layer: u32,

        /// Local UDP address
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: String,

        /// Stop after this many seconds (runs until Ctrl-C if omitted)
        #[arg(long)]
        duration: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    match cli.command {
        Commands::PingRelay {
            address,
            tag,
            count,
            interval,
        } => ping_relay(address, &tag, count, interval).await,
        Commands::Call {
            config,
            key,
            relays,
            relay_tcp,
            outgoing,
            allow_p2p,
            max_layer,
            bind,
            duration,
        } => {
            let config = match config {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path))?;
                    SessionConfig::from_json(&json).with_context(|| format!("parsing {}", path))?
                }
                None => SessionConfig::default(),
            };
            let key = parse_hex(&key)?;
            if key.len() != KEY_LEN {
                bail!("key must be {} bytes, got {}", KEY_LEN, key.len());
            }
            let relays = relays
                .iter()
                .map(|r| parse_relay(r, relay_tcp))
                .collect::<Result<Vec<_>>>()?;
            let duration = duration.map(Duration::from_secs);
            run_call(
                config, &key, relays, outgoing, allow_p2p, max_layer, bind, duration,
            )
            .await
        }
    }
}

async fn ping_relay(address: SocketAddr, tag: &str, count: u32, interval: f64) -> Result<()> {
    let tag = parse_tag(tag)?;
    let bind = if address.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let transport = UdpTransport::bind(bind).await?;
    info!("Pinging relay {} from {}", address, transport.local_addr());

    let mut answered = 0u32;
    let mut rtts = Vec::new();
    for query_id in 1..=count as i64 {
        let sent = Instant::now();
        transport
            .send_to(&RelayRequest::Ping { query_id }.encode(&tag), address)
            .await?;

        let deadline = sent + Duration::from_secs(2);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(received) = tokio::time::timeout(remaining, transport.recv_from()).await else {
                println!("ping {}: timeout", query_id);
                break;
            };
            let (data, from) = received?;
            if from != address {
                continue;
            }
            match RelayResponse::decode(&data, &tag) {
                Ok(RelayResponse::SelfInfo {
                    query_id: id,
                    public_addr,
                    ..
                }) if id == query_id => {
                    let rtt = sent.elapsed();
                    rtts.push(rtt);
                    answered += 1;
                    println!(
                        "ping {}: rtt {:.1} ms, public address {}",
                        query_id,
                        rtt.as_secs_f64() * 1000.0,
                        public_addr
                    );
                    break;
                }
                Ok(other) => info!("Ignoring relay response {:?}", other),
                Err(e) => warn!("Bad relay response: {}", e),
            }
        }
        if query_id < count as i64 {
            tokio::time::sleep(Duration::from_secs_f64(interval.max(0.0))).await;
        }
    }

    let average = if rtts.is_empty() {
        0.0
    } else {
        rtts.iter().map(Duration::as_secs_f64).sum::<f64>() / rtts.len() as f64 * 1000.0
    };
    println!("{}/{} answered, average rtt {:.1} ms", answered, count, average);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    config: SessionConfig,
    key: &[u8],
    relays: Vec<RelayDescriptor>,
    outgoing: bool,
    allow_p2p: bool,
    max_layer: u32,
    bind: String,
    duration: Option<Duration>,
) -> Result<()> {
    let source = SilenceSource::new(config.audio_init_bitrate, config.frame_duration());
    let mut session = Session::new(config, key, outgoing)?;
    session.set_bind_address(bind);
    session.set_remote_endpoints(&relays, allow_p2p, max_layer)?;
    let mut events = session
        .take_events()
        .ok_or_else(|| anyhow!("session events already taken"))?;
    session
        .connect(Box::new(source), Box::new(NullSink::default()))
        .await?;
    if let Some(addr) = session.local_addr() {
        info!("Call running on {}", addr);
    }

    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
    let stop_at = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_at);

    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                Action::StateChanged { state, error } => {
                    println!("state: {}{}", state, error.map(|e| format!(" ({})", e)).unwrap_or_default());
                    if state == ConnectionState::Failed {
                        break;
                    }
                }
                Action::PathChanged { endpoint_id, kind } => {
                    println!("path: {:#x} ({})", endpoint_id, kind.as_str());
                }
                other => info!("Event: {:?}", other),
            },
            _ = report.tick() => println!("{}\n", session.debug_string().await),
            _ = &mut stop_at => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("{}", session.debug_string().await);
    session.stop().await;
    Ok(())
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("invalid hex at offset {}", i))
        })
        .collect()
}

fn parse_tag(s: &str) -> Result<PeerTag> {
    let bytes = parse_hex(s)?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("peer tag must be {} bytes", PEER_TAG_LEN))
}

/// Parse `ID@IP:PORT#TAGHEX`
fn parse_relay(s: &str, tcp: bool) -> Result<RelayDescriptor> {
    let (id, rest) = s
        .split_once('@')
        .ok_or_else(|| anyhow!("relay {:?}: expected ID@IP:PORT#TAG", s))?;
    let (addr, tag) = rest
        .split_once('#')
        .ok_or_else(|| anyhow!("relay {:?}: missing #TAG", s))?;
    let id: u64 = id.parse().with_context(|| format!("relay id {:?}", id))?;
    let addr: SocketAddr = addr.parse().with_context(|| format!("relay address {:?}", addr))?;
    Ok(RelayDescriptor::from_addr(id, addr, parse_tag(tag)?, tcp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay() {
        let relay = parse_relay("7@127.0.0.1:1400#000102030405060708090a0b0c0d0e0f", true).unwrap();
        assert_eq!(relay.id, 7);
        assert_eq!(relay.port, 1400);
        assert_eq!(relay.peer_tag[15], 15);
        assert!(relay.tcp);
        assert!(parse_relay("127.0.0.1:1400#00", false).is_err());
        assert!(parse_relay("1@127.0.0.1:1400#0011", false).is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("00ff10").unwrap(), vec![0, 255, 16]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
