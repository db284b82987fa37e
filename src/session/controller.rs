//! Protocol core of a call session
//!
//! [`Controller`] owns every piece of protocol state and never touches a
//! socket or a clock: callers feed it received bytes, timer expirations and
//! outgoing media together with the current `Instant`, and drain the
//! resulting [`Action`]s. The runtime in `session::Session` runs it on the
//! message task; tests drive it directly with a synthetic clock.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::error::SessionError;
use super::scheduler::Scheduler;
use super::state::{ConnectionState, ErrorCode, NetworkType};
use super::streams::{
    fragment_video_frame, MediaStream, PacketSender, StreamReceiver, StreamSet, VideoFrame,
};
use crate::config::SessionConfig;
use crate::network::endpoint::{P2P_INET6_ID, P2P_INET_ID, P2P_LAN_ID};
use crate::network::{
    AckOutcome, BitrateController, CongestionController, EndpointKind, EndpointSelector,
    EndpointMap, EnvelopeVersion, JitterBuffer, JitterBufferConfig, JitterBufferStats, PathSwitch,
    PingKind, PingRequest, ProbeOutcome, RelayDescriptor, ReliableQueue, WireCodec,
};
use crate::protocol::extra::{
    CODEC_OPUS, CODEC_VP8, INIT_FLAG_DATA_SAVING, INIT_FLAG_P2P, INIT_FLAG_SHORT_ENVELOPE,
    INIT_FLAG_VIDEO, NETWORK_CHANGED_FLAG_DATA_SAVING, STREAM_FLAG_ENABLED, STREAM_FLAG_EXTRA_EC,
    STREAM_FLAG_PAUSED,
};
use crate::protocol::{
    is_compatible, is_relay_control, EcFrames, ExtraRecord, Framing, InitAckRecord, InitRecord,
    Packet, RelayRequest, RelayResponse, StreamData, StreamKind, MIN_PROTOCOL_VERSION,
    PEER_TAG_LEN, PROTOCOL_VERSION, STREAM_ID_AUDIO, STREAM_ID_SIGNALING, STREAM_ID_VIDEO,
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);
const CONGESTION_TICK_INTERVAL: Duration = Duration::from_secs(1);
const PING_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Sent media packets remembered for the legacy single sequence space
const LEGACY_MEDIA_SEQS: usize = 128;
/// Group call keys are full-size session keys
const GROUP_CALL_KEY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    SendInit,
    InitTimeout,
    EstablishDeferred,
    Housekeeping,
    CongestionTick,
    Ping,
    UdpProbe,
}

/// Something the runtime has to carry out
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Deliver bytes over an endpoint (UDP datagram or TCP frame)
    Send { endpoint_id: u64, data: Vec<u8> },
    StateChanged {
        state: ConnectionState,
        error: Option<ErrorCode>,
    },
    PathChanged { endpoint_id: u64, kind: EndpointKind },
    /// New audio encoder bitrate (bits per second)
    SetBitrate(u32),
    VideoFrame(VideoFrame),
    RemoteStreamChanged {
        stream_id: u8,
        enabled: bool,
        paused: bool,
    },
    /// The video source should produce a keyframe next
    KeyframeRequested,
    GroupCallKey(Vec<u8>),
    GroupCallUpgradeRequested,
}

/// Traffic over one class of path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Traffic {
    udp_relay: TrafficCounters,
    tcp_relay: TrafficCounters,
    p2p: TrafficCounters,
}

impl Traffic {
    fn counters(&mut self, kind: EndpointKind) -> &mut TrafficCounters {
        match kind {
            EndpointKind::UdpRelay => &mut self.udp_relay,
            EndpointKind::TcpRelay => &mut self.tcp_relay,
            EndpointKind::P2pInet | EndpointKind::P2pLan => &mut self.p2p,
        }
    }
}

/// Snapshot of session health
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub error: Option<ErrorCode>,
    pub current_endpoint: Option<u64>,
    pub current_kind: Option<EndpointKind>,
    pub use_tcp: bool,
    pub udp_relay: TrafficCounters,
    pub tcp_relay: TrafficCounters,
    pub p2p: TrafficCounters,
    pub rtt: Duration,
    pub send_loss: f64,
    pub bitrate: u32,
    pub extra_ec: bool,
    pub jitter: JitterBufferStats,
    pub decrypt_failures: u64,
    pub reliable_dropped: u64,
    pub peer_version: Option<u32>,
}

/// Sans-IO session state machine
pub struct Controller {
    config: Arc<SessionConfig>,
    codec: WireCodec,
    state: ConnectionState,
    last_error: Option<ErrorCode>,
    selector: EndpointSelector,
    streams: StreamSet,
    reliable: ReliableQueue<Vec<ExtraRecord>>,
    congestion: CongestionController,
    bitrate: BitrateController,
    scheduler: Scheduler<TimerKind>,
    actions: VecDeque<Action>,
    /// Framing of everything except Init/InitAck
    framing: Framing,
    peer_version: Option<u32>,
    peer_flags: u32,
    init_ack_received: bool,
    envelope_fallback_tried: bool,
    started: bool,
    last_recv_time: Option<Instant>,
    last_path_eval: Option<Instant>,
    signaling_ack_pending: bool,
    last_extra_hash: HashMap<u8, u64>,
    legacy_media_seqs: VecDeque<(u32, u8)>,
    network_type: NetworkType,
    lan_address: Option<SocketAddrV4>,
    public_address: Option<SocketAddr>,
    group_call_key: Option<Vec<u8>>,
    peer_data_saving: bool,
    traffic: Traffic,
    decrypt_failures: u64,
    next_relay_query: i64,
    /// UDP is unusable (proxy without UDP support)
    tcp_only: bool,
}

impl Controller {
    /// Create a session for a 256-byte shared key
    pub fn new(
        config: Arc<SessionConfig>,
        key: &[u8],
        originator: bool,
    ) -> Result<Self, SessionError> {
        let codec = WireCodec::new(key, originator, EnvelopeVersion::Current)?;
        let jitter = Arc::new(Mutex::new(JitterBuffer::new(JitterBufferConfig::from_session(
            &config,
        ))));
        let audio = MediaStream::audio(CODEC_OPUS, config.frame_duration_ms as u16, jitter);
        let video = config.video_enabled.then(|| MediaStream::video(CODEC_VP8));

        Ok(Self {
            selector: EndpointSelector::new(EndpointMap::new(), &config),
            streams: StreamSet::new(Some(audio), video),
            reliable: ReliableQueue::new(),
            congestion: CongestionController::new(&config),
            bitrate: BitrateController::new(&config),
            config,
            codec,
            state: ConnectionState::Created,
            last_error: None,
            scheduler: Scheduler::new(),
            actions: VecDeque::new(),
            framing: Framing::Legacy,
            peer_version: None,
            peer_flags: 0,
            init_ack_received: false,
            envelope_fallback_tried: false,
            started: false,
            last_recv_time: None,
            last_path_eval: None,
            signaling_ack_pending: false,
            last_extra_hash: HashMap::new(),
            legacy_media_seqs: VecDeque::with_capacity(LEGACY_MEDIA_SEQS),
            network_type: NetworkType::Unknown,
            lan_address: None,
            public_address: None,
            group_call_key: None,
            peer_data_saving: false,
            traffic: Traffic::default(),
            decrypt_failures: 0,
            next_relay_query: 1,
            tcp_only: false,
        })
    }

    // ========================================================================
    // Public surface
    // ========================================================================

    /// Install the relay list before `connect`
    pub fn set_remote_endpoints(
        &mut self,
        relays: &[RelayDescriptor],
        allow_p2p: bool,
        max_protocol_layer: u32,
    ) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        self.selector.set_relays(relays, allow_p2p);
        self.codec
            .set_version(EnvelopeVersion::for_layer(max_protocol_layer));
        Ok(())
    }

    /// Restrict the session to TCP relays; false when there are none
    pub fn force_tcp(&mut self) -> bool {
        let tcp = self
            .selector
            .endpoints()
            .snapshot()
            .into_iter()
            .filter(|e| e.kind == EndpointKind::TcpRelay)
            .map(|e| e.id)
            .min();
        let Some(id) = tcp else {
            return false;
        };
        self.tcp_only = true;
        if let Some(switch) = self.selector.switch_to_tcp(id) {
            self.on_path_switch(switch);
        }
        true
    }

    /// Our LAN address, announced to the peer for a direct path
    pub fn set_lan_address(&mut self, address: Option<SocketAddrV4>) {
        self.lan_address = address;
    }

    /// Start the handshake
    pub fn connect(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        if self.selector.current().is_none() {
            return Err(SessionError::NoEndpoints);
        }
        self.started = true;
        info!(
            "Connecting via endpoint {:?} (envelope {:?})",
            self.selector.current(),
            self.codec.version()
        );
        self.set_state(ConnectionState::WaitInit, None);

        let config = self.config.clone();
        self.scheduler
            .schedule(TimerKind::SendInit, now, Some(config.init_retry_interval()));
        self.scheduler
            .schedule(TimerKind::InitTimeout, now + config.init_timeout(), None);
        self.scheduler.schedule(
            TimerKind::Housekeeping,
            now + HOUSEKEEPING_INTERVAL,
            Some(HOUSEKEEPING_INTERVAL),
        );
        self.scheduler.schedule(
            TimerKind::CongestionTick,
            now + CONGESTION_TICK_INTERVAL,
            Some(CONGESTION_TICK_INTERVAL),
        );
        self.scheduler
            .schedule(TimerKind::Ping, now, Some(PING_TICK_INTERVAL));
        if !self.tcp_only {
            self.start_udp_probe(now);
        }

        self.actions
            .push_back(Action::SetBitrate(self.bitrate.bitrate()));
        self.apply_bitrate_ceiling();
        self.handle_timeout(now);
        Ok(())
    }

    /// Cancel all timers; the session produces no further traffic
    pub fn stop(&mut self) {
        self.scheduler.clear();
        self.reliable.clear();
        info!("Session stopped in state {}", self.state);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Terminal failure reported by the runtime (audio I/O, proxy)
    pub fn fail(&mut self, code: ErrorCode) {
        if self.state == ConnectionState::Failed {
            return;
        }
        warn!("Session failed: {}", code);
        self.scheduler.clear();
        self.reliable.clear();
        self.set_state(ConnectionState::Failed, Some(code));
    }

    /// Switch network type; after connect this behaves as a network change
    pub fn set_network_type(&mut self, network_type: NetworkType, now: Instant) {
        if network_type == self.network_type {
            return;
        }
        let previous = self.network_type;
        self.network_type = network_type;
        self.apply_bitrate_ceiling();
        if !self.started || self.state.is_terminal() {
            return;
        }

        info!("Network changed {:?} -> {:?}", previous, network_type);
        if let Some(switch) = self.selector.network_changed() {
            self.on_path_switch(switch);
        }
        let flags = if self.data_saving_active() {
            NETWORK_CHANGED_FLAG_DATA_SAVING
        } else {
            0
        };
        self.send_reliable(vec![ExtraRecord::NetworkChanged { flags }]);
        self.announce_lan_endpoint();
        if self.tcp_only {
            self.force_tcp();
        } else {
            self.start_udp_probe(now);
        }
        self.flush_reliable(now);
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    /// Shared jitter buffer of the incoming audio stream
    pub fn jitter_buffer(&self) -> Option<Arc<Mutex<JitterBuffer>>> {
        match self.streams.audio.as_ref().map(|s| &s.receiver) {
            Some(StreamReceiver::Audio(jitter)) => Some(jitter.clone()),
            _ => None,
        }
    }

    pub fn endpoints(&self) -> &EndpointMap {
        self.selector.endpoints()
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    /// Whether media arrived on any stream
    pub fn received_first_stream_packet(&self) -> bool {
        [self.streams.audio.as_ref(), self.streams.video.as_ref()]
            .into_iter()
            .flatten()
            .any(|s| s.received_first_packet)
    }

    pub fn peer_version(&self) -> Option<u32> {
        self.peer_version
    }

    pub fn public_address(&self) -> Option<SocketAddr> {
        self.public_address
    }

    pub fn group_call_key(&self) -> Option<&[u8]> {
        self.group_call_key.as_deref()
    }

    /// Current audio encoder bitrate
    pub fn bitrate(&self) -> u32 {
        self.bitrate.bitrate()
    }

    /// Audio frame duration the source should produce
    pub fn frame_duration(&self) -> Duration {
        self.config.frame_duration()
    }

    pub fn keyframe_needed(&self) -> bool {
        match self.streams.video.as_ref().map(|s| &s.sender) {
            Some(PacketSender::Video(video)) => video.keyframe_needed,
            _ => false,
        }
    }

    /// Earliest instant `handle_timeout` has work
    pub fn next_timeout(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    // ========================================================================
    // State
    // ========================================================================

    fn set_state(&mut self, state: ConnectionState, error: Option<ErrorCode>) {
        if self.state == state || self.state == ConnectionState::Failed {
            return;
        }
        info!("Session state {} -> {}", self.state, state);
        self.state = state;
        if error.is_some() {
            self.last_error = error;
        }
        self.actions.push_back(Action::StateChanged { state, error });
    }

    fn establish(&mut self, now: Instant) {
        if !self.state.is_connecting() {
            return;
        }
        self.scheduler.cancel_kind(TimerKind::EstablishDeferred);
        self.scheduler.cancel_kind(TimerKind::SendInit);
        self.scheduler.cancel_kind(TimerKind::InitTimeout);
        self.last_recv_time = Some(now);
        self.set_state(ConnectionState::Established, None);
        self.announce_lan_endpoint();
        self.flush_reliable(now);
    }

    fn data_saving_active(&self) -> bool {
        self.config.data_saving || self.peer_data_saving
    }

    fn apply_bitrate_ceiling(&mut self) {
        let ceiling = (self.network_type.is_low_data() || self.data_saving_active())
            .then_some(self.config.audio_max_bitrate_low_data);
        if let Some(bitrate) = self.bitrate.set_ceiling(ceiling) {
            self.actions.push_back(Action::SetBitrate(bitrate));
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some((_, kind)) = self.scheduler.pop_due(now) {
            match kind {
                TimerKind::SendInit => self.on_send_init(now),
                TimerKind::InitTimeout => {
                    if self.state.is_connecting() {
                        warn!("No init-ack within {:?}", self.config.init_timeout());
                        self.fail(ErrorCode::Timeout);
                    }
                }
                TimerKind::EstablishDeferred => {
                    if self.init_ack_received {
                        self.establish(now);
                    }
                }
                TimerKind::Housekeeping => self.on_housekeeping(now),
                TimerKind::CongestionTick => self.on_congestion_tick(now),
                TimerKind::Ping => self.on_ping_tick(now),
                TimerKind::UdpProbe => self.on_probe_round(now),
            }
        }
    }

    fn init_record(&self) -> InitRecord {
        let mut flags = INIT_FLAG_SHORT_ENVELOPE;
        if self.config.data_saving {
            flags |= INIT_FLAG_DATA_SAVING;
        }
        if self.streams.video.is_some() {
            flags |= INIT_FLAG_VIDEO;
        }
        if self.selector.allow_p2p() {
            flags |= INIT_FLAG_P2P;
        }
        InitRecord {
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            flags,
            audio_codecs: vec![CODEC_OPUS],
            frame_duration_ms: self.config.frame_duration_ms as u16,
        }
    }

    fn on_send_init(&mut self, now: Instant) {
        if !self.state.is_connecting() {
            self.scheduler.cancel_kind(TimerKind::SendInit);
            return;
        }
        let init = ExtraRecord::Init(self.init_record());
        let kind = if self.selector.use_tcp() {
            EndpointKind::TcpRelay
        } else {
            EndpointKind::UdpRelay
        };
        let targets: Vec<u64> = self
            .selector
            .endpoints()
            .snapshot()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.id)
            .collect();
        for id in targets {
            self.send_signaling(id, vec![init.clone()], Framing::Legacy, now);
        }
        if self.state == ConnectionState::WaitInit {
            self.set_state(ConnectionState::WaitInitAck, None);
        }
    }

    fn on_housekeeping(&mut self, now: Instant) {
        self.flush_reliable(now);

        if let Some(jitter) = self.jitter_buffer() {
            jitter.lock().tick();
        }

        if self.signaling_ack_pending {
            self.signaling_ack_pending = false;
            if let Some(current) = self.selector.current() {
                self.send_signaling(current, Vec::new(), self.framing, now);
            }
        }

        if !self.state.can_transmit() {
            return;
        }
        let Some(last) = self.last_recv_time else {
            return;
        };
        let silence = now.saturating_duration_since(last);
        if silence >= self.config.recv_timeout() {
            if self.selector.on_relay() {
                warn!("No packets for {:?} on a relay path", silence);
                self.fail(ErrorCode::Timeout);
            } else {
                warn!("No packets for {:?} on a direct path, falling back", silence);
                if let Some(switch) = self.selector.fall_back_to_relay() {
                    self.on_path_switch(switch);
                }
                self.last_recv_time = Some(now);
            }
        } else if silence >= self.config.reconnecting_timeout()
            && self.state == ConnectionState::Established
        {
            self.set_state(ConnectionState::Reconnecting, None);
        }
    }

    fn on_congestion_tick(&mut self, now: Instant) {
        self.congestion.tick(now);
        if !self.state.can_transmit() {
            return;
        }
        let action = self.congestion.bandwidth_action(now);
        if let Some(bitrate) = self.bitrate.apply(action) {
            self.actions.push_back(Action::SetBitrate(bitrate));
        }
        if let Some(enabled) = self
            .bitrate
            .update_extra_ec(self.congestion.send_loss_ratio())
        {
            info!("Extra EC {}", if enabled { "on" } else { "off" });
            let flags = self.local_stream_flags(STREAM_ID_AUDIO);
            self.send_reliable(vec![ExtraRecord::StreamFlags {
                stream_id: STREAM_ID_AUDIO,
                flags,
            }]);
        }

        if self.state == ConnectionState::Reconnecting {
            // Ask the relay whether our packets still reach it
            if let Some(current) = self.selector.current_endpoint() {
                if current.kind.is_relay() {
                    let query_id = self.next_relay_query;
                    self.next_relay_query += 1;
                    let data = RelayRequest::RequestPacketsInfo { query_id }.encode(&current.peer_tag);
                    self.emit_send(current.id, data);
                }
            }
        }
    }

    fn on_ping_tick(&mut self, now: Instant) {
        let pings = self.selector.pings_due(now);
        self.send_pings(pings, now);

        let due = self.last_path_eval.map_or(true, |t| {
            now.saturating_duration_since(t) >= self.config.ping_interval()
        });
        if due && self.state.can_transmit() {
            self.last_path_eval = Some(now);
            if let Some(switch) = self.selector.evaluate_paths() {
                self.on_path_switch(switch);
            }
        }
    }

    fn start_udp_probe(&mut self, now: Instant) {
        self.selector.start_udp_probe();
        self.scheduler.cancel_kind(TimerKind::UdpProbe);
        self.scheduler.schedule(
            TimerKind::UdpProbe,
            now,
            Some(self.config.udp_probe_interval()),
        );
    }

    fn on_probe_round(&mut self, now: Instant) {
        if !self.selector.probing() {
            self.selector.start_udp_probe();
        }
        let (pings, outcome) = self.selector.probe_round(now);
        self.send_pings(pings, now);
        match outcome {
            ProbeOutcome::Pending => {}
            ProbeOutcome::UdpGood => self.scheduler.cancel_kind(TimerKind::UdpProbe),
            ProbeOutcome::SwitchedToTcp(id) => {
                self.scheduler.cancel_kind(TimerKind::UdpProbe);
                if let Some(endpoint) = self.selector.endpoints().get(id) {
                    self.actions.push_back(Action::PathChanged {
                        endpoint_id: id,
                        kind: endpoint.kind,
                    });
                }
                if self.state.is_connecting() {
                    self.on_send_init(now);
                }
            }
            ProbeOutcome::NoReplies => {
                self.scheduler.cancel_kind(TimerKind::UdpProbe);
                warn!("Relays did not answer the connectivity probe");
            }
        }
    }

    fn send_pings(&mut self, pings: Vec<PingRequest>, now: Instant) {
        for ping in pings {
            match ping.kind {
                PingKind::Session { seq } => {
                    self.send_signaling(
                        ping.endpoint_id,
                        vec![ExtraRecord::Ping(seq)],
                        self.framing,
                        now,
                    );
                }
                PingKind::Reflector { query_id } => {
                    let Some(endpoint) = self.selector.endpoints().get(ping.endpoint_id) else {
                        continue;
                    };
                    let data = RelayRequest::Ping { query_id }.encode(&endpoint.peer_tag);
                    self.emit_send(ping.endpoint_id, data);
                }
            }
        }
    }

    fn on_path_switch(&mut self, switch: PathSwitch) {
        if let Some(endpoint) = self.selector.endpoints().get(switch.to) {
            self.actions.push_back(Action::PathChanged {
                endpoint_id: switch.to,
                kind: endpoint.kind,
            });
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn emit_send(&mut self, endpoint_id: u64, data: Vec<u8>) {
        if let Some(endpoint) = self.selector.endpoints().get(endpoint_id) {
            let counters = self.traffic.counters(endpoint.kind);
            counters.bytes_sent += data.len() as u64;
            counters.packets_sent += 1;
        }
        trace!("Send {} bytes via {}", data.len(), endpoint_id);
        self.actions.push_back(Action::Send { endpoint_id, data });
    }

    fn seal_and_send(&mut self, endpoint_id: u64, plaintext: &[u8]) {
        let Some(tag) = self.selector.routing_tag(endpoint_id) else {
            debug!("No routing tag for endpoint {}", endpoint_id);
            return;
        };
        let data = self.codec.seal(&tag, plaintext);
        self.emit_send(endpoint_id, data);
    }

    fn send_signaling(
        &mut self,
        endpoint_id: u64,
        extras: Vec<ExtraRecord>,
        framing: Framing,
        now: Instant,
    ) {
        let seq = self.streams.signaling.next_local_seq();
        self.send_signaling_seq(endpoint_id, seq, extras, framing, now);
    }

    fn send_signaling_seq(
        &mut self,
        endpoint_id: u64,
        seq: u32,
        extras: Vec<ExtraRecord>,
        framing: Framing,
        now: Instant,
    ) {
        let tracker = &mut self.streams.signaling;
        let (ack_seq, ack_mask) = tracker.remote_ack_fields();
        let packet = Packet {
            seq,
            ack_seq,
            ack_mask,
            stream_id: STREAM_ID_SIGNALING,
            recv_ts: tracker.last_remote_seq().map(|_| tracker.recv_ts_ms(now)),
            extras,
            ..Default::default()
        };
        let plaintext = packet.encode(framing);
        tracker.record_sent(seq, plaintext.len(), now);
        self.seal_and_send(endpoint_id, &plaintext);
    }

    /// Queue signaling that must be acknowledged
    fn send_reliable(&mut self, extras: Vec<ExtraRecord>) {
        self.reliable.enqueue(
            extras,
            self.config.reliable_retry_interval(),
            Some(self.config.reliable_timeout()),
            self.config.reliable_max_tries,
        );
    }

    fn flush_reliable(&mut self, now: Instant) {
        // Reliable signaling waits for the handshake to settle the framing
        if !self.state.can_transmit() {
            return;
        }
        let Some(current) = self.selector.current() else {
            return;
        };
        let tracker = &mut self.streams.signaling;
        let due = self.reliable.tick(now, || tracker.next_local_seq());
        for (seq, extras) in due {
            self.send_signaling_seq(current, seq, extras, self.framing, now);
        }
    }

    fn announce_lan_endpoint(&mut self) {
        if !self.selector.allow_p2p() {
            return;
        }
        if let Some(address) = self.lan_address {
            self.send_reliable(vec![ExtraRecord::LanEndpoint(address)]);
        }
    }

    fn local_stream_flags(&self, stream_id: u8) -> u32 {
        let Some(stream) = self.streams.media(stream_id) else {
            return 0;
        };
        let mut flags = 0;
        if stream.enabled {
            flags |= STREAM_FLAG_ENABLED;
        }
        if stream.paused {
            flags |= STREAM_FLAG_PAUSED;
        }
        if stream.kind == StreamKind::Audio && self.bitrate.extra_ec() {
            flags |= STREAM_FLAG_EXTRA_EC;
        }
        flags
    }

    /// Enable or pause an outgoing stream and tell the peer
    pub fn set_stream_state(&mut self, stream_id: u8, enabled: bool, paused: bool, now: Instant) {
        let Some(stream) = self.streams.media_mut(stream_id) else {
            return;
        };
        if stream.enabled == enabled && stream.paused == paused {
            return;
        }
        stream.enabled = enabled;
        stream.paused = paused;
        let flags = self.local_stream_flags(stream_id);
        self.send_reliable(vec![ExtraRecord::StreamFlags { stream_id, flags }]);
        self.flush_reliable(now);
    }

    /// Advertise video parameters (codec-specific data) to the peer
    pub fn send_video_csd(&mut self, width: u16, height: u16, csd: Vec<Vec<u8>>, now: Instant) {
        if self.streams.video.is_none() {
            return;
        }
        self.send_reliable(vec![ExtraRecord::StreamCsd {
            stream_id: STREAM_ID_VIDEO,
            width,
            height,
            csd,
        }]);
        self.flush_reliable(now);
    }

    pub fn send_group_call_key(&mut self, key: Vec<u8>, now: Instant) {
        self.send_reliable(vec![ExtraRecord::GroupCallKey(key)]);
        self.flush_reliable(now);
    }

    pub fn request_group_call_upgrade(&mut self, now: Instant) {
        self.send_reliable(vec![ExtraRecord::GroupCallUpgradeRequest]);
        self.flush_reliable(now);
    }

    fn media_sendable(&self, stream_id: u8) -> bool {
        if !self.state.can_transmit() {
            return false;
        }
        match self.streams.media(stream_id) {
            Some(stream) => stream.enabled && !stream.paused,
            None => false,
        }
    }

    /// Packetize and send one encoded audio frame
    pub fn send_audio_frame(&mut self, frame: &[u8], now: Instant) {
        if !self.media_sendable(STREAM_ID_AUDIO) {
            return;
        }
        let Some(current) = self.selector.current() else {
            return;
        };
        let framing = self.framing;
        let ec_count = if self.bitrate.extra_ec() {
            self.config.extra_ec_frames
        } else {
            0
        };
        let Some(stream) = self.streams.audio.as_mut() else {
            return;
        };
        let pts = stream.next_pts;
        stream.next_pts = stream.next_pts.wrapping_add(stream.frame_duration_ms as u32);
        let ec_frames = match &mut stream.sender {
            PacketSender::Audio(audio) => audio.push_frame(frame, ec_count),
            PacketSender::Video(_) => Vec::new(),
        };
        let data = StreamData {
            pts,
            keyframe: false,
            fragment: None,
            payload: frame.to_vec(),
        };
        let ec = (!ec_frames.is_empty()).then(|| EcFrames {
            base_pts: pts,
            frames: ec_frames,
        });

        match framing {
            Framing::Current => {
                self.send_media(current, STREAM_ID_AUDIO, data, ec, now);
            }
            Framing::Legacy => {
                self.send_media(current, STREAM_ID_AUDIO, data, None, now);
                if let Some(ec) = ec {
                    self.send_legacy_ec(current, STREAM_ID_AUDIO, ec, now);
                }
            }
        }
    }

    /// Fragment and send one encoded video frame
    pub fn send_video_frame(&mut self, frame: &[u8], keyframe: bool, pts: u32, now: Instant) {
        if !self.media_sendable(STREAM_ID_VIDEO) || self.peer_flags & INIT_FLAG_VIDEO == 0 {
            return;
        }
        let Some(current) = self.selector.current() else {
            return;
        };
        if keyframe {
            if let Some(PacketSender::Video(video)) =
                self.streams.video.as_mut().map(|s| &mut s.sender)
            {
                video.keyframe_needed = false;
            }
        }
        for piece in fragment_video_frame(pts, keyframe, frame) {
            self.send_media(current, STREAM_ID_VIDEO, piece, None, now);
        }
    }

    fn send_media(
        &mut self,
        endpoint_id: u64,
        stream_id: u8,
        data: StreamData,
        ec: Option<EcFrames>,
        now: Instant,
    ) {
        let legacy = self.framing == Framing::Legacy;
        let tracker = if legacy {
            Some(&mut self.streams.signaling)
        } else {
            self.streams.tracker_mut(stream_id)
        };
        let Some(tracker) = tracker else {
            return;
        };
        let seq = tracker.next_local_seq();
        let (ack_seq, ack_mask) = tracker.remote_ack_fields();
        let keyframe = data.keyframe;
        let packet = Packet {
            seq,
            ack_seq,
            ack_mask,
            stream_id,
            data: Some(data),
            recv_ts: tracker.last_remote_seq().map(|_| tracker.recv_ts_ms(now)),
            ec,
            extras: Vec::new(),
        };
        let plaintext = packet.encode(self.framing);
        tracker.record_sent(seq, plaintext.len(), now);

        if legacy {
            if self.legacy_media_seqs.len() == LEGACY_MEDIA_SEQS {
                self.legacy_media_seqs.pop_front();
            }
            self.legacy_media_seqs.push_back((seq, stream_id));
        }
        if stream_id == STREAM_ID_AUDIO {
            self.congestion.packet_sent(seq, plaintext.len(), now);
        }
        if let Some(stream) = self.streams.media_mut(stream_id) {
            stream.sender.on_sent(seq, keyframe);
        }
        self.seal_and_send(endpoint_id, &plaintext);
    }

    fn send_legacy_ec(&mut self, endpoint_id: u64, stream_id: u8, ec: EcFrames, now: Instant) {
        let tracker = &mut self.streams.signaling;
        let seq = tracker.next_local_seq();
        let (ack_seq, ack_mask) = tracker.remote_ack_fields();
        let packet = Packet {
            seq,
            ack_seq,
            ack_mask,
            stream_id,
            ec: Some(ec),
            ..Default::default()
        };
        let plaintext = packet.encode(Framing::Legacy);
        tracker.record_sent(seq, plaintext.len(), now);
        self.seal_and_send(endpoint_id, &plaintext);
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// A datagram arrived on the UDP socket
    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        match self.selector.endpoints().find_udp_by_addr(from) {
            Some(endpoint_id) => self.handle_packet(endpoint_id, data, now),
            None => trace!("Dropping {} bytes from unknown address {}", data.len(), from),
        }
    }

    /// A frame arrived on a TCP relay link
    pub fn handle_tcp_frame(&mut self, endpoint_id: u64, data: &[u8], now: Instant) {
        self.handle_packet(endpoint_id, data, now);
    }

    /// A TCP relay link went away
    pub fn handle_tcp_closed(&mut self, endpoint_id: u64) {
        self.selector.endpoints().with(endpoint_id, |e| e.tcp = None);
        debug!("TCP link {} closed", endpoint_id);
    }

    /// Process bytes received over `endpoint_id`
    pub fn handle_packet(&mut self, endpoint_id: u64, data: &[u8], now: Instant) {
        if self.state.is_terminal() || !self.started {
            return;
        }
        let Some(endpoint) = self.selector.endpoints().get(endpoint_id) else {
            return;
        };
        if data.len() < PEER_TAG_LEN {
            return;
        }
        {
            let counters = self.traffic.counters(endpoint.kind);
            counters.bytes_received += data.len() as u64;
            counters.packets_received += 1;
        }

        if endpoint.kind.is_relay() && is_relay_control(data) {
            match RelayResponse::decode(data, &endpoint.peer_tag) {
                Ok(response) => self.handle_relay_response(endpoint_id, response, now),
                Err(e) => debug!("Bad relay response from {}: {}", endpoint_id, e),
            }
            return;
        }

        let plaintext = match self.codec.open(data) {
            Ok(plaintext) => plaintext,
            Err(e) => match self.try_envelope_fallback(data) {
                Some(plaintext) => plaintext,
                None => {
                    self.decrypt_failures += 1;
                    trace!("Dropping undecryptable packet from {}: {}", endpoint_id, e);
                    return;
                }
            },
        };

        let (packet, framing) = match Packet::decode(&plaintext) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", endpoint_id, e);
                return;
            }
        };
        self.handle_decoded(endpoint_id, packet, framing, now);
    }

    /// During the handshake, accept the other envelope version once
    fn try_envelope_fallback(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if self.envelope_fallback_tried || !self.state.is_connecting() {
            return None;
        }
        let other = match self.codec.version() {
            EnvelopeVersion::Current => EnvelopeVersion::Legacy,
            EnvelopeVersion::Legacy => EnvelopeVersion::Current,
        };
        let plaintext = self.codec.open_as(data, other).ok()?;
        self.envelope_fallback_tried = true;
        warn!("Peer uses the {:?} envelope, switching", other);
        self.codec.set_version(other);
        Some(plaintext)
    }

    fn handle_relay_response(&mut self, endpoint_id: u64, response: RelayResponse, now: Instant) {
        match response {
            RelayResponse::SelfInfo {
                query_id,
                public_addr,
                ..
            } => {
                if let Some(rtt) = self.selector.on_self_info(endpoint_id, query_id, now) {
                    trace!("Relay {} reflector RTT {:?}", endpoint_id, rtt);
                }
                if self.public_address != Some(public_addr) {
                    debug!("Public address {}", public_addr);
                    self.public_address = Some(public_addr);
                }
            }
            RelayResponse::PeerInfo { my_addr, peer_addr } => {
                debug!("Peer info: me {} peer {}", my_addr, peer_addr);
                self.selector
                    .add_p2p(P2P_INET_ID, EndpointKind::P2pInet, SocketAddr::V4(peer_addr));
            }
            RelayResponse::LastPacketsInfo { packet_ids, .. } => {
                let seen = packet_ids
                    .iter()
                    .filter(|&&id| self.streams.signaling.recent_packet(id).is_some())
                    .count();
                debug!(
                    "Relay {} saw {} recent packet(s), {} of ours",
                    endpoint_id,
                    packet_ids.len(),
                    seen
                );
            }
        }
    }

    fn handle_decoded(&mut self, endpoint_id: u64, packet: Packet, framing: Framing, now: Instant) {
        self.last_recv_time = Some(now);
        if self.state == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Established, None);
        }

        if self.state.can_transmit() {
            let span = self.streams.max_unacked_span();
            if let Some(switch) = self.selector.on_packet_from(endpoint_id, span) {
                self.on_path_switch(switch);
            }
        }

        let space = match framing {
            Framing::Legacy => STREAM_ID_SIGNALING,
            Framing::Current => packet.stream_id,
        };
        let Some(tracker) = self.streams.tracker_mut(space) else {
            trace!("Packet for unknown stream {}", space);
            return;
        };
        if !tracker.ack_remote(packet.seq, now) {
            trace!("Duplicate or late packet {} on stream {}", packet.seq, space);
            return;
        }
        // A zero mask means the peer has not received anything yet
        let outcome = if packet.ack_mask != 0 {
            let held = packet.recv_ts.map(|ms| Duration::from_millis(ms as u64));
            tracker.ack_local(packet.ack_seq, packet.ack_mask, now, held)
        } else {
            AckOutcome::default()
        };
        self.apply_ack_outcome(space, framing, outcome, now);

        if let Some(data) = packet.data {
            self.handle_stream_data(packet.stream_id, data, now);
        }
        if let Some(ec) = packet.ec {
            self.handle_ec(packet.stream_id, ec, now);
        }

        let needs_ack = packet
            .extras
            .iter()
            .any(|e| !matches!(e, ExtraRecord::Ping(_) | ExtraRecord::Pong(_)));
        for extra in packet.extras {
            self.handle_extra(endpoint_id, extra, now);
        }
        if needs_ack && space == STREAM_ID_SIGNALING {
            self.signaling_ack_pending = true;
        }
    }

    fn apply_ack_outcome(&mut self, space: u8, framing: Framing, outcome: AckOutcome, now: Instant) {
        let legacy = framing == Framing::Legacy;
        let stream_of = |seqs: &VecDeque<(u32, u8)>, seq: u32| -> Option<u8> {
            if legacy {
                seqs.iter().find(|(s, _)| *s == seq).map(|&(_, id)| id)
            } else if space == STREAM_ID_SIGNALING {
                None
            } else {
                Some(space)
            }
        };

        for acked in &outcome.acked {
            if space == STREAM_ID_SIGNALING {
                self.reliable.on_acked(acked.seq);
            }
            match stream_of(&self.legacy_media_seqs, acked.seq) {
                Some(STREAM_ID_AUDIO) => {
                    self.congestion.packet_acknowledged(acked.seq, now);
                    if let Some(stream) = self.streams.media_mut(STREAM_ID_AUDIO) {
                        stream.sender.on_acked(acked.seq);
                    }
                }
                Some(id) => {
                    if let Some(stream) = self.streams.media_mut(id) {
                        stream.sender.on_acked(acked.seq);
                    }
                }
                None => {}
            }
        }
        for &seq in &outcome.lost {
            match stream_of(&self.legacy_media_seqs, seq) {
                Some(id) => {
                    if id == STREAM_ID_AUDIO {
                        self.congestion.packet_lost(seq);
                    }
                    let keyframe_lost = match self.streams.media_mut(id) {
                        Some(stream) => {
                            let before = matches!(&stream.sender, PacketSender::Video(v) if v.keyframe_needed);
                            stream.sender.on_lost(seq);
                            let after = matches!(&stream.sender, PacketSender::Video(v) if v.keyframe_needed);
                            after && !before
                        }
                        None => false,
                    };
                    if keyframe_lost {
                        self.actions.push_back(Action::KeyframeRequested);
                    }
                }
                None => {}
            }
        }
    }

    fn handle_stream_data(&mut self, stream_id: u8, data: StreamData, now: Instant) {
        let mut frame = None;
        let mut first = false;
        {
            let Some(stream) = self.streams.media_mut(stream_id) else {
                trace!("Data for unknown stream {}", stream_id);
                return;
            };
            if !stream.received_first_packet {
                stream.received_first_packet = true;
                first = true;
            }
            match &mut stream.receiver {
                StreamReceiver::Audio(jitter) => {
                    jitter.lock().handle_input(data.payload, data.pts, false, now);
                }
                StreamReceiver::Video(reassembler) => frame = reassembler.push(data),
            }
        }
        if first {
            info!("First media packet on stream {}", stream_id);
            if self.init_ack_received && self.state.is_connecting() {
                self.establish(now);
            }
        }
        if let Some(frame) = frame {
            self.actions.push_back(Action::VideoFrame(frame));
        }
    }

    fn handle_ec(&mut self, stream_id: u8, ec: EcFrames, now: Instant) {
        let Some(stream) = self.streams.media_mut(stream_id) else {
            return;
        };
        let step = u32::from(if stream.remote.frame_duration_ms > 0 {
            stream.remote.frame_duration_ms
        } else {
            stream.frame_duration_ms
        });
        if let StreamReceiver::Audio(jitter) = &stream.receiver {
            let mut jitter = jitter.lock();
            for (i, frame) in ec.frames.into_iter().enumerate() {
                let pts = ec.base_pts.wrapping_sub(step * (i as u32 + 1));
                jitter.handle_input(frame, pts, true, now);
            }
        }
    }

    fn handle_extra(&mut self, endpoint_id: u64, extra: ExtraRecord, now: Instant) {
        if !extra.bypasses_dedup() {
            let hash = extra.dedup_hash();
            if self.last_extra_hash.insert(extra.type_id(), hash) == Some(hash) {
                trace!("Skipping repeated extra type {}", extra.type_id());
                return;
            }
        }

        match extra {
            ExtraRecord::Init(init) => self.handle_init(endpoint_id, init, now),
            ExtraRecord::InitAck(ack) => self.handle_init_ack(ack, now),
            ExtraRecord::Ping(seq) => {
                self.send_signaling(endpoint_id, vec![ExtraRecord::Pong(seq)], self.framing, now);
            }
            ExtraRecord::Pong(seq) => {
                if let Some(rtt) = self.selector.on_pong(endpoint_id, seq, now) {
                    trace!("Path {} RTT {:?}", endpoint_id, rtt);
                }
            }
            ExtraRecord::StreamFlags { stream_id, flags } => {
                let Some(stream) = self.streams.media_mut(stream_id) else {
                    return;
                };
                stream.remote.enabled = flags & STREAM_FLAG_ENABLED != 0;
                stream.remote.paused = flags & STREAM_FLAG_PAUSED != 0;
                stream.remote.extra_ec = flags & STREAM_FLAG_EXTRA_EC != 0;
                let (enabled, paused) = (stream.remote.enabled, stream.remote.paused);
                debug!(
                    "Peer stream {} enabled={} paused={}",
                    stream_id, enabled, paused
                );
                self.actions.push_back(Action::RemoteStreamChanged {
                    stream_id,
                    enabled,
                    paused,
                });
            }
            ExtraRecord::StreamCsd {
                stream_id,
                width,
                height,
                csd,
            } => {
                if let Some(stream) = self.streams.media_mut(stream_id) {
                    stream.remote.width = width;
                    stream.remote.height = height;
                    stream.remote.csd = csd;
                    debug!("Peer video {}x{}", width, height);
                }
            }
            ExtraRecord::LanEndpoint(address) => {
                self.selector
                    .add_p2p(P2P_LAN_ID, EndpointKind::P2pLan, SocketAddr::V4(address));
            }
            ExtraRecord::Ipv6Endpoint(address) => {
                self.selector
                    .add_p2p(P2P_INET6_ID, EndpointKind::P2pInet, SocketAddr::V6(address));
            }
            ExtraRecord::NetworkChanged { flags } => {
                info!("Peer network changed");
                self.peer_data_saving = flags & NETWORK_CHANGED_FLAG_DATA_SAVING != 0;
                self.apply_bitrate_ceiling();
                if !self.selector.on_relay() {
                    if let Some(switch) = self.selector.fall_back_to_relay() {
                        self.on_path_switch(switch);
                    }
                } else {
                    self.selector.reset_rtts();
                }
                // The peer's direct addresses are stale now
                self.selector.endpoints().retain(|e| e.kind.is_relay());
            }
            ExtraRecord::GroupCallKey(key) => {
                if key.len() != GROUP_CALL_KEY_LEN {
                    debug!("Ignoring group call key of {} bytes", key.len());
                    return;
                }
                info!("Received group call key");
                self.group_call_key = Some(key.clone());
                self.actions.push_back(Action::GroupCallKey(key));
            }
            ExtraRecord::GroupCallUpgradeRequest => {
                info!("Peer requested a group call upgrade");
                self.actions.push_back(Action::GroupCallUpgradeRequested);
            }
        }
    }

    fn learn_peer_version(&mut self, version: u32) {
        if self.peer_version != Some(version) {
            self.peer_version = Some(version);
            self.framing = Framing::for_peer_version(version);
            debug!("Peer protocol {} ({:?} framing)", version, self.framing);
        }
    }

    fn handle_init(&mut self, endpoint_id: u64, init: InitRecord, now: Instant) {
        if !is_compatible(init.protocol_version, init.min_protocol_version) {
            warn!(
                "Incompatible peer protocol {}..{}",
                init.min_protocol_version, init.protocol_version
            );
            self.fail(ErrorCode::Incompatible);
            return;
        }
        self.learn_peer_version(init.protocol_version);
        self.peer_flags = init.flags;
        self.codec
            .set_short_format(init.has_flag(INIT_FLAG_SHORT_ENVELOPE));
        if init.has_flag(INIT_FLAG_DATA_SAVING) != self.peer_data_saving {
            self.peer_data_saving = init.has_flag(INIT_FLAG_DATA_SAVING);
            self.apply_bitrate_ceiling();
        }
        if let Some(audio) = self.streams.audio.as_mut() {
            audio.remote.frame_duration_ms = init.frame_duration_ms;
        }
        if !init.has_flag(INIT_FLAG_VIDEO) {
            if let Some(video) = self.streams.video.as_mut() {
                video.enabled = false;
            }
        }

        let ack = InitAckRecord {
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            streams: self.streams.descriptors(),
        };
        self.send_signaling(
            endpoint_id,
            vec![ExtraRecord::InitAck(ack)],
            Framing::Legacy,
            now,
        );
    }

    fn handle_init_ack(&mut self, ack: InitAckRecord, now: Instant) {
        if !self.state.is_connecting() || self.init_ack_received {
            return;
        }
        if !is_compatible(ack.protocol_version, ack.min_protocol_version) {
            warn!(
                "Incompatible peer protocol {}..{}",
                ack.min_protocol_version, ack.protocol_version
            );
            self.fail(ErrorCode::Incompatible);
            return;
        }
        self.learn_peer_version(ack.protocol_version);
        for descriptor in &ack.streams {
            if let Some(stream) = self.streams.media_mut(descriptor.id) {
                if stream.kind == descriptor.kind {
                    stream.apply_remote(descriptor);
                }
            }
        }
        self.init_ack_received = true;
        self.scheduler.cancel_kind(TimerKind::InitTimeout);
        self.scheduler.cancel_kind(TimerKind::SendInit);
        info!("Init-ack received (peer protocol {})", ack.protocol_version);

        if self.received_first_stream_packet() {
            self.establish(now);
        } else {
            self.scheduler.schedule(
                TimerKind::EstablishDeferred,
                now + self.config.establish_delay(),
                None,
            );
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn stats(&self) -> SessionStats {
        let current = self.selector.current_endpoint();
        SessionStats {
            state: self.state,
            error: self.last_error,
            current_endpoint: current.as_ref().map(|e| e.id),
            current_kind: current.as_ref().map(|e| e.kind),
            use_tcp: self.selector.use_tcp(),
            udp_relay: self.traffic.udp_relay,
            tcp_relay: self.traffic.tcp_relay,
            p2p: self.traffic.p2p,
            rtt: current
                .filter(|e| e.has_rtt())
                .map(|e| Duration::from_secs_f64(e.average_rtt))
                .unwrap_or_else(|| self.congestion.average_rtt()),
            send_loss: self.congestion.send_loss_ratio(),
            bitrate: self.bitrate.bitrate(),
            extra_ec: self.bitrate.extra_ec(),
            jitter: self
                .jitter_buffer()
                .map(|j| j.lock().stats())
                .unwrap_or_default(),
            decrypt_failures: self.decrypt_failures,
            reliable_dropped: self.reliable.dropped(),
            peer_version: self.peer_version,
        }
    }

    /// Multi-line human readable state dump
    pub fn debug_string(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "state: {}{}",
            stats.state,
            stats
                .error
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
        let _ = writeln!(
            out,
            "peer protocol: {} framing: {:?} envelope: {:?}{}",
            stats
                .peer_version
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            self.framing,
            self.codec.version(),
            if self.codec.short_format() { " short" } else { "" }
        );
        let _ = writeln!(
            out,
            "udp: {:?} use_tcp: {}",
            self.selector.udp_connectivity(),
            stats.use_tcp
        );
        for endpoint in self.selector.endpoints().snapshot() {
            let marker = if Some(endpoint.id) == stats.current_endpoint {
                "*"
            } else if Some(endpoint.id) == self.selector.preferred_relay() {
                "+"
            } else {
                " "
            };
            let _ = writeln!(
                out,
                "{} {:#018x} {:<9} {:<24} rtt {:.0} ms",
                marker,
                endpoint.id,
                endpoint.kind.as_str(),
                endpoint.address,
                endpoint.average_rtt * 1000.0
            );
        }
        let _ = writeln!(
            out,
            "rtt: {:.0} ms send loss: {:.1}% bitrate: {} extra ec: {}",
            stats.rtt.as_secs_f64() * 1000.0,
            stats.send_loss * 100.0,
            stats.bitrate,
            if stats.extra_ec { "on" } else { "off" }
        );
        let _ = writeln!(
            out,
            "jitter: delay {} avg {:.1} late {} lost {} resets {}",
            stats.jitter.min_delay,
            stats.jitter.average_delay,
            stats.jitter.late_frames,
            stats.jitter.frames_lost,
            stats.jitter.resets
        );
        for (name, c) in [
            ("udp-relay", stats.udp_relay),
            ("tcp-relay", stats.tcp_relay),
            ("p2p", stats.p2p),
        ] {
            let _ = writeln!(
                out,
                "{:<9} out {} pkts / {} B, in {} pkts / {} B",
                name, c.packets_sent, c.bytes_sent, c.packets_received, c.bytes_received
            );
        }
        let _ = write!(
            out,
            "decrypt failures: {} reliable dropped: {}",
            stats.decrypt_failures, stats.reliable_dropped
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn relay(id: u64) -> RelayDescriptor {
        RelayDescriptor {
            id,
            ipv4: Some(Ipv4Addr::new(192, 0, 2, id as u8)),
            ipv6: None,
            port: 1400,
            peer_tag: [id as u8; 16],
            tcp: false,
        }
    }

    fn controller(originator: bool) -> Controller {
        let key: Vec<u8> = (0..256).map(|i| i as u8).collect();
        let mut c = Controller::new(Arc::new(SessionConfig::default()), &key, originator).unwrap();
        c.set_remote_endpoints(&[relay(1)], false, 92).unwrap();
        c
    }

    #[test]
    fn test_connect_requires_endpoints() {
        let key = vec![1u8; 256];
        let mut c = Controller::new(Arc::new(SessionConfig::default()), &key, true).unwrap();
        assert!(matches!(
            c.connect(Instant::now()),
            Err(SessionError::NoEndpoints)
        ));
    }

    #[test]
    fn test_bad_key_rejected() {
        let result = Controller::new(Arc::new(SessionConfig::default()), &[0u8; 16], true);
        assert!(matches!(result, Err(SessionError::Key(_))));
    }

    #[test]
    fn test_connect_sends_init_and_waits_for_ack() {
        let now = Instant::now();
        let mut c = controller(true);
        c.connect(now).unwrap();
        assert!(matches!(
            c.connect(now),
            Err(SessionError::AlreadyStarted)
        ));
        assert_eq!(c.state(), ConnectionState::WaitInitAck);

        let actions = c.drain_actions();
        let sends = actions
            .iter()
            .filter(|a| matches!(a, Action::Send { endpoint_id: 1, .. }))
            .count();
        // Init, session ping, reflector ping, probe ping
        assert!(sends >= 2, "got {:?}", actions);
        assert!(actions.contains(&Action::StateChanged {
            state: ConnectionState::WaitInit,
            error: None
        }));
    }

    #[test]
    fn test_init_timeout_fails_session() {
        let now = Instant::now();
        let mut c = controller(true);
        c.connect(now).unwrap();
        c.handle_timeout(now + Duration::from_secs(29));
        assert_eq!(c.state(), ConnectionState::WaitInitAck);
        c.handle_timeout(now + Duration::from_secs(30));
        assert_eq!(c.state(), ConnectionState::Failed);
        assert_eq!(c.last_error(), Some(ErrorCode::Timeout));
        assert!(c.next_timeout().is_none());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let now = Instant::now();
        let mut c = controller(true);
        c.connect(now).unwrap();
        c.handle_datagram("192.0.2.1:1400".parse().unwrap(), &[0u8; 80], now);
        c.handle_datagram("192.0.2.1:1400".parse().unwrap(), &[1, 2, 3], now);
        c.handle_datagram("198.51.100.1:9".parse().unwrap(), &[0u8; 80], now);
        assert_eq!(c.state(), ConnectionState::WaitInitAck);
        assert_eq!(c.stats().decrypt_failures, 1);
    }

    #[test]
    fn test_low_data_network_caps_bitrate() {
        let now = Instant::now();
        let mut c = controller(true);
        c.connect(now).unwrap();
        c.drain_actions();
        c.set_network_type(NetworkType::Edge, now);
        assert!(c.bitrate() <= SessionConfig::default().audio_max_bitrate_low_data);
        assert!(c
            .drain_actions()
            .iter()
            .any(|a| matches!(a, Action::SetBitrate(_))));
    }

    #[test]
    fn test_debug_string_lists_endpoints() {
        let c = controller(true);
        let dump = c.debug_string();
        assert!(dump.contains("state: created"));
        assert!(dump.contains("udp-relay"));
    }
}
