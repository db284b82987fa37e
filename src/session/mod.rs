//! Call session
//!
//! [`Controller`] is the protocol core. [`Session`] runs it on tokio:
//!
//! - receive loop: reads the UDP socket and forwards datagrams
//! - message task: owns the controller, handles received packets, timers,
//!   commands and the outgoing audio cadence
//! - send loop: writes prepared datagrams from a bounded queue
//! - render loop: pulls the jitter buffer into the [`AudioSink`]
//!
//! TCP relay links run their own tasks and feed the same event channel as
//! the receive loop.

mod controller;
mod error;
mod scheduler;
mod state;
mod streams;

pub use controller::{Action, Controller, SessionStats, TrafficCounters};
pub use error::SessionError;
pub use scheduler::{Scheduler, TimerId};
pub use state::{ConnectionState, ErrorCode, NetworkType};
pub use streams::{fragment_video_frame, VideoFrame, VideoReassembler, VIDEO_FRAGMENT_SIZE};

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{AudioSink, AudioSource};
use crate::config::{PersistentState, ProxyCapabilities, ProxyConfig, SessionConfig};
use crate::network::socks5::{self, UdpAssociation};
use crate::network::{EndpointKind, RelayDescriptor, TcpLinkHandle, TransportEvent, UdpTransport};

/// Depth of the transport event channel
const EVENT_QUEUE: usize = 1024;
/// Depth of the session event channel handed to the caller
const SESSION_EVENT_QUEUE: usize = 256;

/// Requests from the session handle to the message task
enum Command {
    SetNetworkType(NetworkType),
    SetStreamState {
        stream_id: u8,
        enabled: bool,
        paused: bool,
    },
    SendVideoFrame {
        data: Vec<u8>,
        keyframe: bool,
        pts: u32,
    },
    SendGroupCallKey(Vec<u8>),
    RequestGroupCallUpgrade,
    AudioFailed(String),
    DebugString(oneshot::Sender<String>),
    Stats(oneshot::Sender<SessionStats>),
    Stop,
}

/// Datagrams queued for the send loop
enum Outgoing {
    Datagram { to: SocketAddr, data: Vec<u8> },
    Stop,
}

struct Tasks {
    receive: JoinHandle<()>,
    send: JoinHandle<()>,
    message: JoinHandle<()>,
    render: JoinHandle<()>,
}

/// A relay/P2P voice call
pub struct Session {
    config: Arc<SessionConfig>,
    /// Held until `connect` moves it into the message task
    controller: Option<Controller>,
    bind_addr: String,
    state: Arc<AtomicU8>,
    last_error: Arc<Mutex<Option<ErrorCode>>>,
    persistent: Arc<Mutex<PersistentState>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    events: Option<mpsc::Receiver<Action>>,
    events_tx: mpsc::Sender<Action>,
    shutdown: Arc<Notify>,
    transport: Option<Arc<UdpTransport>>,
    udp_association: Option<UdpAssociation>,
    tasks: Option<Tasks>,
}

impl Session {
    /// Create a session for a 256-byte shared key
    pub fn new(
        config: SessionConfig,
        key: &[u8],
        originator: bool,
    ) -> Result<Self, SessionError> {
        let config = Arc::new(config.validated());
        let controller = Controller::new(config.clone(), key, originator)?;
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_QUEUE);
        Ok(Self {
            config,
            controller: Some(controller),
            bind_addr: "0.0.0.0:0".to_string(),
            state: Arc::new(AtomicU8::new(ConnectionState::Created as u8)),
            last_error: Arc::new(Mutex::new(None)),
            persistent: Arc::new(Mutex::new(PersistentState::default())),
            commands: None,
            events: Some(events_rx),
            events_tx,
            shutdown: Arc::new(Notify::new()),
            transport: None,
            udp_association: None,
            tasks: None,
        })
    }

    /// Local address to bind the UDP socket to (default `0.0.0.0:0`)
    pub fn set_bind_address(&mut self, addr: impl Into<String>) {
        self.bind_addr = addr.into();
    }

    pub fn set_remote_endpoints(
        &mut self,
        relays: &[RelayDescriptor],
        allow_p2p: bool,
        max_protocol_layer: u32,
    ) -> Result<(), SessionError> {
        self.controller
            .as_mut()
            .ok_or(SessionError::AlreadyStarted)?
            .set_remote_endpoints(relays, allow_p2p, max_protocol_layer)
    }

    /// Bind sockets, start the tasks and begin the handshake
    pub async fn connect(
        &mut self,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> Result<(), SessionError> {
        let mut controller = self.controller.take().ok_or(SessionError::AlreadyStarted)?;
        if controller.selector().current().is_none() {
            self.controller = Some(controller);
            return Err(SessionError::NoEndpoints);
        }

        let transport = match UdpTransport::bind(&self.bind_addr).await {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.controller = Some(controller);
                return Err(e.into());
            }
        };
        let local = transport.local_addr();
        info!("Session socket bound to {}", local);

        if let Some(proxy) = self.config.proxy.clone() {
            if !self.setup_proxy(&proxy, &transport).await && !controller.force_tcp() {
                error!("Proxy {} offers no usable path", proxy.address);
                controller.fail(ErrorCode::Proxy);
            }
        }

        if controller.selector().allow_p2p() {
            controller.set_lan_address(lan_address(local));
        }

        let (transport_tx, transport_rx) = mpsc::channel(EVENT_QUEUE);
        let (send_tx, send_rx) = mpsc::channel(self.config.send_queue_capacity.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let receive = transport
            .clone()
            .start_receive_loop(transport_tx.clone(), self.shutdown.clone());
        let send = tokio::spawn(run_send_loop(transport.clone(), send_rx));

        let jitter = controller.jitter_buffer();
        let frame_duration = controller.frame_duration();
        let render_commands = command_tx.clone();
        let render = tokio::spawn(async move {
            let Some(jitter) = jitter else {
                return;
            };
            let mut sink = sink;
            let mut tick = tokio::time::interval(frame_duration);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let frame = jitter.lock().handle_output();
                if let Err(e) = sink.write_frame(frame) {
                    let _ = render_commands.send(Command::AudioFailed(e.to_string()));
                    break;
                }
            }
        });

        if controller.state() == ConnectionState::Created {
            controller.connect(Instant::now())?;
        }

        let message_loop = MessageLoop {
            controller,
            source,
            transport_tx,
            send_tx,
            events: self.events_tx.clone(),
            state: self.state.clone(),
            last_error: self.last_error.clone(),
            proxy: self.config.proxy.clone(),
        };
        let message = tokio::spawn(message_loop.run(transport_rx, command_rx));

        self.commands = Some(command_tx);
        self.transport = Some(transport);
        self.tasks = Some(Tasks {
            receive,
            send,
            message,
            render,
        });
        Ok(())
    }

    /// Try UDP ASSOCIATE unless the cache says the proxy cannot do it
    async fn setup_proxy(&mut self, proxy: &ProxyConfig, transport: &Arc<UdpTransport>) -> bool {
        let cached = self.persistent.lock().proxy_supports_udp(&proxy.address);
        if cached == Some(false) {
            info!("Proxy {} known to lack UDP, using TCP relays", proxy.address);
            return false;
        }
        let udp = match socks5::udp_associate(proxy, transport.local_addr()).await {
            Ok(association) => {
                transport.set_socks_relay(Some(association.relay_addr));
                self.udp_association = Some(association);
                true
            }
            Err(e) => {
                warn!("Proxy UDP associate failed: {}", e);
                false
            }
        };
        self.persistent.lock().proxy = Some(ProxyCapabilities {
            server: proxy.address.clone(),
            udp,
        });
        udp
    }

    /// Stop all tasks; the session cannot be restarted
    pub async fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Stop);
        }
        self.shutdown.notify_one();
        if let Some(tasks) = self.tasks.take() {
            tasks.render.abort();
            let _ = tasks.receive.await;
            // The message task pushes the send loop's stop marker on exit
            let _ = tasks.message.await;
            let _ = tasks.send.await;
        }
        self.udp_association = None;
        info!("Session stopped");
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn last_error(&self) -> Option<ErrorCode> {
        *self.last_error.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.local_addr())
    }

    /// Session events (state, path, video, group call); can be taken once
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Action>> {
        self.events.take()
    }

    pub fn set_network_type(&mut self, network_type: NetworkType) {
        match (&mut self.controller, &self.commands) {
            (Some(controller), _) => controller.set_network_type(network_type, Instant::now()),
            (None, Some(commands)) => {
                let _ = commands.send(Command::SetNetworkType(network_type));
            }
            (None, None) => {}
        }
    }

    pub fn set_stream_state(&self, stream_id: u8, enabled: bool, paused: bool) {
        self.command(Command::SetStreamState {
            stream_id,
            enabled,
            paused,
        });
    }

    pub fn send_video_frame(&self, data: Vec<u8>, keyframe: bool, pts: u32) {
        self.command(Command::SendVideoFrame {
            data,
            keyframe,
            pts,
        });
    }

    pub fn send_group_call_key(&self, key: Vec<u8>) {
        self.command(Command::SendGroupCallKey(key));
    }

    pub fn request_group_call_upgrade(&self) {
        self.command(Command::RequestGroupCallUpgrade);
    }

    fn command(&self, command: Command) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(command);
        }
    }

    /// Multi-line state dump
    pub async fn debug_string(&self) -> String {
        if let Some(controller) = &self.controller {
            return controller.debug_string();
        }
        let (tx, rx) = oneshot::channel();
        self.command(Command::DebugString(tx));
        rx.await.unwrap_or_else(|_| format!("state: {}", self.state()))
    }

    pub async fn stats(&self) -> Option<SessionStats> {
        if let Some(controller) = &self.controller {
            return Some(controller.stats());
        }
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stats(tx));
        rx.await.ok()
    }

    /// Opaque blob to persist between calls
    pub fn persistent_state(&self) -> Vec<u8> {
        self.persistent.lock().to_bytes()
    }

    /// Restore a blob from `persistent_state`; bad input is ignored
    pub fn set_persistent_state(&self, data: &[u8]) {
        match PersistentState::from_bytes(data) {
            Some(state) => *self.persistent.lock() = state,
            None => warn!("Ignoring unparseable persistent state"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.receive.abort();
            tasks.send.abort();
            tasks.message.abort();
            tasks.render.abort();
        }
    }
}

fn lan_address(local: SocketAddr) -> Option<SocketAddrV4> {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() => Some(SocketAddrV4::new(ip, local.port())),
        Ok(_) => None,
        Err(e) => {
            debug!("No LAN address: {}", e);
            None
        }
    }
}

async fn run_send_loop(transport: Arc<UdpTransport>, mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Datagram { to, data } => {
                if let Err(e) = transport.send_to(&data, to).await {
                    debug!("Send to {} failed: {}", to, e);
                }
            }
            Outgoing::Stop => break,
        }
    }
    debug!("Send loop stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// State owned by the message task
struct MessageLoop {
    controller: Controller,
    source: Box<dyn AudioSource>,
    transport_tx: mpsc::Sender<TransportEvent>,
    send_tx: mpsc::Sender<Outgoing>,
    events: mpsc::Sender<Action>,
    state: Arc<AtomicU8>,
    last_error: Arc<Mutex<Option<ErrorCode>>>,
    proxy: Option<ProxyConfig>,
}

impl MessageLoop {
    async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut audio_tick = tokio::time::interval(self.controller.frame_duration());
        audio_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.dispatch_actions();

        loop {
            let deadline = self.controller.next_timeout();
            tokio::select! {
                Some(event) = transport_rx.recv() => self.on_transport_event(event),
                command = commands.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(command) => self.on_command(command),
                },
                _ = sleep_until(deadline) => self.controller.handle_timeout(Instant::now()),
                _ = audio_tick.tick() => self.pump_audio(),
            }
            self.dispatch_actions();
        }

        self.controller.stop();
        let _ = self.send_tx.send(Outgoing::Stop).await;
        debug!("Message task stopped");
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Datagram { from, data } => {
                self.controller.handle_datagram(from, &data, now)
            }
            TransportEvent::TcpConnected { endpoint_id } => {
                debug!("TCP relay link {} connected", endpoint_id)
            }
            TransportEvent::TcpFrame { endpoint_id, data } => {
                self.controller.handle_tcp_frame(endpoint_id, &data, now)
            }
            TransportEvent::TcpClosed {
                endpoint_id,
                reason,
            } => {
                debug!("TCP relay link {} closed: {}", endpoint_id, reason);
                self.controller.handle_tcp_closed(endpoint_id);
                if self.proxy.is_some()
                    && self.controller.state().is_connecting()
                    && self.controller.selector().is_current(endpoint_id)
                    && self.controller.selector().use_tcp()
                {
                    self.controller.fail(ErrorCode::Proxy);
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::SetNetworkType(network_type) => {
                self.controller.set_network_type(network_type, now)
            }
            Command::SetStreamState {
                stream_id,
                enabled,
                paused,
            } => self
                .controller
                .set_stream_state(stream_id, enabled, paused, now),
            Command::SendVideoFrame {
                data,
                keyframe,
                pts,
            } => self.controller.send_video_frame(&data, keyframe, pts, now),
            Command::SendGroupCallKey(key) => self.controller.send_group_call_key(key, now),
            Command::RequestGroupCallUpgrade => self.controller.request_group_call_upgrade(now),
            Command::AudioFailed(reason) => {
                error!("Audio sink failed: {}", reason);
                self.controller.fail(ErrorCode::AudioIO);
            }
            Command::DebugString(reply) => {
                let _ = reply.send(self.controller.debug_string());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.controller.stats());
            }
            Command::Stop => {}
        }
    }

    fn pump_audio(&mut self) {
        if !self.controller.state().can_transmit() {
            return;
        }
        match self.source.read_frame() {
            Ok(Some(frame)) => self.controller.send_audio_frame(&frame, Instant::now()),
            Ok(None) => {}
            Err(e) => {
                error!("Audio source failed: {}", e);
                self.controller.fail(ErrorCode::AudioIO);
            }
        }
    }

    fn dispatch_actions(&mut self) {
        while let Some(action) = self.controller.poll_action() {
            match action {
                Action::Send { endpoint_id, data } => self.deliver(endpoint_id, data),
                action => {
                    match &action {
                        Action::StateChanged { state, error } => {
                            self.state.store(*state as u8, Ordering::SeqCst);
                            if error.is_some() {
                                *self.last_error.lock() = *error;
                            }
                        }
                        Action::SetBitrate(bitrate) => self.source.set_bitrate(*bitrate),
                        Action::PathChanged { endpoint_id, kind } => {
                            info!("Now sending via {} ({})", endpoint_id, kind.as_str())
                        }
                        _ => {}
                    }
                    if self.events.try_send(action).is_err() {
                        trace!("Session event dropped");
                    }
                }
            }
        }
    }

    fn deliver(&mut self, endpoint_id: u64, data: Vec<u8>) {
        let Some(endpoint) = self.controller.endpoints().get(endpoint_id) else {
            return;
        };
        if endpoint.kind == EndpointKind::TcpRelay {
            let link = match endpoint.tcp.filter(|l| !l.is_closed()) {
                Some(link) => link,
                None => {
                    debug!("Opening TCP relay link {} to {}", endpoint_id, endpoint.address);
                    let link = TcpLinkHandle::open(
                        endpoint_id,
                        endpoint.address,
                        self.proxy.clone(),
                        self.transport_tx.clone(),
                    );
                    self.controller.endpoints().attach_tcp(endpoint_id, link.clone());
                    link
                }
            };
            if let Err(e) = link.send(data) {
                debug!("TCP relay link {} send failed: {}", endpoint_id, e);
            }
            return;
        }

        let outgoing = Outgoing::Datagram {
            to: endpoint.address,
            data,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.send_tx.try_send(outgoing) {
            debug!("Send queue full, dropping datagram");
        }
    }
}
