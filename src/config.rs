//! Session configuration and persisted state
//!
//! A [`SessionConfig`] is built once before a call starts and shared
//! read-only (`Arc<SessionConfig>`) with every component. It deserializes
//! from JSON with every field optional, so a config file only needs to name
//! the tunables it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Supported audio frame durations in milliseconds
const FRAME_DURATIONS_MS: [u32; 3] = [20, 40, 60];

/// Default audio frame duration (60 ms Opus frames)
const DEFAULT_FRAME_DURATION_MS: u32 = 60;

/// SOCKS5 proxy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// `host:port` of the proxy
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// All tunables of a call session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Give up if no init-ack arrives within this time
    pub init_timeout_secs: f64,
    /// Interval between init retransmissions
    pub init_retry_interval_secs: f64,
    /// Receive silence that marks an established call as reconnecting
    pub reconnecting_timeout_secs: f64,
    /// Receive silence that forces a path fallback, or fails a relayed call
    pub recv_timeout_secs: f64,
    /// Delay between init-ack and establishment when no media arrived yet
    pub establish_delay_secs: f64,
    /// Each endpoint is pinged at most this often
    pub ping_interval_secs: f64,
    pub udp_probe_interval_secs: f64,
    pub udp_probe_attempts: u32,

    /// A relay must reach `rtt < preferred_rtt * threshold` to become preferred
    pub relay_switch_threshold: f64,
    /// A P2P path must reach `rtt < relay_rtt * threshold` to replace the relay
    pub relay_to_p2p_switch_threshold: f64,
    /// Fall back from P2P when `relay_rtt < p2p_rtt * threshold`
    pub p2p_to_relay_switch_threshold: f64,
    /// RTT multiplier applied to TCP relays when ranking paths
    pub tcp_path_penalty: f64,

    pub frame_duration_ms: u32,
    pub jitter_min_delay: Option<u32>,
    pub jitter_max_delay: Option<u32>,
    pub jitter_max_slots: Option<u32>,
    pub jitter_losses_to_reset: u32,
    pub jitter_resync_threshold: f64,

    /// Target inflight bytes for the audio stream
    pub congestion_window: usize,
    pub congestion_lost_after_secs: f64,

    pub audio_init_bitrate: u32,
    pub audio_min_bitrate: u32,
    pub audio_max_bitrate: u32,
    /// Bitrate ceiling on slow mobile networks or with data saving
    pub audio_max_bitrate_low_data: u32,
    pub audio_bitrate_step_incr: u32,
    pub audio_bitrate_step_decr: u32,
    /// Send-loss ratio that turns on redundant frames
    pub extra_ec_loss_threshold: f64,
    /// Redundant frames attached to each audio packet while extra EC is on
    pub extra_ec_frames: usize,

    pub reliable_retry_interval_secs: f64,
    pub reliable_timeout_secs: f64,
    pub reliable_max_tries: u32,

    pub video_enabled: bool,
    pub data_saving: bool,
    pub proxy: Option<ProxyConfig>,
    /// Capacity of the bounded outbound packet queue
    pub send_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: 30.0,
            init_retry_interval_secs: 0.5,
            reconnecting_timeout_secs: 2.0,
            recv_timeout_secs: 20.0,
            establish_delay_secs: 1.0,
            ping_interval_secs: 10.0,
            udp_probe_interval_secs: 0.5,
            udp_probe_attempts: 6,
            relay_switch_threshold: 0.8,
            relay_to_p2p_switch_threshold: 0.6,
            p2p_to_relay_switch_threshold: 0.8,
            tcp_path_penalty: 2.0,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            jitter_min_delay: None,
            jitter_max_delay: None,
            jitter_max_slots: None,
            jitter_losses_to_reset: 20,
            jitter_resync_threshold: 1.0,
            congestion_window: 1024,
            congestion_lost_after_secs: 2.0,
            audio_init_bitrate: 16000,
            audio_min_bitrate: 8000,
            audio_max_bitrate: 20000,
            audio_max_bitrate_low_data: 8000,
            audio_bitrate_step_incr: 1000,
            audio_bitrate_step_decr: 1000,
            extra_ec_loss_threshold: 0.02,
            extra_ec_frames: 2,
            reliable_retry_interval_secs: 0.5,
            reliable_timeout_secs: 10.0,
            reliable_max_tries: 10,
            video_enabled: false,
            data_saving: false,
            proxy: None,
            send_queue_capacity: 256,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl SessionConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: SessionConfig = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    /// Normalize out-of-range values
    ///
    /// - frame duration snaps to 20/40/60 ms
    /// - thresholds stay within (0, 1]
    /// - bitrate bounds are ordered and the initial bitrate lies between them
    /// - counts and capacities are at least 1
    pub fn validated(mut self) -> Self {
        if !FRAME_DURATIONS_MS.contains(&self.frame_duration_ms) {
            warn!(
                "Unsupported frame duration {}ms, using {}ms",
                self.frame_duration_ms, DEFAULT_FRAME_DURATION_MS
            );
            self.frame_duration_ms = DEFAULT_FRAME_DURATION_MS;
        }
        for threshold in [
            &mut self.relay_switch_threshold,
            &mut self.relay_to_p2p_switch_threshold,
            &mut self.p2p_to_relay_switch_threshold,
        ] {
            if !(*threshold > 0.0 && *threshold <= 1.0) {
                *threshold = 0.8;
            }
        }
        if self.tcp_path_penalty < 1.0 {
            self.tcp_path_penalty = 1.0;
        }
        self.audio_max_bitrate = self.audio_max_bitrate.max(self.audio_min_bitrate);
        self.audio_init_bitrate = self
            .audio_init_bitrate
            .clamp(self.audio_min_bitrate, self.audio_max_bitrate);
        self.audio_max_bitrate_low_data = self
            .audio_max_bitrate_low_data
            .clamp(self.audio_min_bitrate, self.audio_max_bitrate);
        self.udp_probe_attempts = self.udp_probe_attempts.max(1);
        self.reliable_max_tries = self.reliable_max_tries.max(1);
        self.jitter_losses_to_reset = self.jitter_losses_to_reset.max(1);
        self.congestion_window = self.congestion_window.max(1);
        self.send_queue_capacity = self.send_queue_capacity.max(1);
        self
    }

    pub fn init_timeout(&self) -> Duration {
        secs(self.init_timeout_secs)
    }

    pub fn init_retry_interval(&self) -> Duration {
        secs(self.init_retry_interval_secs)
    }

    pub fn reconnecting_timeout(&self) -> Duration {
        secs(self.reconnecting_timeout_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        secs(self.recv_timeout_secs)
    }

    pub fn establish_delay(&self) -> Duration {
        secs(self.establish_delay_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        secs(self.ping_interval_secs)
    }

    pub fn udp_probe_interval(&self) -> Duration {
        secs(self.udp_probe_interval_secs)
    }

    pub fn congestion_lost_after(&self) -> Duration {
        secs(self.congestion_lost_after_secs)
    }

    pub fn reliable_retry_interval(&self) -> Duration {
        secs(self.reliable_retry_interval_secs)
    }

    pub fn reliable_timeout(&self) -> Duration {
        secs(self.reliable_timeout_secs)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// What we learned about a proxy on an earlier call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyCapabilities {
    pub server: String,
    pub udp: bool,
}

/// Opaque state carried between calls by the application
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    #[serde(default)]
    pub proxy: Option<ProxyCapabilities>,
}

impl PersistentState {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a blob produced by [`PersistentState::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match serde_json::from_slice(data) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Ignoring unreadable persistent state: {}", e);
                None
            }
        }
    }

    /// Cached UDP support for `server`, if this proxy was probed before
    pub fn proxy_supports_udp(&self, server: &str) -> Option<bool> {
        self.proxy
            .as_ref()
            .filter(|p| p.server == server)
            .map(|p| p.udp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json(r#"{"init_timeout_secs": 5, "video_enabled": true}"#)
            .unwrap();
        assert_eq!(config.init_timeout(), Duration::from_secs(5));
        assert!(config.video_enabled);
        assert_eq!(config.recv_timeout(), Duration::from_secs(20));
        assert_eq!(config.congestion_window, 1024);
    }

    #[test]
    fn test_validation() {
        let config = SessionConfig {
            frame_duration_ms: 25,
            relay_switch_threshold: 3.0,
            audio_min_bitrate: 10000,
            audio_max_bitrate: 6000,
            audio_init_bitrate: 1,
            udp_probe_attempts: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.frame_duration_ms, 60);
        assert_eq!(config.relay_switch_threshold, 0.8);
        assert_eq!(config.audio_max_bitrate, 10000);
        assert_eq!(config.audio_init_bitrate, 10000);
        assert_eq!(config.udp_probe_attempts, 1);
    }

    #[test]
    fn test_persistent_state_blob() {
        let state = PersistentState {
            proxy: Some(ProxyCapabilities {
                server: "10.0.0.1:1080".to_string(),
                udp: true,
            }),
        };
        let restored = PersistentState::from_bytes(&state.to_bytes()).unwrap();
        assert_eq!(restored.proxy_supports_udp("10.0.0.1:1080"), Some(true));
        assert_eq!(restored.proxy_supports_udp("10.0.0.2:1080"), None);
        assert!(PersistentState::from_bytes(b"not json").is_none());
    }
}
