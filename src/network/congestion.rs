//! Congestion control and audio bitrate adaptation
//!
//! `CongestionController` tracks the audio stream's inflight bytes in a
//! fixed set of slots and compares their rolling average against a target
//! window. It does not model the path; it only says whether the sender should
//! nudge its bitrate up, down, or leave it. `BitrateController` turns those
//! nudges into an encoder bitrate and decides when to attach redundant frames.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::history::History;
use crate::config::SessionConfig;

/// Inflight slots tracked at once
pub const MAX_INFLIGHT_SLOTS: usize = 100;

const RTT_HISTORY_LEN: usize = 100;
const INFLIGHT_HISTORY_LEN: usize = 30;
const LOSS_HISTORY_LEN: usize = 10;
const ACTION_INTERVAL: Duration = Duration::from_secs(1);

/// Recommended bitrate change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthAction {
    Increase,
    Decrease,
    /// Inside the dead band, or rate-limited
    Hold,
}

#[derive(Debug, Clone, Copy)]
struct InflightSlot {
    seq: u32,
    send_time: Instant,
    size: usize,
}

/// Inflight-window congestion heuristic over the audio packets of a session
#[derive(Debug)]
pub struct CongestionController {
    slots: Vec<Option<InflightSlot>>,
    cwnd: usize,
    lost_after: Duration,
    inflight_bytes: usize,
    rtt_history: History<f64>,
    inflight_history: History<f64>,
    rtt_accum: Duration,
    rtt_samples: u32,
    last_action_time: Option<Instant>,
    acked_this_tick: u32,
    lost_this_tick: u32,
    acked_history: History<u32>,
    lost_history: History<u32>,
    total_sent: u64,
    total_acked: u64,
    total_lost: u64,
}

impl CongestionController {
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_window(config.congestion_window, config.congestion_lost_after())
    }

    pub fn with_window(cwnd: usize, lost_after: Duration) -> Self {
        Self {
            slots: vec![None; MAX_INFLIGHT_SLOTS],
            cwnd,
            lost_after,
            inflight_bytes: 0,
            rtt_history: History::new(RTT_HISTORY_LEN),
            inflight_history: History::new(INFLIGHT_HISTORY_LEN),
            rtt_accum: Duration::ZERO,
            rtt_samples: 0,
            last_action_time: None,
            acked_this_tick: 0,
            lost_this_tick: 0,
            acked_history: History::new(LOSS_HISTORY_LEN),
            lost_history: History::new(LOSS_HISTORY_LEN),
            total_sent: 0,
            total_acked: 0,
            total_lost: 0,
        }
    }

    fn count_lost(&mut self, slot: InflightSlot) {
        self.inflight_bytes = self.inflight_bytes.saturating_sub(slot.size);
        self.lost_this_tick += 1;
        self.total_lost += 1;
        trace!("Packet {} counted lost", slot.seq);
    }

    /// Occupy an inflight slot for a sent packet
    ///
    /// When every slot is busy the oldest one is reused and its packet is
    /// counted lost.
    pub fn packet_sent(&mut self, seq: u32, size: usize, now: Instant) {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let oldest = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| s.map(|s| (i, s.send_time)))
                    .min_by_key(|&(_, t)| t)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                if let Some(evicted) = self.slots[oldest].take() {
                    self.count_lost(evicted);
                }
                oldest
            }
        };
        self.slots[index] = Some(InflightSlot {
            seq,
            send_time: now,
            size,
        });
        self.inflight_bytes += size;
        self.total_sent += 1;
    }

    fn take_slot(&mut self, seq: u32) -> Option<InflightSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.map_or(false, |s| s.seq == seq))
            .and_then(Option::take)
    }

    /// Free the slot of an acknowledged packet and sample its RTT
    pub fn packet_acknowledged(&mut self, seq: u32, now: Instant) -> Option<Duration> {
        let slot = self.take_slot(seq)?;
        let rtt = now.saturating_duration_since(slot.send_time);
        self.inflight_bytes = self.inflight_bytes.saturating_sub(slot.size);
        self.rtt_accum += rtt;
        self.rtt_samples += 1;
        self.acked_this_tick += 1;
        self.total_acked += 1;
        Some(rtt)
    }

    /// Count a packet lost on evidence from the ack window
    pub fn packet_lost(&mut self, seq: u32) -> bool {
        match self.take_slot(seq) {
            Some(slot) => {
                self.count_lost(slot);
                true
            }
            None => false,
        }
    }

    /// Periodic bookkeeping, about once per second
    pub fn tick(&mut self, now: Instant) {
        for i in 0..self.slots.len() {
            let expired = self.slots[i]
                .map_or(false, |s| now.saturating_duration_since(s.send_time) > self.lost_after);
            if expired {
                if let Some(slot) = self.slots[i].take() {
                    self.count_lost(slot);
                }
            }
        }

        if self.rtt_samples > 0 {
            let avg = self.rtt_accum / self.rtt_samples;
            self.rtt_history.add(avg.as_secs_f64());
            self.rtt_accum = Duration::ZERO;
            self.rtt_samples = 0;
        }
        self.inflight_history.add(self.inflight_bytes as f64);
        self.acked_history.add(self.acked_this_tick);
        self.lost_history.add(self.lost_this_tick);
        self.acked_this_tick = 0;
        self.lost_this_tick = 0;
    }

    /// Compare the inflight average against `cwnd ± 10%`
    ///
    /// At most one non-`Hold` action per second.
    pub fn bandwidth_action(&mut self, now: Instant) -> BandwidthAction {
        if let Some(last) = self.last_action_time {
            if now.saturating_duration_since(last) < ACTION_INTERVAL {
                return BandwidthAction::Hold;
            }
        }
        if self.inflight_history.is_empty() {
            return BandwidthAction::Hold;
        }
        let average = self.inflight_history.average();
        let band = self.cwnd as f64 / 10.0;
        let action = if average < self.cwnd as f64 - band {
            BandwidthAction::Increase
        } else if average > self.cwnd as f64 + band {
            BandwidthAction::Decrease
        } else {
            BandwidthAction::Hold
        };
        if action != BandwidthAction::Hold {
            self.last_action_time = Some(now);
            debug!(
                "Congestion action {:?} (inflight avg {:.0}, cwnd {})",
                action, average, self.cwnd
            );
        }
        action
    }

    /// Lost / (acked + lost) over the last few ticks
    pub fn send_loss_ratio(&self) -> f64 {
        let lost = self.lost_history.sum_recent(LOSS_HISTORY_LEN) + self.lost_this_tick as f64;
        let acked = self.acked_history.sum_recent(LOSS_HISTORY_LEN) + self.acked_this_tick as f64;
        if lost + acked == 0.0 {
            0.0
        } else {
            lost / (lost + acked)
        }
    }

    pub fn inflight_bytes(&self) -> usize {
        self.inflight_bytes
    }

    pub fn average_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.rtt_history.average())
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.rtt_history.min().map(Duration::from_secs_f64)
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    pub fn total_lost(&self) -> u64 {
        self.total_lost
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn total_acked(&self) -> u64 {
        self.total_acked
    }
}

/// Audio encoder bitrate and redundancy policy
#[derive(Debug)]
pub struct BitrateController {
    bitrate: u32,
    min: u32,
    max: u32,
    ceiling: Option<u32>,
    step_incr: u32,
    step_decr: u32,
    ec_threshold: f64,
    extra_ec: bool,
}

impl BitrateController {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            bitrate: config.audio_init_bitrate,
            min: config.audio_min_bitrate,
            max: config.audio_max_bitrate,
            ceiling: None,
            step_incr: config.audio_bitrate_step_incr,
            step_decr: config.audio_bitrate_step_decr,
            ec_threshold: config.extra_ec_loss_threshold,
            extra_ec: false,
        }
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn extra_ec(&self) -> bool {
        self.extra_ec
    }

    fn effective_max(&self) -> u32 {
        self.ceiling.map_or(self.max, |c| c.clamp(self.min, self.max))
    }

    /// Limit the bitrate on slow networks; returns the new bitrate if it changed
    pub fn set_ceiling(&mut self, ceiling: Option<u32>) -> Option<u32> {
        self.ceiling = ceiling;
        let capped = self.bitrate.min(self.effective_max());
        self.update(capped)
    }

    /// Returns the new bitrate if the action changed it
    pub fn apply(&mut self, action: BandwidthAction) -> Option<u32> {
        let target = match action {
            BandwidthAction::Increase => self.bitrate.saturating_add(self.step_incr),
            BandwidthAction::Decrease => self.bitrate.saturating_sub(self.step_decr),
            BandwidthAction::Hold => return None,
        };
        self.update(target.clamp(self.min, self.effective_max()))
    }

    fn update(&mut self, bitrate: u32) -> Option<u32> {
        if bitrate == self.bitrate {
            return None;
        }
        debug!("Audio bitrate {} -> {}", self.bitrate, bitrate);
        self.bitrate = bitrate;
        Some(bitrate)
    }

    /// Toggle redundant frames with hysteresis; returns the new state on change
    pub fn update_extra_ec(&mut self, send_loss_ratio: f64) -> Option<bool> {
        let enable = if self.extra_ec {
            send_loss_ratio >= self.ec_threshold / 2.0
        } else {
            send_loss_ratio > self.ec_threshold
        };
        if enable == self.extra_ec {
            return None;
        }
        debug!(
            "Extra EC {} at send loss {:.1}%",
            if enable { "enabled" } else { "disabled" },
            send_loss_ratio * 100.0
        );
        self.extra_ec = enable;
        Some(enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOST_AFTER: Duration = Duration::from_secs(2);

    #[test]
    fn test_unacked_packets_expire_as_lost() {
        let start = Instant::now();
        let mut cc = CongestionController::with_window(1024, LOST_AFTER);
        for seq in 0..10 {
            cc.packet_sent(seq, 120, start);
        }
        assert_eq!(cc.inflight_bytes(), 1200);

        let mut t = start;
        while t <= start + LOST_AFTER + Duration::from_secs(1) {
            cc.tick(t);
            t += Duration::from_secs(1);
        }
        assert_eq!(cc.total_lost(), 10);
        assert_eq!(cc.inflight_bytes(), 0);
        assert_eq!(cc.send_loss_ratio(), 1.0);
    }

    #[test]
    fn test_lost_exactly_once() {
        let start = Instant::now();
        let mut cc = CongestionController::with_window(1024, LOST_AFTER);
        cc.packet_sent(1, 100, start);
        cc.tick(start + Duration::from_secs(3));
        cc.tick(start + Duration::from_secs(4));
        assert!(!cc.packet_lost(1));
        assert!(cc.packet_acknowledged(1, start + Duration::from_secs(5)).is_none());
        assert_eq!(cc.total_lost(), 1);
    }

    #[test]
    fn test_ack_frees_slot_and_samples_rtt() {
        let start = Instant::now();
        let mut cc = CongestionController::with_window(1024, LOST_AFTER);
        cc.packet_sent(5, 200, start);
        let rtt = cc.packet_acknowledged(5, start + Duration::from_millis(80));
        assert_eq!(rtt, Some(Duration::from_millis(80)));
        assert_eq!(cc.inflight_bytes(), 0);

        cc.tick(start + Duration::from_secs(1));
        assert!((cc.average_rtt().as_secs_f64() - 0.08).abs() < 1e-6);
        assert_eq!(cc.total_lost(), 0);
    }

    #[test]
    fn test_slot_reuse_counts_loss() {
        let now = Instant::now();
        let mut cc = CongestionController::with_window(1024, LOST_AFTER);
        for seq in 0..MAX_INFLIGHT_SLOTS as u32 {
            cc.packet_sent(seq, 10, now + Duration::from_millis(seq as u64));
        }
        assert_eq!(cc.total_lost(), 0);
        cc.packet_sent(1000, 10, now + Duration::from_secs(1));
        assert_eq!(cc.total_lost(), 1);
        // Packet 0 was the oldest
        assert!(cc.packet_acknowledged(0, now + Duration::from_secs(1)).is_none());
        assert!(cc.packet_acknowledged(1, now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_bandwidth_action_band_and_rate_limit() {
        let start = Instant::now();
        let mut cc = CongestionController::with_window(1000, LOST_AFTER);
        assert_eq!(cc.bandwidth_action(start), BandwidthAction::Hold);

        cc.tick(start);
        assert_eq!(cc.bandwidth_action(start), BandwidthAction::Increase);
        assert_eq!(
            cc.bandwidth_action(start + Duration::from_millis(500)),
            BandwidthAction::Hold
        );

        let mut cc = CongestionController::with_window(1000, LOST_AFTER);
        for seq in 0..20 {
            cc.packet_sent(seq, 100, start);
        }
        cc.tick(start);
        assert_eq!(cc.bandwidth_action(start), BandwidthAction::Decrease);

        let mut cc = CongestionController::with_window(1000, LOST_AFTER);
        for seq in 0..10 {
            cc.packet_sent(seq, 100, start);
        }
        cc.tick(start);
        assert_eq!(cc.bandwidth_action(start), BandwidthAction::Hold);
    }

    #[test]
    fn test_bitrate_steps_within_bounds() {
        let config = SessionConfig::default();
        let mut bitrate = BitrateController::new(&config);
        assert_eq!(bitrate.bitrate(), 16000);

        for _ in 0..10 {
            bitrate.apply(BandwidthAction::Increase);
        }
        assert_eq!(bitrate.bitrate(), config.audio_max_bitrate);
        assert_eq!(bitrate.apply(BandwidthAction::Increase), None);

        for _ in 0..20 {
            bitrate.apply(BandwidthAction::Decrease);
        }
        assert_eq!(bitrate.bitrate(), config.audio_min_bitrate);
    }

    #[test]
    fn test_bitrate_ceiling() {
        let config = SessionConfig::default();
        let mut bitrate = BitrateController::new(&config);
        assert_eq!(bitrate.set_ceiling(Some(8000)), Some(8000));
        assert_eq!(bitrate.apply(BandwidthAction::Increase), None);
        assert_eq!(bitrate.set_ceiling(None), None);
        assert_eq!(bitrate.apply(BandwidthAction::Increase), Some(9000));
    }

    #[test]
    fn test_extra_ec_hysteresis() {
        let mut bitrate = BitrateController::new(&SessionConfig::default());
        assert_eq!(bitrate.update_extra_ec(0.01), None);
        assert_eq!(bitrate.update_extra_ec(0.05), Some(true));
        assert_eq!(bitrate.update_extra_ec(0.015), None);
        assert!(bitrate.extra_ec());
        assert_eq!(bitrate.update_extra_ec(0.005), Some(false));
    }
}
