//! Adaptive jitter buffer for incoming audio frames
//!
//! Frames are keyed by their timestamp (milliseconds, one frame every
//! `step_ms`). The consumer pulls one frame per step from
//! `next_fetch_timestamp`; the buffer keeps `min_delay` frames of headroom
//! between arrival and playout and retunes that depth from the spread of
//! observed arrival deviation.
//!
//! The render path calls `handle_output` from its own task while the message
//! task calls `handle_input` and `tick`, so the session shares one buffer
//! behind a mutex.

use std::time::Instant;

use tracing::{debug, trace};

use super::history::History;
use crate::config::SessionConfig;

const DEVIATION_HISTORY_LEN: usize = 64;
const LATE_HISTORY_LEN: usize = 10;
const DELAY_HISTORY_LEN: usize = 50;
/// Ticks without another increase after an increase
const DONT_INC_TICKS: u32 = 25;
/// Ticks without another decrease after a decrease
const DONT_DEC_TICKS: u32 = 100;
/// Ticks during which a freshly reset buffer tolerates far-off timestamps
const OUT_OF_SYNC_COOLDOWN_TICKS: u32 = 50;

/// Configuration for the jitter buffer
#[derive(Debug, Clone, PartialEq)]
pub struct JitterBufferConfig {
    /// Frame duration in milliseconds
    pub step_ms: u32,
    /// Lower bound of the adaptive delay, in frames
    pub min_min_delay: u32,
    /// Upper bound of the adaptive delay, in frames
    pub max_min_delay: u32,
    /// Number of frame slots
    pub max_slots: usize,
    /// Consecutive misses that force a reset
    pub losses_to_reset: u32,
    /// Average late frames per tick that force a resync
    pub resync_threshold: f64,
}

impl JitterBufferConfig {
    /// Defaults tuned per frame duration
    pub fn for_frame_duration(step_ms: u32) -> Self {
        let (min_min_delay, max_min_delay, max_slots) = match step_ms {
            0..=20 => (6, 25, 50),
            21..=40 => (4, 15, 30),
            _ => (2, 10, 20),
        };
        Self {
            step_ms,
            min_min_delay,
            max_min_delay,
            max_slots,
            losses_to_reset: 20,
            resync_threshold: 1.0,
        }
    }

    /// Per-frame-duration defaults with the session's overrides applied
    pub fn from_session(config: &SessionConfig) -> Self {
        let mut jitter = Self::for_frame_duration(config.frame_duration_ms);
        if let Some(min) = config.jitter_min_delay {
            jitter.min_min_delay = min;
        }
        if let Some(max) = config.jitter_max_delay {
            jitter.max_min_delay = max;
        }
        if let Some(slots) = config.jitter_max_slots {
            jitter.max_slots = slots as usize;
        }
        jitter.losses_to_reset = config.jitter_losses_to_reset;
        jitter.resync_threshold = config.jitter_resync_threshold;
        jitter.validated()
    }

    /// Validate and normalize the configuration
    ///
    /// - step_ms >= 1
    /// - min_min_delay >= 1 and max_min_delay >= min_min_delay
    /// - enough slots to hold the largest delay plus one frame
    pub fn validated(self) -> Self {
        let step_ms = self.step_ms.max(1);
        let min_min_delay = self.min_min_delay.max(1);
        let max_min_delay = self.max_min_delay.max(min_min_delay);
        let max_slots = self.max_slots.max(max_min_delay as usize + 1);
        Self {
            step_ms,
            min_min_delay,
            max_min_delay,
            max_slots,
            losses_to_reset: self.losses_to_reset.max(1),
            resync_threshold: if self.resync_threshold > 0.0 {
                self.resync_threshold
            } else {
                1.0
            },
        }
    }
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self::for_frame_duration(60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterBufferState {
    /// Waiting for the first frame at the playout cursor
    Buffering,
    Steady,
}

/// How the consumer should play the returned frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackHint {
    Normal,
    /// Play slower; buffered delay is below target
    Stretch,
    /// Play faster; buffered delay is above target
    Compress,
}

/// Result of one `handle_output` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitterBufferResult {
    Frame {
        timestamp: u32,
        payload: Vec<u8>,
        /// Recovered from a redundant copy
        from_ec: bool,
        hint: PlaybackHint,
    },
    /// The frame due now never arrived
    Lost { timestamp: u32 },
    /// Nothing to play yet
    Buffering,
}

#[derive(Debug)]
struct Slot {
    timestamp: i64,
    payload: Vec<u8>,
    is_ec: bool,
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterBufferStats {
    pub frames_received: u64,
    pub frames_played: u64,
    pub frames_lost: u64,
    pub late_frames: u64,
    /// Frames evicted because every slot was busy
    pub dropped_frames: u64,
    pub resets: u64,
    pub min_delay: u32,
    pub average_delay: f64,
    pub deviation_ms: f64,
}

/// Adaptive jitter buffer
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterBufferConfig,
    slots: Vec<Option<Slot>>,
    state: JitterBufferState,
    next_fetch: i64,
    need_resync: bool,
    min_delay: u32,
    dont_inc_min_delay: u32,
    dont_dec_min_delay: u32,
    out_of_sync_cooldown: u32,
    consecutive_losses: u32,
    /// Frames played and missed since the last reset
    got_since_reset: u32,
    lost_since_reset: u32,
    late_this_tick: u32,
    reference: Option<(Instant, i64)>,
    deviation_history: History<f64>,
    late_history: History<u32>,
    delay_history: History<u32>,
    stats: JitterBufferStats,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        let config = config.validated();
        Self {
            slots: (0..config.max_slots).map(|_| None).collect(),
            state: JitterBufferState::Buffering,
            next_fetch: 0,
            need_resync: true,
            min_delay: config.min_min_delay,
            dont_inc_min_delay: 0,
            dont_dec_min_delay: 0,
            out_of_sync_cooldown: 0,
            consecutive_losses: 0,
            got_since_reset: 0,
            lost_since_reset: 0,
            late_this_tick: 0,
            reference: None,
            deviation_history: History::new(DEVIATION_HISTORY_LEN),
            late_history: History::new(LATE_HISTORY_LEN),
            delay_history: History::new(DELAY_HISTORY_LEN),
            stats: JitterBufferStats::default(),
            config,
        }
    }

    fn step(&self) -> i64 {
        self.config.step_ms as i64
    }

    /// Timestamps further ahead of the cursor than this mean we lost sync
    fn out_of_sync_limit(&self) -> i64 {
        let frames = if self.out_of_sync_cooldown > 0 {
            self.config.max_slots * 4
        } else {
            self.config.max_slots
        };
        frames as i64 * self.step()
    }

    fn resync_to(&mut self, timestamp: i64) {
        self.next_fetch = timestamp - self.step() * self.min_delay as i64;
        self.state = JitterBufferState::Buffering;
        self.need_resync = false;
        self.reference = None;
        debug!(
            "Jitter buffer resynced, next fetch {} (delay {} frames)",
            self.next_fetch, self.min_delay
        );
    }

    /// Store an incoming frame
    pub fn handle_input(&mut self, payload: Vec<u8>, timestamp: u32, is_ec: bool, now: Instant) {
        let timestamp = timestamp as i64;
        if self.need_resync || timestamp - self.next_fetch > self.out_of_sync_limit() {
            self.resync_to(timestamp);
        }

        if timestamp < self.next_fetch - 1 {
            trace!("Late frame ts={} (next fetch {})", timestamp, self.next_fetch);
            self.stats.late_frames += 1;
            self.late_this_tick += 1;
            return;
        }

        if let Some(existing) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|s| s.timestamp == timestamp)
        {
            if existing.is_ec && !is_ec {
                existing.payload = payload;
                existing.is_ec = false;
            }
            return;
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let oldest = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.timestamp)))
                    .min_by_key(|&(_, ts)| ts)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                self.stats.dropped_frames += 1;
                oldest
            }
        };
        self.slots[index] = Some(Slot {
            timestamp,
            payload,
            is_ec,
        });
        self.stats.frames_received += 1;

        if !is_ec {
            self.sample_deviation(timestamp, now);
        }
    }

    /// Arrival deviation against a linear schedule anchored on the earliest
    /// arrival seen
    fn sample_deviation(&mut self, timestamp: i64, now: Instant) {
        let Some((ref_time, ref_ts)) = self.reference else {
            self.reference = Some((now, timestamp));
            self.deviation_history.add(0.0);
            return;
        };
        let elapsed_ms = if now >= ref_time {
            now.duration_since(ref_time).as_secs_f64() * 1000.0
        } else {
            -(ref_time.duration_since(now).as_secs_f64() * 1000.0)
        };
        let deviation = elapsed_ms - (timestamp - ref_ts) as f64;
        if deviation < 0.0 {
            self.reference = Some((now, timestamp));
            self.deviation_history.add(0.0);
        } else {
            self.deviation_history.add(deviation);
        }
    }

    fn buffered_ahead(&self) -> u32 {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.timestamp >= self.next_fetch)
            .count() as u32
    }

    fn playback_hint(&self) -> PlaybackHint {
        let buffered = self.buffered_ahead();
        if buffered > self.min_delay + 1 {
            PlaybackHint::Compress
        } else if buffered + 1 < self.min_delay {
            PlaybackHint::Stretch
        } else {
            PlaybackHint::Normal
        }
    }

    /// Pull the frame due at the playout cursor and advance it by one step
    pub fn handle_output(&mut self) -> JitterBufferResult {
        if self.need_resync {
            return JitterBufferResult::Buffering;
        }
        let timestamp = self.next_fetch;
        self.next_fetch += self.step();

        // Anything behind the cursor can never be played
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(s) if s.timestamp < timestamp) {
                *slot = None;
            }
        }

        let found = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some(slot) if slot.timestamp == timestamp))
            .and_then(Option::take);

        match found {
            Some(slot) => {
                self.state = JitterBufferState::Steady;
                self.consecutive_losses = 0;
                self.got_since_reset += 1;
                self.stats.frames_played += 1;
                self.delay_history.add(self.buffered_ahead());
                JitterBufferResult::Frame {
                    timestamp: timestamp as u32,
                    payload: slot.payload,
                    from_ec: slot.is_ec,
                    hint: self.playback_hint(),
                }
            }
            None if self.state == JitterBufferState::Buffering => JitterBufferResult::Buffering,
            None => {
                self.consecutive_losses += 1;
                self.lost_since_reset += 1;
                self.stats.frames_lost += 1;
                trace!("Jitter buffer miss at ts={}", timestamp);

                let burst = self.consecutive_losses >= self.config.losses_to_reset;
                let mostly_lost = self.got_since_reset > self.min_delay * 25
                    && self.lost_since_reset > self.got_since_reset / 2;
                if burst || mostly_lost {
                    debug!(
                        "Jitter buffer reset after {} consecutive / {} total losses",
                        self.consecutive_losses, self.lost_since_reset
                    );
                    self.reset();
                }
                JitterBufferResult::Lost {
                    timestamp: timestamp as u32,
                }
            }
        }
    }

    /// Drop everything and wait for the next frame to resynchronize
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.state = JitterBufferState::Buffering;
        self.need_resync = true;
        self.consecutive_losses = 0;
        self.got_since_reset = 0;
        self.lost_since_reset = 0;
        self.reference = None;
        self.out_of_sync_cooldown = OUT_OF_SYNC_COOLDOWN_TICKS;
        self.stats.resets += 1;
    }

    /// Periodic adaptation of the target delay
    pub fn tick(&mut self) {
        self.dont_inc_min_delay = self.dont_inc_min_delay.saturating_sub(1);
        self.dont_dec_min_delay = self.dont_dec_min_delay.saturating_sub(1);
        self.out_of_sync_cooldown = self.out_of_sync_cooldown.saturating_sub(1);

        self.late_history.add(self.late_this_tick);
        self.late_this_tick = 0;
        if self.late_history.len() == LATE_HISTORY_LEN
            && self.late_history.average() >= self.config.resync_threshold
        {
            debug!("Too many late frames, resyncing jitter buffer");
            self.late_history.reset();
            self.need_resync = true;
        }

        if self.deviation_history.len() < DEVIATION_HISTORY_LEN / 4 {
            return;
        }
        let deviation = self.deviation_history.std_dev();
        let target = ((deviation * 2.0) / self.config.step_ms as f64).ceil() as u32;
        let target = target.clamp(self.config.min_min_delay, self.config.max_min_delay);

        if target > self.min_delay && self.dont_inc_min_delay == 0 {
            self.min_delay += 1;
            self.dont_inc_min_delay = DONT_INC_TICKS;
            debug!("Jitter buffer delay up to {} frames", self.min_delay);
        } else if target < self.min_delay && self.dont_dec_min_delay == 0 {
            self.min_delay -= 1;
            self.dont_dec_min_delay = DONT_DEC_TICKS;
            debug!("Jitter buffer delay down to {} frames", self.min_delay);
        }
    }

    pub fn state(&self) -> JitterBufferState {
        self.state
    }

    pub fn min_delay(&self) -> u32 {
        self.min_delay
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    /// Next timestamp the consumer will be handed
    pub fn next_fetch_timestamp(&self) -> i64 {
        self.next_fetch
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            min_delay: self.min_delay,
            average_delay: self.delay_history.average(),
            deviation_ms: self.deviation_history.std_dev(),
            ..self.stats.clone()
        }
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JitterBufferConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn buffer_20ms() -> JitterBuffer {
        JitterBuffer::new(JitterBufferConfig::for_frame_duration(20))
    }

    fn frames(results: &[JitterBufferResult]) -> Vec<Vec<u8>> {
        results
            .iter()
            .filter_map(|r| match r {
                JitterBufferResult::Frame { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_in_order_roundtrip_without_loss() {
        let start = Instant::now();
        let mut buffer = buffer_20ms();
        let mut results = Vec::new();

        for i in 0..40u32 {
            let now = start + Duration::from_millis(20 * i as u64);
            buffer.handle_input(vec![i as u8], i * 20, false, now);
            results.push(buffer.handle_output());
        }
        for _ in 0..buffer.min_delay() {
            results.push(buffer.handle_output());
        }

        let expected: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i]).collect();
        assert_eq!(frames(&results), expected);
        assert_eq!(buffer.stats().frames_lost, 0);
        assert_eq!(buffer.state(), JitterBufferState::Steady);
    }

    #[test]
    fn test_late_frame_is_never_returned() {
        let now = Instant::now();
        let mut buffer = buffer_20ms();
        for i in 0..10u32 {
            buffer.handle_input(vec![i as u8], i * 20, false, now);
        }
        for _ in 0..12 {
            buffer.handle_output();
        }
        let cursor = buffer.next_fetch_timestamp();

        // Well behind the cursor
        buffer.handle_input(vec![0xEE], (cursor - 60) as u32, false, now);
        assert_eq!(buffer.stats().late_frames, 1);
        for _ in 0..20 {
            if let JitterBufferResult::Frame { payload, .. } = buffer.handle_output() {
                assert_ne!(payload, vec![0xEE]);
            }
        }
    }

    #[test]
    fn test_regular_frame_overwrites_ec_copy() {
        let now = Instant::now();
        let mut buffer = JitterBuffer::new(JitterBufferConfig {
            min_min_delay: 1,
            ..JitterBufferConfig::for_frame_duration(60)
        });

        buffer.handle_input(vec![1], 0, false, now);
        buffer.handle_input(vec![2], 60, true, now);
        buffer.handle_input(vec![3], 60, false, now);
        buffer.handle_input(vec![4], 120, false, now);
        buffer.handle_input(vec![5], 120, true, now);

        let mut played = Vec::new();
        for _ in 0..5 {
            if let JitterBufferResult::Frame {
                payload, from_ec, ..
            } = buffer.handle_output()
            {
                assert!(!from_ec);
                played.push(payload);
            }
        }
        assert_eq!(played, vec![vec![1], vec![3], vec![4]]);
    }

    #[test]
    fn test_ec_frame_fills_gap() {
        let now = Instant::now();
        let mut buffer = JitterBuffer::new(JitterBufferConfig {
            min_min_delay: 1,
            ..JitterBufferConfig::for_frame_duration(60)
        });
        buffer.handle_input(vec![1], 0, false, now);
        buffer.handle_input(vec![2], 60, true, now);

        assert_eq!(buffer.handle_output(), JitterBufferResult::Buffering);
        assert!(matches!(
            buffer.handle_output(),
            JitterBufferResult::Frame { from_ec: false, .. }
        ));
        assert!(matches!(
            buffer.handle_output(),
            JitterBufferResult::Frame { from_ec: true, .. }
        ));
    }

    #[test]
    fn test_missing_frame_is_reported_lost() {
        let now = Instant::now();
        let mut buffer = JitterBuffer::new(JitterBufferConfig {
            min_min_delay: 1,
            ..JitterBufferConfig::for_frame_duration(60)
        });
        buffer.handle_input(vec![0], 0, false, now);
        buffer.handle_input(vec![2], 120, false, now);

        assert_eq!(buffer.handle_output(), JitterBufferResult::Buffering);
        assert!(matches!(buffer.handle_output(), JitterBufferResult::Frame { .. }));
        assert_eq!(
            buffer.handle_output(),
            JitterBufferResult::Lost { timestamp: 60 }
        );
        assert!(matches!(buffer.handle_output(), JitterBufferResult::Frame { .. }));
        assert_eq!(buffer.stats().frames_lost, 1);
    }

    #[test]
    fn test_consecutive_losses_reset() {
        let now = Instant::now();
        let mut buffer = JitterBuffer::new(JitterBufferConfig {
            min_min_delay: 1,
            losses_to_reset: 5,
            ..JitterBufferConfig::for_frame_duration(60)
        });
        buffer.handle_input(vec![0], 0, false, now);
        buffer.handle_output();
        buffer.handle_output();

        for _ in 0..5 {
            assert!(matches!(
                buffer.handle_output(),
                JitterBufferResult::Lost { .. }
            ));
        }
        assert_eq!(buffer.stats().resets, 1);
        assert_eq!(buffer.state(), JitterBufferState::Buffering);
        assert_eq!(buffer.handle_output(), JitterBufferResult::Buffering);

        // Stream resumes far ahead; the buffer follows it
        buffer.handle_input(vec![9], 600_000, false, now);
        assert_eq!(buffer.handle_output(), JitterBufferResult::Buffering);
        assert!(matches!(
            buffer.handle_output(),
            JitterBufferResult::Frame { timestamp: 600_000, .. }
        ));
    }

    #[test]
    fn test_full_buffer_evicts_oldest() {
        let now = Instant::now();
        let config = JitterBufferConfig::for_frame_duration(60);
        let slots = config.max_slots as u32;
        let mut buffer = JitterBuffer::new(config);
        for i in 0..=slots {
            buffer.handle_input(vec![i as u8], i * 60, false, now);
        }
        assert_eq!(buffer.stats().dropped_frames, 1);
    }

    #[test]
    fn test_jittery_arrivals_raise_delay() {
        let start = Instant::now();
        let mut buffer = JitterBuffer::new(JitterBufferConfig::for_frame_duration(20));
        let initial = buffer.min_delay();

        for i in 0..200u64 {
            // Alternate on time and 150ms late
            let jitter = if i % 2 == 0 { 0 } else { 150 };
            let now = start + Duration::from_millis(i * 20 + jitter);
            buffer.handle_input(vec![0], (i * 20) as u32, false, now);
            buffer.tick();
        }
        assert!(buffer.min_delay() > initial);
        // Cooldown limits how fast the delay can climb
        assert!(buffer.min_delay() <= initial + 200 / DONT_INC_TICKS + 1);
    }

    #[test]
    fn test_steady_arrivals_lower_delay() {
        let start = Instant::now();
        let mut buffer = buffer_20ms();
        let floor = buffer.config.min_min_delay;
        buffer.min_delay = floor + 4;

        for i in 0..400u64 {
            let now = start + Duration::from_millis(i * 20);
            buffer.handle_input(vec![0], (i * 20) as u32, false, now);
            buffer.handle_output();
            buffer.tick();
        }
        assert!(buffer.min_delay() < floor + 4);
        assert!(buffer.min_delay() >= floor);
    }

    #[test]
    fn test_increase_does_not_hold_back_decrease() {
        let mut buffer = buffer_20ms();
        let initial = buffer.min_delay();

        for i in 0..DEVIATION_HISTORY_LEN {
            buffer.deviation_history.add(if i % 2 == 0 { 0.0 } else { 200.0 });
        }
        buffer.tick();
        assert_eq!(buffer.min_delay(), initial + 1);

        // Jitter gone right after the increase
        buffer.deviation_history.reset();
        for _ in 0..DEVIATION_HISTORY_LEN {
            buffer.deviation_history.add(0.0);
        }
        buffer.tick();
        assert_eq!(buffer.min_delay(), initial);
    }

    #[test]
    fn test_config_from_session() {
        let session = SessionConfig {
            frame_duration_ms: 20,
            jitter_max_delay: Some(3),
            ..Default::default()
        };
        let config = JitterBufferConfig::from_session(&session);
        assert_eq!(config.step_ms, 20);
        assert_eq!(config.min_min_delay, 6);
        // Validation keeps max >= min
        assert_eq!(config.max_min_delay, 6);
        assert!(config.max_slots > 6);
    }
}
