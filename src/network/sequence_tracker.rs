//! Sequence number and acknowledgment bookkeeping
//!
//! Each logical stream owns one `SequenceTracker`. It hands out local
//! sequence numbers, keeps a 32-bit sliding bitmask of remote sequence
//! numbers (echoed back to the peer as our ack), and remembers recently sent
//! packets so the peer's acks can be turned into RTT samples and loss events.
//!
//! Sequence numbers wrap, so every comparison goes through [`seqgt`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of sequence numbers covered by one ack (ack_seq plus 31 mask bits)
pub const ACK_WINDOW: u32 = 32;

/// Recently sent packets remembered for RTT and loss sampling
pub const MAX_RECENT_PACKETS: usize = 128;

/// Whether `a` is after `b` in wrapping sequence space
pub fn seqgt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// A packet we sent, kept until it scrolls out of the recent ring
#[derive(Debug, Clone)]
pub struct RecentOutgoingPacket {
    pub seq: u32,
    pub send_time: Instant,
    pub ack_time: Option<Instant>,
    pub rtt: Option<Duration>,
    pub size: usize,
    pub lost: bool,
}

/// A packet newly confirmed by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedPacket {
    pub seq: u32,
    pub size: usize,
    pub rtt: Duration,
}

/// Result of processing one incoming ack
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub acked: Vec<AckedPacket>,
    /// Packets that left the ack window without being acknowledged
    pub lost: Vec<u32>,
    /// RTT of the packet named by `ack_id`, corrected by the peer's hold time
    pub rtt: Option<Duration>,
}

/// Tracks local and remote sequence numbers of one stream
#[derive(Debug)]
pub struct SequenceTracker {
    /// Next local sequence number to hand out
    local_seq: u32,
    /// Latest ack received from the peer
    last_acked_seq: Option<u32>,
    /// Bit N set when `last_acked_seq - N` was delivered
    local_ack_mask: u32,
    /// Highest remote sequence number accepted
    last_remote_seq: Option<u32>,
    /// Bit N set when `last_remote_seq - N` was received
    remote_mask: u32,
    last_remote_recv_time: Option<Instant>,
    recent: VecDeque<RecentOutgoingPacket>,
    /// Total remote packets accepted
    packets_received: u64,
    /// Remote packets skipped over and not (yet) filled in
    packets_lost: u64,
    packets_sent: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            local_seq: 0,
            last_acked_seq: None,
            local_ack_mask: 0,
            last_remote_seq: None,
            remote_mask: 0,
            last_remote_recv_time: None,
            recent: VecDeque::with_capacity(MAX_RECENT_PACKETS),
            packets_received: 0,
            packets_lost: 0,
            packets_sent: 0,
        }
    }

    /// Allocate the next local sequence number
    ///
    /// Never reset for the lifetime of the stream, including across
    /// reconnects.
    pub fn next_local_seq(&mut self) -> u32 {
        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        seq
    }

    /// Sequence number the next call to `next_local_seq` returns
    pub fn peek_local_seq(&self) -> u32 {
        self.local_seq
    }

    /// Remember a sent packet for RTT and loss accounting
    pub fn record_sent(&mut self, seq: u32, size: usize, now: Instant) {
        if self.recent.len() == MAX_RECENT_PACKETS {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentOutgoingPacket {
            seq,
            send_time: now,
            ack_time: None,
            rtt: None,
            size,
            lost: false,
        });
        self.packets_sent += 1;
    }

    /// Accept a remote sequence number into the ack window
    ///
    /// Returns false, leaving all state untouched, for duplicates and for
    /// packets older than the window.
    pub fn ack_remote(&mut self, seq: u32, now: Instant) -> bool {
        let Some(last) = self.last_remote_seq else {
            self.last_remote_seq = Some(seq);
            self.remote_mask = 1;
            self.last_remote_recv_time = Some(now);
            self.packets_received += 1;
            return true;
        };

        if seqgt(seq, last) {
            let diff = seq.wrapping_sub(last);
            self.remote_mask = if diff >= ACK_WINDOW {
                0
            } else {
                self.remote_mask << diff
            };
            self.remote_mask |= 1;
            self.packets_lost += (diff - 1) as u64;
            self.last_remote_seq = Some(seq);
            self.last_remote_recv_time = Some(now);
            self.packets_received += 1;
            return true;
        }

        let back = last.wrapping_sub(seq);
        if back >= ACK_WINDOW {
            return false;
        }
        let bit = 1u32 << back;
        if self.remote_mask & bit != 0 {
            return false;
        }
        // Late arrival of a packet counted as skipped
        self.remote_mask |= bit;
        self.packets_received += 1;
        self.packets_lost = self.packets_lost.saturating_sub(1);
        true
    }

    /// Whether a remote sequence number has already been accepted
    pub fn was_remote_received(&self, seq: u32) -> bool {
        let Some(last) = self.last_remote_seq else {
            return false;
        };
        if seqgt(seq, last) {
            return false;
        }
        let back = last.wrapping_sub(seq);
        back < ACK_WINDOW && self.remote_mask & (1 << back) != 0
    }

    /// `(ack_seq, ack_mask)` to put on outgoing packets
    pub fn remote_ack_fields(&self) -> (u32, u32) {
        (self.last_remote_seq.unwrap_or(0), self.remote_mask)
    }

    /// Milliseconds since the last newest remote packet arrived
    pub fn recv_ts_ms(&self, now: Instant) -> u32 {
        self.last_remote_recv_time
            .map(|t| now.saturating_duration_since(t).as_millis().min(u32::MAX as u128) as u32)
            .unwrap_or(0)
    }

    /// Apply the peer's view of our packets
    ///
    /// `recv_ts` is how long the peer held `ack_id` before sending the packet
    /// carrying this ack; it is removed from the RTT sample.
    pub fn ack_local(
        &mut self,
        ack_id: u32,
        mask: u32,
        now: Instant,
        recv_ts: Option<Duration>,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        if let Some(last) = self.last_acked_seq {
            if seqgt(last, ack_id) {
                return outcome;
            }
        }
        self.last_acked_seq = Some(ack_id);
        self.local_ack_mask = mask;

        let window_floor = ack_id.wrapping_sub(ACK_WINDOW - 1);
        for index in 0..self.recent.len() {
            let (seq, acked, lost) = {
                let p = &self.recent[index];
                (p.seq, p.ack_time.is_some(), p.lost)
            };
            if acked || lost || seqgt(seq, ack_id) {
                continue;
            }
            if self.was_local_acked(seq) {
                let p = &mut self.recent[index];
                let mut rtt = now.saturating_duration_since(p.send_time);
                if seq == ack_id {
                    if let Some(held) = recv_ts {
                        rtt = rtt.saturating_sub(held);
                    }
                    outcome.rtt = Some(rtt);
                }
                p.ack_time = Some(now);
                p.rtt = Some(rtt);
                outcome.acked.push(AckedPacket {
                    seq,
                    size: p.size,
                    rtt,
                });
            } else if seqgt(window_floor, seq) {
                self.recent[index].lost = true;
                outcome.lost.push(seq);
            }
        }
        outcome
    }

    /// Whether the peer reported `seq` as delivered
    ///
    /// Only answers within the ack window; older packets report false.
    pub fn was_local_acked(&self, seq: u32) -> bool {
        let Some(last) = self.last_acked_seq else {
            return false;
        };
        if seq == last {
            return true;
        }
        if seqgt(seq, last) {
            return false;
        }
        let back = last.wrapping_sub(seq);
        back < ACK_WINDOW && self.local_ack_mask & (1 << back) != 0
    }

    /// Sent packets not covered by the latest ack
    ///
    /// Grows without bound when the peer stops acknowledging us, which the
    /// endpoint selector reads as a sign of a NAT rebinding.
    pub fn unacked_span(&self) -> u32 {
        match self.last_acked_seq {
            Some(last) => self.local_seq.wrapping_sub(last).wrapping_sub(1),
            None => self.local_seq,
        }
    }

    pub fn last_acked_seq(&self) -> Option<u32> {
        self.last_acked_seq
    }

    pub fn last_remote_seq(&self) -> Option<u32> {
        self.last_remote_seq
    }

    /// Look up a recently sent packet
    pub fn recent_packet(&self, seq: u32) -> Option<&RecentOutgoingPacket> {
        self.recent.iter().rev().find(|p| p.seq == seq)
    }

    /// Average RTT over acked packets still in the recent ring
    pub fn average_rtt(&self) -> Option<Duration> {
        let (sum, count) = self
            .recent
            .iter()
            .filter_map(|p| p.rtt)
            .fold((Duration::ZERO, 0u32), |(s, c), r| (s + r, c + 1));
        (count > 0).then(|| sum / count)
    }

    /// Remote-side loss rate (0.0 - 1.0)
    pub fn loss_rate(&self) -> f32 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f32 / total as f32
        }
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqgt_wraparound_invariance() {
        let pairs = [(5u32, 3u32), (3, 5), (0, u32::MAX), (1000, 999_000), (7, 7)];
        for (a, b) in pairs {
            for k in [0u32, 1, 1 << 20, u32::MAX - 2, 0x8000_0000 - 10] {
                assert_eq!(
                    seqgt(a, b),
                    seqgt(a.wrapping_add(k), b.wrapping_add(k)),
                    "a={} b={} k={}",
                    a,
                    b,
                    k
                );
            }
        }
        assert!(seqgt(0, u32::MAX));
        assert!(!seqgt(u32::MAX, 0));
        assert!(!seqgt(7, 7));
    }

    #[test]
    fn test_local_seq_is_monotonic() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.next_local_seq(), 0);
        assert_eq!(tracker.next_local_seq(), 1);
        assert_eq!(tracker.peek_local_seq(), 2);
    }

    #[test]
    fn test_ack_remote_idempotence() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        assert!(tracker.ack_remote(10, now));
        assert!(tracker.ack_remote(12, now));
        let before = tracker.remote_ack_fields();

        assert!(!tracker.ack_remote(12, now));
        assert_eq!(tracker.remote_ack_fields(), before);

        // Out-of-order fill then duplicate
        assert!(tracker.ack_remote(11, now));
        assert!(!tracker.ack_remote(11, now));
        assert_eq!(tracker.remote_ack_fields(), (12, 0b111));
        assert_eq!(tracker.packets_lost(), 0);
    }

    #[test]
    fn test_ack_remote_rejects_too_late() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        assert!(tracker.ack_remote(100, now));
        assert!(!tracker.ack_remote(100 - ACK_WINDOW, now));
        assert!(tracker.ack_remote(100 - ACK_WINDOW + 1, now));
    }

    #[test]
    fn test_ack_remote_across_wrap() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        assert!(tracker.ack_remote(u32::MAX - 1, now));
        assert!(tracker.ack_remote(u32::MAX, now));
        assert!(tracker.ack_remote(0, now));
        assert_eq!(tracker.remote_ack_fields(), (0, 0b111));
        assert!(tracker.was_remote_received(u32::MAX - 1));
    }

    #[test]
    fn test_remote_gap_counts_loss() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        tracker.ack_remote(0, now);
        tracker.ack_remote(4, now);
        assert_eq!(tracker.packets_lost(), 3);
        assert!(tracker.loss_rate() > 0.0);
    }

    #[test]
    fn test_was_local_acked_window() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        assert!(!tracker.was_local_acked(0));

        tracker.ack_local(40, 0b101, now, None);
        assert!(tracker.was_local_acked(40));
        assert!(!tracker.was_local_acked(39));
        assert!(tracker.was_local_acked(38));
        assert!(!tracker.was_local_acked(41));
        assert!(!tracker.was_local_acked(40 - ACK_WINDOW));
    }

    #[test]
    fn test_ack_local_samples_rtt() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::new();
        for _ in 0..3 {
            let seq = tracker.next_local_seq();
            tracker.record_sent(seq, 100, start);
        }

        let now = start + Duration::from_millis(150);
        let outcome = tracker.ack_local(2, 0b111, now, Some(Duration::from_millis(30)));
        assert_eq!(outcome.acked.len(), 3);
        assert_eq!(outcome.rtt, Some(Duration::from_millis(120)));
        assert!(outcome.lost.is_empty());
        assert_eq!(
            tracker.recent_packet(0).and_then(|p| p.rtt),
            Some(Duration::from_millis(150))
        );

        // Same ack again reports nothing new
        let again = tracker.ack_local(2, 0b111, now, None);
        assert!(again.acked.is_empty());
        assert_eq!(tracker.unacked_span(), 0);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        tracker.ack_local(10, 1, now, None);
        let outcome = tracker.ack_local(5, 1, now, None);
        assert_eq!(outcome, AckOutcome::default());
        assert_eq!(tracker.last_acked_seq(), Some(10));
    }

    #[test]
    fn test_packets_leaving_window_are_lost() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::new();
        for _ in 0..40 {
            let seq = tracker.next_local_seq();
            tracker.record_sent(seq, 50, start);
        }
        // Peer saw only 39
        let outcome = tracker.ack_local(39, 1, start + Duration::from_millis(10), None);
        assert_eq!(outcome.acked.len(), 1);
        assert_eq!(outcome.lost, (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_unacked_span_grows_without_acks() {
        let mut tracker = SequenceTracker::new();
        for _ in 0..50 {
            tracker.next_local_seq();
        }
        assert_eq!(tracker.unacked_span(), 50);
        tracker.ack_local(9, 1, Instant::now(), None);
        assert_eq!(tracker.unacked_span(), 40);
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new();
        for _ in 0..(MAX_RECENT_PACKETS + 10) {
            let seq = tracker.next_local_seq();
            tracker.record_sent(seq, 1, now);
        }
        assert!(tracker.recent_packet(0).is_none());
        assert!(tracker.recent_packet(MAX_RECENT_PACKETS as u32 + 9).is_some());
        assert_eq!(tracker.packets_sent(), MAX_RECENT_PACKETS as u64 + 10);
    }
}
