//! Retransmission queue for signaling that needs positive acknowledgment
//!
//! A retry never reuses the old sequence number: every transmission is a new
//! packet carrying the same payload, and an entry is retired as soon as any
//! of its transmissions is acknowledged.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Transmissions remembered per entry for ack matching
pub const MAX_SENT_SEQS: usize = 16;

/// A payload waiting for acknowledgment
#[derive(Debug, Clone)]
pub struct ReliableOutgoingPacket<T> {
    pub payload: T,
    pub retry_interval: Duration,
    /// Give up this long after the first transmission
    pub timeout: Option<Duration>,
    pub tries_remaining: u32,
    pub first_sent_at: Option<Instant>,
    pub last_sent_at: Option<Instant>,
    pub sent_seqs: VecDeque<u32>,
}

impl<T> ReliableOutgoingPacket<T> {
    fn expired(&self, now: Instant) -> bool {
        // The last copy still gets one retry interval to be acknowledged
        if self.tries_remaining == 0 {
            return self.is_due(now);
        }
        match (self.timeout, self.first_sent_at) {
            (Some(timeout), Some(first)) => now.saturating_duration_since(first) >= timeout,
            _ => false,
        }
    }

    fn due_at(&self) -> Option<Instant> {
        self.last_sent_at.map(|t| t + self.retry_interval)
    }

    fn is_due(&self, now: Instant) -> bool {
        self.due_at().map_or(true, |due| now >= due)
    }
}

/// Bounded-retry queue of outgoing payloads
pub struct ReliableQueue<T> {
    entries: Vec<ReliableOutgoingPacket<T>>,
    dropped: u64,
}

impl<T: Clone> ReliableQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            dropped: 0,
        }
    }

    /// Queue a payload; it goes out on the next `tick`
    pub fn enqueue(
        &mut self,
        payload: T,
        retry_interval: Duration,
        timeout: Option<Duration>,
        max_tries: u32,
    ) {
        self.entries.push(ReliableOutgoingPacket {
            payload,
            retry_interval,
            timeout,
            tries_remaining: max_tries.max(1),
            first_sent_at: None,
            last_sent_at: None,
            sent_seqs: VecDeque::with_capacity(MAX_SENT_SEQS),
        });
    }

    /// Drop expired entries and emit those due for (re)transmission
    ///
    /// `next_seq` allocates the sequence number of each emitted packet.
    pub fn tick(&mut self, now: Instant, mut next_seq: impl FnMut() -> u32) -> Vec<(u32, T)> {
        let before = self.entries.len();
        self.entries.retain(|e| !e.expired(now));
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!("Dropped {} unacknowledged reliable packet(s)", expired);
            self.dropped += expired as u64;
        }

        let mut out = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.is_due(now)) {
            let seq = next_seq();
            if entry.sent_seqs.len() == MAX_SENT_SEQS {
                entry.sent_seqs.pop_front();
            }
            entry.sent_seqs.push_back(seq);
            entry.tries_remaining -= 1;
            entry.first_sent_at.get_or_insert(now);
            entry.last_sent_at = Some(now);
            trace!(
                "Reliable send seq={} tries_remaining={}",
                seq,
                entry.tries_remaining
            );
            out.push((seq, entry.payload.clone()));
        }
        out
    }

    /// Retire every entry that transmitted `seq`
    pub fn on_acked(&mut self, seq: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !e.sent_seqs.contains(&seq));
        before != self.entries.len()
    }

    /// Earliest instant at which `tick` has work to do
    pub fn next_due(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .map(|e| {
                let retry = e.due_at().unwrap_or(now);
                match (e.timeout, e.first_sent_at) {
                    (Some(t), Some(first)) => retry.min(first + t),
                    _ => retry,
                }
            })
            .min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries given up on since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> Default for ReliableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY: Duration = Duration::from_millis(500);

    fn counter() -> impl FnMut() -> u32 {
        let mut seq = 0;
        move || {
            seq += 1;
            seq
        }
    }

    #[test]
    fn test_unacked_payload_sent_max_tries_then_dropped() {
        let start = Instant::now();
        let mut queue = ReliableQueue::new();
        let mut next = counter();
        queue.enqueue("hello", RETRY, None, 3);

        let mut sends = 0;
        for step in 0..20 {
            sends += queue.tick(start + RETRY * step, &mut next).len();
        }
        assert_eq!(sends, 3);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_ack_stops_retries() {
        let start = Instant::now();
        let mut queue = ReliableQueue::new();
        let mut next = counter();
        queue.enqueue(7u8, RETRY, None, 3);

        let first = queue.tick(start, &mut next);
        let second = queue.tick(start + RETRY, &mut next);
        assert_ne!(first[0].0, second[0].0);

        // Ack for the first transmission arrives late
        assert!(queue.on_acked(first[0].0));
        assert!(queue.tick(start + RETRY * 2, &mut next).is_empty());
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_ack_for_last_copy_within_retry_interval() {
        let start = Instant::now();
        let mut queue = ReliableQueue::new();
        let mut next = counter();
        queue.enqueue("bye", RETRY, None, 2);

        assert_eq!(queue.tick(start, &mut next).len(), 1);
        let last = queue.tick(start + RETRY, &mut next);
        assert_eq!(last.len(), 1);

        // Out of tries, but the last copy is still in flight
        assert!(queue.tick(start + RETRY + RETRY / 2, &mut next).is_empty());
        assert_eq!(queue.len(), 1);
        assert!(queue.on_acked(last[0].0));
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_not_due_before_retry_interval() {
        let start = Instant::now();
        let mut queue = ReliableQueue::new();
        let mut next = counter();
        queue.enqueue((), RETRY, None, 5);
        assert_eq!(queue.tick(start, &mut next).len(), 1);
        assert!(queue.tick(start + RETRY / 2, &mut next).is_empty());
        assert_eq!(queue.next_due(start + RETRY / 2), Some(start + RETRY));
    }

    #[test]
    fn test_timeout_drops_entry() {
        let start = Instant::now();
        let mut queue = ReliableQueue::new();
        let mut next = counter();
        queue.enqueue((), RETRY, Some(Duration::from_secs(1)), 100);
        queue.tick(start, &mut next);
        queue.tick(start + RETRY, &mut next);
        assert!(queue.tick(start + Duration::from_secs(1), &mut next).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut queue = ReliableQueue::new();
        queue.enqueue((), RETRY, None, 2);
        queue.tick(Instant::now(), counter());
        assert!(!queue.on_acked(999));
        assert_eq!(queue.len(), 1);
    }
}
