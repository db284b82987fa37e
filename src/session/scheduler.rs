//! Due-time timer queue for the message task
//!
//! Timers carry a caller-defined kind. A timer may repeat with a fixed
//! interval; repeating timers are re-armed when popped until cancelled.

use std::time::{Duration, Instant};

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Timer<K> {
    id: TimerId,
    kind: K,
    due: Instant,
    interval: Option<Duration>,
}

/// Ordered set of pending timers
#[derive(Debug)]
pub struct Scheduler<K> {
    timers: Vec<Timer<K>>,
    next_id: u64,
}

impl<K: Copy + PartialEq> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
        }
    }

    /// Run `kind` at `due`, then every `interval` if given
    pub fn schedule(&mut self, kind: K, due: Instant, interval: Option<Duration>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            kind,
            due,
            interval,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        before != self.timers.len()
    }

    /// Cancel every timer of this kind
    pub fn cancel_kind(&mut self, kind: K) {
        self.timers.retain(|t| t.kind != kind);
    }

    pub fn is_scheduled(&self, kind: K) -> bool {
        self.timers.iter().any(|t| t.kind == kind)
    }

    /// Pop the earliest timer due at `now`, re-arming it if it repeats
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, K)> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| t.due)
            .map(|(i, _)| i)?;
        let timer = &mut self.timers[index];
        let fired = (timer.id, timer.kind);
        match timer.interval {
            Some(interval) => {
                // Skip missed periods instead of firing a burst
                timer.due += interval;
                if timer.due <= now {
                    timer.due = now + interval;
                }
            }
            None => {
                self.timers.swap_remove(index);
            }
        }
        Some(fired)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.due).min()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

impl<K: Copy + PartialEq> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        A,
        B,
    }

    #[test]
    fn test_fires_in_due_order() {
        let start = Instant::now();
        let mut s = Scheduler::new();
        s.schedule(Kind::B, start + Duration::from_millis(20), None);
        s.schedule(Kind::A, start + Duration::from_millis(10), None);

        assert!(s.pop_due(start).is_none());
        let now = start + Duration::from_millis(30);
        assert_eq!(s.pop_due(now).map(|(_, k)| k), Some(Kind::A));
        assert_eq!(s.pop_due(now).map(|(_, k)| k), Some(Kind::B));
        assert!(s.pop_due(now).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn test_repeating_timer_rearms_until_cancelled() {
        let start = Instant::now();
        let mut s = Scheduler::new();
        let id = s.schedule(Kind::A, start, Some(Duration::from_secs(1)));

        assert!(s.pop_due(start).is_some());
        assert_eq!(s.next_due(), Some(start + Duration::from_secs(1)));
        assert!(s.pop_due(start + Duration::from_millis(500)).is_none());

        // Long stall: one firing, next due one interval later
        let late = start + Duration::from_secs(10);
        assert!(s.pop_due(late).is_some());
        assert!(s.pop_due(late).is_none());
        assert_eq!(s.next_due(), Some(late + Duration::from_secs(1)));

        assert!(s.cancel(id));
        assert!(s.next_due().is_none());
    }

    #[test]
    fn test_cancel_kind() {
        let now = Instant::now();
        let mut s = Scheduler::new();
        s.schedule(Kind::A, now, None);
        s.schedule(Kind::A, now, Some(Duration::from_secs(1)));
        s.schedule(Kind::B, now, None);
        s.cancel_kind(Kind::A);
        assert!(!s.is_scheduled(Kind::A));
        assert!(s.is_scheduled(Kind::B));
        assert_eq!(s.len(), 1);
    }
}
