//! Fixed-size rolling histories
//!
//! Every control loop in the session keeps a short window of recent samples
//! (RTTs, inflight bytes, arrival deviation, loss counts). `History` is a
//! ring that overwrites its oldest sample once full.

use std::collections::VecDeque;

/// Ring of the most recent `capacity` samples
#[derive(Debug, Clone)]
pub struct History<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> History<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest one when full
    pub fn add(&mut self, value: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Most recent sample
    pub fn last(&self) -> Option<T> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Samples from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.samples.iter().copied()
    }

    /// The newest `n` samples, newest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = T> + '_ {
        self.samples.iter().rev().take(n).copied()
    }
}

impl<T: Copy + Into<f64>> History<T> {
    /// Mean of all samples (0 when empty)
    pub fn average(&self) -> f64 {
        self.average_recent(self.samples.len())
    }

    /// Mean of the newest `n` samples (0 when empty)
    pub fn average_recent(&self, n: usize) -> f64 {
        let n = n.min(self.samples.len());
        if n == 0 {
            return 0.0;
        }
        self.recent(n).map(Into::into).sum::<f64>() / n as f64
    }

    /// Sum of the newest `n` samples
    pub fn sum_recent(&self, n: usize) -> f64 {
        self.recent(n).map(Into::into).sum()
    }

    /// Population standard deviation of all samples
    pub fn std_dev(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.average();
        let variance = self
            .iter()
            .map(|v| {
                let d = v.into() - mean;
                d * d
            })
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.sqrt()
    }
}

impl<T: Copy + PartialOrd> History<T> {
    pub fn max(&self) -> Option<T> {
        self.iter()
            .fold(None, |acc, v| match acc {
                Some(m) if m >= v => Some(m),
                _ => Some(v),
            })
    }

    pub fn min(&self) -> Option<T> {
        self.iter()
            .fold(None, |acc, v| match acc {
                Some(m) if m <= v => Some(m),
                _ => Some(v),
            })
    }
}
