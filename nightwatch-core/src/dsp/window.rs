//! Fixed-capacity sliding windows.
//!
//! Detectors keep their recent history in one of two shapes:
//!
//! - [`SampleWindow`] — uniformly sampled data (audio frames, ADC samples)
//!   where the sample rate implies time.
//! - [`TimedWindow`] — irregular data (radar target positions arriving at
//!   roughly 10 Hz with device jitter) where each value carries its own
//!   monotonic timestamp and eviction is age-based.

use std::collections::VecDeque;

/// Ring of uniformly sampled values with a hard capacity.
///
/// Pushing past capacity evicts the oldest samples, so the window always
/// holds the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    buf: VecDeque<f32>,
    capacity: usize,
    sample_rate: u32,
}

impl SampleWindow {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sample_rate,
        }
    }

    /// Window sized to hold `seconds` of history at `sample_rate`.
    pub fn with_duration(seconds: f32, sample_rate: u32) -> Self {
        let capacity = (seconds * sample_rate as f32).ceil() as usize;
        Self::new(capacity, sample_rate)
    }

    pub fn push(&mut self, sample: f32) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(sample);
    }

    pub fn extend(&mut self, samples: &[f32]) {
        for &s in samples {
            self.push(s);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds of history currently held.
    pub fn duration_secs(&self) -> f32 {
        self.buf.len() as f32 / self.sample_rate as f32
    }

    /// Copy the window oldest-first into a contiguous vector.
    pub fn to_vec(&self) -> Vec<f32> {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Ring of `(timestamp, value)` pairs trimmed by age.
#[derive(Debug, Clone)]
pub struct TimedWindow {
    buf: VecDeque<(f64, f32)>,
    max_age: f64,
}

impl TimedWindow {
    pub fn new(max_age_secs: f64) -> Self {
        Self {
            buf: VecDeque::new(),
            max_age: max_age_secs,
        }
    }

    /// Push a sample and drop everything older than `max_age` behind it.
    ///
    /// Out-of-order timestamps are tolerated by clamping to the newest seen.
    pub fn push(&mut self, timestamp: f64, value: f32) {
        let t = match self.buf.back() {
            Some(&(last, _)) if timestamp < last => last,
            _ => timestamp,
        };
        self.buf.push_back((t, value));
        let cutoff = t - self.max_age;
        while matches!(self.buf.front(), Some(&(front, _)) if front < cutoff) {
            self.buf.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Seconds spanned between the oldest and newest samples held.
    pub fn span_secs(&self) -> f64 {
        match (self.buf.front(), self.buf.back()) {
            (Some(&(first, _)), Some(&(last, _))) => last - first,
            _ => 0.0,
        }
    }

    pub fn values(&self) -> Vec<f32> {
        self.buf.iter().map(|&(_, v)| v).collect()
    }

    /// Values no older than `age` seconds behind the newest sample.
    pub fn values_within(&self, age: f64) -> Vec<f32> {
        let Some(&(newest, _)) = self.buf.back() else {
            return Vec::new();
        };
        let cutoff = newest - age;
        self.buf
            .iter()
            .filter(|&&(t, _)| t >= cutoff)
            .map(|&(_, v)| v)
            .collect()
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.buf.iter().map(|&(t, _)| t).collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_window_evicts_oldest() {
        let mut w = SampleWindow::new(3, 10);
        w.extend(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(w.to_vec(), vec![2.0, 3.0, 4.0]);
        assert!(w.is_full());
    }

    #[test]
    fn sample_window_duration_reflects_rate() {
        let mut w = SampleWindow::with_duration(2.0, 100);
        assert_eq!(w.len(), 0);
        w.extend(&vec![0.0; 150]);
        assert!((w.duration_secs() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn timed_window_trims_by_age() {
        let mut w = TimedWindow::new(10.0);
        for i in 0..20 {
            w.push(i as f64, i as f32);
        }
        // Newest is t=19; cutoff 9. Samples 9..=19 remain.
        assert_eq!(w.len(), 11);
        assert_eq!(w.values()[0], 9.0);
        assert!((w.span_secs() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn timed_window_values_within_sub_range() {
        let mut w = TimedWindow::new(30.0);
        for i in 0..10 {
            w.push(i as f64, i as f32);
        }
        let recent = w.values_within(3.0);
        assert_eq!(recent, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn timed_window_tolerates_backwards_timestamps() {
        let mut w = TimedWindow::new(10.0);
        w.push(5.0, 1.0);
        w.push(4.0, 2.0); // device jitter — clamped to 5.0
        assert_eq!(w.len(), 2);
        assert_eq!(w.span_secs(), 0.0);
    }
}
