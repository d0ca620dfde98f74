//! Sensor drivers.
//!
//! One driver per hardware family, all behind the same capability trait:
//! connect, disconnect, pull-read, optional calibrate. Raw frames are
//! stamped with monotonic time **at acquisition** — the detector may be
//! arbitrarily behind, the physics is not.
//!
//! Errors split into two categories at this seam: `Transient` (retry with
//! backoff, stay connected) and `Fatal` (tear down and reconnect). The
//! detector worker owns that policy; drivers just classify.

pub mod mock;
pub mod radar;
pub mod resample;

pub mod audio;
pub mod capacitive;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::events::DetectorId;

/// Driver failure, categorized for the retry policy.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Retryable in place: read timeout, checksum failure, underrun.
    #[error("transient driver error: {0}")]
    Transient(String),

    /// The device handle is gone until a reconnect.
    #[error("fatal driver error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Fatal(_))
    }
}

/// One tracked radar target in sensor coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadarTarget {
    pub x_mm: i32,
    pub y_mm: i32,
    pub speed_cm_s: i32,
}

/// One decoded radar frame (~10 Hz).
#[derive(Debug, Clone)]
pub struct RadarFrame {
    /// Monotonic acquisition time.
    pub timestamp: f64,
    pub targets: Vec<RadarTarget>,
}

/// A block of mono f32 PCM at a fixed rate (16 kHz after conversion).
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub timestamp: f64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A block of ADC samples from the capacitive / BCG board (100 Hz).
#[derive(Debug, Clone)]
pub struct AdcBlock {
    pub timestamp: f64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// The uniform pull interface every sensor family implements.
///
/// `read()` suspends only on I/O; a cancelled worker drops the driver,
/// which must release the device handle in `Drop`/`disconnect`.
#[async_trait]
pub trait SensorDriver: Send {
    type Frame: Send + 'static;

    fn id(&self) -> DetectorId;

    async fn connect(&mut self) -> Result<(), DriverError>;

    async fn disconnect(&mut self);

    /// Pull the next raw frame. Blocks (asynchronously) until data or error.
    async fn read(&mut self) -> Result<Self::Frame, DriverError>;

    /// Optional calibration pass; returns learned parameters by name.
    async fn calibrate(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        Err(DriverError::Fatal(format!(
            "{} does not support calibration",
            self.id()
        )))
    }

    /// Framing resynchronizations since the last call. Only framed
    /// transports (radar) report a non-zero count.
    fn take_resyncs(&mut self) -> u64 {
        0
    }
}

/// Exponential reconnect backoff: 200 ms start, 5 s cap, ±20 % jitter.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    start: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_bounds(Duration::from_millis(200), Duration::from_secs(5))
    }

    pub fn with_bounds(start: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            start,
            cap,
        }
    }

    /// Next delay, growing 2× per attempt up to the cap, jittered ±20 %.
    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .start
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter: f64 = rand::random_range(0.8..1.2);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }

    /// Call after a successful read/connect to restart the ladder.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
