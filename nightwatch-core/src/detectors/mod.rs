//! Detectors: per-sensor DSP turning raw frames into structured events.
//!
//! ## Worker loop (per detector)
//!
//! ```text
//! 1. connect() with exponential backoff (session rotates on success)
//! 2. read() raw frames; transient errors retry, fatal errors reconnect
//! 3. Detector::ingest(frame) — bounded DSP, no yielding mid-window
//! 4. On a completed tick: stamp sequence/session, publish to the bus
//! ```
//!
//! The worker — not the individual detector — enforces the event
//! invariants: exactly one event per tick, strictly increasing `sequence`
//! per session, non-decreasing timestamps (a violation drops the event and
//! rotates the session).

pub mod audio;
pub mod capacitive;
pub mod radar;

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, info, warn};

use crate::bus::{EventBus, Message, Topic};
use crate::drivers::{Backoff, SensorDriver};
use crate::events::{DetectorId, DetectorState, Event, FieldValue};
use crate::health::HealthRegistry;

/// What a detector produced for one processing tick.
#[derive(Debug, Clone)]
pub struct TickOutput {
    /// Acquisition time of the newest contributing frame.
    pub timestamp: f64,
    pub state: DetectorState,
    pub confidence: f32,
    pub values: BTreeMap<String, FieldValue>,
}

impl TickOutput {
    pub fn uncertain(timestamp: f64, values: BTreeMap<String, FieldValue>) -> Self {
        Self {
            timestamp,
            state: DetectorState::Uncertain,
            confidence: 0.2,
            values,
        }
    }
}

/// Sensor-specific DSP state machine.
///
/// `ingest` is called once per raw frame and returns `Some` when the
/// detector's tick period has elapsed — exactly one event per tick, with
/// `state == Uncertain` (and `Null` features) when the window is too thin
/// to make a claim.
pub trait Detector: Send {
    type Frame: Send;

    fn id(&self) -> DetectorId;

    fn ingest(&mut self, frame: Self::Frame) -> Option<TickOutput>;

    /// Drop all window state (called when the session rotates).
    fn reset(&mut self);
}

/// Owns a driver + detector pair and runs it to completion.
pub struct DetectorWorker<D, T>
where
    D: SensorDriver,
    T: Detector<Frame = D::Frame>,
{
    driver: D,
    detector: T,
    bus: EventBus,
    health: Arc<HealthRegistry>,
    running: Arc<AtomicBool>,
    session_id: u32,
    sequence: u64,
    last_timestamp: f64,
}

impl<D, T> DetectorWorker<D, T>
where
    D: SensorDriver,
    T: Detector<Frame = D::Frame>,
{
    pub fn new(
        driver: D,
        detector: T,
        bus: EventBus,
        health: Arc<HealthRegistry>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            driver,
            detector,
            bus,
            health,
            running,
            session_id: 0,
            sequence: 0,
            last_timestamp: f64::NEG_INFINITY,
        }
    }

    fn rotate_session(&mut self) {
        self.session_id = self.session_id.wrapping_add(1);
        self.sequence = 0;
        self.last_timestamp = f64::NEG_INFINITY;
        self.detector.reset();
    }

    /// Run until the shared `running` flag clears. Final disconnect happens
    /// before return so cancellation leaves no open device handle.
    pub async fn run(mut self) {
        let id = self.detector.id();
        info!(detector = %id, "detector worker started");

        'reconnect: while self.running.load(Ordering::Relaxed) {
            // ── Connect, backing off between attempts ────────────────────
            let mut backoff = Backoff::new();
            loop {
                if !self.running.load(Ordering::Relaxed) {
                    break 'reconnect;
                }
                match self.driver.connect().await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(detector = %id, error = %e, ?delay, "connect failed, retrying");
                        self.health.note_transient_error(id);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            self.rotate_session();
            info!(detector = %id, session = self.session_id, "detector session started");

            // ── Read / process ───────────────────────────────────────────
            let mut read_backoff = Backoff::new();
            while self.running.load(Ordering::Relaxed) {
                match self.driver.read().await {
                    Ok(frame) => {
                        read_backoff.reset();
                        let resyncs = self.driver.take_resyncs();
                        if resyncs > 0 {
                            self.health.note_resyncs(id, resyncs);
                        }
                        if let Some(tick) = self.detector.ingest(frame) {
                            self.publish(id, tick);
                        }
                    }
                    Err(e) if !e.is_fatal() => {
                        debug!(detector = %id, error = %e, "transient read error");
                        self.health.note_transient_error(id);
                        tokio::time::sleep(read_backoff.next_delay()).await;
                    }
                    Err(e) => {
                        warn!(detector = %id, error = %e, "fatal read error, reconnecting");
                        self.health.note_disconnected(id);
                        self.driver.disconnect().await;
                        continue 'reconnect;
                    }
                }
            }
        }

        self.driver.disconnect().await;
        info!(detector = %id, "detector worker stopped");
    }

    fn publish(&mut self, id: DetectorId, tick: TickOutput) {
        if tick.timestamp < self.last_timestamp {
            // Device clock went backwards mid-session: drop the event and
            // start a fresh session rather than corrupt the stream.
            warn!(
                detector = %id,
                timestamp = tick.timestamp,
                last = self.last_timestamp,
                "non-monotonic tick timestamp, rotating session"
            );
            self.rotate_session();
            return;
        }
        self.last_timestamp = tick.timestamp;

        let event = Event {
            detector: id,
            timestamp: tick.timestamp,
            sequence: self.sequence,
            session_id: self.session_id,
            state: tick.state,
            confidence: tick.confidence.clamp(0.0, 1.0),
            values: tick.values,
        };
        self.sequence += 1;
        self.health.note_event(id);
        self.bus.publish(Topic::Events, Message::Event(event));
    }
}
