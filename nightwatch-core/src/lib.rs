//! # nightwatch-core
//!
//! On-device, non-contact vital-signs and anomaly monitoring pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Radar UART ─► RadarDetector ──┐
//! Microphone ─► AudioDetector ──┼─► EventBus ─► FusionEngine ─► channels
//! I²C ADC ────► CapacitiveDet ──┘       │             │
//!                                       ▼             ▼
//!                                  AlertEngine (rules, dwell, cooldown)
//!                                       │
//!                                       ▼
//!                        Notifier (local alarm, push providers)
//! ```
//!
//! Drivers acquire raw frames with acquisition-time stamps; detectors run
//! bounded DSP windows and emit one structured event per tick; fusion
//! folds events into named channels with agreement and staleness
//! bookkeeping; the alert engine evaluates configured rules with dwell and
//! cooldown; the notifier delivers with retry and duplicate suppression.
//! The orchestrator ([`NightwatchEngine`]) owns every handle — there are
//! no global singletons, and all timing flows through an injectable
//! [`clock::Clock`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod alert;
pub mod baseline;
pub mod bus;
pub mod clock;
pub mod config;
pub mod detectors;
pub mod drivers;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod events;
pub mod fusion;
pub mod health;
pub mod notify;

// Convenience re-exports for the app shell and external embedders.
pub use config::Config;
pub use engine::{calibrate_detector, NightwatchEngine, PauseState};
pub use error::{NightwatchError, Result};
pub use events::{
    Alert, AlertLevel, ControlRequest, DetectorId, DetectorState, Envelope, Event, FieldValue,
    FusedSignal, SignalValue,
};
pub use health::{ComponentStatus, StatusReport, SystemStatus};
