//! Radar detector: respiration, heart-rate estimate, movement, presence.
//!
//! ## DSP per tick (1 Hz)
//!
//! ```text
//! y_mm ring (30 s @ ~10 Hz)
//!   ├─ respiration: 0.1–0.5 Hz band-pass → adaptive-prominence peaks
//!   │               rate = 60 / median inter-peak interval, clamp [4, 40]
//!   ├─ heart rate:  0.8–2.0 Hz band over last 15 s → FFT peak,
//!   │               confidence = scaled peak-to-sidelobe, capped at 0.5
//!   ├─ movement:    1 s window; excursion > 100 mm → macro,
//!   │               else micro intensity from rolling std
//!   └─ presence:    any target for ≥ 1 s of the last 3 s
//! ```

use std::collections::BTreeMap;

use crate::detectors::{Detector, TickOutput};
use crate::drivers::RadarFrame;
use crate::dsp::{find_peaks, BandPass, Spectrum, TimedWindow};
use crate::dsp::stats::{mean, percentile, std_dev};
use crate::events::{DetectorId, DetectorState, FieldValue};

/// Nominal radar frame rate.
const FRAME_HZ: f64 = 10.0;

/// Seconds of `y_mm` history for the respiration pass.
const POSITION_WINDOW_SECS: f64 = 30.0;

/// Seconds of history for the heart-rate spectral pass.
const CARDIAC_WINDOW_SECS: f64 = 15.0;

/// Minimum inter-breath spacing (1.5 s at the frame rate).
const BREATH_MIN_DISTANCE: usize = 15;

/// Fewer peaks than this in the window → no respiration claim.
const MIN_BREATH_PEAKS: usize = 3;

/// Macro movement: > 100 mm excursion inside 1 s.
const MACRO_EXCURSION_MM: f32 = 100.0;

/// Presence: target seen for ≥ 1 s of the last 3 s.
const PRESENCE_LOOKBACK_SECS: f64 = 3.0;
const PRESENCE_MIN_SECS: f64 = 1.0;

const TICK_PERIOD_SECS: f64 = 1.0;

pub struct RadarDetector {
    positions: TimedWindow,
    /// 1.0 when the frame carried any target, else 0.0.
    presence: TimedWindow,
    last_tick: Option<f64>,
}

impl RadarDetector {
    pub fn new() -> Self {
        Self {
            positions: TimedWindow::new(POSITION_WINDOW_SECS),
            presence: TimedWindow::new(PRESENCE_LOOKBACK_SECS),
            last_tick: None,
        }
    }

    fn respiration(&self) -> Option<(f64, f32)> {
        let y = self.positions.values();
        if (y.len() as f64) < FRAME_HZ * 10.0 {
            return None;
        }
        let mut band = BandPass::new(FRAME_HZ, 0.1, 0.5);
        let filtered = band.process_block(&y);
        // Skip the filter settle region before measuring.
        let settled = &filtered[filtered.len().min(30)..];
        if settled.len() < BREATH_MIN_DISTANCE * MIN_BREATH_PEAKS {
            return None;
        }

        let envelope: Vec<f32> = settled.iter().map(|s| s.abs()).collect();
        let prominence = percentile(&envelope, 75.0).max(0.5);
        let peaks = find_peaks(settled, BREATH_MIN_DISTANCE, prominence);
        if peaks.len() < MIN_BREATH_PEAKS {
            return None;
        }

        let intervals: Vec<f32> = peaks
            .windows(2)
            .map(|w| (w[1] - w[0]) as f32 / FRAME_HZ as f32)
            .collect();
        let median_interval = crate::dsp::stats::median(&intervals);
        if median_interval <= 0.0 {
            return None;
        }
        let rate = (60.0 / median_interval as f64).clamp(4.0, 40.0);

        // Regular breathing → tight intervals → high confidence.
        let spread = std_dev(&intervals) / mean(&intervals).max(1e-3);
        let confidence = (0.95 - spread).clamp(0.3, 0.95);
        Some((rate, confidence))
    }

    fn heart_rate(&self) -> Option<(f64, f32)> {
        let y = self.positions.values_within(CARDIAC_WINDOW_SECS);
        if (y.len() as f64) < FRAME_HZ * CARDIAC_WINDOW_SECS * 0.8 {
            return None;
        }
        let mut band = BandPass::new(FRAME_HZ, 0.8, 2.0);
        let filtered = band.process_block(&y);
        let spectrum = Spectrum::compute(&filtered[filtered.len().min(20)..], FRAME_HZ as f32)?;
        let peak = spectrum.peak_in_band(0.8, 2.0)?;

        // Positional HR is inherently weak — cap the confidence at 0.5.
        let confidence = ((peak.sidelobe_ratio - 1.0) / 6.0).clamp(0.0, 0.5);
        if confidence <= 0.05 {
            return None;
        }
        Some(((peak.freq_hz * 60.0) as f64, confidence))
    }

    fn movement(&self) -> (bool, f32) {
        let recent = self.positions.values_within(1.0);
        if recent.len() < 3 {
            return (false, 0.0);
        }
        let min = recent.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = recent.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max - min > MACRO_EXCURSION_MM {
            return (true, 1.0);
        }
        let intensity = (std_dev(&recent) / 25.0).clamp(0.0, 1.0);
        (false, intensity)
    }

    fn present(&self) -> Option<bool> {
        if self.presence.is_empty() {
            return None;
        }
        let hits = self
            .presence
            .values_within(PRESENCE_LOOKBACK_SECS)
            .iter()
            .filter(|&&v| v > 0.0)
            .count();
        Some(hits as f64 / FRAME_HZ >= PRESENCE_MIN_SECS)
    }
}

impl Default for RadarDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for RadarDetector {
    type Frame = RadarFrame;

    fn id(&self) -> DetectorId {
        DetectorId::Radar
    }

    fn ingest(&mut self, frame: RadarFrame) -> Option<TickOutput> {
        let t = frame.timestamp;
        // Primary target: the sensor lists its strongest track first.
        if let Some(primary) = frame.targets.first() {
            self.positions.push(t, primary.y_mm as f32);
            self.presence.push(t, 1.0);
        } else {
            self.presence.push(t, 0.0);
        }

        if let Some(last) = self.last_tick {
            if t - last < TICK_PERIOD_SECS {
                return None;
            }
        }
        self.last_tick = Some(t);

        let mut values = BTreeMap::new();
        let Some(present) = self.present() else {
            values.insert("presence".into(), FieldValue::Null);
            values.insert("respiration_rate".into(), FieldValue::Null);
            values.insert("heart_rate".into(), FieldValue::Null);
            return Some(TickOutput::uncertain(t, values));
        };

        let respiration = self.respiration();
        let heart = self.heart_rate();
        let (macro_move, intensity) = self.movement();

        values.insert("presence".into(), present.into());
        values.insert(
            "respiration_rate".into(),
            respiration.map(|(r, _)| r).into(),
        );
        values.insert("heart_rate".into(), heart.map(|(hr, _)| hr).into());
        values.insert(
            "heart_rate_confidence".into(),
            heart.map(|(_, c)| c as f64).into(),
        );
        values.insert("movement_macro".into(), macro_move.into());
        values.insert("movement_intensity".into(), (intensity as f64).into());

        let (state, confidence) = match (present, respiration) {
            // An empty room is a confident normal claim, not uncertainty.
            (false, _) => (DetectorState::Normal, 0.85),
            (true, None) => {
                return Some(TickOutput::uncertain(t, values));
            }
            (true, Some((rate, conf))) => {
                let state = if !(6.0..=30.0).contains(&rate) {
                    DetectorState::Warning
                } else {
                    DetectorState::Normal
                };
                (state, conf)
            }
        };

        Some(TickOutput {
            timestamp: t,
            state,
            confidence,
            values,
        })
    }

    fn reset(&mut self) {
        self.positions.clear();
        self.presence.clear();
        self.last_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::RadarTarget;

    fn breathing_frame(t: f64, bpm: f64) -> RadarFrame {
        let y = 1500.0 + 8.0 * (2.0 * std::f64::consts::PI * bpm / 60.0 * t).sin();
        RadarFrame {
            timestamp: t,
            targets: vec![RadarTarget {
                x_mm: 0,
                y_mm: y as i32,
                speed_cm_s: 0,
            }],
        }
    }

    fn empty_frame(t: f64) -> RadarFrame {
        RadarFrame {
            timestamp: t,
            targets: Vec::new(),
        }
    }

    fn run_stream(
        detector: &mut RadarDetector,
        seconds: f64,
        frame: impl Fn(f64) -> RadarFrame,
    ) -> Vec<TickOutput> {
        let mut ticks = Vec::new();
        let n = (seconds * FRAME_HZ) as usize;
        for i in 0..n {
            let t = i as f64 / FRAME_HZ;
            if let Some(tick) = detector.ingest(frame(t)) {
                ticks.push(tick);
            }
        }
        ticks
    }

    #[test]
    fn emits_roughly_one_tick_per_second() {
        let mut d = RadarDetector::new();
        let ticks = run_stream(&mut d, 10.0, |t| breathing_frame(t, 14.0));
        assert!((9..=11).contains(&ticks.len()), "got {} ticks", ticks.len());
    }

    #[test]
    fn recovers_the_respiration_rate() {
        let mut d = RadarDetector::new();
        let ticks = run_stream(&mut d, 60.0, |t| breathing_frame(t, 15.0));
        let last = ticks.last().expect("ticks");
        let rate = last
            .values
            .get("respiration_rate")
            .and_then(|v| v.as_f64())
            .expect("rate after a full window");
        assert!(
            (11.0..=19.0).contains(&rate),
            "expected ~15 BPM, got {rate}"
        );
        assert_eq!(last.state, DetectorState::Normal);
        assert!(last.confidence > 0.3);
    }

    #[test]
    fn short_window_is_uncertain_with_null_rate() {
        let mut d = RadarDetector::new();
        let ticks = run_stream(&mut d, 5.0, |t| breathing_frame(t, 14.0));
        let first = ticks.first().expect("tick");
        assert_eq!(first.state, DetectorState::Uncertain);
        assert!(first.values["respiration_rate"].is_null());
    }

    #[test]
    fn empty_room_reports_absent_not_uncertain() {
        let mut d = RadarDetector::new();
        let ticks = run_stream(&mut d, 10.0, empty_frame);
        let last = ticks.last().expect("tick");
        assert_eq!(last.state, DetectorState::Normal);
        assert_eq!(last.values["presence"], FieldValue::Bool(false));
    }

    #[test]
    fn presence_needs_a_full_second_of_hits() {
        let mut d = RadarDetector::new();
        // 29 s empty, then only 0.5 s of target before the next tick.
        run_stream(&mut d, 29.0, empty_frame);
        for i in 0..5 {
            let t = 29.0 + i as f64 / FRAME_HZ;
            d.ingest(breathing_frame(t, 14.0));
        }
        let tick = d.ingest(empty_frame(30.01)).expect("tick");
        assert_eq!(tick.values["presence"], FieldValue::Bool(false));
    }

    #[test]
    fn large_excursion_flags_macro_movement() {
        let mut d = RadarDetector::new();
        run_stream(&mut d, 30.0, |t| breathing_frame(t, 14.0));
        // A 400 mm jump inside one second.
        let mut last_tick = None;
        for i in 0..12 {
            let t = 30.0 + i as f64 / FRAME_HZ;
            let y = if i % 2 == 0 { 1500 } else { 1900 };
            let frame = RadarFrame {
                timestamp: t,
                targets: vec![RadarTarget {
                    x_mm: 0,
                    y_mm: y,
                    speed_cm_s: 40,
                }],
            };
            if let Some(tick) = d.ingest(frame) {
                last_tick = Some(tick);
            }
        }
        let tick = last_tick.expect("tick during the jump window");
        assert_eq!(tick.values["movement_macro"], FieldValue::Bool(true));
        assert_eq!(
            tick.values["movement_intensity"],
            FieldValue::Number(1.0)
        );
    }

    #[test]
    fn slow_breathing_maps_to_warning_state() {
        let mut d = RadarDetector::new();
        let ticks = run_stream(&mut d, 90.0, |t| breathing_frame(t, 5.0));
        let last = ticks.last().expect("tick");
        if let Some(rate) = last.values["respiration_rate"].as_f64() {
            assert!(rate < 8.0, "rate {rate}");
            assert_eq!(last.state, DetectorState::Warning);
        }
    }

    #[test]
    fn reset_clears_all_windows() {
        let mut d = RadarDetector::new();
        run_stream(&mut d, 40.0, |t| breathing_frame(t, 14.0));
        d.reset();
        let tick = d.ingest(breathing_frame(41.0, 14.0)).expect("first tick");
        assert_eq!(tick.state, DetectorState::Uncertain);
    }
}
