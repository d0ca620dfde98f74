//! Audio detector: breathing, silence, vocalization, seizure-like sounds.
//!
//! Operates on 20 ms blocks of 16 kHz mono PCM. Per-block work is a few
//! filter taps and an RMS; the window-wide passes (breath peaks, envelope
//! spectrum) run once per 1 s tick.
//!
//! ## Features
//!
//! | Field | Method |
//! |-------|--------|
//! | `noise_floor` | 5th percentile of block RMS over 30 s |
//! | `breathing_rate` | 200–800 Hz band → envelope (2 Hz LP) → peaks |
//! | `silence_duration` | RMS < floor × margin, runs ≥ 10 s reported |
//! | `vocalization` | 200–3000 Hz energy > 3× baseline for ≥ 200 ms |
//! | `seizure_pattern` | envelope spectral peak 1.5–8 Hz, prominence > 1.5×, seizure:breathing energy > 2, sustained ≥ 5 s |

use std::collections::BTreeMap;

use crate::detectors::{Detector, TickOutput};
use crate::drivers::AudioBlock;
use crate::dsp::{find_peaks, BandPass, EnvelopeFollower, SampleWindow, Spectrum};
use crate::dsp::stats::{percentile, rms};
use crate::events::{DetectorId, DetectorState, FieldValue};

const SAMPLE_RATE: f64 = 16_000.0;

/// Block cadence: 20 ms → 50 blocks/s.
const BLOCKS_PER_SEC: f64 = 50.0;

const TICK_PERIOD_SECS: f64 = 1.0;

/// History for the adaptive noise floor and breath counting.
const HISTORY_SECS: f32 = 30.0;

/// Silence threshold margin over the noise floor.
const SILENCE_MARGIN: f32 = 2.0;

/// Silence runs shorter than this are not reported.
const SILENCE_REPORT_SECS: f64 = 10.0;

/// Vocalization: broadband energy over baseline, sustained.
const VOCAL_RATIO: f32 = 3.0;
const VOCAL_MIN_BLOCKS: u32 = 10; // 200 ms

/// Seizure-sound decision thresholds.
const SEIZURE_BAND: (f32, f32) = (1.5, 8.0);
const SEIZURE_PROMINENCE: f32 = 1.5;
const SEIZURE_TO_BREATHING_RATIO: f32 = 2.0;
const SEIZURE_SUSTAIN_SECS: f64 = 5.0;

/// Minimum history before any claim.
const MIN_CLAIM_SECS: f32 = 5.0;

pub struct AudioDetector {
    breath_band: BandPass,
    breath_env: EnvelopeFollower,
    vocal_band: BandPass,

    /// Per-block RMS at 50 Hz, 30 s.
    rms_history: SampleWindow,
    /// Breath envelope downsampled to one value per block (50 Hz), 30 s.
    envelope_history: SampleWindow,
    /// Broadband (vocal band) energy per block, 30 s.
    vocal_history: SampleWindow,

    silence_since: Option<f64>,
    vocal_run: u32,
    seizure_since: Option<f64>,
    last_tick: Option<f64>,
    /// Externally learned noise floor carried across restarts, if any.
    baseline_floor: Option<f32>,
}

impl AudioDetector {
    pub fn new() -> Self {
        Self {
            breath_band: BandPass::new(SAMPLE_RATE, 200.0, 800.0),
            breath_env: EnvelopeFollower::new(SAMPLE_RATE, 2.0),
            vocal_band: BandPass::new(SAMPLE_RATE, 200.0, 3000.0),
            rms_history: SampleWindow::with_duration(HISTORY_SECS, BLOCKS_PER_SEC as u32),
            envelope_history: SampleWindow::with_duration(HISTORY_SECS, BLOCKS_PER_SEC as u32),
            vocal_history: SampleWindow::with_duration(HISTORY_SECS, BLOCKS_PER_SEC as u32),
            silence_since: None,
            vocal_run: 0,
            seizure_since: None,
            last_tick: None,
            baseline_floor: None,
        }
    }

    /// Seed the adaptive floor from the persisted baseline cache.
    pub fn with_baseline_floor(mut self, floor: Option<f64>) -> Self {
        self.baseline_floor = floor.map(|f| f as f32);
        self
    }

    /// Adaptive noise floor: 5th percentile of recent block RMS, seeded by
    /// the persisted baseline until enough history accumulates.
    pub fn noise_floor(&self) -> f32 {
        let history = self.rms_history.to_vec();
        if (history.len() as f64) < BLOCKS_PER_SEC * 5.0 {
            return self.baseline_floor.unwrap_or(1e-4).max(1e-6);
        }
        percentile(&history, 5.0).max(1e-6)
    }

    fn breathing_rate(&self) -> Option<(f64, f32)> {
        if self.envelope_history.duration_secs() < 15.0 {
            return None;
        }
        let envelope = self.envelope_history.to_vec();
        let prominence = (percentile(&envelope, 75.0) - percentile(&envelope, 25.0)).max(1e-5);
        let min_distance = (1.5 * BLOCKS_PER_SEC) as usize;
        let peaks = find_peaks(&envelope, min_distance, prominence);
        if peaks.len() < 3 {
            return None;
        }
        let intervals: Vec<f32> = peaks
            .windows(2)
            .map(|w| (w[1] - w[0]) as f32 / BLOCKS_PER_SEC as f32)
            .collect();
        let median = crate::dsp::stats::median(&intervals);
        if median <= 0.0 {
            return None;
        }
        let rate = (60.0 / median as f64).clamp(4.0, 40.0);
        let spread = crate::dsp::stats::std_dev(&intervals)
            / crate::dsp::stats::mean(&intervals).max(1e-3);
        Some((rate, (0.85 - spread).clamp(0.2, 0.85)))
    }

    /// Envelope-spectrum test for rhythmic non-breathing sound.
    fn seizure_condition(&self) -> bool {
        if self.envelope_history.duration_secs() < 10.0 {
            return false;
        }
        let envelope = self.envelope_history.to_vec();
        let Some(spectrum) = Spectrum::compute(&envelope, BLOCKS_PER_SEC as f32) else {
            return false;
        };
        let Some(peak) = spectrum.peak_in_band(SEIZURE_BAND.0, SEIZURE_BAND.1) else {
            return false;
        };
        if peak.prominence_ratio <= SEIZURE_PROMINENCE {
            return false;
        }
        let seizure_energy = spectrum.band_energy(SEIZURE_BAND.0, SEIZURE_BAND.1);
        let breathing_energy = spectrum.band_energy(0.1, 0.7).max(f32::EPSILON);
        seizure_energy / breathing_energy > SEIZURE_TO_BREATHING_RATIO
    }
}

impl Default for AudioDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for AudioDetector {
    type Frame = AudioBlock;

    fn id(&self) -> DetectorId {
        DetectorId::Audio
    }

    fn ingest(&mut self, block: AudioBlock) -> Option<TickOutput> {
        let t = block.timestamp;

        // ── Per-block streaming passes ───────────────────────────────────
        let block_rms = rms(&block.samples);
        self.rms_history.push(block_rms);

        let mut env_acc = 0f32;
        let mut vocal_acc = 0f32;
        for &s in &block.samples {
            let breath = self.breath_band.process(s);
            env_acc += self.breath_env.process(breath);
            let vocal = self.vocal_band.process(s);
            vocal_acc += vocal * vocal;
        }
        let n = block.samples.len().max(1) as f32;
        self.envelope_history.push(env_acc / n);
        self.vocal_history.push(vocal_acc / n);

        // Silence run tracking (floor × margin), updated every block.
        let floor = self.noise_floor();
        if block_rms < floor * SILENCE_MARGIN {
            self.silence_since.get_or_insert(t);
        } else {
            self.silence_since = None;
        }

        // Vocalization transient tracking.
        let vocal_energy = vocal_acc / n;
        let baseline = {
            let history = self.vocal_history.to_vec();
            percentile(&history, 50.0).max(1e-7)
        };
        if vocal_energy > VOCAL_RATIO * baseline {
            self.vocal_run = self.vocal_run.saturating_add(1);
        } else {
            self.vocal_run = 0;
        }

        // ── Tick gate ────────────────────────────────────────────────────
        if let Some(last) = self.last_tick {
            if t - last < TICK_PERIOD_SECS {
                return None;
            }
        }
        self.last_tick = Some(t);

        // Seizure condition must hold continuously for SEIZURE_SUSTAIN_SECS.
        if self.seizure_condition() {
            self.seizure_since.get_or_insert(t);
        } else {
            self.seizure_since = None;
        }
        let seizure = self
            .seizure_since
            .map(|since| t - since >= SEIZURE_SUSTAIN_SECS)
            .unwrap_or(false);

        let silence_duration = self
            .silence_since
            .map(|since| t - since)
            .filter(|&d| d >= SILENCE_REPORT_SECS)
            .unwrap_or(0.0);

        let vocalization = self.vocal_run >= VOCAL_MIN_BLOCKS;
        let breathing = self.breathing_rate();

        let mut values = BTreeMap::new();
        values.insert("noise_floor".into(), (floor as f64).into());
        values.insert("rms".into(), (block_rms as f64).into());
        values.insert("breathing_rate".into(), breathing.map(|(r, _)| r).into());
        values.insert("silence_duration".into(), silence_duration.into());
        values.insert("vocalization".into(), vocalization.into());
        values.insert("seizure_pattern".into(), seizure.into());

        if self.rms_history.duration_secs() < MIN_CLAIM_SECS {
            return Some(TickOutput::uncertain(t, values));
        }

        let (state, confidence) = if seizure {
            (DetectorState::Alert, 0.75)
        } else if silence_duration > 0.0 {
            (DetectorState::Warning, 0.7)
        } else {
            (DetectorState::Normal, breathing.map(|(_, c)| c).unwrap_or(0.5))
        };

        Some(TickOutput {
            timestamp: t,
            state,
            confidence,
            values,
        })
    }

    fn reset(&mut self) {
        self.breath_band.reset();
        self.breath_env.reset();
        self.vocal_band.reset();
        self.rms_history.clear();
        self.envelope_history.clear();
        self.vocal_history.clear();
        self.silence_since = None;
        self.vocal_run = 0;
        self.seizure_since = None;
        self.last_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 320;

    fn block_at(t: f64, gen: impl Fn(f64) -> f32) -> AudioBlock {
        let samples = (0..BLOCK)
            .map(|i| gen(t + i as f64 / SAMPLE_RATE))
            .collect();
        AudioBlock {
            timestamp: t,
            samples,
            sample_rate: 16_000,
        }
    }

    fn feed(
        detector: &mut AudioDetector,
        seconds: f64,
        gen: impl Fn(f64) -> f32,
    ) -> Vec<TickOutput> {
        let mut ticks = Vec::new();
        let blocks = (seconds * BLOCKS_PER_SEC) as usize;
        for i in 0..blocks {
            let t = i as f64 * 0.02;
            if let Some(tick) = detector.ingest(block_at(t, &gen)) {
                ticks.push(tick);
            }
        }
        ticks
    }

    fn breathing_signal(bpm: f64) -> impl Fn(f64) -> f32 {
        move |t| {
            let envelope = (std::f64::consts::PI * bpm / 60.0 * t).sin().abs();
            let carrier = (2.0 * std::f64::consts::PI * 400.0 * t).sin();
            (0.05 * envelope * carrier) as f32
        }
    }

    #[test]
    fn quiet_start_is_uncertain() {
        let mut d = AudioDetector::new();
        let ticks = feed(&mut d, 3.0, |_| 0.0);
        assert!(ticks.iter().all(|t| t.state == DetectorState::Uncertain));
    }

    #[test]
    fn recovers_breathing_rate_from_modulated_band_noise() {
        let mut d = AudioDetector::new();
        let ticks = feed(&mut d, 60.0, breathing_signal(14.0));
        let rate = ticks
            .last()
            .and_then(|t| t.values["breathing_rate"].as_f64())
            .expect("breathing rate");
        assert!(
            (9.0..=20.0).contains(&rate),
            "expected ~14 BPM, got {rate}"
        );
    }

    #[test]
    fn sustained_silence_reports_duration_and_warns() {
        let mut d = AudioDetector::new();
        // Establish a floor with audible breathing, then go quiet.
        feed(&mut d, 30.0, breathing_signal(14.0));
        let mut silence_ticks = Vec::new();
        for i in 0..(20.0 * BLOCKS_PER_SEC) as usize {
            let t = 30.0 + i as f64 * 0.02;
            if let Some(tick) = d.ingest(block_at(t, |_| 0.000_01)) {
                silence_ticks.push(tick);
            }
        }
        let last = silence_ticks.last().expect("tick");
        let duration = last.values["silence_duration"].as_f64().expect("duration");
        assert!(duration >= SILENCE_REPORT_SECS, "duration {duration}");
        assert_eq!(last.state, DetectorState::Warning);

        // Short runs stay unreported.
        let early = &silence_ticks[3];
        assert_eq!(early.values["silence_duration"], FieldValue::Number(0.0));
    }

    #[test]
    fn loud_transient_sets_vocalization() {
        let mut d = AudioDetector::new();
        feed(&mut d, 30.0, breathing_signal(14.0));
        // 400 ms burst, 10× the breathing amplitude, broadband-ish tone.
        let mut saw_vocal = false;
        for i in 0..(1.5 * BLOCKS_PER_SEC) as usize {
            let t = 30.0 + i as f64 * 0.02;
            let tick = d.ingest(block_at(t, |t| {
                (0.5 * (2.0 * std::f64::consts::PI * 900.0 * t).sin()) as f32
            }));
            if let Some(tick) = tick {
                if tick.values["vocalization"] == FieldValue::Bool(true) {
                    saw_vocal = true;
                }
            }
        }
        assert!(saw_vocal, "burst should register as vocalization");
    }

    #[test]
    fn rhythmic_envelope_sustained_raises_seizure_alert() {
        let mut d = AudioDetector::new();
        // 3 Hz amplitude modulation — far above any breathing rate — held
        // well past the sustain requirement.
        let gen = |t: f64| {
            let envelope = (std::f64::consts::PI * 3.0 * t).sin().abs();
            let carrier = (2.0 * std::f64::consts::PI * 500.0 * t).sin();
            (0.08 * envelope * carrier) as f32
        };
        let ticks = feed(&mut d, 40.0, gen);
        let last = ticks.last().expect("tick");
        assert_eq!(
            last.values["seizure_pattern"],
            FieldValue::Bool(true),
            "sustained 3 Hz modulation should trip the detector"
        );
        assert_eq!(last.state, DetectorState::Alert);

        // And it must NOT trip on ordinary breathing.
        let mut d = AudioDetector::new();
        let ticks = feed(&mut d, 40.0, breathing_signal(14.0));
        assert!(ticks
            .iter()
            .all(|t| t.values["seizure_pattern"] != FieldValue::Bool(true)));
    }

    #[test]
    fn noise_floor_tracks_the_quiet_percentile() {
        let mut d = AudioDetector::new();
        feed(&mut d, 20.0, |t| {
            // Mostly quiet with occasional loud seconds.
            let loud = (t as u64) % 10 == 0;
            if loud {
                0.2 * ((2.0 * std::f64::consts::PI * 300.0 * t).sin() as f32)
            } else {
                0.001 * ((2.0 * std::f64::consts::PI * 300.0 * t).sin() as f32)
            }
        });
        let floor = d.noise_floor();
        assert!(floor < 0.01, "floor should follow the quiet majority, got {floor}");
    }
}
