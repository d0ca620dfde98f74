//! Capacitive / BCG detector: heart rate, HRV, bed occupancy, respiration.
//!
//! The ADC delivers 100 ms blocks at 100 Hz. Beats are detected on the
//! 0.5–25 Hz band with an adaptive threshold (75th percentile of the
//! envelope over the last 5 s) and a 0.4 s refractory floor (≤ 150 BPM).
//! Beat positions are tracked as absolute sample indices so one beat is
//! never counted twice across overlapping windows.

use std::collections::{BTreeMap, VecDeque};

use crate::detectors::{Detector, TickOutput};
use crate::drivers::AdcBlock;
use crate::dsp::{find_peaks, BandPass, SampleWindow};
use crate::dsp::stats::{median, percentile, rms, rmssd, std_dev};
use crate::events::{DetectorId, DetectorState, FieldValue};

const SAMPLE_RATE: f64 = 100.0;
const TICK_PERIOD_SECS: f64 = 1.0;

/// Beat-detection window.
const CARDIAC_WINDOW_SECS: f32 = 5.0;

/// Refractory floor: 0.4 s between beats (150 BPM ceiling).
const MIN_BEAT_SPACING: usize = 40;

/// Median over at least this many intervals before claiming a rate.
const MIN_INTERVALS: usize = 5;

/// RMSSD over up to this many recent intervals.
const HRV_INTERVALS: usize = 20;

/// Respiration window, downsampled to 10 Hz.
const RESP_WINDOW_SECS: f32 = 30.0;
const RESP_RATE_HZ: u32 = 10;

/// Occupancy decision: 5 s RMS against the learned threshold.
const OCCUPANCY_WINDOW_SECS: f32 = 5.0;
const DEFAULT_OCCUPANCY_THRESHOLD: f32 = 0.05;

pub struct CapacitiveDetector {
    cardiac_band: BandPass,
    resp_band: BandPass,

    /// Band-passed cardiac signal, 5 s.
    cardiac: SampleWindow,
    /// Raw signal for occupancy RMS, 5 s.
    raw: SampleWindow,
    /// Respiration band, decimated to 10 Hz, 30 s.
    resp: SampleWindow,

    /// Beat positions as absolute sample indices.
    beats: VecDeque<u64>,
    /// Total samples ingested (absolute index of the next sample).
    total_samples: u64,
    decim_phase: u8,

    occupancy_threshold: f32,
    last_tick: Option<f64>,
}

impl CapacitiveDetector {
    pub fn new() -> Self {
        Self::with_occupancy_threshold(DEFAULT_OCCUPANCY_THRESHOLD)
    }

    /// Threshold normally comes from calibration via the baseline cache.
    pub fn with_occupancy_threshold(threshold: f32) -> Self {
        Self {
            cardiac_band: BandPass::new(SAMPLE_RATE, 0.5, 25.0),
            resp_band: BandPass::new(SAMPLE_RATE, 0.1, 0.5),
            cardiac: SampleWindow::with_duration(CARDIAC_WINDOW_SECS, SAMPLE_RATE as u32),
            raw: SampleWindow::with_duration(OCCUPANCY_WINDOW_SECS, SAMPLE_RATE as u32),
            resp: SampleWindow::with_duration(RESP_WINDOW_SECS, RESP_RATE_HZ),
            beats: VecDeque::new(),
            total_samples: 0,
            decim_phase: 0,
            occupancy_threshold: threshold.max(1e-5),
            last_tick: None,
        }
    }

    /// Detect new beats in the current cardiac window and append them.
    fn update_beats(&mut self) {
        let window = self.cardiac.to_vec();
        if window.len() < MIN_BEAT_SPACING * 2 {
            return;
        }
        let envelope: Vec<f32> = window.iter().map(|s| s.abs()).collect();
        let threshold = percentile(&envelope, 75.0).max(1e-4);
        let peaks = find_peaks(&window, MIN_BEAT_SPACING, threshold);

        let window_start = self.total_samples - window.len() as u64;
        for idx in peaks {
            let abs = window_start + idx as u64;
            let fresh = match self.beats.back() {
                Some(&last) => abs > last + MIN_BEAT_SPACING as u64,
                None => true,
            };
            if fresh {
                self.beats.push_back(abs);
                if self.beats.len() > HRV_INTERVALS + 4 {
                    self.beats.pop_front();
                }
            }
        }
    }

    fn intervals_secs(&self) -> Vec<f32> {
        self.beats
            .iter()
            .zip(self.beats.iter().skip(1))
            .map(|(&a, &b)| (b - a) as f32 / SAMPLE_RATE as f32)
            .collect()
    }

    fn heart_rate(&self) -> Option<f64> {
        let intervals = self.intervals_secs();
        if intervals.len() < MIN_INTERVALS {
            return None;
        }
        let recent = &intervals[intervals.len().saturating_sub(MIN_INTERVALS * 2)..];
        let m = median(recent);
        if m <= 0.0 {
            return None;
        }
        Some((60.0 / m as f64).clamp(20.0, 150.0))
    }

    /// RMSSD over the last up-to-20 intervals, in milliseconds.
    fn hrv_ms(&self) -> Option<f64> {
        let intervals = self.intervals_secs();
        if intervals.len() < MIN_INTERVALS {
            return None;
        }
        let tail = &intervals[intervals.len().saturating_sub(HRV_INTERVALS)..];
        rmssd(tail).map(|v| (v * 1000.0) as f64)
    }

    fn respiration(&self) -> Option<f64> {
        if self.resp.duration_secs() < 15.0 {
            return None;
        }
        let window = self.resp.to_vec();
        let envelope: Vec<f32> = window.iter().map(|s| s.abs()).collect();
        let prominence = percentile(&envelope, 75.0).max(1e-5);
        let peaks = find_peaks(&window, (1.5 * RESP_RATE_HZ as f32) as usize, prominence);
        if peaks.len() < 3 {
            return None;
        }
        let intervals: Vec<f32> = peaks
            .windows(2)
            .map(|w| (w[1] - w[0]) as f32 / RESP_RATE_HZ as f32)
            .collect();
        let m = median(&intervals);
        if m <= 0.0 {
            return None;
        }
        Some((60.0 / m as f64).clamp(4.0, 40.0))
    }

    fn occupied(&self) -> bool {
        rms(&self.raw.to_vec()) > self.occupancy_threshold
    }

    /// Signal quality from movement and rate plausibility.
    fn signal_quality(&self, occupied: bool, heart_rate: Option<f64>) -> f64 {
        if !occupied {
            return 0.0;
        }
        let movement = std_dev(&self.raw.to_vec());
        if movement > 0.5 {
            // Gross movement swamps the BCG band.
            return 0.2;
        }
        match heart_rate {
            Some(hr) if (40.0..=150.0).contains(&hr) => {
                if movement > 0.2 {
                    0.6
                } else {
                    0.9
                }
            }
            Some(_) => 0.4,
            None => 0.3,
        }
    }
}

impl Default for CapacitiveDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for CapacitiveDetector {
    type Frame = AdcBlock;

    fn id(&self) -> DetectorId {
        DetectorId::Capacitive
    }

    fn ingest(&mut self, block: AdcBlock) -> Option<TickOutput> {
        let t = block.timestamp;

        for &s in &block.samples {
            self.raw.push(s);
            let cardiac = self.cardiac_band.process(s);
            self.cardiac.push(cardiac);
            let resp = self.resp_band.process(s);
            self.decim_phase = (self.decim_phase + 1) % 10;
            if self.decim_phase == 0 {
                self.resp.push(resp);
            }
            self.total_samples += 1;
        }
        self.update_beats();

        if let Some(last) = self.last_tick {
            if t - last < TICK_PERIOD_SECS {
                return None;
            }
        }
        self.last_tick = Some(t);

        let occupied = self.occupied();
        let heart_rate = if occupied { self.heart_rate() } else { None };
        let hrv = if occupied { self.hrv_ms() } else { None };
        let respiration = if occupied { self.respiration() } else { None };
        let quality = self.signal_quality(occupied, heart_rate);

        let mut values = BTreeMap::new();
        values.insert("bed_occupied".into(), occupied.into());
        values.insert("heart_rate".into(), heart_rate.into());
        values.insert("hrv_rmssd".into(), hrv.into());
        values.insert("respiration_rate".into(), respiration.into());
        values.insert("signal_quality".into(), quality.into());

        if !self.raw.is_full() {
            return Some(TickOutput::uncertain(t, values));
        }

        let (state, confidence) = match (occupied, heart_rate) {
            (false, _) => (DetectorState::Normal, 0.8),
            (true, None) => (DetectorState::Uncertain, 0.25),
            (true, Some(hr)) => {
                let state = if !(45.0..=120.0).contains(&hr) {
                    DetectorState::Warning
                } else {
                    DetectorState::Normal
                };
                (state, quality as f32)
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
        self.cardiac_band.reset();
        self.resp_band.reset();
        self.cardiac.clear();
        self.raw.clear();
        self.resp.clear();
        self.beats.clear();
        self.total_samples = 0;
        self.decim_phase = 0;
        self.last_tick = None;
    }
}
