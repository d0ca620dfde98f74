//! Deterministic synthetic drivers (`mock_sensors: true`).
//!
//! Every sample is a pure function of the injected clock, so two runs with
//! the same clock produce identical streams — no RNG, no hardware. Each
//! mock paces itself at its family's natural rate with a tokio sleep, which
//! collapses to zero under paused test time.

use std::f64::consts::PI;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::drivers::{
    AdcBlock, AudioBlock, DriverError, RadarFrame, RadarTarget, SensorDriver,
};
use crate::events::DetectorId;

const RADAR_PERIOD: Duration = Duration::from_millis(100);
const AUDIO_BLOCK: Duration = Duration::from_millis(20);
const ADC_BLOCK: Duration = Duration::from_millis(100);

/// Breathing chest-motion target at ~1.5 m.
pub struct MockRadarDriver {
    clock: SharedClock,
    connected: bool,
    /// Breaths per minute driving the simulated chest displacement.
    pub respiration_bpm: f64,
    /// Simulated heart rate adding a small ripple.
    pub heart_bpm: f64,
    /// When false the frame carries no targets.
    pub present: bool,
}

impl MockRadarDriver {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            connected: false,
            respiration_bpm: 14.0,
            heart_bpm: 62.0,
            present: true,
        }
    }
}

#[async_trait]
impl SensorDriver for MockRadarDriver {
    type Frame = RadarFrame;

    fn id(&self) -> DetectorId {
        DetectorId::Radar
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> Result<RadarFrame, DriverError> {
        if !self.connected {
            return Err(DriverError::Fatal("mock radar not connected".into()));
        }
        tokio::time::sleep(RADAR_PERIOD).await;
        let t = self.clock.now_monotonic();
        let targets = if self.present {
            let breath = 8.0 * (2.0 * PI * self.respiration_bpm / 60.0 * t).sin();
            let pulse = 0.4 * (2.0 * PI * self.heart_bpm / 60.0 * t).sin();
            vec![RadarTarget {
                x_mm: 150,
                y_mm: (1500.0 + breath + pulse) as i32,
                speed_cm_s: 0,
            }]
        } else {
            Vec::new()
        };
        Ok(RadarFrame {
            timestamp: t,
            targets,
        })
    }
}

/// Quiet room with band-limited breathing sounds.
pub struct MockAudioDriver {
    clock: SharedClock,
    connected: bool,
    pub breathing_bpm: f64,
    /// When true the stream is floor-level noise only.
    pub silent: bool,
    noise_state: u32,
}

impl MockAudioDriver {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            connected: false,
            breathing_bpm: 14.0,
            silent: false,
            noise_state: 0x6e77, // fixed seed — determinism over realism
        }
    }

    fn noise(&mut self) -> f32 {
        self.noise_state = self
            .noise_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        ((self.noise_state >> 16) as f32 / 32768.0 - 1.0) * 0.001
    }
}

#[async_trait]
impl SensorDriver for MockAudioDriver {
    type Frame = AudioBlock;

    fn id(&self) -> DetectorId {
        DetectorId::Audio
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> Result<AudioBlock, DriverError> {
        if !self.connected {
            return Err(DriverError::Fatal("mock audio not connected".into()));
        }
        tokio::time::sleep(AUDIO_BLOCK).await;
        let start = self.clock.now_monotonic();
        let rate = 16_000u32;
        let n = 320;
        let breath_hz = self.breathing_bpm / 60.0;
        let samples = (0..n)
            .map(|i| {
                let t = start + i as f64 / rate as f64;
                let noise = self.noise();
                if self.silent {
                    return noise;
                }
                // 400 Hz rush amplitude-modulated at the breath rate.
                let envelope = (PI * breath_hz * t).sin().abs();
                let carrier = (2.0 * PI * 400.0 * t).sin();
                (0.05 * envelope * carrier) as f32 + noise
            })
            .collect();
        Ok(AudioBlock {
            timestamp: start,
            samples,
            sample_rate: rate,
        })
    }
}

/// Occupied bed with a clean BCG pulse train and respiration sway.
pub struct MockAdcDriver {
    clock: SharedClock,
    connected: bool,
    pub heart_bpm: f64,
    pub respiration_bpm: f64,
    pub occupied: bool,
}

impl MockAdcDriver {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            connected: false,
            heart_bpm: 62.0,
            respiration_bpm: 14.0,
            occupied: true,
        }
    }
}

#[async_trait]
impl SensorDriver for MockAdcDriver {
    type Frame = AdcBlock;

    fn id(&self) -> DetectorId {
        DetectorId::Capacitive
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> Result<AdcBlock, DriverError> {
        if !self.connected {
            return Err(DriverError::Fatal("mock adc not connected".into()));
        }
        tokio::time::sleep(ADC_BLOCK).await;
        let start = self.clock.now_monotonic();
        let rate = 100u32;
        let samples = (0..10)
            .map(|i| {
                let t = start + i as f64 / rate as f64;
                if !self.occupied {
                    return 0.002 * (2.0 * PI * 50.0 * t).sin() as f32;
                }
                let beat_phase = (t * self.heart_bpm / 60.0).fract();
                // Sharp systolic spike with an exponential tail.
                let beat = if beat_phase < 0.15 {
                    0.6 * (-beat_phase * 30.0).exp()
                } else {
                    0.0
                };
                let resp = 0.15 * (2.0 * PI * self.respiration_bpm / 60.0 * t).sin();
                (beat + resp) as f32
            })
            .collect();
        Ok(AdcBlock {
            timestamp: start,
            samples,
            sample_rate: rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn mock_radar_breathes() {
        let clock = ManualClock::shared(0.0);
        let mut d = MockRadarDriver::new(clock.clone());
        d.connect().await.unwrap();

        let mut ys = Vec::new();
        for i in 0..50 {
            clock.advance(0.1);
            let frame = d.read().await.unwrap();
            assert_eq!(frame.targets.len(), 1, "frame {i}");
            ys.push(frame.targets[0].y_mm);
        }
        let min = *ys.iter().min().unwrap();
        let max = *ys.iter().max().unwrap();
        assert!(max - min >= 10, "chest motion should span ≥10 mm, got {}", max - min);
    }

    #[tokio::test(start_paused = true)]
    async fn vacant_radar_has_no_targets() {
        let mut d = MockRadarDriver::new(ManualClock::shared(0.0));
        d.present = false;
        d.connect().await.unwrap();
        assert!(d.read().await.unwrap().targets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_audio_stays_near_the_floor() {
        let clock = ManualClock::shared(0.0);
        let mut d = MockAudioDriver::new(clock);
        d.silent = true;
        d.connect().await.unwrap();
        let block = d.read().await.unwrap();
        let rms = crate::dsp::stats::rms(&block.samples);
        assert!(rms < 0.005, "silent rms = {rms}");
    }

    #[tokio::test(start_paused = true)]
    async fn adc_pulse_train_is_periodic() {
        let clock = ManualClock::shared(0.0);
        let mut d = MockAdcDriver::new(clock.clone());
        d.connect().await.unwrap();
        let mut all = Vec::new();
        for _ in 0..50 {
            clock.advance(0.1);
            all.extend(d.read().await.unwrap().samples);
        }
        // ~62 BPM over 5 s → ~5 spikes above the respiration sway.
        let spikes = all.windows(2).filter(|w| w[0] < 0.3 && w[1] >= 0.3).count();
        assert!((3..=8).contains(&spikes), "saw {spikes} beats");
    }
}
