//! Short-time spectral analysis over a window snapshot.
//!
//! One [`Spectrum`] is computed per detector tick at most, over windows of
//! a few hundred samples, so planning the FFT on each call is fine.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// The dominant bin inside a requested band.
#[derive(Debug, Clone, Copy)]
pub struct SpectralPeak {
    pub freq_hz: f32,
    pub magnitude: f32,
    /// Peak magnitude over the strongest non-adjacent bin in the same band.
    pub sidelobe_ratio: f32,
    /// Peak magnitude over the mean magnitude of the whole spectrum
    /// (DC excluded).
    pub prominence_ratio: f32,
}

/// Magnitude spectrum of a Hann-windowed real signal.
#[derive(Debug, Clone)]
pub struct Spectrum {
    mags: Vec<f32>,
    bin_hz: f32,
}

impl Spectrum {
    /// Compute the magnitude spectrum of `samples` at `sample_rate`.
    ///
    /// Returns `None` for windows too short to say anything (< 8 samples).
    pub fn compute(samples: &[f32], sample_rate: f32) -> Option<Self> {
        let n = samples.len();
        if n < 8 {
            return None;
        }

        let mut buffer: Vec<Complex<f32>> = samples
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let w = 0.5
                    - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos();
                Complex::new(s * w, 0.0)
            })
            .collect();

        let mut planner = FftPlanner::<f32>::new();
        planner.plan_fft_forward(n).process(&mut buffer);

        let mags: Vec<f32> = buffer[..n / 2].iter().map(|c| c.norm()).collect();
        Some(Self {
            mags,
            bin_hz: sample_rate / n as f32,
        })
    }

    pub fn bin_hz(&self) -> f32 {
        self.bin_hz
    }

    fn band_bins(&self, low_hz: f32, high_hz: f32) -> std::ops::Range<usize> {
        let lo = ((low_hz / self.bin_hz).ceil() as usize).max(1);
        let hi = ((high_hz / self.bin_hz).floor() as usize + 1).min(self.mags.len());
        lo..hi.max(lo)
    }

    /// Sum of squared magnitudes inside `[low_hz, high_hz]`.
    pub fn band_energy(&self, low_hz: f32, high_hz: f32) -> f32 {
        self.band_bins(low_hz, high_hz)
            .map(|i| self.mags[i] * self.mags[i])
            .sum()
    }

    /// The strongest bin inside `[low_hz, high_hz]`, with ratio bookkeeping.
    pub fn peak_in_band(&self, low_hz: f32, high_hz: f32) -> Option<SpectralPeak> {
        let bins = self.band_bins(low_hz, high_hz);
        if bins.is_empty() {
            return None;
        }
        let peak_bin = bins
            .clone()
            .max_by(|&a, &b| {
                self.mags[a]
                    .partial_cmp(&self.mags[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
        let magnitude = self.mags[peak_bin];
        if magnitude <= 0.0 {
            return None;
        }

        let sidelobe = bins
            .clone()
            .filter(|&i| i.abs_diff(peak_bin) > 1)
            .map(|i| self.mags[i])
            .fold(0.0f32, f32::max);
        let sidelobe_ratio = if sidelobe > 0.0 {
            magnitude / sidelobe
        } else {
            f32::INFINITY
        };

        let rest: f32 = self.mags[1..].iter().sum::<f32>() / (self.mags.len() - 1).max(1) as f32;
        let prominence_ratio = if rest > 0.0 {
            magnitude / rest
        } else {
            f32::INFINITY
        };

        Some(SpectralPeak {
            freq_hz: peak_bin as f32 * self.bin_hz,
            magnitude,
            sidelobe_ratio,
            prominence_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, seconds: f32) -> Vec<f32> {
        let n = (sample_rate * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn locates_a_cardiac_band_tone() {
        // 1.2 Hz "heartbeat" in radar positions sampled at 10 Hz for 15 s.
        let samples = sine(1.2, 10.0, 15.0);
        let spectrum = Spectrum::compute(&samples, 10.0).expect("spectrum");
        let peak = spectrum.peak_in_band(0.8, 2.0).expect("peak");
        assert!(
            (peak.freq_hz - 1.2).abs() <= 2.0 * spectrum.bin_hz(),
            "peak at {} Hz",
            peak.freq_hz
        );
        assert!(peak.sidelobe_ratio > 3.0);
        assert!(peak.prominence_ratio > 3.0);
    }

    #[test]
    fn band_energy_concentrates_at_the_tone() {
        let samples = sine(5.0, 100.0, 4.0);
        let spectrum = Spectrum::compute(&samples, 100.0).expect("spectrum");
        let in_band = spectrum.band_energy(4.0, 6.0);
        let out_band = spectrum.band_energy(20.0, 40.0);
        assert!(in_band > 50.0 * out_band.max(f32::EPSILON));
    }

    #[test]
    fn noise_has_no_dominant_peak_ratio() {
        // Deterministic pseudo-noise: linear congruential values.
        let mut x: u32 = 12345;
        let samples: Vec<f32> = (0..512)
            .map(|_| {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                (x >> 16) as f32 / 32768.0 - 1.0
            })
            .collect();
        let spectrum = Spectrum::compute(&samples, 100.0).expect("spectrum");
        if let Some(peak) = spectrum.peak_in_band(1.0, 40.0) {
            assert!(peak.sidelobe_ratio < 4.0, "noise should have no clear peak");
        }
    }

    #[test]
    fn too_short_window_is_rejected() {
        assert!(Spectrum::compute(&[0.0; 4], 100.0).is_none());
    }
}
