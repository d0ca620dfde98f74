//! Capture-rate → analysis-rate conversion using rubato.
//!
//! Microphones deliver whatever the OS negotiates (commonly 44.1/48 kHz);
//! the audio DSP runs at 16 kHz. Conversion happens on the detector task,
//! never in the RT capture callback. Same-rate construction is a
//! passthrough with no rubato session at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::drivers::DriverError;

/// Fixed-ratio mono f32 sample-rate converter.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carry-over: rubato consumes fixed-size chunks.
    carry: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated `[1][output_frames_max]` output.
    output: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self, DriverError> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                carry: Vec::new(),
                chunk_size,
                output: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / capture_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| DriverError::Fatal(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        Ok(Self {
            resampler: Some(resampler),
            carry: Vec::new(),
            chunk_size,
            output: vec![vec![0f32; max_out]],
        })
    }

    /// Convert `samples`, returning whatever full output is ready (possibly
    /// empty while the carry buffer fills).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.carry.extend_from_slice(samples);
        let mut result = Vec::new();
        while self.carry.len() >= self.chunk_size {
            let input = &self.carry[..self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.output, None) {
                Ok((_, produced)) => result.extend_from_slice(&self.output[0][..produced]),
                Err(e) => tracing::error!("resampler process error: {e}"),
            }
            self.carry.drain(..self.chunk_size);
        }
        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
