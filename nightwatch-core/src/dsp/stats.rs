//! Scalar statistics over sample slices.

/// Root-mean-square. Returns 0.0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

pub fn mean(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f32>() / samples.len() as f32
}

/// Population standard deviation.
pub fn std_dev(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let var = samples.iter().map(|s| (s - m) * (s - m)).sum::<f32>() / samples.len() as f32;
    var.sqrt()
}

/// Median by sorting a copy. NaNs sort last and are effectively ignored.
pub fn median(samples: &[f32]) -> f32 {
    percentile(samples, 50.0)
}

/// Percentile in [0, 100] with linear interpolation between ranks.
pub fn percentile(samples: &[f32], p: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f32;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Root mean square of successive differences, the standard short-term HRV
/// measure over inter-beat intervals (in whatever unit the intervals carry).
pub fn rmssd(intervals: &[f32]) -> Option<f32> {
    if intervals.len() < 2 {
        return None;
    }
    let sum_sq: f32 = intervals
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0];
            d * d
        })
        .sum();
    Some((sum_sq / (intervals.len() - 1) as f32).sqrt())
}
