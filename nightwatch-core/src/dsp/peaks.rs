//! Peak detection with prominence and minimum-distance constraints.

/// Find indices of local maxima whose prominence is at least
/// `min_prominence`, keeping peaks at least `min_distance` samples apart.
///
/// Prominence of a candidate is its height above the higher of the two
/// valley minima separating it from the nearest taller sample on each side
/// (or the window edge). When two peaks violate `min_distance`, the taller
/// one wins.
///
/// Returned indices are ascending.
pub fn find_peaks(samples: &[f32], min_distance: usize, min_prominence: f32) -> Vec<usize> {
    if samples.len() < 3 {
        return Vec::new();
    }

    // Local maxima. Plateaus count once, at their left edge.
    let mut candidates: Vec<usize> = Vec::new();
    let mut i = 1;
    while i < samples.len() - 1 {
        if samples[i] > samples[i - 1] {
            // Walk any plateau.
            let start = i;
            while i < samples.len() - 1 && samples[i + 1] == samples[i] {
                i += 1;
            }
            if i < samples.len() - 1 && samples[i + 1] < samples[i] {
                candidates.push(start);
            }
        }
        i += 1;
    }

    let mut peaks: Vec<usize> = candidates
        .into_iter()
        .filter(|&idx| prominence(samples, idx) >= min_prominence)
        .collect();

    // Enforce spacing, taller peaks first.
    peaks.sort_by(|&a, &b| {
        samples[b]
            .partial_cmp(&samples[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<usize> = Vec::new();
    for idx in peaks {
        if kept
            .iter()
            .all(|&k| idx.abs_diff(k) >= min_distance.max(1))
        {
            kept.push(idx);
        }
    }
    kept.sort_unstable();
    kept
}

fn prominence(samples: &[f32], idx: usize) -> f32 {
    let h = samples[idx];

    let mut left_min = h;
    for &s in samples[..idx].iter().rev() {
        if s > h {
            break;
        }
        left_min = left_min.min(s);
    }

    let mut right_min = h;
    for &s in &samples[idx + 1..] {
        if s > h {
            break;
        }
        right_min = right_min.min(s);
    }

    h - left_min.max(right_min)
}
