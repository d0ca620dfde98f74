//! Fusion strategy arithmetic.
//!
//! Pure functions over the fresh contributors of one channel; the engine
//! handles freshness, triggering, and publication.

use serde::Deserialize;

use crate::dsp::stats::std_dev;
use crate::events::{DetectorId, FieldValue};

/// How a channel combines its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    WeightedAverage,
    BestConfidence,
    Voting,
    Any,
    All,
    /// Named closure documented per channel (`apnea_risk`).
    Computed,
}

/// One fresh source reading entering a fusion pass.
#[derive(Debug, Clone)]
pub struct Contributor {
    pub detector: DetectorId,
    pub value: FieldValue,
    pub confidence: f32,
    pub weight: f64,
    pub timestamp: f64,
}

/// Confidence adjustments shared by all channels.
#[derive(Debug, Clone, Copy)]
pub struct Adjustments {
    pub agreement_bonus: f32,
    pub disagreement_penalty: f32,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            agreement_bonus: 0.1,
            disagreement_penalty: 0.2,
        }
    }
}

/// Single-source readings carry an automatic confidence haircut.
const SINGLE_SOURCE_PENALTY: f32 = 0.1;

/// Outcome of one strategy pass.
#[derive(Debug, Clone)]
pub struct Fused {
    pub value: FieldValue,
    pub confidence: f32,
    pub agreement: f32,
    pub degraded: bool,
}

/// Agreement from value spread: `clamp(1 − std/max_dev, 0, 1)`.
fn numeric_agreement(values: &[f32], max_deviation: f64) -> f32 {
    if values.len() < 2 {
        return 1.0;
    }
    (1.0 - std_dev(values) / max_deviation.max(1e-9) as f32).clamp(0.0, 1.0)
}

fn apply_adjustments(
    base: f32,
    agreement: f32,
    agreement_threshold: f32,
    contributors: usize,
    adj: Adjustments,
) -> f32 {
    let mut confidence = base;
    if agreement >= agreement_threshold {
        confidence += adj.agreement_bonus;
    }
    if agreement < 0.5 {
        confidence -= adj.disagreement_penalty;
    }
    if contributors == 1 {
        confidence -= SINGLE_SOURCE_PENALTY;
    }
    confidence.clamp(0.0, 1.0)
}

/// `v = Σ(vᵢ·wᵢ·cᵢ) / Σ(wᵢ·cᵢ)` with agreement-driven adjustments.
///
/// Values spread beyond `disagreement_limit` degrade the channel and fall
/// back to the highest-weight source's value.
pub fn weighted_average(
    contributors: &[Contributor],
    max_deviation: f64,
    agreement_threshold: f32,
    disagreement_limit: Option<f64>,
    adj: Adjustments,
) -> Option<Fused> {
    let numeric: Vec<(&Contributor, f64)> = contributors
        .iter()
        .filter_map(|c| c.value.as_f64().map(|v| (c, v)))
        .collect();
    if numeric.is_empty() {
        return None;
    }

    let values: Vec<f32> = numeric.iter().map(|(_, v)| *v as f32).collect();
    let agreement = numeric_agreement(&values, max_deviation);

    let spread = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
        - values.iter().cloned().fold(f32::INFINITY, f32::min);
    let disagreeing = disagreement_limit
        .map(|limit| spread as f64 > limit)
        .unwrap_or(false);

    let value = if disagreeing {
        // Trust the heaviest source outright.
        numeric
            .iter()
            .max_by(|(a, _), (b, _)| {
                a.weight
                    .partial_cmp(&b.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, v)| *v)?
    } else {
        let denom: f64 = numeric.iter().map(|(c, _)| c.weight * c.confidence as f64).sum();
        if denom <= 0.0 {
            return None;
        }
        numeric
            .iter()
            .map(|(c, v)| v * c.weight * c.confidence as f64)
            .sum::<f64>()
            / denom
    };

    let weight_sum: f64 = numeric.iter().map(|(c, _)| c.weight).sum();
    let base = numeric
        .iter()
        .map(|(c, _)| c.confidence as f64 * c.weight)
        .sum::<f64>()
        / weight_sum.max(1e-9);
    let confidence = apply_adjustments(
        base as f32,
        agreement,
        agreement_threshold,
        numeric.len(),
        adj,
    );

    Some(Fused {
        value: FieldValue::Number(value),
        confidence,
        agreement,
        degraded: disagreeing,
    })
}

/// Pass through the single most confident numeric source.
pub fn best_confidence(contributors: &[Contributor], max_deviation: f64) -> Option<Fused> {
    let numeric: Vec<&Contributor> = contributors
        .iter()
        .filter(|c| c.value.as_f64().is_some())
        .collect();
    let best = numeric.iter().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    })?;
    let values: Vec<f32> = numeric
        .iter()
        .filter_map(|c| c.value.as_f64().map(|v| v as f32))
        .collect();
    Some(Fused {
        value: best.value,
        confidence: best.confidence.clamp(0.0, 1.0),
        agreement: numeric_agreement(&values, max_deviation),
        degraded: false,
    })
}

/// Boolean majority; confidence = |true − false| / total.
pub fn voting(contributors: &[Contributor]) -> Option<Fused> {
    let votes: Vec<bool> = contributors
        .iter()
        .filter_map(|c| c.value.as_bool())
        .collect();
    if votes.is_empty() {
        return None;
    }
    let yes = votes.iter().filter(|&&v| v).count();
    let no = votes.len() - yes;
    let value = yes > no;
    let confidence = (yes as f32 - no as f32).abs() / votes.len() as f32;
    let agreement = yes.max(no) as f32 / votes.len() as f32;
    Some(Fused {
        value: FieldValue::Bool(value),
        confidence,
        agreement,
        degraded: false,
    })
}

/// Boolean OR; confidence = max confidence among true voters, else 0.
pub fn any(contributors: &[Contributor]) -> Option<Fused> {
    let voters: Vec<(&Contributor, bool)> = contributors
        .iter()
        .filter_map(|c| c.value.as_bool().map(|b| (c, b)))
        .collect();
    if voters.is_empty() {
        return None;
    }
    let result = voters.iter().any(|(_, b)| *b);
    let confidence = if result {
        voters
            .iter()
            .filter(|(_, b)| *b)
            .map(|(c, _)| c.confidence)
            .fold(0.0, f32::max)
    } else {
        0.0
    };
    let agreeing = voters.iter().filter(|(_, b)| *b == result).count();
    Some(Fused {
        value: FieldValue::Bool(result),
        confidence,
        agreement: agreeing as f32 / voters.len() as f32,
        degraded: false,
    })
}

/// Boolean AND; confidence = min over contributors when all true, else 0.
pub fn all(contributors: &[Contributor]) -> Option<Fused> {
    let voters: Vec<(&Contributor, bool)> = contributors
        .iter()
        .filter_map(|c| c.value.as_bool().map(|b| (c, b)))
        .collect();
    if voters.is_empty() {
        return None;
    }
    let result = voters.iter().all(|(_, b)| *b);
    let confidence = if result {
        voters
            .iter()
            .map(|(c, _)| c.confidence)
            .fold(1.0, f32::min)
    } else {
        0.0
    };
    let agreeing = voters.iter().filter(|(_, b)| *b == result).count();
    Some(Fused {
        value: FieldValue::Bool(result),
        confidence,
        agreement: agreeing as f32 / voters.len() as f32,
        degraded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn contributor(detector: DetectorId, value: FieldValue, confidence: f32, weight: f64) -> Contributor {
        Contributor {
            detector,
            value,
            confidence,
            weight,
            timestamp: 0.0,
        }
    }

    #[test]
    fn weighted_average_blends_toward_the_heavier_confident_source() {
        // Radar 14.0 (c=0.9, w=1.0) + audio 13.5 (c=0.7, w=0.8)
        // → 13.8 BPM ± 0.1, agreement ≥ 0.9, confidence ≥ base + bonus.
        let contributors = vec![
            contributor(DetectorId::Radar, FieldValue::Number(14.0), 0.9, 1.0),
            contributor(DetectorId::Audio, FieldValue::Number(13.5), 0.7, 0.8),
        ];
        let fused = weighted_average(&contributors, 5.0, 0.8, Some(10.0), Adjustments::default())
            .expect("fused");
        let value = fused.value.as_f64().unwrap();
        assert!((value - 13.8).abs() < 0.1, "got {value}");
        assert!(fused.agreement >= 0.9);
        let base = (0.9 * 1.0 + 0.7 * 0.8) / 1.8;
        assert!(fused.confidence >= base as f32 + 0.09);
        assert!(fused.confidence <= 1.0);
        assert!(!fused.degraded);
    }

    #[test]
    fn disagreement_degrades_and_keeps_the_heavier_source() {
        // 14 vs 28 BPM at equal confidence: beyond the limit, radar wins.
        let contributors = vec![
            contributor(DetectorId::Radar, FieldValue::Number(14.0), 0.8, 1.0),
            contributor(DetectorId::Audio, FieldValue::Number(28.0), 0.8, 0.8),
        ];
        let fused = weighted_average(&contributors, 5.0, 0.8, Some(10.0), Adjustments::default())
            .expect("fused");
        assert_eq!(fused.value, FieldValue::Number(14.0));
        assert!(fused.degraded);
        // Base 0.8 − disagreement penalty (agreement clamps to 0).
        assert_relative_eq!(fused.confidence, 0.6, epsilon = 1e-5);
    }

    #[test]
    fn single_source_pays_the_haircut() {
        let contributors = vec![contributor(
            DetectorId::Radar,
            FieldValue::Number(14.0),
            0.9,
            1.0,
        )];
        let fused = weighted_average(&contributors, 5.0, 0.8, None, Adjustments::default())
            .expect("fused");
        // 0.9 + 0.1 (agreement 1.0 ≥ threshold) − 0.1 (single source) = 0.9.
        assert_relative_eq!(fused.confidence, 0.9, epsilon = 1e-5);
    }

    #[test]
    fn confidence_always_lands_in_unit_interval() {
        for (c1, c2, v2) in [
            (1.0f32, 1.0f32, 14.0),
            (0.05, 0.05, 60.0),
            (1.0, 0.0, 14.1),
            (0.0, 0.0, 14.0),
        ] {
            let contributors = vec![
                contributor(DetectorId::Radar, FieldValue::Number(14.0), c1, 1.0),
                contributor(DetectorId::Audio, FieldValue::Number(v2), c2, 1.0),
            ];
            if let Some(fused) =
                weighted_average(&contributors, 5.0, 0.8, Some(10.0), Adjustments::default())
            {
                assert!((0.0..=1.0).contains(&fused.confidence));
                assert!((0.0..=1.0).contains(&fused.agreement));
            }
        }
    }

    #[test]
    fn best_confidence_picks_the_argmax() {
        let contributors = vec![
            contributor(DetectorId::Capacitive, FieldValue::Number(61.0), 0.85, 1.0),
            contributor(DetectorId::Radar, FieldValue::Number(72.0), 0.3, 1.0),
        ];
        let fused = best_confidence(&contributors, 10.0).expect("fused");
        assert_eq!(fused.value, FieldValue::Number(61.0));
        assert_relative_eq!(fused.confidence, 0.85);
    }

    #[test]
    fn voting_majority_and_margin_confidence() {
        let contributors = vec![
            contributor(DetectorId::Radar, FieldValue::Bool(true), 0.9, 1.0),
            contributor(DetectorId::Audio, FieldValue::Bool(true), 0.6, 1.0),
            contributor(DetectorId::Capacitive, FieldValue::Bool(false), 0.8, 1.0),
        ];
        let fused = voting(&contributors).expect("fused");
        assert_eq!(fused.value, FieldValue::Bool(true));
        assert_relative_eq!(fused.confidence, 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn any_takes_max_true_confidence() {
        let contributors = vec![
            contributor(DetectorId::Radar, FieldValue::Bool(false), 0.9, 1.0),
            contributor(DetectorId::Audio, FieldValue::Bool(true), 0.6, 1.0),
        ];
        let fused = any(&contributors).expect("fused");
        assert_eq!(fused.value, FieldValue::Bool(true));
        assert_relative_eq!(fused.confidence, 0.6);

        let all_false = vec![contributor(DetectorId::Radar, FieldValue::Bool(false), 0.9, 1.0)];
        let fused = any(&all_false).expect("fused");
        assert_eq!(fused.value, FieldValue::Bool(false));
        assert_relative_eq!(fused.confidence, 0.0);
    }

    #[test]
    fn all_takes_min_confidence_when_unanimous() {
        let contributors = vec![
            contributor(DetectorId::Radar, FieldValue::Bool(true), 0.9, 1.0),
            contributor(DetectorId::Capacitive, FieldValue::Bool(true), 0.7, 1.0),
        ];
        let fused = all(&contributors).expect("fused");
        assert_eq!(fused.value, FieldValue::Bool(true));
        assert_relative_eq!(fused.confidence, 0.7);
    }

    #[test]
    fn non_numeric_values_are_skipped_by_numeric_strategies() {
        let contributors = vec![
            contributor(DetectorId::Radar, FieldValue::Null, 0.9, 1.0),
            contributor(DetectorId::Audio, FieldValue::Bool(true), 0.9, 1.0),
        ];
        assert!(weighted_average(&contributors, 5.0, 0.8, None, Adjustments::default()).is_none());
        assert!(best_confidence(&contributors, 5.0).is_none());
    }
}
