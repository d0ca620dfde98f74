//! Sensor fusion: latest-value table → named channels.
//!
//! The engine keeps `latest[(detector, field)] → SignalValue`, refreshed by
//! every incoming event. Each update recomputes exactly the channels that
//! reference an updated source; a periodic sweep handles staleness (a
//! channel with no fresh recompute is re-published `degraded` once its last
//! value ages past `signal_max_age`, and evicted at twice that age).
//!
//! Single-writer: one task owns the engine; readers get cloned snapshots.
//!
//! Per-field confidence: an event's scalar confidence applies to all its
//! fields, except where the detector publishes a `<field>_confidence`
//! companion (the radar's positional heart-rate estimate does this).

pub mod strategy;

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use tracing::debug;

use crate::clock::SharedClock;
use crate::events::{DetectorId, Event, FieldValue, FusedSignal, SignalValue};
use strategy::{Adjustments, Contributor, Strategy};

/// Default freshness horizon for fusion inputs.
pub const DEFAULT_SIGNAL_MAX_AGE: f64 = 5.0;

const CONFIDENCE_SUFFIX: &str = "_confidence";

/// One source feeding a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub detector: DetectorId,
    pub field: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Channel definition (`fusion.rules[]` in the config).
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSpec {
    /// Channel name, e.g. `respiration`.
    pub signal: String,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    pub strategy: Strategy,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f32,
    /// Spread beyond which the channel degrades (weighted_average only).
    #[serde(default)]
    pub disagreement_limit: Option<f64>,
    /// Deviation that zeroes agreement, e.g. 5 BPM for respiration.
    #[serde(default = "default_max_deviation")]
    pub max_deviation: f64,
}

fn default_min_sources() -> usize {
    1
}

fn default_agreement_threshold() -> f32 {
    0.8
}

fn default_max_deviation() -> f64 {
    5.0
}

/// Global fusion tuning (`fusion.*` in the config).
#[derive(Debug, Clone)]
pub struct FusionSettings {
    pub signal_max_age: f64,
    pub cross_validation_enabled: bool,
    pub adjustments: Adjustments,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            signal_max_age: DEFAULT_SIGNAL_MAX_AGE,
            cross_validation_enabled: true,
            adjustments: Adjustments::default(),
        }
    }
}

pub struct FusionEngine {
    clock: SharedClock,
    settings: FusionSettings,
    channels: Vec<ChannelSpec>,
    latest: HashMap<(DetectorId, String), SignalValue>,
    /// Last published value per channel, for staleness handling.
    published: HashMap<String, FusedSignal>,
    /// Channels already re-published as degraded (evict next).
    marked_degraded: BTreeSet<String>,
}

impl FusionEngine {
    pub fn new(clock: SharedClock, settings: FusionSettings, channels: Vec<ChannelSpec>) -> Self {
        Self {
            clock,
            settings,
            channels,
            latest: HashMap::new(),
            published: HashMap::new(),
            marked_degraded: BTreeSet::new(),
        }
    }

    /// Fold one event into the table and recompute affected channels.
    ///
    /// Returns the channel updates to publish, in config order.
    pub fn ingest_event(&mut self, event: &Event) -> Vec<FusedSignal> {
        let mut touched: BTreeSet<&str> = BTreeSet::new();
        for (field, &value) in &event.values {
            if field.ends_with(CONFIDENCE_SUFFIX) {
                continue;
            }
            // A Null reading is "no claim": the previous value stands until
            // it ages out.
            if value.is_null() {
                continue;
            }
            let confidence = event
                .values
                .get(&format!("{field}{CONFIDENCE_SUFFIX}"))
                .and_then(|v| v.as_f64())
                .map(|c| c as f32)
                .unwrap_or(event.confidence)
                .clamp(0.0, 1.0);
            self.latest.insert(
                (event.detector, field.clone()),
                SignalValue {
                    value,
                    confidence,
                    timestamp: event.timestamp,
                    detector: event.detector,
                    field: field.clone(),
                },
            );
            touched.insert(field.as_str());
        }

        let mut updates = Vec::new();
        for i in 0..self.channels.len() {
            let relevant = {
                let spec = &self.channels[i];
                match spec.strategy {
                    // Computed channels read across detectors and channels;
                    // recompute them on every event.
                    Strategy::Computed => true,
                    _ => spec.sources.iter().any(|s| {
                        s.detector == event.detector && touched.contains(s.field.as_str())
                    }),
                }
            };
            if !relevant {
                continue;
            }
            let spec = self.channels[i].clone();
            if let Some(fused) = self.compute_channel(&spec) {
                self.marked_degraded.remove(&fused.name);
                self.published.insert(fused.name.clone(), fused.clone());
                updates.push(fused);
            }
        }
        updates
    }

    /// Periodic staleness pass.
    ///
    /// Channels whose last update aged past `signal_max_age` are re-published
    /// once with `degraded = true`; past twice the age they are evicted.
    pub fn sweep(&mut self) -> Vec<FusedSignal> {
        let now = self.clock.now_monotonic();
        let max_age = self.settings.signal_max_age;

        self.latest
            .retain(|_, signal| now - signal.timestamp <= max_age);

        let mut updates = Vec::new();
        let mut evict = Vec::new();
        for (name, signal) in &self.published {
            let age = now - signal.timestamp;
            if age > 2.0 * max_age {
                evict.push(name.clone());
            } else if age > max_age && !self.marked_degraded.contains(name) {
                let mut degraded = signal.clone();
                degraded.degraded = true;
                self.marked_degraded.insert(name.clone());
                updates.push(degraded);
            }
        }
        for name in evict {
            debug!(channel = %name, "evicting stale channel");
            self.published.remove(&name);
            self.marked_degraded.remove(&name);
        }
        for update in &updates {
            self.published.insert(update.name.clone(), update.clone());
        }
        updates
    }

    /// Cloned channel table (alert engine, status reporting).
    pub fn snapshot(&self) -> Vec<FusedSignal> {
        self.published.values().cloned().collect()
    }

    pub fn channel(&self, name: &str) -> Option<&FusedSignal> {
        self.published.get(name)
    }

    fn fresh(&self, detector: DetectorId, field: &str) -> Option<&SignalValue> {
        let signal = self.latest.get(&(detector, field.to_string()))?;
        let age = self.clock.now_monotonic() - signal.timestamp;
        (age <= self.settings.signal_max_age).then_some(signal)
    }

    fn contributors(&self, spec: &ChannelSpec) -> Vec<Contributor> {
        spec.sources
            .iter()
            .filter_map(|s| {
                self.fresh(s.detector, &s.field).map(|signal| Contributor {
                    detector: s.detector,
                    value: signal.value,
                    confidence: signal.confidence,
                    weight: s.weight,
                    timestamp: signal.timestamp,
                })
            })
            .collect()
    }

    fn compute_channel(&self, spec: &ChannelSpec) -> Option<FusedSignal> {
        if spec.strategy == Strategy::Computed {
            return self.compute_named(spec);
        }

        let contributors = self.contributors(spec);
        if contributors.len() < spec.min_sources.max(1) {
            return None;
        }

        // Cross-validation off → no agreement bonuses or penalties, the
        // weighted blend alone.
        let adjustments = if self.settings.cross_validation_enabled {
            self.settings.adjustments
        } else {
            Adjustments {
                agreement_bonus: 0.0,
                disagreement_penalty: 0.0,
            }
        };

        let fused = match spec.strategy {
            Strategy::WeightedAverage => strategy::weighted_average(
                &contributors,
                spec.max_deviation,
                spec.agreement_threshold,
                spec.disagreement_limit,
                adjustments,
            ),
            Strategy::BestConfidence => strategy::best_confidence(&contributors, spec.max_deviation),
            Strategy::Voting => strategy::voting(&contributors),
            Strategy::Any => strategy::any(&contributors),
            Strategy::All => strategy::all(&contributors),
            Strategy::Computed => unreachable!(),
        }?;

        let sources: BTreeSet<DetectorId> = contributors.iter().map(|c| c.detector).collect();
        let timestamp = contributors
            .iter()
            .map(|c| c.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);
        // Short of the configured ideal set → degraded, on top of any
        // strategy-level disagreement.
        let degraded = fused.degraded || contributors.len() < spec.sources.len();

        Some(FusedSignal {
            name: spec.signal.clone(),
            value: fused.value,
            confidence: fused.confidence,
            timestamp,
            sources,
            agreement: fused.agreement,
            degraded,
        })
    }

    /// Named computed channels. Only `apnea_risk` is defined today.
    fn compute_named(&self, spec: &ChannelSpec) -> Option<FusedSignal> {
        match spec.signal.as_str() {
            "apnea_risk" => self.apnea_risk(spec),
            other => {
                debug!(channel = %other, "unknown computed channel");
                None
            }
        }
    }

    /// Apnea risk from sustained silence while the bed is occupied.
    ///
    /// Base 0.5 once silence reaches 10 s with the bed occupied, then
    /// +0.05 per further second of silence and +0.1 per BPM the fused
    /// respiration channel sits below 6, clamped to [0, 1].
    fn apnea_risk(&self, spec: &ChannelSpec) -> Option<FusedSignal> {
        let silence = self.fresh(DetectorId::Audio, "silence_duration")?;
        let occupied = self.fresh(DetectorId::Capacitive, "bed_occupied")?;

        let silence_secs = silence.value.as_f64()?;
        let is_occupied = occupied.value.as_bool()?;

        let mut sources: BTreeSet<DetectorId> =
            [DetectorId::Audio, DetectorId::Capacitive].into();
        let mut risk = 0.0f64;
        if is_occupied && silence_secs >= 10.0 {
            risk = 0.5 + (silence_secs - 10.0) * 0.05;
            if let Some(resp) = self.published.get("respiration") {
                if let Some(rate) = resp.value.as_f64() {
                    risk += (6.0 - rate).max(0.0) * 0.1;
                    sources.extend(resp.sources.iter().copied());
                }
            }
        }
        let risk = risk.clamp(0.0, 1.0);

        let confidence = silence.confidence.min(occupied.confidence);
        Some(FusedSignal {
            name: spec.signal.clone(),
            value: FieldValue::Number(risk),
            confidence,
            timestamp: silence.timestamp.max(occupied.timestamp),
            sources,
            agreement: 1.0,
            degraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::DetectorState;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn event(
        detector: DetectorId,
        timestamp: f64,
        confidence: f32,
        values: &[(&str, FieldValue)],
    ) -> Event {
        Event {
            detector,
            timestamp,
            sequence: 0,
            session_id: 0,
            state: DetectorState::Normal,
            confidence,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn respiration_spec() -> ChannelSpec {
        ChannelSpec {
            signal: "respiration".into(),
            sources: vec![
                SourceSpec {
                    detector: DetectorId::Radar,
                    field: "respiration_rate".into(),
                    weight: 1.0,
                },
                SourceSpec {
                    detector: DetectorId::Audio,
                    field: "breathing_rate".into(),
                    weight: 0.8,
                },
            ],
            strategy: Strategy::WeightedAverage,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: Some(10.0),
            max_deviation: 5.0,
        }
    }

    fn engine(clock: Arc<ManualClock>, channels: Vec<ChannelSpec>) -> FusionEngine {
        FusionEngine::new(clock, FusionSettings::default(), channels)
    }

    #[test]
    fn fuses_two_respiration_sources() {
        let clock = ManualClock::shared(100.0);
        let mut engine = engine(Arc::clone(&clock), vec![respiration_spec()]);

        let updates = engine.ingest_event(&event(
            DetectorId::Radar,
            100.0,
            0.9,
            &[("respiration_rate", FieldValue::Number(14.0))],
        ));
        assert_eq!(updates.len(), 1);
        // Only one of two configured sources yet → degraded.
        assert!(updates[0].degraded);

        let updates = engine.ingest_event(&event(
            DetectorId::Audio,
            100.2,
            0.7,
            &[("breathing_rate", FieldValue::Number(13.5))],
        ));
        let channel = &updates[0];
        let value = channel.value.as_f64().unwrap();
        assert!((value - 13.8).abs() < 0.1, "got {value}");
        assert!(channel.agreement >= 0.9);
        assert!(!channel.degraded);
        assert_eq!(channel.sources.len(), 2);
        assert_eq!(channel.timestamp, 100.2);
    }

    #[test]
    fn unrelated_fields_do_not_recompute_the_channel() {
        let clock = ManualClock::shared(0.0);
        let mut engine = engine(clock, vec![respiration_spec()]);
        let updates = engine.ingest_event(&event(
            DetectorId::Radar,
            0.0,
            0.9,
            &[("movement_intensity", FieldValue::Number(0.1))],
        ));
        assert!(updates.is_empty());
    }

    #[test]
    fn stale_source_is_excluded_from_fusion() {
        let clock = ManualClock::shared(0.0);
        let mut engine = engine(Arc::clone(&clock), vec![respiration_spec()]);

        engine.ingest_event(&event(
            DetectorId::Audio,
            0.0,
            0.7,
            &[("breathing_rate", FieldValue::Number(20.0))],
        ));
        // 8 s later the audio reading is past signal_max_age.
        clock.advance(8.0);
        let updates = engine.ingest_event(&event(
            DetectorId::Radar,
            8.0,
            0.9,
            &[("respiration_rate", FieldValue::Number(14.0))],
        ));
        let channel = &updates[0];
        assert_eq!(channel.value, FieldValue::Number(14.0));
        assert_eq!(channel.sources.len(), 1);
        assert!(channel.degraded);
    }

    #[test]
    fn null_reading_keeps_the_previous_value() {
        let clock = ManualClock::shared(0.0);
        let mut engine = engine(Arc::clone(&clock), vec![respiration_spec()]);
        engine.ingest_event(&event(
            DetectorId::Radar,
            0.0,
            0.9,
            &[("respiration_rate", FieldValue::Number(14.0))],
        ));
        clock.advance(1.0);
        let updates = engine.ingest_event(&event(
            DetectorId::Radar,
            1.0,
            0.2,
            &[("respiration_rate", FieldValue::Null)],
        ));
        // Null did not touch the source, so nothing recomputed.
        assert!(updates.is_empty());
        assert_eq!(
            engine.channel("respiration").unwrap().value,
            FieldValue::Number(14.0)
        );
    }

    #[test]
    fn per_field_confidence_override_applies() {
        let clock = ManualClock::shared(0.0);
        let spec = ChannelSpec {
            signal: "heart_rate".into(),
            sources: vec![SourceSpec {
                detector: DetectorId::Radar,
                field: "heart_rate".into(),
                weight: 1.0,
            }],
            strategy: Strategy::BestConfidence,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 10.0,
        };
        let mut engine = engine(clock, vec![spec]);
        let updates = engine.ingest_event(&event(
            DetectorId::Radar,
            0.0,
            0.9,
            &[
                ("heart_rate", FieldValue::Number(64.0)),
                ("heart_rate_confidence", FieldValue::Number(0.4)),
            ],
        ));
        assert_eq!(updates[0].confidence, 0.4);
    }

    #[test]
    fn min_sources_gates_publication() {
        let clock = ManualClock::shared(0.0);
        let mut spec = respiration_spec();
        spec.min_sources = 2;
        let mut engine = engine(clock, vec![spec]);
        let updates = engine.ingest_event(&event(
            DetectorId::Radar,
            0.0,
            0.9,
            &[("respiration_rate", FieldValue::Number(14.0))],
        ));
        assert!(updates.is_empty());
    }

    #[test]
    fn sweep_marks_degraded_then_evicts() {
        let clock = ManualClock::shared(0.0);
        let mut engine = engine(Arc::clone(&clock), vec![respiration_spec()]);
        engine.ingest_event(&event(
            DetectorId::Radar,
            0.0,
            0.9,
            &[("respiration_rate", FieldValue::Number(14.0))],
        ));

        clock.advance(6.0);
        let updates = engine.sweep();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].degraded);
        // A second sweep at the same age republishes nothing.
        assert!(engine.sweep().is_empty());

        clock.advance(5.0);
        engine.sweep();
        assert!(engine.channel("respiration").is_none());
    }

    #[test]
    fn apnea_risk_matches_the_documented_curve() {
        let clock = ManualClock::shared(50.0);
        let computed = ChannelSpec {
            signal: "apnea_risk".into(),
            sources: Vec::new(),
            strategy: Strategy::Computed,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 5.0,
        };
        let mut engine = engine(Arc::clone(&clock), vec![respiration_spec(), computed]);

        // Respiration channel at 5 BPM, bed occupied, 15 s of silence.
        engine.ingest_event(&event(
            DetectorId::Radar,
            50.0,
            0.9,
            &[("respiration_rate", FieldValue::Number(5.0))],
        ));
        engine.ingest_event(&event(
            DetectorId::Capacitive,
            50.0,
            0.9,
            &[("bed_occupied", FieldValue::Bool(true))],
        ));
        let updates = engine.ingest_event(&event(
            DetectorId::Audio,
            50.1,
            0.8,
            &[("silence_duration", FieldValue::Number(15.0))],
        ));

        let risk = updates
            .iter()
            .find(|u| u.name == "apnea_risk")
            .expect("apnea_risk update");
        let value = risk.value.as_f64().unwrap();
        // 0.5 + 5·0.05 + 1·0.1 = 0.85
        assert!((value - 0.85).abs() < 1e-6, "got {value}");
        assert!(risk.sources.contains(&DetectorId::Audio));
        assert!(risk.sources.contains(&DetectorId::Capacitive));
        assert!(risk.sources.contains(&DetectorId::Radar));
    }

    #[test]
    fn apnea_risk_is_zero_when_bed_is_empty() {
        let clock = ManualClock::shared(0.0);
        let computed = ChannelSpec {
            signal: "apnea_risk".into(),
            sources: Vec::new(),
            strategy: Strategy::Computed,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 5.0,
        };
        let mut engine = engine(clock, vec![computed]);
        engine.ingest_event(&event(
            DetectorId::Capacitive,
            0.0,
            0.9,
            &[("bed_occupied", FieldValue::Bool(false))],
        ));
        let updates = engine.ingest_event(&event(
            DetectorId::Audio,
            0.1,
            0.8,
            &[("silence_duration", FieldValue::Number(30.0))],
        ));
        let risk = updates.iter().find(|u| u.name == "apnea_risk").unwrap();
        assert_eq!(risk.value, FieldValue::Number(0.0));
    }
}
