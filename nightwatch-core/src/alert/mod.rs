//! Rule evaluation and alert lifecycle.
//!
//! ## Per-rule state machine
//!
//! ```text
//! idle ──predicate true──► pending (satisfied_since set)
//! pending ──dwell ≥ duration, cooldown clear──► firing (active_alert set)
//! firing ──predicate false for resolve_hold──► resolved → idle
//! ```
//!
//! Conditions reference either a fused channel (by name) or a detector's
//! latest event field. A name that parses as a detector id is a detector
//! reference; anything else is a channel. The two namespaces are
//! independent: a rule on channel `respiration` and a rule on
//! `radar.respiration_rate` evaluate separately and are never deduplicated.
//!
//! Null/missing values make a condition false, never true. A field that a
//! rule references but no event carries is logged once per (rule, field).

pub mod rules;

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::events::{
    Alert, AlertLevel, DetectorId, Event, FieldValue, FusedSignal,
};
pub use rules::{CombineMode, Condition, ConditionValue, Operator, RuleSpec};

/// Predicate must stay false this long before auto-resolution.
pub const DEFAULT_RESOLVE_HOLD_SECS: f64 = 10.0;

struct RuleState {
    spec: RuleSpec,
    satisfied_since: Option<f64>,
    false_since: Option<f64>,
    last_fired_at: Option<f64>,
    active_alert: Option<String>,
    /// Per-condition dwell anchors (for conditions with their own duration).
    condition_since: Vec<Option<f64>>,
}

struct OfflineState {
    last_seen: f64,
    active_alert: Option<String>,
}

/// Engine settings beyond the rule list.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub resolve_hold_secs: f64,
    pub detector_timeout_secs: f64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            resolve_hold_secs: DEFAULT_RESOLVE_HOLD_SECS,
            detector_timeout_secs: 10.0,
        }
    }
}

pub struct AlertEngine {
    clock: SharedClock,
    settings: AlertSettings,
    rules: Vec<RuleState>,
    latest_events: HashMap<DetectorId, Event>,
    channels: HashMap<String, FusedSignal>,
    active: HashMap<String, Alert>,
    /// Synthetic "Detector offline" tracking per enabled detector.
    offline: BTreeMap<DetectorId, OfflineState>,
    /// Test alerts pending auto-resolution, as (alert_id, fired_at).
    test_alerts: Vec<(String, f64)>,
    /// (rule, field) pairs already warned about.
    warned_missing: HashSet<(String, String)>,
}

impl AlertEngine {
    pub fn new(
        clock: SharedClock,
        settings: AlertSettings,
        rules: Vec<RuleSpec>,
        monitored_detectors: &[DetectorId],
    ) -> Self {
        let now = clock.now_monotonic();
        let offline = monitored_detectors
            .iter()
            .map(|&id| {
                (
                    id,
                    OfflineState {
                        last_seen: now,
                        active_alert: None,
                    },
                )
            })
            .collect();
        Self {
            clock,
            settings,
            rules: rules
                .into_iter()
                .map(|spec| {
                    let conditions = spec.conditions.len();
                    RuleState {
                        spec,
                        satisfied_since: None,
                        false_since: None,
                        last_fired_at: None,
                        active_alert: None,
                        condition_since: vec![None; conditions],
                    }
                })
                .collect(),
            latest_events: HashMap::new(),
            channels: HashMap::new(),
            active: HashMap::new(),
            offline,
            test_alerts: Vec::new(),
            warned_missing: HashSet::new(),
        }
    }

    /// Fold in a detector event; returns alerts to publish (fires and
    /// resolutions).
    pub fn observe_event(&mut self, event: Event) -> Vec<Alert> {
        let mut out = Vec::new();
        let mut back_online = None;
        if let Some(state) = self.offline.get_mut(&event.detector) {
            state.last_seen = self.clock.now_monotonic();
            back_online = state.active_alert.take();
        }
        if let Some(alert_id) = back_online {
            if let Some(resolved) = self.resolve_internal(&alert_id) {
                info!(detector = %event.detector, "detector back online");
                out.push(resolved);
            }
        }
        self.latest_events.insert(event.detector, event);
        out.extend(self.evaluate_all());
        out
    }

    /// Fold in a channel update.
    pub fn observe_channel(&mut self, channel: FusedSignal) -> Vec<Alert> {
        self.channels.insert(channel.name.clone(), channel);
        self.evaluate_all()
    }

    /// Timer tick: dwell and cooldown can elapse without any new update,
    /// and detector-offline detection is purely time-driven.
    pub fn tick(&mut self) -> Vec<Alert> {
        let mut out = self.check_offline();
        out.extend(self.resolve_elapsed_test_alerts());
        out.extend(self.evaluate_all());
        out
    }

    /// Idempotent acknowledgment via the control topic.
    pub fn acknowledge(&mut self, alert_id: &str) -> Option<Alert> {
        let alert = self.active.get_mut(alert_id)?;
        if alert.acknowledged_at.is_none() {
            alert.acknowledged_at = Some(self.clock.now_wall());
            info!(alert_id, "alert acknowledged");
        }
        Some(alert.clone())
    }

    /// Operator-driven resolution; a no-op for unknown or resolved ids.
    pub fn force_resolve(&mut self, alert_id: &str) -> Option<Alert> {
        let resolved = self.resolve_internal(alert_id)?;
        for rule in &mut self.rules {
            if rule.active_alert.as_deref() == Some(alert_id) {
                rule.active_alert = None;
                rule.false_since = None;
            }
        }
        for state in self.offline.values_mut() {
            if state.active_alert.as_deref() == Some(alert_id) {
                state.active_alert = None;
            }
        }
        Some(resolved)
    }

    /// Fire a synthetic alert for end-to-end delivery testing.
    pub fn test_alert(&mut self, severity: AlertLevel) -> Alert {
        let now = self.clock.now_monotonic();
        let wall = self.clock.now_wall();
        let alert = Alert {
            alert_id: alert_id("Test alert", wall),
            rule_name: "Test alert".into(),
            level: severity,
            source: "operator".into(),
            message: format!("Operator-requested {severity} test alert"),
            triggered_at: wall,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        };
        self.active.insert(alert.alert_id.clone(), alert.clone());
        self.test_alerts.push((alert.alert_id.clone(), now));
        alert
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.values().cloned().collect()
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn resolve_internal(&mut self, alert_id: &str) -> Option<Alert> {
        let mut alert = self.active.remove(alert_id)?;
        alert.resolved = true;
        alert.resolved_at = Some(self.clock.now_wall());
        Some(alert)
    }

    fn check_offline(&mut self) -> Vec<Alert> {
        let now = self.clock.now_monotonic();
        let wall = self.clock.now_wall();
        let timeout = self.settings.detector_timeout_secs;
        let mut fired = Vec::new();
        for (&id, state) in self.offline.iter_mut() {
            if state.active_alert.is_some() || now - state.last_seen < timeout {
                continue;
            }
            let rule_name = format!("Detector offline: {id}");
            let alert = Alert {
                alert_id: alert_id(&rule_name, wall),
                rule_name,
                level: AlertLevel::Warning,
                source: id.to_string(),
                message: format!(
                    "No events from {id} for {:.0} s",
                    now - state.last_seen
                ),
                triggered_at: wall,
                acknowledged_at: None,
                resolved: false,
                resolved_at: None,
            };
            warn!(detector = %id, "detector offline");
            state.active_alert = Some(alert.alert_id.clone());
            self.active.insert(alert.alert_id.clone(), alert.clone());
            fired.push(alert);
        }
        fired
    }

    fn resolve_elapsed_test_alerts(&mut self) -> Vec<Alert> {
        let now = self.clock.now_monotonic();
        let hold = self.settings.resolve_hold_secs;
        let due: Vec<String> = self
            .test_alerts
            .iter()
            .filter(|(_, fired)| now - fired >= hold)
            .map(|(id, _)| id.clone())
            .collect();
        self.test_alerts.retain(|(_, fired)| now - fired < hold);
        due.iter()
            .filter_map(|id| self.resolve_internal(id))
            .collect()
    }

    fn evaluate_all(&mut self) -> Vec<Alert> {
        let now = self.clock.now_monotonic();
        let wall = self.clock.now_wall();
        let mut out = Vec::new();

        for i in 0..self.rules.len() {
            if !self.rules[i].spec.enabled {
                continue;
            }

            // Evaluate every condition against current state.
            let spec = self.rules[i].spec.clone();
            let mut condition_flags = Vec::with_capacity(spec.conditions.len());
            for (ci, condition) in spec.conditions.iter().enumerate() {
                let raw = self.eval_condition(&spec.name, condition);
                let rule = &mut self.rules[i];
                let flag = if let Some(dwell) = condition.duration_seconds {
                    if raw {
                        let since = *rule.condition_since[ci].get_or_insert(now);
                        now - since >= dwell
                    } else {
                        rule.condition_since[ci] = None;
                        false
                    }
                } else {
                    raw
                };
                condition_flags.push(flag);
            }

            let combined = match spec.combine {
                CombineMode::All => {
                    !condition_flags.is_empty() && condition_flags.iter().all(|&f| f)
                }
                CombineMode::Any => condition_flags.iter().any(|&f| f),
            };

            let rule = &mut self.rules[i];
            if combined {
                rule.false_since = None;
                let since = *rule.satisfied_since.get_or_insert(now);
                let dwell_met = now - since >= spec.duration_seconds;
                let cooldown_clear = rule
                    .last_fired_at
                    .map(|last| now - last >= spec.cooldown_seconds)
                    .unwrap_or(true);
                if dwell_met && cooldown_clear && rule.active_alert.is_none() {
                    let message = render_message(
                        &spec,
                        &self.latest_events,
                        &self.channels,
                    );
                    let alert = Alert {
                        alert_id: alert_id(&spec.name, wall),
                        rule_name: spec.name.clone(),
                        level: spec.severity,
                        source: spec
                            .conditions
                            .first()
                            .map(|c| c.source.clone())
                            .unwrap_or_default(),
                        message,
                        triggered_at: wall,
                        acknowledged_at: None,
                        resolved: false,
                        resolved_at: None,
                    };
                    info!(rule = %spec.name, level = %spec.severity, alert_id = %alert.alert_id, "alert fired");
                    rule.last_fired_at = Some(now);
                    rule.active_alert = Some(alert.alert_id.clone());
                    self.active.insert(alert.alert_id.clone(), alert.clone());
                    out.push(alert);
                }
            } else {
                rule.satisfied_since = None;
                let mut due = None;
                if rule.active_alert.is_some() {
                    let false_since = *rule.false_since.get_or_insert(now);
                    if now - false_since >= self.settings.resolve_hold_secs {
                        due = rule.active_alert.take();
                        rule.false_since = None;
                    }
                }
                if let Some(active_id) = due {
                    if let Some(resolved) = self.resolve_internal(&active_id) {
                        info!(rule = %spec.name, alert_id = %active_id, "alert resolved");
                        out.push(resolved);
                    }
                }
            }
        }
        out
    }

    fn eval_condition(&mut self, rule_name: &str, condition: &Condition) -> bool {
        // A source that parses as a detector id reads the latest event;
        // anything else is a channel name.
        let current = match condition.source.parse::<DetectorId>() {
            Ok(detector) => {
                let Some(field) = condition.field.as_deref() else {
                    self.warn_missing(rule_name, &condition.source, "(no field)");
                    return false;
                };
                match self.latest_events.get(&detector) {
                    Some(event) => {
                        let value = event.field(field);
                        if value.is_null() && !event.values.contains_key(field) {
                            self.warn_missing(rule_name, &condition.source, field);
                        }
                        value
                    }
                    None => FieldValue::Null,
                }
            }
            Err(_) => match self.channels.get(&condition.source) {
                Some(channel) => channel.value,
                None => FieldValue::Null,
            },
        };
        condition.operator.holds(current, condition.value)
    }

    fn warn_missing(&mut self, rule: &str, source: &str, field: &str) {
        let key = (rule.to_string(), format!("{source}.{field}"));
        if self.warned_missing.insert(key) {
            warn!(rule, source, field, "rule references a missing field");
        }
    }
}

/// Stable id: FNV-1a over the rule name and the 1 s bucket of trigger time.
fn alert_id(rule_name: &str, wall: chrono::DateTime<chrono::Utc>) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in rule_name
        .as_bytes()
        .iter()
        .chain(wall.timestamp().to_be_bytes().iter())
    {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

/// Substitute `{field}` / `{channel}` tokens with trigger-instant values.
fn render_message(
    spec: &RuleSpec,
    latest_events: &HashMap<DetectorId, Event>,
    channels: &HashMap<String, FusedSignal>,
) -> String {
    if spec.message.is_empty() {
        return format!("Rule '{}' triggered", spec.name);
    }
    let mut substitutions: BTreeMap<String, String> = BTreeMap::new();
    for condition in &spec.conditions {
        match condition.source.parse::<DetectorId>() {
            Ok(detector) => {
                if let (Some(field), Some(event)) =
                    (condition.field.as_deref(), latest_events.get(&detector))
                {
                    substitutions.insert(field.to_string(), format_value(event.field(field)));
                }
            }
            Err(_) => {
                if let Some(channel) = channels.get(&condition.source) {
                    substitutions.insert(condition.source.clone(), format_value(channel.value));
                }
            }
        }
    }
    let mut message = spec.message.clone();
    for (key, value) in substitutions {
        message = message.replace(&format!("{{{key}}}"), &value);
    }
    message
}

fn format_value(value: FieldValue) -> String {
    match value {
        FieldValue::Number(n) => format!("{n:.1}"),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Null => "null".to_string(),
    }
}
