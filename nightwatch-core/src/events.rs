//! Canonical record types flowing through the bus.
//!
//! ## Envelope type tags (external stream endpoint)
//!
//! | Variant | Tag |
//! |---------|-----|
//! | [`Event`] | `"event"` |
//! | [`FusedSignal`] | `"channel"` |
//! | [`Alert`] | `"alert"` |
//! | [`StatusReport`] | `"status"` |
//!
//! All records serialize camelCase. Field maps are `BTreeMap`, so a record
//! re-serializes byte-identically after a parse round-trip.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::StatusReport;

// ---------------------------------------------------------------------------
// Detector identity
// ---------------------------------------------------------------------------

/// Stable identifier for a sensor family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectorId {
    /// mmWave radar on UART.
    Radar,
    /// USB microphone.
    Audio,
    /// Capacitive / under-mattress piezo BCG board on the I²C ADC.
    Capacitive,
}

impl DetectorId {
    pub const ALL: [DetectorId; 3] = [DetectorId::Radar, DetectorId::Audio, DetectorId::Capacitive];

    pub fn as_str(self) -> &'static str {
        match self {
            DetectorId::Radar => "radar",
            DetectorId::Audio => "audio",
            DetectorId::Capacitive => "capacitive",
        }
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "radar" => Ok(DetectorId::Radar),
            "audio" => Ok(DetectorId::Audio),
            // "bcg" refers to the piezo channel of the capacitive board.
            "capacitive" | "bcg" => Ok(DetectorId::Capacitive),
            other => Err(format!("unknown detector id '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// One feature reading inside an event: numeric, boolean, or absent.
///
/// `Null` means the detector could not produce this feature on this tick
/// (insufficient data). Rule conditions on `Null` evaluate to false.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Null,
}

impl FieldValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(n: Option<f64>) -> Self {
        n.map(FieldValue::Number).unwrap_or(FieldValue::Null)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Detector claim strength for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    Normal,
    Warning,
    Alert,
    /// Insufficient recent data to make a claim. Features may be `Null`.
    Uncertain,
}

/// The canonical unit produced by a detector, one per processing tick.
///
/// Invariants: within one `(detector, session_id)` run, `sequence` strictly
/// increases and `timestamp` never decreases; `confidence ∈ [0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub detector: DetectorId,
    /// Monotonic seconds, stamped at acquisition.
    pub timestamp: f64,
    pub sequence: u64,
    /// Identifies one detector run; rotates on reconnect.
    pub session_id: u32,
    pub state: DetectorState,
    pub confidence: f32,
    pub values: BTreeMap<String, FieldValue>,
}

impl Event {
    pub fn field(&self, name: &str) -> FieldValue {
        self.values.get(name).copied().unwrap_or(FieldValue::Null)
    }
}

// ---------------------------------------------------------------------------
// Fusion records
// ---------------------------------------------------------------------------

/// Latest reading of one feature from one detector, held by the fusion table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalValue {
    pub value: FieldValue,
    pub confidence: f32,
    pub timestamp: f64,
    pub detector: DetectorId,
    pub field: String,
}

/// A named logical channel produced by the fusion engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedSignal {
    pub name: String,
    pub value: FieldValue,
    pub confidence: f32,
    /// Time of the most recent contributing input.
    pub timestamp: f64,
    pub sources: BTreeSet<DetectorId>,
    /// How consistent contributors were, in [0, 1].
    pub agreement: f32,
    /// True under min-source shortfall or sustained disagreement.
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Rule severity → alert level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Warning => f.write_str("warning"),
            AlertLevel::Critical => f.write_str("critical"),
        }
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A fired (and possibly later resolved) alert record.
///
/// Invariants: `resolved ⇒ resolved_at ≥ triggered_at`; `acknowledged_at`,
/// when present, lies between `triggered_at` and `resolved_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub rule_name: String,
    pub level: AlertLevel,
    /// Channel or detector the rule primarily references.
    pub source: String,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Control inbox
// ---------------------------------------------------------------------------

/// Back-channel requests entering via the control topic.
///
/// All operations are idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Pause { minutes: u64 },
    Resume,
    Acknowledge { alert_id: String },
    Resolve { alert_id: String },
    TestAlert { severity: AlertLevel },
}

// ---------------------------------------------------------------------------
// External envelope
// ---------------------------------------------------------------------------

/// Type-tagged wrapper for the external stream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Envelope {
    Event(Event),
    Channel(FusedSignal),
    Alert(Alert),
    Status(StatusReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let mut values = BTreeMap::new();
        values.insert("respiration_rate".into(), FieldValue::Number(14.2));
        values.insert("presence".into(), FieldValue::Bool(true));
        values.insert("heart_rate".into(), FieldValue::Null);
        Event {
            detector: DetectorId::Radar,
            timestamp: 1234.500250,
            sequence: 42,
            session_id: 3,
            state: DetectorState::Normal,
            confidence: 0.9,
            values,
        }
    }

    #[test]
    fn event_serializes_camel_case_with_mixed_value_types() {
        let json = serde_json::to_value(sample_event()).expect("serialize event");
        assert_eq!(json["detector"], "radar");
        assert_eq!(json["sequence"], 42);
        assert_eq!(json["sessionId"], 3);
        assert_eq!(json["state"], "normal");
        assert_eq!(json["values"]["respiration_rate"], 14.2);
        assert_eq!(json["values"]["presence"], true);
        assert!(json["values"]["heart_rate"].is_null());
    }

    #[test]
    fn event_round_trip_is_byte_stable() {
        let first = serde_json::to_string(&sample_event()).expect("serialize");
        let parsed: Event = serde_json::from_str(&first).expect("parse");
        let second = serde_json::to_string(&parsed).expect("re-serialize");
        assert_eq!(first, second);
    }

    #[test]
    fn alert_round_trip_is_byte_stable_with_optional_fields_absent() {
        let alert = Alert {
            alert_id: "a1b2c3d4e5f60718".into(),
            rule_name: "Low respiration".into(),
            level: AlertLevel::Critical,
            source: "respiration".into(),
            message: "respiration at 3.0 BPM".into(),
            triggered_at: DateTime::<Utc>::UNIX_EPOCH,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        };
        let first = serde_json::to_string(&alert).expect("serialize");
        assert!(!first.contains("acknowledgedAt"));
        let parsed: Alert = serde_json::from_str(&first).expect("parse");
        let second = serde_json::to_string(&parsed).expect("re-serialize");
        assert_eq!(first, second);
    }

    #[test]
    fn detector_id_parses_bcg_as_capacitive() {
        assert_eq!("bcg".parse::<DetectorId>().unwrap(), DetectorId::Capacitive);
        assert_eq!("Radar".parse::<DetectorId>().unwrap(), DetectorId::Radar);
        assert!("sonar".parse::<DetectorId>().is_err());
    }

    #[test]
    fn field_value_null_is_false_for_both_accessors() {
        assert_eq!(FieldValue::Null.as_f64(), None);
        assert_eq!(FieldValue::Null.as_bool(), None);
        assert!(FieldValue::Null.is_null());
    }

    #[test]
    fn control_request_uses_snake_case_type_tags() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"acknowledge","alert_id":"abc"}"#).expect("parse");
        assert_eq!(
            req,
            ControlRequest::Acknowledge {
                alert_id: "abc".into()
            }
        );
        let json = serde_json::to_value(ControlRequest::Pause { minutes: 30 }).expect("serialize");
        assert_eq!(json["type"], "pause");
        assert_eq!(json["minutes"], 30);
    }

    #[test]
    fn envelope_tags_match_the_external_contract() {
        let json = serde_json::to_value(Envelope::Event(sample_event())).expect("serialize");
        assert_eq!(json["type"], "event");
        assert_eq!(json["payload"]["detector"], "radar");
    }
}
