//! Rule configuration types (`alert_engine.rules[]`).

use serde::Deserialize;

use crate::events::{AlertLevel, FieldValue};

/// A configured alert predicate with dwell and cooldown.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub combine: CombineMode,
    pub severity: AlertLevel,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub cooldown_seconds: f64,
    /// Template; `{field}` / `{channel}` substitute trigger-instant values.
    #[serde(default)]
    pub message: String,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    #[default]
    All,
    Any,
}

/// One comparison against a channel or a detector field.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    /// Channel name, or a detector id (then `field` selects the feature).
    pub source: String,
    #[serde(default)]
    pub field: Option<String>,
    pub operator: Operator,
    pub value: ConditionValue,
    /// Optional per-condition dwell, independent of the rule's.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    Le,
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=", alias = "≠")]
    Ne,
    #[serde(rename = ">=", alias = "≥")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

/// Comparison target. Numbers compare numerically, booleans only under
/// equality; a type mismatch (or a null reading) is simply false.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
}

impl Operator {
    pub fn holds(self, current: FieldValue, target: ConditionValue) -> bool {
        match (current, target) {
            (FieldValue::Number(a), ConditionValue::Number(b)) => match self {
                Operator::Lt => a < b,
                Operator::Le => a <= b,
                Operator::Eq => a == b,
                Operator::Ne => a != b,
                Operator::Ge => a >= b,
                Operator::Gt => a > b,
            },
            (FieldValue::Bool(a), ConditionValue::Bool(b)) => match self {
                Operator::Eq => a == b,
                Operator::Ne => a != b,
                // Ordering comparisons are meaningless on booleans.
                _ => false,
            },
            _ => false,
        }
    }
}
