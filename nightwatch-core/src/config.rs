//! Configuration: YAML file, env overrides, validation.
//!
//! Loaded once at startup. Every field has a default, so an empty file (or
//! none at all, when no explicit path was given) yields a runnable
//! mock-friendly configuration. Validation failures abort startup with
//! exit code 2.
//!
//! Env overrides: `NIGHTWATCH_CONFIG` (path), `NIGHTWATCH_MOCK` (bool),
//! `NIGHTWATCH_LOG_LEVEL`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::alert::RuleSpec;
use crate::drivers::radar::RadarModel;
use crate::error::{NightwatchError, Result};
use crate::events::DetectorId;
use crate::fusion::strategy::Strategy;
use crate::fusion::{ChannelSpec, SourceSpec};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nightwatch/config.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub detectors: DetectorsConfig,
    pub fusion: FusionConfig,
    pub alert_engine: AlertEngineConfig,
    pub notifiers: NotifiersConfig,
    pub mock_sensors: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// trace | debug | info | warn | error
    pub log_level: String,
    /// Writable cache directory (adaptive baselines live under it).
    pub data_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            data_dir: PathBuf::from("/var/lib/nightwatch"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    pub radar: RadarConfig,
    pub audio: AudioConfig,
    pub capacitive: CapacitiveConfig,
}

impl DetectorsConfig {
    pub fn enabled_ids(&self) -> Vec<DetectorId> {
        let mut ids = Vec::new();
        if self.radar.enabled {
            ids.push(DetectorId::Radar);
        }
        if self.audio.enabled {
            ids.push(DetectorId::Audio);
        }
        if self.capacitive.enabled {
            ids.push(DetectorId::Capacitive);
        }
        ids
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    pub enabled: bool,
    pub device: String,
    pub baud_rate: u32,
    pub model: RadarModelConfig,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "/dev/ttyAMA0".into(),
            baud_rate: 256_000,
            model: RadarModelConfig::Ld2450,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadarModelConfig {
    Ld2450,
    Ld2410,
}

impl From<RadarModelConfig> for RadarModel {
    fn from(model: RadarModelConfig) -> Self {
        match model {
            RadarModelConfig::Ld2450 => RadarModel::Ld2450,
            RadarModelConfig::Ld2410 => RadarModel::Ld2410,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Platform device-name selector; `None` = default input.
    pub device: Option<String>,
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: None,
            sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacitiveConfig {
    pub enabled: bool,
    pub i2c_bus: String,
    pub i2c_address: u8,
    pub sample_rate: u32,
}

impl Default for CapacitiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            i2c_bus: "/dev/i2c-1".into(),
            i2c_address: 0x48,
            sample_rate: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub signal_max_age_seconds: f64,
    pub cross_validation_enabled: bool,
    pub agreement_bonus: f32,
    pub disagreement_penalty: f32,
    /// Channel definitions. Empty → the built-in defaults.
    pub rules: Vec<ChannelSpec>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            signal_max_age_seconds: 5.0,
            cross_validation_enabled: true,
            agreement_bonus: 0.1,
            disagreement_penalty: 0.2,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertEngineConfig {
    pub detector_timeout_seconds: f64,
    pub resolve_hold_seconds: f64,
    pub hardware_startup_grace_seconds: f64,
    /// Rule definitions. Empty → the built-in defaults.
    pub rules: Vec<RuleSpec>,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            detector_timeout_seconds: 10.0,
            resolve_hold_seconds: 10.0,
            hardware_startup_grace_seconds: 30.0,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifiersConfig {
    pub audio: AudioNotifierConfig,
    pub push: PushNotifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioNotifierConfig {
    pub enabled: bool,
    pub sounds_dir: Option<PathBuf>,
    pub initial_volume: f32,
}

impl Default for AudioNotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sounds_dir: None,
            initial_volume: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushNotifierConfig {
    pub enabled: bool,
    pub provider: Option<PushProviderKind>,
    // Pushover
    pub token: Option<String>,
    pub user: Option<String>,
    // ntfy
    pub server: Option<String>,
    pub topic: Option<String>,
    // webhook
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushProviderKind {
    Pushover,
    Ntfy,
    Webhook,
}

impl Config {
    /// Load from `path`, falling back to `NIGHTWATCH_CONFIG`, then the
    /// system default location, then built-in defaults.
    ///
    /// A path that was explicitly requested but cannot be read is a
    /// configuration error; the missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("NIGHTWATCH_CONFIG").ok().map(PathBuf::from);
        let explicit = path.map(Path::to_path_buf).or(env_path);

        let mut config = match &explicit {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    NightwatchError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    NightwatchError::Config(format!("invalid {}: {e}", path.display()))
                })?
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    let raw = std::fs::read_to_string(default).map_err(|e| {
                        NightwatchError::Config(format!("cannot read {}: {e}", default.display()))
                    })?;
                    serde_yaml::from_str(&raw).map_err(|e| {
                        NightwatchError::Config(format!("invalid {}: {e}", default.display()))
                    })?
                } else {
                    info!("no config file found — using built-in defaults");
                    Config::default()
                }
            }
        };

        config.apply_env();
        config.fill_default_rules();
        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML string (tests, embedded fixtures).
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|e| NightwatchError::Config(format!("invalid config: {e}")))?;
        config.apply_env();
        config.fill_default_rules();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(mock) = std::env::var("NIGHTWATCH_MOCK") {
            self.mock_sensors = matches!(mock.trim(), "1" | "true" | "yes");
        }
        if let Ok(level) = std::env::var("NIGHTWATCH_LOG_LEVEL") {
            self.system.log_level = level;
        }
    }

    /// Empty rule lists get the built-in channel and alert definitions.
    fn fill_default_rules(&mut self) {
        if self.fusion.rules.is_empty() {
            self.fusion.rules = default_channels();
        }
        if self.alert_engine.rules.is_empty() {
            self.alert_engine.rules = default_alert_rules();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let log_levels = ["trace", "debug", "info", "warn", "error"];
        if !log_levels.contains(&self.system.log_level.to_ascii_lowercase().as_str()) {
            return Err(NightwatchError::Config(format!(
                "system.log_level '{}' is not one of {log_levels:?}",
                self.system.log_level
            )));
        }
        if self.detectors.radar.enabled && self.detectors.radar.baud_rate == 0 {
            return Err(NightwatchError::Config(
                "detectors.radar.baud_rate must be positive".into(),
            ));
        }
        if self.detectors.audio.enabled && self.detectors.audio.sample_rate < 16_000 {
            return Err(NightwatchError::Config(
                "detectors.audio.sample_rate must be at least 16000".into(),
            ));
        }
        if self.detectors.capacitive.enabled && self.detectors.capacitive.sample_rate == 0 {
            return Err(NightwatchError::Config(
                "detectors.capacitive.sample_rate must be positive".into(),
            ));
        }
        if self.fusion.signal_max_age_seconds <= 0.0 {
            return Err(NightwatchError::Config(
                "fusion.signal_max_age_seconds must be positive".into(),
            ));
        }

        for channel in &self.fusion.rules {
            if channel.signal.is_empty() {
                return Err(NightwatchError::Config(
                    "fusion rule with empty signal name".into(),
                ));
            }
            match channel.strategy {
                Strategy::Computed => {
                    if channel.signal != "apnea_risk" {
                        return Err(NightwatchError::Config(format!(
                            "unknown computed channel '{}'",
                            channel.signal
                        )));
                    }
                }
                _ => {
                    if channel.sources.is_empty() {
                        return Err(NightwatchError::Config(format!(
                            "channel '{}' has no sources",
                            channel.signal
                        )));
                    }
                    if channel.min_sources == 0 || channel.min_sources > channel.sources.len() {
                        return Err(NightwatchError::Config(format!(
                            "channel '{}': min_sources must be within 1..={}",
                            channel.signal,
                            channel.sources.len()
                        )));
                    }
                    if channel.sources.iter().any(|s| s.weight <= 0.0) {
                        return Err(NightwatchError::Config(format!(
                            "channel '{}': source weights must be positive",
                            channel.signal
                        )));
                    }
                }
            }
        }

        for rule in &self.alert_engine.rules {
            if rule.name.is_empty() {
                return Err(NightwatchError::Config("alert rule with empty name".into()));
            }
            if rule.conditions.is_empty() {
                return Err(NightwatchError::Config(format!(
                    "alert rule '{}' has no conditions",
                    rule.name
                )));
            }
            if rule.duration_seconds < 0.0 || rule.cooldown_seconds < 0.0 {
                return Err(NightwatchError::Config(format!(
                    "alert rule '{}': durations must be non-negative",
                    rule.name
                )));
            }
        }

        let push = &self.notifiers.push;
        if push.enabled {
            match push.provider {
                None => {
                    return Err(NightwatchError::Config(
                        "notifiers.push.enabled without a provider".into(),
                    ))
                }
                Some(PushProviderKind::Pushover) => {
                    if push.token.is_none() || push.user.is_none() {
                        return Err(NightwatchError::Config(
                            "pushover requires token and user".into(),
                        ));
                    }
                }
                Some(PushProviderKind::Ntfy) => {
                    if push.topic.is_none() {
                        return Err(NightwatchError::Config("ntfy requires a topic".into()));
                    }
                }
                Some(PushProviderKind::Webhook) => {
                    if push.url.is_none() {
                        return Err(NightwatchError::Config("webhook requires a url".into()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Built-in channel set: each vital gets every physically capable sensor.
fn default_channels() -> Vec<ChannelSpec> {
    vec![
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
                SourceSpec {
                    detector: DetectorId::Capacitive,
                    field: "respiration_rate".into(),
                    weight: 0.9,
                },
            ],
            strategy: Strategy::WeightedAverage,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: Some(10.0),
            max_deviation: 5.0,
        },
        ChannelSpec {
            signal: "heart_rate".into(),
            sources: vec![
                SourceSpec {
                    detector: DetectorId::Capacitive,
                    field: "heart_rate".into(),
                    weight: 1.0,
                },
                SourceSpec {
                    detector: DetectorId::Radar,
                    field: "heart_rate".into(),
                    weight: 0.3,
                },
            ],
            strategy: Strategy::WeightedAverage,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: Some(25.0),
            max_deviation: 10.0,
        },
        ChannelSpec {
            signal: "presence".into(),
            sources: vec![
                SourceSpec {
                    detector: DetectorId::Radar,
                    field: "presence".into(),
                    weight: 1.0,
                },
                SourceSpec {
                    detector: DetectorId::Capacitive,
                    field: "bed_occupied".into(),
                    weight: 1.0,
                },
            ],
            strategy: Strategy::Any,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 5.0,
        },
        ChannelSpec {
            signal: "movement".into(),
            sources: vec![SourceSpec {
                detector: DetectorId::Radar,
                field: "movement_macro".into(),
                weight: 1.0,
            }],
            strategy: Strategy::Any,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 5.0,
        },
        ChannelSpec {
            signal: "seizure".into(),
            sources: vec![SourceSpec {
                detector: DetectorId::Audio,
                field: "seizure_pattern".into(),
                weight: 1.0,
            }],
            strategy: Strategy::Any,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 5.0,
        },
        ChannelSpec {
            signal: "apnea_risk".into(),
            sources: Vec::new(),
            strategy: Strategy::Computed,
            min_sources: 1,
            agreement_threshold: 0.8,
            disagreement_limit: None,
            max_deviation: 5.0,
        },
    ]
}

/// Built-in alert rules covering the critical vitals.
fn default_alert_rules() -> Vec<RuleSpec> {
    use crate::alert::{CombineMode, Condition, ConditionValue, Operator};
    vec![
        RuleSpec {
            name: "Low respiration".into(),
            enabled: true,
            conditions: vec![Condition {
                source: "respiration".into(),
                field: None,
                operator: Operator::Lt,
                value: ConditionValue::Number(6.0),
                duration_seconds: None,
            }],
            combine: CombineMode::All,
            severity: crate::events::AlertLevel::Critical,
            duration_seconds: 15.0,
            cooldown_seconds: 60.0,
            message: "Respiration low: {respiration} BPM".into(),
        },
        RuleSpec {
            name: "High apnea risk".into(),
            enabled: true,
            conditions: vec![Condition {
                source: "apnea_risk".into(),
                field: None,
                operator: Operator::Ge,
                value: ConditionValue::Number(0.7),
                duration_seconds: None,
            }],
            combine: CombineMode::All,
            severity: crate::events::AlertLevel::Critical,
            duration_seconds: 5.0,
            cooldown_seconds: 60.0,
            message: "Apnea risk {apnea_risk}".into(),
        },
        RuleSpec {
            name: "Seizure-like pattern".into(),
            enabled: true,
            conditions: vec![Condition {
                source: "seizure".into(),
                field: None,
                operator: Operator::Eq,
                value: ConditionValue::Bool(true),
                duration_seconds: None,
            }],
            combine: CombineMode::All,
            severity: crate::events::AlertLevel::Critical,
            duration_seconds: 5.0,
            cooldown_seconds: 120.0,
            message: "Seizure-like audio pattern detected".into(),
        },
        RuleSpec {
            name: "Tachycardia".into(),
            enabled: true,
            conditions: vec![Condition {
                source: "heart_rate".into(),
                field: None,
                operator: Operator::Gt,
                value: ConditionValue::Number(130.0),
                duration_seconds: None,
            }],
            combine: CombineMode::All,
            severity: crate::events::AlertLevel::Warning,
            duration_seconds: 30.0,
            cooldown_seconds: 300.0,
            message: "Heart rate elevated: {heart_rate} BPM".into(),
        },
    ]
}
