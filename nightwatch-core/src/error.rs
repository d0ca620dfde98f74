use thiserror::Error;

/// All errors produced by nightwatch-core.
#[derive(Debug, Error)]
pub enum NightwatchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("hardware init failed: {0}")]
    HardwareInit(String),

    #[error("serial error: {0}")]
    Serial(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("i2c error: {0}")]
    I2c(String),

    #[error("unknown detector: {0}")]
    UnknownDetector(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("unknown control request: {0}")]
    UnknownControl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NightwatchError>;
