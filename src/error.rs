//! Error types shared by the hardware-facing subsystems

use thiserror::Error;

/// Result type alias for facebot operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Camera could not be opened or read
    #[error("camera error: {0}")]
    Camera(String),

    /// Face detector could not be loaded
    #[error("detector error: {0}")]
    Detector(String),

    /// Motor HAT / I2C error
    #[error("motor error: {0}")]
    Motor(String),

    /// Audio input device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition model error
    #[error("recognizer error: {0}")]
    Recognizer(String),

    /// Media playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// Speech synthesis error
    #[error("speech error: {0}")]
    Speech(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
