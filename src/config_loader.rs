use crate::motor::{DEFAULT_DEAD_ZONE, DEFAULT_SPEED};
use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Stream server
    pub http_host: String,
    pub http_port: u16,
    // Camera
    pub camera_device: String,
    pub camera_binary: String,
    pub frame_width: u32,
    pub frame_height: u32,
    // Face detector
    pub face_model_path: String,
    // Motor HAT
    pub dead_zone: i32,
    pub motor_speed: f32,
    pub i2c_bus: u8,
    pub motor_hat_address: u16,
    // Voice commands
    pub vosk_model_path: String,
    pub mic_device: Option<String>,
    pub enable_voice: bool,
    // Music player
    pub music_dir: String,
    pub default_volume: u8,
    pub volume_step: u8,
    // Greeting speech
    pub greeting: String,
    pub espeak_binary: String,
    // Shutdown
    pub shutdown_timeout_ms: u64,
}

pub const DEFAULT_GREETING: &str = "Hello! It is nice to see you.";

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            camera_device: "/dev/video0".to_string(),
            camera_binary: "ffmpeg".to_string(),
            frame_width: 640,
            frame_height: 480,
            face_model_path: "./models/seeta_fd_frontal_v1.0.bin".to_string(),
            dead_zone: DEFAULT_DEAD_ZONE,
            motor_speed: DEFAULT_SPEED,
            i2c_bus: 1,
            motor_hat_address: 0x60,
            vosk_model_path: "./models/vosk-model-small-en-us-0.15".to_string(),
            mic_device: None,
            enable_voice: true,
            music_dir: "./music".to_string(),
            default_volume: 70,
            volume_step: 10,
            greeting: DEFAULT_GREETING.to_string(),
            espeak_binary: "espeak-ng".to_string(),
            shutdown_timeout_ms: 2000,
        }
    }
}

impl Settings {
    /// Load settings from defaults, `./Facebot.*`, the user config dir and
    /// `FACEBOT_*` environment variables, in increasing priority.
    pub fn load() -> Result<Self, config::ConfigError> {
        let user_file: PathBuf = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facebot")
            .join("Facebot");

        let defaults = Settings::default();
        let builder = Config::builder()
            // Stream server
            .set_default("http_host", defaults.http_host)?
            .set_default("http_port", defaults.http_port)?
            // Camera
            .set_default("camera_device", defaults.camera_device)?
            .set_default("camera_binary", defaults.camera_binary)?
            .set_default("frame_width", defaults.frame_width)?
            .set_default("frame_height", defaults.frame_height)?
            .set_default("face_model_path", defaults.face_model_path)?
            // Motor HAT
            .set_default("dead_zone", defaults.dead_zone)?
            .set_default("motor_speed", defaults.motor_speed as f64)?
            .set_default("i2c_bus", defaults.i2c_bus)?
            .set_default("motor_hat_address", defaults.motor_hat_address)?
            // Voice
            .set_default("vosk_model_path", defaults.vosk_model_path)?
            .set_default("enable_voice", defaults.enable_voice)?
            // Music
            .set_default("music_dir", defaults.music_dir)?
            .set_default("default_volume", defaults.default_volume)?
            .set_default("volume_step", defaults.volume_step)?
            // Speech
            .set_default("greeting", defaults.greeting)?
            .set_default("espeak_binary", defaults.espeak_binary)?
            .set_default("shutdown_timeout_ms", defaults.shutdown_timeout_ms)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Facebot").required(false))
            .add_source(File::with_name(&user_file.to_string_lossy()).required(false))
            // Merge with environment variables (e.g. FACEBOT_HTTP_PORT)
            .add_source(config::Environment::with_prefix("FACEBOT"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.dead_zone <= 0 {
            return Err(config::ConfigError::Message(format!(
                "Invalid dead_zone: {}. Must be positive",
                self.dead_zone
            )));
        }
        if !(self.motor_speed > 0.0 && self.motor_speed <= 1.0) {
            return Err(config::ConfigError::Message(format!(
                "Invalid motor_speed: {}. Must be in (0.0, 1.0]",
                self.motor_speed
            )));
        }
        if self.default_volume > 100 {
            return Err(config::ConfigError::Message(format!(
                "Invalid default_volume: {}. Must be between 0 and 100",
                self.default_volume
            )));
        }
        if self.volume_step == 0 {
            return Err(config::ConfigError::Message(
                "volume_step must be greater than 0".to_string(),
            ));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(config::ConfigError::Message(
                "frame_width and frame_height must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}
