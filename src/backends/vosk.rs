//! Offline recognition with a Vosk model. Requires the `vosk` feature and
//! libvosk at link time.

use super::{RecognizerFactory, SpeechRecognizer};
use crate::error::{Error, Result};
use std::path::Path;

pub const SAMPLE_RATE: f32 = 16_000.0;

/// Printed when the model folder is missing.
pub const MODEL_HELP: &str = "\
Download a Vosk model and unpack it next to the binary:
  wget https://alphacephei.com/vosk/models/vosk-model-small-en-us-0.15.zip
  unzip vosk-model-small-en-us-0.15.zip -d models/";

#[cfg(feature = "vosk")]
pub struct VoskFactory {
    model: std::sync::Arc<vosk::Model>,
}

#[cfg(feature = "vosk")]
impl VoskFactory {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(Error::Recognizer(format!(
                "vosk model not found at {}\n{}",
                path.display(),
                MODEL_HELP
            )));
        }
        vosk::set_log_level(vosk::LogLevel::Error);
        let model = vosk::Model::new(path.to_string_lossy()).ok_or_else(|| {
            Error::Recognizer(format!("failed to load vosk model from {}", path.display()))
        })?;
        tracing::info!(model = %path.display(), "vosk model loaded");
        Ok(Self {
            model: std::sync::Arc::new(model),
        })
    }
}

#[cfg(feature = "vosk")]
impl RecognizerFactory for VoskFactory {
    fn create(&self) -> Result<Box<dyn SpeechRecognizer>> {
        let recognizer = vosk::Recognizer::new(&self.model, SAMPLE_RATE)
            .ok_or_else(|| Error::Recognizer("failed to create vosk recognizer".to_string()))?;
        Ok(Box::new(VoskRecognizer { recognizer }))
    }
}

#[cfg(feature = "vosk")]
struct VoskRecognizer {
    recognizer: vosk::Recognizer,
}

#[cfg(feature = "vosk")]
impl SpeechRecognizer for VoskRecognizer {
    fn accept(&mut self, samples: &[i16]) -> Option<String> {
        match self.recognizer.accept_waveform(samples) {
            Ok(vosk::DecodingState::Finalized) => self
                .recognizer
                .result()
                .single()
                .map(|r| r.text.to_string())
                .filter(|text| !text.trim().is_empty()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = ?e, "vosk rejected audio block");
                None
            }
        }
    }
}

#[cfg(not(feature = "vosk"))]
pub struct VoskFactory;

#[cfg(not(feature = "vosk"))]
impl VoskFactory {
    pub fn load(path: &Path) -> Result<Self> {
        Err(Error::Recognizer(format!(
            "speech recognition not compiled in (rebuild with --features vosk to use {})",
            path.display()
        )))
    }
}

#[cfg(not(feature = "vosk"))]
impl RecognizerFactory for VoskFactory {
    fn create(&self) -> Result<Box<dyn SpeechRecognizer>> {
        Err(Error::Recognizer("speech recognition not compiled in".to_string()))
    }
}
