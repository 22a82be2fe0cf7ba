pub mod espeak;
pub mod vosk;

use crate::error::Result;

/// Turns text into a WAV byte stream.
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns the WAV data produced for `text`.
    fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Unique ID of the backend (e.g., "espeak-ng")
    fn id(&self) -> &'static str;
}

/// Streaming speech-to-text over 16 kHz mono PCM.
pub trait SpeechRecognizer: Send {
    /// Feed one block of samples. Returns the text of an utterance once the
    /// recognizer has finalized one, `None` otherwise.
    fn accept(&mut self, samples: &[i16]) -> Option<String>;
}

/// Builds fresh recognizers. The voice loop asks for a new one after each
/// audio failure.
pub trait RecognizerFactory: Send {
    fn create(&self) -> Result<Box<dyn SpeechRecognizer>>;
}
