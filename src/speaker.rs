use crate::backends::SpeechSynthesizer;
use crate::bus::StateBus;
use crate::error::{Error, Result};
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Fire-and-forget speech output.
#[cfg_attr(test, mockall::automock)]
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str);
}

/// Queues phrases for a dedicated audio thread that synthesizes and plays
/// them one after another.
#[derive(Clone)]
pub struct AudioSpeaker {
    tx: Sender<String>,
}

impl AudioSpeaker {
    pub fn spawn(
        bus: Arc<StateBus>,
        synth: Box<dyn SpeechSynthesizer>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = channel::<String>();

        let handle = thread::spawn(move || {
            // Audio stream must live on this thread
            let output = match OutputStream::try_default() {
                Ok(output) => Some(output),
                Err(e) => {
                    tracing::warn!(error = %e, "no audio output device, speech disabled");
                    None
                }
            };

            while bus.is_running() {
                let text = match rx.recv_timeout(QUEUE_POLL) {
                    Ok(text) => text,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let Some((_, stream_handle)) = &output else {
                    tracing::debug!(text = %text, "skipping speech, no audio output");
                    continue;
                };

                tracing::debug!(backend = synth.id(), text = %text, "synthesizing");
                let wav = match synth.synthesize(&text) {
                    Ok(wav) => wav,
                    Err(e) => {
                        tracing::error!(error = %e, "speech synthesis failed");
                        continue;
                    }
                };
                let sink = match Sink::try_new(stream_handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to create sink");
                        continue;
                    }
                };
                match Decoder::new(Cursor::new(wav)) {
                    Ok(source) => {
                        sink.append(source.convert_samples::<f32>());
                        // The stream outlives the sink on this thread
                        sink.detach();
                    }
                    Err(e) => tracing::error!(error = %e, "failed to decode speech"),
                }
            }
        });

        (Self { tx }, handle)
    }
}

/// Synthesize `text` and play it on the default output, waiting until it
/// has finished.
pub fn speak_blocking(synth: &dyn SpeechSynthesizer, text: &str) -> Result<()> {
    let wav = synth.synthesize(text)?;
    let (_stream, stream_handle) =
        OutputStream::try_default().map_err(|e| Error::Playback(e.to_string()))?;
    let sink = Sink::try_new(&stream_handle).map_err(|e| Error::Playback(e.to_string()))?;
    let source = Decoder::new(Cursor::new(wav)).map_err(|e| Error::Playback(e.to_string()))?;
    sink.append(source.convert_samples::<f32>());
    sink.sleep_until_end();
    Ok(())
}

impl Speaker for AudioSpeaker {
    fn speak(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }
}
