use super::SpeechSynthesizer;
use crate::error::{Error, Result};

use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const SYNTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Friendly female US voice, slightly slow and high pitched.
const VOICE_ARGS: &[&str] = &["-v", "en-us+f3", "-s", "150", "-p", "65"];

pub struct EspeakBackend {
    binary: String,
}

impl EspeakBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl SpeechSynthesizer for EspeakBackend {
    fn id(&self) -> &'static str {
        "espeak-ng"
    }

    fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary)
            .args(VOICE_ARGS)
            .arg("--stdout")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Speech(format!("failed to run {}: {}", self.binary, e)))?;

        match child.wait_timeout(SYNTH_TIMEOUT)? {
            Some(status) => {
                let output = child.wait_with_output()?;
                if status.success() {
                    Ok(output.stdout)
                } else {
                    let err_msg = String::from_utf8_lossy(&output.stderr);
                    Err(Error::Speech(format!("espeak error: {}", err_msg.trim())))
                }
            }
            None => {
                // Timeout occurred, kill the process
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::Speech("espeak timed out after 5s".to_string()))
            }
        }
    }
}
