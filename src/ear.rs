//! Voice command capture: microphone, recognizer and command parsing.
//!
//! The cpal callback never blocks: it downmixes, resamples to 16 kHz and
//! pushes into a ring buffer that the voice thread drains in fixed blocks.

use crate::backends::vosk::VoskFactory;
use crate::backends::{RecognizerFactory, SpeechRecognizer};
use crate::bus::StateBus;
use crate::command::parse_command;
use crate::config_loader::Settings;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const TARGET_RATE: u32 = 16_000;
pub const BLOCK_SAMPLES: usize = 8_000;
pub const RESTART_BACKOFF: Duration = Duration::from_secs(3);

/// Substrings that mark a USB or webcam microphone.
pub const USB_KEYWORDS: &[&str] = &["usb", "webcam", "camera", "c920", "c270", "logitech"];

const RING_CAPACITY: usize = TARGET_RATE as usize * 4;
const BLOCK_WAIT: Duration = Duration::from_millis(100);
const POLL_SLICE: Duration = Duration::from_millis(10);
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

/// An open microphone stream delivering 16 kHz mono blocks.
pub trait AudioStream {
    /// Wait up to `timeout` for the next full block. `Ok(None)` means no
    /// block is ready yet, `Err` means the stream is broken.
    fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>>;
}

/// Something that can (re)open an audio stream.
pub trait AudioInput: Send {
    fn open(&mut self) -> Result<Box<dyn AudioStream>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// Enumerate input devices on the default host.
pub fn list_input_devices() -> Result<Vec<InputDevice>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok(devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown".into());
            let is_default = default_name.as_deref() == Some(name.as_str());
            InputDevice {
                index,
                name,
                is_default,
            }
        })
        .collect())
}

/// Pick an input device from `names`.
///
/// An explicit request (index or case-insensitive name fragment) wins, then
/// the first USB/webcam-looking device. `None` means "use the host default".
pub fn choose_device(names: &[String], requested: Option<&str>) -> Option<usize> {
    if let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) {
        if let Ok(index) = requested.parse::<usize>() {
            if index < names.len() {
                return Some(index);
            }
        }
        let wanted = requested.to_lowercase();
        if let Some(index) = names.iter().position(|n| n.to_lowercase().contains(&wanted)) {
            return Some(index);
        }
        tracing::warn!(device = requested, "requested microphone not found, auto-selecting");
    }
    names.iter().position(|name| {
        let name = name.to_lowercase();
        USB_KEYWORDS.iter().any(|k| name.contains(k))
    })
}

/// Microphone on the default cpal host, re-resolved on every open so a
/// replugged device is picked up again.
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    /// Resolve the microphone once at setup. Fails if the host has no input
    /// device at all.
    pub fn resolve(requested: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let devices: Vec<cpal::Device> = host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .collect();
        let names: Vec<String> = devices
            .iter()
            .map(|d| d.name().unwrap_or_else(|_| "Unknown".into()))
            .collect();

        match choose_device(&names, requested) {
            Some(index) => {
                tracing::info!(index, device = %names[index], "using microphone");
                Ok(Self {
                    device_name: Some(names[index].clone()),
                })
            }
            None => {
                let device = host
                    .default_input_device()
                    .ok_or_else(|| Error::Audio("no microphone found".to_string()))?;
                let name = device.name().unwrap_or_else(|_| "Unknown".into());
                tracing::info!(device = %name, "using default input device");
                Ok(Self { device_name: None })
            }
        }
    }

    fn device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            Some(wanted) => host
                .input_devices()
                .map_err(|e| Error::Audio(e.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or_else(|| Error::Audio(format!("microphone '{}' not present", wanted))),
            None => host
                .default_input_device()
                .ok_or_else(|| Error::Audio("no default input device".to_string())),
        }
    }
}

impl AudioInput for CpalInput {
    fn open(&mut self) -> Result<Box<dyn AudioStream>> {
        let device = self.device()?;
        let config = stream_config(&device)?;
        tracing::debug!(
            rate = config.sample_rate().0,
            channels = config.channels(),
            "opening audio stream"
        );

        let (producer, consumer) = HeapRb::<i16>::new(RING_CAPACITY).split();
        let failed = Arc::new(AtomicBool::new(false));
        let stream_config = config.config();
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &stream_config, producer, failed.clone())
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, producer, failed.clone())
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &stream_config, producer, failed.clone())
            }
            other => Err(Error::Audio(format!("unsupported sample format {:?}", other))),
        }?;
        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Box::new(CpalStream {
            _stream: stream,
            consumer,
            failed,
        }))
    }
}

/// 16 kHz mono if the device offers it, otherwise its default config.
fn stream_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let wanted = cpal::SampleRate(TARGET_RATE);
    if let Ok(mut configs) = device.supported_input_configs() {
        if let Some(range) = configs.find(|c| {
            c.channels() == 1 && c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted
        }) {
            return Ok(range.with_sample_rate(wanted));
        }
    }
    device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<i16>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut resampler = Resampler::new(config.sample_rate.0, TARGET_RATE);
    let mut mono = Vec::new();
    let mut out = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                }));
                out.clear();
                resampler.process(&mono, &mut out);
                // Ring full: the overflow is dropped, the driver never waits.
                let _ = producer.push_slice(&out);
            },
            move |err| {
                tracing::warn!(error = %err, "audio stream error");
                failed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

struct CpalStream {
    _stream: cpal::Stream,
    consumer: HeapCons<i16>,
    failed: Arc<AtomicBool>,
}

impl AudioStream for CpalStream {
    fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.failed.load(Ordering::SeqCst) {
                return Err(Error::Audio("audio stream failed".to_string()));
            }
            if self.consumer.occupied_len() >= BLOCK_SAMPLES {
                let mut block = vec![0i16; BLOCK_SAMPLES];
                let read = self.consumer.pop_slice(&mut block);
                block.truncate(read);
                return Ok(Some(block));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_SLICE);
        }
    }
}

/// Box-filter resampler from the device rate down (or up) to 16 kHz.
struct Resampler {
    step: f64,
    pos: f64,
}

impl Resampler {
    fn new(from: u32, to: u32) -> Self {
        Self {
            step: f64::from(from) / f64::from(to),
            pos: 0.0,
        }
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<i16>) {
        let len = input.len() as f64;
        while self.pos < len {
            let start = self.pos as usize;
            let end = ((self.pos + self.step) as usize).clamp(start + 1, input.len());
            let window = &input[start..end];
            let avg = window.iter().sum::<f32>() / window.len() as f32;
            out.push((avg.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16);
            self.pos += self.step;
        }
        self.pos -= len;
    }
}

/// Long-running recognition loop with self-healing audio input.
pub struct VoiceLoop {
    bus: Arc<StateBus>,
    input: Box<dyn AudioInput>,
    factory: Box<dyn RecognizerFactory>,
    backoff: Duration,
}

impl VoiceLoop {
    pub fn new(
        bus: Arc<StateBus>,
        input: Box<dyn AudioInput>,
        factory: Box<dyn RecognizerFactory>,
    ) -> Self {
        Self {
            bus,
            input,
            factory,
            backoff: RESTART_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Load the model and resolve the microphone, then run on a new thread.
    /// The thread exits right away when setup fails.
    pub fn spawn(bus: Arc<StateBus>, settings: &Settings) -> JoinHandle<()> {
        let model_path = settings.vosk_model_path.clone();
        let mic = settings.mic_device.clone();
        thread::spawn(move || {
            let Some(voice) = Self::setup(bus, Path::new(&model_path), mic.as_deref()) else {
                return;
            };
            voice.run();
        })
    }

    fn setup(bus: Arc<StateBus>, model_path: &Path, mic: Option<&str>) -> Option<Self> {
        let factory = match VoskFactory::load(model_path) {
            Ok(factory) => factory,
            Err(e) => {
                tracing::warn!("{}", e);
                tracing::warn!("voice commands disabled: model not loaded");
                return None;
            }
        };
        let input = match CpalInput::resolve(mic) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(error = %e, "voice commands disabled: no microphone found");
                if let Ok(devices) = list_input_devices() {
                    for device in devices {
                        tracing::info!("  [{}] {}", device.index, device.name);
                    }
                }
                return None;
            }
        };
        Some(Self::new(bus, Box::new(input), Box::new(factory)))
    }

    pub fn run(mut self) {
        let mut recognizer = match self.factory.create() {
            Ok(recognizer) => recognizer,
            Err(e) => {
                tracing::error!(error = %e, "voice commands disabled");
                return;
            }
        };
        tracing::info!("listening for commands: play, pause, stop, volume up/down, tracking on/off");

        while self.bus.is_running() {
            match self.listen(recognizer.as_mut()) {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "restarting audio stream"
                    );
                    // Decoder state may be corrupt after a failure.
                    recognizer = match self.factory.create() {
                        Ok(recognizer) => recognizer,
                        Err(e) => {
                            tracing::error!(error = %e, "cannot rebuild recognizer, voice commands disabled");
                            return;
                        }
                    };
                    self.wait_backoff();
                }
            }
        }
        tracing::info!("voice loop stopped");
    }

    /// Feed blocks to the recognizer until the bus stops (`Ok`) or the
    /// stream breaks (`Err`).
    fn listen(&mut self, recognizer: &mut dyn SpeechRecognizer) -> Result<()> {
        let mut stream = self.input.open()?;
        while self.bus.is_running() {
            let Some(block) = stream.next_block(BLOCK_WAIT)? else {
                continue;
            };
            if let Some(text) = recognizer.accept(&block) {
                self.handle_transcript(&text);
            }
        }
        Ok(())
    }

    fn handle_transcript(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        tracing::info!(text, "heard");
        if let Some(command) = parse_command(text) {
            tracing::info!(?command, "command");
            self.bus.push_command(command);
        }
    }

    fn wait_backoff(&self) {
        let deadline = Instant::now() + self.backoff;
        while self.bus.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(BACKOFF_SLICE.min(deadline - now));
        }
    }
}
