//! Music playback driven by voice commands.
//!
//! The engine runs on its own thread: the rodio output stream must live on
//! the thread that created it, so the backend is built there too and
//! commands arrive over a dedicated channel.

use crate::bus::StateBus;
use crate::error::{Error, Result};
use crate::library::{Song, SongIndex};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const COMMAND_POLL: Duration = Duration::from_millis(100);

/// Messages accepted by the playback engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    Play(Option<String>),
    Pause,
    Stop,
    VolumeUp,
    VolumeDown,
}

/// Something that can play audio files.
#[cfg_attr(test, mockall::automock)]
pub trait MediaBackend {
    /// Start `path` from the beginning, replacing whatever was playing.
    fn play(&mut self, path: &Path) -> Result<()>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    fn is_paused(&self) -> bool;
    /// Volume in percent, 0..=100.
    fn set_volume(&mut self, volume: u8);
}

/// rodio output on the default audio device.
pub struct RodioBackend {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    volume: f32,
}

impl RodioBackend {
    pub fn open() -> Result<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| Error::Playback(e.to_string()))?;
        Ok(Self {
            _stream: stream,
            handle,
            sink: None,
            volume: 1.0,
        })
    }
}

impl MediaBackend for RodioBackend {
    fn play(&mut self, path: &Path) -> Result<()> {
        self.stop();
        let file = File::open(path)?;
        let source =
            Decoder::new(BufReader::new(file)).map_err(|e| Error::Playback(e.to_string()))?;
        let sink = Sink::try_new(&self.handle).map_err(|e| Error::Playback(e.to_string()))?;
        sink.set_volume(self.volume);
        sink.append(source);
        self.sink = Some(sink);
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            sink.pause();
        }
    }

    fn resume(&mut self) {
        if let Some(sink) = &self.sink {
            sink.play();
        }
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn is_paused(&self) -> bool {
        self.sink
            .as_ref()
            .is_some_and(|sink| sink.is_paused() && !sink.empty())
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = f32::from(volume) / 100.0;
        if let Some(sink) = &self.sink {
            sink.set_volume(self.volume);
        }
    }
}

/// Sending side of the playback engine's command channel.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: Sender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn new(tx: Sender<PlayerCommand>) -> Self {
        Self { tx }
    }

    /// Returns false once the engine has gone away.
    pub fn send(&self, command: PlayerCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

/// Owns the song index, the media backend and the current session.
pub struct PlaybackEngine {
    index: SongIndex,
    backend: Option<Box<dyn MediaBackend>>,
    current: Option<Song>,
    volume: u8,
    step: u8,
}

impl PlaybackEngine {
    pub fn new(
        index: SongIndex,
        backend: Option<Box<dyn MediaBackend>>,
        volume: u8,
        step: u8,
    ) -> Self {
        let mut engine = Self {
            index,
            backend,
            current: None,
            volume: volume.min(100),
            step,
        };
        if let Some(backend) = engine.backend.as_mut() {
            backend.set_volume(engine.volume);
        }
        engine
    }

    /// Start the engine thread with the rodio backend and a fresh index of
    /// `music_dir`.
    pub fn spawn(
        bus: Arc<StateBus>,
        music_dir: PathBuf,
        volume: u8,
        step: u8,
    ) -> (PlayerHandle, JoinHandle<()>) {
        let (tx, rx) = channel::<PlayerCommand>();
        let handle = thread::spawn(move || {
            let backend: Option<Box<dyn MediaBackend>> = match RodioBackend::open() {
                Ok(backend) => {
                    tracing::info!(volume, "music player initialized");
                    Some(Box::new(backend))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "audio output not available, music player disabled");
                    None
                }
            };
            let index = SongIndex::scan(&music_dir);
            index.log_summary(&music_dir);

            let mut engine = PlaybackEngine::new(index, backend, volume, step);
            tracing::info!("music player ready, waiting for commands");
            engine.run(&bus, rx);
        });
        (PlayerHandle::new(tx), handle)
    }

    /// Process commands until the bus stops or every sender is dropped.
    pub fn run(&mut self, bus: &StateBus, rx: Receiver<PlayerCommand>) {
        while bus.is_running() {
            match rx.recv_timeout(COMMAND_POLL) {
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown();
        tracing::info!("music player stopped");
    }

    pub fn handle(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Play(query) => self.play(query.as_deref()),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Stop => self.stop(),
            PlayerCommand::VolumeUp => self.change_volume(i16::from(self.step)),
            PlayerCommand::VolumeDown => self.change_volume(-i16::from(self.step)),
        }
    }

    pub fn current(&self) -> Option<&Song> {
        self.current.as_ref()
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn index(&self) -> &SongIndex {
        &self.index
    }

    fn play(&mut self, query: Option<&str>) {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let Some(backend) = self.backend.as_mut() else {
            tracing::warn!("player not available");
            return;
        };

        if query.is_none() && self.current.is_some() && backend.is_paused() {
            backend.resume();
            if let Some(song) = &self.current {
                tracing::info!(song = %song.name, "resumed");
            }
            return;
        }

        let song = match query {
            Some(q) => self.index.find(q),
            None => self.index.first(),
        };
        let Some(song) = song.cloned() else {
            match query {
                Some(q) => tracing::info!(query = q, "no match found"),
                None => tracing::info!("no songs available"),
            }
            return;
        };

        match backend.play(&song.path) {
            Ok(()) => {
                tracing::info!(song = %song.name, "playing");
                self.current = Some(song);
            }
            Err(e) => tracing::error!(song = %song.name, error = %e, "playback error"),
        }
    }

    fn pause(&mut self) {
        let Some(backend) = self.backend.as_mut() else {
            tracing::warn!("player not available");
            return;
        };
        backend.pause();
        tracing::info!("paused");
    }

    fn stop(&mut self) {
        let Some(backend) = self.backend.as_mut() else {
            tracing::warn!("player not available");
            return;
        };
        backend.stop();
        self.current = None;
        tracing::info!("stopped");
    }

    fn change_volume(&mut self, delta: i16) {
        let Some(backend) = self.backend.as_mut() else {
            tracing::warn!("player not available");
            return;
        };
        self.volume = (i16::from(self.volume) + delta).clamp(0, 100) as u8;
        backend.set_volume(self.volume);
        tracing::info!(volume = self.volume, "volume changed");
    }

    fn shutdown(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.stop();
        }
        self.current = None;
    }
}
