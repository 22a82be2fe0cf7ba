//! The shared state bus: latest frame, command queue and process-wide flags.
//!
//! One `StateBus` is built in `main` and handed to every subsystem as an
//! `Arc<StateBus>`. Each field has a single writer: the frame belongs to the
//! vision loop, commands flow from the voice loop to the router.

use crate::command::Command;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// A single captured (and possibly annotated) camera frame.
pub type Frame = RgbImage;

pub struct StateBus {
    frame: Mutex<Option<Frame>>,
    commands_tx: Mutex<Sender<Command>>,
    commands_rx: Mutex<Receiver<Command>>,
    running: AtomicBool,
    tracking_enabled: AtomicBool,
}

impl StateBus {
    pub fn new() -> Self {
        let (tx, rx) = channel::<Command>();
        Self {
            frame: Mutex::new(None),
            commands_tx: Mutex::new(tx),
            commands_rx: Mutex::new(rx),
            running: AtomicBool::new(true),
            tracking_enabled: AtomicBool::new(true),
        }
    }

    /// Replace the latest frame.
    pub fn set_frame(&self, frame: Frame) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = Some(frame);
        }
    }

    /// Copy of the latest frame, or `None` if nothing was published yet.
    pub fn frame(&self) -> Option<Frame> {
        self.frame.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn push_command(&self, command: Command) {
        if let Ok(tx) = self.commands_tx.lock() {
            // The receiver lives as long as the bus, so send cannot fail.
            let _ = tx.send(command);
        }
    }

    /// Pop the oldest command, waiting at most `timeout`.
    pub fn pop_command(&self, timeout: Duration) -> Option<Command> {
        let rx = self.commands_rx.lock().ok()?;
        match rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.tracking_enabled.load(Ordering::SeqCst)
    }

    pub fn set_tracking_enabled(&self, enabled: bool) {
        self.tracking_enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new()
    }
}
