//! Face-tracking robot: camera face tracking on a pan/tilt Motor HAT, an
//! MJPEG viewer, and offline voice commands that drive a music player.

pub mod backends;
pub mod bus;
pub mod command;
pub mod config_loader;
pub mod ear;
pub mod error;
pub mod library;
pub mod motor;
pub mod player;
pub mod router;
pub mod speaker;
pub mod stream;
pub mod supervisor;
pub mod vision;

pub use bus::StateBus;
pub use command::{parse_command, Command};
pub use config_loader::Settings;
pub use error::{Error, Result};
