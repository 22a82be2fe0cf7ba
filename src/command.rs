//! Voice command vocabulary and the transcript parser.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicAction {
    Play,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAction {
    Up,
    Down,
}

/// A structured command recognized from speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Greeting,
    Tracking(Toggle),
    Music {
        action: MusicAction,
        query: Option<String>,
    },
    Volume(VolumeAction),
}

const GREETINGS: &[&str] = &["hello", "hi", "hey", "hello debo"];
const PAUSE_PHRASES: &[&str] = &["pause", "pause music", "pause it"];
const STOP_PHRASES: &[&str] = &["stop", "stop music", "stop it", "stop playing"];

struct Patterns {
    volume_up: Regex,
    volume_down: Regex,
    tracking_on: Regex,
    tracking_off: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        volume_up: anchored("volume up|louder|turn it up|increase volume"),
        volume_down: anchored("volume down|quieter|turn it down|decrease volume"),
        tracking_on: anchored("tracking on|enable tracking|start tracking|track me"),
        tracking_off: anchored("tracking off|disable tracking|stop tracking|don't track"),
    })
}

// Phrases only need to match at the start of the utterance.
fn anchored(alternatives: &str) -> Regex {
    Regex::new(&format!("^(?:{})", alternatives)).expect("static command pattern")
}

/// Parse a recognized transcript into a command.
///
/// Returns `None` for empty or unrecognized text.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }

    if GREETINGS.contains(&text.as_str()) {
        return Some(Command::Greeting);
    }

    if let Some(rest) = text.strip_prefix("play") {
        let query = rest.trim();
        return Some(Command::Music {
            action: MusicAction::Play,
            query: (!query.is_empty()).then(|| query.to_string()),
        });
    }

    if PAUSE_PHRASES.contains(&text.as_str()) {
        return Some(Command::Music {
            action: MusicAction::Pause,
            query: None,
        });
    }

    if STOP_PHRASES.contains(&text.as_str()) {
        return Some(Command::Music {
            action: MusicAction::Stop,
            query: None,
        });
    }

    let p = patterns();
    if p.volume_up.is_match(&text) {
        return Some(Command::Volume(VolumeAction::Up));
    }
    if p.volume_down.is_match(&text) {
        return Some(Command::Volume(VolumeAction::Down));
    }
    if p.tracking_on.is_match(&text) {
        return Some(Command::Tracking(Toggle::On));
    }
    if p.tracking_off.is_match(&text) {
        return Some(Command::Tracking(Toggle::Off));
    }

    None
}
