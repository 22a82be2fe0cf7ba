//! Dispatches parsed voice commands to the subsystems that act on them.

use crate::bus::StateBus;
use crate::command::{Command, MusicAction, Toggle, VolumeAction};
use crate::player::{PlayerCommand, PlayerHandle};
use crate::speaker::Speaker;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct CommandRouter {
    bus: Arc<StateBus>,
    speaker: Arc<dyn Speaker>,
    player: PlayerHandle,
    greeting: String,
}

impl CommandRouter {
    pub fn new(
        bus: Arc<StateBus>,
        speaker: Arc<dyn Speaker>,
        player: PlayerHandle,
        greeting: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            speaker,
            player,
            greeting: greeting.into(),
        }
    }

    pub fn run(self) {
        while self.bus.is_running() {
            if let Some(command) = self.bus.pop_command(POLL_TIMEOUT) {
                self.dispatch(command);
            }
        }
        tracing::info!("command router stopped");
    }

    pub fn dispatch(&self, command: Command) {
        match command {
            Command::Greeting => {
                let speaker = Arc::clone(&self.speaker);
                let text = self.greeting.clone();
                thread::spawn(move || speaker.speak(&text));
            }
            Command::Tracking(toggle) => {
                let enabled = toggle == Toggle::On;
                self.bus.set_tracking_enabled(enabled);
                tracing::info!(enabled, "face tracking toggled");
            }
            Command::Music { action, query } => {
                let message = match action {
                    MusicAction::Play => PlayerCommand::Play(query),
                    MusicAction::Pause => PlayerCommand::Pause,
                    MusicAction::Stop => PlayerCommand::Stop,
                };
                self.forward(message);
            }
            Command::Volume(VolumeAction::Up) => self.forward(PlayerCommand::VolumeUp),
            Command::Volume(VolumeAction::Down) => self.forward(PlayerCommand::VolumeDown),
        }
    }

    fn forward(&self, message: PlayerCommand) {
        if !self.player.send(message) {
            tracing::debug!("music player gone, command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speaker::MockSpeaker;
    use std::sync::mpsc::{channel, Receiver};
    use std::time::Instant;

    fn router(speaker: MockSpeaker) -> (Arc<StateBus>, CommandRouter, Receiver<PlayerCommand>) {
        let bus = Arc::new(StateBus::new());
        let (tx, rx) = channel();
        let router = CommandRouter::new(
            bus.clone(),
            Arc::new(speaker),
            PlayerHandle::new(tx),
            "Hello there",
        );
        (bus, router, rx)
    }

    #[test]
    fn test_music_and_volume_are_forwarded_in_order() {
        let (_bus, router, rx) = router(MockSpeaker::new());
        router.dispatch(Command::Music {
            action: MusicAction::Play,
            query: Some("jazz".into()),
        });
        router.dispatch(Command::Volume(VolumeAction::Up));
        router.dispatch(Command::Music {
            action: MusicAction::Stop,
            query: None,
        });
        router.dispatch(Command::Volume(VolumeAction::Down));

        let received: Vec<PlayerCommand> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                PlayerCommand::Play(Some("jazz".into())),
                PlayerCommand::VolumeUp,
                PlayerCommand::Stop,
                PlayerCommand::VolumeDown,
            ]
        );
    }

    #[test]
    fn test_tracking_toggles_bus_flag() {
        let (bus, router, _rx) = router(MockSpeaker::new());
        router.dispatch(Command::Tracking(Toggle::Off));
        assert!(!bus.is_tracking_enabled());
        router.dispatch(Command::Tracking(Toggle::On));
        assert!(bus.is_tracking_enabled());
    }

    #[test]
    fn test_greeting_is_spoken_off_thread() {
        let (done_tx, done_rx) = channel();
        let mut speaker = MockSpeaker::new();
        speaker
            .expect_speak()
            .withf(|text| text == "Hello there")
            .times(1)
            .returning(move |_| {
                thread::sleep(Duration::from_millis(100));
                let _ = done_tx.send(());
            });
        let (_bus, router, _rx) = router(speaker);

        let start = Instant::now();
        router.dispatch(Command::Greeting);
        assert!(start.elapsed() < Duration::from_millis(50));
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_dropped_player_does_not_stop_router() {
        let (_bus, router, rx) = router(MockSpeaker::new());
        drop(rx);
        router.dispatch(Command::Music {
            action: MusicAction::Pause,
            query: None,
        });
    }

    #[test]
    fn test_run_drains_bus_and_stops() {
        let (bus, router, rx) = router(MockSpeaker::new());
        bus.push_command(Command::Volume(VolumeAction::Up));
        let handle = thread::spawn(move || router.run());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayerCommand::VolumeUp
        );
        bus.set_running(false);
        let start = Instant::now();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
