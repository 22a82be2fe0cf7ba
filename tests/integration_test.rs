use facebot::backends::{RecognizerFactory, SpeechRecognizer};
use facebot::bus::{Frame, StateBus};
use facebot::config_loader::Settings;
use facebot::ear::{AudioInput, AudioStream, VoiceLoop, BLOCK_SAMPLES};
use facebot::library::SongIndex;
use facebot::motor::{Actuator, ActuatorController, Axis};
use facebot::player::{MediaBackend, PlaybackEngine, PlayerHandle};
use facebot::router::CommandRouter;
use facebot::speaker::Speaker;
use facebot::supervisor::Supervisor;
use facebot::vision::{Camera, FaceBox, FaceDetector, VisionLoop};
use image::GrayImage;
use serial_test::serial;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

mockall::mock! {
    pub Backend {}
    impl MediaBackend for Backend {
        fn play(&mut self, path: &Path) -> facebot::Result<()>;
        fn pause(&mut self);
        fn resume(&mut self);
        fn stop(&mut self);
        fn is_paused(&self) -> bool;
        fn set_volume(&mut self, volume: u8);
    }
}

/// Hands out one block per scripted transcript, then goes quiet.
struct ScriptedMic {
    blocks: usize,
}

struct ScriptedStream {
    remaining: usize,
}

impl AudioInput for ScriptedMic {
    fn open(&mut self) -> facebot::Result<Box<dyn AudioStream>> {
        let remaining = std::mem::take(&mut self.blocks);
        Ok(Box::new(ScriptedStream { remaining }))
    }
}

impl AudioStream for ScriptedStream {
    fn next_block(&mut self, timeout: Duration) -> facebot::Result<Option<Vec<i16>>> {
        if self.remaining == 0 {
            thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(vec![0; BLOCK_SAMPLES]))
    }
}

struct Transcripts(Arc<Mutex<VecDeque<&'static str>>>);

impl SpeechRecognizer for Transcripts {
    fn accept(&mut self, _samples: &[i16]) -> Option<String> {
        self.0.lock().unwrap().pop_front().map(str::to_string)
    }
}

struct TranscriptFactory(Arc<Mutex<VecDeque<&'static str>>>);

impl RecognizerFactory for TranscriptFactory {
    fn create(&self) -> facebot::Result<Box<dyn SpeechRecognizer>> {
        Ok(Box::new(Transcripts(self.0.clone())))
    }
}

#[derive(Default)]
struct RecordingSpeaker(Mutex<Vec<String>>);

impl Speaker for RecordingSpeaker {
    fn speak(&self, text: &str) {
        self.0.lock().unwrap().push(text.to_string());
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn test_spoken_commands_reach_player_tracking_and_speaker() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("Take Five.mp3"), b"x").unwrap();
    std::fs::write(dir.path().join("So What.mp3"), b"x").unwrap();
    let index = SongIndex::scan(dir.path());

    let (played_tx, played_rx) = channel();
    let mut backend = MockBackend::new();
    backend.expect_set_volume().return_const(());
    backend.expect_stop().return_const(());
    backend
        .expect_play()
        .withf(|path| path.ends_with("So What.mp3"))
        .times(1)
        .returning(move |_| {
            let _ = played_tx.send(());
            Ok(())
        });

    let bus = Arc::new(StateBus::new());
    let mut supervisor = Supervisor::new(bus.clone());

    let (player_tx, player_rx) = channel();
    let player_bus = bus.clone();
    supervisor
        .spawn("playback", move || {
            let mut engine = PlaybackEngine::new(index, Some(Box::new(backend)), 70, 10);
            engine.run(&player_bus, player_rx);
        })
        .unwrap();

    let speaker = Arc::new(RecordingSpeaker::default());
    let router = CommandRouter::new(
        bus.clone(),
        speaker.clone(),
        PlayerHandle::new(player_tx),
        "Hello! It is nice to see you.",
    );
    supervisor.spawn("router", move || router.run()).unwrap();

    let transcripts = Arc::new(Mutex::new(VecDeque::from(vec![
        "play so what",
        "tracking off",
        "what a nice day",
        "hello",
    ])));
    let voice = VoiceLoop::new(
        bus.clone(),
        Box::new(ScriptedMic { blocks: 4 }),
        Box::new(TranscriptFactory(transcripts)),
    );
    supervisor.spawn("voice", move || voice.run()).unwrap();

    played_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !bus.is_tracking_enabled()));
    assert!(wait_until(Duration::from_secs(2), || {
        speaker.0.lock().unwrap().len() == 1
    }));
    assert_eq!(
        speaker.0.lock().unwrap()[0],
        "Hello! It is nice to see you."
    );

    let stuck = supervisor.shutdown(Duration::from_secs(1));
    assert!(stuck.is_empty());
}

struct StillCamera;

impl Camera for StillCamera {
    fn read(&mut self) -> facebot::Result<Frame> {
        Ok(Frame::new(640, 480))
    }
}

/// Always sees one face in the right half of the frame.
struct RightFace;

impl FaceDetector for RightFace {
    fn detect(&mut self, _gray: &GrayImage) -> Vec<FaceBox> {
        vec![FaceBox {
            x: 560,
            y: 210,
            w: 60,
            h: 60,
        }]
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(Axis, f32)>>>);

impl Actuator for Recorder {
    fn set_throttle(&mut self, axis: Axis, throttle: f32) -> facebot::Result<()> {
        self.0.lock().unwrap().push((axis, throttle));
        Ok(())
    }
}

#[test]
fn test_tracking_publishes_frames_and_stops_motors_on_shutdown() {
    let bus = Arc::new(StateBus::new());
    let mut supervisor = Supervisor::new(bus.clone());
    let recorder = Recorder::default();

    let (vision_bus, vision_rec) = (bus.clone(), recorder.clone());
    supervisor
        .spawn("vision", move || {
            let controller = ActuatorController::new(Box::new(vision_rec), 50, 1.0);
            VisionLoop::new(vision_bus, Box::new(StillCamera), Box::new(RightFace), controller)
                .run();
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || bus.frame().is_some()));
    let stuck = supervisor.shutdown(Duration::from_secs(1));
    assert!(stuck.is_empty());

    let writes = recorder.0.lock().unwrap().clone();
    // Face to the right of center pans with reverse throttle
    assert!(writes.contains(&(Axis::Horizontal, -1.0)));
    // Shutdown leaves both motors stopped
    assert_eq!(
        &writes[writes.len() - 2..],
        &[(Axis::Horizontal, 0.0), (Axis::Vertical, 0.0)]
    );
}

#[test]
#[serial]
fn test_environment_overrides_settings() {
    std::env::set_var("FACEBOT_HTTP_PORT", "9090");
    std::env::set_var("FACEBOT_DEFAULT_VOLUME", "40");
    let settings = Settings::load();
    std::env::remove_var("FACEBOT_HTTP_PORT");
    std::env::remove_var("FACEBOT_DEFAULT_VOLUME");

    let settings = settings.unwrap();
    assert_eq!(settings.http_port, 9090);
    assert_eq!(settings.default_volume, 40);
}

#[test]
#[serial]
fn test_invalid_environment_value_is_rejected() {
    std::env::set_var("FACEBOT_MOTOR_SPEED", "3.5");
    let settings = Settings::load();
    std::env::remove_var("FACEBOT_MOTOR_SPEED");
    assert!(settings.is_err());
}

#[test]
fn test_voice_recognition_is_a_default_feature() {
    let manifest = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml")).unwrap();
    assert!(manifest.contains(r#"default = ["vosk"]"#));
    let deb_depends = manifest
        .lines()
        .find(|line| line.starts_with("depends"))
        .unwrap();
    assert!(deb_depends.contains("libvosk"));
}
