use clap::{Parser, Subcommand};
use facebot::backends::espeak::EspeakBackend;
use facebot::bus::StateBus;
use facebot::config_loader::Settings;
use facebot::ear::{self, VoiceLoop};
use facebot::library::SongIndex;
use facebot::motor::{Actuator, ActuatorController, Axis, MotorHat};
use facebot::player::PlaybackEngine;
use facebot::router::CommandRouter;
use facebot::speaker::{self, AudioSpeaker};
use facebot::stream::StreamServer;
use facebot::supervisor::Supervisor;
use facebot::vision::{self, FfmpegCamera, VisionLoop};
use std::error::Error;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Face-tracking robot with an MJPEG viewer and voice-controlled music
#[derive(Parser)]
#[command(name = "facebot", version, about, long_about = None)]
struct Cli {
    /// Microphone to use, by index or name (see `facebot devices`)
    #[arg(long, global = true)]
    mic: Option<String>,

    /// Port for the web viewer
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Folder scanned for songs
    #[arg(long, global = true)]
    music_dir: Option<PathBuf>,

    /// Disable voice commands
    #[arg(long, global = true)]
    no_voice: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tracking, streaming and voice control (default)
    Run,

    /// List audio input devices
    Devices,

    /// Show which command a phrase maps to
    Parse {
        /// Phrase as the recognizer would hear it
        text: String,
    },

    /// List the songs found in the music folder
    Songs,

    /// Spin the tilt motor for one second
    MotorTest,

    /// Speak text with the greeting voice
    Say {
        /// Text to speak
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let mut settings = Settings::load()?;
    if let Some(mic) = cli.mic {
        settings.mic_device = Some(mic);
    }
    if let Some(port) = cli.port {
        settings.http_port = port;
    }
    if let Some(dir) = cli.music_dir {
        settings.music_dir = dir.to_string_lossy().into_owned();
    }
    if cli.no_voice {
        settings.enable_voice = false;
    }
    settings.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(settings).await,
        Commands::Devices => list_devices(),
        Commands::Parse { text } => {
            match facebot::parse_command(&text) {
                Some(command) => println!("{:?}", command),
                None => println!("(no command)"),
            }
            Ok(())
        }
        Commands::Songs => {
            let dir = Path::new(&settings.music_dir);
            let index = SongIndex::scan(dir);
            println!("{} songs in {}", index.len(), dir.display());
            for song in index.songs() {
                println!("  {}  ({})", song.name, song.path.display());
            }
            Ok(())
        }
        Commands::MotorTest => motor_test(&settings),
        Commands::Say { text } => {
            let synth = EspeakBackend::new(settings.espeak_binary.clone());
            tokio::task::spawn_blocking(move || speaker::speak_blocking(&synth, &text)).await??;
            Ok(())
        }
    }
}

async fn run(settings: Settings) -> Result<(), Box<dyn Error>> {
    let bus = Arc::new(StateBus::new());
    let mut supervisor = Supervisor::new(bus.clone());

    let (player, handle) = PlaybackEngine::spawn(
        bus.clone(),
        PathBuf::from(&settings.music_dir),
        settings.default_volume,
        settings.volume_step,
    );
    supervisor.adopt("playback", handle);

    let synth = EspeakBackend::new(settings.espeak_binary.clone());
    let (speaker, handle) = AudioSpeaker::spawn(bus.clone(), Box::new(synth));
    supervisor.adopt("speech", handle);

    let router = CommandRouter::new(bus.clone(), Arc::new(speaker), player, settings.greeting.clone());
    supervisor.spawn("router", move || router.run())?;

    if settings.enable_voice {
        supervisor.adopt("voice", VoiceLoop::spawn(bus.clone(), &settings));
    } else {
        tracing::info!("voice commands disabled");
    }

    {
        let bus = bus.clone();
        let s = settings.clone();
        supervisor.spawn("vision", move || {
            // The detector is not Send, so the pipeline is built on its thread.
            let controller = ActuatorController::from_hat(
                s.i2c_bus,
                s.motor_hat_address,
                s.dead_zone,
                s.motor_speed,
            );
            let camera = FfmpegCamera::new(&s.camera_binary, &s.camera_device, s.frame_width, s.frame_height);
            let detector = vision::load_detector(&s.face_model_path);
            VisionLoop::new(bus, Box::new(camera), detector, controller).run();
        })?;

        let s = settings.clone();
        supervisor.on_stuck("vision", move || {
            tracing::warn!("vision loop stuck, stopping motors directly");
            ActuatorController::from_hat(s.i2c_bus, s.motor_hat_address, s.dead_zone, s.motor_speed)
                .stop();
        });
    }

    let server_task = match StreamServer::bind(&settings.bind_addr(), bus.clone()).await {
        Ok(server) => Some(tokio::spawn(server.run())),
        Err(e) => {
            tracing::error!(addr = %settings.bind_addr(), error = %e, "web server disabled");
            None
        }
    };

    print_banner(settings.http_port);
    shutdown_signal().await;
    tracing::info!("shutting down");

    let timeout = Duration::from_millis(settings.shutdown_timeout_ms);
    bus.set_running(false);
    if let Some(task) = server_task {
        if tokio::time::timeout(timeout, task).await.is_err() {
            tracing::warn!(worker = "web", "did not stop in time");
        }
    }
    let stuck = tokio::task::spawn_blocking(move || supervisor.shutdown(timeout)).await?;
    if stuck.is_empty() {
        tracing::info!("goodbye");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Outward-facing LAN address, found by "connecting" a UDP socket.
fn lan_address() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn print_banner(port: u16) {
    println!();
    println!("{}", "=".repeat(50));
    println!("  FACE TRACKING ROBOT");
    println!("{}", "=".repeat(50));
    println!("  Stream: http://{}:{}", lan_address(), port);
    println!();
    println!("  Voice commands:");
    println!("    - 'play [song name]' - play music");
    println!("    - 'pause' / 'stop'   - control playback");
    println!("    - 'volume up/down'   - adjust volume");
    println!("    - 'tracking on/off'  - toggle face tracking");
    println!("    - 'hello'            - get a greeting");
    println!();
    println!("  Press Ctrl+C to stop");
    println!("{}", "=".repeat(50));
    println!();
}

fn list_devices() -> Result<(), Box<dyn Error>> {
    let devices = ear::list_input_devices()?;
    let names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
    let pick = ear::choose_device(&names, None);

    println!("Audio input devices:");
    for device in &devices {
        let mut markers = Vec::new();
        if device.is_default {
            markers.push("default");
        }
        if pick == Some(device.index) {
            markers.push("auto-selected");
        }
        let marker = if markers.is_empty() {
            String::new()
        } else {
            format!("  <-- {}", markers.join(", "))
        };
        println!("  [{}] {}{}", device.index, device.name, marker);
    }
    Ok(())
}

fn motor_test(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let mut hat = MotorHat::open(settings.i2c_bus, settings.motor_hat_address)?;
    println!("Spinning tilt motor forward for 1s...");
    hat.set_throttle(Axis::Vertical, settings.motor_speed)?;
    std::thread::sleep(Duration::from_secs(1));
    hat.set_throttle(Axis::Vertical, 0.0)?;
    println!("Done");
    Ok(())
}
