//! Camera capture, face detection and the tracking loop.

use crate::bus::{Frame, StateBus};
use crate::error::{Error, Result};
use crate::motor::{ActuatorController, Offset};
use image::{GrayImage, Rgb};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pause after a failed capture before trying again.
const CAPTURE_RETRY: Duration = Duration::from_millis(100);
/// Pause after each published frame.
const FRAME_PAUSE: Duration = Duration::from_millis(10);
/// Minimum time between attempts to restart a dead camera process.
const CAMERA_RESPAWN: Duration = Duration::from_secs(2);

const BOX_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: u32 = 2;

// Detector tuning
pub const SCALE_FACTOR: f32 = 1.1;
pub const MIN_FACE_SIZE: u32 = 30;
/// Cascade score needed to accept a window, roughly five overlapping hits.
pub const SCORE_THRESHOLD: f64 = 2.0;

/// Axis-aligned face bounding box in pixels, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + (self.w / 2) as i32, self.y + (self.h / 2) as i32)
    }
}

/// A source of camera frames.
pub trait Camera: Send {
    /// Next frame, or an error if the capture failed this time.
    fn read(&mut self) -> Result<Frame>;

    fn release(&mut self) {}
}

/// A face detector working on grayscale images.
pub trait FaceDetector {
    fn detect(&mut self, gray: &GrayImage) -> Vec<FaceBox>;
}

/// Stand-in used when no detector model could be loaded.
pub struct NoDetector;

impl FaceDetector for NoDetector {
    fn detect(&mut self, _gray: &GrayImage) -> Vec<FaceBox> {
        Vec::new()
    }
}

/// SeetaFace cascade detector.
pub struct RustfaceDetector {
    inner: Box<dyn rustface::Detector>,
}

impl RustfaceDetector {
    pub fn load(model_path: &str) -> Result<Self> {
        let mut inner = rustface::create_detector(model_path)
            .map_err(|e| Error::Detector(format!("{}: {}", model_path, e)))?;
        inner.set_min_face_size(MIN_FACE_SIZE);
        // Each pyramid level shrinks by the cascade scale factor.
        inner.set_pyramid_scale_factor(1.0 / SCALE_FACTOR);
        inner.set_score_thresh(SCORE_THRESHOLD);
        inner.set_slide_window_step(4, 4);
        Ok(Self { inner })
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&mut self, gray: &GrayImage) -> Vec<FaceBox> {
        let (w, h) = gray.dimensions();
        let mut data = rustface::ImageData::new(gray.as_raw(), w, h);
        self.inner
            .detect(&mut data)
            .into_iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBox {
                    x: bbox.x(),
                    y: bbox.y(),
                    w: bbox.width(),
                    h: bbox.height(),
                }
            })
            .collect()
    }
}

/// Load the configured detector model, or fall back to [`NoDetector`].
pub fn load_detector(model_path: &str) -> Box<dyn FaceDetector> {
    match RustfaceDetector::load(model_path) {
        Ok(detector) => {
            tracing::info!(model = model_path, "face detector loaded");
            Box::new(detector)
        }
        Err(e) => {
            tracing::error!(error = %e, "could not load face detector, tracking disabled");
            Box::new(NoDetector)
        }
    }
}

/// Tracks whether the camera is delivering so outages are reported once.
#[derive(Debug, Default)]
struct CaptureHealth {
    streaming: bool,
    warned: bool,
}

impl CaptureHealth {
    /// True for the first frame after startup or after an outage.
    fn frame_ok(&mut self) -> bool {
        let first = !self.streaming;
        self.streaming = true;
        self.warned = false;
        first
    }

    /// True for the first failure of an outage.
    fn frame_failed(&mut self) -> bool {
        self.streaming = false;
        let first = !self.warned;
        self.warned = true;
        first
    }
}

/// Camera frames read from an `ffmpeg` child emitting raw RGB24.
pub struct FfmpegCamera {
    binary: String,
    device: String,
    width: u32,
    height: u32,
    child: Option<(Child, ChildStdout)>,
    last_spawn: Option<Instant>,
    health: CaptureHealth,
}

impl FfmpegCamera {
    pub fn new(binary: &str, device: &str, width: u32, height: u32) -> Self {
        Self {
            binary: binary.to_string(),
            device: device.to_string(),
            width,
            height,
            child: None,
            last_spawn: None,
            health: CaptureHealth::default(),
        }
    }

    /// True while frames are arriving.
    pub fn is_streaming(&self) -> bool {
        self.health.streaming
    }

    fn spawn(&mut self) -> Result<()> {
        if let Some(last) = self.last_spawn {
            if last.elapsed() < CAMERA_RESPAWN {
                return Err(Error::Camera("camera restart pending".into()));
            }
        }
        self.last_spawn = Some(Instant::now());

        let size = format!("{}x{}", self.width, self.height);
        let scale = format!("scale={}:{}", self.width, self.height);
        let mut child = Command::new(&self.binary)
            .args(["-loglevel", "error", "-f", "v4l2", "-video_size", &size, "-i"])
            .arg(&self.device)
            .args(["-vf", &scale, "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Camera(format!("failed to start {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Camera("camera process has no stdout".into()))?;
        tracing::debug!(device = %self.device, size = %size, "camera process started");
        self.child = Some((child, stdout));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if self.child.is_none() {
            self.spawn()?;
        }
        let len = (self.width * self.height * 3) as usize;
        let mut buf = vec![0u8; len];
        let read = match self.child.as_mut() {
            Some((_, stdout)) => stdout.read_exact(&mut buf),
            None => return Err(Error::Camera("camera not running".into())),
        };
        if let Err(e) = read {
            self.release();
            return Err(Error::Camera(format!("frame read failed: {}", e)));
        }
        Frame::from_raw(self.width, self.height, buf)
            .ok_or_else(|| Error::Camera("short frame".into()))
    }
}

impl Camera for FfmpegCamera {
    fn read(&mut self) -> Result<Frame> {
        let result = self.read_frame();
        match &result {
            Ok(_) => {
                if self.health.frame_ok() {
                    tracing::info!(
                        device = %self.device,
                        width = self.width,
                        height = self.height,
                        "camera ready"
                    );
                }
            }
            Err(e) => {
                if self.health.frame_failed() {
                    tracing::warn!(device = %self.device, error = %e, "camera not available, retrying");
                }
            }
        }
        result
    }

    fn release(&mut self) {
        if let Some((mut child, _)) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Largest box by area; the first one wins a tie.
pub fn select_largest(faces: &[FaceBox]) -> Option<FaceBox> {
    faces.iter().fold(None, |best: Option<FaceBox>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(*face),
    })
}

/// Displacement of the face center from the frame center.
pub fn compute_offset(face: &FaceBox, width: u32, height: u32) -> Offset {
    let (cx, cy) = face.center();
    Offset {
        dx: cx - (width / 2) as i32,
        dy: cy - (height / 2) as i32,
    }
}

/// Outline `face` on the frame, clipped to the image bounds.
pub fn draw_box(frame: &mut Frame, face: &FaceBox) {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: i64| v.clamp(0, w as i64 - 1) as u32;
    let clamp_y = |v: i64| v.clamp(0, h as i64 - 1) as u32;
    let x0 = clamp_x(face.x as i64);
    let y0 = clamp_y(face.y as i64);
    let x1 = clamp_x(face.x as i64 + face.w as i64);
    let y1 = clamp_y(face.y as i64 + face.h as i64);

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            frame.put_pixel(x, (y0 + t).min(h - 1), BOX_COLOR);
            frame.put_pixel(x, y1.saturating_sub(t), BOX_COLOR);
        }
        for y in y0..=y1 {
            frame.put_pixel((x0 + t).min(w - 1), y, BOX_COLOR);
            frame.put_pixel(x1.saturating_sub(t), y, BOX_COLOR);
        }
    }
}

/// Capture → detect → actuate → publish, until the bus stops running.
pub struct VisionLoop {
    bus: Arc<StateBus>,
    camera: Box<dyn Camera>,
    detector: Box<dyn FaceDetector>,
    controller: ActuatorController,
}

impl VisionLoop {
    pub fn new(
        bus: Arc<StateBus>,
        camera: Box<dyn Camera>,
        detector: Box<dyn FaceDetector>,
        controller: ActuatorController,
    ) -> Self {
        Self {
            bus,
            camera,
            detector,
            controller,
        }
    }

    pub fn run(mut self) {
        tracing::info!("vision loop started");
        while self.bus.is_running() {
            if self.step() {
                thread::sleep(FRAME_PAUSE);
            } else {
                thread::sleep(CAPTURE_RETRY);
            }
        }
        tracing::info!("closing camera");
        self.camera.release();
        self.controller.stop();
    }

    /// One iteration. Returns false if no frame could be captured.
    pub fn step(&mut self) -> bool {
        let mut frame = match self.camera.read() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "capture failed");
                return false;
            }
        };

        let gray = image::imageops::grayscale(&frame);
        let faces = self.detector.detect(&gray);

        match select_largest(&faces) {
            Some(face) => {
                draw_box(&mut frame, &face);
                if self.bus.is_tracking_enabled() {
                    let (w, h) = frame.dimensions();
                    self.controller.apply(compute_offset(&face, w, h));
                } else {
                    self.controller.stop();
                }
            }
            None => self.controller.stop(),
        }

        self.bus.set_frame(frame);
        true
    }

    pub fn controller(&self) -> &ActuatorController {
        &self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Actuator, Axis, Drive};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedCamera {
        frames: VecDeque<Result<Frame>>,
        released: Arc<Mutex<bool>>,
    }

    impl Camera for ScriptedCamera {
        fn read(&mut self) -> Result<Frame> {
            self.frames
                .pop_front()
                .unwrap_or_else(|| Ok(Frame::new(640, 480)))
        }

        fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    struct ScriptedDetector(VecDeque<Vec<FaceBox>>);

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _gray: &GrayImage) -> Vec<FaceBox> {
            self.0.pop_front().unwrap_or_default()
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Axis, f32)>>>);

    impl Actuator for Recorder {
        fn set_throttle(&mut self, axis: Axis, throttle: f32) -> Result<()> {
            self.0.lock().unwrap().push((axis, throttle));
            Ok(())
        }
    }

    fn face(x: i32, y: i32, w: u32, h: u32) -> FaceBox {
        FaceBox { x, y, w, h }
    }

    fn vision(
        bus: Arc<StateBus>,
        frames: Vec<Result<Frame>>,
        detections: Vec<Vec<FaceBox>>,
    ) -> (VisionLoop, Recorder, Arc<Mutex<bool>>) {
        let rec = Recorder::default();
        let released = Arc::new(Mutex::new(false));
        let camera = ScriptedCamera {
            frames: frames.into(),
            released: released.clone(),
        };
        let controller = ActuatorController::new(Box::new(rec.clone()), 50, 1.0);
        let vl = VisionLoop::new(
            bus,
            Box::new(camera),
            Box::new(ScriptedDetector(detections.into())),
            controller,
        );
        (vl, rec, released)
    }

    #[test]
    fn test_select_largest_first_wins_tie() {
        let faces = [face(0, 0, 10, 10), face(5, 5, 20, 20), face(9, 9, 20, 20)];
        assert_eq!(select_largest(&faces), Some(face(5, 5, 20, 20)));
        assert_eq!(select_largest(&[]), None);
    }

    #[test]
    fn test_offset_from_center() {
        let off = compute_offset(&face(400, 100, 100, 100), 640, 480);
        assert_eq!(off, Offset { dx: 130, dy: -90 });
    }

    #[test]
    fn test_face_drives_motors_and_publishes_annotated_frame() {
        let bus = Arc::new(StateBus::new());
        let (mut vl, _, _) = vision(
            bus.clone(),
            vec![Ok(Frame::new(640, 480))],
            vec![vec![face(500, 300, 60, 60)]],
        );
        assert!(vl.step());
        assert_eq!(vl.controller().state(), (Drive::Reverse, Drive::Forward));
        let published = bus.frame().unwrap();
        assert_eq!(published.get_pixel(500, 300), &BOX_COLOR);
    }

    #[test]
    fn test_no_face_stops_motors() {
        let bus = Arc::new(StateBus::new());
        let (mut vl, rec, _) = vision(
            bus,
            vec![Ok(Frame::new(640, 480)), Ok(Frame::new(640, 480))],
            vec![vec![face(0, 0, 50, 50)], vec![]],
        );
        vl.step();
        assert_eq!(vl.controller().state(), (Drive::Forward, Drive::Reverse));
        rec.0.lock().unwrap().clear();

        vl.step();
        assert_eq!(vl.controller().state(), (Drive::Stop, Drive::Stop));
        let writes = rec.0.lock().unwrap().clone();
        assert_eq!(writes, vec![(Axis::Horizontal, 0.0), (Axis::Vertical, 0.0)]);
    }

    #[test]
    fn test_tracking_disabled_still_annotates_but_stops() {
        let bus = Arc::new(StateBus::new());
        bus.set_tracking_enabled(false);
        let (mut vl, _, _) = vision(
            bus.clone(),
            vec![Ok(Frame::new(640, 480))],
            vec![vec![face(10, 10, 40, 40)]],
        );
        vl.step();
        assert_eq!(vl.controller().state(), (Drive::Stop, Drive::Stop));
        assert_eq!(bus.frame().unwrap().get_pixel(10, 10), &BOX_COLOR);
    }

    #[test]
    fn test_capture_failure_publishes_nothing() {
        let bus = Arc::new(StateBus::new());
        let (mut vl, _, _) = vision(
            bus.clone(),
            vec![Err(Error::Camera("unplugged".into()))],
            vec![],
        );
        assert!(!vl.step());
        assert!(bus.frame().is_none());
    }

    #[test]
    fn test_run_exits_on_shutdown_and_releases() {
        let bus = Arc::new(StateBus::new());
        let rec = Recorder::default();
        let released = Arc::new(Mutex::new(false));

        let (loop_bus, loop_rec, loop_released) = (bus.clone(), rec.clone(), released.clone());
        // The detector is not Send, so the loop is assembled on its own thread.
        let handle = thread::spawn(move || {
            let camera = ScriptedCamera {
                frames: VecDeque::new(),
                released: loop_released,
            };
            let controller = ActuatorController::new(Box::new(loop_rec), 50, 1.0);
            VisionLoop::new(loop_bus, Box::new(camera), Box::new(NoDetector), controller).run();
        });
        thread::sleep(Duration::from_millis(50));
        bus.set_running(false);

        let start = Instant::now();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(*released.lock().unwrap());
        let writes = rec.0.lock().unwrap();
        assert!(writes.len() >= 2);
        assert_eq!(
            writes[writes.len() - 2..],
            [(Axis::Horizontal, 0.0), (Axis::Vertical, 0.0)]
        );
    }

    #[test]
    fn test_capture_health_reports_each_outage_once() {
        let mut health = CaptureHealth::default();
        assert!(health.frame_failed());
        assert!(!health.frame_failed());
        assert!(health.frame_ok());
        assert!(!health.frame_ok());
        assert!(health.frame_failed());
    }

    #[test]
    fn test_camera_process_that_exits_is_not_streaming() {
        // `true` starts fine and exits without writing a frame
        let mut camera = FfmpegCamera::new("true", "/dev/video_missing", 4, 4);
        assert!(camera.read().is_err());
        assert!(!camera.is_streaming());
        assert!(camera.health.warned);

        // Restart is rate limited, the outage stays reported
        assert!(camera.read().is_err());
        assert!(!camera.is_streaming());
        assert!(camera.health.warned);
    }

    #[test]
    fn test_missing_camera_binary_is_reported() {
        let mut camera = FfmpegCamera::new("/nonexistent/ffmpeg", "/dev/video0", 4, 4);
        assert!(matches!(camera.read(), Err(Error::Camera(_))));
        assert!(camera.health.warned);
    }

    #[test]
    fn test_draw_box_clips_to_frame() {
        let mut frame = Frame::new(20, 20);
        draw_box(&mut frame, &face(-5, 15, 40, 40));
        assert_eq!(frame.get_pixel(0, 15), &BOX_COLOR);
        assert_eq!(frame.get_pixel(19, 19), &BOX_COLOR);
    }
}
