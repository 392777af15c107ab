use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::error::DetectionError;

/// A captured frame, JPEG-encoded and ready to ship to a recognition backend.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl EncodedFrame {
    pub fn encode(image: &DynamicImage, quality: u8) -> Result<Self, DetectionError> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
            .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)?;

        Ok(Self {
            jpeg,
            width,
            height,
            captured_at: Utc::now(),
        })
    }

    /// Wraps bytes that are already JPEG-encoded (e.g. an image read from disk).
    pub fn from_jpeg(jpeg: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            jpeg,
            width,
            height,
            captured_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.jpeg)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.to_base64())
    }
}

/// Anything that can hand out the most recent video frame.
///
/// Implementations are created and used on the capture thread only, so they
/// need not be `Send`.
pub trait FrameGrabber {
    fn grab(&mut self) -> Result<DynamicImage>;
}

/// Builds the grabber on the capture thread. Failure means no camera.
pub type GrabberFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameGrabber>> + Send>;

/// Frame callback invoked on the capture thread for every encoded tick.
pub type FrameCallback = Box<dyn Fn(EncodedFrame) + Send>;

/// Physical camera backed by nokhwa.
pub struct NokhwaGrabber {
    camera: Camera,
    camera_id: u32,
}

impl NokhwaGrabber {
    /// Opens the configured device, falling back to any other detected camera.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!("📷 Scanning for available cameras");

        let available = Self::detect_cameras();
        if available.is_empty() {
            return Err(anyhow!("No cameras detected on this system"));
        }
        info!("Found {} camera(s): {:?}", available.len(), available);

        let candidates = if available.contains(&config.camera_device) {
            vec![config.camera_device]
        } else {
            available
        };

        for camera_id in candidates {
            match Self::try_open(camera_id, config) {
                Ok(grabber) => {
                    info!("✅ Camera {} streaming", camera_id);
                    return Ok(grabber);
                }
                Err(e) => warn!("Failed to initialize camera {}: {}", camera_id, e),
            }
        }

        Err(anyhow!("Camera access denied or not available"))
    }

    fn try_open(camera_id: u32, config: &CaptureConfig) -> Result<Self> {
        let format = CameraFormat::new(
            Resolution::new(config.width, config.height),
            FrameFormat::MJPEG,
            30,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(CameraIndex::Index(camera_id), requested)?;
        camera.open_stream()?;

        // A first frame proves the stream actually delivers data
        let _probe = camera.frame()?;

        Ok(Self { camera, camera_id })
    }

    pub fn detect_cameras() -> Vec<u32> {
        (0..10)
            .filter(|&cam_id| {
                let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
                Camera::new(CameraIndex::Index(cam_id), requested).is_ok()
            })
            .collect()
    }
}

impl FrameGrabber for NokhwaGrabber {
    fn grab(&mut self) -> Result<DynamicImage> {
        let frame = self.camera.frame()?;
        let decoded = frame.decode_image::<RgbFormat>()?;
        debug!("Captured camera frame: {}x{}", decoded.width(), decoded.height());
        Ok(DynamicImage::ImageRgb8(decoded))
    }
}

impl Drop for NokhwaGrabber {
    fn drop(&mut self) {
        match self.camera.stop_stream() {
            Ok(_) => info!("Camera {} stream released", self.camera_id),
            Err(e) => warn!("Error stopping camera {} stream: {}", self.camera_id, e),
        }
    }
}

/// Solid-color frames for headless runs and tests.
pub struct TestPatternGrabber {
    width: u32,
    height: u32,
    tick: u8,
}

impl TestPatternGrabber {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, tick: 0 }
    }
}

impl FrameGrabber for TestPatternGrabber {
    fn grab(&mut self) -> Result<DynamicImage> {
        self.tick = self.tick.wrapping_add(16);
        let shade = self.tick;
        let image = image::RgbImage::from_pixel(self.width, self.height, image::Rgb([shade, 96, 255 - shade]));
        Ok(DynamicImage::ImageRgb8(image))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSourceState {
    /// Camera acquired, no ticks scheduled.
    Ready,
    /// Ticking and emitting frames.
    Capturing,
    /// No camera; nothing will be captured until `retry`.
    Unavailable(String),
}

enum Command {
    Start(FrameCallback),
    Stop,
    Shutdown,
}

struct CaptureWorker {
    commands: Sender<Command>,
    handle: JoinHandle<()>,
}

impl CaptureWorker {
    fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if self.handle.join().is_err() {
            error!("Capture thread panicked during shutdown");
        }
    }
}

type FactoryFn = Arc<dyn Fn() -> GrabberFactory + Send + Sync>;

/// Camera acquisition prepared under the source's lock and run outside it.
///
/// Opening a device can take seconds while drivers are probed, so callers
/// that share a `FrameSource` run [`PendingAcquire::acquire`] without holding
/// the lock and hand the result back through [`FrameSource::install`].
pub struct PendingAcquire {
    factory: FactoryFn,
    config: CaptureConfig,
}

/// Result of a camera acquisition, ready to be installed.
pub struct AcquiredCamera(std::result::Result<CaptureWorker, String>);

impl PendingAcquire {
    /// Spawns the capture thread and blocks until the grabber is open or has failed.
    pub fn acquire(self) -> AcquiredCamera {
        let (command_tx, command_rx) = channel::unbounded();
        let (ready_tx, ready_rx) = channel::bounded::<Result<(), String>>(1);
        let factory = (self.factory)();
        let config = self.config;

        let spawned = std::thread::Builder::new()
            .name("visionwatch-capture".to_string())
            .spawn(move || capture_thread(factory, config, command_rx, ready_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn capture thread: {}", e);
                return AcquiredCamera(Err(e.to_string()));
            }
        };

        let outcome = match ready_rx.recv() {
            Ok(Ok(())) => return AcquiredCamera(Ok(CaptureWorker { commands: command_tx, handle })),
            Ok(Err(reason)) => reason,
            Err(_) => "capture thread exited".to_string(),
        };
        let _ = handle.join();
        AcquiredCamera(Err(outcome))
    }
}

/// Owns the camera on a dedicated thread and ticks it on a fixed period.
pub struct FrameSource {
    config: CaptureConfig,
    factory: FactoryFn,
    worker: Option<CaptureWorker>,
    state: Mutex<FrameSourceState>,
}

impl FrameSource {
    /// Acquires the camera through `factory`. An acquisition failure leaves the
    /// source in `Unavailable` rather than returning an error.
    pub fn open<F>(config: CaptureConfig, factory: F) -> Self
    where
        F: Fn() -> GrabberFactory + Send + Sync + 'static,
    {
        let mut source = Self {
            config,
            factory: Arc::new(factory),
            worker: None,
            state: Mutex::new(FrameSourceState::Unavailable("not opened".to_string())),
        };
        source.acquire();
        source
    }

    /// Frame source for the physical camera selected in `config`.
    pub fn camera(config: CaptureConfig) -> Self {
        let grabber_config = config.clone();
        Self::open(config, move || -> GrabberFactory {
            let config = grabber_config.clone();
            Box::new(move || {
                NokhwaGrabber::open(&config).map(|g| Box::new(g) as Box<dyn FrameGrabber>)
            })
        })
    }

    /// A source with no device behind it, e.g. for one-shot image analysis.
    pub fn detached(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let message = reason.clone();
        Self {
            config: CaptureConfig::default(),
            factory: Arc::new(move || -> GrabberFactory {
                let message = message.clone();
                Box::new(move || -> Result<Box<dyn FrameGrabber>> { Err(anyhow!(message)) })
            }),
            worker: None,
            state: Mutex::new(FrameSourceState::Unavailable(reason)),
        }
    }

    /// Frame source that renders a test pattern instead of opening a device.
    pub fn test_pattern(config: CaptureConfig) -> Self {
        let (width, height) = (config.width, config.height);
        Self::open(config, move || -> GrabberFactory {
            Box::new(move || Ok(Box::new(TestPatternGrabber::new(width, height)) as Box<dyn FrameGrabber>))
        })
    }

    pub fn state(&self) -> FrameSourceState {
        self.state.lock().clone()
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.state(), FrameSourceState::Unavailable(_))
    }

    /// Re-attempts acquisition after the camera was unavailable.
    pub fn retry(&mut self) -> FrameSourceState {
        match self.prepare_retry() {
            Some(pending) => {
                let acquired = pending.acquire();
                self.install(acquired)
            }
            None => self.state(),
        }
    }

    /// First half of a retry: `None` when the camera is already held.
    pub fn prepare_retry(&self) -> Option<PendingAcquire> {
        if self.is_available() {
            return None;
        }
        Some(self.pending_acquire())
    }

    /// Second half of a retry. If another acquisition won the race, the newly
    /// opened camera is released again.
    pub fn install(&mut self, acquired: AcquiredCamera) -> FrameSourceState {
        match acquired.0 {
            Ok(worker) if self.worker.is_some() => {
                debug!("Camera already acquired, releasing duplicate");
                worker.shutdown();
            }
            Ok(worker) => {
                self.worker = Some(worker);
                *self.state.lock() = FrameSourceState::Ready;
            }
            Err(reason) => {
                warn!("📷 Camera unavailable: {}", reason);
                *self.state.lock() = FrameSourceState::Unavailable(reason);
            }
        }
        self.state()
    }

    /// Begins periodic capture. Calling it again while capturing keeps the
    /// existing timer and swaps in the new callback.
    pub fn start(&self, on_frame: FrameCallback) -> Result<(), DetectionError> {
        let worker = self.worker.as_ref().ok_or_else(|| match self.state() {
            FrameSourceState::Unavailable(reason) => DetectionError::Permission(reason),
            _ => DetectionError::Permission("camera not acquired".to_string()),
        })?;

        worker
            .commands
            .send(Command::Start(on_frame))
            .map_err(|_| DetectionError::Permission("capture thread has exited".to_string()))?;
        *self.state.lock() = FrameSourceState::Capturing;
        Ok(())
    }

    /// Halts periodic capture; the camera stays acquired.
    pub fn stop(&self) {
        if let Some(worker) = &self.worker {
            let _ = worker.commands.send(Command::Stop);
            *self.state.lock() = FrameSourceState::Ready;
        }
    }

    fn pending_acquire(&self) -> PendingAcquire {
        PendingAcquire {
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
        }
    }

    fn acquire(&mut self) {
        let acquired = self.pending_acquire().acquire();
        self.install(acquired);
    }

    fn release(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if self.worker.is_some() {
            info!("FrameSource being dropped, releasing camera");
            self.release();
        }
    }
}

enum Event {
    Command(Option<Command>),
    Tick,
}

fn capture_thread(
    factory: GrabberFactory,
    config: CaptureConfig,
    commands: Receiver<Command>,
    ready: Sender<Result<(), String>>,
) {
    let mut grabber = match factory() {
        Ok(grabber) => {
            let _ = ready.send(Ok(()));
            grabber
        }
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let period = Duration::from_millis(config.interval_ms.max(1));
    let mut ticker: Receiver<Instant> = channel::never();
    let mut on_frame: Option<FrameCallback> = None;

    loop {
        let event = channel::select! {
            recv(commands) -> command => Event::Command(command.ok()),
            recv(ticker) -> _ => Event::Tick,
        };

        match event {
            Event::Command(Some(Command::Start(callback))) => {
                if on_frame.is_none() {
                    ticker = channel::tick(period);
                    info!("▶️ Frame capture started ({}ms period)", period.as_millis());
                }
                on_frame = Some(callback);
            }
            Event::Command(Some(Command::Stop)) => {
                if on_frame.take().is_some() {
                    info!("⏸️ Frame capture stopped");
                }
                ticker = channel::never();
            }
            Event::Command(Some(Command::Shutdown)) | Event::Command(None) => break,
            Event::Tick => {
                let Some(callback) = on_frame.as_ref() else {
                    continue;
                };
                match grabber.grab() {
                    Ok(image) => match EncodedFrame::encode(&image, config.jpeg_quality) {
                        Ok(frame) => callback(frame),
                        Err(e) => warn!("Frame encoding failed: {}", e),
                    },
                    Err(e) => warn!("Frame capture failed: {}", e),
                }
            }
        }
    }

    // Grabber drops here, releasing the device on every exit path
    drop(grabber);
    debug!("Capture thread exiting");
}
