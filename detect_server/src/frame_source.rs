//! Camera acquisition on a dedicated thread.
//!
//! The acquisition thread is the only writer of a single-slot buffer holding the latest frame.
//! Readers clone an `Arc` to the frame under the buffer lock, so they either see nothing or a
//! complete frame and never wait for the device.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use common::protocol::CameraStatus;
use image::RgbImage;

use crate::{
    config::CameraConfig,
    error::CameraError,
    meter::Meter,
    sensors::{CaptureFn, OpenFn},
};

/// Pause between two capture attempts of the acquisition loop.
pub const ACQUISITION_THROTTLE: Duration = Duration::from_millis(10);

/// A captured frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    /// Position of the frame in the current capture session, starting at 1.
    pub seq: u64,
    pub captured_at: Instant,
}

struct Worker {
    handle: JoinHandle<()>,
}

/// Owner of a capture device and the latest frame it delivered.
pub struct FrameSource {
    config: CameraConfig,
    opener: OpenFn,
    meter: Arc<Meter>,
    worker: Mutex<Option<Worker>>,
    running: Arc<AtomicBool>,
    buffer: Arc<Mutex<Option<Frame>>>,
    frames_captured: Arc<AtomicU64>,
}

impl FrameSource {
    pub fn new(config: CameraConfig, opener: OpenFn, meter: Arc<Meter>) -> Self {
        Self {
            config,
            opener,
            meter,
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            buffer: Arc::new(Mutex::new(None)),
            frames_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Open the device and start the acquisition thread.
    ///
    /// Returns immediately with `Ok` if the source is already running. On failure the source
    /// stays stopped and no thread is spawned. A thread that exited on its own is joined and
    /// replaced.
    pub fn start(&self) -> Result<(), CameraError> {
        let mut worker = lock(&self.worker);
        match worker.take() {
            Some(current) if self.is_running() => {
                *worker = Some(current);
                return Ok(());
            }
            Some(finished) => self.join(finished),
            None => {}
        }

        let device = self.config.device.clone();
        let unavailable = |reason: String| CameraError::DeviceUnavailable {
            device: device.clone(),
            reason,
        };

        let capture = (self.opener)(&self.config).map_err(|err| unavailable(format!("{err:#}")))?;

        *lock(&self.buffer) = None;
        self.running.store(true, Ordering::Release);

        let acquisition = Acquisition {
            device: device.clone(),
            running: Arc::clone(&self.running),
            buffer: Arc::clone(&self.buffer),
            frames_captured: Arc::clone(&self.frames_captured),
            meter: Arc::clone(&self.meter),
        };
        let handle = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || acquisition.run(capture))
            .map_err(|err| {
                self.running.store(false, Ordering::Release);
                unavailable(format!("failed to spawn acquisition thread: {err}"))
            })?;

        *worker = Some(Worker { handle });
        log::info!(
            "Camera {} started: {}x{} @ {}fps",
            &device,
            self.config.width,
            self.config.height,
            self.config.fps
        );

        Ok(())
    }

    /// Latest captured frame, `None` before the first successful capture.
    pub fn read(&self) -> Option<Frame> {
        lock(&self.buffer).clone()
    }

    /// Stop the acquisition thread and release the device. No-op if already stopped.
    pub fn stop(&self) {
        let mut slot = lock(&self.worker);
        let Some(worker) = slot.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        self.join(worker);
        *lock(&self.buffer) = None;

        log::info!("Camera {} stopped", &self.config.device);
    }

    fn join(&self, worker: Worker) {
        if worker.handle.join().is_err() {
            log::error!("Acquisition thread of camera {} panicked", &self.config.device);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Frames captured since the source was created.
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            device: self.config.device.clone(),
            running: self.is_running(),
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            frames_captured: self.frames_captured(),
            has_frame: lock(&self.buffer).is_some(),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the acquisition thread.
struct Acquisition {
    device: String,
    running: Arc<AtomicBool>,
    buffer: Arc<Mutex<Option<Frame>>>,
    frames_captured: Arc<AtomicU64>,
    meter: Arc<Meter>,
}

impl Acquisition {
    fn run(self, mut capture: CaptureFn) {
        let mut seq = 0;

        while self.running.load(Ordering::Acquire) {
            match capture() {
                Ok(image) => {
                    seq += 1;
                    let frame = Frame {
                        image: Arc::new(image),
                        seq,
                        captured_at: Instant::now(),
                    };
                    *lock(&self.buffer) = Some(frame);

                    self.frames_captured.fetch_add(1, Ordering::Relaxed);
                    self.meter.tick_captured();
                }
                Err(err) => {
                    // Previous frame stays visible until the device recovers
                    log::debug!("Capture on {} failed: {err:#}", &self.device);
                }
            }

            thread::sleep(ACQUISITION_THROTTLE);
        }

        // Releases the device
        drop(capture);
    }
}

impl Drop for Acquisition {
    /// Runs on every exit of the acquisition thread, unwinding included.
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if thread::panicking() {
            log::error!("Acquisition loop of {} aborted by a panic", &self.device);
        } else {
            log::debug!("Acquisition loop of {} exited", &self.device);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
