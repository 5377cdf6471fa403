//! Frame rate bookkeeping.
//!
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

/// Counters shared by the acquisition thread and the request handlers.
#[derive(Debug, Default)]
pub struct Meter {
    captured_frames: AtomicU64,
    streamed_frames: AtomicU64,
    infered_frames: AtomicU64,
    detections_total: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured_frames: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
            infered_frames: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one inference pass and the detections it reported.
    pub fn tick_infered(&self, detections: usize) {
        self.infered_frames.fetch_add(1, Ordering::Relaxed);
        self.detections_total
            .fetch_add(detections as u64, Ordering::Relaxed);
    }

    pub fn get_reset_captured(&self) -> u64 {
        self.captured_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_infered(&self) -> u64 {
        self.infered_frames.swap(0, Ordering::Relaxed)
    }

    /// Detections reported since startup, never reset.
    pub fn detections_total(&self) -> u64 {
        self.detections_total.load(Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger(meter: Arc<Meter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let captured_frames = meter.get_reset_captured();
            let streamed_frames = meter.get_reset_streamed();
            let infered_frames = meter.get_reset_infered();
            let elapsed = start.elapsed().as_secs_f32();

            if captured_frames > 0 {
                let fps = captured_frames as f32 / elapsed;
                log::info!("Captured frames per second: {fps:.2}")
            }
            if streamed_frames > 0 {
                let fps = streamed_frames as f32 / elapsed;
                log::info!("Streamed frames per second: {fps:.2}")
            }
            if infered_frames > 0 {
                let fps = infered_frames as f32 / elapsed;
                log::info!("Infered frames per second: {fps:.2}")
            }
        }
    })
}
