use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::media::{RawImage, VideoTrack};
use crate::transport::{ClientMessage, TransportSink, IMAGE_MIME};

/// Shortest capture interval the pipeline will tick at
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Vision capture parameters
#[derive(Debug, Clone)]
pub struct VisionCaptureConfig {
    /// Time between captures
    pub interval: Duration,
    /// Longest edge of the encoded image in pixels
    pub max_dimension: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for VisionCaptureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_dimension: 640,
            jpeg_quality: 70,
        }
    }
}

/// Admits at most one encode+send at a time
#[derive(Debug, Clone, Default)]
pub struct InFlightGate {
    busy: Arc<AtomicBool>,
}

/// Releases the gate when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    busy: Arc<AtomicBool>,
}

impl InFlightGate {
    /// Enter the gate, or `None` if a capture is still in flight
    pub fn try_enter(&self) -> Option<InFlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Downscale to fit `max_dimension` and encode as JPEG
pub fn encode_jpeg(frame: &RawImage, max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone())
        .context("Frame buffer does not match its dimensions")?;

    let longest = frame.width.max(frame.height);
    let image = if longest > max_dimension && max_dimension > 0 {
        let scale = max_dimension as f64 / longest as f64;
        let width = ((frame.width as f64 * scale).round() as u32).max(1);
        let height = ((frame.height as f64 * scale).round() as u32).max(1);
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    } else {
        image
    };

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100))
        .encode_image(&image)
        .context("Failed to encode JPEG")?;

    Ok(encoded)
}

/// Periodically sends a compressed video frame to the active transport.
///
/// If the previous capture is still encoding when the next tick fires, the
/// tick is skipped rather than queued.
pub struct VisionCapturePipeline {
    config: VisionCaptureConfig,
    task: Option<JoinHandle<()>>,
    gate: InFlightGate,
    sent: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl VisionCapturePipeline {
    pub fn new(config: VisionCaptureConfig) -> Self {
        Self {
            config,
            task: None,
            gate: InFlightGate::default(),
            sent: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start capturing from `track`. Returns `false` if already running.
    pub fn start(
        &mut self,
        track: Arc<dyn VideoTrack>,
        sink: watch::Receiver<Option<TransportSink>>,
    ) -> bool {
        if self.is_running() {
            debug!("Vision capture already running");
            return false;
        }

        let config = self.config.clone();
        let gate = self.gate.clone();
        let sent = Arc::clone(&self.sent);
        let skipped = Arc::clone(&self.skipped);

        info!(
            "Vision capture started on {} (every {}ms, max {}px)",
            track.label(),
            config.interval.as_millis(),
            config.max_dimension
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if !track.is_live() {
                    warn!("Video track {} is no longer live", track.label());
                    break;
                }

                let Some(guard) = gate.try_enter() else {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    debug!("Previous frame still in flight, skipping capture");
                    continue;
                };

                let Some(frame) = track.grab_frame() else {
                    continue;
                };

                let sink = sink.clone();
                let sent = Arc::clone(&sent);
                let (max_dimension, quality) = (config.max_dimension, config.jpeg_quality);

                tokio::spawn(async move {
                    let _guard = guard;
                    let encoded = tokio::task::spawn_blocking(move || {
                        encode_jpeg(&frame, max_dimension, quality)
                    })
                    .await;

                    match encoded {
                        Ok(Ok(jpeg)) => {
                            let message = ClientMessage::media(&jpeg, IMAGE_MIME);
                            let current = sink.borrow().clone();
                            if current.map(|s| s.send(message)).unwrap_or(false) {
                                sent.fetch_add(1, Ordering::Relaxed);
                            } else {
                                debug!("Dropped video frame (transport not open)");
                            }
                        }
                        Ok(Err(e)) => warn!("Failed to encode video frame: {:#}", e),
                        Err(e) => warn!("Video encode task failed: {}", e),
                    }
                });
            }
        }));

        true
    }

    /// Stop capturing. The track itself is left running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Vision capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for VisionCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
