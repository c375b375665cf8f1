use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DeviceError;

/// Capture device type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Camera or screen share
    Video,
    /// Microphone input
    Microphone,
}

impl DeviceKind {
    /// Human readable name used in user-facing errors
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Video => "camera/screen",
            DeviceKind::Microphone => "microphone",
        }
    }
}

/// Raw microphone samples as delivered by the device (f32, interleaved)
#[derive(Debug, Clone)]
pub struct SampleBlock {
    /// Samples in [-1.0, 1.0], interleaved
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
}

/// Uncompressed RGB8 image grabbed from a video track
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8 pixels, `width * height * 3` bytes
    pub pixels: Vec<u8>,
}

/// A live device track.
///
/// Tracks are shared between the session controller (which owns their
/// lifecycle) and the capture pipeline consuming them. Only the controller
/// calls `stop`.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Whether the underlying device is still delivering data
    fn is_live(&self) -> bool;

    /// Release the device. After this `is_live` must report false.
    fn stop(&self);

    /// Device label for logging
    fn label(&self) -> &str;
}

/// Microphone track
pub trait AudioTrack: MediaTrack {
    /// Attach a reader to the track.
    ///
    /// Returns a channel receiving sample blocks until the track stops.
    fn open_reader(&self) -> Result<mpsc::Receiver<SampleBlock>>;
}

/// Camera or screen track
pub trait VideoTrack: MediaTrack {
    /// Grab the most recent frame, if one is available
    fn grab_frame(&self) -> Option<RawImage>;
}

/// Platform capture API
///
/// Implementations:
/// - `FileMediaDevices`: WAV file microphone + still image camera (headless runs)
/// - Test doubles in the integration tests
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request camera/screen access
    async fn acquire_video(&self) -> Result<Arc<dyn VideoTrack>, DeviceError>;

    /// Request microphone access
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioTrack>, DeviceError>;
}
