use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::reconnect::ReconnectConfig;
use crate::capture::{AudioCaptureConfig, VisionCaptureConfig};

/// Configuration for a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Chat session the finalized messages belong to
    pub session_id: String,

    /// Outbound microphone sample rate (the endpoint expects 16kHz mono)
    pub audio_sample_rate: u32,

    /// Samples per outbound microphone frame
    pub audio_frame_size: usize,

    /// Sample rate of inbound assistant audio
    pub playback_sample_rate: u32,

    /// Milliseconds between vision captures
    pub vision_interval_ms: u64,

    /// Longest edge of outbound images in pixels
    pub vision_max_dimension: u32,

    /// JPEG quality of outbound images
    pub jpeg_quality: u8,

    /// Safety timeout finalizing a turn that never completes
    pub transcript_timeout_ms: u64,

    /// First reconnect delay
    pub reconnect_base_ms: u64,

    /// Upper bound for the exponential part of the reconnect delay
    pub reconnect_max_ms: u64,

    /// Random extra delay added to each reconnect
    pub reconnect_jitter_ms: u64,

    /// Consecutive failed reconnects before giving up (0 = never give up)
    pub reconnect_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("live-{}", uuid::Uuid::new_v4()),
            audio_sample_rate: 16000,
            audio_frame_size: 4096,
            playback_sample_rate: 24000,
            vision_interval_ms: 1000,
            vision_max_dimension: 640,
            jpeg_quality: 70,
            transcript_timeout_ms: 12_000,
            reconnect_base_ms: 250,
            reconnect_max_ms: 8_000,
            reconnect_jitter_ms: 250,
            reconnect_max_attempts: 6,
        }
    }
}

impl SessionConfig {
    /// Reject values the capture and playback pipelines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            bail!("session.session_id must not be empty");
        }
        if self.audio_sample_rate == 0 {
            bail!("session.audio_sample_rate must be greater than zero");
        }
        if self.audio_frame_size == 0 {
            bail!("session.audio_frame_size must be greater than zero");
        }
        if self.playback_sample_rate == 0 {
            bail!("session.playback_sample_rate must be greater than zero");
        }
        if self.vision_interval_ms == 0 {
            bail!("session.vision_interval_ms must be greater than zero");
        }
        if self.vision_max_dimension == 0 {
            bail!("session.vision_max_dimension must be greater than zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!(
                "session.jpeg_quality must be between 1 and 100, got {}",
                self.jpeg_quality
            );
        }
        if self.transcript_timeout_ms == 0 {
            bail!("session.transcript_timeout_ms must be greater than zero");
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            bail!(
                "session.reconnect_max_ms ({}) is below reconnect_base_ms ({})",
                self.reconnect_max_ms,
                self.reconnect_base_ms
            );
        }
        Ok(())
    }

    pub fn audio_capture(&self) -> AudioCaptureConfig {
        AudioCaptureConfig {
            sample_rate: self.audio_sample_rate,
            frame_size: self.audio_frame_size,
        }
    }

    pub fn vision_capture(&self) -> VisionCaptureConfig {
        VisionCaptureConfig {
            interval: Duration::from_millis(self.vision_interval_ms),
            max_dimension: self.vision_max_dimension,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn transcript_timeout(&self) -> Duration {
        Duration::from_millis(self.transcript_timeout_ms)
    }
}
