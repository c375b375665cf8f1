use std::sync::Arc;

use tracing::{info, warn};

use super::device::{AudioTrack, DeviceKind, MediaDevices, MediaTrack, VideoTrack};
use crate::error::{DeviceError, SessionError};

/// Acquires and holds the session's camera/screen and microphone tracks.
///
/// Each device is requested independently: a denial on one never releases
/// or blocks the other. A held track that is still live is reused instead of
/// prompting again.
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
    video: Option<Arc<dyn VideoTrack>>,
    audio: Option<Arc<dyn AudioTrack>>,
}

impl MediaAcquirer {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            video: None,
            audio: None,
        }
    }

    /// Return a live video track, requesting one only if none is held
    pub async fn acquire_video(&mut self) -> Result<Arc<dyn VideoTrack>, SessionError> {
        if let Some(track) = self.video.as_ref().filter(|t| t.is_live()) {
            return Ok(Arc::clone(track));
        }
        if let Some(stale) = self.video.take() {
            stale.stop();
        }

        match self.devices.acquire_video().await {
            Ok(track) => {
                info!("Acquired {} track: {}", DeviceKind::Video.label(), track.label());
                self.video = Some(Arc::clone(&track));
                Ok(track)
            }
            Err(e) => Err(Self::denial(DeviceKind::Video, e)),
        }
    }

    /// Return a live microphone track, requesting one only if none is held
    pub async fn acquire_audio(&mut self) -> Result<Arc<dyn AudioTrack>, SessionError> {
        if let Some(track) = self.audio.as_ref().filter(|t| t.is_live()) {
            return Ok(Arc::clone(track));
        }
        if let Some(stale) = self.audio.take() {
            stale.stop();
        }

        match self.devices.acquire_audio().await {
            Ok(track) => {
                info!(
                    "Acquired {} track: {}",
                    DeviceKind::Microphone.label(),
                    track.label()
                );
                self.audio = Some(Arc::clone(&track));
                Ok(track)
            }
            Err(e) => Err(Self::denial(DeviceKind::Microphone, e)),
        }
    }

    /// Currently held video track, if it is still live
    pub fn video(&self) -> Option<Arc<dyn VideoTrack>> {
        self.video.as_ref().filter(|t| t.is_live()).cloned()
    }

    /// Currently held microphone track, if it is still live
    pub fn audio(&self) -> Option<Arc<dyn AudioTrack>> {
        self.audio.as_ref().filter(|t| t.is_live()).cloned()
    }

    /// Devices with a live track
    pub fn held(&self) -> Vec<DeviceKind> {
        let mut held = Vec::new();
        if self.video().is_some() {
            held.push(DeviceKind::Video);
        }
        if self.audio().is_some() {
            held.push(DeviceKind::Microphone);
        }
        held
    }

    /// Stop and forget every held track
    pub fn release_all(&mut self) {
        if let Some(track) = self.video.take() {
            info!("Releasing {} track: {}", DeviceKind::Video.label(), track.label());
            track.stop();
        }
        if let Some(track) = self.audio.take() {
            info!(
                "Releasing {} track: {}",
                DeviceKind::Microphone.label(),
                track.label()
            );
            track.stop();
        }
    }

    fn denial(device: DeviceKind, err: DeviceError) -> SessionError {
        warn!("Failed to acquire {}: {}", device.label(), err);
        // Unavailable devices surface as denials too
        SessionError::PermissionDenied { device }
    }
}
