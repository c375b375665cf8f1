// File-backed capture devices for headless runs
//
// The microphone replays a WAV file in real time (looping), the camera
// serves a still image. A device without a configured path reports a
// permission denial, exactly like a user refusing the prompt.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hound::WavReader;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::device::{
    AudioTrack, DeviceKind, MediaDevices, MediaTrack, RawImage, SampleBlock, VideoTrack,
};
use crate::error::DeviceError;

/// Duration of each block delivered by the WAV microphone
const BLOCK_DURATION_MS: u64 = 100;

/// Decoded WAV contents
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            bail!(
                "Unsupported WAV format: {:?} {}-bit (expected 16-bit PCM)",
                spec.sample_format,
                spec.bits_per_sample
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        if samples.is_empty() {
            bail!("WAV file contains no samples: {}", path.display());
        }

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }
}

/// Microphone track replaying a WAV file in real time
pub struct WavMicrophoneTrack {
    file: Arc<AudioFile>,
    live: Arc<AtomicBool>,
}

impl WavMicrophoneTrack {
    pub fn new(file: AudioFile) -> Self {
        Self {
            file: Arc::new(file),
            live: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MediaTrack for WavMicrophoneTrack {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Microphone
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn label(&self) -> &str {
        &self.file.path
    }
}

impl AudioTrack for WavMicrophoneTrack {
    fn open_reader(&self) -> Result<mpsc::Receiver<SampleBlock>> {
        if !self.is_live() {
            bail!("Microphone track {} is stopped", self.file.path);
        }

        let (tx, rx) = mpsc::channel(16);
        let file = Arc::clone(&self.file);
        let live = Arc::clone(&self.live);

        let block_len = (file.sample_rate as u64 * BLOCK_DURATION_MS / 1000) as usize
            * file.channels as usize;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(BLOCK_DURATION_MS));
            let mut offset = 0usize;

            while live.load(Ordering::SeqCst) {
                ticker.tick().await;

                let end = (offset + block_len).min(file.samples.len());
                let samples = file.samples[offset..end]
                    .iter()
                    .map(|&s| s as f32 / 32768.0)
                    .collect();
                offset = if end >= file.samples.len() { 0 } else { end };

                let block = SampleBlock {
                    samples,
                    sample_rate: file.sample_rate,
                    channels: file.channels,
                };
                if tx.send(block).await.is_err() {
                    break;
                }
            }

            debug!("WAV microphone reader for {} finished", file.path);
        });

        Ok(rx)
    }
}

/// Camera track serving a still image
pub struct StillImageTrack {
    label: String,
    frame: RawImage,
    live: AtomicBool,
}

impl StillImageTrack {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?
            .to_rgb8();

        info!(
            "Still image camera loaded: {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );

        Ok(Self {
            label: path.display().to_string(),
            frame: RawImage {
                width: image.width(),
                height: image.height(),
                pixels: image.into_raw(),
            },
            live: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for StillImageTrack {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Video
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl VideoTrack for StillImageTrack {
    fn grab_frame(&self) -> Option<RawImage> {
        self.is_live().then(|| self.frame.clone())
    }
}

/// Device backend serving configured files
#[derive(Debug, Clone, Default)]
pub struct FileMediaDevices {
    pub microphone_wav: Option<PathBuf>,
    pub camera_image: Option<PathBuf>,
}

impl FileMediaDevices {
    pub fn new(microphone_wav: Option<PathBuf>, camera_image: Option<PathBuf>) -> Self {
        Self {
            microphone_wav,
            camera_image,
        }
    }
}

#[async_trait::async_trait]
impl MediaDevices for FileMediaDevices {
    async fn acquire_video(&self) -> Result<Arc<dyn VideoTrack>, DeviceError> {
        let path = self
            .camera_image
            .clone()
            .ok_or(DeviceError::PermissionDenied)?;

        let track = tokio::task::spawn_blocking(move || StillImageTrack::open(path))
            .await
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .map_err(|e| DeviceError::Unavailable(format!("{:#}", e)))?;

        Ok(Arc::new(track))
    }

    async fn acquire_audio(&self) -> Result<Arc<dyn AudioTrack>, DeviceError> {
        let path = self
            .microphone_wav
            .clone()
            .ok_or(DeviceError::PermissionDenied)?;

        let file = tokio::task::spawn_blocking(move || AudioFile::open(path))
            .await
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .map_err(|e| DeviceError::Unavailable(format!("{:#}", e)))?;

        Ok(Arc::new(WavMicrophoneTrack::new(file)))
    }
}
