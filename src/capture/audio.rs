use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::{AudioTrack, SampleBlock};
use crate::transport::{ClientMessage, TransportSink, INPUT_AUDIO_MIME};

/// Microphone capture parameters
#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    /// Wire sample rate (mono)
    pub sample_rate: u32,
    /// Samples per outbound frame
    pub frame_size: usize,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 4096,
        }
    }
}

/// Counters shared with the capture task
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

/// Converts device sample blocks into fixed-size mono PCM frames
pub struct FrameAssembler {
    target_rate: u32,
    frame_size: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    /// A zero `frame_size` is treated as one sample per frame.
    pub fn new(target_rate: u32, frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            target_rate,
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Feed a block, returning every frame it completed
    pub fn push(&mut self, block: &SampleBlock) -> Vec<Vec<i16>> {
        let mono = downmix(&block.samples, block.channels);
        let resampled = resample(&mono, block.sample_rate, self.target_rate);
        self.pending.extend(resampled.into_iter().map(to_i16));

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            frames.push(self.pending.drain(..self.frame_size).collect());
        }
        frames
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved channels into mono
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio.
///
/// Integer downsampling ratios decimate (every Nth sample), anything else
/// interpolates linearly.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || to_rate == 0 {
        return samples.to_vec();
    }

    if from_rate > to_rate && from_rate % to_rate == 0 {
        let ratio = (from_rate / to_rate) as usize;
        return samples.iter().step_by(ratio).copied().collect();
    }

    let step = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / step).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

/// Convert a float sample to 16-bit PCM, clamping out-of-range input
pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Serialize samples as 16-bit little-endian PCM
pub fn to_pcm16le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Streams microphone audio to the active transport.
///
/// Frames go straight to the transport; there is no queue. A frame that
/// cannot be sent (no transport, transport closed, buffer full) is dropped.
pub struct AudioCapturePipeline {
    config: AudioCaptureConfig,
    task: Option<JoinHandle<()>>,
    counters: Arc<CaptureCounters>,
}

impl AudioCapturePipeline {
    pub fn new(config: AudioCaptureConfig) -> Self {
        Self {
            config,
            task: None,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Attach to `track` and start forwarding frames.
    ///
    /// Returns `false` without touching the track if already running.
    pub fn start(
        &mut self,
        track: Arc<dyn AudioTrack>,
        sink: watch::Receiver<Option<TransportSink>>,
    ) -> Result<bool> {
        if self.is_running() {
            debug!("Audio capture already running");
            return Ok(false);
        }

        let mut blocks = track
            .open_reader()
            .with_context(|| format!("Failed to attach to microphone {}", track.label()))?;

        let mut assembler = FrameAssembler::new(self.config.sample_rate, self.config.frame_size);
        let counters = Arc::clone(&self.counters);
        let label = track.label().to_string();

        info!(
            "Audio capture started on {} ({}Hz mono, {} samples/frame)",
            label, self.config.sample_rate, self.config.frame_size
        );

        self.task = Some(tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                for frame in assembler.push(&block) {
                    let message = ClientMessage::media(&to_pcm16le(&frame), INPUT_AUDIO_MIME);
                    let current = sink.borrow().clone();
                    let delivered = current.map(|s| s.send(message)).unwrap_or(false);

                    if delivered {
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped % 50 == 0 {
                            debug!("Dropped {} audio frames (transport not open)", dropped);
                        }
                    }
                }
            }

            warn!("Microphone {} stopped delivering audio", label);
        }));

        Ok(true)
    }

    /// Detach from the track. The track itself is left running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Audio capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn frames_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(samples: Vec<f32>, sample_rate: u32, channels: u16) -> SampleBlock {
        SampleBlock {
            samples,
            sample_rate,
            channels,
        }
    }

    #[test]
    fn test_downmix_stereo_averages() {
        let mono = downmix(&[0.5, 0.1, -0.2, -0.4], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_resample_integer_ratio_decimates() {
        let input: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let out = resample(&input, 48000, 16000);
        assert_eq!(out.len(), 16);
        assert_eq!(out[1], 3.0);
    }

    #[test]
    fn test_resample_fractional_ratio_interpolates() {
        let input = vec![0.0f32; 441];
        let out = resample(&input, 44100, 16000);
        assert!((159..=160).contains(&out.len()));
    }

    #[test]
    fn test_to_i16_clamps() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
    }

    #[test]
    fn test_pcm16le_layout() {
        assert_eq!(to_pcm16le(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn test_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(16000, 4096);

        let frames = assembler.push(&block(vec![0.1; 3000], 16000, 1));
        assert!(frames.is_empty());
        assert_eq!(assembler.pending(), 3000);

        let frames = assembler.push(&block(vec![0.1; 6000], 16000, 1));
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 4096));
        assert_eq!(assembler.pending(), 9000 - 8192);
    }

    #[test]
    fn test_assembler_zero_frame_size_still_drains() {
        let mut assembler = FrameAssembler::new(16000, 0);
        let frames = assembler.push(&block(vec![0.1; 10], 16000, 1));
        assert_eq!(frames.len(), 10);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_converts_48k_stereo() {
        let mut assembler = FrameAssembler::new(16000, 4096);
        // 4096 mono samples at 16kHz = 12288 stereo pairs at 48kHz
        let frames = assembler.push(&block(vec![0.25; 12288 * 2], 48000, 2));
        assert_eq!(frames.len(), 1);
        assert_eq!(assembler.pending(), 0);
    }
}
