//! Gapless scheduling of inbound assistant audio
//!
//! Each chunk is decoded into a buffer and started at
//! `max(next_start_time, now)` on the output clock, so consecutive chunks
//! play back to back without overlap. An interruption stops every source
//! that has not ended and rewinds the cursor to the present.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::SessionError;

pub type SourceId = u64;

/// Decoded mono PCM ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode a base64 chunk of 16-bit little-endian mono PCM
pub fn decode_pcm16(payload: &str, sample_rate: u32) -> Result<PcmBuffer, SessionError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| SessionError::DecodePlayback(format!("invalid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(SessionError::DecodePlayback("empty audio chunk".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(SessionError::DecodePlayback(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    Ok(PcmBuffer {
        samples,
        sample_rate,
    })
}

/// Audio rendering context the scheduler drives
pub trait AudioOutput: Send {
    /// Current time on the output clock, in seconds
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` seconds on the output clock
    fn start_source(&mut self, id: SourceId, buffer: PcmBuffer, start_at: f64) -> Result<()>;

    /// Stop a source early; a no-op if it already ended
    fn stop_source(&mut self, id: SourceId);

    /// Hand over the channel on which ended source ids are reported.
    ///
    /// Called once by the owner; later calls return `None`.
    fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>>;

    /// Release rendering resources; the output may be started again later
    fn close(&mut self) {}
}

/// Where the next chunk goes and which sources are still playing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackCursor {
    pub next_start_time: f64,
    pub active_sources: HashSet<SourceId>,
}

/// A chunk that was handed to the output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    sample_rate: u32,
    cursor: PlaybackCursor,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            cursor: PlaybackCursor::default(),
            next_id: 1,
        }
    }

    /// Decode and schedule one inbound chunk.
    ///
    /// A chunk that fails to decode is reported and skipped; the cursor does
    /// not move.
    pub fn enqueue(&mut self, payload: &str) -> Result<ScheduledSource, SessionError> {
        let buffer = decode_pcm16(payload, self.sample_rate)?;
        let duration = buffer.duration();

        let now = self.output.current_time();
        let start_time = self.cursor.next_start_time.max(now);

        let id = self.next_id;
        self.next_id += 1;

        self.output
            .start_source(id, buffer, start_time)
            .map_err(|e| SessionError::DecodePlayback(format!("{:#}", e)))?;

        self.cursor.next_start_time = start_time + duration;
        self.cursor.active_sources.insert(id);

        debug!(
            "Scheduled source {} at {:.3}s for {:.3}s",
            id, start_time, duration
        );

        Ok(ScheduledSource {
            id,
            start_time,
            duration,
        })
    }

    /// A source finished on its own.
    ///
    /// Returns true when this was the last active source.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.cursor.active_sources.remove(&id) && self.cursor.active_sources.is_empty()
    }

    /// Stop everything that is playing or queued.
    ///
    /// Returns the number of sources that were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.cursor.active_sources.len();
        for id in self.cursor.active_sources.drain() {
            self.output.stop_source(id);
        }
        self.cursor.next_start_time = self.output.current_time();

        if stopped > 0 {
            debug!("Interrupted playback, stopped {} sources", stopped);
        }
        stopped
    }

    /// Interrupt and release the output
    pub fn shutdown(&mut self) -> usize {
        let stopped = self.interrupt();
        self.output.close();
        stopped
    }

    pub fn is_speaking(&self) -> bool {
        !self.cursor.active_sources.is_empty()
    }

    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }

    pub fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>> {
        self.output.take_completions()
    }
}

/// Output driven by the tokio clock.
///
/// Sources are not rendered to a device; each one is held for its duration
/// and reported as ended, which makes it useful for headless deployments
/// and tests.
pub struct ClockedOutput {
    epoch: Instant,
    ended_tx: mpsc::UnboundedSender<SourceId>,
    ended_rx: Option<mpsc::UnboundedReceiver<SourceId>>,
    sources: HashMap<SourceId, JoinHandle<()>>,
}

impl ClockedOutput {
    pub fn new() -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            epoch: Instant::now(),
            ended_tx,
            ended_rx: Some(ended_rx),
            sources: HashMap::new(),
        }
    }
}

impl Default for ClockedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for ClockedOutput {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn start_source(&mut self, id: SourceId, buffer: PcmBuffer, start_at: f64) -> Result<()> {
        self.sources.retain(|_, handle| !handle.is_finished());

        let end = self.epoch + Duration::from_secs_f64(start_at.max(0.0) + buffer.duration());
        let ended_tx = self.ended_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(end).await;
            let _ = ended_tx.send(id);
        });
        self.sources.insert(id, handle);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        if let Some(handle) = self.sources.remove(&id) {
            handle.abort();
        }
    }

    fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>> {
        let rx = self.ended_rx.take();
        if rx.is_none() {
            warn!("Playback completions were already taken");
        }
        rx
    }

    fn close(&mut self) {
        for (_, handle) in self.sources.drain() {
            handle.abort();
        }
    }
}

impl Drop for ClockedOutput {
    fn drop(&mut self) {
        self.close();
    }
}
