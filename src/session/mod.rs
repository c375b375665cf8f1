//! Live session management
//!
//! This module provides the `SessionController` that orchestrates:
//! - Camera/screen and microphone acquisition
//! - Outbound audio and vision pipelines over the active transport
//! - Reconnection with exponential backoff after transport failures
//! - Gapless playback of assistant audio, with interruption
//! - Turn-level transcript aggregation and persistence

mod config;
mod controller;
mod playback;
mod reconnect;
mod status;
mod transcript;

pub use config::SessionConfig;
pub use controller::{SessionController, SessionDeps};
pub use playback::{
    decode_pcm16, AudioOutput, ClockedOutput, PcmBuffer, PlaybackCursor, PlaybackScheduler,
    ScheduledSource, SourceId,
};
pub use reconnect::{ReconnectConfig, ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use status::{SessionSnapshot, SessionStatus, SessionUpdate};
pub use transcript::{
    FinalizeReason, FinalizedTurn, TranscriptAggregator, TranscriptTurn, TurnId, TIMEOUT_WARNING,
};
