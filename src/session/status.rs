use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::transcript::FinalizeReason;
use crate::error::SessionError;
use crate::media::DeviceKind;
use crate::persistence::{ChatMessage, Role};

/// Lifecycle state of the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    RequestingPermissions,
    Connecting,
    Active,
    Reconnecting,
    Error,
}

impl SessionStatus {
    /// Whether a session is underway (a new start would be rejected)
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::RequestingPermissions | Self::Connecting | Self::Active | Self::Reconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingPermissions => "requesting_permissions",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the session, served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,

    /// Chat session finalized messages are saved under
    pub session_id: String,

    /// When the current session was started
    pub started_at: Option<DateTime<Utc>>,

    /// Reconnect attempts since the last successful open
    pub reconnect_attempt: u32,

    /// Error that moved the session into `error`
    pub last_error: Option<SessionError>,

    /// Whether assistant audio is playing
    pub speaking: bool,

    /// Capture devices currently held
    pub devices: Vec<DeviceKind>,

    /// Partial transcript of the turn in progress
    pub user_transcript: String,
    pub assistant_transcript: String,

    pub audio_frames_sent: u64,
    /// Microphone frames dropped because no transport was open
    pub audio_frames_dropped: u64,
    pub vision_frames_sent: u64,
    /// Vision ticks skipped because the previous frame was still in flight
    pub vision_ticks_skipped: u64,
}

impl SessionSnapshot {
    pub fn idle(session_id: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Idle,
            session_id: session_id.into(),
            started_at: None,
            reconnect_attempt: 0,
            last_error: None,
            speaking: false,
            devices: Vec::new(),
            user_transcript: String::new(),
            assistant_transcript: String::new(),
            audio_frames_sent: 0,
            audio_frames_dropped: 0,
            vision_frames_sent: 0,
            vision_ticks_skipped: 0,
        }
    }
}

/// Change notification broadcast to observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    Status {
        status: SessionStatus,
        error: Option<SessionError>,
    },
    /// Accumulated text of the turn in progress for one role
    Transcript {
        role: Role,
        text: String,
        streaming: bool,
    },
    TurnFinalized {
        reason: FinalizeReason,
        messages: Vec<ChatMessage>,
    },
    Speaking {
        speaking: bool,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    /// Recoverable problem worth showing to the user
    Warning {
        message: String,
    },
}
