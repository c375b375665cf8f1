use serde::Serialize;
use thiserror::Error;

use crate::media::DeviceKind;
use crate::session::SessionStatus;

/// Errors surfaced by the live session controller.
///
/// Only `PermissionDenied`, `Unauthorized`, and an exhausted reconnect budget
/// (`Transport`) move the session into `SessionStatus::Error`. Everything else
/// is handled inside the component that hit it and logged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionError {
    #[error("{} access was denied; grant permission and retry", device.label())]
    PermissionDenied { device: DeviceKind },

    #[error("could not obtain a session credential: {0}")]
    Unauthorized(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed unexpectedly: {0}")]
    TransportClosedUnexpectedly(String),

    #[error("could not decode inbound audio: {0}")]
    DecodePlayback(String),

    #[error("failed to persist message: {0}")]
    Persistence(String),

    #[error("turn timed out before the endpoint completed it")]
    TranscriptTimeout,

    #[error("session is already active")]
    AlreadyActive,

    #[error("cannot {operation} while session is {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("session controller has shut down")]
    ControllerGone,
}

impl SessionError {
    /// Whether this error is the permission class (device or credential).
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::Unauthorized(_))
    }
}

/// Failure reported by the platform capture API for a single device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device unavailable: {0}")]
    Unavailable(String),
}
