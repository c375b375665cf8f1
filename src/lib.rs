pub mod auth;
pub mod capture;
pub mod config;
pub mod error;
pub mod http;
pub mod media;
pub mod persistence;
pub mod session;
pub mod transport;

pub use auth::{CredentialProvider, EnvCredential, StaticCredential};
pub use capture::{AudioCaptureConfig, AudioCapturePipeline, VisionCaptureConfig, VisionCapturePipeline};
pub use config::Config;
pub use error::{DeviceError, SessionError};
pub use http::{create_router, AppState};
pub use media::{
    AudioTrack, DeviceKind, FileMediaDevices, MediaAcquirer, MediaDevices, MediaTrack, RawImage,
    SampleBlock, VideoTrack,
};
pub use persistence::{
    ChatMessage, LogMessageStore, MemoryMessageStore, MessageStore, NatsMessageStore, Role,
};
pub use session::{
    AudioOutput, ClockedOutput, FinalizeReason, PlaybackScheduler, ReconnectPolicy,
    SessionConfig, SessionController, SessionDeps, SessionSnapshot, SessionStatus, SessionUpdate,
    TranscriptAggregator,
};
pub use transport::{
    TransportConnection, TransportConnector, TransportEvent, TransportSink, WebSocketConnector,
};
