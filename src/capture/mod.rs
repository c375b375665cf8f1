//! Media producers feeding the active transport
//!
//! Both pipelines read the current transport sink from a `watch` channel
//! owned by the session controller and never buffer: media that cannot be
//! sent right away is dropped.

pub mod audio;
pub mod vision;

pub use audio::{AudioCaptureConfig, AudioCapturePipeline, FrameAssembler};
pub use vision::{encode_jpeg, InFlightGate, VisionCaptureConfig, VisionCapturePipeline};
