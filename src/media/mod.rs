pub mod acquirer;
pub mod device;
pub mod file;

pub use acquirer::MediaAcquirer;
pub use device::{
    AudioTrack, DeviceKind, MediaDevices, MediaTrack, RawImage, SampleBlock, VideoTrack,
};
pub use file::{AudioFile, FileMediaDevices, StillImageTrack, WavMicrophoneTrack};
