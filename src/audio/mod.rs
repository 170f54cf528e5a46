pub mod backend;
pub mod capture;
pub mod codec;
pub mod file;
pub mod playback;
pub mod sink;

#[cfg(feature = "backend-cpal")]
pub mod cpal_backend;

pub use backend::{
    AudioBackend, AudioBackendFactory, AudioFrame, AudioSource, CaptureConfig, CaptureConstraints,
    CaptureEvent, RawBlock, SilenceBackend,
};
pub use capture::CapturePipeline;
pub use file::{AudioFile, FileBackend};
pub use playback::{AudioChunk, PlaybackEvent, PlaybackScheduler, PlaybackTimeline, ScheduledChunk};
pub use sink::{create_sink, AudioOutput, AudioSink, NullSink, WavSink};
