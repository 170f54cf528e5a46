pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackend, AudioBackendFactory, AudioChunk, AudioFile, AudioFrame, AudioOutput, AudioSink,
    AudioSource, CaptureConfig, PlaybackScheduler,
};
pub use config::Config;
pub use error::{CaptureError, ErrorKind, SessionError};
pub use http::{create_router, AppState};
pub use session::{
    Role, SessionConfig, SessionState, SessionStats, TranscriptEntry, TranscriptLog, VoiceSession,
};
pub use transport::{ClientMessage, ConnectionManager, ServerMessage};
