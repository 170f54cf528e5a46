//! Voice session management
//!
//! `VoiceSession` ties together:
//! - Microphone capture and frame encoding
//! - The agent WebSocket, with a single-retry reconnect
//! - Gapless playback of agent speech
//! - The half-duplex state machine gating transmission
//! - The conversation transcript

mod config;
pub mod state;
mod stats;
pub mod transcript;
mod voice;

pub use config::{PlaybackConfig, SessionConfig};
pub use state::{InvalidTransition, SessionState, Transition};
pub use stats::{SessionCounters, SessionStats};
pub use transcript::{Role, TranscriptEntry, TranscriptLog};
pub use voice::{BackendProvider, SinkProvider, VoiceSession};
