use std::time::Duration;

use crate::audio::{AudioOutput, CaptureConfig};

/// Playback side of a session
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub output: AudioOutput,
    /// Sample rate of agent audio chunks
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output: AudioOutput::Speaker,
            sample_rate: 16000,
        }
    }
}

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Agent WebSocket URL
    pub endpoint: String,

    /// Bearer token, sent as the `token` query parameter
    pub auth_token: Option<String>,

    pub capture: CaptureConfig,

    pub playback: PlaybackConfig,

    /// Wait before the single reconnect attempt
    pub reconnect_delay: Duration,

    /// Reconnect attempts per lost connection
    pub max_reconnect_attempts: u32,

    /// Pause between playback draining and transmitting again
    pub guard_delay: Duration,

    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8000/ws".to_string(),
            auth_token: None,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 1,
            guard_delay: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
