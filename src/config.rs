use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::audio::{AudioOutput, AudioSource, CaptureConfig, CaptureConstraints};
use crate::session::{PlaybackConfig, SessionConfig};

/// Application configuration
///
/// Loaded from `config/triage-voice.toml` (optional) with `TRIAGE_VOICE__*`
/// environment overrides, e.g. `TRIAGE_VOICE__VOICE__AUTH_TOKEN`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub voice: VoiceConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "triage-voice".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

/// Agent connection settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub guard_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8000/ws".to_string(),
            auth_token: None,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 1,
            guard_delay_ms: 300,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub source: AudioSource,
    pub output: AudioOutput,
    pub target_sample_rate: u32,
    pub agent_sample_rate: u32,
    pub block_size: usize,
    pub constraints: CaptureConstraints,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        let playback = PlaybackConfig::default();
        Self {
            source: capture.source,
            output: playback.output,
            target_sample_rate: capture.target_sample_rate,
            agent_sample_rate: playback.sample_rate,
            block_size: capture.block_size,
            constraints: capture.constraints,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("TRIAGE_VOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.voice.endpoint.clone(),
            auth_token: self.voice.auth_token.clone().filter(|t| !t.is_empty()),
            capture: CaptureConfig {
                source: self.audio.source.clone(),
                target_sample_rate: self.audio.target_sample_rate,
                block_size: self.audio.block_size,
                constraints: self.audio.constraints,
                ..CaptureConfig::default()
            },
            playback: PlaybackConfig {
                output: self.audio.output.clone(),
                sample_rate: self.audio.agent_sample_rate,
            },
            reconnect_delay: Duration::from_millis(self.voice.reconnect_delay_ms),
            max_reconnect_attempts: self.voice.max_reconnect_attempts,
            guard_delay: Duration::from_millis(self.voice.guard_delay_ms),
            connect_timeout: Duration::from_millis(self.voice.connect_timeout_ms),
        }
    }
}
