use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::codec;
use crate::error::CaptureError;

/// One block of raw mono samples as delivered by a capture backend
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Float samples in [-1, 1]
    pub samples: Vec<f32>,
    /// Native sample rate of the backend in Hz
    pub sample_rate: u32,
    /// Milliseconds since capture started
    pub timestamp_ms: u64,
}

/// What a running backend reports
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Block(RawBlock),
    /// The platform took the device away mid-capture
    Released(String),
}

/// Encoded outbound audio (16-bit PCM, mono, target rate)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples at the target rate
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Position in the capture stream, starting at 0
    pub sequence: u64,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Wire representation: little-endian i16
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::to_le_bytes(&self.samples)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

/// Processing the platform is asked to apply to the capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Configuration for audio capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Where samples come from
    pub source: AudioSource,
    /// Wire sample rate (frames are downsampled to this)
    pub target_sample_rate: u32,
    /// Raw samples per capture block
    pub block_size: usize,
    /// Native rate of synthetic sources (silence)
    pub synthetic_sample_rate: u32,
    /// Requested stream processing
    pub constraints: CaptureConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: AudioSource::Microphone,
            target_sample_rate: 16000, // Whisper expects 16kHz
            block_size: 4096,          // ~85ms at 48kHz
            synthetic_sample_rate: 48000,
            constraints: CaptureConstraints::default(),
        }
    }
}

impl CaptureConfig {
    /// Wall-clock length of one block at the given native rate
    pub fn block_interval(&self, native_rate: u32) -> Duration {
        if native_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.block_size as u64 * 1_000_000_000 / native_rate as u64)
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - Microphone: cpal default input device (feature `backend-cpal`)
/// - File: decoded audio file replayed in real time (testing/demos)
/// - Silence: synthetic zero blocks (listen-only calls)
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the stream and start capturing
    ///
    /// Returns a channel receiver that yields one event per block
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError>;

    /// Release the stream. Idempotent.
    async fn stop(&mut self) -> Result<(), CaptureError>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio source type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AudioSource {
    /// Default input device
    Microphone,
    /// Decoded audio file, paced in real time
    File(String),
    /// Zero-valued blocks
    Silence,
}

impl FromStr for AudioSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "microphone" | "mic" => Ok(AudioSource::Microphone),
            "silence" => Ok(AudioSource::Silence),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(AudioSource::File(path.to_string())),
                _ => Err(format!(
                    "unknown audio source '{}' (expected microphone, silence or file:<path>)",
                    other
                )),
            },
        }
    }
}

impl TryFrom<String> for AudioSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioSource::Microphone => write!(f, "microphone"),
            AudioSource::File(path) => write!(f, "file:{}", path),
            AudioSource::Silence => write!(f, "silence"),
        }
    }
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create the backend configured in `config.source`
    pub fn create(config: &CaptureConfig) -> Result<Box<dyn AudioBackend>, CaptureError> {
        match &config.source {
            AudioSource::Microphone => {
                #[cfg(feature = "backend-cpal")]
                {
                    use super::cpal_backend::CpalMicrophone;
                    Ok(Box::new(CpalMicrophone::new(config.clone())))
                }

                #[cfg(not(feature = "backend-cpal"))]
                {
                    Err(CaptureError::Backend(
                        "microphone capture requires the backend-cpal feature".to_string(),
                    ))
                }
            }

            AudioSource::File(path) => {
                let backend = super::file::FileBackend::open(path, config.clone())?;
                Ok(Box::new(backend))
            }

            AudioSource::Silence => Ok(Box::new(SilenceBackend::new(config.clone()))),
        }
    }
}

/// Produces zero blocks at the capture cadence
pub struct SilenceBackend {
    config: CaptureConfig,
    task: Option<JoinHandle<()>>,
}

impl SilenceBackend {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config, task: None }
    }
}

#[async_trait::async_trait]
impl AudioBackend for SilenceBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::Backend("already capturing".to_string()));
        }

        let rate = self.config.synthetic_sample_rate;
        let block_size = self.config.block_size;
        let interval = self.config.block_interval(rate);
        if interval.is_zero() {
            return Err(CaptureError::Backend("block interval must be non-zero".to_string()));
        }

        info!(
            "Starting silence capture ({}Hz, {} samples per block)",
            rate, block_size
        );

        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut blocks = 0u64;
            loop {
                ticker.tick().await;
                let block = RawBlock {
                    samples: vec![0.0; block_size],
                    sample_rate: rate,
                    timestamp_ms: blocks * block_size as u64 * 1000 / rate as u64,
                };
                if tx.send(CaptureEvent::Block(block)).await.is_err() {
                    break;
                }
                blocks += 1;
            }
        });

        self.task = Some(task);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("Silence capture stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "silence"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_source() {
        assert_eq!("microphone".parse::<AudioSource>(), Ok(AudioSource::Microphone));
        assert_eq!("silence".parse::<AudioSource>(), Ok(AudioSource::Silence));
        assert_eq!(
            "file:/tmp/hello.wav".parse::<AudioSource>(),
            Ok(AudioSource::File("/tmp/hello.wav".to_string()))
        );
        assert!("file:".parse::<AudioSource>().is_err());
        assert!("speaker".parse::<AudioSource>().is_err());
    }

    #[test]
    fn test_block_interval() {
        let config = CaptureConfig {
            block_size: 4800,
            ..CaptureConfig::default()
        };
        assert_eq!(config.block_interval(48000), Duration::from_millis(100));
    }

    #[test]
    fn test_frame_duration_and_bytes() {
        let frame = AudioFrame {
            samples: vec![1; 1600],
            sample_rate: 16000,
            sequence: 0,
            timestamp_ms: 0,
        };
        assert_eq!(frame.duration(), Duration::from_millis(100));
        assert_eq!(frame.to_bytes().len(), 3200);
    }
}
