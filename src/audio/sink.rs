//! Playback sinks: where scheduled agent audio ends up.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Deserialize;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

use super::codec;
use super::playback::AudioChunk;

/// Output for agent audio
///
/// `write` is called at the chunk's scheduled start time; the scheduler owns
/// timing, the sink only renders samples.
#[async_trait::async_trait]
pub trait AudioSink: Send {
    async fn write(&mut self, chunk: &AudioChunk) -> Result<()>;

    /// Flush anything buffered. Called once when playback shuts down cleanly.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Playback output selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AudioOutput {
    /// Default output device (feature `backend-cpal`)
    Speaker,
    /// Record agent audio to a WAV file
    Wav(PathBuf),
    /// Discard audio, keep timing
    Null,
}

impl FromStr for AudioOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "speaker" => Ok(AudioOutput::Speaker),
            "null" | "none" => Ok(AudioOutput::Null),
            other => match other.strip_prefix("wav:") {
                Some(path) if !path.is_empty() => Ok(AudioOutput::Wav(PathBuf::from(path))),
                _ => Err(format!(
                    "unknown audio output '{}' (expected speaker, null or wav:<path>)",
                    other
                )),
            },
        }
    }
}

impl TryFrom<String> for AudioOutput {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AudioOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioOutput::Speaker => write!(f, "speaker"),
            AudioOutput::Wav(path) => write!(f, "wav:{}", path.display()),
            AudioOutput::Null => write!(f, "null"),
        }
    }
}

/// Create the sink for an output selection
pub fn create_sink(output: &AudioOutput, sample_rate: u32) -> Result<Box<dyn AudioSink>> {
    match output {
        AudioOutput::Null => Ok(Box::new(NullSink::default())),
        AudioOutput::Wav(path) => Ok(Box::new(WavSink::create(path.clone(), sample_rate)?)),
        AudioOutput::Speaker => {
            #[cfg(feature = "backend-cpal")]
            {
                Ok(Box::new(super::cpal_backend::CpalSpeaker::open()?))
            }

            #[cfg(not(feature = "backend-cpal"))]
            {
                let _ = sample_rate;
                anyhow::bail!("speaker output requires the backend-cpal feature")
            }
        }
    }
}

/// Discards samples
#[derive(Debug, Default)]
pub struct NullSink {
    samples_written: usize,
}

impl NullSink {
    pub fn samples_written(&self) -> usize {
        self.samples_written
    }
}

#[async_trait::async_trait]
impl AudioSink for NullSink {
    async fn write(&mut self, chunk: &AudioChunk) -> Result<()> {
        self.samples_written += chunk.samples.len();
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Records agent audio as 16-bit mono WAV
pub struct WavSink {
    path: PathBuf,
    sample_rate: u32,
    writer: Option<WavWriter<BufWriter<File>>>,
    sample_count: usize,
}

impl WavSink {
    pub fn create(path: PathBuf, sample_rate: u32) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create output directory")?;
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create WAV file {}", path.display()))?;

        info!("Recording agent audio to {}", path.display());

        Ok(Self {
            path,
            sample_rate,
            writer: Some(writer),
            sample_count: 0,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait::async_trait]
impl AudioSink for WavSink {
    async fn write(&mut self, chunk: &AudioChunk) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("WAV sink already finished")?;

        let resampled = codec::resample(&chunk.samples, chunk.sample_rate, self.sample_rate);
        let samples = codec::encode(&resampled, self.sample_rate, self.sample_rate);

        for sample in &samples {
            writer
                .write_sample(*sample)
                .context("Failed to write sample")?;
        }
        self.sample_count += samples.len();
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
            info!(
                "Agent audio saved: {} ({:.1}s)",
                self.path.display(),
                self.sample_count as f64 / self.sample_rate as f64
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "wav"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_output() {
        assert_eq!("speaker".parse::<AudioOutput>(), Ok(AudioOutput::Speaker));
        assert_eq!("null".parse::<AudioOutput>(), Ok(AudioOutput::Null));
        assert_eq!(
            "wav:out/agent.wav".parse::<AudioOutput>(),
            Ok(AudioOutput::Wav(PathBuf::from("out/agent.wav")))
        );
        assert!("wav:".parse::<AudioOutput>().is_err());
    }

    #[tokio::test]
    async fn test_null_sink_counts_samples() {
        let mut sink = NullSink::default();
        sink.write(&AudioChunk::new(vec![0.0; 160], 16000))
            .await
            .unwrap();
        assert_eq!(sink.samples_written(), 160);
    }
}
