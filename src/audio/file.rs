use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::backend::{AudioBackend, CaptureConfig, CaptureEvent, RawBlock};
use super::codec;
use crate::error::CaptureError;

/// A fully decoded audio file, downmixed to mono
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    /// Channel count of the source before downmixing
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    /// Decode any format symphonia understands (WAV, FLAC, MP3, OGG, M4A)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let file = File::open(path).context("Failed to open audio file")?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("Failed to probe audio format")?;

        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("no audio track found"))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("no sample rate"))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(1);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .context("Failed to create decoder")?;

        let track_id = track.id;
        let mut interleaved: Vec<f32> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => return Err(e).context("Failed to read packet"),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = decoder.decode(&packet).context("Failed to decode packet")?;
            let spec = *decoded.spec();
            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buf.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(buf.samples());
        }

        let samples = codec::downmix(&interleaved, channels);
        let duration_seconds = samples.len() as f64 / sample_rate as f64;

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            sample_rate,
            channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate,
            channels,
            samples,
        })
    }
}

/// Replays a decoded file as if it were a live capture device
///
/// Blocks are paced at the real-time block interval. Once the file is
/// exhausted the backend keeps producing silent blocks.
pub struct FileBackend {
    audio: std::sync::Arc<AudioFile>,
    config: CaptureConfig,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn open(path: &str, config: CaptureConfig) -> Result<Self, CaptureError> {
        let audio = AudioFile::open(path).map_err(|e| CaptureError::Backend(format!("{:#}", e)))?;
        Ok(Self {
            audio: std::sync::Arc::new(audio),
            config,
            task: None,
        })
    }

    pub fn from_audio(audio: AudioFile, config: CaptureConfig) -> Self {
        Self {
            audio: std::sync::Arc::new(audio),
            config,
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::Backend("already capturing".to_string()));
        }

        let rate = self.audio.sample_rate;
        let block_size = self.config.block_size;
        let interval = self.config.block_interval(rate);
        if interval.is_zero() {
            return Err(CaptureError::Backend("block interval must be non-zero".to_string()));
        }

        info!("Replaying {} as capture input", self.audio.path);

        let audio = std::sync::Arc::clone(&self.audio);
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut offset = 0usize;
            let mut blocks = 0u64;
            loop {
                ticker.tick().await;

                let mut samples = vec![0.0f32; block_size];
                if offset < audio.samples.len() {
                    let end = (offset + block_size).min(audio.samples.len());
                    samples[..end - offset].copy_from_slice(&audio.samples[offset..end]);
                    offset = end;
                    if offset == audio.samples.len() {
                        info!("Reached end of {}, continuing with silence", audio.path);
                    }
                }

                let block = RawBlock {
                    samples,
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
            info!("File capture stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "file"
    }
}
