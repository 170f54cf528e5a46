//! Native device I/O through cpal.
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it until told to stop.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamError};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::backend::{AudioBackend, CaptureConfig, CaptureEvent, RawBlock};
use super::codec;
use super::playback::AudioChunk;
use super::sink::AudioSink;
use crate::error::CaptureError;

fn classify(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Backend(message)
    }
}

/// Default input device
pub struct CpalMicrophone {
    config: CaptureConfig,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalMicrophone {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop: None,
            thread: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for CpalMicrophone {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::Backend("already capturing".to_string()));
        }
        if self.config.block_size == 0 {
            return Err(CaptureError::Backend("block size must be non-zero".to_string()));
        }

        let constraints = self.config.constraints;
        if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            warn!(
                "cpal does not expose stream processing; requested {:?} is left to the platform",
                constraints
            );
        }

        let (events_tx, events_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let block_size = self.config.block_size;

        let handle = thread::Builder::new()
            .name("cpal-input".to_string())
            .spawn(move || {
                let stream = match open_input(block_size, events_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream until stop() or the backend is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Backend(format!("failed to spawn input thread: {}", e)))?;

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| CaptureError::Backend(e.to_string()))?
            .map_err(|_| CaptureError::Backend("input thread exited".to_string()))?;

        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        self.stop = Some(stop_tx);
        self.thread = Some(handle);
        Ok(events_rx)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        drop(self.stop.take());
        if let Some(handle) = self.thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| CaptureError::Backend(e.to_string()))?
                .map_err(|_| CaptureError::Backend("input thread panicked".to_string()))?;
            info!("Microphone released");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.thread.is_some()
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

fn open_input(
    block_size: usize,
    events: mpsc::Sender<CaptureEvent>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::Backend("no input device available".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| classify(format!("failed to query input config: {}", e)))?;

    let channels = supported.channels();
    let rate = supported.sample_rate().0;
    let format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();

    info!(
        "Opening input device {} ({}Hz, {} channels, {:?})",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        rate,
        channels,
        format
    );

    let layout = InputLayout {
        channels,
        rate,
        block_size,
    };
    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &stream_config, layout, events),
        SampleFormat::I16 => build_input::<i16>(&device, &stream_config, layout, events),
        SampleFormat::U16 => build_input::<u16>(&device, &stream_config, layout, events),
        other => {
            return Err(CaptureError::Backend(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| classify(format!("failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| classify(format!("failed to start input stream: {}", e)))?;

    Ok(stream)
}

#[derive(Clone, Copy)]
struct InputLayout {
    channels: u16,
    rate: u32,
    block_size: usize,
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    layout: InputLayout,
    events: mpsc::Sender<CaptureEvent>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let InputLayout {
        channels,
        rate,
        block_size,
    } = layout;
    let data_events = events.clone();
    let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);
    let mut blocks = 0u64;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let floats: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
            pending.extend(codec::downmix(&floats, channels));

            while pending.len() >= block_size {
                let samples: Vec<f32> = pending.drain(..block_size).collect();
                let block = RawBlock {
                    samples,
                    sample_rate: rate,
                    timestamp_ms: blocks * block_size as u64 * 1000 / rate as u64,
                };
                blocks += 1;
                // The capture pipeline counts drops; never block the audio thread
                let _ = data_events.try_send(CaptureEvent::Block(block));
            }
        },
        move |err| match err {
            StreamError::DeviceNotAvailable => {
                let _ = events.try_send(CaptureEvent::Released(
                    "input device no longer available".to_string(),
                ));
            }
            other => error!("Input stream error: {}", other),
        },
        None,
    )
}

/// Default output device
pub struct CpalSpeaker {
    queue: Arc<Mutex<VecDeque<f32>>>,
    sample_rate: u32,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalSpeaker {
    pub fn open() -> Result<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let shared = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let (stream, rate) = match open_output(shared) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .context("Failed to spawn output thread")?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| anyhow!("output thread exited"))??;

        Ok(Self {
            queue,
            sample_rate,
            stop: Some(stop_tx),
            thread: Some(handle),
        })
    }
}

#[async_trait::async_trait]
impl AudioSink for CpalSpeaker {
    async fn write(&mut self, chunk: &AudioChunk) -> Result<()> {
        let samples = codec::resample(&chunk.samples, chunk.sample_rate, self.sample_rate);
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("output queue poisoned"))?;
        queue.extend(samples);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        drop(self.stop.take());
        if let Some(handle) = self.thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await?
                .map_err(|_| anyhow!("output thread panicked"))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "speaker"
    }
}

fn open_output(queue: Arc<Mutex<VecDeque<f32>>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no output device available"))?;
    let supported = device
        .default_output_config()
        .context("Failed to query output config")?;

    let channels = supported.channels() as usize;
    let rate = supported.sample_rate().0;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, channels, queue),
        SampleFormat::I16 => build_output::<i16>(&device, &config, channels, queue),
        SampleFormat::U16 => build_output::<u16>(&device, &config, channels, queue),
        other => return Err(anyhow!("unsupported output sample format {:?}", other)),
    }
    .context("Failed to build output stream")?;

    stream.play().context("Failed to start output stream")?;
    info!("Speaker output open ({}Hz, {} channels)", rate, channels);
    Ok((stream, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = match queue.lock() {
                Ok(queue) => queue,
                Err(_) => {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }
            };
            for frame in data.chunks_mut(channels.max(1)) {
                let value = T::from_sample(queue.pop_front().unwrap_or(0.0));
                for out in frame.iter_mut() {
                    *out = value;
                }
            }
        },
        |err| error!("Output stream error: {}", err),
        None,
    )
}
