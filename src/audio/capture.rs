//! Capture pipeline: backend blocks in, encoded frames out.
//!
//! Every block is encoded regardless of session state. Whether a frame is
//! actually transmitted is decided downstream at the transmission gate.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioBackend, AudioFrame, CaptureEvent};
use super::codec;
use crate::error::CaptureError;

pub struct CapturePipeline {
    backend: Box<dyn AudioBackend>,
    target_sample_rate: u32,
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new(backend: Box<dyn AudioBackend>, target_sample_rate: u32) -> Self {
        Self {
            backend,
            target_sample_rate,
            task: None,
        }
    }

    /// Acquire the capture stream and start encoding
    ///
    /// Frames go to `frames` (dropped when the receiver lags); a device
    /// revoked mid-capture is reported once on `faults`.
    pub async fn start(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
        faults: mpsc::UnboundedSender<CaptureError>,
    ) -> Result<(), CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::Backend("capture already running".to_string()));
        }

        let mut events = self.backend.start().await?;
        info!("Capture started via {}", self.backend.name());

        let target_rate = self.target_sample_rate;
        let task = tokio::spawn(async move {
            let mut sequence = 0u64;
            let mut lagging = false;

            while let Some(event) = events.recv().await {
                let block = match event {
                    CaptureEvent::Block(block) => block,
                    CaptureEvent::Released(reason) => {
                        error!("Capture device released: {}", reason);
                        let _ = faults.send(CaptureError::DeviceReleased(reason));
                        break;
                    }
                };

                let frame = AudioFrame {
                    samples: codec::encode(&block.samples, block.sample_rate, target_rate),
                    sample_rate: target_rate,
                    sequence,
                    timestamp_ms: block.timestamp_ms,
                };
                sequence += 1;

                match frames.try_send(frame) {
                    Ok(()) => lagging = false,
                    Err(TrySendError::Full(frame)) => {
                        if !lagging {
                            warn!("Frame queue full, dropping frame {}", frame.sequence);
                        }
                        lagging = true;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }

            debug!("Capture encoding task stopped after {} blocks", sequence);
        });

        self.task = Some(task);
        Ok(())
    }

    /// Stop encoding and release the device. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }

        if self.backend.is_capturing() {
            if let Err(e) = self.backend.stop().await {
                error!("Failed to stop {} capture: {}", self.backend.name(), e);
            }
            info!("Capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}
