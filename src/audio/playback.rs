//! Gapless playback of agent audio.
//!
//! Chunks are given their play interval when they are enqueued:
//! `start = max(now, previous_end)`. A single drain task then walks the FIFO,
//! writing each chunk to the sink at its start and waiting for its end before
//! moving on. When the last queued chunk completes a `Drained` event is sent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::codec;
use super::sink::AudioSink;

/// Decoded inbound audio, mono
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode a binary transport payload (i16 LE PCM)
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        Self::new(codec::decode(bytes), sample_rate)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

/// Play interval assigned to a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    /// Arrival order, starting at 0
    pub index: u64,
    pub start: Instant,
    pub end: Instant,
}

impl ScheduledChunk {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started(ScheduledChunk),
    Finished(ScheduledChunk),
    /// The sink rejected a chunk; timing is kept regardless
    SinkFailed(ScheduledChunk),
    /// Last queued chunk finished
    Drained,
}

/// Next-start bookkeeping
#[derive(Debug, Default, Clone)]
pub struct PlaybackTimeline {
    next_start: Option<Instant>,
}

impl PlaybackTimeline {
    /// Reserve `[max(now, previous_end), +duration)`
    pub fn schedule(&mut self, now: Instant, duration: Duration) -> (Instant, Instant) {
        let start = match self.next_start {
            Some(next) if next > now => next,
            _ => now,
        };
        let end = start + duration;
        self.next_start = Some(end);
        (start, end)
    }

    pub fn next_start(&self) -> Option<Instant> {
        self.next_start
    }
}

struct QueuedChunk {
    chunk: AudioChunk,
    slot: ScheduledChunk,
}

pub struct PlaybackScheduler {
    queue: mpsc::UnboundedSender<QueuedChunk>,
    depth: Arc<AtomicUsize>,
    timeline: PlaybackTimeline,
    next_index: u64,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Spawn the drain task writing to `sink`
    pub fn spawn(sink: Box<dyn AudioSink>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let depth = Arc::new(AtomicUsize::new(0));

        info!("Playback scheduler started ({} sink)", sink.name());

        let task = tokio::spawn(run(sink, queue_rx, Arc::clone(&depth), events, stop_rx));

        Self {
            queue: queue_tx,
            depth,
            timeline: PlaybackTimeline::default(),
            next_index: 0,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Append a chunk; playback begins immediately if nothing is playing
    ///
    /// Returns `None` if the scheduler has been shut down.
    pub fn enqueue(&mut self, chunk: AudioChunk) -> Option<ScheduledChunk> {
        if self.task.is_none() {
            return None;
        }

        let (start, end) = self.timeline.schedule(Instant::now(), chunk.duration());
        let slot = ScheduledChunk {
            index: self.next_index,
            start,
            end,
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(QueuedChunk { chunk, slot }).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            error!("Playback task is gone, chunk {} not queued", slot.index);
            return None;
        }

        self.next_index += 1;
        debug!(
            "Queued chunk {} ({:?}, depth {})",
            slot.index,
            slot.duration(),
            self.depth()
        );
        Some(slot)
    }

    /// Chunks queued or playing
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.depth() == 0
    }

    /// Stop playback now, discarding anything queued, and flush the sink
    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Playback task panicked: {}", e);
            }
            let discarded = self.depth.swap(0, Ordering::SeqCst);
            if discarded > 0 {
                info!("Playback stopped with {} chunk(s) pending", discarded);
            }
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    mut sink: Box<dyn AudioSink>,
    mut queue: mpsc::UnboundedReceiver<QueuedChunk>,
    depth: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    tokio::select! {
        biased;
        _ = &mut stop => {}
        _ = drain(sink.as_mut(), &mut queue, &depth, &events) => {}
    }

    if let Err(e) = sink.finish().await {
        error!("Failed to finish {} sink: {:#}", sink.name(), e);
    }
}

async fn drain(
    sink: &mut dyn AudioSink,
    queue: &mut mpsc::UnboundedReceiver<QueuedChunk>,
    depth: &AtomicUsize,
    events: &mpsc::UnboundedSender<PlaybackEvent>,
) {
    while let Some(QueuedChunk { chunk, slot }) = queue.recv().await {
        sleep_until(slot.start).await;

        match sink.write(&chunk).await {
            Ok(()) => {
                let _ = events.send(PlaybackEvent::Started(slot));
            }
            Err(e) => {
                warn!("Sink {} failed on chunk {}: {:#}", sink.name(), slot.index, e);
                let _ = events.send(PlaybackEvent::SinkFailed(slot));
            }
        }

        sleep_until(slot.end).await;
        let _ = events.send(PlaybackEvent::Finished(slot));

        if depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("Playback queue drained after chunk {}", slot.index);
            let _ = events.send(PlaybackEvent::Drained);
        }
    }
}
