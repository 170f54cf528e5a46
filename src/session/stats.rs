use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// Current state name
    pub state: String,

    /// When the session started, if it ever did
    pub started_at: Option<DateTime<Utc>>,

    /// Seconds since start
    pub duration_secs: f64,

    /// Frames produced by the capture pipeline
    pub frames_captured: u64,

    /// Frames handed to the transport
    pub frames_sent: u64,

    /// Frames held back by the half-duplex gate
    pub frames_suppressed: u64,

    /// Agent audio chunks received
    pub chunks_received: u64,

    pub reconnect_attempts: u64,

    pub transcript_entries: usize,
}

/// Live counters updated by the session driver
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_suppressed: AtomicU64,
    pub chunks_received: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

impl SessionCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.frames_captured,
            &self.frames_sent,
            &self.frames_suppressed,
            &self.chunks_received,
            &self.reconnect_attempts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
