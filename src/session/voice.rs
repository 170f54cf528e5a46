use super::config::{PlaybackConfig, SessionConfig};
use super::state::{SessionState, Transition};
use super::stats::{SessionCounters, SessionStats};
use super::transcript::{TranscriptEntry, TranscriptLog};
use crate::audio::{
    codec, create_sink, AudioBackend, AudioBackendFactory, AudioChunk, AudioFrame, AudioSink,
    CaptureConfig, CapturePipeline, PlaybackEvent, PlaybackScheduler,
};
use crate::error::{CaptureError, SessionError};
use crate::transport::{
    ConnectionManager, FrameOutcome, Inbound, ReconnectPolicy, ServerMessage, TransportEvent,
};
use chrono::{DateTime, Utc};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};

/// Capture frames waiting for the driver
const FRAME_QUEUE: usize = 64;

/// Builds the capture backend for a session
pub type BackendProvider =
    Arc<dyn Fn(&CaptureConfig) -> Result<Box<dyn AudioBackend>, CaptureError> + Send + Sync>;

/// Builds the playback sink for a session
pub type SinkProvider =
    Arc<dyn Fn(&PlaybackConfig) -> anyhow::Result<Box<dyn AudioSink>> + Send + Sync>;

enum Command {
    Stop,
}

/// Why the driver loop ended
enum Exit {
    Stopped,
    /// The agent said goodbye and closed the socket
    Hangup,
    Fatal(SessionError),
}

struct SessionMeta {
    id: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    transcript: TranscriptLog,
}

struct ActiveSession {
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

/// A voice call with the triage agent
///
/// One conversation is live at a time. `start` acquires the microphone,
/// connects and spawns the session driver; `stop` tears everything down and
/// returns once capture, playback and transport are released.
pub struct VoiceSession {
    config: SessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    counters: Arc<SessionCounters>,
    meta: Arc<Mutex<SessionMeta>>,
    /// Outlives individual conversations so subscribers can attach before start
    transcript_updates: broadcast::Sender<TranscriptEntry>,
    active: Mutex<Option<ActiveSession>>,
    /// Reaches a `start` that is still connecting
    starting: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    backends: BackendProvider,
    sinks: SinkProvider,
}

impl VoiceSession {
    pub fn new(config: SessionConfig) -> Self {
        let backends: BackendProvider = Arc::new(AudioBackendFactory::create);
        let sinks: SinkProvider = Arc::new(|playback: &PlaybackConfig| {
            create_sink(&playback.output, playback.sample_rate)
        });
        Self::with_providers(config, backends, sinks)
    }

    /// Use custom capture and playback devices
    pub fn with_providers(
        config: SessionConfig,
        backends: BackendProvider,
        sinks: SinkProvider,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (transcript_updates, _) = broadcast::channel(64);
        Self {
            config,
            state: Arc::new(state),
            counters: Arc::new(SessionCounters::default()),
            meta: Arc::new(Mutex::new(SessionMeta {
                id: new_session_id(),
                started_at: None,
                ended_at: None,
                transcript: TranscriptLog::with_updates(transcript_updates.clone()),
            })),
            transcript_updates,
            active: Mutex::new(None),
            starting: Mutex::new(None),
            backends,
            sinks,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a conversation
    ///
    /// Fails with `AlreadyActive` if one is live. Any other error leaves the
    /// session in the `error` state with nothing acquired.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            if !previous.driver.is_finished() {
                *active = Some(previous);
                return Err(SessionError::AlreadyActive);
            }
            let _ = previous.driver.await;
        }

        if !apply_transition(&self.state, Transition::Start) {
            return Err(SessionError::AlreadyActive);
        }

        // A stop issued from here on is picked up by the connect below, or by
        // the driver once it runs
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        *self.starting.lock().await = Some(commands_tx.clone());

        let transcript = {
            let mut meta = self.meta.lock().await;
            meta.id = new_session_id();
            meta.started_at = Some(Utc::now());
            meta.ended_at = None;
            meta.transcript = TranscriptLog::with_updates(self.transcript_updates.clone());
            info!("Starting voice session {}", meta.id);
            meta.transcript.clone()
        };
        self.counters.reset();

        // Microphone first: a refused device must not open a connection
        let backend = (self.backends)(&self.config.capture).map_err(|e| self.fail(e.into()))?;
        let mut capture = CapturePipeline::new(backend, self.config.capture.target_sample_rate);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        if let Err(e) = capture.start(frames_tx, faults_tx).await {
            return Err(self.fail(e.into()));
        }

        // Opening a device or file may block
        let sinks = Arc::clone(&self.sinks);
        let playback_config = self.config.playback.clone();
        let opened = tokio::task::spawn_blocking(move || sinks(&playback_config))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result);
        let sink = match opened {
            Ok(sink) => sink,
            Err(e) => {
                capture.stop().await;
                return Err(self.fail(SessionError::Backend(format!("{:#}", e))));
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut connection = ConnectionManager::new(
            self.config.endpoint.clone(),
            self.config.auth_token.clone(),
            ReconnectPolicy {
                delay: self.config.reconnect_delay,
                max_attempts: self.config.max_reconnect_attempts,
            },
            self.config.connect_timeout,
            inbound_tx,
        );
        let connected = tokio::select! {
            biased;
            _ = commands_rx.recv() => None,
            result = connection.connect() => Some(result),
        };
        self.starting.lock().await.take();

        match connected {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                capture.stop().await;
                return Err(self.fail(e));
            }
            None => {
                info!("Stopped while connecting");
                capture.stop().await;
                return Err(SessionError::ConnectionFailed(
                    "stopped while connecting".to_string(),
                ));
            }
        }

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let playback = PlaybackScheduler::spawn(sink, playback_tx);

        apply_transition(&self.state, Transition::TransportOpen { playback_active: false });

        let mut driver = SessionDriver {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            meta: Arc::clone(&self.meta),
            transcript,
            capture,
            connection,
            playback,
            frames: frames_rx,
            faults: faults_rx,
            inbound: inbound_rx,
            playback_events: playback_rx,
            agent_sample_rate: self.config.playback.sample_rate,
            guard_delay: self.config.guard_delay,
            guard: None,
            reconnect: None,
            guard_owed: false,
            hangup_pending: false,
            peer_closed: false,
        };
        driver.discard_stale_frames();

        let handle = tokio::spawn(driver.run(commands_rx));

        *active = Some(ActiveSession {
            commands: commands_tx,
            driver: handle,
        });

        info!("Voice session started");
        Ok(())
    }

    /// End the conversation and release everything
    ///
    /// Valid in any state; always leaves the session `idle`.
    pub async fn stop(&self) -> SessionStats {
        if let Some(starting) = self.starting.lock().await.take() {
            let _ = starting.send(Command::Stop);
        }
        let previous = self.active.lock().await.take();

        if let Some(previous) = previous {
            info!("Stopping voice session");
            let _ = previous.commands.send(Command::Stop);
            if let Err(e) = previous.driver.await {
                error!("Session driver panicked: {}", e);
            }
        }

        apply_transition(&self.state, Transition::Stop);

        {
            let mut meta = self.meta.lock().await;
            if meta.started_at.is_some() && meta.ended_at.is_none() {
                meta.ended_at = Some(Utc::now());
            }
        }

        self.stats().await
    }

    /// Current state, read live
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Transcript of the current (or last) conversation
    pub async fn transcript(&self) -> TranscriptLog {
        self.meta.lock().await.transcript.clone()
    }

    pub async fn transcript_entries(&self) -> Vec<TranscriptEntry> {
        self.transcript().await.entries().await
    }

    /// Receive transcript entries as they arrive, across conversations
    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.transcript_updates.subscribe()
    }

    pub async fn stats(&self) -> SessionStats {
        let (session_id, started_at, ended_at, transcript) = {
            let meta = self.meta.lock().await;
            (meta.id.clone(), meta.started_at, meta.ended_at, meta.transcript.clone())
        };

        let duration_secs = match started_at {
            Some(start) => {
                let end = ended_at.unwrap_or_else(Utc::now);
                end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0
            }
            None => 0.0,
        };

        let c = &self.counters;
        SessionStats {
            session_id,
            state: self.state().name().to_string(),
            started_at,
            duration_secs,
            frames_captured: SessionCounters::get(&c.frames_captured),
            frames_sent: SessionCounters::get(&c.frames_sent),
            frames_suppressed: SessionCounters::get(&c.frames_suppressed),
            chunks_received: SessionCounters::get(&c.chunks_received),
            reconnect_attempts: SessionCounters::get(&c.reconnect_attempts),
            transcript_entries: transcript.len().await,
        }
    }

    fn fail(&self, err: SessionError) -> SessionError {
        error!("Voice session failed to start: {}", err);
        apply_transition(&self.state, Transition::Fatal(err.clone()));
        err
    }
}

/// Apply `event` to the shared state; invalid pairs are logged and ignored
fn apply_transition(state: &watch::Sender<SessionState>, event: Transition) -> bool {
    let mut valid = false;
    state.send_if_modified(|current| match current.apply(event) {
        Ok(next) => {
            valid = true;
            if *current == next {
                return false;
            }
            debug!("Session state {} -> {}", current, next);
            *current = next;
            true
        }
        Err(e) => {
            warn!("Ignoring {}", e);
            false
        }
    });
    valid
}

fn new_session_id() -> String {
    format!("call-{}", uuid::Uuid::new_v4())
}

/// Resolve when the timer fires; never if unset
async fn wait_for(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Owns every live resource of a conversation and makes all gate decisions
struct SessionDriver {
    state: Arc<watch::Sender<SessionState>>,
    counters: Arc<SessionCounters>,
    meta: Arc<Mutex<SessionMeta>>,
    transcript: TranscriptLog,
    capture: CapturePipeline,
    connection: ConnectionManager,
    playback: PlaybackScheduler,
    frames: mpsc::Receiver<AudioFrame>,
    faults: mpsc::UnboundedReceiver<CaptureError>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    agent_sample_rate: u32,
    guard_delay: Duration,
    guard: Option<Pin<Box<Sleep>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    /// Playback finished while disconnected; the guard runs after reopening
    guard_owed: bool,
    /// The agent sent its farewell
    hangup_pending: bool,
    /// ...and then closed the socket
    peer_closed: bool,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let exit = loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Stop) | None => break Exit::Stopped,
                },

                Some(fault) = self.faults.recv() => break Exit::Fatal(fault.into()),

                Some(inbound) = self.inbound.recv() => {
                    if let Some(exit) = self.on_inbound(inbound).await {
                        break exit;
                    }
                }

                Some(event) = self.playback_events.recv() => {
                    if let Some(exit) = self.on_playback(event) {
                        break exit;
                    }
                }

                _ = wait_for(&mut self.guard) => {
                    self.guard = None;
                    self.on_guard_elapsed();
                }

                _ = wait_for(&mut self.reconnect) => {
                    self.reconnect = None;
                    if let Some(exit) = self.try_reconnect(&mut commands).await {
                        break exit;
                    }
                }

                Some(frame) = self.frames.recv() => self.on_frame(frame),
            }
        };

        self.shutdown(exit).await;
    }

    fn transition(&self, event: Transition) -> bool {
        apply_transition(&self.state, event)
    }

    /// The transmission gate
    fn on_frame(&mut self, frame: AudioFrame) {
        SessionCounters::incr(&self.counters.frames_captured);

        let outcome = {
            let state = self.state.borrow();
            self.connection.send_frame(&frame, &state, self.playback.depth())
        };

        match outcome {
            FrameOutcome::Sent => {
                SessionCounters::incr(&self.counters.frames_sent);
                debug!(
                    "Sent frame {} ({} samples, rms {:.1})",
                    frame.sequence,
                    frame.samples.len(),
                    codec::rms(&frame.samples)
                );
            }
            FrameOutcome::Suppressed => SessionCounters::incr(&self.counters.frames_suppressed),
            FrameOutcome::Dropped => {}
        }
    }

    /// Drop frames captured while no connection was open
    fn discard_stale_frames(&mut self) {
        let mut discarded = 0u64;
        while self.frames.try_recv().is_ok() {
            SessionCounters::incr(&self.counters.frames_captured);
            SessionCounters::incr(&self.counters.frames_suppressed);
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} frames captured while connecting", discarded);
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) -> Option<Exit> {
        if !self.connection.is_current(inbound.generation) {
            debug!("Ignoring event from old connection {}", inbound.generation);
            return None;
        }

        match inbound.event {
            TransportEvent::Control(msg) => self.on_control(msg).await,
            TransportEvent::Audio(bytes) => return self.on_audio(bytes),
            TransportEvent::Malformed(reason) => warn!("Dropping malformed message: {}", reason),
            TransportEvent::Closed { reason } | TransportEvent::Failed(reason) => {
                return self.on_connection_lost(reason)
            }
        }
        None
    }

    async fn on_control(&mut self, msg: ServerMessage) {
        if msg.ends_call() {
            info!("Agent is ending the call");
            self.hangup_pending = true;
        }

        match msg {
            ServerMessage::Utterance {
                kind, role, text, ..
            } => {
                info!("[{:?}/{:?}] {}", role, kind, text);
                self.transcript.append(role, text).await;
            }
            ServerMessage::Unknown(kind) => debug!("Ignoring message type '{}'", kind),
        }
    }

    fn on_audio(&mut self, bytes: Vec<u8>) -> Option<Exit> {
        let chunk = AudioChunk::from_pcm_bytes(&bytes, self.agent_sample_rate);
        if chunk.samples.is_empty() {
            warn!("Dropping empty audio chunk ({} bytes)", bytes.len());
            return None;
        }

        SessionCounters::incr(&self.counters.chunks_received);

        // A new chunk cancels a pending guard; speaking starts before the
        // chunk is queued so the gate closes first
        self.guard = None;
        self.transition(Transition::ChunkEnqueued);

        match self.playback.enqueue(chunk) {
            Some(_) => None,
            None => Some(Exit::Fatal(SessionError::Backend("playback is not running".to_string()))),
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) -> Option<Exit> {
        match event {
            PlaybackEvent::Started(slot) => {
                debug!("Playing chunk {} ({:?})", slot.index, slot.duration())
            }
            PlaybackEvent::Finished(slot) => debug!("Finished chunk {}", slot.index),
            PlaybackEvent::SinkFailed(slot) => {
                return Some(Exit::Fatal(SessionError::Backend(format!(
                    "playback sink failed on chunk {}",
                    slot.index
                ))))
            }
            PlaybackEvent::Drained => {
                // A chunk may have been queued after the drain was reported
                if !self.playback.is_idle() {
                    return None;
                }
                if self.hangup_pending && self.peer_closed {
                    return Some(Exit::Hangup);
                }
                let state = self.state.borrow().clone();
                match state {
                    SessionState::Speaking => {
                        self.guard = Some(Box::pin(sleep(self.guard_delay)));
                    }
                    SessionState::Connecting => self.guard_owed = true,
                    _ => {}
                }
            }
        }
        None
    }

    fn on_guard_elapsed(&mut self) {
        if self.playback.is_idle() {
            self.transition(Transition::QueueDrained);
        }
    }

    fn on_connection_lost(&mut self, reason: String) -> Option<Exit> {
        if self.hangup_pending {
            info!("Agent closed the connection ({})", reason);
            self.connection.drop_connection();
            self.peer_closed = true;
            return self.playback.is_idle().then_some(Exit::Hangup);
        }

        warn!("Connection lost: {}", reason);
        if self.guard.take().is_some() {
            self.guard_owed = true;
        }

        match self.connection.on_connection_lost() {
            Some(delay) => {
                self.transition(Transition::TransportLost);
                info!("Reconnecting in {:?}", delay);
                self.reconnect = Some(Box::pin(sleep(delay)));
                None
            }
            None => Some(Exit::Fatal(SessionError::ConnectionFailed(format!(
                "connection lost: {}",
                reason
            )))),
        }
    }

    async fn try_reconnect(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Exit> {
        SessionCounters::incr(&self.counters.reconnect_attempts);

        let result = tokio::select! {
            biased;
            _ = commands.recv() => return Some(Exit::Stopped),
            result = self.connection.connect() => result,
        };

        match result {
            Ok(()) => {
                info!("Reconnected");
                self.connection.reset_reconnect_budget();

                // Audio that drained while disconnected still owes its guard
                let playback_active = !self.playback.is_idle();
                let owed = std::mem::take(&mut self.guard_owed);
                self.transition(Transition::TransportOpen {
                    playback_active: playback_active || owed,
                });
                if owed && !playback_active {
                    self.guard = Some(Box::pin(sleep(self.guard_delay)));
                }
                self.discard_stale_frames();
                None
            }
            Err(e) => {
                error!("Reconnect failed: {}", e);
                match self.connection.on_connection_lost() {
                    Some(delay) => {
                        self.reconnect = Some(Box::pin(sleep(delay)));
                        None
                    }
                    None => Some(Exit::Fatal(e)),
                }
            }
        }
    }

    /// Release capture, transport and playback, in that order
    async fn shutdown(mut self, exit: Exit) {
        self.capture.stop().await;
        self.connection.close().await;
        self.playback.shutdown().await;

        self.meta.lock().await.ended_at = Some(Utc::now());

        match exit {
            Exit::Stopped => {
                self.transition(Transition::Stop);
                info!("Voice session stopped");
            }
            Exit::Hangup => {
                self.transition(Transition::Stop);
                info!("Call ended by agent");
            }
            Exit::Fatal(err) => {
                error!("Voice session failed: {}", err);
                self.transition(Transition::Fatal(err));
            }
        }
    }
}
