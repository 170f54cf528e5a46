use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use crate::audio::AudioFrame;
use crate::error::SessionError;
use crate::session::state::SessionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth; frames beyond this are dropped
const OUTBOUND_CAPACITY: usize = 256;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed-delay reconnect budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Attempts allowed per lost connection
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_attempts: 1,
        }
    }
}

enum Outbound {
    Control(ClientMessage),
    Audio(Vec<u8>),
    Close,
}

/// What the reader and writer tasks report
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Control(ServerMessage),
    Audio(Vec<u8>),
    /// A textual frame that could not be parsed
    Malformed(String),
    /// Peer closed the socket
    Closed { reason: String },
    /// Read or write error
    Failed(String),
}

/// Event tagged with the connection it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Result of offering a frame to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent,
    /// Held back by the half-duplex gate
    Suppressed,
    /// Gate open but no connection or the outbound queue is full
    Dropped,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Owns the agent WebSocket and its reconnect budget
pub struct ConnectionManager {
    endpoint: String,
    token: Option<String>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<Inbound>,
    next_generation: u64,
    link: Option<Link>,
    attempts: u32,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            policy,
            connect_timeout,
            events,
            next_generation: 1,
            link: None,
            attempts: 0,
        }
    }

    /// Endpoint with the auth token appended as a `token` query parameter
    pub fn connection_url(&self) -> String {
        match self.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.endpoint, sep, percent_encode(token))
            }
            None => self.endpoint.clone(),
        }
    }

    /// Open the socket, send the start message and spawn reader/writer tasks
    ///
    /// Any previous connection is dropped first; its late events stop being
    /// current.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.drop_connection();

        info!("Connecting to {}", self.endpoint);

        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.connection_url()))
                .await
                .map_err(|_| {
                    SessionError::ConnectionFailed(format!(
                        "timed out after {:?}",
                        self.connect_timeout
                    ))
                })?
                .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        let (mut sink, stream) = ws.split();
        let start = ClientMessage::Start
            .to_json()
            .map_err(|e| SessionError::ConnectionFailed(format!("failed to encode start: {}", e)))?;
        sink.send(Message::Text(start.into()))
            .await
            .map_err(|e| SessionError::ConnectionFailed(format!("failed to send start: {}", e)))?;

        let generation = self.next_generation;
        self.next_generation += 1;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, outbound_rx, generation, self.events.clone()));
        let reader = tokio::spawn(read_loop(stream, generation, self.events.clone()));

        self.link = Some(Link {
            generation,
            outbound: outbound_tx,
            writer,
            reader,
        });

        info!("Connected to agent (connection {})", generation);
        Ok(())
    }

    /// Transmit a frame if the half-duplex gate allows it
    ///
    /// The gate is open only while `state` is listening and nothing is queued
    /// for playback.
    pub fn send_frame(
        &self,
        frame: &AudioFrame,
        state: &SessionState,
        playback_depth: usize,
    ) -> FrameOutcome {
        if !state.accepts_frames() || playback_depth > 0 {
            return FrameOutcome::Suppressed;
        }

        let Some(link) = &self.link else {
            return FrameOutcome::Dropped;
        };

        match link.outbound.try_send(Outbound::Audio(frame.to_bytes())) {
            Ok(()) => FrameOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping frame {}", frame.sequence);
                FrameOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => FrameOutcome::Dropped,
        }
    }

    /// Whether an event belongs to the live connection
    pub fn is_current(&self, generation: u64) -> bool {
        self.link.as_ref().map(|l| l.generation) == Some(generation)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Forget the lost connection and spend one unit of reconnect budget
    ///
    /// Returns the delay before the next attempt, or `None` when the budget is
    /// exhausted.
    pub fn on_connection_lost(&mut self) -> Option<Duration> {
        self.drop_connection();
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay)
    }

    /// Called once a reconnect succeeds
    pub fn reset_reconnect_budget(&mut self) {
        self.attempts = 0;
    }

    /// Send `end`, close the socket and wait briefly for the writer to flush
    pub async fn close(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        let Link {
            generation,
            outbound,
            mut writer,
            reader,
        } = link;

        let _ = outbound.try_send(Outbound::Control(ClientMessage::End));
        let _ = outbound.try_send(Outbound::Close);
        drop(outbound);

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
            warn!("Writer for connection {} did not finish, aborting", generation);
            writer.abort();
        }
        reader.abort();

        info!("Connection {} closed", generation);
    }

    /// Tear down the current connection without a farewell
    pub fn drop_connection(&mut self) {
        if let Some(link) = self.link.take() {
            debug!("Dropping connection {}", link.generation);
            link.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    generation: u64,
    events: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(msg) = outbound.recv().await {
        let result = match msg {
            Outbound::Control(control) => {
                debug!("Sending {:?}", control);
                match control.to_json() {
                    Ok(json) => sink.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!("Failed to encode {:?}: {}", control, e);
                        continue;
                    }
                }
            }
            Outbound::Audio(bytes) => sink.send(Message::Binary(bytes.into())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                return;
            }
        };

        if let Err(e) = result {
            let _ = events.send(Inbound {
                generation,
                event: TransportEvent::Failed(format!("write failed: {}", e)),
            });
            return;
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    events: mpsc::UnboundedSender<Inbound>,
) {
    let emit = |event| {
        let _ = events.send(Inbound { generation, event });
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => match ServerMessage::parse(text.as_str()) {
                Ok(msg) => emit(TransportEvent::Control(msg)),
                Err(e) => emit(TransportEvent::Malformed(e.to_string())),
            },
            Ok(Message::Binary(data)) => emit(TransportEvent::Audio(data.to_vec())),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by peer".to_string());
                emit(TransportEvent::Closed { reason });
                return;
            }
            Ok(_) => {}
            Err(e) => {
                emit(TransportEvent::Failed(format!("read failed: {}", e)));
                return;
            }
        }
    }

    emit(TransportEvent::Closed {
        reason: "stream ended".to_string(),
    });
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
