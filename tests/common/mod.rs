// Shared helpers for integration tests
//
// `MockAgent` is a local WebSocket server standing in for the triage agent.
// Each accepted connection is handed to the test as an `AgentConnection`
// that records what the client sent and lets the test script replies.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use triage_voice::audio::{AudioOutput, AudioSource, CaptureConfig};
use triage_voice::session::{PlaybackConfig, SessionConfig, SessionState};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockAgent {
    pub url: String,
    accepted: Arc<AtomicUsize>,
    connections: mpsc::UnboundedReceiver<AgentConnection>,
    accept_task: Option<JoinHandle<()>>,
}

impl MockAgent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let (received_tx, received_rx) = mpsc::unbounded_channel();
                let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
                let (mut sink, mut stream) = ws.split();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            incoming = stream.next() => match incoming {
                                Some(Ok(msg)) => {
                                    let closing = msg.is_close();
                                    let _ = received_tx.send(msg);
                                    if closing {
                                        break;
                                    }
                                }
                                _ => break,
                            },
                            outgoing = outgoing_rx.recv() => match outgoing {
                                Some(msg) => {
                                    let closing = msg.is_close();
                                    if sink.send(msg).await.is_err() || closing {
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                });

                let _ = conn_tx.send(AgentConnection {
                    received: received_rx,
                    outgoing: outgoing_tx,
                });
            }
        });

        Self {
            url,
            accepted,
            connections: conn_rx,
            accept_task: Some(accept_task),
        }
    }

    /// Wait for the client to connect
    pub async fn next_connection(&mut self) -> AgentConnection {
        tokio::time::timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("client did not connect")
            .expect("accept loop ended")
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close the listening socket; later connects are refused
    pub async fn stop_accepting(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

pub struct AgentConnection {
    received: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl AgentConnection {
    pub fn send_text(&self, json: &str) {
        self.outgoing.send(Message::Text(json.to_string().into())).unwrap();
    }

    pub fn send_audio(&self, pcm: Vec<u8>) {
        self.outgoing.send(Message::Binary(pcm.into())).unwrap();
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    /// Next message from the client, or `None` once it is gone
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(TIMEOUT, self.received.recv())
            .await
            .expect("timed out waiting for client message")
    }

    /// Next text message, skipping audio
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.recv().await? {
                Message::Text(text) => return Some(text.to_string()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Collect `n` binary frames, failing on anything else but pings
    pub async fn binary_frames(&mut self, n: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::with_capacity(n);
        while frames.len() < n {
            match self.recv().await.expect("client went away") {
                Message::Binary(data) => frames.push(data.to_vec()),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected message {:?}", other),
            }
        }
        frames
    }

    /// Everything the client sent so far, without waiting
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.received.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// Session settings for tests: silent capture in 10ms blocks, no audio out,
/// short timers
pub fn test_config(url: &str) -> SessionConfig {
    SessionConfig {
        endpoint: url.to_string(),
        auth_token: None,
        capture: CaptureConfig {
            source: AudioSource::Silence,
            block_size: 480,
            synthetic_sample_rate: 48000,
            ..CaptureConfig::default()
        },
        playback: PlaybackConfig {
            output: AudioOutput::Null,
            sample_rate: 16000,
        },
        reconnect_delay: Duration::from_millis(200),
        max_reconnect_attempts: 1,
        guard_delay: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
    }
}

/// `duration` of 16kHz PCM at a constant level
pub fn pcm_chunk(duration: Duration, level: i16) -> Vec<u8> {
    let samples = (16000 * duration.as_millis() / 1000) as usize;
    std::iter::repeat(level)
        .take(samples)
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

pub async fn wait_for_state(
    states: &mut watch::Receiver<SessionState>,
    pred: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    tokio::time::timeout(TIMEOUT, states.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("session dropped")
        .clone()
}
