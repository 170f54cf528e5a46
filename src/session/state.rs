//! Session status and its transition table.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::error::{ErrorKind, SessionError};

/// User-visible session status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Error { kind: ErrorKind, message: String },
}

/// Events that move the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    /// Transport opened; `playback_active` if agent audio is still queued
    TransportOpen { playback_active: bool },
    ChunkEnqueued,
    /// Playback queue empty and guard delay elapsed
    QueueDrained,
    TransportLost,
    Fatal(SessionError),
    Stop,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition {event:?} from {from}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: Transition,
}

impl SessionState {
    /// Next state for `event`, or `InvalidTransition` if the pair is not in
    /// the table
    pub fn apply(&self, event: Transition) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;

        let next = match (self, &event) {
            (_, Transition::Stop) => Idle,
            (_, Transition::Fatal(err)) => Error {
                kind: err.kind(),
                message: err.to_string(),
            },
            (Idle | Error { .. }, Transition::Start) => Connecting,
            (Connecting, Transition::TransportOpen { playback_active }) => {
                if *playback_active {
                    Speaking
                } else {
                    Listening
                }
            }
            (Listening | Speaking, Transition::ChunkEnqueued) => Speaking,
            (Speaking, Transition::QueueDrained) => Listening,
            (Listening | Speaking, Transition::TransportLost) => Connecting,
            _ => {
                return Err(InvalidTransition {
                    from: self.name(),
                    event,
                })
            }
        };

        Ok(next)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Error { .. } => "error",
        }
    }

    /// Only a listening session transmits captured audio
    pub fn accepts_frames(&self) -> bool {
        matches!(self, SessionState::Listening)
    }

    /// A session is live from start until stop or error
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Listening | SessionState::Speaking
        )
    }

    /// Short human-readable line for the terminal or a UI
    pub fn status_text(&self) -> String {
        match self {
            SessionState::Idle => "Ready".to_string(),
            SessionState::Connecting => "Connecting...".to_string(),
            SessionState::Listening => "Listening...".to_string(),
            SessionState::Speaking => "Agent speaking...".to_string(),
            SessionState::Error { message, .. } => format!("Error: {}", message),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_state() -> SessionState {
        SessionState::Idle
            .apply(Transition::Fatal(SessionError::ConnectionFailed("refused".into())))
            .unwrap()
    }

    #[test]
    fn test_happy_path() {
        let s = SessionState::Idle.apply(Transition::Start).unwrap();
        assert_eq!(s, SessionState::Connecting);

        let s = s.apply(Transition::TransportOpen { playback_active: false }).unwrap();
        assert_eq!(s, SessionState::Listening);

        let s = s.apply(Transition::ChunkEnqueued).unwrap();
        assert_eq!(s, SessionState::Speaking);
        let s = s.apply(Transition::ChunkEnqueued).unwrap();
        assert_eq!(s, SessionState::Speaking);

        let s = s.apply(Transition::QueueDrained).unwrap();
        assert_eq!(s, SessionState::Listening);
    }

    #[test]
    fn test_reopen_with_queued_audio_resumes_speaking() {
        let s = SessionState::Speaking.apply(Transition::TransportLost).unwrap();
        assert_eq!(s, SessionState::Connecting);
        assert_eq!(
            s.apply(Transition::TransportOpen { playback_active: true }).unwrap(),
            SessionState::Speaking
        );
    }

    #[test]
    fn test_idle_only_accepts_start_and_stop() {
        let idle = SessionState::Idle;
        assert!(idle.apply(Transition::Start).is_ok());
        assert_eq!(idle.apply(Transition::Stop).unwrap(), SessionState::Idle);

        for event in [
            Transition::TransportOpen { playback_active: false },
            Transition::ChunkEnqueued,
            Transition::QueueDrained,
            Transition::TransportLost,
        ] {
            let err = idle.apply(event).unwrap_err();
            assert_eq!(err.from, "idle");
        }
    }

    #[test]
    fn test_stop_from_every_state() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Listening,
            SessionState::Speaking,
            error_state(),
        ] {
            assert_eq!(state.apply(Transition::Stop).unwrap(), SessionState::Idle);
        }
    }

    #[test]
    fn test_error_carries_kind_and_restarts() {
        let s = error_state();
        match &s {
            SessionState::Error { kind, message } => {
                assert_eq!(*kind, ErrorKind::ConnectionFailed);
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!s.is_active());
        assert_eq!(s.apply(Transition::Start).unwrap(), SessionState::Connecting);
    }

    #[test]
    fn test_drain_while_listening_is_invalid() {
        assert!(SessionState::Listening.apply(Transition::QueueDrained).is_err());
        assert!(SessionState::Connecting.apply(Transition::ChunkEnqueued).is_err());
    }

    #[test]
    fn test_only_listening_accepts_frames() {
        assert!(SessionState::Listening.accepts_frames());
        assert!(!SessionState::Speaking.accepts_frames());
        assert!(!SessionState::Connecting.accepts_frames());
        assert!(!SessionState::Idle.accepts_frames());
    }

    #[test]
    fn test_serializes_with_state_tag() {
        let json = serde_json::to_value(&SessionState::Listening).unwrap();
        assert_eq!(json, serde_json::json!({"state": "listening"}));

        let json = serde_json::to_value(&error_state()).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["kind"], "connection_failed");
    }
}
