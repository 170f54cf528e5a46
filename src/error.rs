//! Error taxonomy for voice sessions.
//!
//! Capture backends report [`CaptureError`]; everything that can change the
//! user-visible session status is expressed as a [`SessionError`].

use serde::Serialize;
use thiserror::Error;

/// Failures raised by a capture backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The platform refused access to the capture device
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    /// The device went away while capturing
    #[error("capture device released: {0}")]
    DeviceReleased(String),

    /// Anything else the backend could not do (missing device, bad file, ...)
    #[error("capture backend error: {0}")]
    Backend(String),
}

/// Errors surfaced to the session state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("capture device released: {0}")]
    DeviceReleased(String),

    #[error("session already active")]
    AlreadyActive,

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Stable, serializable name of an error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    ConnectionFailed,
    MalformedMessage,
    DeviceReleased,
    AlreadyActive,
    Backend,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SessionError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            SessionError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            SessionError::DeviceReleased(_) => ErrorKind::DeviceReleased,
            SessionError::AlreadyActive => ErrorKind::AlreadyActive,
            SessionError::Backend(_) => ErrorKind::Backend,
        }
    }
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            CaptureError::DeviceReleased(msg) => SessionError::DeviceReleased(msg),
            CaptureError::Backend(msg) => SessionError::Backend(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_errors_map_to_session_errors() {
        let denied: SessionError = CaptureError::PermissionDenied("nope".into()).into();
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let released: SessionError = CaptureError::DeviceReleased("unplugged".into()).into();
        assert_eq!(released.kind(), ErrorKind::DeviceReleased);
    }
}
