use crate::session::VoiceSession;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The one voice session this host drives
    pub session: Arc<VoiceSession>,
}

impl AppState {
    pub fn new(session: VoiceSession) -> Self {
        Self {
            session: Arc::new(session),
        }
    }
}
