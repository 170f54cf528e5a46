//! HTTP API for controlling the voice session
//!
//! - POST /session/start - Start a call
//! - POST /session/stop - Hang up
//! - GET /session/status - State and statistics
//! - GET /session/transcript - Transcript so far
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
