pub mod client;
pub mod messages;

pub use client::{ConnectionManager, FrameOutcome, Inbound, ReconnectPolicy, TransportEvent};
pub use messages::{ClientMessage, MessageKind, ServerMessage};
