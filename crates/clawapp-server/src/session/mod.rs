//! Session management: lifecycle, replay buffer, pending requests, push sinks.

pub mod correlator;
pub mod event_buffer;
pub mod lifecycle;
pub mod registry;
pub mod sink;
pub mod state;

pub use lifecycle::Session;
pub use registry::{Established, SessionRegistry};
pub use sink::SinkItem;
pub use state::CloseReason;
