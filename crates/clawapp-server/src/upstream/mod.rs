//! Upstream side: gateway connection, handshake and per-session socket tasks.

pub mod connector;
pub mod link;

pub use connector::{Handshaken, UpstreamConnector};
