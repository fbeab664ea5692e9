//! clawapp-core: Shared protocol library for the clawapp bridge.
//!
//! Provides the gateway frame types and JSON codec, the persisted Ed25519
//! device identity, and the signed connect-frame builder used during the
//! upstream handshake.

pub mod codec;
pub mod error;
pub mod frames;
pub mod handshake;
pub mod identity;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_frame};
pub use error::{ClawError, ClawResult};
pub use frames::{ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};
pub use handshake::{build_connect_frame, ClientDescriptor, PROTOCOL_VERSION};
pub use identity::{fingerprint, DeviceIdentity};
