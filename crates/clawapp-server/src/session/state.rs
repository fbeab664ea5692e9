//! Session state machine.

use std::fmt;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Connected,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Connecting -> Connecting` is a retry. Anything may close, and
    /// nothing leaves `Closed`.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Init, Connecting) | (Connecting, Connecting) | (Connecting, Connected) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnect,
    UpstreamClosed,
    IdleTimeout,
    LingerExpired,
    HandshakeFailed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Disconnect => "client disconnect",
            CloseReason::UpstreamClosed => "upstream closed",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::LingerExpired => "linger expired",
            CloseReason::HandshakeFailed => "handshake failed",
            CloseReason::Shutdown => "shutdown",
        })
    }
}
