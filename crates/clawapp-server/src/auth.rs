//! Client credential check.

use crate::error::{BridgeError, BridgeResult};
use sha2::{Digest, Sha256};

/// Validates the token a client presents on connect.
///
/// With no proxy token configured every client is accepted.
#[derive(Debug, Clone, Default)]
pub struct ClientAuth {
    expected: Option<[u8; 32]>,
}

impl ClientAuth {
    pub fn new(proxy_token: Option<&str>) -> Self {
        Self {
            expected: proxy_token.map(digest),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    pub fn validate(&self, presented: Option<&str>) -> BridgeResult<()> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };
        let presented = digest(presented.unwrap_or_default());
        // Constant-time over the digests.
        let diff = expected
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(BridgeError::AuthenticationFailure)
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}
