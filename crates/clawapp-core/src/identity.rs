//! Persisted Ed25519 device identity.
//!
//! The bridge presents itself to the gateway as a single device. The device
//! id is the hex SHA-256 of the raw 32-byte public key, the same derivation
//! the gateway applies when it verifies the connect signature.

use crate::error::{ClawError, ClawResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::info;

/// Compute the full hex-encoded SHA-256 fingerprint of a raw public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(hash)
}

/// A read-only device keypair, created once per process.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

/// On-disk representation of a [`DeviceIdentity`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceKeyFile {
    device_id: String,
    /// base64url (no padding) raw public key.
    public_key: String,
    /// base64url (no padding) 32-byte secret seed.
    private_key: String,
}

impl DeviceIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Build an identity from an existing signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let device_id = fingerprint(signing_key.verifying_key().as_bytes());
        Self {
            device_id,
            signing_key,
        }
    }

    /// Load the identity stored at `path`, or create and persist a new one.
    pub fn load_or_create(path: &Path) -> ClawResult<Self> {
        if path.exists() {
            let identity = Self::load(path)?;
            info!(path = %path.display(), device = %identity.short_id(), "loaded device identity");
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(path = %path.display(), device = %identity.short_id(), "created device identity");
        Ok(identity)
    }

    fn load(path: &Path) -> ClawResult<Self> {
        let content = fs::read_to_string(path)?;
        let file: DeviceKeyFile = serde_json::from_str(&content)
            .map_err(|e| ClawError::Identity(format!("cannot parse {}: {e}", path.display())))?;

        let seed = URL_SAFE_NO_PAD
            .decode(file.private_key.as_bytes())
            .map_err(|e| ClawError::Identity(format!("invalid private key encoding: {e}")))?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| ClawError::Identity("invalid private key length (expected 32 bytes)".into()))?;

        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));
        if identity.device_id != file.device_id || identity.public_key_base64url() != file.public_key {
            return Err(ClawError::Identity(format!(
                "{} does not match its own key material",
                path.display()
            )));
        }
        Ok(identity)
    }

    fn save(&self, path: &Path) -> ClawResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = DeviceKeyFile {
            device_id: self.device_id.clone(),
            public_key: self.public_key_base64url(),
            private_key: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Stable device id (hex SHA-256 of the public key).
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// First 12 characters of the device id, for logs.
    pub fn short_id(&self) -> &str {
        &self.device_id[..12.min(self.device_id.len())]
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw public key, base64url without padding.
    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign `payload` and return the base64url signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.sign(payload).to_bytes())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}
