//! Signed connect frame for the gateway handshake.
//!
//! After the gateway sends `connect.challenge`, the bridge replies with a
//! `connect` request that carries the shared token and a device block. The
//! device signature covers a pipe-delimited payload:
//!
//! ```text
//! v2|deviceId|clientId|clientMode|role|scope,scope,...|signedAtMs|token|nonce
//! ```

use crate::frames::RequestFrame;
use crate::identity::DeviceIdentity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::{json, Value};

/// Gateway protocol version spoken by the bridge (min == max).
pub const PROTOCOL_VERSION: u32 = 3;

pub const CONNECT_METHOD: &str = "connect";

const SIGNATURE_VERSION: &str = "v2";

/// How the bridge describes itself in the `connect` params.
#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: String,
    pub user_agent: String,
}

impl Default for ClientDescriptor {
    fn default() -> Self {
        Self {
            id: "gateway-client".into(),
            version: "1.0.0".into(),
            platform: "web".into(),
            mode: "backend".into(),
            role: "operator".into(),
            scopes: [
                "operator.admin",
                "operator.approvals",
                "operator.pairing",
                "operator.read",
                "operator.write",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            locale: "zh-CN".into(),
            user_agent: "OpenClaw-Mobile-Proxy/1.0.0".into(),
        }
    }
}

/// Build the exact byte string the device signs.
pub fn signature_payload(
    device_id: &str,
    client: &ClientDescriptor,
    signed_at_ms: u64,
    token: &str,
    nonce: &str,
) -> String {
    [
        SIGNATURE_VERSION,
        device_id,
        &client.id,
        &client.mode,
        &client.role,
        &client.scopes.join(","),
        &signed_at_ms.to_string(),
        token,
        nonce,
    ]
    .join("|")
}

/// Build the `connect` request answering a challenge.
///
/// An empty `nonce` is permitted when the gateway never sent a challenge.
pub fn build_connect_frame(
    identity: &DeviceIdentity,
    client: &ClientDescriptor,
    token: &str,
    nonce: &str,
    signed_at_ms: u64,
) -> RequestFrame {
    let payload = signature_payload(identity.device_id(), client, signed_at_ms, token, nonce);
    let signature = identity.sign(payload.as_bytes());

    let params = json!({
        "minProtocol": PROTOCOL_VERSION,
        "maxProtocol": PROTOCOL_VERSION,
        "client": {
            "id": client.id,
            "version": client.version,
            "platform": client.platform,
            "mode": client.mode,
        },
        "role": client.role,
        "scopes": client.scopes,
        "caps": [],
        "auth": { "token": token },
        "device": {
            "id": identity.device_id(),
            "publicKey": identity.public_key_base64url(),
            "signedAt": signed_at_ms,
            "nonce": nonce,
            "signature": signature,
        },
        "locale": client.locale,
        "userAgent": client.user_agent,
    });

    RequestFrame {
        id: format!("connect-{}", uuid::Uuid::new_v4()),
        method: CONNECT_METHOD.into(),
        params,
    }
}

/// Check the device signature inside `connect` params, as a gateway would.
pub fn verify_connect_params(params: &Value, client: &ClientDescriptor) -> bool {
    let device = &params["device"];
    let (Some(device_id), Some(public_key), Some(signed_at), Some(nonce), Some(signature)) = (
        device["id"].as_str(),
        device["publicKey"].as_str(),
        device["signedAt"].as_u64(),
        device["nonce"].as_str(),
        device["signature"].as_str(),
    ) else {
        return false;
    };
    let token = params["auth"]["token"].as_str().unwrap_or_default();

    let Ok(key_bytes) = URL_SAFE_NO_PAD.decode(public_key) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    if crate::identity::fingerprint(&key_bytes) != device_id {
        return false;
    }
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };

    let payload = signature_payload(device_id, client, signed_at, token, nonce);
    key.verify(payload.as_bytes(), &sig).is_ok()
}
