//! Short-lived inter-service JWTs (ES256K), used to authenticate shadow
//! repos to the chat and moderation services.

use base64::Engine;
use chrono::Utc;
use k256::ecdsa::SigningKey;
use serde_json::json;

use crate::error::{AtprotoError, Result};
use crate::plc;

const LIFETIME_SECS: i64 = 60;

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Builds a service JWT issued by `repo_did`, audience `aud`, optionally
/// scoped to one XRPC method via `lxm`.
pub fn service_jwt(
    aud: &str,
    repo_did: &str,
    signing_key: &[u8],
    lxm: Option<&str>,
) -> Result<String> {
    let key =
        SigningKey::from_slice(signing_key).map_err(|e| AtprotoError::Crypto(e.to_string()))?;

    let header = json!({"typ": "JWT", "alg": "ES256K"});
    let mut payload = json!({
        "iss": repo_did,
        "aud": aud,
        "exp": Utc::now().timestamp() + LIFETIME_SECS,
    });
    if let Some(lxm) = lxm {
        payload["lxm"] = json!(lxm);
    }

    let signing_input =
        format!("{}.{}", b64(&serde_json::to_vec(&header)?), b64(&serde_json::to_vec(&payload)?));
    let sig = plc::sign(&key, signing_input.as_bytes());
    Ok(format!("{signing_input}.{}", b64(&sig)))
}
