//! did:plc directory client: key encoding, genesis operations, resolution.

use async_trait::async_trait;
use base64::Engine;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{AtprotoError, Result};

pub const DID_KEY_PREFIX: &str = "did:key:";

/// secp256k1 multicodec prefix, varint-encoded.
const SECP256K1_MULTICODEC: [u8; 2] = [0xe7, 0x01];

/// Formats a secp256k1 public key as a `did:key:` string (compressed point,
/// multicodec prefix, base58btc multibase).
pub fn format_did_key(key: &VerifyingKey) -> String {
    let mut bytes = SECP256K1_MULTICODEC.to_vec();
    bytes.extend_from_slice(key.to_encoded_point(true).as_bytes());
    format!("{DID_KEY_PREFIX}{}", multibase::encode(multibase::Base::Base58Btc, bytes))
}

pub fn parse_did_key(did: &str) -> Result<VerifyingKey> {
    let multikey = did
        .strip_prefix(DID_KEY_PREFIX)
        .ok_or_else(|| AtprotoError::InvalidDid(did.to_string()))?;
    let (_, decoded) =
        multibase::decode(multikey).map_err(|e| AtprotoError::InvalidDid(e.to_string()))?;
    if decoded.len() < 2 || decoded[..2] != SECP256K1_MULTICODEC {
        return Err(AtprotoError::InvalidDid(format!("unsupported multikey type in {did}")));
    }
    VerifyingKey::from_sec1_bytes(&decoded[2..])
        .map_err(|e| AtprotoError::Crypto(e.to_string()))
}

/// Signs `msg` with ECDSA over secp256k1, normalizing to low-S form.
pub fn sign(key: &SigningKey, msg: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(msg);
    signature.normalize_s().unwrap_or(signature).to_bytes().to_vec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

/// The subset of a DID document the bridge reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default, rename = "alsoKnownAs")]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

impl DidDocument {
    pub fn from_value(value: &Value) -> Result<DidDocument> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// The handle from the first `at://` alias, if any.
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as.iter().find_map(|aka| aka.strip_prefix("at://"))
    }

    pub fn pds_endpoint(&self) -> Option<&str> {
        let full_id = format!("{}#atproto_pds", self.id);
        self.service
            .iter()
            .find(|s| s.id == "#atproto_pds" || s.id == full_id)
            .map(|s| s.service_endpoint.as_str())
    }
}

pub struct CreateDidParams {
    pub handle: String,
    pub pds_url: String,
    /// Extra alias recorded alongside the handle, eg the user's native id.
    pub also_known_as: Option<String>,
}

pub struct CreatedDid {
    pub did: String,
    pub doc: Value,
    pub signing_key: Vec<u8>,
    pub rotation_key: Vec<u8>,
}

/// The PLC directory oracle.
#[async_trait]
pub trait PlcDirectory: Send + Sync {
    /// Mints a new did:plc with fresh rotation and signing keys.
    async fn create(&self, params: CreateDidParams) -> Result<CreatedDid>;
    /// Resolves a DID to its raw document.
    async fn resolve(&self, did: &str) -> Result<Value>;
    /// Submits a signed PLC operation for an existing DID.
    async fn submit(&self, did: &str, operation: Value) -> Result<()>;
}

/// HTTP client for a real PLC directory.
pub struct PlcClient {
    /// Base URL, eg `https://plc.directory`.
    base: String,
    http: reqwest::Client,
}

impl PlcClient {
    pub fn new(base: impl Into<String>, http: reqwest::Client) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        PlcClient { base, http }
    }
}

/// Builds and signs a genesis operation, returning `(did, signed op)`.
///
/// The DID is the base32 of the sha256 of the signed genesis operation,
/// truncated to 24 characters.
pub fn genesis_operation(
    params: &CreateDidParams,
    signing_key: &SigningKey,
    rotation_key: &SigningKey,
) -> Result<(String, Value)> {
    let mut aka = vec![format!("at://{}", params.handle)];
    if let Some(extra) = &params.also_known_as {
        if !aka.contains(extra) {
            aka.push(extra.clone());
        }
    }
    let mut op = json!({
        "type": "plc_operation",
        "rotationKeys": [format_did_key(rotation_key.verifying_key())],
        "verificationMethods": {
            "atproto": format_did_key(signing_key.verifying_key()),
        },
        "alsoKnownAs": aka,
        "services": {
            "atproto_pds": {
                "type": "AtprotoPersonalDataServer",
                "endpoint": params.pds_url,
            },
        },
        "prev": null,
    });

    let unsigned = serde_ipld_dagcbor::to_vec(&op)
        .map_err(|e| AtprotoError::Plc(format!("encoding operation: {e}")))?;
    let sig = sign(rotation_key, &unsigned);
    op["sig"] = Value::String(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig));

    let signed = serde_ipld_dagcbor::to_vec(&op)
        .map_err(|e| AtprotoError::Plc(format!("encoding operation: {e}")))?;
    let digest = Sha256::digest(&signed);
    let encoded = multibase::Base::Base32Lower.encode(digest);
    let did = format!("did:plc:{}", &encoded[..24]);
    Ok((did, op))
}

/// The DID document a genesis operation denotes, rendered locally so we can
/// cache it without a directory round trip.
pub fn doc_for_operation(did: &str, op: &Value) -> Value {
    let endpoint = op["services"]["atproto_pds"]["endpoint"].clone();
    let signing_did_key = op["verificationMethods"]["atproto"].clone();
    json!({
        "id": did,
        "alsoKnownAs": op["alsoKnownAs"].clone(),
        "verificationMethod": [{
            "id": format!("{did}#atproto"),
            "type": "Multikey",
            "controller": did,
            "publicKeyMultibase": signing_did_key.as_str()
                .and_then(|k| k.strip_prefix(DID_KEY_PREFIX)).unwrap_or_default(),
        }],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": endpoint,
        }],
    })
}

#[async_trait]
impl PlcDirectory for PlcClient {
    async fn create(&self, params: CreateDidParams) -> Result<CreatedDid> {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let rotation_key = SigningKey::random(&mut rand::thread_rng());
        let (did, op) = genesis_operation(&params, &signing_key, &rotation_key)?;

        self.submit(&did, op.clone()).await?;

        Ok(CreatedDid {
            doc: doc_for_operation(&did, &op),
            did,
            signing_key: signing_key.to_bytes().to_vec(),
            rotation_key: rotation_key.to_bytes().to_vec(),
        })
    }

    async fn resolve(&self, did: &str) -> Result<Value> {
        let url = format!("{}/{did}", self.base);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AtprotoError::HttpStatus(resp.status().as_u16(), url));
        }
        Ok(resp.json().await?)
    }

    async fn submit(&self, did: &str, operation: Value) -> Result<()> {
        let url = format!("{}/{did}", self.base);
        let resp = self.http.post(&url).json(&operation).send().await?;
        if !resp.status().is_success() {
            return Err(AtprotoError::HttpStatus(resp.status().as_u16(), url));
        }
        Ok(())
    }
}
