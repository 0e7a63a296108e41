//! The NIP-01 event model: canonical serialization, ids, and BIP-340
//! signatures.

use k256::schnorr::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{NostrError, Result};

pub const KIND_PROFILE: u64 = 0;
pub const KIND_NOTE: u64 = 1;
pub const KIND_CONTACTS: u64 = 3;
pub const KIND_DELETE: u64 = 5;
pub const KIND_REPOST: u64 = 6;
pub const KIND_REACTION: u64 = 7;
pub const KIND_RELAYS: u64 = 10002;
pub const KIND_ARTICLE: u64 = 30023;

/// Kinds the bridge translates.
pub const SUPPORTED_KINDS: &[u64] = &[
    KIND_PROFILE,
    KIND_NOTE,
    KIND_CONTACTS,
    KIND_DELETE,
    KIND_REPOST,
    KIND_REACTION,
    KIND_RELAYS,
    KIND_ARTICLE,
];

/// Kinds requested in the authors filter. Reactions are excluded; native
/// users' likes would flood the queue.
pub const AUTHOR_FILTER_KINDS: &[u64] = &[
    KIND_PROFILE,
    KIND_NOTE,
    KIND_CONTACTS,
    KIND_DELETE,
    KIND_REPOST,
    KIND_RELAYS,
    KIND_ARTICLE,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl Event {
    /// The canonical serialization the id is the hash of:
    /// `[0, pubkey, created_at, kind, tags, content]`, compact JSON.
    fn id_payload(
        pubkey: &str,
        created_at: u64,
        kind: u64,
        tags: &[Vec<String>],
        content: &str,
    ) -> String {
        json!([0, pubkey, created_at, kind, tags, content]).to_string()
    }

    pub fn compute_id(&self) -> String {
        let payload =
            Self::id_payload(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        hex::encode(Sha256::digest(payload.as_bytes()))
    }

    /// Builds and signs a new event with the given key.
    pub fn sign(
        key: &SigningKey,
        created_at: u64,
        kind: u64,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Event> {
        let pubkey = hex::encode(key.verifying_key().to_bytes());
        let id_bytes =
            Sha256::digest(Self::id_payload(&pubkey, created_at, kind, &tags, &content).as_bytes());
        let mut aux = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut aux);
        let sig = key
            .sign_raw(id_bytes.as_slice(), &aux)
            .map_err(|e| NostrError::Crypto(e.to_string()))?;
        Ok(Event {
            id: hex::encode(id_bytes),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.to_bytes()),
        })
    }

    /// Checks both the id and the signature. Malformed hex fails closed.
    pub fn verify(&self) -> bool {
        if self.compute_id() != self.id {
            return false;
        }
        let Ok(pubkey_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(verifying) = VerifyingKey::from_bytes(&pubkey_bytes) else {
            return false;
        };
        let (Ok(id_bytes), Ok(sig_bytes)) = (hex::decode(&self.id), hex::decode(&self.sig)) else {
            return false;
        };
        let Ok(signature) = k256::schnorr::Signature::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        verifying.verify_raw(&id_bytes, &signature).is_ok()
    }

    pub fn from_value(value: &Value) -> Result<Event> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("event serializes")
    }

    /// Pubkeys this event mentions through `p` tags.
    pub fn p_tags(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.first().map(String::as_str) == Some("p"))
            .filter_map(|tag| tag.get(1).map(String::as_str))
            .collect()
    }
}
