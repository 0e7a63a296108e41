//! Persisted entities: users, objects, followers, stream cursors and relays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::protocol::Protocol;

/// A `(uri, protocol)` pair binding an Object or User to its shadow
/// counterpart on another protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub uri: String,
    pub protocol: Protocol,
}

impl Target {
    pub fn new(uri: impl Into<String>, protocol: Protocol) -> Self {
        Target { uri: uri.into(), protocol }
    }
}

/// Why a user is excluded from bridging. `None` status means active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserStatus {
    Blocked,
    NoProfile,
    Nip05Missing,
    Tombstoned,
}

/// A bridged or native user, keyed by `(protocol, native id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub protocol: Protocol,
    pub id: String,
    /// Protocols this user has opted in to being bridged into.
    #[serde(default)]
    pub enabled_protocols: Vec<Protocol>,
    /// Shadow identities we own for this user on other protocols.
    #[serde(default)]
    pub copies: Vec<Target>,
    /// Key of the cached profile Object.
    #[serde(default)]
    pub obj_key: Option<String>,
    /// Key of the cached NIP-65 relay-list Object (Nostr users).
    #[serde(default)]
    pub relays_key: Option<String>,
    #[serde(default)]
    pub status: Option<UserStatus>,
    /// Resolved handle, refreshed whenever the profile is reloaded.
    #[serde(default)]
    pub handle: Option<String>,
    /// NIP-05 identifier we've resolved and verified for this user.
    #[serde(default)]
    pub valid_nip05: Option<String>,
    /// Hex-encoded x-only pubkey for native Nostr users.
    #[serde(default)]
    pub nostr_pubkey: Option<String>,
    /// secp256k1 repo signing key for the user's ATProto shadow.
    #[serde(default, with = "opt_bytes")]
    pub signing_key: Option<Vec<u8>>,
    /// secp256k1 PLC rotation key for the user's ATProto shadow.
    #[serde(default, with = "opt_bytes")]
    pub rotation_key: Option<Vec<u8>>,
    /// secp256k1 key for the user's Nostr shadow.
    #[serde(default, with = "opt_bytes")]
    pub nostr_privkey: Option<Vec<u8>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

mod opt_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value.map(|s| hex::decode(s).map_err(serde::de::Error::custom)).transpose()
    }
}

impl User {
    pub fn new(protocol: Protocol, id: impl Into<String>) -> Self {
        let now = Utc::now();
        User {
            protocol,
            id: id.into(),
            enabled_protocols: Vec::new(),
            copies: Vec::new(),
            obj_key: None,
            relays_key: None,
            status: None,
            handle: None,
            valid_nip05: None,
            nostr_pubkey: None,
            signing_key: None,
            rotation_key: None,
            nostr_privkey: None,
            created: now,
            updated: now,
        }
    }

    /// Datastore key: `{protocol label} {native id}`.
    pub fn key(&self) -> String {
        user_key(self.protocol, &self.id)
    }

    pub fn is_enabled(&self, protocol: Protocol) -> bool {
        self.status.is_none() && self.enabled_protocols.contains(&protocol)
    }

    /// The shadow identity uri this user owns on `protocol`, if any.
    pub fn get_copy(&self, protocol: Protocol) -> Option<&str> {
        if self.protocol == protocol {
            return Some(&self.id);
        }
        self.copies.iter().find(|t| t.protocol == protocol).map(|t| t.uri.as_str())
    }

    pub fn add_copy(&mut self, target: Target) {
        if !self.copies.contains(&target) {
            self.copies.push(target);
        }
    }

    pub fn handle_or_id(&self) -> &str {
        self.handle.as_deref().unwrap_or(&self.id)
    }

    /// Hex-encoded x-only pubkey of this user's Nostr identity: the stored
    /// pubkey for native users, derived from the shadow key otherwise.
    pub fn hex_pubkey(&self) -> Result<String> {
        if let Some(pubkey) = &self.nostr_pubkey {
            return Ok(pubkey.clone());
        }
        let privkey = self
            .nostr_privkey
            .as_deref()
            .ok_or_else(|| CoreError::NotFound(format!("{} has no nostr key", self.key())))?;
        let signing = k256::schnorr::SigningKey::from_bytes(privkey)
            .map_err(|e| CoreError::Crypto(e.to_string()))?;
        Ok(hex::encode(signing.verifying_key().to_bytes()))
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

pub fn user_key(protocol: Protocol, id: &str) -> String {
    format!("{} {}", protocol.label(), id)
}

/// A cached activity, object, profile, or DID document, keyed by canonical
/// URI (`at://…`, `did:…`, `https://…`, `nostr:…`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Object {
    pub id: String,
    #[serde(default)]
    pub source_protocol: Option<Protocol>,
    /// `app.bsky.*` record, for ATProto-sourced objects.
    #[serde(default)]
    pub bsky: Option<Value>,
    /// Signed event, for Nostr-sourced objects.
    #[serde(default)]
    pub nostr: Option<Value>,
    /// Raw payload for DID documents.
    #[serde(default)]
    pub raw: Option<Value>,
    /// Canonical AS1 form, populated lazily by the conversion facades.
    #[serde(default)]
    pub our_as1: Option<Value>,
    #[serde(default)]
    pub copies: Vec<Target>,
    #[serde(default)]
    pub deleted: bool,
    pub updated: DateTime<Utc>,
}

impl Object {
    pub fn new(id: impl Into<String>) -> Self {
        Object { id: id.into(), updated: Utc::now(), ..Default::default() }
    }

    pub fn with_as1(id: impl Into<String>, as1: Value) -> Self {
        Object { our_as1: Some(as1), ..Object::new(id) }
    }

    /// The canonical AS1 form, if it has been computed or supplied.
    pub fn as1(&self) -> Option<&Value> {
        self.our_as1.as_ref()
    }

    /// Activity verb or object type, from the AS1 form.
    pub fn object_type(&self) -> Option<&str> {
        self.as1().and_then(crate::as1::object_type)
    }

    pub fn get_copy(&self, protocol: Protocol) -> Option<&str> {
        self.copies.iter().find(|t| t.protocol == protocol).map(|t| t.uri.as_str())
    }

    pub fn add_copy(&mut self, target: Target) {
        if !self.copies.contains(&target) {
            self.copies.push(target);
        }
    }

    pub fn remove_copies(&mut self, protocol: Protocol) {
        self.copies.retain(|t| t.protocol != protocol);
    }
}

/// Highest sequence number acknowledged for one `(host, stream NSID)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub host: String,
    pub nsid: String,
    pub cursor: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Cursor {
    pub fn new(host: impl Into<String>, nsid: impl Into<String>) -> Self {
        let now = Utc::now();
        Cursor { host: host.into(), nsid: nsid.into(), cursor: 0, created: now, updated: now }
    }

    pub fn key(&self) -> String {
        cursor_key(&self.host, &self.nsid)
    }
}

pub fn cursor_key(host: &str, nsid: &str) -> String {
    format!("{host} {nsid}")
}

/// A Nostr relay we subscribe to, keyed by websocket URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub url: String,
    /// Unix-seconds cursor: `created_at` of the newest event seen.
    #[serde(default)]
    pub since: Option<u64>,
    pub updated: DateTime<Utc>,
}

impl Relay {
    pub fn new(url: impl Into<String>) -> Self {
        Relay { url: url.into(), since: None, updated: Utc::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowerStatus {
    Active,
    Inactive,
}

/// A follow edge between two users, in either direction across the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follower {
    /// `User::key()` of the follower.
    pub from: String,
    /// `User::key()` of the followee.
    pub to: String,
    /// Object key of the follow activity that created this edge.
    #[serde(default)]
    pub follow: Option<String>,
    pub status: FollowerStatus,
    pub updated: DateTime<Utc>,
}

impl Follower {
    pub fn new(from: impl Into<String>, to: impl Into<String>, follow: Option<String>) -> Self {
        Follower {
            from: from.into(),
            to: to.into(),
            follow,
            status: FollowerStatus::Active,
            updated: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        follower_key(&self.from, &self.to)
    }
}

pub fn follower_key(from: &str, to: &str) -> String {
    format!("{from}\u{0}{to}")
}

/// A remote blob we've fetched and re-hosted, keyed by source URL. Dedupes
/// image/video fetches across sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBlob {
    pub url: String,
    pub cid: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// DIDs of shadow repos that reference this blob.
    #[serde(default)]
    pub repos: Vec<String>,
    pub updated: DateTime<Utc>,
}

impl RemoteBlob {
    /// The `$type: blob` object referenced from records.
    pub fn as_object(&self) -> Value {
        serde_json::json!({
            "$type": "blob",
            "ref": { "$link": self.cid },
            "mimeType": self.mime_type,
            "size": self.size,
        })
    }
}
