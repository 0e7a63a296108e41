//! Shadow-repo storage: the interface the bridge core consumes — load,
//! commit, activate/deactivate/tombstone, record lookups. The
//! content-addressed repository (MST, CAR export, relay broadcast) lives
//! behind this seam; the implementation here keeps records in the datastore,
//! which is all the bridge itself needs.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use bifrost_core::store::Datastore;

use crate::error::{AtprotoError, Result};

const S32_CHARS: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

static LAST_TID: AtomicU64 = AtomicU64::new(0);

/// Next monotonic TID record key: microsecond timestamp plus a 10-bit clock
/// id, base32-sortable.
pub fn next_tid() -> String {
    let micros = Utc::now().timestamp_micros().max(0) as u64;
    let mut candidate = micros;
    loop {
        let last = LAST_TID.load(Ordering::SeqCst);
        let next = candidate.max(last + 1);
        if LAST_TID
            .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            candidate = next;
            break;
        }
    }
    s32_encode((candidate << 10) & 0x7fff_ffff_ffff_ffff)
}

fn s32_encode(n: u64) -> String {
    (0..13).rev().map(|i| S32_CHARS[((n >> (5 * i)) & 31) as usize] as char).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoStatus {
    Deactivated,
    Tombstoned,
}

/// One shadow repository. `status: None` means active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub status: Option<RepoStatus>,
    #[serde(with = "hex_bytes")]
    pub signing_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rotation_key: Vec<u8>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

impl Repo {
    pub fn new(
        did: impl Into<String>,
        handle: Option<String>,
        signing_key: Vec<u8>,
        rotation_key: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Repo { did: did.into(), handle, status: None, signing_key, rotation_key, created: now, updated: now }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

/// One staged mutation of a shadow repo.
#[derive(Debug, Clone)]
pub struct RepoWrite {
    pub action: WriteAction,
    pub collection: String,
    pub rkey: String,
    pub record: Option<Value>,
}

impl RepoWrite {
    pub fn create(collection: impl Into<String>, rkey: impl Into<String>, record: Value) -> Self {
        RepoWrite {
            action: WriteAction::Create,
            collection: collection.into(),
            rkey: rkey.into(),
            record: Some(record),
        }
    }

    pub fn update(collection: impl Into<String>, rkey: impl Into<String>, record: Value) -> Self {
        RepoWrite {
            action: WriteAction::Update,
            collection: collection.into(),
            rkey: rkey.into(),
            record: Some(record),
        }
    }

    pub fn delete(collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        RepoWrite {
            action: WriteAction::Delete,
            collection: collection.into(),
            rkey: rkey.into(),
            record: None,
        }
    }
}

/// Storage seam for shadow repositories.
#[async_trait]
pub trait RepoStorage: Send + Sync {
    async fn load_repo(&self, did: &str) -> Result<Option<Repo>>;
    async fn create_repo(&self, repo: Repo) -> Result<()>;
    /// Applies all writes atomically. Update or delete of a missing record
    /// fails with `AtprotoError::Value`; commits to inactive repos fail with
    /// `AtprotoError::InactiveRepo`.
    async fn commit(&self, did: &str, writes: Vec<RepoWrite>) -> Result<()>;
    async fn activate_repo(&self, did: &str) -> Result<()>;
    async fn deactivate_repo(&self, did: &str) -> Result<()>;
    async fn tombstone_repo(&self, did: &str) -> Result<()>;
    async fn get_record(&self, did: &str, collection: &str, rkey: &str) -> Result<Option<Value>>;
    async fn list_records(&self, did: &str, collection: &str) -> Result<Vec<(String, Value)>>;
    async fn repo_by_handle(&self, handle: &str) -> Result<Option<Repo>>;
}

/// Datastore-backed implementation.
pub struct DatastoreRepoStorage {
    repos: sled::Tree,
    records: sled::Tree,
    handles: sled::Tree,
}

impl DatastoreRepoStorage {
    pub fn new(store: &Datastore) -> Result<Self> {
        Ok(DatastoreRepoStorage {
            repos: store.open_tree("atproto_repos").map_err(AtprotoError::Core)?,
            records: store.open_tree("atproto_records").map_err(AtprotoError::Core)?,
            handles: store.open_tree("atproto_repo_handles").map_err(AtprotoError::Core)?,
        })
    }

    fn record_key(did: &str, collection: &str, rkey: &str) -> Vec<u8> {
        let mut key = did.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(collection.as_bytes());
        key.push(0);
        key.extend_from_slice(rkey.as_bytes());
        key
    }

    fn store_repo(&self, repo: &Repo) -> Result<()> {
        self.repos
            .insert(repo.did.as_bytes(), serde_json::to_vec(repo)?)
            .map_err(|e| AtprotoError::Core(e.into()))?;
        if let Some(handle) = &repo.handle {
            self.handles
                .insert(handle.as_bytes(), repo.did.as_bytes())
                .map_err(|e| AtprotoError::Core(e.into()))?;
        }
        Ok(())
    }

    fn load_repo_sync(&self, did: &str) -> Result<Option<Repo>> {
        self.repos
            .get(did.as_bytes())
            .map_err(|e| AtprotoError::Core(e.into()))?
            .map(|v| serde_json::from_slice(&v).map_err(AtprotoError::SerdeJson))
            .transpose()
    }

    fn set_status(&self, did: &str, status: Option<RepoStatus>) -> Result<()> {
        let mut repo = self
            .load_repo_sync(did)?
            .ok_or_else(|| AtprotoError::Value(format!("no repo for {did}")))?;
        // tombstoning is final
        if repo.status == Some(RepoStatus::Tombstoned) && status != Some(RepoStatus::Tombstoned) {
            return Err(AtprotoError::Value(format!("{did} is tombstoned")));
        }
        repo.status = status;
        repo.updated = Utc::now();
        self.store_repo(&repo)
    }
}

#[async_trait]
impl RepoStorage for DatastoreRepoStorage {
    async fn load_repo(&self, did: &str) -> Result<Option<Repo>> {
        self.load_repo_sync(did)
    }

    async fn create_repo(&self, repo: Repo) -> Result<()> {
        tracing::info!(did = repo.did, handle = repo.handle, "creating shadow repo");
        self.store_repo(&repo)
    }

    async fn commit(&self, did: &str, writes: Vec<RepoWrite>) -> Result<()> {
        let repo = self
            .load_repo_sync(did)?
            .ok_or_else(|| AtprotoError::Value(format!("no repo for {did}")))?;
        if !repo.is_active() {
            return Err(AtprotoError::InactiveRepo(did.to_string()));
        }

        // validate everything before touching the tree
        for write in &writes {
            let key = Self::record_key(did, &write.collection, &write.rkey);
            let exists =
                self.records.contains_key(&key).map_err(|e| AtprotoError::Core(e.into()))?;
            match write.action {
                WriteAction::Update | WriteAction::Delete if !exists => {
                    return Err(AtprotoError::Value(format!(
                        "no record at {}/{} in {did}",
                        write.collection, write.rkey
                    )));
                }
                _ => {}
            }
        }

        let mut batch = sled::Batch::default();
        for write in &writes {
            let key = Self::record_key(did, &write.collection, &write.rkey);
            match write.action {
                WriteAction::Create | WriteAction::Update => {
                    let record = write.record.as_ref().ok_or_else(|| {
                        AtprotoError::Value(format!(
                            "{:?} of {}/{} has no record",
                            write.action, write.collection, write.rkey
                        ))
                    })?;
                    batch.insert(key, serde_json::to_vec(record)?);
                }
                WriteAction::Delete => batch.remove(key),
            }
        }
        self.records.apply_batch(batch).map_err(|e| AtprotoError::Core(e.into()))?;
        Ok(())
    }

    async fn activate_repo(&self, did: &str) -> Result<()> {
        self.set_status(did, None)
    }

    async fn deactivate_repo(&self, did: &str) -> Result<()> {
        self.set_status(did, Some(RepoStatus::Deactivated))
    }

    async fn tombstone_repo(&self, did: &str) -> Result<()> {
        let mut repo = self
            .load_repo_sync(did)?
            .ok_or_else(|| AtprotoError::Value(format!("no repo for {did}")))?;
        repo.status = Some(RepoStatus::Tombstoned);
        repo.updated = Utc::now();
        self.store_repo(&repo)
    }

    async fn get_record(&self, did: &str, collection: &str, rkey: &str) -> Result<Option<Value>> {
        self.records
            .get(Self::record_key(did, collection, rkey))
            .map_err(|e| AtprotoError::Core(e.into()))?
            .map(|v| serde_json::from_slice(&v).map_err(AtprotoError::SerdeJson))
            .transpose()
    }

    async fn list_records(&self, did: &str, collection: &str) -> Result<Vec<(String, Value)>> {
        let mut prefix = did.as_bytes().to_vec();
        prefix.push(0);
        prefix.extend_from_slice(collection.as_bytes());
        prefix.push(0);

        let mut out = Vec::new();
        for entry in self.records.scan_prefix(&prefix) {
            let (key, value) = entry.map_err(|e| AtprotoError::Core(e.into()))?;
            let rkey = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            out.push((rkey, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    async fn repo_by_handle(&self, handle: &str) -> Result<Option<Repo>> {
        match self.handles.get(handle.as_bytes()).map_err(|e| AtprotoError::Core(e.into()))? {
            Some(did) => self.load_repo_sync(&String::from_utf8_lossy(&did)),
            None => Ok(None),
        }
    }
}
