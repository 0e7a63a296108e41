//! ATProto identity adapter: DID and handle resolution, the cached→remote
//! load ladder, and object fetching from the AppView.

use std::sync::Arc;

use hickory_resolver::TokioAsyncResolver;
use serde_json::Value;

use bifrost_core::ids::profile_id;
use bifrost_core::models::Object;
use bifrost_core::protocol::{Protocol, Tri};
use bifrost_core::store::Datastore;

use crate::error::{AtprotoError, Result};
use crate::plc::{DidDocument, PlcDirectory};
use crate::repo::RepoStorage;
use crate::{at_uri, parse_at_uri};

/// Fetch policy for [`AtprotoIdentity::load`].
#[derive(Debug, Clone, Copy)]
pub struct LoadOpts {
    /// Load the DID document instead of the profile record.
    pub did_doc: bool,
    /// `None`: fetch remotely only on a cache miss. `Some(true)`: always
    /// refetch. `Some(false)`: never touch the network.
    pub remote: Option<bool>,
    /// Whether the datastore may satisfy the load.
    pub local: bool,
}

impl Default for LoadOpts {
    fn default() -> Self {
        LoadOpts { did_doc: false, remote: None, local: true }
    }
}

impl LoadOpts {
    pub fn did_doc() -> Self {
        LoadOpts { did_doc: true, ..Default::default() }
    }

    pub fn local_only() -> Self {
        LoadOpts { remote: Some(false), ..Default::default() }
    }
}

pub struct AtprotoIdentity {
    store: Datastore,
    plc: Arc<dyn PlcDirectory>,
    repo_storage: Arc<dyn RepoStorage>,
    http: reqwest::Client,
    /// AppView base URL for `getRecord`, eg `https://api.bsky.app`.
    appview_base: String,
    /// DNS resolver for `_atproto.` TXT lookups; `None` disables network
    /// handle resolution.
    resolver: Option<TokioAsyncResolver>,
    handle_cache: moka::future::Cache<String, String>,
}

impl AtprotoIdentity {
    pub fn new(
        store: Datastore,
        plc: Arc<dyn PlcDirectory>,
        repo_storage: Arc<dyn RepoStorage>,
        http: reqwest::Client,
        appview_base: impl Into<String>,
        resolver: Option<TokioAsyncResolver>,
    ) -> Self {
        AtprotoIdentity {
            store,
            plc,
            repo_storage,
            http,
            appview_base: appview_base.into(),
            resolver,
            handle_cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(std::time::Duration::from_secs(300))
                .build(),
        }
    }

    pub fn owns_id(id: &str) -> Tri {
        Protocol::Atproto.owns_id(id)
    }

    pub fn owns_handle(handle: &str) -> Tri {
        Protocol::Atproto.owns_handle(handle)
    }

    /// Resolves a handle to a DID: native users and shadow repos from the
    /// datastore first, then DNS TXT, then the HTTPS well-known.
    pub async fn handle_to_id(&self, handle: &str) -> Result<Option<String>> {
        if Self::owns_handle(handle).is_no() {
            return Ok(None);
        }

        if let Some(user) = self.store.user_by_handle(Protocol::Atproto, handle)? {
            return Ok(Some(user.id));
        }
        if let Some(repo) = self.repo_storage.repo_by_handle(handle).await? {
            return Ok(Some(repo.did));
        }

        if let Some(cached) = self.handle_cache.get(handle).await {
            return Ok(Some(cached));
        }
        if let Some(did) = self.resolve_handle_remote(handle).await {
            self.handle_cache.insert(handle.to_string(), did.clone()).await;
            return Ok(Some(did));
        }
        Ok(None)
    }

    async fn resolve_handle_remote(&self, handle: &str) -> Option<String> {
        if let Some(resolver) = &self.resolver {
            let name = format!("_atproto.{handle}.");
            if let Ok(lookup) = resolver.txt_lookup(name).await {
                for txt in lookup.iter() {
                    let joined: Vec<u8> =
                        txt.txt_data().iter().flat_map(|d| d.iter().copied()).collect();
                    if let Ok(text) = String::from_utf8(joined) {
                        if let Some(did) = text.strip_prefix("did=") {
                            return Some(did.to_string());
                        }
                    }
                }
            }

            let url = format!("https://{handle}/.well-known/atproto-did");
            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status().is_success() {
                    if let Ok(body) = resp.text().await {
                        let did = body.trim();
                        if did.starts_with("did:") {
                            return Some(did.to_string());
                        }
                    }
                }
            }
        }
        None
    }

    /// Resolves a DID to its handle via the stored (or freshly fetched) DID
    /// document.
    pub async fn did_to_handle(&self, did: &str, remote: Option<bool>) -> Result<Option<String>> {
        let opts = LoadOpts { did_doc: true, remote, local: true };
        let Some(obj) = self.load(did, opts).await? else {
            return Ok(None);
        };
        let Some(raw) = &obj.raw else {
            return Ok(None);
        };
        Ok(DidDocument::from_value(raw)?.handle().map(str::to_string))
    }

    /// The cached→remote→fail load ladder.
    pub async fn load(&self, id: &str, opts: LoadOpts) -> Result<Option<Object>> {
        let id = self.normalize_id(id, opts.did_doc)?;

        if opts.local && opts.remote != Some(true) {
            if let Some(obj) = self.store.get_object(&id)? {
                let populated = if opts.did_doc { obj.raw.is_some() } else { obj.bsky.is_some() };
                if populated {
                    return Ok(Some(obj));
                }
            }
        }
        if opts.remote == Some(false) {
            return Ok(None);
        }

        let mut obj = Object::new(&id);
        obj.source_protocol = Some(Protocol::Atproto);
        if self.fetch(&mut obj).await? {
            self.store.put_object(&obj)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }

    /// DIDs load their profile record unless a DID doc was asked for;
    /// `bsky.app` profile URLs collapse to `at://` URIs.
    fn normalize_id(&self, id: &str, did_doc: bool) -> Result<String> {
        if id.starts_with("did:") && !did_doc {
            return Ok(profile_id(Protocol::Atproto, id));
        }
        if let Some(rest) = id.strip_prefix("https://bsky.app/profile/") {
            let mut parts = rest.split('/');
            let actor = parts.next().unwrap_or_default();
            return match (parts.next(), parts.next()) {
                (Some("post"), Some(rkey)) => {
                    Ok(at_uri(actor, "app.bsky.feed.post", rkey))
                }
                (None, _) => Ok(at_uri(actor, "app.bsky.actor.profile", "self")),
                _ => Err(AtprotoError::InvalidDid(id.to_string())),
            };
        }
        Ok(id.to_string())
    }

    /// Populates `obj.raw` (DID docs) or `obj.bsky` (records) from the
    /// authoritative source. Returns whether the fetch succeeded.
    pub async fn fetch(&self, obj: &mut Object) -> Result<bool> {
        let id = obj.id.clone();
        if Self::owns_id(&id).is_no() {
            tracing::info!(id, "atproto can't fetch");
            return Ok(false);
        }

        if id.starts_with("did:plc:") {
            match self.plc.resolve(&id).await {
                Ok(doc) => {
                    obj.raw = Some(doc);
                    return Ok(true);
                }
                Err(err) => {
                    tracing::warn!(id, error = %err, "PLC resolution failed");
                    return Ok(false);
                }
            }
        }
        if let Some(domain) = id.strip_prefix("did:web:") {
            let url = format!("https://{domain}/.well-known/did.json");
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    obj.raw = Some(resp.json().await?);
                    return Ok(true);
                }
                Ok(resp) => {
                    tracing::warn!(id, status = resp.status().as_u16(), "did:web fetch failed");
                    return Ok(false);
                }
                Err(err) => {
                    tracing::warn!(id, error = %err, "did:web fetch failed");
                    return Ok(false);
                }
            }
        }

        let Some((mut repo, collection, rkey)) = parse_at_uri(&id) else {
            return Ok(false);
        };
        if repo.is_empty() || collection.is_empty() || rkey.is_empty() {
            return Ok(false);
        }
        if !repo.starts_with("did:") {
            let handle = repo.clone();
            match self.handle_to_id(&handle).await? {
                Some(did) => {
                    obj.id = obj.id.replace(&format!("at://{handle}"), &format!("at://{did}"));
                    repo = did;
                }
                None => return Ok(false),
            }
        }

        let url = format!(
            "{}/xrpc/com.atproto.repo.getRecord?repo={repo}&collection={collection}&rkey={rkey}",
            self.appview_base
        );
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(id, error = %err, "getRecord failed");
                return Ok(false);
            }
        };
        if !resp.status().is_success() {
            tracing::info!(id, status = resp.status().as_u16(), "getRecord failed");
            return Ok(false);
        }
        let body: Value = resp.json().await?;
        let Some(value) = body.get("value") else {
            return Ok(false);
        };
        let mut record = value.clone();
        if let Some(cid) = body.get("cid") {
            record["cid"] = cid.clone();
        }
        obj.bsky = Some(record);
        Ok(true)
    }
}
