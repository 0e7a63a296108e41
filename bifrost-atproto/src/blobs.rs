//! Remote blob fetching, deduplicated through the datastore: each source URL
//! is fetched once and re-referenced by every repo that embeds it.

use sha2::{Digest, Sha256};

use bifrost_core::models::RemoteBlob;
use bifrost_core::store::Datastore;

use crate::error::Result;

/// Raw-codec CIDv1 for a blob's bytes.
fn blob_cid(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut bytes = vec![0x01, 0x55, 0x12, 0x20];
    bytes.extend_from_slice(&digest);
    format!("b{}", multibase::Base::Base32Lower.encode(bytes))
}

pub struct RemoteBlobCache {
    store: Datastore,
    http: reqwest::Client,
}

impl RemoteBlobCache {
    pub fn new(store: Datastore, http: reqwest::Client) -> Self {
        RemoteBlobCache { store, http }
    }

    /// Returns the blob for `url`, fetching it on first reference. The
    /// owning repo is recorded either way. Fetch failures return `None`; a
    /// missing image shouldn't fail the whole send.
    pub async fn get_or_fetch(&self, url: &str, repo_did: &str) -> Result<Option<RemoteBlob>> {
        if let Some(mut blob) = self.store.get_blob(url)? {
            if !blob.repos.iter().any(|d| d == repo_did) {
                blob.repos.push(repo_did.to_string());
                blob.updated = chrono::Utc::now();
                self.store.put_blob(&blob)?;
            }
            return Ok(Some(blob));
        }

        let resp = match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::info!(url, status = resp.status().as_u16(), "blob fetch failed");
                return Ok(None);
            }
            Err(err) => {
                tracing::info!(url, error = %err, "blob fetch failed");
                return Ok(None);
            }
        };
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = resp.bytes().await?;

        let blob = RemoteBlob {
            url: url.to_string(),
            cid: blob_cid(&data),
            mime_type,
            size: data.len() as u64,
            width: None,
            height: None,
            repos: vec![repo_did.to_string()],
            updated: chrono::Utc::now(),
        };
        self.store.put_blob(&blob)?;
        Ok(Some(blob))
    }
}
