//! XRPC clients for the chat and moderation services, authenticated with
//! service JWTs signed by the shadow repo's key.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{AtprotoError, Result};
use crate::jwt::service_jwt;
use crate::repo::Repo;

/// Bluesky DM pass-through.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Sends a `chat.bsky.convo.defs#messageInput` to `to_did`. Returns
    /// false when the recipient has disabled incoming messages.
    async fn send_message(&self, from_repo: &Repo, to_did: &str, msg: Value) -> Result<bool>;
}

/// `flag` activities become moderation reports.
#[async_trait]
pub trait ModerationService: Send + Sync {
    /// Submits a `com.atproto.moderation.createReport#input`.
    async fn create_report(&self, from_repo: &Repo, input: Value) -> Result<bool>;
}

/// An authenticated client for a user's old PDS, used during migration.
#[async_trait]
pub trait PdsClient: Send + Sync {
    /// `com.atproto.identity.signPlcOperation`.
    async fn sign_plc_operation(&self, token: &str, payload: Value) -> Result<Value>;
    /// `com.atproto.server.deactivateAccount`.
    async fn deactivate_account(&self) -> Result<()>;
}

pub struct XrpcChatService {
    /// eg `https://api.bsky.chat`
    base: String,
    /// Service DID, the JWT audience.
    did: String,
    http: reqwest::Client,
}

impl XrpcChatService {
    pub fn new(base: impl Into<String>, did: impl Into<String>, http: reqwest::Client) -> Self {
        XrpcChatService { base: base.into(), did: did.into(), http }
    }

    async fn call(&self, repo: &Repo, nsid: &str, input: &Value) -> Result<reqwest::Response> {
        let token = service_jwt(&self.did, &repo.did, &repo.signing_key, Some(nsid))?;
        Ok(self
            .http
            .post(format!("{}/xrpc/{nsid}", self.base))
            .bearer_auth(token)
            .json(input)
            .send()
            .await?)
    }
}

#[async_trait]
impl ChatService for XrpcChatService {
    async fn send_message(&self, from_repo: &Repo, to_did: &str, msg: Value) -> Result<bool> {
        let resp = self
            .call(
                from_repo,
                "chat.bsky.convo.getConvoForMembers",
                &json!({"members": [to_did]}),
            )
            .await?;
        if resp.status().as_u16() == 400 {
            let body: Value = resp.json().await.unwrap_or_default();
            if body["message"] == "recipient has disabled incoming messages" {
                tracing::info!(to_did, "recipient has chat disabled");
                return Ok(false);
            }
            return Err(AtprotoError::HttpStatus(400, "getConvoForMembers".into()));
        }
        if !resp.status().is_success() {
            return Err(AtprotoError::HttpStatus(resp.status().as_u16(), "getConvoForMembers".into()));
        }
        let convo: Value = resp.json().await?;
        let convo_id = convo["convo"]["id"]
            .as_str()
            .ok_or_else(|| AtprotoError::Value("getConvoForMembers returned no convo id".into()))?
            .to_string();

        let resp = self
            .call(
                from_repo,
                "chat.bsky.convo.sendMessage",
                &json!({"convoId": convo_id, "message": msg}),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(AtprotoError::HttpStatus(resp.status().as_u16(), "sendMessage".into()));
        }
        tracing::info!(from = from_repo.did, to_did, "sent chat message");
        Ok(true)
    }
}

pub struct XrpcModerationService {
    base: String,
    did: String,
    http: reqwest::Client,
}

impl XrpcModerationService {
    pub fn new(base: impl Into<String>, did: impl Into<String>, http: reqwest::Client) -> Self {
        XrpcModerationService { base: base.into(), did: did.into(), http }
    }
}

#[async_trait]
impl ModerationService for XrpcModerationService {
    async fn create_report(&self, from_repo: &Repo, input: Value) -> Result<bool> {
        let nsid = "com.atproto.moderation.createReport";
        let token = service_jwt(&self.did, &from_repo.did, &from_repo.signing_key, None)?;
        let resp = self
            .http
            .post(format!("{}/xrpc/{nsid}", self.base))
            .bearer_auth(token)
            .json(&input)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AtprotoError::HttpStatus(resp.status().as_u16(), nsid.into()));
        }
        let output: Value = resp.json().await?;
        tracing::info!(report = %output, "created moderation report");
        Ok(true)
    }
}
