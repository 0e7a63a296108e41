//! Nostr identity adapter: NIP-05 handle resolution and profile reloads.

use serde_json::Value;

use bifrost_core::models::{Object, User, UserStatus};
use bifrost_core::protocol::{Protocol, Tri};
use bifrost_core::store::Datastore;
use bifrost_core::userset::write_relays;

use crate::client::RelayClient;
use crate::error::Result;
use crate::event::{Event, KIND_PROFILE, KIND_RELAYS};
use crate::nip19;

pub struct NostrIdentity {
    store: Datastore,
    http: reqwest::Client,
    client: RelayClient,
    pub default_relay: String,
    /// `https` in production; tests point at plain-http mock servers.
    scheme: String,
}

impl NostrIdentity {
    pub fn new(store: Datastore, http: reqwest::Client, default_relay: impl Into<String>) -> Self {
        NostrIdentity {
            store,
            http,
            client: RelayClient,
            default_relay: default_relay.into(),
            scheme: "https".into(),
        }
    }

    #[cfg(test)]
    fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn owns_id(id: &str) -> Tri {
        Protocol::Nostr.owns_id(id)
    }

    pub fn owns_handle(handle: &str) -> Tri {
        Protocol::Nostr.owns_handle(handle)
    }

    /// Resolves a handle to a `nostr:npub…` URI. Bare npubs pass through;
    /// everything else goes through NIP-05.
    pub async fn handle_to_id(&self, handle: &str) -> Result<Option<String>> {
        if Self::owns_handle(handle).is_no() {
            return Ok(None);
        }
        if handle.starts_with("npub1") {
            return Ok(Some(format!("nostr:{handle}")));
        }
        self.nip05_to_npub(handle).await
    }

    /// `user@domain` (or `_@domain` for a bare domain) through
    /// `/.well-known/nostr.json`.
    pub async fn nip05_to_npub(&self, nip05: &str) -> Result<Option<String>> {
        let (name, domain) = match nip05.split_once('@') {
            Some((name, domain)) => (if name.is_empty() { "_" } else { name }, domain),
            None => ("_", nip05),
        };
        let url = format!("{}://{domain}/.well-known/nostr.json?name={name}", self.scheme);
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::info!(nip05, error = %err, "NIP-05 fetch failed");
                return Ok(None);
            }
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let Some(pubkey) = body["names"][name].as_str() else {
            return Ok(None);
        };
        Ok(Some(nip19::id_to_uri("npub", pubkey)?))
    }

    /// First writable NIP-65 relay declared by the user, falling back to the
    /// bridge default.
    pub fn target_for(&self, user: &User) -> String {
        if let Some(relays_key) = &user.relays_key {
            if let Ok(Some(obj)) = self.store.get_object(relays_key) {
                if let Some(event) = &obj.nostr {
                    if let Some(url) = write_relays(event).into_iter().next() {
                        return url;
                    }
                }
            }
        }
        self.default_relay.clone()
    }

    /// Fetches an event (or profile, for npub/nprofile ids) from the
    /// author's relay and fills `obj.nostr`.
    pub async fn fetch(&self, obj: &mut Object, relay_url: &str) -> Result<bool> {
        let uri = obj.id.clone();
        if Self::owns_id(&uri).is_no() {
            tracing::info!(uri, "nostr can't fetch");
            return Ok(false);
        }
        let bare = uri.strip_prefix("nostr:").unwrap_or(&uri);
        let hex_id = nip19::uri_to_id(&uri)?;
        let filter = if bare.starts_with("npub1") || bare.starts_with("nprofile1") {
            serde_json::json!({"authors": [hex_id], "kinds": [KIND_PROFILE]})
        } else {
            serde_json::json!({"ids": [hex_id]})
        };

        let events = self.client.query(relay_url, filter).await?;
        match events.into_iter().next() {
            Some(event) => {
                obj.nostr = Some(event.to_value());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reloads a native user's kind 0 profile and kind 10002 relay list,
    /// then re-verifies their NIP-05. Sets `status` when either is missing.
    pub async fn reload_profile(&self, user: &mut User) -> Result<()> {
        let pubkey = nip19::uri_to_id(&user.id)?;
        let relay = self.target_for(user);
        let events = self
            .client
            .query(
                &relay,
                serde_json::json!({
                    "authors": [pubkey],
                    "kinds": [KIND_PROFILE, KIND_RELAYS],
                }),
            )
            .await?;
        self.apply_profile_events(user, events)?;
        self.verify_nip05(user).await;
        user.touch();
        self.store.put_user(user)?;
        Ok(())
    }

    /// Pure half of the reload: stores the fetched events and updates the
    /// user's keys, pubkey, and handle.
    pub fn apply_profile_events(&self, user: &mut User, events: Vec<Event>) -> Result<()> {
        let mut profile = None;
        let mut relays = None;
        for event in events {
            if event.kind == KIND_PROFILE && profile.is_none() {
                profile = Some(event);
            } else if event.kind == KIND_RELAYS && relays.is_none() {
                relays = Some(event);
            }
        }

        user.nostr_pubkey = Some(nip19::uri_to_id(&user.id)?);

        if let Some(event) = profile {
            let obj_id = nip19::id_to_uri("nevent", &event.id)?;
            let mut obj = Object::new(&obj_id);
            obj.source_protocol = Some(Protocol::Nostr);
            obj.nostr = Some(event.to_value());
            self.store.put_object(&obj)?;
            user.obj_key = Some(obj_id);
            user.handle = nip05_of(&event).or_else(|| {
                user.id.strip_prefix("nostr:").map(str::to_string)
            });
            user.status = None;
        } else {
            user.status = Some(UserStatus::NoProfile);
        }

        if let Some(event) = relays {
            let obj_id = nip19::id_to_uri("nevent", &event.id)?;
            let mut obj = Object::new(&obj_id);
            obj.source_protocol = Some(Protocol::Nostr);
            obj.nostr = Some(event.to_value());
            self.store.put_object(&obj)?;
            user.relays_key = Some(obj_id);
        }
        Ok(())
    }

    /// Cross-checks the profile's claimed NIP-05 against the domain's
    /// attestation. A failed check leaves the user stored but excluded from
    /// bridging.
    pub async fn verify_nip05(&self, user: &mut User) {
        if user.status == Some(UserStatus::NoProfile) {
            return;
        }
        let claimed = self.claimed_nip05(user);
        user.valid_nip05 = None;
        let Some(claimed) = claimed else {
            user.status = Some(UserStatus::Nip05Missing);
            return;
        };
        match self.nip05_to_npub(&claimed).await {
            Ok(Some(resolved)) if resolved == user.id => {
                user.valid_nip05 = Some(claimed.clone());
                user.handle = Some(claimed.trim_start_matches("_@").to_string());
                user.status = None;
            }
            Ok(_) => {
                tracing::info!(user = user.key(), claimed, "NIP-05 does not resolve back");
                user.status = Some(UserStatus::Nip05Missing);
            }
            Err(err) => {
                tracing::info!(user = user.key(), error = %err, "NIP-05 verification failed");
                user.status = Some(UserStatus::Nip05Missing);
            }
        }
    }

    /// The `nip05` field of the user's stored profile event.
    fn claimed_nip05(&self, user: &User) -> Option<String> {
        let obj = self.store.get_object(user.obj_key.as_deref()?).ok()??;
        let event = Event::from_value(obj.nostr.as_ref()?).ok()?;
        nip05_of(&event)
    }
}

fn nip05_of(profile: &Event) -> Option<String> {
    let content: Value = serde_json::from_str(&profile.content).ok()?;
    content.get("nip05").and_then(Value::as_str).map(str::to_string)
}
