//! The shadow-repo service: creates and maintains bridge-owned ATProto
//! repositories for users bridged in from other protocols, and routes
//! outbound activities into record commits.

use std::sync::Arc;

use serde_json::{json, Value};

use bifrost_core::as1;
use bifrost_core::blocklist::{domain_from_link, Domains};
use bifrost_core::convert::Converter;
use bifrost_core::ids;
use bifrost_core::models::{Object, Target, User};
use bifrost_core::protocol::Protocol;
use bifrost_core::store::Datastore;
use bifrost_core::tasks::Dispatcher;

use crate::convert;
use crate::dns::DnsAdmin;
use crate::error::{AtprotoError, Result};
use crate::plc::{CreateDidParams, DidDocument, PlcDirectory};
use crate::repo::{next_tid, Repo, RepoStatus, RepoStorage, RepoWrite};
use crate::services::{ChatService, ModerationService, PdsClient};
use crate::{at_uri, parse_at_uri};

const CHAT_DECLARATION: &str = "chat.bsky.actor.declaration";
const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";
const BLOCK_COLLECTION: &str = "app.bsky.graph.block";
const MONETIZATION_COLLECTION: &str = "community.lexicon.payments.webMonetization";

pub struct ShadowRepos {
    store: Datastore,
    storage: Arc<dyn RepoStorage>,
    plc: Arc<dyn PlcDirectory>,
    dns: Arc<dyn DnsAdmin>,
    dispatcher: Arc<Dispatcher>,
    converter: Arc<dyn Converter>,
    chat: Arc<dyn ChatService>,
    moderation: Arc<dyn ModerationService>,
    domains: Domains,
}

impl ShadowRepos {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Datastore,
        storage: Arc<dyn RepoStorage>,
        plc: Arc<dyn PlcDirectory>,
        dns: Arc<dyn DnsAdmin>,
        dispatcher: Arc<Dispatcher>,
        converter: Arc<dyn Converter>,
        chat: Arc<dyn ChatService>,
        moderation: Arc<dyn ModerationService>,
        domains: Domains,
    ) -> Self {
        ShadowRepos { store, storage, plc, dns, dispatcher, converter, chat, moderation, domains }
    }

    /// Every successful commit enqueues a broadcast task; the relay
    /// subscriber side owns that queue.
    async fn notify_commit(&self, did: &str) {
        self.dispatcher.create_task("atproto-commit", json!({"did": did}), None, None).await;
    }

    async fn commit(&self, did: &str, writes: Vec<RepoWrite>) -> Result<()> {
        self.storage.commit(did, writes).await?;
        self.notify_commit(did).await;
        Ok(())
    }

    /// Creates (or revives) the ATProto shadow for a non-ATProto user.
    /// Idempotent: an active shadow is a no-op, a deactivated one is
    /// reactivated, a tombstoned one forces a fresh DID.
    pub async fn create_for(&self, user: &mut User) -> Result<()> {
        if user.protocol == Protocol::Atproto {
            return Err(AtprotoError::Value(format!("{} is already on atproto", user.id)));
        }
        let handle = ids::handle_for(user, Protocol::Atproto, &self.domains)
            .ok_or_else(|| AtprotoError::InvalidHandle(format!("{} has no handle", user.key())))?;

        if let Some(did) = user.get_copy(Protocol::Atproto).map(str::to_string) {
            if let Some(repo) = self.storage.load_repo(&did).await? {
                match repo.status {
                    None => return Ok(()), // already active
                    Some(RepoStatus::Tombstoned) => {
                        // tombstoned DIDs are non-revivable; wipe and start fresh
                        user.copies.clear();
                        if let Some(obj_key) = user.obj_key.clone() {
                            if let Some(mut obj) = self.store.get_object(&obj_key)? {
                                obj.copies.clear();
                                self.store.put_object(&obj)?;
                            }
                        }
                    }
                    Some(RepoStatus::Deactivated) => {
                        tracing::info!(did, "reactivating shadow repo");
                        self.storage.activate_repo(&did).await?;
                        self.notify_commit(&did).await;
                        // custom-domain handles manage their own DNS
                        if handle.ends_with(&self.domains.superdomain) {
                            self.dns.set_dns(&handle, &did).await?;
                        }
                        return Ok(());
                    }
                }
            }
        }

        // new DID
        let pds_url = self.domains.pds_url();
        tracing::info!(user = user.key(), handle, pds_url, "creating new did:plc");
        let created = self
            .plc
            .create(CreateDidParams {
                handle: handle.clone(),
                pds_url,
                also_known_as: Some(user.id.clone()),
            })
            .await?;

        let mut did_obj = Object::new(&created.did);
        did_obj.source_protocol = Some(Protocol::Atproto);
        did_obj.raw = Some(created.doc.clone());
        self.store.put_object(&did_obj)?;

        if !self.domains.is_reserved_handle(&handle) {
            self.dns.set_dns(&handle, &created.did).await?;
        }

        self.storage
            .create_repo(Repo::new(
                &created.did,
                Some(handle),
                created.signing_key.clone(),
                created.rotation_key.clone(),
            ))
            .await?;

        let profile_obj =
            match &user.obj_key {
                Some(key) => self.store.get_object(key)?,
                None => None,
            };

        // phase one: chat declaration, plus the pinned post if the profile
        // names one
        let mut initial_writes = vec![RepoWrite::create(
            CHAT_DECLARATION,
            "self",
            json!({"$type": CHAT_DECLARATION, "allowIncoming": "none"}),
        )];
        if let Some(profile) = &profile_obj {
            if let Some(featured_id) = profile
                .as1()
                .map(|v| as1::get_field_object(v, "featured"))
                .as_ref()
                .and_then(|f| as1::get_id(f, "items"))
            {
                if let Some(mut featured) = self.store.get_object(featured_id)? {
                    match convert::to_record(&*self.converter, &featured, Some(user), true).await? {
                        Some(post) => {
                            let rkey = next_tid();
                            let uri = at_uri(&created.did, "app.bsky.feed.post", &rkey);
                            initial_writes.push(RepoWrite::create("app.bsky.feed.post", rkey, post));
                            featured.add_copy(Target::new(uri, Protocol::Atproto));
                            self.store.put_object(&featured)?;
                        }
                        None => {
                            tracing::warn!(featured_id, "couldn't convert pinned post");
                        }
                    }
                }
            }
        }
        self.commit(&created.did, initial_writes).await?;

        // phase two: the profile record. Separate commit because converting
        // it may read back the pinned post we just committed.
        if let Some(profile) = &profile_obj {
            if profile.as1().is_some() {
                let record = convert::to_record(&*self.converter, profile, Some(user), true)
                    .await?
                    .ok_or_else(|| {
                        AtprotoError::Value(format!("couldn't convert profile {}", profile.id))
                    })?;
                let mut writes =
                    vec![RepoWrite::create(PROFILE_COLLECTION, "self", record)];
                writes.extend(derived_writes(profile.as1()));
                self.commit(&created.did, writes).await?;

                let uri = at_uri(&created.did, PROFILE_COLLECTION, "self");
                let mut profile = profile.clone();
                profile.add_copy(Target::new(uri, Protocol::Atproto));
                self.store.put_object(&profile)?;
            }
        }

        // only record the copy once everything above has succeeded
        user.add_copy(Target::new(&created.did, Protocol::Atproto));
        user.touch();
        self.store.put_user(user)?;
        Ok(())
    }

    /// Writes, updates, or deletes the record an activity denotes in the
    /// user's shadow repo. Returns false when the activity can't or
    /// shouldn't land here; errors are reserved for infrastructure failures.
    pub async fn send(&self, obj: &Object, pds_url: &str, from_user: &User) -> Result<bool> {
        let our_domain = domain_from_link(pds_url);
        if !our_domain.as_deref().is_some_and(|d| self.domains.is_ours(d)) {
            tracing::info!(pds_url, "target PDS is not us");
            return Ok(false);
        }
        let Some(activity) = obj.as1().cloned() else {
            return Ok(false);
        };
        let verb = as1::object_type(&activity).unwrap_or_default().to_string();

        // find the base object the verb applies to
        let mut base_obj = obj.clone();
        let mut base_as1 = activity.clone();
        if as1::CRUD_VERBS.contains(&verb.as_str()) {
            base_as1 = as1::get_object(&activity);
            let base_id = base_as1.get("id").and_then(Value::as_str).map(str::to_string);
            let base_type = as1::object_type(&base_as1).unwrap_or_default().to_string();

            if verb == "undo" && base_type == "block" && base_id.is_none() {
                // undo of block without id deletes by subject, below
                base_obj = Object::with_as1("", base_as1.clone());
            } else {
                let Some(base_id) = base_id else {
                    tracing::info!(verb, "activity object has no id");
                    return Ok(false);
                };
                base_obj = match self.store.get_object(&base_id)? {
                    Some(obj) => obj,
                    None => {
                        let mut fresh = Object::new(&base_id);
                        fresh.source_protocol = obj.source_protocol;
                        fresh
                    }
                };
                if verb != "delete" && verb != "undo" {
                    base_obj.our_as1 = Some(base_as1.clone());
                }
            }
        } else if verb == "stop-following" {
            let followee = as1::get_id(&activity, "object").map(str::to_string);
            let Some(followee) = followee else {
                return Ok(false);
            };
            let Some(to_key) = ids::key_for(&followee) else {
                return Ok(false);
            };
            let follower = self.store.get_follower(&from_user.key(), &to_key)?;
            let follow_id = follower.and_then(|f| f.follow);
            let Some(follow_id) = follow_id else {
                tracing::info!(
                    from = from_user.key(),
                    to = to_key,
                    "no Follower with a follow activity; skipping"
                );
                return Ok(false);
            };
            match self.store.get_object(&follow_id)? {
                Some(follow_obj) => base_obj = follow_obj,
                None => return Ok(false),
            }
        }

        let record =
            convert::to_record(&*self.converter, &base_obj, Some(from_user), true).await?;

        let Some(did) = from_user.get_copy(Protocol::Atproto).map(str::to_string) else {
            tracing::info!(user = from_user.key(), "user has no atproto shadow");
            return Ok(false);
        };
        let Some(repo) = self.storage.load_repo(&did).await? else {
            tracing::info!(did, "no shadow repo");
            return Ok(false);
        };

        // delete of the actor deactivates the whole shadow
        if verb == "delete" {
            let base_id = base_as1.get("id").and_then(Value::as_str).unwrap_or_default();
            let atp_base_id = if Protocol::Atproto.owns_id(base_id).is_yes() {
                Some(base_id.to_string())
            } else if let Some(source) = obj.source_protocol {
                ids::translate_user_id(&self.store, source, Protocol::Atproto, base_id)?
            } else {
                None
            };
            if atp_base_id.as_deref() == Some(did.as_str()) {
                tracing::info!(did, "deactivating bridged atproto account");
                self.storage.deactivate_repo(&did).await?;
                if let Some(handle) = ids::handle_for(from_user, Protocol::Atproto, &self.domains) {
                    self.dns.remove_dns(&handle).await?;
                }
                return Ok(true);
            }
        }

        if record.is_none() && verb != "delete" && verb != "undo" {
            return Ok(false);
        }

        // checked after the delete-actor path so deactivations can re-send
        if !repo.is_active() {
            tracing::info!(did, status = ?repo.status, "repo is inactive, giving up");
            return Ok(false);
        }

        if verb == "flag" {
            let Some(record) = record else {
                return Ok(false);
            };
            return self.moderation.create_report(&repo, record).await;
        }

        let base_type = as1::object_type(&base_as1).unwrap_or_default().to_string();
        if verb == "undo" && base_type == "block" && base_as1.get("id").is_none() {
            // undo of block without id: delete every block record whose
            // subject matches
            let blocked = as1::get_id(&base_as1, "object").map(str::to_string);
            let Some(blocked) = blocked else {
                tracing::warn!("undo of block has no object");
                return Ok(false);
            };
            let blocked_did = if Protocol::Atproto.owns_id(&blocked).is_yes() {
                Some(blocked.clone())
            } else if let Some(source) = obj.source_protocol {
                ids::translate_user_id(&self.store, source, Protocol::Atproto, &blocked)?
            } else {
                None
            };
            let Some(blocked_did) = blocked_did else {
                return Ok(false);
            };

            let mut writes = Vec::new();
            for (rkey, value) in self.storage.list_records(&did, BLOCK_COLLECTION).await? {
                if value.get("subject").and_then(Value::as_str) == Some(blocked_did.as_str()) {
                    writes.push(RepoWrite::delete(BLOCK_COLLECTION, rkey));
                }
            }
            if writes.is_empty() {
                return Ok(false);
            }
            tracing::info!(did, blocked_did, count = writes.len(), "deleting block records");
            return match self.commit(&did, writes).await {
                Ok(()) => Ok(true),
                Err(err) if is_state_conflict(&err) => Ok(false),
                Err(err) => Err(err),
            };
        }

        if let Some(recipient) = as1::recipient_if_dm(&activity) {
            let to_did = if recipient.starts_with("did:") {
                Some(recipient.to_string())
            } else if let Some(source) = obj.source_protocol {
                ids::translate_user_id(&self.store, source, Protocol::Atproto, recipient)?
            } else {
                None
            };
            let (Some(to_did), Some(msg)) = (to_did, record) else {
                return Ok(false);
            };
            return self.chat.send_message(&repo, &to_did, msg).await;
        }

        // everything else lands as a repo commit
        let effective_verb = if verb == "stop-following" {
            "delete".to_string()
        } else {
            verb.clone()
        };

        let record_type =
            record.as_ref().and_then(|r| r.get("$type")).and_then(Value::as_str).map(str::to_string);

        let mut collection = record_type.clone().unwrap_or_default();
        let mut rkey = String::new();
        if matches!(effective_verb.as_str(), "update" | "delete" | "undo") {
            // only modify objects we bridged in the first place
            let Some(copy) = base_obj.get_copy(Protocol::Atproto).map(str::to_string) else {
                tracing::info!(id = base_obj.id, verb, "we didn't create this, skipping");
                return Ok(false);
            };
            let Some((copy_did, copy_collection, copy_rkey)) = parse_at_uri(&copy) else {
                return Ok(false);
            };
            if copy_did != did
                || record_type.as_deref().is_some_and(|t| t != copy_collection)
            {
                tracing::info!(copy, "original copy is in a different repo or collection");
                return Ok(false);
            }
            collection = copy_collection;
            rkey = copy_rkey;
        }

        let write = match effective_verb.as_str() {
            "update" => {
                let Some(record) = record else { return Ok(false) };
                RepoWrite::update(collection.clone(), rkey.clone(), record)
            }
            "delete" | "undo" => RepoWrite::delete(collection.clone(), rkey.clone()),
            _ => {
                let Some(record) = record else { return Ok(false) };
                rkey = if collection == PROFILE_COLLECTION {
                    "self".to_string()
                } else {
                    next_tid()
                };
                RepoWrite::create(collection.clone(), rkey.clone(), record)
            }
        };
        let mut writes = vec![write];
        writes.extend(derived_writes(obj.as1()));

        tracing::info!(did, collection, rkey, verb = effective_verb, "storing atproto record");
        match self.commit(&did, writes).await {
            Ok(()) => {}
            Err(err) if is_state_conflict(&err) => {
                tracing::warn!(error = %err, "commit refused");
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        if effective_verb != "delete" && effective_verb != "undo" {
            let uri = at_uri(&did, &collection, &rkey);
            let mut base_obj = base_obj;
            base_obj.add_copy(Target::new(uri, Protocol::Atproto));
            self.store.put_object_with_user(&base_obj, from_user)?;
        }
        Ok(true)
    }

    /// Installs an externally imported repo under the bridge. The repo must
    /// already have been imported out of band; this rewrites its identity to
    /// point at us, activates our copy, and deactivates the old account.
    /// Every step tolerates re-running for retries.
    pub async fn migrate_in(
        &self,
        user: &User,
        from_did: &str,
        plc_code: &str,
        old_pds: &dyn PdsClient,
    ) -> Result<()> {
        let Some(repo) = self.storage.load_repo(from_did).await? else {
            return Err(AtprotoError::Value(format!("import {from_did}'s repo first")));
        };

        let did_doc_obj = self.store.get_object(from_did)?;
        let mut aka = did_doc_obj
            .as_ref()
            .and_then(|o| o.raw.as_ref())
            .and_then(|raw| DidDocument::from_value(raw).ok())
            .map(|doc| doc.also_known_as)
            .unwrap_or_default();
        if !aka.contains(&user.id) {
            aka.push(user.id.clone());
        }

        let signing = k256::ecdsa::SigningKey::from_slice(&repo.signing_key)
            .map_err(|e| AtprotoError::Crypto(e.to_string()))?;
        let rotation = k256::ecdsa::SigningKey::from_slice(&repo.rotation_key)
            .map_err(|e| AtprotoError::Crypto(e.to_string()))?;

        let op = old_pds
            .sign_plc_operation(
                plc_code,
                json!({
                    "rotationKeys": [crate::plc::format_did_key(rotation.verifying_key())],
                    "verificationMethods": {
                        "atproto": crate::plc::format_did_key(signing.verifying_key()),
                    },
                    "alsoKnownAs": aka,
                    "services": {
                        "atproto_pds": {
                            "type": "AtprotoPersonalDataServer",
                            "endpoint": self.domains.pds_url(),
                        },
                    },
                }),
            )
            .await?;

        self.plc.submit(from_did, op["operation"].clone()).await?;
        self.storage.activate_repo(from_did).await?;
        self.commit(from_did, Vec::new()).await?;
        old_pds.deactivate_account().await?;
        Ok(())
    }

    /// Points a bridged account's handle at a custom domain the user already
    /// attested (their DNS or well-known must resolve to the copy DID).
    pub async fn set_username(
        &self,
        user: &User,
        username: &str,
        resolved_did: Option<&str>,
    ) -> Result<bool> {
        if !user.is_enabled(Protocol::Atproto) {
            return Err(AtprotoError::Value(
                "user is not bridged into atproto".into(),
            ));
        }
        let Some(did) = user.get_copy(Protocol::Atproto).map(str::to_string) else {
            return Ok(false);
        };
        let username = username.trim_start_matches('@');

        let Some(mut repo) = self.storage.load_repo(&did).await? else {
            return Ok(false);
        };
        if !repo.is_active() {
            tracing::info!(did, status = ?repo.status, "repo is inactive, giving up");
            return Ok(false);
        }
        if repo.handle.as_deref() == Some(username) {
            return Ok(true);
        }

        if resolved_did != Some(did.as_str()) {
            return Err(AtprotoError::Value(format!(
                "{username} does not resolve to {did}; connect the domain first"
            )));
        }

        tracing::info!(user = user.key(), username, "setting atproto handle");
        let rotation = k256::ecdsa::SigningKey::from_slice(&repo.rotation_key)
            .map_err(|e| AtprotoError::Crypto(e.to_string()))?;
        let signing = k256::ecdsa::SigningKey::from_slice(&repo.signing_key)
            .map_err(|e| AtprotoError::Crypto(e.to_string()))?;
        let op = json!({
            "type": "plc_operation",
            "rotationKeys": [crate::plc::format_did_key(rotation.verifying_key())],
            "verificationMethods": {
                "atproto": crate::plc::format_did_key(signing.verifying_key()),
            },
            "alsoKnownAs": [format!("at://{username}")],
            "services": {
                "atproto_pds": {
                    "type": "AtprotoPersonalDataServer",
                    "endpoint": self.domains.pds_url(),
                },
            },
        });
        self.plc.submit(&did, op).await?;

        repo.handle = Some(username.to_string());
        self.storage.create_repo(repo).await?;
        self.notify_commit(&did).await;
        Ok(true)
    }
}

fn is_state_conflict(err: &AtprotoError) -> bool {
    matches!(err, AtprotoError::Value(_) | AtprotoError::InactiveRepo(_))
}

/// Extra records an activity implies. Currently just the Web Monetization
/// wallet record for actors that carry a `monetization` field.
pub fn derived_writes(activity: Option<&Value>) -> Vec<RepoWrite> {
    let Some(activity) = activity else {
        return Vec::new();
    };

    let verb = activity.get("verb").and_then(Value::as_str);
    let object_type = activity.get("objectType").and_then(Value::as_str);
    let action = if object_type != Some("activity") || verb == Some("post") {
        Some("create")
    } else {
        match verb {
            Some("update") => Some("update"),
            Some("delete") | Some("undo") => Some("delete"),
            _ => None,
        }
    };

    let inner = if verb.is_some_and(|v| as1::CRUD_VERBS.contains(&v)) {
        as1::get_object(activity)
    } else {
        activity.clone()
    };

    let is_actor =
        as1::object_type(&inner).is_some_and(|t| as1::ACTOR_TYPES.contains(&t));
    if !is_actor {
        return Vec::new();
    }
    let Some(wallet) = inner.get("monetization").and_then(Value::as_str) else {
        return Vec::new();
    };

    match action {
        Some("create") => vec![RepoWrite::create(
            MONETIZATION_COLLECTION,
            "self",
            json!({"$type": MONETIZATION_COLLECTION, "address": wallet}),
        )],
        Some("update") => vec![RepoWrite::update(
            MONETIZATION_COLLECTION,
            "self",
            json!({"$type": MONETIZATION_COLLECTION, "address": wallet}),
        )],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests;
