//! The built-in AS1 translator. It lives behind the `Converter` trait so a
//! richer implementation can replace it wholesale; this one covers the
//! record kinds the bridge routes: posts, profiles, likes, reposts, follows,
//! blocks, deletes, and flags.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use bifrost_atproto::blobs::RemoteBlobCache;
use bifrost_core::as1;
use bifrost_core::convert::{ConvertOpts, Converter};
use bifrost_core::error::Result as CoreResult;
use bifrost_core::ids;
use bifrost_core::models::Object;
use bifrost_core::protocol::Protocol;
use bifrost_core::store::Datastore;
use bifrost_nostr::event::{
    Event, KIND_ARTICLE, KIND_CONTACTS, KIND_DELETE, KIND_NOTE, KIND_PROFILE, KIND_REACTION,
    KIND_REPOST,
};
use bifrost_nostr::nip19;

pub struct DefaultConverter {
    store: Datastore,
    blobs: RemoteBlobCache,
}

impl DefaultConverter {
    pub fn new(store: Datastore, blobs: RemoteBlobCache) -> Self {
        DefaultConverter { store, blobs }
    }

    /// The `at://` uri (and stored cid, if any) an object id maps to.
    fn atproto_object_ref(&self, id: &str) -> Option<(String, String)> {
        if Protocol::Atproto.owns_id(id).is_yes() {
            let cid = self
                .store
                .get_object(id)
                .ok()
                .flatten()
                .and_then(|o| o.bsky)
                .and_then(|b| b.get("cid").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            return Some((id.to_string(), cid));
        }
        let obj = self.store.get_object(id).ok().flatten()?;
        obj.get_copy(Protocol::Atproto).map(|uri| (uri.to_string(), String::new()))
    }

    /// The DID a user id maps to.
    fn atproto_user_ref(&self, id: &str) -> Option<String> {
        if id.starts_with("did:") {
            return Some(id.to_string());
        }
        let key = ids::key_for(id)?;
        let user = self.store.get_user_by_key(&key).ok().flatten()?;
        user.get_copy(Protocol::Atproto).map(str::to_string)
    }

    /// The hex event id the object's Nostr copy denotes.
    fn nostr_event_ref(&self, id: &str) -> Option<String> {
        if Protocol::Nostr.owns_id(id).is_yes() {
            return nip19::uri_to_id(id).ok();
        }
        let obj = self.store.get_object(id).ok().flatten()?;
        let copy = obj.get_copy(Protocol::Nostr)?;
        nip19::uri_to_id(copy).ok()
    }

    /// The hex pubkey a user id maps to.
    fn nostr_user_ref(&self, id: &str) -> Option<String> {
        if Protocol::Nostr.owns_id(id).is_yes() {
            return nip19::uri_to_id(id).ok();
        }
        let key = ids::key_for(id)?;
        let user = self.store.get_user_by_key(&key).ok().flatten()?;
        if let Some(copy) = user.get_copy(Protocol::Nostr) {
            return nip19::uri_to_id(copy).ok();
        }
        user.hex_pubkey().ok()
    }

    async fn to_bsky(&self, obj: &Object, opts: &ConvertOpts) -> CoreResult<Option<Value>> {
        let Some(activity) = obj.as1() else {
            return Ok(None);
        };
        let object_type = as1::object_type(activity).unwrap_or_default().to_string();
        let created_at = activity
            .get("published")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let record = match object_type.as_str() {
            "note" | "comment" | "article" | "image" | "video" => {
                let mut record = json!({
                    "$type": "app.bsky.feed.post",
                    "text": text_of(activity),
                    "createdAt": created_at,
                });
                if let Some(parent_id) = as1::get_id(activity, "inReplyTo") {
                    if let Some((uri, cid)) = self.atproto_object_ref(parent_id) {
                        let reference = json!({"uri": uri, "cid": cid});
                        record["reply"] =
                            json!({"parent": reference.clone(), "root": reference});
                    }
                }
                record
            }
            t if as1::ACTOR_TYPES.contains(&t) => {
                let mut record = json!({
                    "$type": "app.bsky.actor.profile",
                    "displayName": activity.get("displayName")
                        .or_else(|| activity.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    "description": activity.get("summary").and_then(Value::as_str)
                        .unwrap_or_default(),
                });
                if opts.fetch_blobs {
                    if let Some(avatar_url) = as1::get_id(activity, "image") {
                        let repo_did = opts
                            .from_user
                            .as_ref()
                            .and_then(|u| u.get_copy(Protocol::Atproto))
                            .unwrap_or_default()
                            .to_string();
                        if let Ok(Some(blob)) =
                            self.blobs.get_or_fetch(avatar_url, &repo_did).await
                        {
                            record["avatar"] = blob.as_object();
                        }
                    }
                }
                record
            }
            "like" | "share" => {
                let Some(target) = as1::get_id(activity, "object") else {
                    return Ok(None);
                };
                let Some((uri, cid)) = self.atproto_object_ref(target) else {
                    return Ok(None);
                };
                let collection = if object_type == "like" {
                    "app.bsky.feed.like"
                } else {
                    "app.bsky.feed.repost"
                };
                json!({
                    "$type": collection,
                    "subject": {"uri": uri, "cid": cid},
                    "createdAt": created_at,
                })
            }
            "follow" | "block" => {
                let Some(target) = as1::get_id(activity, "object") else {
                    return Ok(None);
                };
                let Some(did) = self.atproto_user_ref(target) else {
                    return Ok(None);
                };
                let collection = if object_type == "follow" {
                    "app.bsky.graph.follow"
                } else {
                    "app.bsky.graph.block"
                };
                json!({
                    "$type": collection,
                    "subject": did,
                    "createdAt": created_at,
                })
            }
            "flag" => {
                let subject = as1::get_id(activity, "object").unwrap_or_default();
                let subject_ref = match self.atproto_object_ref(subject) {
                    Some((uri, cid)) => json!({
                        "$type": "com.atproto.repo.strongRef", "uri": uri, "cid": cid,
                    }),
                    None => match self.atproto_user_ref(subject) {
                        Some(did) => json!({
                            "$type": "com.atproto.admin.defs#repoRef", "did": did,
                        }),
                        None => return Ok(None),
                    },
                };
                json!({
                    "$type": "com.atproto.moderation.createReport#input",
                    "reasonType": "com.atproto.moderation.defs#reasonOther",
                    "reason": text_of(activity),
                    "subject": subject_ref,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(record))
    }

    fn to_nostr(&self, obj: &Object, opts: &ConvertOpts) -> CoreResult<Option<Value>> {
        let Some(activity) = obj.as1() else {
            return Ok(None);
        };
        let Some(user) = &opts.from_user else {
            return Ok(None);
        };
        let Some(privkey) = &user.nostr_privkey else {
            return Ok(None);
        };
        let key = k256::schnorr::SigningKey::from_bytes(privkey)
            .map_err(|e| bifrost_core::CoreError::Crypto(e.to_string()))?;
        let created_at = Utc::now().timestamp().max(0) as u64;

        let object_type = as1::object_type(activity).unwrap_or_default().to_string();
        let (kind, tags, content) = match object_type.as_str() {
            "note" | "comment" | "image" | "video" => {
                let mut tags = Vec::new();
                if let Some(parent) = as1::get_id(activity, "inReplyTo") {
                    if let Some(hex) = self.nostr_event_ref(parent) {
                        tags.push(vec!["e".to_string(), hex, String::new(), "reply".to_string()]);
                    }
                }
                (KIND_NOTE, tags, text_of(activity))
            }
            "article" => {
                let slug = activity.get("id").and_then(Value::as_str).unwrap_or(obj.id.as_str());
                (KIND_ARTICLE, vec![vec!["d".to_string(), slug.to_string()]], text_of(activity))
            }
            t if as1::ACTOR_TYPES.contains(&t) => {
                let profile = json!({
                    "name": activity.get("displayName").or_else(|| activity.get("name"))
                        .and_then(Value::as_str).unwrap_or_default(),
                    "about": activity.get("summary").and_then(Value::as_str)
                        .unwrap_or_default(),
                    "picture": as1::get_id(activity, "image").unwrap_or_default(),
                });
                (KIND_PROFILE, Vec::new(), profile.to_string())
            }
            "like" => {
                let Some(hex) = as1::get_id(activity, "object")
                    .and_then(|id| self.nostr_event_ref(id))
                else {
                    return Ok(None);
                };
                (KIND_REACTION, vec![vec!["e".to_string(), hex]], "+".to_string())
            }
            "share" => {
                let Some(hex) = as1::get_id(activity, "object")
                    .and_then(|id| self.nostr_event_ref(id))
                else {
                    return Ok(None);
                };
                (KIND_REPOST, vec![vec!["e".to_string(), hex]], String::new())
            }
            "follow" => {
                let Some(pubkey) = as1::get_id(activity, "object")
                    .and_then(|id| self.nostr_user_ref(id))
                else {
                    return Ok(None);
                };
                (KIND_CONTACTS, vec![vec!["p".to_string(), pubkey]], String::new())
            }
            "delete" | "undo" => {
                let Some(hex) = as1::get_id(activity, "object")
                    .and_then(|id| self.nostr_event_ref(id))
                else {
                    return Ok(None);
                };
                (KIND_DELETE, vec![vec!["e".to_string(), hex]], String::new())
            }
            _ => return Ok(None),
        };

        let event = Event::sign(&key, created_at, kind, tags, content)
            .map_err(|e| bifrost_core::CoreError::Crypto(e.to_string()))?;
        Ok(Some(event.to_value()))
    }

    fn bsky_to_as1(&self, record: &Value) -> Option<Value> {
        let record_type = record.get("$type").and_then(Value::as_str)?;
        let published = record.get("createdAt").cloned();
        let mut as1 = match record_type {
            "app.bsky.feed.post" => json!({
                "objectType": "note",
                "content": record.get("text").and_then(Value::as_str).unwrap_or_default(),
            }),
            "app.bsky.actor.profile" => json!({
                "objectType": "person",
                "displayName": record.get("displayName").and_then(Value::as_str)
                    .unwrap_or_default(),
                "summary": record.get("description").and_then(Value::as_str)
                    .unwrap_or_default(),
            }),
            "app.bsky.feed.like" | "app.bsky.feed.repost" => json!({
                "objectType": "activity",
                "verb": if record_type == "app.bsky.feed.like" { "like" } else { "share" },
                "object": record.pointer("/subject/uri").cloned().unwrap_or(Value::Null),
            }),
            "app.bsky.graph.follow" | "app.bsky.graph.block" => json!({
                "objectType": "activity",
                "verb": if record_type == "app.bsky.graph.follow" { "follow" } else { "block" },
                "object": record.get("subject").cloned().unwrap_or(Value::Null),
            }),
            _ => return None,
        };
        if let Some(published) = published {
            as1["published"] = published;
        }
        if record_type == "app.bsky.feed.post" {
            if let Some(parent) = record.pointer("/reply/parent/uri") {
                as1["inReplyTo"] = parent.clone();
            }
        }
        Some(as1)
    }

    fn nostr_to_as1(&self, raw: &Value) -> Option<Value> {
        let event = Event::from_value(raw).ok()?;
        let first_tag = |name: &str| {
            event
                .tags
                .iter()
                .find(|tag| tag.first().map(String::as_str) == Some(name))
                .and_then(|tag| tag.get(1).cloned())
        };
        let tag_uri = |prefix: &str, name: &str| {
            first_tag(name).and_then(|hex| nip19::id_to_uri(prefix, &hex).ok())
        };

        let as1 = match event.kind {
            KIND_NOTE => json!({
                "objectType": "note",
                "id": nip19::uri_for(&event).ok()?,
                "content": event.content,
                "author": nip19::npub_uri(&event.pubkey).ok()?,
                "inReplyTo": tag_uri("note", "e"),
            }),
            KIND_ARTICLE => json!({
                "objectType": "article",
                "id": nip19::uri_for(&event).ok()?,
                "content": event.content,
                "author": nip19::npub_uri(&event.pubkey).ok()?,
            }),
            KIND_PROFILE => {
                let profile: Value = serde_json::from_str(&event.content).ok()?;
                json!({
                    "objectType": "person",
                    "id": nip19::npub_uri(&event.pubkey).ok()?,
                    "displayName": profile.get("name").and_then(Value::as_str)
                        .unwrap_or_default(),
                    "summary": profile.get("about").and_then(Value::as_str)
                        .unwrap_or_default(),
                    "image": profile.get("picture").and_then(Value::as_str)
                        .unwrap_or_default(),
                })
            }
            KIND_REACTION => json!({
                "objectType": "activity",
                "verb": "like",
                "actor": nip19::npub_uri(&event.pubkey).ok()?,
                "object": tag_uri("note", "e"),
            }),
            KIND_REPOST => json!({
                "objectType": "activity",
                "verb": "share",
                "actor": nip19::npub_uri(&event.pubkey).ok()?,
                "object": tag_uri("note", "e"),
            }),
            KIND_CONTACTS => json!({
                "objectType": "activity",
                "verb": "follow",
                "actor": nip19::npub_uri(&event.pubkey).ok()?,
                "object": tag_uri("npub", "p"),
            }),
            KIND_DELETE => json!({
                "objectType": "activity",
                "verb": "delete",
                "actor": nip19::npub_uri(&event.pubkey).ok()?,
                "object": tag_uri("note", "e"),
            }),
            _ => return None,
        };
        Some(as1)
    }
}

fn text_of(value: &Value) -> String {
    value
        .get("content")
        .or_else(|| value.get("summary"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Converter for DefaultConverter {
    async fn to_record(
        &self,
        obj: &Object,
        to: Protocol,
        opts: &ConvertOpts,
    ) -> CoreResult<Option<Value>> {
        if obj.as1().is_none() {
            return Ok(None);
        }
        match to {
            Protocol::Atproto => self.to_bsky(obj, opts).await,
            Protocol::Nostr => self.to_nostr(obj, opts),
            Protocol::ActivityPub | Protocol::Web => Ok(None),
        }
    }

    async fn to_as1(&self, record: &Value, from: Protocol) -> CoreResult<Option<Value>> {
        Ok(match from {
            Protocol::Atproto => self.bsky_to_as1(record),
            Protocol::Nostr => self.nostr_to_as1(record),
            Protocol::ActivityPub | Protocol::Web => None,
        })
    }
}
