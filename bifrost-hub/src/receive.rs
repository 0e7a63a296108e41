//! The receive worker: pops durable tasks, canonicalizes the event into an
//! Object, and fans it out through the send engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use bifrost_core::as1;
use bifrost_core::convert::Converter;
use bifrost_core::ids;
use bifrost_core::models::{Follower, FollowerStatus, Object, User};
use bifrost_core::protocol::Protocol;
use bifrost_core::report;
use bifrost_core::store::Datastore;
use bifrost_core::tasks::{ReceiveTask, Task};

use crate::send::SendEngine;

pub struct ReceiveWorker {
    store: Datastore,
    engine: Arc<SendEngine>,
    converter: Arc<dyn Converter>,
}

impl ReceiveWorker {
    pub fn new(store: Datastore, engine: Arc<SendEngine>, converter: Arc<dyn Converter>) -> Self {
        ReceiveWorker { store, engine, converter }
    }

    pub async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<Task>) {
        while let Some(task) = rx.recv().await {
            if let Err(err) = self.handle(task).await {
                report::exception("receive worker", &err);
            }
        }
    }

    pub async fn handle(&self, task: Task) -> anyhow::Result<()> {
        match task.queue.as_str() {
            "receive" => self.receive(serde_json::from_value(task.params)?).await,
            // the relay-broadcast consumer owns this queue
            "atproto-commit" => Ok(()),
            other => {
                tracing::debug!(queue = other, "ignoring task for unknown queue");
                Ok(())
            }
        }
    }

    /// One event, end to end: canonicalize, record followers, deliver.
    pub async fn receive(&self, payload: ReceiveTask) -> anyhow::Result<()> {
        let source = payload.source_protocol;

        let mut obj =
            self.store.get_object(&payload.id)?.unwrap_or_else(|| Object::new(&payload.id));
        obj.source_protocol = Some(source);
        if let Some(bsky) = payload.bsky {
            obj.bsky = Some(bsky);
        }
        if let Some(nostr) = payload.nostr {
            obj.nostr = Some(nostr);
        }
        if let Some(activity) = payload.our_as1 {
            obj.our_as1 = Some(activity);
        }
        if obj.our_as1.is_none() {
            let record = obj.bsky.clone().or_else(|| obj.nostr.clone());
            if let Some(record) = record {
                obj.our_as1 = self.converter.to_as1(&record, source).await?;
            }
        }
        let Some(activity) = obj.as1().cloned() else {
            tracing::info!(id = obj.id, "nothing translatable; storing and stopping");
            self.store.put_object(&obj)?;
            return Ok(());
        };

        // the signing identity is authoritative for authorship
        if let Some(owner) = as1::get_owner(&activity) {
            if owner != payload.authed_as && !payload.id.starts_with(owner) {
                tracing::warn!(
                    id = obj.id,
                    owner,
                    authed_as = payload.authed_as,
                    "dropping event with mismatched author"
                );
                return Ok(());
            }
        }
        self.store.put_object(&obj)?;

        let mut author = match self.store.get_user(source, &payload.authed_as)? {
            Some(user) => user,
            None => {
                let mut user = User::new(source, &payload.authed_as);
                // nostr ids double as handles until the profile is loaded
                if source == Protocol::Nostr {
                    user.handle =
                        user.id.strip_prefix("nostr:").map(str::to_string);
                }
                self.store.put_user(&user)?;
                user
            }
        };

        self.record_followers(&obj, &activity, &author)?;

        for to in self.targets(&activity, &author)? {
            match self.engine.send(&obj, to, &mut author).await {
                Ok(sent) => {
                    tracing::info!(id = obj.id, to = to.label(), sent, "delivered");
                }
                Err(err) => report::error(&obj.id, &err),
            }
        }
        Ok(())
    }

    /// Destination protocols for one activity: everywhere the author opted
    /// in, plus the native protocols of bridged users the activity
    /// references (replies and mentions reach users who never opted the
    /// author in).
    fn targets(&self, activity: &Value, author: &User) -> anyhow::Result<BTreeSet<Protocol>> {
        let mut targets: BTreeSet<Protocol> = author
            .enabled_protocols
            .iter()
            .copied()
            .filter(|p| p.has_copies())
            .collect();

        let mut referenced: Vec<&str> = Vec::new();
        referenced.extend(as1::get_id(activity, "inReplyTo"));
        referenced.extend(as1::get_id(activity, "object"));
        let inner = as1::get_object(activity);
        referenced.extend(inner.get("id").and_then(Value::as_str));
        if let Some(parent) = as1::get_id(&inner, "inReplyTo") {
            referenced.push(parent);
        }

        for id in referenced {
            // a reference to one of our copies means the original lives on
            // the other side
            if let Some(original) = self.store.object_for_copy(id)? {
                if let Some(protocol) = original.source_protocol {
                    targets.insert(protocol);
                }
            }
            if let Some(key) = ids::key_for(id) {
                if let Some(user) = self.store.get_user_by_key(&key)? {
                    targets.insert(user.protocol);
                }
            }
        }

        targets.remove(&author.protocol);
        // only protocols with a full egress engine here
        targets.retain(|p| p.has_copies());
        Ok(targets)
    }

    /// Follow bookkeeping, so stop-following can find what to delete later.
    fn record_followers(&self, obj: &Object, activity: &Value, author: &User) -> anyhow::Result<()> {
        match as1::object_type(activity) {
            Some("follow") => {
                if let Some(followee) = as1::get_id(activity, "object") {
                    if let Some(to_key) = ids::key_for(followee) {
                        let follower =
                            Follower::new(author.key(), to_key, Some(obj.id.clone()));
                        self.store.put_follower(&follower)?;
                    }
                }
            }
            Some("stop-following") => {
                if let Some(followee) = as1::get_id(activity, "object") {
                    if let Some(to_key) = ids::key_for(followee) {
                        if let Some(mut follower) =
                            self.store.get_follower(&author.key(), &to_key)?
                        {
                            follower.status = FollowerStatus::Inactive;
                            follower.updated = chrono::Utc::now();
                            self.store.put_follower(&follower)?;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bifrost_core::convert::ConvertOpts;
    use bifrost_core::error::Result as CoreResult;
    use bifrost_core::models::Target;
    use serde_json::json;

    struct EchoConverter;

    #[async_trait]
    impl Converter for EchoConverter {
        async fn to_record(
            &self,
            _obj: &Object,
            _to: Protocol,
            _opts: &ConvertOpts,
        ) -> CoreResult<Option<Value>> {
            Ok(None)
        }

        async fn to_as1(&self, record: &Value, _from: Protocol) -> CoreResult<Option<Value>> {
            Ok(record.get("as1").cloned())
        }
    }

    fn worker() -> (ReceiveWorker, Datastore) {
        let store = Datastore::temporary().unwrap();
        // the engine is only consulted for delivery; these tests exercise
        // canonicalization, authorship, followers and targets
        let engine = crate::send::tests::engine_for_store(store.clone());
        (ReceiveWorker::new(store.clone(), Arc::new(engine), Arc::new(EchoConverter)), store)
    }

    #[tokio::test]
    async fn receive_stores_object_and_translates() {
        let (worker, store) = worker();
        worker
            .receive(ReceiveTask {
                id: "nostr:note1abc".into(),
                source_protocol: Protocol::Nostr,
                bsky: None,
                nostr: Some(json!({"kind": 1, "as1": {"objectType": "note", "content": "hi"}})),
                our_as1: None,
                authed_as: "nostr:npub1q".into(),
                received_at: None,
            })
            .await
            .unwrap();

        let obj = store.get_object("nostr:note1abc").unwrap().unwrap();
        assert_eq!(obj.source_protocol, Some(Protocol::Nostr));
        assert_eq!(obj.as1().unwrap()["content"], "hi");

        // the author user was created
        assert!(store.get_user(Protocol::Nostr, "nostr:npub1q").unwrap().is_some());
    }

    #[tokio::test]
    async fn mismatched_author_is_dropped() {
        let (worker, store) = worker();
        worker
            .receive(ReceiveTask {
                id: "nostr:note1abc".into(),
                source_protocol: Protocol::Nostr,
                bsky: None,
                nostr: Some(json!({
                    "kind": 1,
                    "as1": {"objectType": "note", "content": "hi",
                            "author": "nostr:npub1mallory"},
                })),
                our_as1: None,
                authed_as: "nostr:npub1q".into(),
                received_at: None,
            })
            .await
            .unwrap();

        assert!(store.get_object("nostr:note1abc").unwrap().is_none());
    }

    #[tokio::test]
    async fn follow_records_follower_edge() {
        let (worker, store) = worker();
        worker
            .receive(ReceiveTask {
                id: "at://did:plc:alice/app.bsky.graph.follow/1".into(),
                source_protocol: Protocol::Atproto,
                bsky: None,
                nostr: None,
                our_as1: Some(json!({
                    "objectType": "activity",
                    "verb": "follow",
                    "actor": "did:plc:alice",
                    "object": "did:plc:bob",
                })),
                authed_as: "did:plc:alice".into(),
                received_at: None,
            })
            .await
            .unwrap();

        let follower = store
            .get_follower("atproto did:plc:alice", "atproto did:plc:bob")
            .unwrap()
            .unwrap();
        assert_eq!(
            follower.follow.as_deref(),
            Some("at://did:plc:alice/app.bsky.graph.follow/1")
        );
        assert_eq!(follower.status, FollowerStatus::Active);
    }

    #[tokio::test]
    async fn stop_following_marks_edge_inactive() {
        let (worker, store) = worker();
        let follower = Follower::new(
            "atproto did:plc:alice",
            "atproto did:plc:bob",
            Some("at://did:plc:alice/app.bsky.graph.follow/1".into()),
        );
        store.put_follower(&follower).unwrap();

        worker
            .receive(ReceiveTask {
                id: "at://did:plc:alice/app.bsky.graph.follow/1#stop-following".into(),
                source_protocol: Protocol::Atproto,
                bsky: None,
                nostr: None,
                our_as1: Some(json!({
                    "objectType": "activity",
                    "verb": "stop-following",
                    "actor": "did:plc:alice",
                    "object": "did:plc:bob",
                })),
                authed_as: "did:plc:alice".into(),
                received_at: None,
            })
            .await
            .unwrap();

        let follower = store
            .get_follower("atproto did:plc:alice", "atproto did:plc:bob")
            .unwrap()
            .unwrap();
        assert_eq!(follower.status, FollowerStatus::Inactive);
    }

    #[tokio::test]
    async fn targets_include_enabled_and_referenced_protocols() {
        let (worker, store) = worker();

        // a nostr reply to a copy of a web user's post
        let mut original = Object::new("https://carol.com/post/1");
        original.source_protocol = Some(Protocol::Web);
        original.add_copy(Target::new("nostr:note1copy", Protocol::Nostr));
        store.put_object(&original).unwrap();

        let mut author = User::new(Protocol::Nostr, "nostr:npub1q");
        author.enabled_protocols = vec![Protocol::Atproto];

        let activity = json!({
            "objectType": "note",
            "content": "re",
            "inReplyTo": "nostr:note1copy",
        });
        let targets = worker.targets(&activity, &author).unwrap();
        // atproto from the author's opt-in; web has no egress engine here
        assert!(targets.contains(&Protocol::Atproto));
        assert!(!targets.contains(&Protocol::Web));
        assert!(!targets.contains(&Protocol::Nostr));
    }
}
