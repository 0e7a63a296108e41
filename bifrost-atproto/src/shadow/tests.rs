use super::*;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bifrost_core::convert::ConvertOpts;
use bifrost_core::error::Result as CoreResult;
use bifrost_core::models::Follower;
use bifrost_core::tasks::{Task, TaskQueue};

use crate::plc::{doc_for_operation, genesis_operation, CreatedDid};
use crate::repo::DatastoreRepoStorage;

struct FakePlc {
    creates: AtomicUsize,
}

#[async_trait]
impl PlcDirectory for FakePlc {
    async fn create(&self, params: CreateDidParams) -> Result<CreatedDid> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        let signing = k256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let rotation = k256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let (_, op) = genesis_operation(&params, &signing, &rotation)?;
        let did = format!("did:plc:shadow{n}");
        Ok(CreatedDid {
            doc: doc_for_operation(&did, &op),
            did,
            signing_key: signing.to_bytes().to_vec(),
            rotation_key: rotation.to_bytes().to_vec(),
        })
    }

    async fn resolve(&self, did: &str) -> Result<Value> {
        Ok(json!({"id": did}))
    }

    async fn submit(&self, _did: &str, _operation: Value) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDns {
    sets: Mutex<Vec<(String, String)>>,
    removes: Mutex<Vec<String>>,
}

#[async_trait]
impl DnsAdmin for RecordingDns {
    async fn set_dns(&self, handle: &str, did: &str) -> Result<()> {
        self.sets.lock().unwrap().push((handle.to_string(), did.to_string()));
        Ok(())
    }

    async fn remove_dns(&self, handle: &str) -> Result<()> {
        self.removes.lock().unwrap().push(handle.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingQueue {
    tasks: Mutex<Vec<Task>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task) -> CoreResult<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

struct TestConverter;

#[async_trait]
impl Converter for TestConverter {
    async fn to_record(
        &self,
        obj: &Object,
        _to: Protocol,
        _opts: &ConvertOpts,
    ) -> CoreResult<Option<Value>> {
        let Some(activity) = obj.as1() else {
            return Ok(None);
        };
        let record = match as1::object_type(activity) {
            Some("note") => json!({
                "$type": "app.bsky.feed.post",
                "text": activity.get("content").and_then(Value::as_str).unwrap_or_default(),
            }),
            Some("person") => json!({
                "$type": "app.bsky.actor.profile",
                "displayName": activity.get("displayName").and_then(Value::as_str)
                    .unwrap_or_default(),
            }),
            Some("follow") => json!({
                "$type": "app.bsky.graph.follow",
                "subject": as1::get_id(activity, "object").unwrap_or_default(),
            }),
            Some("block") => json!({
                "$type": "app.bsky.graph.block",
                "subject": as1::get_id(activity, "object").unwrap_or_default(),
            }),
            Some("flag") => json!({
                "$type": "com.atproto.moderation.createReport#input",
                "reasonType": "com.atproto.moderation.defs#reasonOther",
            }),
            _ => return Ok(None),
        };
        Ok(Some(record))
    }

    async fn to_as1(&self, _record: &Value, _from: Protocol) -> CoreResult<Option<Value>> {
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingChat {
    sent: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ChatService for RecordingChat {
    async fn send_message(&self, _from_repo: &Repo, to_did: &str, msg: Value) -> Result<bool> {
        self.sent.lock().unwrap().push((to_did.to_string(), msg));
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingModeration {
    reports: Mutex<Vec<Value>>,
}

#[async_trait]
impl ModerationService for RecordingModeration {
    async fn create_report(&self, _from_repo: &Repo, input: Value) -> Result<bool> {
        self.reports.lock().unwrap().push(input);
        Ok(true)
    }
}

struct Fixture {
    store: Datastore,
    storage: Arc<DatastoreRepoStorage>,
    plc: Arc<FakePlc>,
    dns: Arc<RecordingDns>,
    queue: Arc<RecordingQueue>,
    chat: Arc<RecordingChat>,
    moderation: Arc<RecordingModeration>,
    shadow: ShadowRepos,
}

fn fixture() -> Fixture {
    let store = Datastore::temporary().unwrap();
    let storage = Arc::new(DatastoreRepoStorage::new(&store).unwrap());
    let plc = Arc::new(FakePlc { creates: AtomicUsize::new(0) });
    let dns = Arc::new(RecordingDns::default());
    let queue = Arc::new(RecordingQueue::default());
    let chat = Arc::new(RecordingChat::default());
    let moderation = Arc::new(RecordingModeration::default());
    let shadow = ShadowRepos::new(
        store.clone(),
        storage.clone(),
        plc.clone(),
        dns.clone(),
        Arc::new(Dispatcher::new(queue.clone())),
        Arc::new(TestConverter),
        chat.clone(),
        moderation.clone(),
        Domains::default(),
    );
    Fixture { store, storage, plc, dns, queue, chat, moderation, shadow }
}

fn web_user(fix: &Fixture) -> User {
    let mut profile = Object::with_as1(
        "https://alice.com/",
        json!({"objectType": "person", "id": "https://alice.com/", "displayName": "Alice"}),
    );
    profile.source_protocol = Some(Protocol::Web);
    fix.store.put_object(&profile).unwrap();

    let mut user = User::new(Protocol::Web, "alice.com");
    user.handle = Some("alice.com".into());
    user.enabled_protocols = vec![Protocol::Atproto];
    user.obj_key = Some("https://alice.com/".into());
    fix.store.put_user(&user).unwrap();
    user
}

async fn bridged_user(fix: &Fixture) -> User {
    let mut user = web_user(fix);
    fix.shadow.create_for(&mut user).await.unwrap();
    user
}

fn commit_tasks(queue: &RecordingQueue) -> usize {
    queue.tasks.lock().unwrap().iter().filter(|t| t.queue == "atproto-commit").count()
}

#[tokio::test]
async fn create_for_mints_did_repo_and_profile() {
    let fix = fixture();
    let mut user = web_user(&fix);

    fix.shadow.create_for(&mut user).await.unwrap();

    let did = user.get_copy(Protocol::Atproto).expect("user should have an atproto copy");
    assert_eq!(did, "did:plc:shadow0");

    let repo = fix.storage.load_repo(did).await.unwrap().unwrap();
    assert!(repo.is_active());
    assert_eq!(repo.handle.as_deref(), Some("alice.com.web.brid.gy"));

    let chat_decl =
        fix.storage.get_record(did, "chat.bsky.actor.declaration", "self").await.unwrap();
    assert_eq!(chat_decl.unwrap()["allowIncoming"], "none");

    let profile = fix.storage.get_record(did, "app.bsky.actor.profile", "self").await.unwrap();
    assert_eq!(profile.unwrap()["displayName"], "Alice");

    // profile object gained its copy, DNS installed, commits notified
    let profile_obj = fix.store.get_object("https://alice.com/").unwrap().unwrap();
    assert_eq!(
        profile_obj.get_copy(Protocol::Atproto),
        Some("at://did:plc:shadow0/app.bsky.actor.profile/self")
    );
    assert_eq!(
        *fix.dns.sets.lock().unwrap(),
        vec![("alice.com.web.brid.gy".to_string(), "did:plc:shadow0".to_string())]
    );
    assert!(commit_tasks(&fix.queue) >= 2);
}

#[tokio::test]
async fn create_for_is_idempotent() {
    let fix = fixture();
    let mut user = web_user(&fix);

    fix.shadow.create_for(&mut user).await.unwrap();
    fix.shadow.create_for(&mut user).await.unwrap();

    assert_eq!(fix.plc.creates.load(Ordering::SeqCst), 1);
    assert_eq!(fix.dns.sets.lock().unwrap().len(), 1);
    assert_eq!(user.copies.len(), 1);
}

#[tokio::test]
async fn create_for_reactivates_deactivated_shadow() {
    let fix = fixture();
    let mut user = bridged_user(&fix).await;
    let did = user.get_copy(Protocol::Atproto).unwrap().to_string();

    fix.storage.deactivate_repo(&did).await.unwrap();
    fix.shadow.create_for(&mut user).await.unwrap();

    let repo = fix.storage.load_repo(&did).await.unwrap().unwrap();
    assert!(repo.is_active());
    // no second DID was minted, DNS was re-installed
    assert_eq!(fix.plc.creates.load(Ordering::SeqCst), 1);
    assert_eq!(fix.dns.sets.lock().unwrap().len(), 2);
    assert_eq!(user.copies.len(), 1);
}

#[tokio::test]
async fn create_for_tombstoned_shadow_mints_fresh_did() {
    let fix = fixture();
    let mut user = bridged_user(&fix).await;
    let old_did = user.get_copy(Protocol::Atproto).unwrap().to_string();

    fix.storage.tombstone_repo(&old_did).await.unwrap();
    fix.shadow.create_for(&mut user).await.unwrap();

    let new_did = user.get_copy(Protocol::Atproto).unwrap().to_string();
    assert_ne!(new_did, old_did);
    assert_eq!(user.copies.len(), 1);
    assert_eq!(fix.plc.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn send_create_post_commits_and_records_copy() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let did = user.get_copy(Protocol::Atproto).unwrap().to_string();
    let before = commit_tasks(&fix.queue);

    let mut obj = Object::with_as1(
        "https://alice.com/post/1",
        json!({
            "objectType": "activity",
            "verb": "post",
            "actor": "https://alice.com/",
            "object": {"objectType": "note", "id": "https://alice.com/post/1",
                       "content": "hello world"},
        }),
    );
    obj.source_protocol = Some(Protocol::Web);

    let sent = fix.shadow.send(&obj, "https://atproto.brid.gy", &user).await.unwrap();
    assert!(sent);

    let base = fix.store.get_object("https://alice.com/post/1").unwrap().unwrap();
    let copy = base.get_copy(Protocol::Atproto).expect("base object should gain a copy");
    let (copy_did, collection, rkey) = parse_at_uri(copy).unwrap();
    assert_eq!(copy_did, did);
    assert_eq!(collection, "app.bsky.feed.post");

    let record = fix.storage.get_record(&did, &collection, &rkey).await.unwrap().unwrap();
    assert_eq!(record["text"], "hello world");
    assert_eq!(commit_tasks(&fix.queue), before + 1);
}

#[tokio::test]
async fn send_to_foreign_pds_is_refused() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let obj = Object::with_as1("x", json!({"objectType": "note", "content": "hi"}));
    assert!(!fix.shadow.send(&obj, "https://some.other.pds", &user).await.unwrap());
}

#[tokio::test]
async fn send_update_requires_matching_copy() {
    let fix = fixture();
    let user = bridged_user(&fix).await;

    // the base object's copy points into someone else's repo
    let mut base = Object::with_as1(
        "https://alice.com/post/1",
        json!({"objectType": "note", "id": "https://alice.com/post/1", "content": "v1"}),
    );
    base.add_copy(Target::new(
        "at://did:plc:other/app.bsky.feed.post/3k",
        Protocol::Atproto,
    ));
    fix.store.put_object(&base).unwrap();

    let mut update = Object::with_as1(
        "https://alice.com/post/1#update",
        json!({
            "objectType": "activity",
            "verb": "update",
            "object": {"objectType": "note", "id": "https://alice.com/post/1",
                       "content": "v2"},
        }),
    );
    update.source_protocol = Some(Protocol::Web);

    assert!(!fix.shadow.send(&update, "https://atproto.brid.gy", &user).await.unwrap());
}

#[tokio::test]
async fn send_delete_without_original_copy_is_refused() {
    let fix = fixture();
    let user = bridged_user(&fix).await;

    let delete = Object::with_as1(
        "https://alice.com/post/1#delete",
        json!({
            "objectType": "activity",
            "verb": "delete",
            "object": "https://alice.com/post/unbridged",
        }),
    );
    assert!(!fix.shadow.send(&delete, "https://atproto.brid.gy", &user).await.unwrap());
}

#[tokio::test]
async fn send_delete_of_actor_deactivates_and_removes_dns() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let did = user.get_copy(Protocol::Atproto).unwrap().to_string();

    let mut delete = Object::with_as1(
        "https://alice.com/#delete",
        json!({
            "objectType": "activity",
            "verb": "delete",
            "actor": "alice.com",
            "object": "alice.com",
        }),
    );
    delete.source_protocol = Some(Protocol::Web);

    let sent = fix.shadow.send(&delete, "https://atproto.brid.gy", &user).await.unwrap();
    assert!(sent);

    let repo = fix.storage.load_repo(&did).await.unwrap().unwrap();
    assert_eq!(repo.status, Some(RepoStatus::Deactivated));
    assert_eq!(*fix.dns.removes.lock().unwrap(), vec!["alice.com.web.brid.gy".to_string()]);
}

#[tokio::test]
async fn send_on_inactive_repo_is_refused() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let did = user.get_copy(Protocol::Atproto).unwrap().to_string();
    fix.storage.deactivate_repo(&did).await.unwrap();

    let mut obj = Object::with_as1(
        "https://alice.com/post/2",
        json!({
            "objectType": "activity",
            "verb": "post",
            "object": {"objectType": "note", "id": "https://alice.com/post/2", "content": "hi"},
        }),
    );
    obj.source_protocol = Some(Protocol::Web);
    assert!(!fix.shadow.send(&obj, "https://atproto.brid.gy", &user).await.unwrap());
}

#[tokio::test]
async fn send_undo_block_without_id_deletes_matching_blocks() {
    let fix = fixture();
    let mut user = bridged_user(&fix).await;
    let did = user.get_copy(Protocol::Atproto).unwrap().to_string();

    // the blocked user, bridged, so their id translates
    let mut bob = User::new(Protocol::Web, "bob.com");
    bob.add_copy(Target::new("did:plc:bob", Protocol::Atproto));
    fix.store.put_user(&bob).unwrap();
    user.touch();
    fix.store.put_user(&user).unwrap();

    fix.storage
        .commit(
            &did,
            vec![
                RepoWrite::create(BLOCK_COLLECTION, "a", json!({"subject": "did:plc:bob"})),
                RepoWrite::create(BLOCK_COLLECTION, "b", json!({"subject": "did:plc:carol"})),
                RepoWrite::create(BLOCK_COLLECTION, "c", json!({"subject": "did:plc:bob"})),
            ],
        )
        .await
        .unwrap();

    let mut undo = Object::with_as1(
        "https://alice.com/unblock#undo",
        json!({
            "objectType": "activity",
            "verb": "undo",
            "object": {"objectType": "block", "object": "bob.com"},
        }),
    );
    undo.source_protocol = Some(Protocol::Web);

    let sent = fix.shadow.send(&undo, "https://atproto.brid.gy", &user).await.unwrap();
    assert!(sent);

    let remaining = fix.storage.list_records(&did, BLOCK_COLLECTION).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].1["subject"], "did:plc:carol");
}

#[tokio::test]
async fn send_stop_following_deletes_prior_follow() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let did = user.get_copy(Protocol::Atproto).unwrap().to_string();

    // the original follow, bridged into the shadow repo earlier
    let rkey = "3kfollow";
    fix.storage
        .commit(
            &did,
            vec![RepoWrite::create(
                "app.bsky.graph.follow",
                rkey,
                json!({"$type": "app.bsky.graph.follow", "subject": "did:plc:bob"}),
            )],
        )
        .await
        .unwrap();

    let mut follow_obj = Object::with_as1(
        "https://alice.com/follow/1",
        json!({
            "objectType": "activity",
            "verb": "follow",
            "actor": "https://alice.com/",
            "object": "did:plc:bob",
        }),
    );
    follow_obj.source_protocol = Some(Protocol::Web);
    follow_obj.add_copy(Target::new(
        at_uri(&did, "app.bsky.graph.follow", rkey),
        Protocol::Atproto,
    ));
    fix.store.put_object(&follow_obj).unwrap();

    let follower = Follower::new(
        user.key(),
        ids::key_for("did:plc:bob").unwrap(),
        Some("https://alice.com/follow/1".into()),
    );
    fix.store.put_follower(&follower).unwrap();

    let stop = Object::with_as1(
        "https://alice.com/follow/1#stop",
        json!({
            "objectType": "activity",
            "verb": "stop-following",
            "actor": "https://alice.com/",
            "object": "did:plc:bob",
        }),
    );

    let sent = fix.shadow.send(&stop, "https://atproto.brid.gy", &user).await.unwrap();
    assert!(sent);
    assert!(fix
        .storage
        .get_record(&did, "app.bsky.graph.follow", rkey)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn send_stop_following_without_follower_is_refused() {
    let fix = fixture();
    let user = bridged_user(&fix).await;

    let stop = Object::with_as1(
        "https://alice.com/follow/9#stop",
        json!({
            "objectType": "activity",
            "verb": "stop-following",
            "object": "did:plc:stranger",
        }),
    );
    assert!(!fix.shadow.send(&stop, "https://atproto.brid.gy", &user).await.unwrap());
}

#[tokio::test]
async fn send_flag_creates_report_without_commit() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let before = commit_tasks(&fix.queue);

    let flag = Object::with_as1(
        "https://alice.com/flag/1",
        json!({"objectType": "activity", "verb": "flag",
               "object": "at://did:plc:bad/app.bsky.feed.post/1"}),
    );

    let sent = fix.shadow.send(&flag, "https://atproto.brid.gy", &user).await.unwrap();
    assert!(sent);
    assert_eq!(fix.moderation.reports.lock().unwrap().len(), 1);
    assert_eq!(commit_tasks(&fix.queue), before);
}

#[tokio::test]
async fn send_dm_goes_through_chat_service() {
    let fix = fixture();
    let user = bridged_user(&fix).await;
    let before = commit_tasks(&fix.queue);

    let mut dm = Object::with_as1(
        "https://alice.com/dm/1",
        json!({
            "objectType": "activity",
            "verb": "post",
            "to": ["did:plc:bob"],
            "object": {"objectType": "note", "id": "https://alice.com/dm/1",
                       "content": "psst"},
        }),
    );
    dm.source_protocol = Some(Protocol::Web);

    let sent = fix.shadow.send(&dm, "https://atproto.brid.gy", &user).await.unwrap();
    assert!(sent);

    let chats = fix.chat.sent.lock().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].0, "did:plc:bob");
    assert_eq!(commit_tasks(&fix.queue), before);
}

#[test]
fn derived_writes_monetization() {
    let actor = json!({
        "objectType": "person",
        "id": "https://alice.com/",
        "monetization": "https://wallet.example/alice",
    });
    let writes = derived_writes(Some(&actor));
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].collection, MONETIZATION_COLLECTION);
    assert_eq!(writes[0].rkey, "self");
    assert_eq!(
        writes[0].record.as_ref().unwrap()["address"],
        "https://wallet.example/alice"
    );

    // non-actors and actors without wallets add nothing
    assert!(derived_writes(Some(&json!({"objectType": "note"}))).is_empty());
    assert!(derived_writes(Some(&json!({"objectType": "person"}))).is_empty());
    assert!(derived_writes(None).is_empty());
}
