//! Firehose ingestion: one persistent websocket to the sync relay, decoding
//! `subscribeRepos` frames, filtering for relevance against the live user
//! sets, and fanning out to the receive queue.

pub mod frames;

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use ipld_core::ipld::Ipld;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use bifrost_core::models::Cursor;
use bifrost_core::protocol::Protocol;
use bifrost_core::report;
use bifrost_core::store::Datastore;
use bifrost_core::tasks::{Dispatcher, ReceiveTask, DELETE_TASK_DELAY};
use bifrost_core::userset::{RelevantSets, SetsReceiver};

use crate::error::{AtprotoError, Result};
use crate::identity::{AtprotoIdentity, LoadOpts};
use frames::Frame;

pub const SUBSCRIBE_REPOS_NSID: &str = "com.atproto.sync.subscribeRepos";

/// Flush the cursor entity at most this often.
pub const STORE_CURSOR_FREQ: ChronoDuration = ChronoDuration::seconds(10);
/// Wait between reconnect attempts.
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
/// Cap on every websocket read, so the loop can notice shutdown and set
/// growth.
pub const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
/// Bound on the in-process commit queue.
pub const COMMITS_QUEUE_SIZE: usize = 1000;

/// Record collections we handle, by their mapped activity type.
const SUPPORTED_COLLECTIONS: &[&str] = &[
    "app.bsky.actor.profile",
    "app.bsky.feed.like",
    "app.bsky.feed.post",
    "app.bsky.feed.repost",
    "app.bsky.graph.follow",
    "app.bsky.graph.block",
    "chat.bsky.actor.declaration",
    "community.lexicon.payments.webMonetization",
];

#[derive(Debug, Deserialize)]
pub struct CommitMessage {
    pub seq: i64,
    pub repo: String,
    #[serde(default)]
    pub blocks: serde_bytes::ByteBuf,
    #[serde(default)]
    pub ops: Vec<CommitOp>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default, rename = "tooBig")]
    pub too_big: bool,
}

#[derive(Debug, Deserialize)]
pub struct CommitOp {
    pub action: String,
    pub path: String,
    #[serde(default)]
    pub cid: Option<ipld_core::cid::Cid>,
}

#[derive(Debug, Deserialize)]
struct RepoLifecycleMessage {
    seq: i64,
    did: String,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    status: Option<String>,
}

/// One repo operation pulled out of a commit frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub repo: String,
    pub action: String,
    pub path: String,
    pub seq: i64,
    pub record: Option<Value>,
    pub time: Option<String>,
}

/// What the subscriber hands to the commit-handler worker.
#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseEvent {
    Commit(Op),
    /// `#identity`, `#handle` and `#account` frames, for out-of-band DID doc
    /// refresh.
    Lifecycle { did: String, seq: i64, active: Option<bool>, status: Option<String> },
}

/// Converts decoded DAG-CBOR into plain JSON: links become their canonical
/// string form, bytes become base64.
pub fn ipld_to_json(ipld: Ipld) -> Value {
    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => Value::from(i as i64),
        Ipld::Float(f) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Ipld::String(s) => Value::String(s),
        Ipld::Bytes(b) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Ipld::List(items) => Value::Array(items.into_iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, ipld_to_json(v))).collect())
        }
        Ipld::Link(cid) => Value::String(cid.to_string()),
    }
}

/// Decodes a commit frame's CAR blocks and joins them to the ops list.
pub async fn decode_commit(msg: &CommitMessage) -> Result<Vec<Op>> {
    if msg.too_big {
        tracing::debug!(seq = msg.seq, repo = msg.repo, "skipping too-big commit");
        return Ok(Vec::new());
    }

    let mut cursor = futures::io::Cursor::new(msg.blocks.as_ref());
    let blocks = rs_car::car_read_all(&mut cursor, true).await?.0;
    let by_cid: BTreeMap<String, Vec<u8>> =
        blocks.into_iter().map(|(cid, data)| (cid.to_string(), data)).collect();

    let mut ops = Vec::with_capacity(msg.ops.len());
    for op in &msg.ops {
        let record = match op.cid.as_ref().and_then(|cid| by_cid.get(&cid.to_string())) {
            Some(data) => {
                let ipld: Ipld = serde_ipld_dagcbor::from_slice(data)?;
                Some(ipld_to_json(ipld))
            }
            None => None,
        };
        ops.push(Op {
            repo: msg.repo.clone(),
            action: op.action.clone(),
            path: op.path.clone(),
            seq: msg.seq,
            record,
            time: msg.time.clone(),
        });
    }
    Ok(ops)
}

fn collection_of(path: &str) -> &str {
    path.split('/').next().unwrap_or_default()
}

fn did_of_ref(uri: &str) -> Option<&str> {
    if uri.starts_with("did:") {
        Some(uri)
    } else {
        uri.strip_prefix("at://").map(|rest| rest.split('/').next().unwrap_or_default())
    }
}

/// Whether a record references any of the given DIDs, through its subject,
/// reply parents, quoted record, or facet mentions.
pub fn record_references(record: &Value, dids: &std::collections::HashSet<String>) -> bool {
    let mut refs: Vec<&str> = Vec::new();

    match record.get("subject") {
        Some(Value::String(s)) => refs.push(s),
        Some(Value::Object(map)) => {
            if let Some(uri) = map.get("uri").and_then(Value::as_str) {
                refs.push(uri);
            }
            if let Some(did) = map.get("did").and_then(Value::as_str) {
                refs.push(did);
            }
        }
        _ => {}
    }

    for pointer in ["/reply/parent/uri", "/reply/root/uri", "/embed/record/uri", "/embed/record/record/uri"] {
        if let Some(uri) = record.pointer(pointer).and_then(Value::as_str) {
            refs.push(uri);
        }
    }

    if let Some(facets) = record.get("facets").and_then(Value::as_array) {
        for facet in facets {
            if let Some(features) = facet.get("features").and_then(Value::as_array) {
                for feature in features {
                    if let Some(did) = feature.get("did").and_then(Value::as_str) {
                        refs.push(did);
                    }
                }
            }
        }
    }

    refs.iter().any(|r| did_of_ref(r).is_some_and(|did| dids.contains(did)))
}

/// The two-sided relevance test, with loopback suppression: records the
/// bridge itself wrote are never relevant.
pub fn is_relevant(op: &Op, sets: &RelevantSets) -> bool {
    if !SUPPORTED_COLLECTIONS.contains(&collection_of(&op.path)) {
        return false;
    }
    if sets.bridged_dids.contains(&op.repo) {
        return false;
    }
    if sets.atproto_dids.contains(&op.repo) {
        return true;
    }
    if op.action == "delete" {
        return false;
    }
    op.record.as_ref().is_some_and(|record| record_references(record, &sets.bridged_dids))
}

/// Throttles cursor writes to one per [`STORE_CURSOR_FREQ`]. The flushed
/// value is one past the highest sequence seen, so a restart resumes without
/// replaying the acknowledged frame.
pub struct CursorTracker {
    cursor: Cursor,
    last_seq: i64,
    last_flush: DateTime<Utc>,
}

impl CursorTracker {
    pub fn new(cursor: Cursor) -> Self {
        CursorTracker { last_seq: cursor.cursor, last_flush: cursor.updated, cursor }
    }

    /// Records `seq`; returns a Cursor to persist when the flush window has
    /// elapsed.
    pub fn advance(&mut self, seq: i64, now: DateTime<Utc>) -> Option<Cursor> {
        if seq > self.last_seq {
            self.last_seq = seq;
        }
        if now - self.last_flush >= STORE_CURSOR_FREQ {
            self.flush_at(now)
        } else {
            None
        }
    }

    fn flush_at(&mut self, now: DateTime<Utc>) -> Option<Cursor> {
        let next = self.last_seq + 1;
        if next <= self.cursor.cursor {
            return None;
        }
        self.cursor.cursor = next;
        self.cursor.updated = now;
        self.last_flush = now;
        Some(self.cursor.clone())
    }

    /// Unconditional flush, for shutdown.
    pub fn flush(&mut self) -> Option<Cursor> {
        self.flush_at(Utc::now())
    }
}

/// The firehose subscriber: owns the websocket, pushes relevant events onto
/// the bounded commit queue.
pub struct FirehoseSubscriber {
    host: String,
    store: Datastore,
    sets: SetsReceiver,
    events_tx: mpsc::Sender<FirehoseEvent>,
}

impl FirehoseSubscriber {
    pub fn new(
        host: impl Into<String>,
        store: Datastore,
        sets: SetsReceiver,
    ) -> (Self, mpsc::Receiver<FirehoseEvent>) {
        let (events_tx, events_rx) = mpsc::channel(COMMITS_QUEUE_SIZE);
        (FirehoseSubscriber { host: host.into(), store, sets, events_tx }, events_rx)
    }

    /// Reconnect loop. Connection errors and relay kicks (`ConsumerTooSlow`)
    /// wait out [`RECONNECT_DELAY`] and resubscribe from the stored cursor;
    /// anything else is reported and also retried, since losing ingestion is
    /// worse than reprocessing a frame.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.subscribe(&mut shutdown).await {
                Ok(()) => return,
                Err(err) if err.is_connection() => {
                    tracing::warn!(host = self.host, error = %err, "firehose disconnected");
                }
                Err(err) => report::exception("firehose subscriber", &err),
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    fn subscribe_url(&self, cursor: &Cursor) -> String {
        let base = if self.host.contains("://") {
            format!("{}/xrpc/{SUBSCRIBE_REPOS_NSID}", self.host)
        } else {
            format!("wss://{}/xrpc/{SUBSCRIBE_REPOS_NSID}", self.host)
        };
        if cursor.cursor > 0 {
            format!("{base}?cursor={}", cursor.cursor + 1)
        } else {
            base
        }
    }

    async fn subscribe(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let cursor = self
            .store
            .get_cursor(&self.host, SUBSCRIBE_REPOS_NSID)?
            .unwrap_or_else(|| Cursor::new(&self.host, SUBSCRIBE_REPOS_NSID));
        let url = self.subscribe_url(&cursor);
        tracing::info!(url, "subscribing to firehose");

        let (ws, _) = connect_async(&url).await?;
        let (_, mut read) = ws.split();
        let mut tracker = CursorTracker::new(cursor);

        loop {
            if *shutdown.borrow() {
                if let Some(cursor) = tracker.flush() {
                    self.store.put_cursor(&cursor)?;
                }
                return Ok(());
            }

            let msg = match tokio::time::timeout(HTTP_TIMEOUT, read.next()).await {
                Err(_) => continue, // timed out; loop to re-check shutdown
                Ok(None) => return Err(AtprotoError::Stream("stream ended".into())),
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(msg))) => msg,
            };
            let data = match msg {
                Message::Binary(data) => data,
                Message::Close(_) => return Err(AtprotoError::Stream("server closed".into())),
                _ => continue,
            };

            let frame = match Frame::try_from(&data[..]) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::info!(error = %err, "dropping undecodable frame");
                    continue;
                }
            };
            match frame {
                Frame::Error(body) => {
                    tracing::warn!(error = body.error, message = body.message, "error frame");
                    return Err(AtprotoError::Stream(body.error));
                }
                Frame::Message(t, payload) => {
                    let sets = { self.sets.borrow().clone() };
                    match self.process_message(t.as_deref(), &payload, &sets).await {
                        Ok(Some(seq)) => {
                            if let Some(cursor) = tracker.advance(seq, Utc::now()) {
                                self.store.put_cursor(&cursor)?;
                            }
                        }
                        Ok(None) => {}
                        // one poisoned frame must not halt ingestion
                        Err(err) => report::exception("firehose frame", &err),
                    }
                }
            }
        }
    }

    async fn process_message(
        &self,
        t: Option<&str>,
        payload: &[u8],
        sets: &RelevantSets,
    ) -> Result<Option<i64>> {
        match t {
            Some("#commit") => {
                let msg: CommitMessage = serde_ipld_dagcbor::from_slice(payload)?;
                let seq = msg.seq;
                for op in decode_commit(&msg).await? {
                    if is_relevant(&op, sets) {
                        if self.events_tx.send(FirehoseEvent::Commit(op)).await.is_err() {
                            return Err(AtprotoError::Stream("commit queue closed".into()));
                        }
                    }
                }
                Ok(Some(seq))
            }
            Some("#identity") | Some("#account") | Some("#handle") => {
                let msg: RepoLifecycleMessage = serde_ipld_dagcbor::from_slice(payload)?;
                let known = sets.atproto_dids.contains(&msg.did)
                    || sets.bridged_dids.contains(&msg.did);
                if known {
                    let event = FirehoseEvent::Lifecycle {
                        did: msg.did,
                        seq: msg.seq,
                        active: msg.active,
                        status: msg.status,
                    };
                    if self.events_tx.send(event).await.is_err() {
                        return Err(AtprotoError::Stream("commit queue closed".into()));
                    }
                }
                Ok(Some(msg.seq))
            }
            Some("#info") => {
                let info: Value = serde_ipld_dagcbor::from_slice(payload).unwrap_or(Value::Null);
                tracing::info!(info = %info, "firehose info");
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

/// The commit-handler worker: pops ops off the queue and enqueues durable
/// receive tasks, synthesizing activities for deletes.
pub struct FirehoseHandler {
    store: Datastore,
    dispatcher: Arc<Dispatcher>,
    identity: Arc<AtprotoIdentity>,
}

impl FirehoseHandler {
    pub fn new(store: Datastore, dispatcher: Arc<Dispatcher>, identity: Arc<AtprotoIdentity>) -> Self {
        FirehoseHandler { store, dispatcher, identity }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<FirehoseEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.handle_event(event).await {
                report::exception("firehose handler", &err);
            }
        }
    }

    pub async fn handle_event(&self, event: FirehoseEvent) -> Result<()> {
        match event {
            FirehoseEvent::Commit(op) if op.action == "delete" => {
                let (id, activity) = self.synthesize_delete(&op)?;
                let task = ReceiveTask {
                    id,
                    source_protocol: Protocol::Atproto,
                    bsky: None,
                    nostr: None,
                    our_as1: Some(activity),
                    authed_as: op.repo.clone(),
                    received_at: op.time.clone(),
                };
                self.dispatcher
                    .create_task(
                        "receive",
                        serde_json::to_value(&task)?,
                        Some(DELETE_TASK_DELAY),
                        Some(&op.repo),
                    )
                    .await;
                Ok(())
            }
            FirehoseEvent::Commit(op) => {
                let id = format!("at://{}/{}", op.repo, op.path);
                let task = ReceiveTask {
                    id,
                    source_protocol: Protocol::Atproto,
                    bsky: op.record.clone(),
                    nostr: None,
                    our_as1: None,
                    authed_as: op.repo.clone(),
                    received_at: op.time.clone(),
                };
                self.dispatcher
                    .create_task("receive", serde_json::to_value(&task)?, None, Some(&op.repo))
                    .await;
                Ok(())
            }
            FirehoseEvent::Lifecycle { did, active, status, .. } => {
                tracing::info!(did, ?active, ?status, "repo lifecycle event; refreshing DID doc");
                let opts = LoadOpts { did_doc: true, remote: Some(true), local: true };
                if let Some(obj) = self.identity.load(&did, opts).await? {
                    if let Some(mut user) = self.store.get_user(Protocol::Atproto, &did)? {
                        if let Some(raw) = &obj.raw {
                            user.handle = crate::plc::DidDocument::from_value(raw)?
                                .handle()
                                .map(str::to_string);
                            user.touch();
                            self.store.put_user(&user)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Deletes arrive as bare commit ops; rebuild the activity they imply.
    /// Block deletes become `undo`s, follow deletes with a known follow
    /// record become `stop-following`, everything else a plain `delete`.
    fn synthesize_delete(&self, op: &Op) -> Result<(String, Value)> {
        let at = format!("at://{}/{}", op.repo, op.path);
        let collection = collection_of(&op.path);

        let (verb, object) = if collection == "app.bsky.graph.block" {
            ("undo", Value::String(at.clone()))
        } else if collection == "app.bsky.graph.follow" {
            match self.store.get_object(&at)? {
                Some(obj) => {
                    let followee = obj
                        .bsky
                        .as_ref()
                        .and_then(|b| b.get("subject"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    match followee {
                        Some(followee) => ("stop-following", Value::String(followee)),
                        None => ("delete", Value::String(at.clone())),
                    }
                }
                None => ("delete", Value::String(at.clone())),
            }
        } else {
            ("delete", Value::String(at.clone()))
        };

        let id = format!("{at}#{verb}");
        let activity = json!({
            "objectType": "activity",
            "verb": verb,
            "id": id,
            "actor": op.repo,
            "object": object,
        });
        Ok((id, activity))
    }
}
