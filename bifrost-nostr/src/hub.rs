//! The relay hub: one long-lived subscriber task per relay, with filters
//! rebuilt as the bridged user sets grow.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use bifrost_core::blocklist::Domains;
use bifrost_core::models::Relay;
use bifrost_core::protocol::Protocol;
use bifrost_core::report;
use bifrost_core::store::Datastore;
use bifrost_core::tasks::{Dispatcher, ReceiveTask, DELETE_TASK_DELAY};
use bifrost_core::userset::{RelevantSets, SetsReceiver};

use crate::client::HTTP_TIMEOUT;
use crate::error::{NostrError, Result};
use crate::event::{Event, AUTHOR_FILTER_KINDS, KIND_DELETE, SUPPORTED_KINDS};
use crate::nip19;

pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

fn subscription_id() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Builds the REQ message: one filter for events mentioning bridged users,
/// one for events authored by native bridged users.
pub fn build_req(sub_id: &str, sets: &RelevantSets, since: Option<u64>) -> Value {
    let mut mentions: Vec<&String> = sets.bridged_pubkeys.iter().collect();
    mentions.sort();
    let mut authors: Vec<&String> = sets.nostr_pubkeys.iter().collect();
    authors.sort();

    let mut mention_filter = json!({"#p": mentions, "kinds": SUPPORTED_KINDS});
    let mut author_filter = json!({"authors": authors, "kinds": AUTHOR_FILTER_KINDS});
    if let Some(since) = since {
        mention_filter["since"] = json!(since);
        author_filter["since"] = json!(since);
    }
    json!(["REQ", sub_id, mention_filter, author_filter])
}

/// Validates one incoming event and enqueues a receive task when it's
/// relevant. Returns whether a task was enqueued.
pub async fn handle_event(
    dispatcher: &Dispatcher,
    raw: &Value,
    sets: &RelevantSets,
) -> Result<bool> {
    let Ok(event) = Event::from_value(raw) else {
        tracing::info!(event = %raw, "ignoring malformed event");
        return Ok(false);
    };
    if event.id.is_empty() || event.pubkey.is_empty() || event.sig.is_empty() {
        tracing::info!(event = %raw, "ignoring bad event");
        return Ok(false);
    }
    if !SUPPORTED_KINDS.contains(&event.kind) {
        return Ok(false);
    }

    let mentions: HashSet<&str> = event.p_tags().into_iter().collect();
    let from_native = sets.nostr_pubkeys.contains(&event.pubkey);
    let mentions_bridged =
        sets.bridged_pubkeys.iter().any(|pubkey| mentions.contains(pubkey.as_str()));
    // events from bridged shadows are our own writes; don't loop them back
    if sets.bridged_pubkeys.contains(&event.pubkey) {
        return Ok(false);
    }
    if !from_native && !mentions_bridged {
        return Ok(false);
    }

    if !event.verify() {
        tracing::debug!(id = event.id, "bad id or sig");
        return Ok(false);
    }

    let obj_id = nip19::uri_for(&event)?;
    let authed_as = nip19::npub_uri(&event.pubkey)?;
    let delay = (event.kind == KIND_DELETE).then_some(DELETE_TASK_DELAY);

    let task = ReceiveTask {
        id: obj_id,
        source_protocol: Protocol::Nostr,
        bsky: None,
        nostr: Some(raw.clone()),
        our_as1: None,
        authed_as: authed_as.clone(),
        received_at: None,
    };
    dispatcher
        .create_task("receive", serde_json::to_value(&task)?, delay, Some(&authed_as))
        .await;
    Ok(true)
}

pub struct NostrHub {
    store: Datastore,
    dispatcher: Arc<Dispatcher>,
    sets: SetsReceiver,
    domains: Domains,
    shutdown: watch::Receiver<bool>,
    subscribed_relays: Mutex<HashSet<String>>,
}

impl NostrHub {
    pub fn new(
        store: Datastore,
        dispatcher: Arc<Dispatcher>,
        sets: SetsReceiver,
        domains: Domains,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(NostrHub {
            store,
            dispatcher,
            sets,
            domains,
            shutdown,
            subscribed_relays: Mutex::new(HashSet::new()),
        })
    }

    /// Spawns a subscriber for a newly discovered relay, unless it's
    /// blocklisted or already subscribed.
    pub fn add_relay(self: &Arc<Self>, url: &str) {
        if self.domains.is_blocklisted(url) {
            tracing::warn!(url, "not subscribing to blocklisted relay");
            return;
        }
        let mut subscribed = self.subscribed_relays.lock().unwrap();
        if subscribed.insert(url.to_string()) {
            tracing::info!(url, "subscribing to relay");
            let hub = self.clone();
            let url = url.to_string();
            tokio::spawn(async move { hub.subscriber(url).await });
        }
    }

    pub fn subscribed_relays(&self) -> Vec<String> {
        self.subscribed_relays.lock().unwrap().iter().cloned().collect()
    }

    /// Reconnect wrapper around one relay's subscription.
    async fn subscriber(self: Arc<Self>, relay_url: String) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.subscribe(&relay_url, &mut shutdown).await {
                Ok(()) => return,
                Err(err) if err.is_connection() => {
                    tracing::warn!(relay_url, error = %err, "relay disconnected");
                }
                Err(err) => report::exception("nostr subscriber", &err),
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn subscribe(
        &self,
        relay_url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut relay =
            self.store.get_relay(relay_url)?.unwrap_or_else(|| Relay::new(relay_url));

        let (ws, _) = tokio::time::timeout(HTTP_TIMEOUT, connect_async(relay_url))
            .await
            .map_err(|_| NostrError::Relay(format!("connect to {relay_url} timed out")))??;
        let (mut write, mut read) = ws.split();

        loop {
            // snapshot the sets this REQ covers; growth triggers a re-REQ
            let sets = { self.sets.borrow().clone() };
            let native_count = sets.nostr_pubkeys.len();
            let bridged_count = sets.bridged_pubkeys.len();

            let sub_id = subscription_id();
            let req = build_req(&sub_id, &sets, relay.since);
            tracing::debug!(relay_url, req = %req, "sending REQ");
            write.send(Message::Text(req.to_string())).await?;

            loop {
                if *shutdown.borrow() {
                    return Ok(());
                }
                let needs_requery = {
                    let current = self.sets.borrow();
                    current.nostr_pubkeys.len() != native_count
                        || current.bridged_pubkeys.len() != bridged_count
                };
                if needs_requery {
                    tracing::info!(relay_url, "re-querying to pick up new users");
                    write.send(Message::Text(json!(["CLOSE", sub_id]).to_string())).await?;
                    break;
                }

                let msg = match tokio::time::timeout(HTTP_TIMEOUT, read.next()).await {
                    // timed out; loop to check for new users and shutdown
                    Err(_) => continue,
                    Ok(None) => return Err(NostrError::Relay("stream ended".into())),
                    Ok(Some(Err(err))) => return Err(err.into()),
                    Ok(Some(Ok(msg))) => msg,
                };
                let Message::Text(text) = msg else {
                    continue;
                };
                tracing::debug!(relay_url, msg = %text, "relay message");
                let Ok(resp) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };

                match resp.get(0).and_then(Value::as_str) {
                    Some("EVENT") => {
                        if let Some(raw) = resp.get(2) {
                            match handle_event(&self.dispatcher, raw, &sets).await {
                                Ok(_) => {
                                    if let Some(created_at) =
                                        raw.get("created_at").and_then(Value::as_u64)
                                    {
                                        relay.since = Some(created_at);
                                        relay.updated = chrono::Utc::now();
                                        self.store.put_relay(&relay)?;
                                    }
                                }
                                Err(err) => report::exception("nostr event", &err),
                            }
                        }
                    }
                    Some("CLOSED") => {
                        tracing::info!(relay_url, "relay closed our subscription");
                        break;
                    }
                    Some("EOSE") => {
                        tracing::debug!(relay_url, "caught up; now live");
                    }
                    Some("OK") | Some("NOTICE") => {}
                    _ => {}
                }
            }
        }
    }
}
