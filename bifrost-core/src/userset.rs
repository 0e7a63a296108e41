//! The relevant-set loader: the single writer for the membership sets the
//! firehose subscribers consult on every event. Publishes immutable snapshots
//! over a watch channel; subscribers hold the current `Arc` and never block
//! the loader.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::Result;
use crate::models::User;
use crate::protocol::Protocol;
use crate::report;
use crate::store::Datastore;

/// How often the loader re-queries the datastore.
pub const LOAD_USERS_FREQ: std::time::Duration = std::time::Duration::from_secs(10);

/// The membership sets that decide event relevance.
#[derive(Debug, Default, Clone)]
pub struct RelevantSets {
    /// Native ATProto users we bridge out.
    pub atproto_dids: HashSet<String>,
    /// Shadow-repo DIDs of users bridged into ATProto.
    pub bridged_dids: HashSet<String>,
    /// Hex pubkeys of native Nostr users we bridge out.
    pub nostr_pubkeys: HashSet<String>,
    /// Hex pubkeys of users bridged into Nostr.
    pub bridged_pubkeys: HashSet<String>,
}

pub type SetsReceiver = watch::Receiver<Arc<RelevantSets>>;

/// Periodically folds updated users into the sets and publishes a fresh
/// snapshot. Sets only grow; an unbridged user drops out on restart.
pub struct UserSetLoader {
    store: Datastore,
    sets: RelevantSets,
    loaded_at: DateTime<Utc>,
    tx: watch::Sender<Arc<RelevantSets>>,
}

impl UserSetLoader {
    pub fn new(store: Datastore) -> (Self, SetsReceiver) {
        let (tx, rx) = watch::channel(Arc::new(RelevantSets::default()));
        let loader = UserSetLoader {
            store,
            sets: RelevantSets::default(),
            loaded_at: DateTime::<Utc>::MIN_UTC,
            tx,
        };
        (loader, rx)
    }

    /// One load pass. Returns relay URLs newly advertised by native Nostr
    /// users, for the relay hub to subscribe to.
    pub fn load(&mut self) -> Result<Vec<String>> {
        let started_at = Utc::now();
        let users = self.store.users_updated_since(self.loaded_at)?;

        let mut new_relays = Vec::new();
        let mut added = 0usize;
        for user in &users {
            if user.status.is_some() {
                continue;
            }
            match user.protocol {
                Protocol::Atproto => {
                    if !user.enabled_protocols.is_empty() {
                        self.sets.atproto_dids.insert(user.id.clone());
                        added += 1;
                    }
                }
                Protocol::Nostr => {
                    if !user.enabled_protocols.is_empty() {
                        if let Some(pubkey) = &user.nostr_pubkey {
                            self.sets.nostr_pubkeys.insert(pubkey.clone());
                            added += 1;
                        }
                        new_relays.extend(self.user_relays(user)?);
                    }
                }
                Protocol::ActivityPub | Protocol::Web => {
                    if let Some(did) = user.get_copy(Protocol::Atproto) {
                        self.sets.bridged_dids.insert(did.to_string());
                        added += 1;
                    }
                    if user.is_enabled(Protocol::Nostr) {
                        match user.hex_pubkey() {
                            Ok(pubkey) => {
                                self.sets.bridged_pubkeys.insert(pubkey);
                                added += 1;
                            }
                            Err(_) => {} // no Nostr key minted yet
                        }
                    }
                }
            }
        }

        // advance only after the sets are populated, so a crash mid-pass
        // re-queries from the earlier timestamp
        self.loaded_at = started_at;
        self.tx.send_replace(Arc::new(self.sets.clone()));
        tracing::info!(
            atproto = self.sets.atproto_dids.len(),
            bridged_dids = self.sets.bridged_dids.len(),
            nostr = self.sets.nostr_pubkeys.len(),
            bridged_pubkeys = self.sets.bridged_pubkeys.len(),
            added,
            "loaded relevant sets"
        );
        Ok(new_relays)
    }

    /// Write relays from the user's stored NIP-65 relay-list event.
    fn user_relays(&self, user: &User) -> Result<Vec<String>> {
        let Some(relays_key) = &user.relays_key else {
            return Ok(Vec::new());
        };
        let Some(obj) = self.store.get_object(relays_key)? else {
            return Ok(Vec::new());
        };
        Ok(obj.nostr.as_ref().map(write_relays).unwrap_or_default())
    }

    /// Runs the load loop until shutdown, forwarding discovered relays.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        relay_tx: tokio::sync::mpsc::UnboundedSender<String>,
    ) {
        let mut ticker = tokio::time::interval(LOAD_USERS_FREQ);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.load() {
                        Ok(relays) => {
                            for relay in relays {
                                let _ = relay_tx.send(relay);
                            }
                        }
                        Err(err) => report::exception("user set loader", &err),
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("user set loader stopping");
                    return;
                }
            }
        }
    }
}

/// Relay URLs a kind 10002 event declares as writable.
pub fn write_relays(event: &Value) -> Vec<String> {
    let Some(tags) = event.get("tags").and_then(Value::as_array) else {
        return Vec::new();
    };
    tags.iter()
        .filter_map(|tag| {
            let tag = tag.as_array()?;
            if tag.first()?.as_str()? != "r" {
                return None;
            }
            let url = tag.get(1)?.as_str()?;
            match tag.get(2).and_then(Value::as_str) {
                None | Some("write") => Some(url.to_string()),
                Some(_) => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Object, Target, UserStatus};
    use serde_json::json;

    fn nostr_user(id: &str, pubkey: &str) -> User {
        let mut user = User::new(Protocol::Nostr, id);
        user.enabled_protocols = vec![Protocol::Web];
        user.nostr_pubkey = Some(pubkey.into());
        user
    }

    #[test]
    fn loads_all_four_sets() {
        let store = Datastore::temporary().unwrap();

        let mut atproto = User::new(Protocol::Atproto, "did:plc:alice");
        atproto.enabled_protocols = vec![Protocol::Web];
        store.put_user(&atproto).unwrap();

        store.put_user(&nostr_user("nostr:npub1bob", "b0b")).unwrap();

        let mut web = User::new(Protocol::Web, "carol.com");
        web.enabled_protocols = vec![Protocol::Nostr];
        web.add_copy(Target::new("did:plc:carol", Protocol::Atproto));
        let signing = k256::schnorr::SigningKey::random(&mut rand::thread_rng());
        let pubkey = hex::encode(signing.verifying_key().to_bytes());
        web.nostr_privkey = Some(signing.to_bytes().to_vec());
        store.put_user(&web).unwrap();

        let (mut loader, rx) = UserSetLoader::new(store);
        loader.load().unwrap();

        let sets = rx.borrow();
        assert!(sets.atproto_dids.contains("did:plc:alice"));
        assert!(sets.nostr_pubkeys.contains("b0b"));
        assert!(sets.bridged_dids.contains("did:plc:carol"));
        assert!(sets.bridged_pubkeys.contains(&pubkey));
    }

    #[test]
    fn skips_users_with_status() {
        let store = Datastore::temporary().unwrap();
        let mut user = nostr_user("nostr:npub1eve", "e4e");
        user.status = Some(UserStatus::Blocked);
        store.put_user(&user).unwrap();

        let (mut loader, rx) = UserSetLoader::new(store);
        loader.load().unwrap();
        assert!(rx.borrow().nostr_pubkeys.is_empty());
    }

    #[test]
    fn second_load_only_reads_updated_users() {
        let store = Datastore::temporary().unwrap();
        store.put_user(&nostr_user("nostr:npub1bob", "b0b")).unwrap();

        let (mut loader, rx) = UserSetLoader::new(store.clone());
        loader.load().unwrap();
        assert_eq!(rx.borrow().nostr_pubkeys.len(), 1);

        // a user created after the pass shows up on the next one
        let mut frank = nostr_user("nostr:npub1frank", "f4a4");
        frank.touch();
        store.put_user(&frank).unwrap();
        loader.load().unwrap();
        assert_eq!(rx.borrow().nostr_pubkeys.len(), 2);
    }

    #[test]
    fn discovers_write_relays() {
        let store = Datastore::temporary().unwrap();
        let mut relays_obj = Object::new("nostr:nevent1relays");
        relays_obj.nostr = Some(json!({
            "kind": 10002,
            "tags": [
                ["r", "wss://relay.example"],
                ["r", "wss://write.example", "write"],
                ["r", "wss://read.example", "read"],
            ],
        }));
        store.put_object(&relays_obj).unwrap();

        let mut user = nostr_user("nostr:npub1bob", "b0b");
        user.relays_key = Some("nostr:nevent1relays".into());
        store.put_user(&user).unwrap();

        let (mut loader, _rx) = UserSetLoader::new(store);
        let relays = loader.load().unwrap();
        assert_eq!(relays, vec!["wss://relay.example", "wss://write.example"]);
    }
}
