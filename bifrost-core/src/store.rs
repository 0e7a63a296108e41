//! sled-backed datastore: one tree per entity kind plus secondary-index
//! trees for the equality queries the engine runs on hot paths.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use crate::error::{CoreError, Result};
use crate::ids::handle_as_domain;
use crate::models::{
    cursor_key, follower_key, user_key, Cursor, Follower, Object, Relay, RemoteBlob, User,
};
use crate::protocol::Protocol;

/// All persistent bridge state. Cloning is cheap; trees are shared handles.
#[derive(Clone)]
pub struct Datastore {
    db: sled::Db,
    users: sled::Tree,
    objects: sled::Tree,
    followers: sled::Tree,
    cursors: sled::Tree,
    relays: sled::Tree,
    blobs: sled::Tree,
    /// `{proto}\0{handle}` → user id
    user_handles: sled::Tree,
    /// `{proto}\0{handle as domain}` → user id
    user_domains: sled::Tree,
    /// copy uri → object id
    object_copies: sled::Tree,
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn index_key(protocol: Protocol, value: &str) -> Vec<u8> {
    let mut key = protocol.label().as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(value.as_bytes());
    key
}

impl Datastore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Datastore {
            users: db.open_tree("users")?,
            objects: db.open_tree("objects")?,
            followers: db.open_tree("followers")?,
            cursors: db.open_tree("cursors")?,
            relays: db.open_tree("relays")?,
            blobs: db.open_tree("blobs")?,
            user_handles: db.open_tree("user_handles")?,
            user_domains: db.open_tree("user_domains")?,
            object_copies: db.open_tree("object_copies")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // Users

    pub fn put_user(&self, user: &User) -> Result<()> {
        let key = user.key();
        if let Some(old) = self.get_user(user.protocol, &user.id)? {
            if old.handle != user.handle {
                if let Some(handle) = &old.handle {
                    self.user_handles.remove(index_key(user.protocol, handle))?;
                    self.user_domains.remove(index_key(user.protocol, &handle_as_domain(handle)))?;
                }
            }
        }
        self.users.insert(key.as_bytes(), to_bytes(user)?)?;
        if let Some(handle) = &user.handle {
            self.user_handles.insert(index_key(user.protocol, handle), user.id.as_bytes())?;
            self.user_domains
                .insert(index_key(user.protocol, &handle_as_domain(handle)), user.id.as_bytes())?;
        }
        Ok(())
    }

    pub fn get_user(&self, protocol: Protocol, id: &str) -> Result<Option<User>> {
        self.users.get(user_key(protocol, id).as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    pub fn get_user_by_key(&self, key: &str) -> Result<Option<User>> {
        self.users.get(key.as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    pub fn user_by_handle(&self, protocol: Protocol, handle: &str) -> Result<Option<User>> {
        match self.user_handles.get(index_key(protocol, handle))? {
            Some(id) => self.get_user(protocol, std::str::from_utf8(&id).unwrap_or_default()),
            None => Ok(None),
        }
    }

    /// Indexed lookup used by the discovery endpoints: by handle, by
    /// handle-as-domain, or by native id.
    pub fn find_user(&self, protocol: Protocol, name: &str) -> Result<Option<User>> {
        if let Some(user) = self.user_by_handle(protocol, name)? {
            return Ok(Some(user));
        }
        if let Some(id) = self.user_domains.get(index_key(protocol, name))? {
            return self.get_user(protocol, std::str::from_utf8(&id).unwrap_or_default());
        }
        self.get_user(protocol, name)
    }

    /// Users modified after `since`, across all protocols. Feeds the
    /// relevant-set loader; the tree is small enough to scan.
    pub fn users_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<User>> {
        let mut out = Vec::new();
        for entry in self.users.iter() {
            let (_, value) = entry?;
            let user: User = from_bytes(&value)?;
            if user.updated > since {
                out.push(user);
            }
        }
        Ok(out)
    }

    // Objects

    pub fn put_object(&self, obj: &Object) -> Result<()> {
        self.objects.insert(obj.id.as_bytes(), to_bytes(obj)?)?;
        for copy in &obj.copies {
            self.object_copies.insert(copy.uri.as_bytes(), obj.id.as_bytes())?;
        }
        Ok(())
    }

    pub fn get_object(&self, id: &str) -> Result<Option<Object>> {
        self.objects.get(id.as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    /// Resolves a copy uri back to the Object it shadows.
    pub fn object_for_copy(&self, copy_uri: &str) -> Result<Option<Object>> {
        match self.object_copies.get(copy_uri.as_bytes())? {
            Some(id) => self.get_object(std::str::from_utf8(&id).unwrap_or_default()),
            None => Ok(None),
        }
    }

    /// Writes an Object and a User in one transaction. This is the
    /// (record committed, copies updated) atomicity the send paths rely on.
    pub fn put_object_with_user(&self, obj: &Object, user: &User) -> Result<()> {
        let obj_bytes = to_bytes(obj)?;
        let user_bytes = to_bytes(user)?;
        (&self.objects, &self.users)
            .transaction(|(objects, users)| {
                objects.insert(obj.id.as_bytes(), obj_bytes.clone())?;
                users.insert(user.key().as_bytes(), user_bytes.clone())?;
                Ok::<_, ConflictableTransactionError<CoreError>>(())
            })
            .map_err(CoreError::from)?;
        // the copy index is derived data; maintained outside the transaction
        for copy in &obj.copies {
            self.object_copies.insert(copy.uri.as_bytes(), obj.id.as_bytes())?;
        }
        Ok(())
    }

    // Followers

    pub fn put_follower(&self, follower: &Follower) -> Result<()> {
        self.followers.insert(follower.key().as_bytes(), to_bytes(follower)?)?;
        Ok(())
    }

    pub fn get_follower(&self, from: &str, to: &str) -> Result<Option<Follower>> {
        self.followers.get(follower_key(from, to).as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    // Cursors

    pub fn get_cursor(&self, host: &str, nsid: &str) -> Result<Option<Cursor>> {
        self.cursors.get(cursor_key(host, nsid).as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    pub fn put_cursor(&self, cursor: &Cursor) -> Result<()> {
        self.cursors.insert(cursor.key().as_bytes(), to_bytes(cursor)?)?;
        Ok(())
    }

    // Relays

    pub fn get_relay(&self, url: &str) -> Result<Option<Relay>> {
        self.relays.get(url.as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    pub fn put_relay(&self, relay: &Relay) -> Result<()> {
        self.relays.insert(relay.url.as_bytes(), to_bytes(relay)?)?;
        Ok(())
    }

    pub fn all_relays(&self) -> Result<Vec<Relay>> {
        let mut out = Vec::new();
        for entry in self.relays.iter() {
            let (_, value) = entry?;
            out.push(from_bytes(&value)?);
        }
        Ok(out)
    }

    // Remote blobs

    pub fn get_blob(&self, url: &str) -> Result<Option<RemoteBlob>> {
        self.blobs.get(url.as_bytes())?.map(|v| from_bytes(&v)).transpose()
    }

    pub fn put_blob(&self, blob: &RemoteBlob) -> Result<()> {
        self.blobs.insert(blob.url.as_bytes(), to_bytes(blob)?)?;
        Ok(())
    }

    /// Raw tree access for collaborators that persist their own state (the
    /// shadow-repo storage keeps records here).
    pub fn open_tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Target;

    fn store() -> Datastore {
        Datastore::temporary().expect("opening temporary store should succeed")
    }

    #[test]
    fn user_round_trip_and_handle_index() {
        let store = store();
        let mut user = User::new(Protocol::Web, "alice.com");
        user.handle = Some("alice.com".into());
        store.put_user(&user).unwrap();

        let got = store.get_user(Protocol::Web, "alice.com").unwrap().unwrap();
        assert_eq!(got.id, "alice.com");

        let by_handle = store.user_by_handle(Protocol::Web, "alice.com").unwrap().unwrap();
        assert_eq!(by_handle.id, "alice.com");

        // changing the handle retires the old index entry
        user.handle = Some("blog.alice.com".into());
        store.put_user(&user).unwrap();
        assert!(store.user_by_handle(Protocol::Web, "alice.com").unwrap().is_none());
        assert!(store.user_by_handle(Protocol::Web, "blog.alice.com").unwrap().is_some());
    }

    #[test]
    fn find_user_matches_handle_domain_and_id() {
        let store = store();
        let mut user = User::new(Protocol::ActivityPub, "https://inst.example/users/bob");
        user.handle = Some("@bob@inst.example".into());
        store.put_user(&user).unwrap();

        for name in ["@bob@inst.example", "bob.inst.example", "https://inst.example/users/bob"] {
            let got = store.find_user(Protocol::ActivityPub, name).unwrap();
            assert!(got.is_some(), "find_user({name})");
        }
        assert!(store.find_user(Protocol::ActivityPub, "carol.example").unwrap().is_none());
    }

    #[test]
    fn object_copy_resolves_back_to_original() {
        let store = store();
        let mut obj = Object::new("https://alice.com/post/1");
        obj.add_copy(Target::new("at://did:plc:a/app.bsky.feed.post/3k", Protocol::Atproto));
        store.put_object(&obj).unwrap();

        let back = store.object_for_copy("at://did:plc:a/app.bsky.feed.post/3k").unwrap().unwrap();
        assert_eq!(back.id, "https://alice.com/post/1");
    }

    #[test]
    fn object_with_user_transaction() {
        let store = store();
        let mut user = User::new(Protocol::Web, "alice.com");
        let mut obj = Object::new("https://alice.com/post/1");
        obj.add_copy(Target::new("nostr:note1abc", Protocol::Nostr));
        user.add_copy(Target::new("nostr:npub1abc", Protocol::Nostr));

        store.put_object_with_user(&obj, &user).unwrap();

        assert!(store.get_object("https://alice.com/post/1").unwrap().is_some());
        let user = store.get_user(Protocol::Web, "alice.com").unwrap().unwrap();
        assert_eq!(user.get_copy(Protocol::Nostr), Some("nostr:npub1abc"));
        assert!(store.object_for_copy("nostr:note1abc").unwrap().is_some());
    }

    #[test]
    fn users_updated_since_filters() {
        let store = store();
        let mut old = User::new(Protocol::Web, "old.com");
        old.updated = Utc::now() - chrono::Duration::hours(1);
        store.put_user(&old).unwrap();
        store.put_user(&User::new(Protocol::Web, "new.com")).unwrap();

        let since = Utc::now() - chrono::Duration::minutes(5);
        let recent = store.users_updated_since(since).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "new.com");
    }

    #[test]
    fn cursor_and_relay_round_trip() {
        let store = store();
        let mut cursor = Cursor::new("bgs.example", "com.atproto.sync.subscribeRepos");
        cursor.cursor = 444;
        store.put_cursor(&cursor).unwrap();
        let got = store.get_cursor("bgs.example", "com.atproto.sync.subscribeRepos").unwrap();
        assert_eq!(got.unwrap().cursor, 444);

        let mut relay = Relay::new("wss://nos.lol");
        relay.since = Some(1_700_000_000);
        store.put_relay(&relay).unwrap();
        assert_eq!(store.get_relay("wss://nos.lol").unwrap().unwrap().since, Some(1_700_000_000));
        assert_eq!(store.all_relays().unwrap().len(), 1);
    }

    #[test]
    fn follower_lookup() {
        let store = store();
        let follower = Follower::new(
            "atproto did:plc:alice",
            "web bob.com",
            Some("at://did:plc:alice/app.bsky.graph.follow/123".into()),
        );
        store.put_follower(&follower).unwrap();

        let got = store.get_follower("atproto did:plc:alice", "web bob.com").unwrap().unwrap();
        assert_eq!(got.follow.as_deref(), Some("at://did:plc:alice/app.bsky.graph.follow/123"));
        assert!(store.get_follower("web bob.com", "atproto did:plc:alice").unwrap().is_none());
    }
}
