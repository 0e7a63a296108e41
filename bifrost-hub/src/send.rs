//! The send engine: given a translated Object and a destination protocol,
//! make sure the sending user has a shadow identity there, then hand off to
//! the protocol's own send path.

use std::sync::Arc;

use bifrost_atproto::shadow::ShadowRepos;
use bifrost_core::blocklist::Domains;
use bifrost_core::convert::Converter;
use bifrost_core::models::{Object, Target, User};
use bifrost_core::protocol::Protocol;
use bifrost_core::store::Datastore;
use bifrost_nostr::client::RelayClient;
use bifrost_nostr::identity::NostrIdentity;
use bifrost_nostr::nip19;

pub struct SendEngine {
    store: Datastore,
    shadow: Arc<ShadowRepos>,
    nostr_identity: Arc<NostrIdentity>,
    nostr_client: RelayClient,
    converter: Arc<dyn Converter>,
    domains: Domains,
}

impl SendEngine {
    pub fn new(
        store: Datastore,
        shadow: Arc<ShadowRepos>,
        nostr_identity: Arc<NostrIdentity>,
        converter: Arc<dyn Converter>,
        domains: Domains,
    ) -> Self {
        SendEngine {
            store,
            shadow,
            nostr_identity,
            nostr_client: RelayClient,
            converter,
            domains,
        }
    }

    /// Delivers `obj` into `to` on behalf of `from_user`, creating their
    /// shadow identity there first if needed.
    pub async fn send(&self, obj: &Object, to: Protocol, from_user: &mut User) -> anyhow::Result<bool> {
        if to == from_user.protocol {
            return Ok(false);
        }
        if from_user.status.is_some() {
            tracing::info!(user = from_user.key(), status = ?from_user.status, "user is not bridgeable");
            return Ok(false);
        }
        self.ensure_copy(from_user, to).await?;

        match to {
            Protocol::Atproto => {
                Ok(self.shadow.send(obj, &self.domains.pds_url(), from_user).await?)
            }
            Protocol::Nostr => {
                let relay = self.nostr_identity.target_for(from_user);
                Ok(bifrost_nostr::convert::send(
                    &self.store,
                    &self.nostr_client,
                    &*self.converter,
                    obj,
                    &relay,
                    from_user,
                )
                .await?)
            }
            // delivery engines for these live elsewhere
            Protocol::ActivityPub | Protocol::Web => Ok(false),
        }
    }

    async fn ensure_copy(&self, user: &mut User, to: Protocol) -> anyhow::Result<()> {
        if !to.has_copies() || user.get_copy(to).is_some() {
            return Ok(());
        }
        match to {
            Protocol::Atproto => self.shadow.create_for(user).await?,
            Protocol::Nostr => self.create_nostr_for(user).await?,
            _ => {}
        }
        Ok(())
    }

    /// The Nostr analogue of shadow-repo creation: mint a keypair, record the
    /// npub copy, and publish a profile event when we have one.
    async fn create_nostr_for(&self, user: &mut User) -> anyhow::Result<()> {
        if user.get_copy(Protocol::Nostr).is_some() {
            return Ok(());
        }
        if user.nostr_privkey.is_none() {
            let key = k256::schnorr::SigningKey::random(&mut rand::thread_rng());
            user.nostr_privkey = Some(key.to_bytes().to_vec());
        }
        let npub_uri = nip19::npub_uri(&user.hex_pubkey()?)?;
        tracing::info!(user = user.key(), npub_uri, "adding nostr copy");
        user.add_copy(Target::new(npub_uri, Protocol::Nostr));
        user.touch();
        self.store.put_user(user)?;

        // best effort: a failed profile publish shouldn't block the activity
        // that triggered bridging
        if let Some(obj_key) = user.obj_key.clone() {
            if let Some(profile) = self.store.get_object(&obj_key)? {
                if profile.as1().is_some() {
                    let relay = self.nostr_identity.target_for(user);
                    if let Err(err) = bifrost_nostr::convert::send(
                        &self.store,
                        &self.nostr_client,
                        &*self.converter,
                        &profile,
                        &relay,
                        user,
                    )
                    .await
                    {
                        bifrost_core::report::error(&user.key(), &err);
                    }
                }
            }
        }
        Ok(())
    }
}
