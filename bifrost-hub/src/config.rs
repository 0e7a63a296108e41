//! Service configuration: hosts, domains, and tunables, from flags or env.

use std::net::SocketAddr;
use std::path::PathBuf;

use bifrost_core::blocklist::Domains;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "bifrost-hub", about = "Cross-protocol bridge between ATProto and Nostr")]
pub struct Config {
    /// Directory for the sled datastore.
    #[arg(long, env = "BIFROST_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Parent of the per-protocol bridge subdomains.
    #[arg(long, env = "BIFROST_SUPERDOMAIN", default_value = "brid.gy")]
    pub superdomain: String,

    /// Canonical serving domain.
    #[arg(long, env = "BIFROST_PRIMARY_DOMAIN", default_value = "fed.brid.gy")]
    pub primary_domain: String,

    /// ATProto sync relay to subscribe to.
    #[arg(long, env = "BGS_HOST", default_value = "bsky.network")]
    pub bgs_host: String,

    /// AppView for record fetches.
    #[arg(long, env = "APPVIEW_HOST", default_value = "api.bsky.app")]
    pub appview_host: String,

    /// PLC directory.
    #[arg(long, env = "PLC_HOST", default_value = "plc.directory")]
    pub plc_host: String,

    #[arg(long, env = "CHAT_HOST", default_value = "api.bsky.chat")]
    pub chat_host: String,

    #[arg(long, env = "CHAT_DID", default_value = "did:web:api.bsky.chat")]
    pub chat_did: String,

    #[arg(long, env = "MOD_SERVICE_HOST", default_value = "mod.bsky.app")]
    pub mod_service_host: String,

    #[arg(long, env = "MOD_SERVICE_DID", default_value = "did:plc:ar7c4by46qjdydhdevvrndac")]
    pub mod_service_did: String,

    /// Nostr relay subscribed at startup; others are discovered from user
    /// relay lists.
    #[arg(long, env = "NOSTR_DEFAULT_RELAY", default_value = "wss://nos.lol")]
    pub nostr_default_relay: String,

    /// Address the well-known endpoints listen on.
    #[arg(long, env = "BIFROST_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Run tasks synchronously instead of through the queue.
    #[arg(long, env = "BIFROST_INLINE_TASKS")]
    pub inline_tasks: bool,
}

impl Config {
    pub fn domains(&self) -> Domains {
        Domains {
            superdomain: self.superdomain.clone(),
            primary: self.primary_domain.clone(),
            ..Domains::default()
        }
    }
}
