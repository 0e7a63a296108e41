#![doc = "ATProto side of the bridge: DID/handle identity, PLC directory client, shadow repositories, firehose ingestion, and the record conversion facade."]
pub mod blobs;
pub mod convert;
pub mod dns;
pub mod error;
pub mod firehose;
pub mod identity;
pub mod jwt;
pub mod plc;
pub mod repo;
pub mod services;
pub mod shadow;

pub use error::{AtprotoError, Result};

/// Collections whose records map onto activity verbs we handle.
pub const COLLECTION_TO_TYPE: &[(&str, &str)] = &[
    ("app.bsky.actor.profile", "profile"),
    ("app.bsky.feed.like", "like"),
    ("app.bsky.feed.post", "post"),
    ("app.bsky.feed.repost", "repost"),
    ("app.bsky.graph.follow", "follow"),
    ("app.bsky.graph.block", "block"),
];

/// Splits an `at://` URI into (repo, collection, rkey). Any of the three may
/// be empty on partial URIs.
pub fn parse_at_uri(uri: &str) -> Option<(String, String, String)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let repo = parts.next().unwrap_or_default().to_string();
    let collection = parts.next().unwrap_or_default().to_string();
    let rkey = parts.next().unwrap_or_default().to_string();
    Some((repo, collection, rkey))
}

pub fn at_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{did}/{collection}/{rkey}")
}
