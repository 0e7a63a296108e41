#![doc = "Nostr side of the bridge: the NIP-01 event model, NIP-19 ids, NIP-05 identity, relay client, and the long-lived relay hub."]
pub mod client;
pub mod convert;
pub mod error;
pub mod event;
pub mod hub;
pub mod identity;
pub mod nip19;

pub use error::{NostrError, Result};
pub use event::Event;
