//! The protocol registry: which networks we bridge, what they're called, and
//! what each one is capable of.

use serde::{Deserialize, Serialize};

/// Three-valued answer for cheap syntactic ownership tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    Yes,
    No,
    Maybe,
}

impl Tri {
    pub fn is_yes(self) -> bool {
        self == Tri::Yes
    }

    pub fn is_no(self) -> bool {
        self == Tri::No
    }
}

/// A federated network we know how to identify users on. ATProto and Nostr
/// have full ingress/egress engines here; ActivityPub and Web exist as source
/// protocols for bridged users, with delivery handled elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(rename = "activitypub")]
    ActivityPub,
    Web,
    Atproto,
    Nostr,
}

pub const DEFAULT_NOSTR_RELAY: &str = "wss://nos.lol";

impl Protocol {
    pub const ALL: [Protocol; 4] =
        [Protocol::ActivityPub, Protocol::Web, Protocol::Atproto, Protocol::Nostr];

    /// Short label used in ids, queue payloads and query params.
    pub fn label(self) -> &'static str {
        match self {
            Protocol::ActivityPub => "activitypub",
            Protocol::Web => "web",
            Protocol::Atproto => "atproto",
            Protocol::Nostr => "nostr",
        }
    }

    /// Human-readable name.
    pub fn phrase(self) -> &'static str {
        match self {
            Protocol::ActivityPub => "fediverse",
            Protocol::Web => "web",
            Protocol::Atproto => "Bluesky",
            Protocol::Nostr => "Nostr",
        }
    }

    pub fn from_label(label: &str) -> Option<Protocol> {
        match label {
            "activitypub" | "ap" => Some(Protocol::ActivityPub),
            "web" => Some(Protocol::Web),
            "atproto" | "bsky" => Some(Protocol::Atproto),
            "nostr" => Some(Protocol::Nostr),
            _ => None,
        }
    }

    pub fn requires_avatar(self) -> bool {
        matches!(self, Protocol::Atproto | Protocol::Nostr)
    }

    pub fn requires_name(self) -> bool {
        matches!(self, Protocol::Nostr)
    }

    pub fn supports_dms(self) -> bool {
        matches!(self, Protocol::Atproto)
    }

    /// Whether this protocol mints per-object copies (shadow records) when we
    /// bridge into it.
    pub fn has_copies(self) -> bool {
        matches!(self, Protocol::Atproto | Protocol::Nostr)
    }

    pub fn html_profiles(self) -> bool {
        matches!(self, Protocol::ActivityPub | Protocol::Web)
    }

    /// Activity verbs we accept from or deliver to this protocol.
    pub fn supported_verbs(self) -> &'static [&'static str] {
        match self {
            Protocol::Atproto => &[
                "post",
                "update",
                "delete",
                "undo",
                "block",
                "follow",
                "flag",
                "like",
                "share",
                "stop-following",
            ],
            Protocol::Nostr => &[
                "post",
                "update",
                "delete",
                "undo",
                "follow",
                "like",
                "share",
                "stop-following",
            ],
            Protocol::ActivityPub | Protocol::Web => &[
                "post", "update", "delete", "undo", "block", "follow", "like", "share",
                "stop-following",
            ],
        }
    }

    /// Protocols users of this network are bridged into unless they opt out.
    pub fn default_enabled(self) -> &'static [Protocol] {
        match self {
            Protocol::Atproto | Protocol::Nostr => &[Protocol::Web],
            Protocol::ActivityPub | Protocol::Web => &[],
        }
    }

    /// Cheap syntactic test: could `id` belong to this protocol?
    pub fn owns_id(self, id: &str) -> Tri {
        match self {
            Protocol::Atproto => {
                if id.starts_with("at://")
                    || id.starts_with("did:plc:")
                    || id.starts_with("did:web:")
                    || id.starts_with("https://bsky.app/")
                {
                    Tri::Yes
                } else {
                    Tri::No
                }
            }
            Protocol::Nostr => {
                if id.starts_with("nostr:") {
                    Tri::Yes
                } else if id.starts_with("npub1")
                    || id.starts_with("note1")
                    || id.starts_with("nevent1")
                    || id.starts_with("nprofile1")
                {
                    Tri::Maybe
                } else {
                    Tri::No
                }
            }
            Protocol::ActivityPub => {
                if id.starts_with("https://") || id.starts_with("http://") {
                    Tri::Maybe
                } else {
                    Tri::No
                }
            }
            Protocol::Web => {
                if id.starts_with("https://") || id.starts_with("http://") {
                    Tri::Maybe
                } else if crate::ids::is_valid_domain(id) {
                    Tri::Maybe
                } else {
                    Tri::No
                }
            }
        }
    }

    /// Cheap syntactic test: could `handle` be one of ours?
    pub fn owns_handle(self, handle: &str) -> Tri {
        if handle.is_empty() {
            return Tri::No;
        }
        match self {
            Protocol::Atproto => {
                if crate::ids::is_valid_domain(handle) {
                    Tri::Yes
                } else {
                    Tri::No
                }
            }
            Protocol::Nostr => {
                if handle.starts_with("npub1") || handle.contains('@') {
                    Tri::Yes
                } else if crate::ids::is_valid_domain(handle) {
                    // could be a `_@domain` NIP-05
                    Tri::Maybe
                } else {
                    Tri::No
                }
            }
            Protocol::ActivityPub => {
                let h = handle.strip_prefix('@').unwrap_or(handle);
                if h.split('@').count() == 2 {
                    Tri::Yes
                } else {
                    Tri::No
                }
            }
            Protocol::Web => {
                if crate::ids::is_valid_domain(handle) {
                    Tri::Yes
                } else {
                    Tri::No
                }
            }
        }
    }

    /// The protocol whose id space definitely contains `id`, if any.
    pub fn for_id(id: &str) -> Option<Protocol> {
        Protocol::ALL.into_iter().find(|p| p.owns_id(id).is_yes())
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for proto in Protocol::ALL {
            assert_eq!(Protocol::from_label(proto.label()), Some(proto));
        }
        assert_eq!(Protocol::from_label("bsky"), Some(Protocol::Atproto));
        assert_eq!(Protocol::from_label("nope"), None);
    }

    #[test]
    fn owns_id() {
        assert!(Protocol::Atproto.owns_id("did:plc:abc123").is_yes());
        assert!(Protocol::Atproto.owns_id("at://did:plc:abc/app.bsky.feed.post/1").is_yes());
        assert!(Protocol::Atproto.owns_id("https://bsky.app/profile/a.com").is_yes());
        assert!(Protocol::Atproto.owns_id("nostr:npub1xyz").is_no());

        assert!(Protocol::Nostr.owns_id("nostr:npub1xyz").is_yes());
        assert_eq!(Protocol::Nostr.owns_id("npub1xyz"), Tri::Maybe);
        assert!(Protocol::Nostr.owns_id("did:plc:abc").is_no());

        assert_eq!(Protocol::for_id("did:web:example.com"), Some(Protocol::Atproto));
        assert_eq!(Protocol::for_id("nostr:note1abc"), Some(Protocol::Nostr));
        assert_eq!(Protocol::for_id("ftp://nope"), None);
    }

    #[test]
    fn owns_handle() {
        assert!(Protocol::Atproto.owns_handle("alice.bsky.social").is_yes());
        assert!(Protocol::Atproto.owns_handle("_bad_").is_no());
        assert!(Protocol::Nostr.owns_handle("alice@example.com").is_yes());
        assert_eq!(Protocol::Nostr.owns_handle("example.com"), Tri::Maybe);
        assert!(Protocol::ActivityPub.owns_handle("@alice@example.com").is_yes());
    }

    #[test]
    fn serde_labels() {
        assert_eq!(serde_json::to_string(&Protocol::Atproto).unwrap(), "\"atproto\"");
        assert_eq!(
            serde_json::from_str::<Protocol>("\"activitypub\"").unwrap(),
            Protocol::ActivityPub
        );
    }
}
