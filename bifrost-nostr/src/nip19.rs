//! NIP-19 bech32 identifiers and the `nostr:` URI scheme.

use bech32::{Bech32, Hrp};

use crate::error::{NostrError, Result};
use crate::event::{Event, KIND_PROFILE};

pub fn encode(prefix: &str, data: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(prefix).map_err(|e| NostrError::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| NostrError::Bech32(e.to_string()))
}

pub fn decode(encoded: &str) -> Result<(String, Vec<u8>)> {
    let (hrp, data) = bech32::decode(encoded).map_err(|e| NostrError::Bech32(e.to_string()))?;
    Ok((hrp.to_lowercase(), data))
}

pub fn is_bech32(id: &str) -> bool {
    ["npub1", "nsec1", "note1", "nevent1", "nprofile1"].iter().any(|p| id.starts_with(p))
}

/// Wraps a hex id in a `nostr:` URI with the given bech32 prefix.
pub fn id_to_uri(prefix: &str, hex_id: &str) -> Result<String> {
    let bytes = hex::decode(hex_id).map_err(|e| NostrError::InvalidId(e.to_string()))?;
    Ok(format!("nostr:{}", encode(prefix, &bytes)?))
}

/// Extracts the hex id from a `nostr:` URI or bare bech32 string. `nevent`
/// and `nprofile` TLV payloads yield their special (type 0) entry.
pub fn uri_to_id(uri: &str) -> Result<String> {
    let bare = uri.strip_prefix("nostr:").unwrap_or(uri);
    let (hrp, data) = decode(bare)?;
    match hrp.as_str() {
        "npub" | "note" | "nsec" => Ok(hex::encode(data)),
        "nevent" | "nprofile" => {
            let mut rest = data.as_slice();
            while rest.len() >= 2 {
                let (tag, len) = (rest[0], rest[1] as usize);
                if rest.len() < 2 + len {
                    break;
                }
                if tag == 0 {
                    return Ok(hex::encode(&rest[2..2 + len]));
                }
                rest = &rest[2 + len..];
            }
            Err(NostrError::InvalidId(format!("{bare} has no special TLV entry")))
        }
        other => Err(NostrError::InvalidId(format!("unsupported bech32 prefix {other}"))),
    }
}

/// The bech32 prefix an event's canonical id uses.
pub fn bech32_prefix_for(event: &Event) -> &'static str {
    if event.kind == KIND_PROFILE {
        "npub"
    } else {
        "note"
    }
}

/// The canonical `nostr:` URI for an event: profiles by author, everything
/// else by event id.
pub fn uri_for(event: &Event) -> Result<String> {
    if event.kind == KIND_PROFILE {
        id_to_uri("npub", &event.pubkey)
    } else {
        id_to_uri("note", &event.id)
    }
}

pub fn npub_uri(hex_pubkey: &str) -> Result<String> {
    id_to_uri("npub", hex_pubkey)
}
