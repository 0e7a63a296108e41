//! Id and handle translation across protocols.

use crate::blocklist::Domains;
use crate::error::Result;
use crate::models::User;
use crate::protocol::Protocol;
use crate::store::Datastore;

/// Loose domain check: dotted labels of letters, digits and dashes, no label
/// starting or ending with a dash or underscore.
pub fn is_valid_domain(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 || !value.contains('.') {
        return false;
    }
    value.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Converts a handle into domain form: `@user@inst.example` → `user.inst.example`.
pub fn handle_as_domain(handle: &str) -> String {
    handle.trim_start_matches('@').replace('@', ".").to_lowercase()
}

/// The handle a user is known by on `to`, derived from their native handle.
///
/// Native users keep their own handle. Bridged users get a subdomain-style
/// handle under the bridge's protocol domains, eg web user `alice.com` is
/// `alice.com.web.<superdomain>` on ATProto and `alice.com@web.<superdomain>`
/// on Nostr.
pub fn handle_for(user: &User, to: Protocol, domains: &Domains) -> Option<String> {
    let native = user.handle.as_deref()?;
    if user.protocol == to {
        return Some(native.to_string());
    }
    let domain = handle_as_domain(native);
    match to {
        Protocol::Atproto => {
            Some(format!("{domain}.{}.{}", user.protocol.label(), domains.superdomain))
        }
        Protocol::Nostr => {
            Some(format!("{domain}@{}.{}", user.protocol.label(), domains.superdomain))
        }
        Protocol::ActivityPub => {
            Some(format!("@{domain}@{}.{}", user.protocol.label(), domains.superdomain))
        }
        Protocol::Web => Some(domain),
    }
}

/// Translates a user id from one protocol into the id of their shadow on
/// another, via the stored `copies`.
pub fn translate_user_id(
    store: &Datastore,
    from: Protocol,
    to: Protocol,
    id: &str,
) -> Result<Option<String>> {
    if from == to {
        return Ok(Some(id.to_string()));
    }
    match store.get_user(from, id)? {
        Some(user) => Ok(user.get_copy(to).map(str::to_string)),
        None => Ok(None),
    }
}

/// Translates an object id across protocols via the Object's `copies`, in
/// either direction.
pub fn translate_object_id(
    store: &Datastore,
    from: Protocol,
    to: Protocol,
    id: &str,
) -> Result<Option<String>> {
    if from == to {
        return Ok(Some(id.to_string()));
    }
    if let Some(obj) = store.get_object(id)? {
        if let Some(copy) = obj.get_copy(to) {
            return Ok(Some(copy.to_string()));
        }
    }
    // maybe `id` is itself a copy; translate back to the original
    if let Some(orig) = store.object_for_copy(id)? {
        if orig.source_protocol == Some(to) {
            return Ok(Some(orig.id));
        }
    }
    Ok(None)
}

/// The datastore User key an id implies: definite protocol match first,
/// then the first protocol that might own it.
pub fn key_for(id: &str) -> Option<String> {
    use crate::protocol::Tri;
    let protocol = Protocol::for_id(id)
        .or_else(|| Protocol::ALL.into_iter().find(|p| p.owns_id(id) == Tri::Maybe))?;
    Some(crate::models::user_key(protocol, id))
}

/// The id of a user's profile object on their own protocol.
pub fn profile_id(protocol: Protocol, id: &str) -> String {
    match protocol {
        Protocol::Atproto => format!("at://{id}/app.bsky.actor.profile/self"),
        _ => id.to_string(),
    }
}
