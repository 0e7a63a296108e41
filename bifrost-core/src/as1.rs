//! Helpers over the AS1 pivot representation. Activities and objects are
//! plain JSON values; these are the accessors the engine needs to route them.

use serde_json::Value;

pub const ACTOR_TYPES: &[&str] = &["person", "organization", "application", "service", "group"];

pub const POST_TYPES: &[&str] = &["note", "article", "comment", "image", "video", "audio"];

/// Verbs that wrap an inner object the engine must unwrap before converting.
pub const CRUD_VERBS: &[&str] = &["post", "update", "delete", "undo"];

/// The well-known "public" audience marker.
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Returns the activity verb if `val` is an activity, otherwise its object type.
pub fn object_type(val: &Value) -> Option<&str> {
    if let Some(verb) = val.get("verb").and_then(Value::as_str) {
        if !verb.is_empty() {
            return Some(verb);
        }
    }
    val.get("objectType").and_then(Value::as_str)
}

pub fn is_activity(val: &Value) -> bool {
    val.get("verb").and_then(Value::as_str).is_some_and(|v| !v.is_empty())
        || val.get("objectType").and_then(Value::as_str) == Some("activity")
}

/// Returns the id of `val`'s `field`, whether it's a bare string or an object.
pub fn get_id<'a>(val: &'a Value, field: &str) -> Option<&'a str> {
    match val.get(field)? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        Value::Array(items) => items.first().and_then(|item| match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("id").and_then(Value::as_str),
            _ => None,
        }),
        _ => None,
    }
}

/// Returns `val`'s inner object as an owned JSON object. Bare string ids are
/// wrapped as `{"id": …}`.
pub fn get_object(val: &Value) -> Value {
    get_field_object(val, "object")
}

pub fn get_field_object(val: &Value, field: &str) -> Value {
    match val.get(field) {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(s)) => serde_json::json!({ "id": s }),
        Some(Value::Array(items)) => match items.first() {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::String(s)) => serde_json::json!({ "id": s }),
            _ => Value::Object(Default::default()),
        },
        _ => Value::Object(Default::default()),
    }
}

/// All ids found in `val`'s `field`, flattening arrays and objects.
pub fn get_ids<'a>(val: &'a Value, field: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    match val.get(field) {
        Some(Value::String(s)) => out.push(s.as_str()),
        Some(Value::Object(map)) => {
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                out.push(id);
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(s) => out.push(s.as_str()),
                    Value::Object(map) => {
                        if let Some(id) = map.get("id").and_then(Value::as_str) {
                            out.push(id);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    out
}

/// The actor/author of an activity or object, if any.
pub fn get_owner(val: &Value) -> Option<&str> {
    if let Some(actor) = get_id(val, "actor") {
        return Some(actor);
    }
    if let Some(author) = get_id(val, "author") {
        return Some(author);
    }
    if object_type(val).is_some_and(|t| ACTOR_TYPES.contains(&t)) {
        return val.get("id").and_then(Value::as_str);
    }
    None
}

/// If this activity is a DM, returns the single recipient's id.
///
/// A DM is a non-public note-ish object addressed to exactly one recipient.
pub fn recipient_if_dm(val: &Value) -> Option<&str> {
    let recipients = get_ids(val, "to");
    if recipients.len() != 1 || recipients[0] == PUBLIC_AUDIENCE {
        return None;
    }
    let inner = if is_activity(val) { val.get("object")? } else { val };
    let inner_type = match inner {
        Value::Object(_) => object_type(inner).unwrap_or("note"),
        _ => "note",
    };
    if POST_TYPES.contains(&inner_type) {
        Some(recipients[0])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_type_prefers_verb() {
        assert_eq!(object_type(&json!({"verb": "delete", "objectType": "activity"})), Some("delete"));
        assert_eq!(object_type(&json!({"objectType": "note"})), Some("note"));
        assert_eq!(object_type(&json!({"content": "hi"})), None);
    }

    #[test]
    fn get_object_wraps_strings() {
        let activity = json!({"verb": "delete", "object": "at://did:plc:a/app.bsky.feed.post/1"});
        assert_eq!(
            get_object(&activity),
            json!({"id": "at://did:plc:a/app.bsky.feed.post/1"})
        );

        let nested = json!({"verb": "post", "object": {"id": "x", "content": "hi"}});
        assert_eq!(get_object(&nested)["content"], "hi");
    }

    #[test]
    fn owner_falls_back_to_actor_id() {
        assert_eq!(get_owner(&json!({"actor": {"id": "did:plc:a"}})), Some("did:plc:a"));
        assert_eq!(get_owner(&json!({"objectType": "person", "id": "did:plc:b"})), Some("did:plc:b"));
        assert_eq!(get_owner(&json!({"objectType": "note", "id": "x"})), None);
    }

    #[test]
    fn dm_detection() {
        let dm = json!({"objectType": "note", "content": "psst", "to": ["did:plc:bob"]});
        assert_eq!(recipient_if_dm(&dm), Some("did:plc:bob"));

        let public = json!({
            "objectType": "note",
            "to": [PUBLIC_AUDIENCE],
        });
        assert_eq!(recipient_if_dm(&public), None);

        let multi = json!({"objectType": "note", "to": ["a", "b"]});
        assert_eq!(recipient_if_dm(&multi), None);

        let wrapped = json!({
            "verb": "post",
            "to": ["nostr:npub1bob"],
            "object": {"objectType": "note", "content": "hi"},
        });
        assert_eq!(recipient_if_dm(&wrapped), Some("nostr:npub1bob"));
    }
}
