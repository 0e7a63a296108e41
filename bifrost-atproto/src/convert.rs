//! Conversion facade: wraps the opaque AS1 translator and applies the
//! ATProto-specific side effects for bridged content.

use serde_json::{json, Value};

use bifrost_core::as1;
use bifrost_core::convert::{ConvertOpts, Converter};
use bifrost_core::models::{Object, User};
use bifrost_core::protocol::Protocol;

use crate::error::Result;

/// Converts an Object into its `app.bsky.*` record. Objects that already
/// carry a record pass through untouched; converted ones get the bridge
/// markers applied.
pub async fn to_record(
    converter: &dyn Converter,
    obj: &Object,
    from_user: Option<&User>,
    fetch_blobs: bool,
) -> Result<Option<Value>> {
    if let Some(bsky) = &obj.bsky {
        return Ok(Some(bsky.clone()));
    }
    let Some(as1) = obj.as1() else {
        return Ok(None);
    };

    let opts = ConvertOpts { from_user: from_user.cloned(), fetch_blobs };
    let Some(mut record) = converter.to_record(obj, Protocol::Atproto, &opts).await? else {
        tracing::info!(id = obj.id, "couldn't convert to atproto record");
        return Ok(None);
    };

    if obj.source_protocol != Some(Protocol::Atproto) {
        apply_bridge_markers(&mut record, as1, obj.source_protocol);
    }
    Ok(Some(record))
}

/// Converts an `app.bsky.*` record back into AS1.
pub async fn to_as1(converter: &dyn Converter, record: &Value) -> Result<Option<Value>> {
    Ok(converter.to_as1(record, Protocol::Atproto).await?)
}

/// Marks bridged content: a self label on profiles, the original description,
/// and a pointer back to the source object.
fn apply_bridge_markers(record: &mut Value, as1: &Value, source: Option<Protocol>) {
    let record_type = record.get("$type").and_then(Value::as_str).unwrap_or_default().to_string();

    if record_type == "app.bsky.actor.profile" {
        if let Some(summary) = as1.get("bridgyOriginalSummary").and_then(Value::as_str) {
            record["bridgyOriginalDescription"] = json!(summary);
        } else if let Some(map) = record.as_object_mut() {
            map.remove("bridgyOriginalDescription");
        }

        let mut label = String::from("bridged-from-bridgy-fed");
        if let Some(source) = source {
            label.push('-');
            label.push_str(source.label());
        }
        if !record.get("labels").is_some_and(Value::is_object) {
            record["labels"] = json!({"$type": "com.atproto.label.defs#selfLabels"});
        }
        if let Some(labels) = record["labels"].as_object_mut() {
            let values = labels.entry("values").or_insert_with(|| json!([]));
            if let Some(values) = values.as_array_mut() {
                values.push(json!({"val": label}));
            }
        }
    }

    if record_type == "app.bsky.actor.profile" || record_type == "app.bsky.feed.post" {
        let inner = if as1::is_activity(as1) { as1::get_object(as1) } else { as1.clone() };
        let orig_url = inner
            .get("url")
            .and_then(Value::as_str)
            .or_else(|| inner.get("id").and_then(Value::as_str));
        if let Some(url) = orig_url {
            record["bridgyOriginalUrl"] = json!(url);
        }
    }
}
