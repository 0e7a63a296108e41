//! Conversion facade and the Nostr send path. Events are immutable, so every
//! outbound operation is "sign a new event and publish it" — updates and
//! deletes included, as kind-specific events.

use serde_json::Value;

use bifrost_core::convert::{ConvertOpts, Converter};
use bifrost_core::models::{Object, Target, User};
use bifrost_core::protocol::Protocol;
use bifrost_core::store::Datastore;

use crate::client::RelayClient;
use crate::error::{NostrError, Result};
use crate::event::Event;
use crate::nip19;

/// Converts an Object into a signed Nostr event. Objects that already carry
/// an event pass through.
pub async fn to_event(
    converter: &dyn Converter,
    obj: &Object,
    from_user: Option<&User>,
) -> Result<Option<Event>> {
    if let Some(nostr) = &obj.nostr {
        return Ok(Some(Event::from_value(nostr)?));
    }
    if obj.as1().is_none() {
        return Ok(None);
    }
    let opts = ConvertOpts { from_user: from_user.cloned(), fetch_blobs: false };
    let Some(value) = converter.to_record(obj, Protocol::Nostr, &opts).await? else {
        tracing::info!(id = obj.id, "couldn't convert to nostr event");
        return Ok(None);
    };
    Ok(Some(Event::from_value(&value)?))
}

/// Converts a Nostr event back into AS1.
pub async fn to_as1(converter: &dyn Converter, event: &Value) -> Result<Option<Value>> {
    Ok(converter.to_as1(event, Protocol::Nostr).await?)
}

/// Signs and publishes the event an activity denotes, then records the copy.
/// The event must be signed by the sending user's shadow key.
pub async fn send(
    store: &Datastore,
    client: &RelayClient,
    converter: &dyn Converter,
    obj: &Object,
    relay_url: &str,
    from_user: &User,
) -> Result<bool> {
    let Some(event) = to_event(converter, obj, Some(from_user)).await? else {
        return Ok(false);
    };

    let expected = from_user.hex_pubkey().map_err(NostrError::Core)?;
    if event.pubkey != expected {
        return Err(NostrError::InvalidEvent(format!(
            "event pubkey {} is not {}'s key",
            event.pubkey,
            from_user.key()
        )));
    }
    if event.sig.is_empty() || !event.verify() {
        return Err(NostrError::InvalidEvent(format!("event {} is not signed", event.id)));
    }

    if !client.publish(relay_url, &event).await? {
        return Ok(false);
    }

    let uri = nip19::id_to_uri(nip19::bech32_prefix_for(&event), &event.id)?;
    let mut obj = obj.clone();
    obj.remove_copies(Protocol::Nostr);
    obj.add_copy(Target::new(uri, Protocol::Nostr));
    store.put_object(&obj)?;
    Ok(true)
}
