//! One-shot relay operations: query until EOSE, publish and wait for OK.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{NostrError, Result};
use crate::event::Event;

/// Per-call timeout on relay reads and the initial connect.
pub const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

fn subscription_id() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, Default)]
pub struct RelayClient;

impl RelayClient {
    /// Sends one REQ and collects events until EOSE or timeout.
    pub async fn query(&self, relay_url: &str, filter: Value) -> Result<Vec<Event>> {
        tracing::debug!(relay_url, filter = %filter, "querying relay");
        let (ws, _) = tokio::time::timeout(HTTP_TIMEOUT, connect_async(relay_url))
            .await
            .map_err(|_| NostrError::Relay(format!("connect to {relay_url} timed out")))??;
        let (mut write, mut read) = ws.split();

        let sub_id = subscription_id();
        write.send(Message::Text(json!(["REQ", sub_id, filter]).to_string())).await?;

        let mut events = Vec::new();
        loop {
            let msg = match tokio::time::timeout(HTTP_TIMEOUT, read.next()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(msg))) => msg,
            };
            let Message::Text(text) = msg else {
                continue;
            };
            let Ok(resp) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            match resp.get(0).and_then(Value::as_str) {
                Some("EVENT") => {
                    if let Some(raw) = resp.get(2) {
                        match Event::from_value(raw) {
                            Ok(event) if event.verify() => events.push(event),
                            Ok(event) => {
                                tracing::debug!(id = event.id, "dropping unverifiable event")
                            }
                            Err(err) => tracing::debug!(error = %err, "bad event from relay"),
                        }
                    }
                }
                Some("EOSE") | Some("CLOSED") => break,
                _ => {}
            }
        }
        let _ = write.send(Message::Text(json!(["CLOSE", sub_id]).to_string())).await;
        Ok(events)
    }

    /// Publishes one event and waits for the relay's OK.
    pub async fn publish(&self, relay_url: &str, event: &Event) -> Result<bool> {
        tracing::debug!(relay_url, id = event.id, kind = event.kind, "publishing event");
        let (ws, _) = tokio::time::timeout(HTTP_TIMEOUT, connect_async(relay_url))
            .await
            .map_err(|_| NostrError::Relay(format!("connect to {relay_url} timed out")))??;
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(json!(["EVENT", event.to_value()]).to_string()))
            .await?;

        match tokio::time::timeout(HTTP_TIMEOUT, read.next()).await {
            Err(_) => Ok(false),
            Ok(None) => Ok(false),
            Ok(Some(Err(err))) => {
                tracing::warn!(relay_url, error = %err, "relay closed during publish");
                Ok(false)
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                let resp: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                let accepted = resp.get(0).and_then(Value::as_str) == Some("OK")
                    && resp.get(2).and_then(Value::as_bool).unwrap_or(false);
                if !accepted {
                    tracing::warn!(relay_url, response = %resp, "relay rejected event");
                }
                Ok(accepted)
            }
            Ok(Some(Ok(_))) => Ok(false),
        }
    }
}
