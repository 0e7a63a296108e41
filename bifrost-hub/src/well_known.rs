//! Discovery endpoints served by the bridge: NIP-05 attestation for users
//! bridged into Nostr, handle resolution for users bridged into ATProto, and
//! OAuth client metadata.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use bifrost_core::blocklist::Domains;
use bifrost_core::protocol::Protocol;
use bifrost_core::store::Datastore;
use bifrost_nostr::nip19;

const CACHE_CONTROL: &str = "public, max-age=3600";

pub struct AppState {
    pub store: Datastore,
    pub domains: Domains,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/.well-known/nostr.json", get(nip05))
        .route("/.well-known/atproto-did", get(atproto_did))
        .route("/oauth/client-metadata.json", get(client_metadata))
        .route("/.well-known/oauth-protected-resource", get(no_oauth))
        .route("/.well-known/oauth-authorization-server", get(no_oauth))
        .with_state(state)
}

fn cached<R: IntoResponse>(response: R) -> Response {
    ([(header::CACHE_CONTROL, CACHE_CONTROL)], response).into_response()
}

/// NIP-05 for bridged users: `{names: {name: hex pubkey}}`. Native Nostr
/// users attest their own identifiers; we never list them.
async fn nip05(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(name) = params.get("name") else {
        return (StatusCode::BAD_REQUEST, "missing name param").into_response();
    };

    for protocol in Protocol::ALL {
        if protocol == Protocol::Nostr {
            continue;
        }
        let Ok(Some(user)) = state.store.find_user(protocol, name) else {
            continue;
        };
        if !user.is_enabled(Protocol::Nostr) {
            continue;
        }
        let Some(copy) = user.get_copy(Protocol::Nostr) else {
            continue;
        };
        let Ok(pubkey) = nip19::uri_to_id(copy) else {
            continue;
        };
        return cached(Json(json!({"names": {name: pubkey}})));
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Programmatic handle resolution for users bridged into ATProto: the copy
/// DID as text/plain.
async fn atproto_did(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(protocol), Some(id)) = (params.get("protocol"), params.get("id")) else {
        return (StatusCode::BAD_REQUEST, "protocol and id params are required").into_response();
    };
    let Some(protocol) = Protocol::from_label(protocol) else {
        return (StatusCode::BAD_REQUEST, "unknown protocol").into_response();
    };

    let Ok(Some(user)) = state.store.find_user(protocol, id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match user.get_copy(Protocol::Atproto) {
        Some(did) => cached((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            did.to_string(),
        )),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn client_metadata(State(state): State<Arc<AppState>>) -> Response {
    let base = format!("https://{}", state.domains.primary);
    cached(Json(json!({
        "client_id": format!("{base}/oauth/client-metadata.json"),
        "client_name": "Bifrost",
        "client_uri": base,
        "application_type": "web",
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "scope": "atproto transition:generic",
        "token_endpoint_auth_method": "none",
        "dpop_bound_access_tokens": true,
        "redirect_uris": [format!("{base}/oauth/finish")],
    })))
}

async fn no_oauth() -> Response {
    (StatusCode::NOT_FOUND, "This bridge doesn't serve OAuth.").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bifrost_core::models::{Target, User, UserStatus};
    use serde_json::Value;
    use tower::ServiceExt;

    const PUBKEY_HEX: &str =
        "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";

    fn app() -> (Router, Datastore) {
        let store = Datastore::temporary().unwrap();
        let router =
            router(Arc::new(AppState { store: store.clone(), domains: Domains::default() }));
        (router, store)
    }

    fn bridged_web_user(store: &Datastore, nostr: bool, atproto: bool) -> User {
        let mut user = User::new(Protocol::Web, "alice.com");
        user.handle = Some("alice.com".into());
        if nostr {
            user.enabled_protocols.push(Protocol::Nostr);
            user.add_copy(Target::new(
                nip19::id_to_uri("npub", PUBKEY_HEX).unwrap(),
                Protocol::Nostr,
            ));
        }
        if atproto {
            user.enabled_protocols.push(Protocol::Atproto);
            user.add_copy(Target::new("did:plc:alice", Protocol::Atproto));
        }
        store.put_user(&user).unwrap();
        user
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response =
            router.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get_text(router: Router, uri: &str) -> (StatusCode, String) {
        let response =
            router.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn nip05_serves_bridged_users() {
        let (router, store) = app();
        bridged_web_user(&store, true, false);

        let (status, body) =
            get_json(router, "/.well-known/nostr.json?name=alice.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["names"]["alice.com"], PUBKEY_HEX);
    }

    #[tokio::test]
    async fn nip05_misses() {
        let (router, store) = app();
        // not bridged into nostr
        bridged_web_user(&store, false, true);

        let (status, _) =
            get_json(router.clone(), "/.well-known/nostr.json?name=alice.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(router.clone(), "/.well-known/nostr.json?name=nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(router, "/.well-known/nostr.json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn nip05_excludes_disabled_users() {
        let (router, store) = app();
        let mut user = bridged_web_user(&store, true, false);
        user.status = Some(UserStatus::Blocked);
        store.put_user(&user).unwrap();

        let (status, _) = get_json(router, "/.well-known/nostr.json?name=alice.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn atproto_did_lookup() {
        let (router, store) = app();
        bridged_web_user(&store, false, true);

        let (status, body) =
            get_text(router.clone(), "/.well-known/atproto-did?protocol=web&id=alice.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "did:plc:alice");

        let (status, _) =
            get_text(router.clone(), "/.well-known/atproto-did?protocol=web&id=other.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            get_text(router, "/.well-known/atproto-did?protocol=wrong&id=alice.com").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn client_metadata_and_no_oauth() {
        let (router, _) = app();
        let (status, body) = get_json(router.clone(), "/oauth/client-metadata.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["client_name"], "Bifrost");
        assert_eq!(body["client_uri"], "https://fed.brid.gy");

        let (status, _) = get_json(router, "/.well-known/oauth-authorization-server").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
