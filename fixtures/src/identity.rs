use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::info;

use crate::state::FixtureState;

/// `com.atproto.identity.resolveHandle`, as served by an AppView.
pub fn handle_router(state: FixtureState) -> Router {
    Router::new()
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(resolve_handle),
        )
        .with_state(state)
}

/// PLC directory: `GET /{did}` returns the DID document.
pub fn plc_router(state: FixtureState) -> Router {
    Router::new()
        .route("/:did", get(resolve_did))
        .with_state(state)
}

async fn resolve_handle(
    State(state): State<FixtureState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let handle = params.get("handle").map(String::as_str).unwrap_or_default();
    match state.account_by_handle(handle) {
        Some(account) => {
            info!(handle, did = %account.did, "APPVIEW: resolved handle");
            Json(json!({ "did": account.did })).into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "InvalidRequest", "message": "Unable to resolve handle" })),
        )
            .into_response(),
    }
}

async fn resolve_did(State(state): State<FixtureState>, Path(did): Path<String>) -> Response {
    let Some(account) = state.account_by_did(&did) else {
        return (StatusCode::NOT_FOUND, format!("DID not registered: {did}")).into_response();
    };

    Json(json!({
        "@context": [
            "https://www.w3.org/ns/did/v1",
            "https://w3id.org/security/multikey/v1"
        ],
        "id": account.did,
        "alsoKnownAs": [format!("at://{}", account.handle)],
        "verificationMethod": [{
            "id": format!("{}#atproto", account.did),
            "type": "Multikey",
            "controller": account.did,
            "publicKeyMultibase": "zQ3shXjHeiBuRCKmM36cuYnm7YEMzhGnCmCyW92sRJ9pribSF"
        }],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": state.pds_url
        }]
    }))
    .into_response()
}
