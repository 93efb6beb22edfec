use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth_server::attach_nonce;
use crate::dpop::{verify_proof, ProofError};
use crate::state::{new_nonce, FixtureState};

pub const CREATE_RECORD_PATH: &str = "/xrpc/com.atproto.repo.createRecord";

pub fn router(state: FixtureState) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route(CREATE_RECORD_PATH, post(create_record))
        .with_state(state)
}

async fn protected_resource_metadata(State(state): State<FixtureState>) -> impl IntoResponse {
    Json(json!({
        "resource": state.pds_url,
        "authorization_servers": [state.issuer],
        "scopes_supported": [],
        "bearer_methods_supported": ["header"],
    }))
}

fn xrpc_error(status: StatusCode, error: &str, message: &str, nonce: &str) -> Response {
    let mut response = (status, Json(json!({ "error": error, "message": message }))).into_response();
    attach_nonce(response.headers_mut(), nonce);
    response
}

fn nonce_challenge(nonce: &str) -> Response {
    let mut response = xrpc_error(
        StatusCode::UNAUTHORIZED,
        "use_dpop_nonce",
        "Resource server requires nonce in DPoP proof",
        nonce,
    );
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(
            r#"DPoP error="use_dpop_nonce", error_description="Resource server requires nonce in DPoP proof""#,
        ),
    );
    response
}

#[derive(Debug, Deserialize)]
struct CreateRecordInput {
    repo: String,
    collection: String,
    record: Value,
}

async fn create_record(
    State(state): State<FixtureState>,
    headers: HeaderMap,
    Json(input): Json<CreateRecordInput>,
) -> Response {
    let mut inner = state.lock();
    inner.stats.create_record_requests += 1;

    if inner.settings.always_rotate_pds_nonce {
        inner.pds_nonce = new_nonce();
        inner.stats.pds_nonce_challenges += 1;
        return nonce_challenge(&inner.pds_nonce);
    }
    let nonce = inner.pds_nonce.clone();

    let Some(access_token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("DPoP "))
        .map(str::to_string)
    else {
        return xrpc_error(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "DPoP access token required",
            &nonce,
        );
    };

    let Some(grant) = inner.access_tokens.get(&access_token).cloned() else {
        return xrpc_error(StatusCode::UNAUTHORIZED, "invalid_token", "unknown token", &nonce);
    };
    if grant.expires_at <= Utc::now().timestamp() {
        return xrpc_error(StatusCode::UNAUTHORIZED, "invalid_token", "token expired", &nonce);
    }

    let url = format!("{}{CREATE_RECORD_PATH}", state.pds_url);
    let proof = verify_proof(
        &headers,
        "POST",
        &url,
        &nonce,
        Some(&access_token),
        &mut inner.seen_jtis,
    );
    match proof {
        Ok(proof) if proof.jkt != grant.jkt => {
            return xrpc_error(
                StatusCode::UNAUTHORIZED,
                "invalid_dpop_proof",
                "proof key does not match token binding",
                &nonce,
            )
        }
        Ok(_) => {}
        Err(ProofError::UseNonce) => {
            inner.stats.pds_nonce_challenges += 1;
            return nonce_challenge(&nonce);
        }
        Err(e) => {
            return xrpc_error(
                StatusCode::UNAUTHORIZED,
                "invalid_dpop_proof",
                &e.description(),
                &nonce,
            )
        }
    }

    if input.repo != grant.sub {
        return xrpc_error(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "repo does not belong to the token subject",
            &nonce,
        );
    }
    if input.record.get("$type").and_then(Value::as_str) != Some(input.collection.as_str()) {
        return xrpc_error(
            StatusCode::BAD_REQUEST,
            "InvalidRecord",
            "record $type must match collection",
            &nonce,
        );
    }

    let rkey = Uuid::new_v4().simple().to_string();
    let uri = format!("at://{}/{}/{rkey}", input.repo, input.collection);
    inner.records.push(json!({ "uri": uri, "value": input.record }));
    info!(%uri, "PDS: created record");

    let mut response = Json(json!({
        "uri": uri,
        "cid": "bafyreib3hg56hnxcysikiv5rsr2okgujajrjrpz4kpf7se52jgygyz7d7u",
    }))
    .into_response();
    attach_nonce(response.headers_mut(), &nonce);
    response
}
