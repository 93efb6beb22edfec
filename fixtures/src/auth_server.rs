use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dpop::{check_client_assertion, sha256_b64, verify_proof, ProofError};
use crate::state::{AuthorizationCode, FixtureState, Grant, ParRequest};

pub const PAR_PATH: &str = "/oauth/par";
pub const AUTHORIZE_PATH: &str = "/oauth/authorize";
pub const TOKEN_PATH: &str = "/oauth/token";

pub fn router(state: FixtureState) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route(PAR_PATH, post(pushed_authorization_request))
        .route(AUTHORIZE_PATH, get(authorize))
        .route(TOKEN_PATH, post(token))
        .with_state(state)
}

async fn authorization_server_metadata(State(state): State<FixtureState>) -> impl IntoResponse {
    let base = &state.issuer;
    Json(json!({
        "issuer": base,
        "pushed_authorization_request_endpoint": format!("{base}{PAR_PATH}"),
        "authorization_endpoint": format!("{base}{AUTHORIZE_PATH}"),
        "token_endpoint": format!("{base}{TOKEN_PATH}"),
        "scopes_supported": ["atproto", "transition:generic"],
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
        "token_endpoint_auth_signing_alg_values_supported": ["ES256"],
        "dpop_signing_alg_values_supported": ["ES256"],
        "require_pushed_authorization_requests": true,
        "client_id_metadata_document_supported": true
    }))
}

/// OAuth error response carrying the current nonce, as every AS reply does.
fn oauth_error(status: StatusCode, error: &str, description: &str, nonce: &str) -> Response {
    let mut response = (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response();
    attach_nonce(response.headers_mut(), nonce);
    response
}

pub(crate) fn attach_nonce(headers: &mut HeaderMap, nonce: &str) {
    if let Ok(value) = HeaderValue::from_str(nonce) {
        headers.insert("DPoP-Nonce", value);
    }
}

/// Client authentication plus DPoP proof, shared by the PAR and token
/// endpoints. Returns the client id and the proof key thumbprint.
fn authenticate(
    state: &FixtureState,
    headers: &HeaderMap,
    form: &HashMap<String, String>,
    path: &str,
) -> Result<(String, String), Response> {
    let mut inner = state.lock();
    let nonce = inner.auth_server_nonce.clone();

    let client_id = check_client_assertion(form, &state.issuer)
        .map_err(|e| oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", &e, &nonce))?;

    let url = format!("{}{path}", state.issuer);
    match verify_proof(headers, "POST", &url, &nonce, None, &mut inner.seen_jtis) {
        Ok(proof) => Ok((client_id, proof.jkt)),
        Err(ProofError::UseNonce) => {
            inner.stats.auth_server_nonce_challenges += 1;
            Err(oauth_error(
                StatusCode::BAD_REQUEST,
                "use_dpop_nonce",
                &ProofError::UseNonce.description(),
                &nonce,
            ))
        }
        Err(e) => Err(oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_dpop_proof",
            &e.description(),
            &nonce,
        )),
    }
}

fn param<'a>(form: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    form.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

async fn pushed_authorization_request(
    State(state): State<FixtureState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.lock().stats.par_requests += 1;
    let (client_id, jkt) = match authenticate(&state, &headers, &form, PAR_PATH) {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let nonce = state.auth_server_nonce();

    let (Some(redirect_uri), Some(request_state), Some(code_challenge)) = (
        param(&form, "redirect_uri"),
        param(&form, "state"),
        param(&form, "code_challenge"),
    ) else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri, state and code_challenge are required",
            &nonce,
        );
    };
    if param(&form, "response_type") != Some("code")
        || param(&form, "code_challenge_method") != Some("S256")
    {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "only response_type=code with S256 PKCE is supported",
            &nonce,
        );
    }

    let request_uri = format!("urn:ietf:params:oauth:request_uri:req-{}", Uuid::new_v4().simple());
    state.lock().par_requests.insert(
        request_uri.clone(),
        ParRequest {
            client_id,
            redirect_uri: redirect_uri.to_string(),
            state: request_state.to_string(),
            code_challenge: code_challenge.to_string(),
            scope: param(&form, "scope").unwrap_or_default().to_string(),
            login_hint: param(&form, "login_hint").map(str::to_string),
            jkt,
        },
    );
    info!(%request_uri, "AS: accepted pushed authorization request");

    let mut response = (
        StatusCode::CREATED,
        Json(json!({ "request_uri": request_uri, "expires_in": 299 })),
    )
        .into_response();
    attach_nonce(response.headers_mut(), &nonce);
    response
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    request_uri: String,
}

#[derive(Serialize)]
struct CallbackParams<'a> {
    code: &'a str,
    state: &'a str,
    iss: &'a str,
}

/// Approves every request immediately and sends the browser back to the
/// client's redirect URI.
async fn authorize(State(state): State<FixtureState>, Query(query): Query<AuthorizeQuery>) -> Response {
    let Some(request) = state.lock().par_requests.remove(&query.request_uri) else {
        return (StatusCode::BAD_REQUEST, "unknown or expired request_uri").into_response();
    };
    if request.client_id != query.client_id {
        return (StatusCode::BAD_REQUEST, "client_id does not match request").into_response();
    }

    let account = request
        .login_hint
        .as_deref()
        .and_then(|hint| state.account_by_handle(hint).or_else(|| state.account_by_did(hint)))
        .or_else(|| state.lock().accounts.first().cloned());
    let Some(account) = account else {
        return (StatusCode::BAD_REQUEST, "no account to log in as").into_response();
    };

    let code = format!("cod-{}", Uuid::new_v4().simple());
    state.lock().codes.insert(
        code.clone(),
        AuthorizationCode {
            client_id: request.client_id,
            redirect_uri: request.redirect_uri.clone(),
            code_challenge: request.code_challenge,
            scope: request.scope,
            sub: account.did,
            jkt: request.jkt,
        },
    );

    let query = match serde_urlencoded::to_string(CallbackParams {
        code: &code,
        state: &request.state,
        iss: &state.issuer,
    }) {
        Ok(query) => query,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    Redirect::to(&format!("{}?{query}", request.redirect_uri)).into_response()
}

async fn token(
    State(state): State<FixtureState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (client_id, jkt) = match authenticate(&state, &headers, &form, TOKEN_PATH) {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let nonce = state.auth_server_nonce();
    let invalid_grant =
        |description: &str| oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", description, &nonce);

    let grant = match param(&form, "grant_type") {
        Some("authorization_code") => {
            state.lock().stats.authorization_code_grants += 1;
            let Some(code) = param(&form, "code").and_then(|c| state.lock().codes.remove(c)) else {
                return invalid_grant("unknown authorization code");
            };
            if code.client_id != client_id || Some(code.redirect_uri.as_str()) != param(&form, "redirect_uri") {
                return invalid_grant("client_id or redirect_uri mismatch");
            }
            let verifier = param(&form, "code_verifier").unwrap_or_default();
            if sha256_b64(verifier) != code.code_challenge {
                return invalid_grant("PKCE verification failed");
            }
            if code.jkt != jkt {
                return invalid_grant("DPoP key differs from the one used for PAR");
            }
            Grant {
                client_id,
                scope: code.scope,
                sub: code.sub,
                jkt,
                expires_at: 0,
            }
        }
        Some("refresh_token") => {
            let (fail, delay) = {
                let mut inner = state.lock();
                inner.stats.refresh_grants += 1;
                (inner.settings.fail_refresh, inner.settings.refresh_delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return invalid_grant("refresh token revoked");
            }
            let Some(previous) =
                param(&form, "refresh_token").and_then(|t| state.lock().refresh_tokens.remove(t))
            else {
                return invalid_grant("unknown refresh token");
            };
            if previous.client_id != client_id || previous.jkt != jkt {
                warn!("AS: refresh token presented by a different client or key");
                return invalid_grant("refresh token is bound to another client or key");
            }
            previous
        }
        _ => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                "unsupported grant_type",
                &nonce,
            )
        }
    };

    let body = {
        let mut inner = state.lock();
        let lifetime = inner.settings.access_token_lifetime;
        let scope = inner
            .settings
            .granted_scope
            .clone()
            .unwrap_or_else(|| grant.scope.clone());
        let access_token = format!("at-{}", Uuid::new_v4().simple());
        let refresh_token = format!("rt-{}", Uuid::new_v4().simple());
        let issued = Grant {
            expires_at: Utc::now().timestamp() + lifetime,
            scope: scope.clone(),
            ..grant
        };
        inner.access_tokens.insert(access_token.clone(), issued.clone());
        inner.refresh_tokens.insert(refresh_token.clone(), issued.clone());

        json!({
            "access_token": access_token,
            "token_type": "DPoP",
            "expires_in": lifetime,
            "refresh_token": refresh_token,
            "scope": scope,
            "sub": issued.sub,
        })
    };

    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    attach_nonce(response.headers_mut(), &nonce);
    response
}
