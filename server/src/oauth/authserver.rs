use reqwest::{header::HeaderMap, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::dpop::{build_dpop_proof, create_client_assertion, CLIENT_ASSERTION_TYPE};
use super::error::{OAuthError, RequestError};
use super::jwk::DpopKey;
use super::OAuthClientConfig;

pub(crate) const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";
pub(crate) const USE_DPOP_NONCE: &str = "use_dpop_nonce";

/// OAuth error body shared by authorization and resource servers.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
}

impl ErrorBody {
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    pub fn message(&self) -> Option<String> {
        self.message.clone().or_else(|| self.error_description.clone())
    }
}

pub(crate) fn dpop_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DPOP_NONCE_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
}

/// A completed exchange with an authorization server.
#[derive(Debug)]
pub(crate) struct AuthServerResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    /// Latest nonce the server handed out, or the one we sent if it gave none
    pub nonce: String,
}

impl AuthServerResponse {
    pub fn into_json<T: serde::de::DeserializeOwned>(self) -> Result<(T, String), RequestError> {
        if !self.status.is_success() {
            let detail = ErrorBody::parse(&self.body);
            return Err(RequestError::Status {
                status: self.status.as_u16(),
                message: detail.message(),
                error: detail.error,
            });
        }

        let parsed = serde_json::from_slice(&self.body)
            .map_err(|e| RequestError::Body(e.to_string()))?;
        Ok((parsed, self.nonce))
    }
}

/// POST a form to an authorization server endpoint with client
/// authentication and a DPoP proof.
///
/// A `400 use_dpop_nonce` reply carrying a fresh `DPoP-Nonce` is answered by
/// re-signing with that nonce exactly once.
pub(crate) async fn post_form(
    http: &reqwest::Client,
    config: &OAuthClientConfig,
    key: &DpopKey,
    issuer: &str,
    endpoint: &str,
    params: &[(&str, &str)],
    nonce: &str,
) -> Result<AuthServerResponse, OAuthError> {
    let first = send_once(http, config, key, issuer, endpoint, params, nonce).await?;

    let retry_nonce = first
        .nonce
        .clone()
        .filter(|fresh| first.is_nonce_challenge() && fresh != nonce);
    let Some(retry_nonce) = retry_nonce else {
        return Ok(first.finish(nonce));
    };

    debug!(endpoint, "authorization server issued a DPoP nonce, retrying");
    let second = send_once(http, config, key, issuer, endpoint, params, &retry_nonce).await?;
    if second.is_nonce_challenge() {
        warn!(endpoint, "authorization server repeated its DPoP nonce challenge");
    }

    Ok(second.finish(&retry_nonce))
}

struct RawResponse {
    status: StatusCode,
    nonce: Option<String>,
    body: Vec<u8>,
}

impl RawResponse {
    fn is_nonce_challenge(&self) -> bool {
        self.status == StatusCode::BAD_REQUEST
            && ErrorBody::parse(&self.body).error.as_deref() == Some(USE_DPOP_NONCE)
    }

    fn finish(self, sent_nonce: &str) -> AuthServerResponse {
        AuthServerResponse {
            status: self.status,
            body: self.body,
            nonce: self.nonce.unwrap_or_else(|| sent_nonce.to_string()),
        }
    }
}

async fn send_once(
    http: &reqwest::Client,
    config: &OAuthClientConfig,
    key: &DpopKey,
    issuer: &str,
    endpoint: &str,
    params: &[(&str, &str)],
    nonce: &str,
) -> Result<RawResponse, OAuthError> {
    let client_assertion = create_client_assertion(&config.client_keys, &config.client_id, issuer)?;
    let proof = build_dpop_proof(key, "POST", endpoint, Some(nonce), None)?;

    let mut form: Vec<(&str, &str)> = params.to_vec();
    form.push(("client_id", config.client_id.as_str()));
    form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
    form.push(("client_assertion", client_assertion.as_str()));

    debug!(endpoint, "sending authorization server request");
    let response = http
        .post(endpoint)
        .header("DPoP", proof)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(RequestError::from)?;

    let status = response.status();
    let nonce = dpop_nonce(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(RequestError::from)?
        .to_vec();

    Ok(RawResponse {
        status,
        nonce,
        body,
    })
}
