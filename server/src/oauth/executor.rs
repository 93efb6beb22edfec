use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::authserver::{dpop_nonce, ErrorBody, USE_DPOP_NONCE};
use super::dpop::build_dpop_proof;
use super::error::{OAuthResult, RequestError};
use super::jwk::DpopKey;
use super::manager::SessionManager;
use super::session::Session;

/// One nonce challenge is absorbed, a second one is not.
pub const MAX_ATTEMPTS: usize = 2;

/// What a single authenticated HTTP exchange amounted to.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(Value),
    /// The resource server wants a fresh proof signed with this nonce.
    NonceChallenge(String),
    Failed(RequestError),
}

/// Decide what a resource server response means for the retry loop.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> AttemptOutcome {
    if status.is_success() {
        if body.iter().all(u8::is_ascii_whitespace) {
            return AttemptOutcome::Success(Value::Null);
        }
        // the server already acted on the request, so an unreadable body is
        // not a failure
        return match serde_json::from_slice(body) {
            Ok(value) => AttemptOutcome::Success(value),
            Err(error) => {
                warn!(%status, %error, "ignoring undecodable success body");
                AttemptOutcome::Success(Value::Null)
            }
        };
    }

    let detail = ErrorBody::parse(body);
    if status == StatusCode::UNAUTHORIZED {
        let header_challenge = headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains(&format!("error=\"{USE_DPOP_NONCE}\"")));
        let body_challenge = detail.error.as_deref() == Some(USE_DPOP_NONCE);

        if header_challenge || body_challenge {
            if let Some(nonce) = dpop_nonce(headers) {
                return AttemptOutcome::NonceChallenge(nonce);
            }
        }
    }

    AttemptOutcome::Failed(RequestError::Status {
        status: status.as_u16(),
        message: detail.message(),
        error: detail.error,
    })
}

/// Sends DPoP-authenticated requests to a session's resource server.
#[derive(Clone)]
pub struct AuthenticatedRequestExecutor {
    http: reqwest::Client,
    sessions: SessionManager,
}

impl AuthenticatedRequestExecutor {
    pub fn new(http: reqwest::Client, sessions: SessionManager) -> Self {
        Self { http, sessions }
    }

    /// Execute `method url` with `payload` as a JSON body, retrying exactly
    /// once if the server answers with a DPoP nonce challenge.
    #[tracing::instrument(skip(self, session, payload), fields(subject_id = %session.subject_id), err)]
    pub async fn execute(
        &self,
        session: &Session,
        method: Method,
        url: &str,
        payload: Option<&Value>,
    ) -> OAuthResult<Value> {
        let key = DpopKey::from_jwk_str(&session.client_private_key)?;
        let mut nonce = session.dpop_resource_server_nonce.clone();

        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .attempt(&key, session, &method, url, payload, &nonce)
                .await?
            {
                AttemptOutcome::Success(value) => return Ok(value),
                AttemptOutcome::Failed(error) => return Err(error.into()),
                AttemptOutcome::NonceChallenge(fresh) => {
                    self.sessions
                        .record_resource_server_nonce(&session.subject_id, &fresh)
                        .await;
                    if attempt == MAX_ATTEMPTS {
                        warn!(url, "resource server challenged the retried request");
                        break;
                    }
                    debug!(url, "resource server issued a DPoP nonce, retrying");
                    nonce = fresh;
                }
            }
        }

        Err(RequestError::NonceRetryExhausted.into())
    }

    async fn attempt(
        &self,
        key: &DpopKey,
        session: &Session,
        method: &Method,
        url: &str,
        payload: Option<&Value>,
        nonce: &str,
    ) -> OAuthResult<AttemptOutcome> {
        let proof = build_dpop_proof(
            key,
            method.as_str(),
            url,
            Some(nonce),
            Some(&session.access_token),
        )?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("Authorization", format!("DPoP {}", session.access_token))
            .header("DPoP", proof)
            .header("Accept", "application/json");
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(AttemptOutcome::Failed(e.into())),
        };
        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Ok(AttemptOutcome::Failed(e.into())),
        };

        let outcome = classify(status, &headers, &body);
        if let AttemptOutcome::Success(_) = &outcome {
            // servers may rotate the nonce without challenging
            if let Some(fresh) = dpop_nonce(&headers).filter(|fresh| fresh != nonce) {
                self.sessions
                    .record_resource_server_nonce(&session.subject_id, &fresh)
                    .await;
            }
            info!(url, status = status.as_u16(), "authenticated request succeeded");
        }

        Ok(outcome)
    }
}
