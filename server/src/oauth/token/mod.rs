use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound as _, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::authserver::post_form;
use super::error::{OAuthError, OAuthResult};
use super::jwk::DpopKey;
use super::session::{Session, SessionTokens};
use super::store::SessionStore;
use super::{OAuthClientConfig, SCOPE};

/// Token endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// The token type (usually "DPoP" for atproto)
    #[serde(default)]
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
    /// The account DID this token is associated with
    #[serde(default)]
    pub sub: Option<String>,
}

impl TokenResponse {
    fn scope_matches(&self) -> bool {
        self.scope == SCOPE
    }

    /// Absolute expiry of the access token, at the microsecond precision
    /// Postgres keeps. `None` when `expires_in` is negative or out of range.
    fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.expires_in < 0 {
            return None;
        }
        let lifetime = Duration::try_seconds(self.expires_in)?;
        now.checked_add_signed(lifetime)
            .map(|expires_at| expires_at.trunc_subsecs(6))
    }
}

/// Completes authorization code exchanges and refreshes sessions.
#[derive(Clone)]
pub struct TokenExchange {
    config: Arc<OAuthClientConfig>,
    http: reqwest::Client,
    store: Arc<dyn SessionStore>,
}

impl TokenExchange {
    pub fn new(
        config: Arc<OAuthClientConfig>,
        http: reqwest::Client,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            http,
            store,
        }
    }

    /// Redeem the authorization code returned to the callback and persist the
    /// resulting session. Returns the subject the session belongs to.
    ///
    /// The pending request is deleted before the exchange, so a `state` can
    /// be used at most once even when the exchange fails.
    #[tracing::instrument(skip(self, code), err)]
    pub async fn complete_login(&self, state: &str, issuer: &str, code: &str) -> OAuthResult<String> {
        let request = self
            .store
            .get_request(state)
            .await?
            .ok_or_else(|| OAuthError::NotFound("authorization request".into()))?;
        // a concurrent callback for the same state may have consumed it first
        if !self.store.delete_request(state).await? {
            return Err(OAuthError::NotFound("authorization request".into()));
        }

        let key = DpopKey::from_jwk_str(&request.client_private_key)?;

        if issuer != request.issuer {
            return Err(OAuthError::flow(format!(
                "callback issuer {issuer} does not match {}",
                request.issuer
            )));
        }

        let response = post_form(
            &self.http,
            &self.config,
            &key,
            &request.issuer,
            &request.token_endpoint,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_verifier", request.pkce_verifier.as_str()),
            ],
            &request.auth_server_nonce,
        )
        .await
        .map_err(|e| e.into_authorization_flow("unable to complete login"))?;
        let (tokens, auth_server_nonce): (TokenResponse, String) = response
            .into_json()
            .map_err(|e| OAuthError::flow_with("authorization code exchange rejected", e))?;

        if !tokens.scope_matches() {
            warn!(granted = %tokens.scope, "authorization server granted unexpected scope");
            return Err(OAuthError::ScopeMismatch {
                requested: SCOPE.to_string(),
                granted: tokens.scope,
            });
        }

        let subject_id = match (&tokens.sub, request.subject_id.as_str()) {
            (Some(sub), "") => sub.clone(),
            (Some(sub), expected) if sub != expected => {
                return Err(OAuthError::flow(format!(
                    "token subject {sub} does not match {expected}"
                )));
            }
            (_, expected) => expected.to_string(),
        };
        if subject_id.is_empty() {
            return Err(OAuthError::flow("token response did not name a subject"));
        }

        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| OAuthError::flow("token response did not include a refresh token"))?;
        let expires_at = tokens.expires_at(Utc::now()).ok_or_else(|| {
            OAuthError::flow(format!("token response has invalid expires_in {}", tokens.expires_in))
        })?;

        self.store
            .create_session(&Session {
                subject_id: subject_id.clone(),
                resource_server_url: request.resource_server_url,
                issuer: request.issuer,
                token_endpoint: request.token_endpoint,
                access_token: tokens.access_token,
                refresh_token,
                dpop_auth_server_nonce: auth_server_nonce,
                dpop_resource_server_nonce: String::new(),
                client_private_key: request.client_private_key,
                expires_at,
            })
            .await?;

        info!(subject_id = %subject_id, "login completed");
        Ok(subject_id)
    }

    /// Trade the session's refresh token for a new token pair.
    ///
    /// Every failure is reported as [`OAuthError::Refresh`].
    #[tracing::instrument(skip_all, fields(subject_id = %session.subject_id), err)]
    pub async fn refresh(&self, session: &Session) -> OAuthResult<SessionTokens> {
        self.refresh_inner(session)
            .await
            .map_err(OAuthError::into_refresh)
    }

    async fn refresh_inner(&self, session: &Session) -> OAuthResult<SessionTokens> {
        let key = DpopKey::from_jwk_str(&session.client_private_key)?;

        let response = post_form(
            &self.http,
            &self.config,
            &key,
            &session.issuer,
            &session.token_endpoint,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", session.refresh_token.as_str()),
            ],
            &session.dpop_auth_server_nonce,
        )
        .await?;
        let (tokens, auth_server_nonce): (TokenResponse, String) = response.into_json()?;

        if let Some(sub) = &tokens.sub {
            if sub != &session.subject_id {
                return Err(OAuthError::refresh(format!(
                    "refreshed token belongs to {sub}"
                )));
            }
        }
        if !tokens.scope_matches() {
            return Err(OAuthError::refresh(format!(
                "refresh granted scope {:?}",
                tokens.scope
            )));
        }

        let expires_at = tokens.expires_at(Utc::now()).ok_or_else(|| {
            OAuthError::refresh(format!("refresh returned invalid expires_in {}", tokens.expires_in))
        })?;

        info!(subject_id = %session.subject_id, "session refreshed");
        Ok(SessionTokens {
            access_token: tokens.access_token,
            // servers that do not rotate refresh tokens omit them
            refresh_token: tokens
                .refresh_token
                .unwrap_or_else(|| session.refresh_token.clone()),
            dpop_auth_server_nonce: auth_server_nonce,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Timelike as _;

    use super::*;

    #[test]
    fn token_response_tolerates_missing_optional_fields() {
        let parsed: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "expires_in": 3600,
        }))
        .unwrap();

        assert_eq!(parsed.access_token, "at");
        assert!(parsed.refresh_token.is_none());
        assert!(!parsed.scope_matches());
    }

    #[test]
    fn scope_must_match_exactly() {
        let mut parsed: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "expires_in": 3600,
            "scope": "transition:generic atproto",
        }))
        .unwrap();
        assert!(!parsed.scope_matches());

        parsed.scope = SCOPE.to_string();
        assert!(parsed.scope_matches());
    }

    fn response_expiring_in(expires_in: i64) -> TokenResponse {
        serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "expires_in": expires_in,
        }))
        .unwrap()
    }

    #[test]
    fn expiry_is_kept_at_microsecond_precision() {
        let now = Utc::now().with_nanosecond(123_456_789).unwrap();

        let expires_at = response_expiring_in(3600).expires_at(now).unwrap();

        assert_eq!(expires_at.nanosecond() % 1_000, 0);
        assert_eq!(expires_at.nanosecond(), 123_456_000);
        assert_eq!(expires_at.timestamp(), now.timestamp() + 3600);
    }

    #[test]
    fn unusable_expires_in_has_no_expiry() {
        let now = Utc::now();

        assert!(response_expiring_in(-1).expires_at(now).is_none());
        assert!(response_expiring_in(i64::MAX).expires_at(now).is_none());
        assert!(response_expiring_in(100_000_000_000_000_000).expires_at(now).is_none());
        assert!(response_expiring_in(0).expires_at(now).is_some());
    }
}
