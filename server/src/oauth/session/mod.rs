use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sessions whose access token expires within this window are refreshed
/// before use.
pub const REFRESH_MARGIN: Duration = Duration::minutes(5);

/// State persisted between pushing an authorization request and the
/// callback that completes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorizationRequest {
    pub state: String,
    pub issuer: String,
    /// The user's DID, empty when the login started from an unresolved
    /// identifier
    pub subject_id: String,
    pub resource_server_url: String,
    pub token_endpoint: String,
    pub request_uri: String,
    /// PKCE code verifier - the original random string
    pub pkce_verifier: String,
    pub auth_server_nonce: String,
    /// Private JWK of the DPoP key generated for this flow
    pub client_private_key: String,
}

/// A DPoP-bound login for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: String,
    pub resource_server_url: String,
    pub issuer: String,
    pub token_endpoint: String,
    pub access_token: String,
    pub refresh_token: String,
    pub dpop_auth_server_nonce: String,
    pub dpop_resource_server_nonce: String,
    pub client_private_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful refresh, applied in place to a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub dpop_auth_server_nonce: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + REFRESH_MARGIN
    }

    pub fn apply_tokens(&mut self, tokens: SessionTokens) {
        self.access_token = tokens.access_token;
        self.refresh_token = tokens.refresh_token;
        self.dpop_auth_server_nonce = tokens.dpop_auth_server_nonce;
        self.expires_at = tokens.expires_at;
    }
}
