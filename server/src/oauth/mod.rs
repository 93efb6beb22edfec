use std::sync::Arc;

use serde_json::{json, Value};

use crate::did::IdentityResolver;

pub mod authorize;
pub(crate) mod authserver;
pub mod db;
pub mod dpop;
pub mod error;
pub mod executor;
pub mod jwk;
pub mod manager;
pub mod session;
pub mod store;
pub mod token;
pub mod utils;

pub use authorize::{AuthorizationFlow, LoginRedirect};
pub use error::{OAuthError, OAuthResult, RequestError, SigningError, StoreError};
pub use executor::AuthenticatedRequestExecutor;
pub use jwk::{ClientKeys, DpopKey};
pub use manager::SessionManager;
pub use session::{PendingAuthorizationRequest, Session, SessionTokens};
pub use store::{MemorySessionStore, SessionStore};
pub use token::TokenExchange;

/// Scope requested on every login. Granted scope must match it exactly.
pub const SCOPE: &str = "atproto transition:generic";

/// Identity of this application as an OAuth client.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    /// URL of the client metadata document, which doubles as the client ID
    pub client_id: String,
    pub redirect_uri: String,
    pub client_uri: String,
    pub jwks_uri: String,
    pub client_name: String,
    pub client_keys: ClientKeys,
}

impl OAuthClientConfig {
    /// Derive every client URL from the public base URL of the app.
    pub fn for_host(host: &str, client_name: &str, client_keys: ClientKeys) -> Self {
        let host = host.trim_end_matches('/');
        Self {
            client_id: format!("{host}/client-metadata.json"),
            redirect_uri: format!("{host}/oauth-callback"),
            client_uri: host.to_string(),
            jwks_uri: format!("{host}/jwks.json"),
            client_name: client_name.to_string(),
            client_keys,
        }
    }

    /// Client metadata document served at `client_id`.
    pub fn client_metadata(&self) -> Value {
        json!({
            "client_id": self.client_id,
            "client_name": self.client_name,
            "client_uri": self.client_uri,
            "application_type": "web",
            "grant_types": ["authorization_code", "refresh_token"],
            "scope": SCOPE,
            "response_types": ["code"],
            "redirect_uris": [self.redirect_uri],
            "dpop_bound_access_tokens": true,
            "token_endpoint_auth_method": "private_key_jwt",
            "token_endpoint_auth_signing_alg": "ES256",
            "jwks_uri": self.jwks_uri,
        })
    }
}

/// Entry point wiring the login flow, token exchange, session manager and
/// request executor around one store and one HTTP client.
#[derive(Clone)]
pub struct OAuthClient {
    config: Arc<OAuthClientConfig>,
    flow: AuthorizationFlow,
    tokens: TokenExchange,
    sessions: SessionManager,
    executor: AuthenticatedRequestExecutor,
}

impl OAuthClient {
    pub fn new(
        config: OAuthClientConfig,
        http: reqwest::Client,
        identity: Arc<dyn IdentityResolver>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let config = Arc::new(config);
        let flow = AuthorizationFlow::new(config.clone(), http.clone(), identity, store.clone());
        let tokens = TokenExchange::new(config.clone(), http.clone(), store.clone());
        let sessions = SessionManager::new(store, tokens.clone());
        let executor = AuthenticatedRequestExecutor::new(http, sessions.clone());

        Self {
            config,
            flow,
            tokens,
            sessions,
            executor,
        }
    }

    pub fn config(&self) -> &OAuthClientConfig {
        &self.config
    }

    pub async fn start_login(&self, identifier: &str) -> OAuthResult<LoginRedirect> {
        self.flow.start_login(identifier).await
    }

    pub async fn complete_login(&self, state: &str, issuer: &str, code: &str) -> OAuthResult<String> {
        self.tokens.complete_login(state, issuer, code).await
    }

    pub async fn get_valid_session(&self, subject_id: &str) -> OAuthResult<Session> {
        self.sessions.get_valid_session(subject_id).await
    }

    pub async fn delete_session(&self, subject_id: &str) -> OAuthResult<()> {
        self.sessions.delete_session(subject_id).await
    }

    /// Send a DPoP-authenticated request on behalf of `session`.
    pub async fn execute(
        &self,
        session: &Session,
        method: reqwest::Method,
        url: &str,
        payload: Option<&Value>,
    ) -> OAuthResult<Value> {
        self.executor.execute(session, method, url, payload).await
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn executor(&self) -> &AuthenticatedRequestExecutor {
        &self.executor
    }

    pub fn client_metadata(&self) -> Value {
        self.config.client_metadata()
    }

    pub fn public_jwks(&self) -> Result<Value, SigningError> {
        self.config.client_keys.jwks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_metadata_describes_a_confidential_dpop_client() {
        let config = OAuthClientConfig::for_host(
            "https://status.example/",
            "Statusphere",
            ClientKeys::generate().unwrap(),
        );
        let metadata = config.client_metadata();

        assert_eq!(metadata["client_id"], "https://status.example/client-metadata.json");
        assert_eq!(metadata["redirect_uris"][0], "https://status.example/oauth-callback");
        assert_eq!(metadata["jwks_uri"], "https://status.example/jwks.json");
        assert_eq!(metadata["scope"], SCOPE);
        assert_eq!(metadata["dpop_bound_access_tokens"], true);
        assert_eq!(metadata["token_endpoint_auth_method"], "private_key_jwt");
    }
}
