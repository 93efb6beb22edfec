use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use super::authserver::post_form;
use super::error::{OAuthError, OAuthResult};
use super::jwk::DpopKey;
use super::session::PendingAuthorizationRequest;
use super::store::SessionStore;
use super::utils::{generate_state, Pkce};
use super::{OAuthClientConfig, SCOPE};
use crate::did::{fetch_authorization_server, IdentityResolver};

/// Where to send the browser to finish logging in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub authorization_url: String,
    pub state: String,
    pub subject_id: String,
}

#[derive(Debug, Deserialize)]
struct ParResponse {
    request_uri: String,
}

#[derive(Clone)]
pub struct AuthorizationFlow {
    config: Arc<OAuthClientConfig>,
    http: reqwest::Client,
    identity: Arc<dyn IdentityResolver>,
    store: Arc<dyn SessionStore>,
}

impl AuthorizationFlow {
    pub fn new(
        config: Arc<OAuthClientConfig>,
        http: reqwest::Client,
        identity: Arc<dyn IdentityResolver>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            http,
            identity,
            store,
        }
    }

    /// Resolve `identifier`, push an authorization request to its
    /// authorization server and remember the flow under a fresh `state`.
    #[tracing::instrument(skip(self), err)]
    pub async fn start_login(&self, identifier: &str) -> OAuthResult<LoginRedirect> {
        self.push_authorization(identifier.trim())
            .await
            .map_err(|e| e.into_authorization_flow("unable to start login"))
    }

    async fn push_authorization(&self, identifier: &str) -> OAuthResult<LoginRedirect> {
        if identifier.is_empty() {
            return Err(OAuthError::flow("no handle provided"));
        }

        let subject_id = self
            .identity
            .resolve_subject_id(identifier)
            .await
            .map_err(|e| OAuthError::flow_with("failed to resolve handle", e))?;
        let resource_server_url = self
            .identity
            .resolve_resource_server_url(&subject_id)
            .await
            .map_err(|e| OAuthError::flow_with("failed to resolve PDS", e))?;
        let metadata = fetch_authorization_server(&self.http, &resource_server_url)
            .await
            .map_err(|e| OAuthError::flow_with("failed to fetch authorization server metadata", e))?;

        let key = DpopKey::generate();
        let pkce = Pkce::generate();
        let state = generate_state();

        let params = [
            ("response_type", "code"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", Pkce::METHOD),
            ("state", state.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("scope", SCOPE),
            ("login_hint", identifier),
        ];

        let response = post_form(
            &self.http,
            &self.config,
            &key,
            &metadata.issuer,
            &metadata.pushed_authorization_request_endpoint,
            &params,
            "",
        )
        .await?;
        let (par, auth_server_nonce): (ParResponse, String) = response
            .into_json()
            .map_err(|e| OAuthError::flow_with("pushed authorization request rejected", e))?;

        self.store
            .create_request(&PendingAuthorizationRequest {
                state: state.clone(),
                issuer: metadata.issuer.clone(),
                subject_id: subject_id.clone(),
                resource_server_url,
                token_endpoint: metadata.token_endpoint.clone(),
                request_uri: par.request_uri.clone(),
                pkce_verifier: pkce.verifier,
                auth_server_nonce,
                client_private_key: key.to_jwk_string(),
            })
            .await?;

        let authorization_url = format!(
            "{}?client_id={}&request_uri={}",
            metadata.authorization_endpoint,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&par.request_uri)
        );

        info!(subject_id = %subject_id, issuer = %metadata.issuer, "login started");

        Ok(LoginRedirect {
            authorization_url,
            state,
            subject_id,
        })
    }
}
