mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{authorize, setup, setup_with_store};
use fixtures::{DEFAULT_DID, DEFAULT_HANDLE};
use statusphere::oauth::{
    store::MemorySessionStore, OAuthError, PendingAuthorizationRequest, Session, SessionStore,
    SessionTokens, StoreError, SCOPE,
};

/// Hands control back to the scheduler after every pending request lookup,
/// so concurrent callbacks interleave between lookup and delete.
struct YieldingStore(Arc<MemorySessionStore>);

#[async_trait]
impl SessionStore for YieldingStore {
    async fn create_request(
        &self,
        request: &PendingAuthorizationRequest,
    ) -> Result<(), StoreError> {
        self.0.create_request(request).await
    }

    async fn get_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorizationRequest>, StoreError> {
        let request = self.0.get_request(state).await;
        tokio::task::yield_now().await;
        request
    }

    async fn delete_request(&self, state: &str) -> Result<bool, StoreError> {
        self.0.delete_request(state).await
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.0.create_session(session).await
    }

    async fn get_session(&self, subject_id: &str) -> Result<Option<Session>, StoreError> {
        self.0.get_session(subject_id).await
    }

    async fn update_session_tokens(
        &self,
        subject_id: &str,
        tokens: &SessionTokens,
    ) -> Result<(), StoreError> {
        self.0.update_session_tokens(subject_id, tokens).await
    }

    async fn update_session_resource_nonce(
        &self,
        subject_id: &str,
        nonce: &str,
    ) -> Result<(), StoreError> {
        self.0.update_session_resource_nonce(subject_id, nonce).await
    }

    async fn delete_session(&self, subject_id: &str) -> Result<(), StoreError> {
        self.0.delete_session(subject_id).await
    }
}

#[tokio::test]
async fn test_login_creates_a_session() {
    let app = setup().await;

    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    assert_eq!(redirect.subject_id, DEFAULT_DID);
    assert!(redirect
        .authorization_url
        .starts_with(&format!("{}/oauth/authorize?client_id=", app.network.base_url)));
    assert_eq!(app.store.request_count(), 1);

    let callback = authorize(&redirect).await;
    assert_eq!(callback.state, redirect.state);
    assert_eq!(callback.iss, app.network.base_url);

    let subject = app
        .oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap();
    assert_eq!(subject, DEFAULT_DID);
    assert_eq!(app.store.request_count(), 0);

    let session = app.store.get_session(DEFAULT_DID).await.unwrap().unwrap();
    assert_eq!(session.resource_server_url, app.network.base_url);
    assert_eq!(session.issuer, app.network.base_url);
    assert_eq!(session.token_endpoint, format!("{}/oauth/token", app.network.base_url));
    assert!(!session.refresh_token.is_empty());
    assert_eq!(
        session.dpop_auth_server_nonce,
        app.network.state.auth_server_nonce()
    );
    assert_eq!(session.dpop_resource_server_nonce, "");

    let stats = app.network.state.stats();
    // the first PAR is challenged for a nonce, the token request reuses it
    assert_eq!(stats.par_requests, 2);
    assert_eq!(stats.auth_server_nonce_challenges, 1);
    assert_eq!(stats.authorization_code_grants, 1);
}

#[tokio::test]
async fn test_login_with_a_did_skips_handle_resolution() {
    let app = setup().await;

    let redirect = app.oauth.start_login(DEFAULT_DID).await.unwrap();
    assert_eq!(redirect.subject_id, DEFAULT_DID);
}

#[tokio::test]
async fn test_unknown_handle_fails_without_storing_anything() {
    let app = setup().await;

    let err = app.oauth.start_login("nobody.test").await.unwrap_err();
    assert!(matches!(err, OAuthError::AuthorizationFlow { .. }), "{err:?}");
    assert_eq!(app.store.request_count(), 0);

    let err = app.oauth.start_login("   ").await.unwrap_err();
    assert!(matches!(err, OAuthError::AuthorizationFlow { .. }), "{err:?}");
}

#[tokio::test]
async fn test_unknown_state_is_not_found() {
    let app = setup().await;

    let err = app
        .oauth
        .complete_login("never-issued", &app.network.base_url, "code")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
}

#[tokio::test]
async fn test_state_can_only_be_used_once() {
    let app = setup().await;
    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;

    app.oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap();
    let err = app
        .oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
}

#[tokio::test]
async fn test_concurrent_callbacks_exchange_the_code_once() {
    let app = setup_with_store(|store| Arc::new(YieldingStore(store)) as Arc<dyn SessionStore>).await;
    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;

    let (first, second) = tokio::join!(
        app.oauth
            .complete_login(&callback.state, &callback.iss, &callback.code),
        app.oauth
            .complete_login(&callback.state, &callback.iss, &callback.code),
    );

    let (winner, loser) = match (first, second) {
        (Ok(subject), Err(err)) | (Err(err), Ok(subject)) => (subject, err),
        other => panic!("expected exactly one successful callback, got {other:?}"),
    };
    assert_eq!(winner, DEFAULT_DID);
    assert!(loser.is_not_found(), "{loser:?}");
    assert_eq!(app.network.state.stats().authorization_code_grants, 1);
    assert!(app.store.get_session(DEFAULT_DID).await.unwrap().is_some());
}

#[tokio::test]
async fn test_out_of_range_expiry_fails_the_login() {
    let app = setup().await;
    app.network
        .state
        .update_settings(|s| s.access_token_lifetime = 100_000_000_000_000_000);

    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;
    let err = app
        .oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap_err();

    assert!(matches!(err, OAuthError::AuthorizationFlow { .. }), "{err:?}");
    assert!(app.store.get_session(DEFAULT_DID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_issuer_mismatch_consumes_the_request() {
    let app = setup().await;
    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;

    let err = app
        .oauth
        .complete_login(&callback.state, "https://evil.example", &callback.code)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::AuthorizationFlow { .. }), "{err:?}");
    assert_eq!(app.network.state.stats().authorization_code_grants, 0);

    let err = app
        .oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
}

#[tokio::test]
async fn test_rejected_code_is_an_authorization_flow_error() {
    let app = setup().await;
    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;

    let err = app
        .oauth
        .complete_login(&callback.state, &callback.iss, "not-the-code")
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::AuthorizationFlow { .. }), "{err:?}");
    assert!(app.store.get_session(DEFAULT_DID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scope_mismatch_is_rejected() {
    let app = setup().await;
    app.network
        .state
        .update_settings(|s| s.granted_scope = Some("atproto".to_string()));

    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;
    let err = app
        .oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap_err();

    match err {
        OAuthError::ScopeMismatch { requested, granted } => {
            assert_eq!(requested, SCOPE);
            assert_eq!(granted, "atproto");
        }
        other => panic!("expected ScopeMismatch, got {other:?}"),
    }
    assert!(app.store.get_session(DEFAULT_DID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_token_request_recovers_from_a_rotated_nonce() {
    let app = setup().await;
    let redirect = app.oauth.start_login(DEFAULT_HANDLE).await.unwrap();
    let callback = authorize(&redirect).await;

    let rotated = app.network.state.rotate_auth_server_nonce();
    app.oauth
        .complete_login(&callback.state, &callback.iss, &callback.code)
        .await
        .unwrap();

    let session = app.store.get_session(DEFAULT_DID).await.unwrap().unwrap();
    assert_eq!(session.dpop_auth_server_nonce, rotated);
    assert_eq!(app.network.state.stats().auth_server_nonce_challenges, 2);
}

#[tokio::test]
async fn test_second_login_keeps_the_existing_session() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let first = app.store.get_session(DEFAULT_DID).await.unwrap().unwrap();

    app.login(DEFAULT_HANDLE).await;
    let second = app.store.get_session(DEFAULT_DID).await.unwrap().unwrap();

    assert_eq!(second.access_token, first.access_token);
    assert_eq!(second.client_private_key, first.client_private_key);
}
