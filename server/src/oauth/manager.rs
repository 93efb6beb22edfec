use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::{OAuthError, OAuthResult};
use super::session::Session;
use super::store::SessionStore;
use super::token::TokenExchange;

/// Hands out sessions with an access token that is good for at least the
/// refresh margin, refreshing at most once per subject at a time.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    tokens: TokenExchange,
    refresh_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, tokens: TokenExchange) -> Self {
        Self {
            store,
            tokens,
            refresh_locks: Arc::new(DashMap::new()),
        }
    }

    async fn load(&self, subject_id: &str) -> OAuthResult<Session> {
        self.store
            .get_session(subject_id)
            .await?
            .ok_or_else(|| OAuthError::NotFound(format!("session for {subject_id}")))
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_valid_session(&self, subject_id: &str) -> OAuthResult<Session> {
        let session = self.load(subject_id).await?;
        if !session.needs_refresh(Utc::now()) {
            return Ok(session);
        }

        let lock = self
            .refresh_locks
            .entry(subject_id.to_string())
            .or_default()
            .clone();
        let refreshed = self.refresh_locked(subject_id, &lock).await;

        drop(lock);
        self.refresh_locks
            .remove_if(subject_id, |_, lock| Arc::strong_count(lock) == 1);

        refreshed
    }

    async fn refresh_locked(&self, subject_id: &str, lock: &Mutex<()>) -> OAuthResult<Session> {
        let _guard = lock.lock().await;

        // a concurrent caller may have refreshed while we waited
        let mut session = self.load(subject_id).await?;
        if session.needs_refresh(Utc::now()) {
            debug!(expires_at = %session.expires_at, "refreshing session");
            let tokens = self.tokens.refresh(&session).await?;
            self.store.update_session_tokens(subject_id, &tokens).await?;
            session.apply_tokens(tokens);
        }
        Ok(session)
    }

    /// Persist a resource server nonce seen on a response. Failures are
    /// logged and swallowed; the caller keeps using the nonce in hand.
    pub async fn record_resource_server_nonce(&self, subject_id: &str, nonce: &str) {
        if let Err(error) = self
            .store
            .update_session_resource_nonce(subject_id, nonce)
            .await
        {
            warn!(subject_id, ?error, "failed to store resource server DPoP nonce");
        }
    }

    pub async fn delete_session(&self, subject_id: &str) -> OAuthResult<()> {
        self.store.delete_session(subject_id).await?;
        Ok(())
    }
}
