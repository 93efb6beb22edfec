use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::StoreError;
use super::session::{PendingAuthorizationRequest, Session, SessionTokens};

/// Durable storage for pending authorization requests and sessions.
///
/// `create_session` on a subject that already has a session leaves the
/// existing row untouched. Callers that re-login must delete first.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateState`] if `state` is taken.
    async fn create_request(&self, request: &PendingAuthorizationRequest)
        -> Result<(), StoreError>;

    async fn get_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorizationRequest>, StoreError>;

    /// Returns whether a request was removed. Only one caller can consume a
    /// given `state`.
    async fn delete_request(&self, state: &str) -> Result<bool, StoreError>;

    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, subject_id: &str) -> Result<Option<Session>, StoreError>;

    async fn update_session_tokens(
        &self,
        subject_id: &str,
        tokens: &SessionTokens,
    ) -> Result<(), StoreError>;

    async fn update_session_resource_nonce(
        &self,
        subject_id: &str,
        nonce: &str,
    ) -> Result<(), StoreError>;

    async fn delete_session(&self, subject_id: &str) -> Result<(), StoreError>;
}

/// In-process store, used by tests and fixture-backed local runs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    requests: Mutex<HashMap<String, PendingAuthorizationRequest>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_request(
        &self,
        request: &PendingAuthorizationRequest,
    ) -> Result<(), StoreError> {
        let mut requests = lock(&self.requests);
        if requests.contains_key(&request.state) {
            return Err(StoreError::DuplicateState(request.state.clone()));
        }
        requests.insert(request.state.clone(), request.clone());
        Ok(())
    }

    async fn get_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorizationRequest>, StoreError> {
        Ok(lock(&self.requests).get(state).cloned())
    }

    async fn delete_request(&self, state: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.requests).remove(state).is_some())
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        lock(&self.sessions)
            .entry(session.subject_id.clone())
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn get_session(&self, subject_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(lock(&self.sessions).get(subject_id).cloned())
    }

    async fn update_session_tokens(
        &self,
        subject_id: &str,
        tokens: &SessionTokens,
    ) -> Result<(), StoreError> {
        if let Some(session) = lock(&self.sessions).get_mut(subject_id) {
            session.apply_tokens(tokens.clone());
        }
        Ok(())
    }

    async fn update_session_resource_nonce(
        &self,
        subject_id: &str,
        nonce: &str,
    ) -> Result<(), StoreError> {
        if let Some(session) = lock(&self.sessions).get_mut(subject_id) {
            session.dpop_resource_server_nonce = nonce.to_string();
        }
        Ok(())
    }

    async fn delete_session(&self, subject_id: &str) -> Result<(), StoreError> {
        lock(&self.sessions).remove(subject_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::oauth::session::test_support::{pending, session};

    #[tokio::test]
    async fn duplicate_state_is_rejected() {
        let store = MemorySessionStore::new();
        store.create_request(&pending("s1")).await.unwrap();

        let err = store.create_request(&pending("s1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateState(state) if state == "s1"));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn a_request_is_consumed_once() {
        let store = MemorySessionStore::new();
        store.create_request(&pending("s1")).await.unwrap();

        assert!(store.delete_request("s1").await.unwrap());
        assert!(!store.delete_request("s1").await.unwrap());
    }

    #[tokio::test]
    async fn deleting_a_missing_request_is_fine() {
        let store = MemorySessionStore::new();
        assert!(!store.delete_request("nope").await.unwrap());
        assert!(store.get_request("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_session_does_not_overwrite() {
        let store = MemorySessionStore::new();
        let first = session("did:plc:alice", Utc::now() + Duration::hours(1));
        let mut second = first.clone();
        second.access_token = "access-2".into();

        store.create_session(&first).await.unwrap();
        store.create_session(&second).await.unwrap();

        let stored = store.get_session("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-1");
    }

    #[tokio::test]
    async fn nonce_updates_touch_only_the_nonce() {
        let store = MemorySessionStore::new();
        let original = session("did:plc:alice", Utc::now() + Duration::hours(1));
        store.create_session(&original).await.unwrap();

        store
            .update_session_resource_nonce("did:plc:alice", "n2")
            .await
            .unwrap();

        let stored = store.get_session("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(stored.dpop_resource_server_nonce, "n2");
        assert_eq!(stored.access_token, original.access_token);
        assert_eq!(stored.expires_at, original.expires_at);
    }

    #[tokio::test]
    async fn delete_session_is_idempotent() {
        let store = MemorySessionStore::new();
        store
            .create_session(&session("did:plc:alice", Utc::now()))
            .await
            .unwrap();

        store.delete_session("did:plc:alice").await.unwrap();
        store.delete_session("did:plc:alice").await.unwrap();
        assert!(store.get_session("did:plc:alice").await.unwrap().is_none());
    }
}
