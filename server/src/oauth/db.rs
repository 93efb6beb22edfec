use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::error::StoreError;
use super::session::{PendingAuthorizationRequest, Session, SessionTokens};
use super::store::SessionStore;
use crate::encryption::EncryptionConfig;

/// Postgres-backed [`SessionStore`]. Tokens, PKCE verifiers and DPoP keys are
/// age-encrypted before they reach the database.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
    encryption: EncryptionConfig,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, encryption: EncryptionConfig) -> Self {
        Self { pool, encryption }
    }

    async fn seal(&self, value: &str) -> Result<String, StoreError> {
        self.encryption
            .encrypt(value)
            .await
            .map_err(|e| StoreError::Encryption(e.to_string()))
    }

    async fn open(&self, value: &str) -> Result<String, StoreError> {
        self.encryption
            .decrypt(value)
            .await
            .map_err(|e| StoreError::Encryption(e.to_string()))
    }

    /// Drop pending requests whose callback never arrived.
    pub async fn purge_stale_requests(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM oauth_requests WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn request_from_row(&self, row: PgRow) -> Result<PendingAuthorizationRequest, StoreError> {
        Ok(PendingAuthorizationRequest {
            state: row.try_get("state")?,
            issuer: row.try_get("issuer")?,
            subject_id: row.try_get("subject_id")?,
            resource_server_url: row.try_get("resource_server_url")?,
            token_endpoint: row.try_get("token_endpoint")?,
            request_uri: row.try_get("request_uri")?,
            pkce_verifier: self
                .open(row.try_get("encrypted_pkce_verifier")?)
                .await?,
            auth_server_nonce: row.try_get("auth_server_nonce")?,
            client_private_key: self
                .open(row.try_get("encrypted_client_private_key")?)
                .await?,
        })
    }

    async fn session_from_row(&self, row: PgRow) -> Result<Session, StoreError> {
        Ok(Session {
            subject_id: row.try_get("subject_id")?,
            resource_server_url: row.try_get("resource_server_url")?,
            issuer: row.try_get("issuer")?,
            token_endpoint: row.try_get("token_endpoint")?,
            access_token: self.open(row.try_get("encrypted_access_token")?).await?,
            refresh_token: self.open(row.try_get("encrypted_refresh_token")?).await?,
            dpop_auth_server_nonce: row.try_get("dpop_auth_server_nonce")?,
            dpop_resource_server_nonce: row.try_get("dpop_resource_server_nonce")?,
            client_private_key: self
                .open(row.try_get("encrypted_client_private_key")?)
                .await?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_request(
        &self,
        request: &PendingAuthorizationRequest,
    ) -> Result<(), StoreError> {
        let encrypted_verifier = self.seal(&request.pkce_verifier).await?;
        let encrypted_key = self.seal(&request.client_private_key).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO oauth_requests (
                state, issuer, subject_id, resource_server_url, token_endpoint,
                request_uri, encrypted_pkce_verifier, auth_server_nonce,
                encrypted_client_private_key
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (state) DO NOTHING
            "#,
        )
        .bind(&request.state)
        .bind(&request.issuer)
        .bind(&request.subject_id)
        .bind(&request.resource_server_url)
        .bind(&request.token_endpoint)
        .bind(&request.request_uri)
        .bind(&encrypted_verifier)
        .bind(&request.auth_server_nonce)
        .bind(&encrypted_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateState(request.state.clone()));
        }
        Ok(())
    }

    async fn get_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorizationRequest>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT state, issuer, subject_id, resource_server_url, token_endpoint,
                   request_uri, encrypted_pkce_verifier, auth_server_nonce,
                   encrypted_client_private_key
            FROM oauth_requests
            WHERE state = $1
            "#,
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.request_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn delete_request(&self, state: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM oauth_requests WHERE state = $1")
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let access_token = self.seal(&session.access_token).await?;
        let refresh_token = self.seal(&session.refresh_token).await?;
        let private_key = self.seal(&session.client_private_key).await?;

        sqlx::query(
            r#"
            INSERT INTO oauth_sessions (
                subject_id, resource_server_url, issuer, token_endpoint,
                encrypted_access_token, encrypted_refresh_token,
                dpop_auth_server_nonce, dpop_resource_server_nonce,
                encrypted_client_private_key, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (subject_id) DO NOTHING
            "#,
        )
        .bind(&session.subject_id)
        .bind(&session.resource_server_url)
        .bind(&session.issuer)
        .bind(&session.token_endpoint)
        .bind(&access_token)
        .bind(&refresh_token)
        .bind(&session.dpop_auth_server_nonce)
        .bind(&session.dpop_resource_server_nonce)
        .bind(&private_key)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, subject_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT subject_id, resource_server_url, issuer, token_endpoint,
                   encrypted_access_token, encrypted_refresh_token,
                   dpop_auth_server_nonce, dpop_resource_server_nonce,
                   encrypted_client_private_key, expires_at
            FROM oauth_sessions
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.session_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn update_session_tokens(
        &self,
        subject_id: &str,
        tokens: &SessionTokens,
    ) -> Result<(), StoreError> {
        let access_token = self.seal(&tokens.access_token).await?;
        let refresh_token = self.seal(&tokens.refresh_token).await?;

        sqlx::query(
            r#"
            UPDATE oauth_sessions
            SET encrypted_access_token = $2,
                encrypted_refresh_token = $3,
                dpop_auth_server_nonce = $4,
                expires_at = $5,
                updated_at = NOW()
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .bind(&access_token)
        .bind(&refresh_token)
        .bind(&tokens.dpop_auth_server_nonce)
        .bind(tokens.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_session_resource_nonce(
        &self,
        subject_id: &str,
        nonce: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE oauth_sessions SET dpop_resource_server_nonce = $2, updated_at = NOW() WHERE subject_id = $1",
        )
        .bind(subject_id)
        .bind(nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, subject_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM oauth_sessions WHERE subject_id = $1")
            .bind(subject_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
