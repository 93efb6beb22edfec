use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::warn;

use crate::oauth::{AuthenticatedRequestExecutor, OAuthResult, Session};

pub const STATUS_COLLECTION: &str = "xyz.statusphere.status";

pub const AVAILABLE_STATUSES: &[&str] = &[
    "👍", "👎", "💙", "🥹", "😧", "😤", "🙃", "😉", "😎", "🤓", "🤨", "🥳", "😭", "🤯",
    "🫡", "💀", "✊", "🤘", "👀", "🧠", "👩‍💻", "🧑‍💻", "🥷", "🧌", "🦋", "🚀",
];

pub fn is_available(status: &str) -> bool {
    AVAILABLE_STATUSES.contains(&status)
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

/// Write a status record to the user's repo and return its `at://` URI.
///
/// `None` means the record was written but the response did not say where.
pub async fn create_status(
    executor: &AuthenticatedRequestExecutor,
    session: &Session,
    status: &str,
    created_at: DateTime<Utc>,
) -> OAuthResult<Option<String>> {
    let url = format!(
        "{}/xrpc/com.atproto.repo.createRecord",
        session.resource_server_url.trim_end_matches('/')
    );
    let body = json!({
        "repo": session.subject_id,
        "collection": STATUS_COLLECTION,
        "record": {
            "$type": STATUS_COLLECTION,
            "status": status,
            "createdAt": created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
    });

    let response = executor
        .execute(session, Method::POST, &url, Some(&body))
        .await?;
    match serde_json::from_value::<CreateRecordResponse>(response) {
        Ok(created) => Ok(Some(created.uri)),
        Err(error) => {
            warn!(%error, "createRecord response did not include a uri");
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Status {
    pub uri: String,
    pub author_did: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Optimistic local copy of a status we just wrote.
pub async fn save_status(pool: &PgPool, status: &Status) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO statuses (uri, author_did, status, created_at, indexed_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (uri) DO NOTHING
        "#,
    )
    .bind(&status.uri)
    .bind(&status.author_did)
    .bind(&status.status)
    .bind(status.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_statuses(pool: &PgPool, limit: i64) -> Result<Vec<Status>, sqlx::Error> {
    sqlx::query_as::<_, Status>(
        "SELECT uri, author_did, status, created_at FROM statuses ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
