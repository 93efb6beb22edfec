mod common;

use chrono::Utc;
use common::setup;
use fixtures::{DEFAULT_DID, DEFAULT_HANDLE};
use reqwest::Method;
use serde_json::json;
use statusphere::oauth::{OAuthError, RequestError, SessionStore};
use statusphere::status::{create_status, STATUS_COLLECTION};

fn create_record_url(base: &str) -> String {
    format!("{base}/xrpc/com.atproto.repo.createRecord")
}

fn status_body(status: &str) -> serde_json::Value {
    json!({
        "repo": DEFAULT_DID,
        "collection": STATUS_COLLECTION,
        "record": {
            "$type": STATUS_COLLECTION,
            "status": status,
            "createdAt": "2025-03-01T12:00:00.000Z",
        },
    })
}

#[tokio::test]
async fn test_first_request_absorbs_the_nonce_challenge() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    assert_eq!(session.dpop_resource_server_nonce, "");

    let response = app
        .oauth
        .execute(
            &session,
            Method::POST,
            &create_record_url(&app.network.base_url),
            Some(&status_body("🦋")),
        )
        .await
        .unwrap();

    assert!(response["uri"]
        .as_str()
        .unwrap()
        .starts_with(&format!("at://{DEFAULT_DID}/{STATUS_COLLECTION}/")));
    let stats = app.network.state.stats();
    assert_eq!(stats.create_record_requests, 2);
    assert_eq!(stats.pds_nonce_challenges, 1);

    let stored = app.store.get_session(DEFAULT_DID).await.unwrap().unwrap();
    assert_eq!(stored.dpop_resource_server_nonce, app.network.state.pds_nonce());
}

#[tokio::test]
async fn test_known_nonce_needs_a_single_request() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    let url = create_record_url(&app.network.base_url);

    app.oauth
        .execute(&session, Method::POST, &url, Some(&status_body("👍")))
        .await
        .unwrap();

    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    app.oauth
        .execute(&session, Method::POST, &url, Some(&status_body("🚀")))
        .await
        .unwrap();

    let stats = app.network.state.stats();
    assert_eq!(stats.create_record_requests, 3);
    assert_eq!(stats.pds_nonce_challenges, 1);
    assert_eq!(app.network.state.records().len(), 2);
}

#[tokio::test]
async fn test_rotated_nonce_is_retried_once() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let url = create_record_url(&app.network.base_url);

    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    app.oauth
        .execute(&session, Method::POST, &url, Some(&status_body("👍")))
        .await
        .unwrap();

    let rotated = app.network.state.rotate_pds_nonce();
    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    app.oauth
        .execute(&session, Method::POST, &url, Some(&status_body("😎")))
        .await
        .unwrap();

    let stats = app.network.state.stats();
    assert_eq!(stats.create_record_requests, 4);
    assert_eq!(stats.pds_nonce_challenges, 2);
    let stored = app.store.get_session(DEFAULT_DID).await.unwrap().unwrap();
    assert_eq!(stored.dpop_resource_server_nonce, rotated);
}

#[tokio::test]
async fn test_second_challenge_is_not_retried() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    app.network
        .state
        .update_settings(|s| s.always_rotate_pds_nonce = true);

    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    let err = app
        .oauth
        .execute(
            &session,
            Method::POST,
            &create_record_url(&app.network.base_url),
            Some(&status_body("💀")),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, OAuthError::Request(RequestError::NonceRetryExhausted)),
        "{err:?}"
    );
    assert_eq!(app.network.state.stats().create_record_requests, 2);
    assert!(app.network.state.records().is_empty());
}

#[tokio::test]
async fn test_server_errors_surface_as_request_errors() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();

    let mut body = status_body("👀");
    body["repo"] = json!("did:plc:someone-else");
    let err = app
        .oauth
        .execute(
            &session,
            Method::POST,
            &create_record_url(&app.network.base_url),
            Some(&body),
        )
        .await
        .unwrap_err();

    match err {
        OAuthError::Request(RequestError::Status { status, error, .. }) => {
            assert_eq!(status, 400);
            assert_eq!(error.as_deref(), Some("InvalidRequest"));
        }
        other => panic!("expected a status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_token_is_not_treated_as_a_nonce_challenge() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();
    app.network.state.expire_access_token(&session.access_token);

    let err = app
        .oauth
        .execute(
            &session,
            Method::POST,
            &create_record_url(&app.network.base_url),
            Some(&status_body("😭")),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, OAuthError::Request(RequestError::Status { status: 401, .. })),
        "{err:?}"
    );
    assert_eq!(app.network.state.stats().create_record_requests, 1);
}

#[tokio::test]
async fn test_create_status_writes_a_status_record() {
    let app = setup().await;
    app.login(DEFAULT_HANDLE).await;
    let session = app.oauth.get_valid_session(DEFAULT_DID).await.unwrap();

    let uri = create_status(app.oauth.executor(), &session, "🦋", Utc::now())
        .await
        .unwrap()
        .expect("createRecord returns the record uri");

    let records = app.network.state.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["uri"], uri);
    assert_eq!(records[0]["value"]["status"], "🦋");
    assert_eq!(records[0]["value"]["$type"], STATUS_COLLECTION);
}
