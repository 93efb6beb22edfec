use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::Redirect,
    routing::{get, post},
};
use chrono::Utc;
use color_eyre::eyre::{eyre, WrapErr};
use maud::html;
use serde::Deserialize;
use tower_cookies::CookieManagerLayer;
use tracing::{info, warn};

use crate::{
    components::{
        layout::{Card, Page},
        status::{StatusList, StatusPicker},
    },
    cookies::CookieJar,
    errors::{ServerError, ServerResult, WithStatus},
    oauth::OAuthError,
    state::AppState,
    status::{self, Status},
};

pub mod oauth;

const RECENT_STATUS_LIMIT: i64 = 10;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(home_page))
        .route("/login", get(oauth::login_page).post(oauth::login))
        .route("/oauth-callback", get(oauth::callback))
        .route("/logout", post(oauth::logout))
        .route("/status", post(post_status))
        .route("/client-metadata.json", get(oauth::client_metadata))
        .route("/jwks.json", get(oauth::jwks))
        .layer(CookieManagerLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn home_page(
    cookies: CookieJar,
    State(state): State<AppState>,
) -> ServerResult<Page, StatusCode> {
    let statuses = status::recent_statuses(&state.db, RECENT_STATUS_LIMIT)
        .await
        .wrap_err("Failed to load recent statuses")?;

    let session = cookies.session();
    let viewer = session.logged_in_did();
    let current = viewer.and_then(|did| {
        statuses
            .iter()
            .find(|s| s.author_did == did)
            .map(|s| s.status.as_str())
    });

    let content = html! {
        @if let Some(did) = viewer {
            div class="flex items-center justify-between mb-2" {
                p class="text-gray-700" { "Signed in as " code { (did) } }
                form action="/logout" method="post" {
                    button type="submit" class="text-sm text-indigo-600 hover:text-indigo-800" { "Log out" }
                }
            }
            (StatusPicker { current })
        } @else {
            div class="text-center mb-4" {
                a href="/login" class="inline-block rounded-md bg-indigo-600 text-white px-4 py-2 hover:bg-indigo-700" {
                    "Log in to set your status"
                }
            }
        }
        (StatusList { statuses: &statuses, viewer })
    };

    Ok(Page::new("Statusphere", Card::new(content).with_max_width("max-w-lg")))
}

#[derive(Debug, Deserialize)]
struct StatusForm {
    status: String,
}

async fn post_status(
    cookies: CookieJar,
    State(state): State<AppState>,
    Form(form): Form<StatusForm>,
) -> ServerResult<Redirect, StatusCode> {
    let Some(did) = cookies.session().logged_in_did().map(str::to_owned) else {
        return Ok(Redirect::to("/login"));
    };

    if !status::is_available(&form.status) {
        return Err(ServerError(
            eyre!("{:?} is not an available status", form.status),
            StatusCode::BAD_REQUEST,
        ));
    }

    let session = match state.oauth.get_valid_session(&did).await {
        Ok(session) => session,
        Err(e @ (OAuthError::NotFound(_) | OAuthError::Refresh { .. })) => {
            warn!(%did, error = ?e, "session unusable, logging out");
            cookies.clear_session();
            return Ok(Redirect::to("/login"));
        }
        Err(e) => return Err(e.into()),
    };

    let created_at = Utc::now();
    let uri = status::create_status(state.oauth.executor(), &session, &form.status, created_at)
        .await
        .wrap_err("Failed to write status record")
        .with_status(StatusCode::BAD_GATEWAY)?;
    let Some(uri) = uri else {
        warn!(%did, "status record written without a uri, skipping local copy");
        return Ok(Redirect::to("/"));
    };
    info!(%uri, "status record created");

    status::save_status(
        &state.db,
        &Status {
            uri,
            author_did: did,
            status: form.status,
            created_at,
        },
    )
    .await
    .wrap_err("Failed to store status locally")?;

    Ok(Redirect::to("/"))
}
