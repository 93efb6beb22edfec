use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use color_eyre::eyre::WrapErr;
use maud::html;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    components::layout::{Card, ErrorBanner, Page},
    cookies::{BrowserSession, CookieJar},
    errors::{ServerResult, WithStatus},
    state::AppState,
};

/// Shown for every login failure; details only go to the logs.
pub const LOGIN_ERROR: &str = "error logging in";

fn login_form(error: Option<&str>) -> Page {
    let content = html! {
        h2 class="text-xl font-semibold text-indigo-800 mb-2" { "Log in" }
        p class="text-gray-600 mb-4" {
            "Enter your handle (e.g. alice.bsky.social) or DID to sign in with your PDS."
        }
        @if let Some(error) = error {
            (ErrorBanner(error))
        }
        form action="/login" method="post" class="space-y-4" {
            input type="text" name="handle" placeholder="alice.bsky.social" required
                class="w-full rounded-md border border-gray-300 px-3 py-2";
            button type="submit"
                class="w-full rounded-md bg-indigo-600 text-white py-2 hover:bg-indigo-700" {
                "Log in"
            }
        }
        div class="mt-4 text-center" {
            a href="/" class="text-indigo-600 hover:text-indigo-800" { "Back to Home" }
        }
    };

    Page::new("Log in - Statusphere", Card::new(content))
}

fn login_failed() -> Response {
    (StatusCode::BAD_REQUEST, login_form(Some(LOGIN_ERROR))).into_response()
}

pub async fn login_page(cookies: CookieJar) -> Response {
    if cookies.session().logged_in_did().is_some() {
        return Redirect::to("/").into_response();
    }
    login_form(None).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    handle: String,
}

pub async fn login(
    cookies: CookieJar,
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Response {
    match state.oauth.start_login(&form.handle).await {
        Ok(redirect) => {
            info!(subject_id = %redirect.subject_id, "redirecting to authorization server");
            cookies.set_session(&BrowserSession::PendingLogin {
                state: redirect.state,
                did: redirect.subject_id,
            });
            Redirect::to(&redirect.authorization_url).into_response()
        }
        Err(e) => {
            error!(handle = %form.handle, error = ?e, "failed to start login");
            login_failed()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    state: Option<String>,
    iss: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub async fn callback(
    cookies: CookieJar,
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = &params.error {
        warn!(
            error = %error,
            description = params.error_description.as_deref().unwrap_or_default(),
            "authorization server returned an error"
        );
        cookies.clear_session();
        return login_failed();
    }

    let BrowserSession::PendingLogin {
        state: expected_state,
        did,
    } = cookies.session()
    else {
        warn!("callback without a pending login");
        return login_failed();
    };

    let (Some(returned_state), Some(issuer), Some(code)) = (params.state, params.iss, params.code)
    else {
        warn!("callback is missing state, iss or code");
        return login_failed();
    };

    if returned_state != expected_state {
        warn!("callback state does not match the pending login");
        cookies.clear_session();
        return login_failed();
    }

    match state
        .oauth
        .complete_login(&returned_state, &issuer, &code)
        .await
    {
        Ok(subject_id) => {
            if subject_id != did {
                warn!(%subject_id, expected = %did, "logged in as a different account than requested");
            }
            info!(%subject_id, "login complete");
            cookies.set_session(&BrowserSession::LoggedIn { did: subject_id });
            Redirect::to("/").into_response()
        }
        Err(e) => {
            error!(error = ?e, "failed to complete login");
            cookies.clear_session();
            login_failed()
        }
    }
}

pub async fn logout(cookies: CookieJar, State(state): State<AppState>) -> Redirect {
    if let Some(did) = cookies.session().logged_in_did() {
        if let Err(e) = state.oauth.delete_session(did).await {
            warn!(did, error = ?e, "failed to delete session on logout");
        }
    }
    cookies.clear_session();
    Redirect::to("/")
}

pub async fn client_metadata(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.oauth.client_metadata())
}

pub async fn jwks(State(state): State<AppState>) -> ServerResult<Json<serde_json::Value>, StatusCode> {
    let jwks = state
        .oauth
        .public_jwks()
        .wrap_err("Failed to build JWKS")
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(jwks))
}
