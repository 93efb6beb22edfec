use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse as _, Response},
};
use serde::{Deserialize, Serialize};
use tower_cookies::{cookie::SameSite, Cookie, Cookies};
use tracing::{error, warn};

use crate::state::AppState;

pub const SESSION_COOKIE: &str = "statusphere-session";

/// Pending logins only need to survive the round trip to the authorization
/// server.
const PENDING_LOGIN_MAX_AGE: tower_cookies::cookie::time::Duration =
    tower_cookies::cookie::time::Duration::minutes(5);
const LOGGED_IN_MAX_AGE: tower_cookies::cookie::time::Duration =
    tower_cookies::cookie::time::Duration::days(30);

/// Everything the browser carries about who it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrowserSession {
    Anonymous,
    PendingLogin { state: String, did: String },
    LoggedIn { did: String },
}

impl BrowserSession {
    pub fn logged_in_did(&self) -> Option<&str> {
        match self {
            BrowserSession::LoggedIn { did } => Some(did),
            _ => None,
        }
    }

    fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(error = %e, "discarding unreadable session cookie");
            BrowserSession::Anonymous
        })
    }
}

/// Private (encrypted and authenticated) cookie jar holding the
/// [`BrowserSession`].
pub struct CookieJar {
    cookies: Cookies,
    state: AppState,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for CookieJar {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = match Cookies::from_request_parts(parts, state).await {
            Ok(cookies) => cookies,
            Err(_) => {
                error!("Failed to extract cookies from request");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        };

        Ok(CookieJar {
            cookies,
            state: state.clone(),
        })
    }
}

impl CookieJar {
    pub fn session(&self) -> BrowserSession {
        self.cookies
            .private(&self.state.cookie_key)
            .get(SESSION_COOKIE)
            .map(|cookie| BrowserSession::decode(cookie.value()))
            .unwrap_or(BrowserSession::Anonymous)
    }

    pub fn set_session(&self, session: &BrowserSession) {
        let max_age = match session {
            BrowserSession::Anonymous => return self.clear_session(),
            BrowserSession::PendingLogin { .. } => PENDING_LOGIN_MAX_AGE,
            BrowserSession::LoggedIn { .. } => LOGGED_IN_MAX_AGE,
        };
        let value = match serde_json::to_string(session) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "failed to encode session cookie");
                return;
            }
        };

        let mut cookie = Cookie::new(SESSION_COOKIE, value);
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_secure(self.state.config.host.starts_with("https://"));
        cookie.set_max_age(max_age);

        self.cookies.private(&self.state.cookie_key).add(cookie);
    }

    pub fn clear_session(&self) {
        let mut cookie = Cookie::from(SESSION_COOKIE);
        cookie.set_path("/");
        self.cookies.private(&self.state.cookie_key).remove(cookie);
    }
}
