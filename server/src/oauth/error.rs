use std::error::Error as StdError;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failures while producing a DPoP proof or a client assertion.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid key material: {0}")]
    Key(String),
    #[error("failed to encode JWT segment: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to sign JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("ECDSA signing failed: {0}")]
    Ecdsa(#[from] p256::ecdsa::Error),
}

/// Failures talking to a remote server with an authenticated request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with {status}: {}", describe(.error, .message))]
    Status {
        status: u16,
        error: Option<String>,
        message: Option<String>,
    },
    #[error("server issued a second DPoP nonce challenge")]
    NonceRetryExhausted,
    #[error("invalid response body: {0}")]
    Body(String),
}

fn describe(error: &Option<String>, message: &Option<String>) -> String {
    match (error, message) {
        (Some(e), Some(m)) => format!("{e} - {m}"),
        (Some(e), None) => e.clone(),
        (None, Some(m)) => m.clone(),
        (None, None) => "no error detail".to_string(),
    }
}

/// Failures from a [`SessionStore`](super::store::SessionStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a pending request with state {0} already exists")]
    DuplicateState(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to protect stored secret: {0}")]
    Encryption(String),
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("authorization flow failed: {message}")]
    AuthorizationFlow {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("granted scope {granted:?} does not match requested scope {requested:?}")]
    ScopeMismatch { requested: String, granted: String },

    #[error("token refresh failed: {message}")]
    Refresh {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type OAuthResult<T> = Result<T, OAuthError>;

impl OAuthError {
    pub fn flow(message: impl Into<String>) -> Self {
        OAuthError::AuthorizationFlow {
            message: message.into(),
            source: None,
        }
    }

    pub fn flow_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        OAuthError::AuthorizationFlow {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn refresh(message: impl Into<String>) -> Self {
        OAuthError::Refresh {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps any failure raised during a login step so callers see a single
    /// error kind with the original cause attached.
    pub(crate) fn into_authorization_flow(self, message: &str) -> Self {
        match self {
            err @ OAuthError::AuthorizationFlow { .. } => err,
            other => OAuthError::AuthorizationFlow {
                message: message.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Same as [`Self::into_authorization_flow`] for the refresh path.
    pub(crate) fn into_refresh(self) -> Self {
        match self {
            err @ OAuthError::Refresh { .. } => err,
            other => OAuthError::Refresh {
                message: "token endpoint rejected refresh".to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OAuthError::NotFound(_))
    }
}
