use std::env;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result, WrapErr};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tower_cookies::Key;

use crate::did::{HttpIdentityResolver, IdentityConfig};
use crate::encryption::EncryptionConfig;
use crate::oauth::{
    db::PgSessionStore, ClientKeys, OAuthClient, OAuthClientConfig, SessionStore,
};

pub const CLIENT_NAME: &str = "Statusphere";

/// Everything read from the environment at startup.
#[derive(Clone)]
pub struct AppConfig {
    /// Public base URL, e.g. `https://statusphere.example`
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub client_keys: ClientKeys,
    pub encryption: EncryptionConfig,
    pub cookie_key: Key,
    pub identity: IdentityConfig,
    pub http_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let host = required("HOST")?.trim_end_matches('/').to_string();
        let port = match env::var("PORT") {
            Ok(port) => port.parse().wrap_err("PORT must be a number")?,
            Err(_) => 3000,
        };

        let client_keys = ClientKeys::from_base64_pem(&required("OAUTH_PRIVATE_KEY")?)?;
        let encryption = EncryptionConfig::from_key_str(&required("ENCRYPTION_KEY")?)?;
        let cookie_key = match env::var("COOKIE_KEY") {
            Ok(encoded) => {
                let bytes = base64::Engine::decode(
                    &base64::engine::general_purpose::STANDARD,
                    encoded.trim(),
                )
                .wrap_err("COOKIE_KEY is not valid base64")?;
                Key::try_from(bytes.as_slice())
                    .map_err(|e| eyre!("COOKIE_KEY must be at least 64 bytes: {e}"))?
            }
            Err(_) => {
                tracing::warn!("COOKIE_KEY not set, sessions will not survive a restart");
                Key::generate()
            }
        };

        let defaults = IdentityConfig::default();
        let identity = IdentityConfig {
            handle_resolver_url: env::var("HANDLE_RESOLVER_URL")
                .unwrap_or(defaults.handle_resolver_url),
            plc_directory_url: env::var("PLC_DIRECTORY_URL")
                .unwrap_or(defaults.plc_directory_url),
        };
        let http_timeout = match env::var("HTTP_TIMEOUT_MS") {
            Ok(ms) => Duration::from_millis(ms.parse().wrap_err("HTTP_TIMEOUT_MS must be a number")?),
            Err(_) => Duration::from_millis(5000),
        };

        Ok(Self {
            host,
            port,
            database_url: required("DATABASE_URL")?,
            client_keys,
            encryption,
            cookie_key,
            identity,
            http_timeout,
        })
    }

    pub fn oauth_client_config(&self) -> OAuthClientConfig {
        OAuthClientConfig::for_host(&self.host, CLIENT_NAME, self.client_keys.clone())
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{name} environment variable not set"))
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: PgPool,
    pub cookie_key: Key,
    pub oauth: OAuthClient,
}

impl AppState {
    pub async fn from_env() -> Result<Self> {
        let config = AppConfig::from_env()?;
        let pool = setup_db_pool(&config.database_url).await?;
        Self::new(config, pool)
    }

    pub fn new(config: AppConfig, db: PgPool) -> Result<Self> {
        let store = PgSessionStore::new(db.clone(), config.encryption.clone());
        Self::with_session_store(config, db, Arc::new(store))
    }

    /// Same as [`AppState::new`] with sessions kept somewhere other than
    /// Postgres.
    pub fn with_session_store(
        config: AppConfig,
        db: PgPool,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .use_rustls_tls()
            .build()
            .wrap_err("Failed to build HTTP client")?;

        let identity = HttpIdentityResolver::new(http.clone(), config.identity.clone());
        let oauth = OAuthClient::new(config.oauth_client_config(), http, Arc::new(identity), store);

        Ok(Self {
            cookie_key: config.cookie_key.clone(),
            config: Arc::new(config),
            db,
            oauth,
        })
    }

    pub fn pg_session_store(&self) -> PgSessionStore {
        PgSessionStore::new(self.db.clone(), self.config.encryption.clone())
    }
}

#[tracing::instrument(skip(database_url), err)]
pub async fn setup_db_pool(database_url: &str) -> Result<PgPool> {
    const MIGRATION_LOCK_ID: i64 = 0x5747_5354_5048_5245;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&pool)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    let unlocked: bool = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_ID)
        .fetch_one(&pool)
        .await?
        .try_get(0)?;

    if unlocked {
        tracing::info!("Migration lock unlocked");
    } else {
        tracing::warn!("Failed to unlock migration lock");
    }

    Ok(pool)
}
