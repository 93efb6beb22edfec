use axum::Router;
use clap::Parser;
use std::env;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod auth_server;
pub mod dpop;
pub mod identity;
pub mod network;
pub mod pds;
pub mod state;

pub use network::{FakeNetwork, DEFAULT_DID, DEFAULT_HANDLE};
pub use state::{Account, FixtureState, Settings, Stats};

/// Common CLI arguments for all fixture servers
#[derive(Parser, Debug, Clone)]
pub struct FixtureArgs {
    /// The port to listen on
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// The host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Force allow running without required environment variables (for development)
    #[arg(long)]
    pub force: bool,
}

impl FixtureArgs {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Helper to get a required environment variable or return an error
pub fn require_env_var(name: &str, force: bool) -> anyhow::Result<String> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => {
            if force {
                error!("WARNING: Required environment variable {} not set. Using placeholder value because --force was specified.", name);
                Ok("http://localhost:3000".to_string())
            } else {
                anyhow::bail!(
                    "Required environment variable {} not set. Use --force to bypass this check.",
                    name
                )
            }
        }
    }
}

/// Accounts served by standalone fixtures, from `FIXTURE_HANDLE` and
/// `FIXTURE_DID`.
pub fn accounts_from_env() -> Vec<Account> {
    let handle = env::var("FIXTURE_HANDLE").unwrap_or_else(|_| DEFAULT_HANDLE.to_string());
    let did = env::var("FIXTURE_DID").unwrap_or_else(|_| DEFAULT_DID.to_string());
    vec![Account::new(&handle, &did)]
}

/// Common function to run a fixture server
pub async fn run_server(args: FixtureArgs, app: Router) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = format!("{}:{}", args.host, args.port).parse::<SocketAddr>()?;

    let app = app.layer(TraceLayer::new_for_http());

    info!("Fixture server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
