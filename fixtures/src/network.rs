use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::state::{Account, FixtureState};

pub const DEFAULT_HANDLE: &str = "alice.test";
pub const DEFAULT_DID: &str = "did:plc:alice";

/// Path under which the PLC directory is mounted.
pub const PLC_PREFIX: &str = "/plc";

/// Identity directory, authorization server and PDS served from a single
/// ephemeral port. The server stops when this is dropped.
pub struct FakeNetwork {
    pub base_url: String,
    pub state: FixtureState,
    handle: JoinHandle<()>,
}

/// Every fixture route on one router.
pub fn combined_router(state: FixtureState) -> Router {
    Router::new()
        .merge(crate::identity::handle_router(state.clone()))
        .nest(PLC_PREFIX, crate::identity::plc_router(state.clone()))
        .merge(crate::auth_server::router(state.clone()))
        .merge(crate::pds::router(state))
        .layer(TraceLayer::new_for_http())
}

impl FakeNetwork {
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with_accounts(vec![Account::new(DEFAULT_HANDLE, DEFAULT_DID)]).await
    }

    pub async fn spawn_with_accounts(accounts: Vec<Account>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let state = FixtureState::new(&base_url, &base_url, accounts);

        let app = combined_router(state.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "fixture network stopped");
            }
        });

        Ok(Self {
            base_url,
            state,
            handle,
        })
    }

    /// Base URL to configure as the handle resolver.
    pub fn handle_resolver_url(&self) -> String {
        self.base_url.clone()
    }

    pub fn plc_directory_url(&self) -> String {
        format!("{}{PLC_PREFIX}", self.base_url)
    }

    pub fn state(&self) -> &FixtureState {
        &self.state
    }
}

impl Drop for FakeNetwork {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
