use axum::Router;
use clap::Parser;
use fixtures::{accounts_from_env, auth_server, pds, run_server, FixtureArgs, FixtureState};

/// PDS fixture server. Also acts as its own authorization server.
#[derive(Parser, Debug)]
#[clap(name = "pds-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if args.common.port == 0 {
        anyhow::bail!("the PDS fixture needs a fixed --port to advertise its own URL");
    }

    let base_url = args.common.base_url();
    let state = FixtureState::new(&base_url, &base_url, accounts_from_env());

    let app = Router::new()
        .merge(auth_server::router(state.clone()))
        .merge(pds::router(state));

    run_server(args.common, app).await
}
