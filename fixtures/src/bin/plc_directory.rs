use clap::Parser;
use fixtures::{accounts_from_env, identity, require_env_var, run_server, FixtureArgs, FixtureState};

/// PLC Directory fixture server
#[derive(Parser, Debug)]
#[clap(name = "plc-directory-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // DID documents point at the PDS fixture
    let pds_url = require_env_var("PDS_URL", args.common.force)?;
    let state = FixtureState::new(&pds_url, &pds_url, accounts_from_env());

    run_server(args.common, identity::plc_router(state)).await
}
