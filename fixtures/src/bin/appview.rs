use clap::Parser;
use fixtures::{accounts_from_env, identity, run_server, FixtureArgs, FixtureState};

/// AppView fixture server, used for handle resolution.
#[derive(Parser, Debug)]
#[clap(name = "appview-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let base_url = args.common.base_url();
    let state = FixtureState::new(&base_url, &base_url, accounts_from_env());

    run_server(args.common, identity::handle_router(state)).await
}
