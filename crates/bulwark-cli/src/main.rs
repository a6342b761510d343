//! Bulwark CLI entry point.
//!
//! Binary name: `bwk`
//!
//! Parses arguments, builds the provider registry from the config file and
//! dispatches to a command handler. Providers are shut down before exit.

mod cli;
mod state;

use std::time::Duration;

use clap::Parser;

use bulwark_observe::tracing_setup::{filter_for_verbosity, init_tracing, shutdown_tracing};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(filter_for_verbosity(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!(e))?;

    let check_interval = match &cli.command {
        Commands::Watch { interval, .. } => interval.map(Duration::from_secs),
        _ => None,
    };
    let state = AppState::init(cli.config.clone(), check_interval).await?;

    let result = run(&cli, &state).await;

    state.shutdown().await;
    shutdown_tracing();
    result
}

async fn run(cli: &Cli, state: &AppState) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Status => cli::status::status(state, cli.json).await,
        Commands::Probe { name } => cli::probe::probe(state, name.as_deref(), cli.json).await,
        Commands::Models { name } => cli::models::models(state, name.as_deref(), cli.json).await,
        Commands::Generate {
            prompt,
            provider,
            system,
            fallback,
        } => {
            cli::generate::generate(
                state,
                prompt,
                provider.as_deref(),
                system.as_deref(),
                *fallback,
                cli.verbose > 0,
                cli.json,
            )
            .await
        }
        Commands::Metrics => cli::metrics::metrics(state, cli.json).await,
        Commands::Watch { duration, .. } => {
            cli::watch::watch(state, duration.map(Duration::from_secs), cli.json).await
        }
    }
}
