mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// `-v` flags win, then `RUST_LOG`, then the configured level.
fn init_tracing(verbosity: u8, configured: &str) {
    let filter = match verbosity {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    };

    let env_filter = match filter {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(configured))
            .unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let loaded = commands::load_config(&cli.global);
    let level = loaded
        .as_ref()
        .map_or("warn", |cfg| cfg.log_level.as_str());
    init_tracing(cli.global.verbose, level);

    match cli.command {
        // Config commands work without a client id or a valid config
        Command::Config(args) => commands::config_cmd::handle(args, loaded, &cli.global),

        cmd => {
            let cfg = loaded?;
            let engine = commands::build_engine(&cfg)?;

            tracing::debug!(command = ?cmd, "dispatching command");
            let result = commands::dispatch(cmd, &engine, &cli.global).await;
            engine.shutdown().await;
            result
        }
    }
}
