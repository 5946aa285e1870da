//! Command handlers and engine construction.

pub mod config_cmd;
pub mod devices;
pub mod login;
pub mod reset;
pub mod run;
pub mod util;

use std::path::PathBuf;
use std::sync::Arc;

use hcsync_config::Config;
use hcsync_core::{Engine, FileTokenStorage};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// The config file selected by `--config` / `HCSYNC_CONFIG`.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(hcsync_config::config_path)
}

/// Load config and apply command-line overrides on top.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut cfg = hcsync_config::load_config_from(&config_file(global))?;

    if let Some(id) = &global.client_id {
        cfg.client_id = Some(id.clone());
    }
    if global.simulator {
        cfg.environment = "simulator".into();
        cfg.base_url = None;
    }
    if let Some(url) = &global.base_url {
        cfg.base_url = Some(url.clone());
    }
    if let Some(path) = &global.token_file {
        cfg.token_path = Some(path.clone());
    }
    Ok(cfg)
}

/// Engine backed by the refresh-token file from `cfg`.
pub fn build_engine(cfg: &Config) -> Result<Engine, CliError> {
    let engine_config = cfg.to_engine_config()?;
    let storage = Arc::new(FileTokenStorage::new(cfg.token_path()));
    tracing::debug!(
        environment = ?engine_config.environment,
        token_path = %cfg.token_path().display(),
        "building engine"
    );
    Ok(Engine::new(engine_config, storage)?)
}

pub async fn dispatch(cmd: Command, engine: &Engine, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Run(args) => run::handle(engine, args, global).await,
        Command::Login(args) => login::handle(engine, &args, global).await,
        Command::Devices(args) => devices::handle(engine, &args, global).await,
        Command::Reset(args) => reset::handle(engine, &args, global),
        // Config is handled before an engine exists
        Command::Config(_) => unreachable!(),
    }
}
