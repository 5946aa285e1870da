//! Config subcommand handlers.

use std::io::{self, BufRead};

use hcsync_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, ConfigInitArgs, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

use super::config_file;

const REDACTED: &str = "****";

pub fn handle(
    args: ConfigArgs,
    loaded: Result<Config, CliError>,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&config_file(global).display().to_string(), global.quiet);
            Ok(())
        }
        ConfigCommand::Show => show(&loaded?, global),
        ConfigCommand::Init(init_args) => init(&init_args, global),
        ConfigCommand::SetSecret { secret } => set_secret(secret),
    }
}

fn redacted(cfg: &Config) -> Config {
    let mut shown = cfg.clone();
    if shown.client_secret.is_some() {
        shown.client_secret = Some(REDACTED.into());
    }
    shown
}

fn show(cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let shown = redacted(cfg);
    let rendered = match global.output {
        OutputFormat::Json => output::render_json(&shown, false)?,
        OutputFormat::JsonCompact => output::render_json(&shown, true)?,
        OutputFormat::Table | OutputFormat::Plain => {
            toml::to_string_pretty(&shown).map_err(hcsync_config::ConfigError::from)?
        }
    };
    output::print_output(rendered.trim_end(), global.quiet);
    Ok(())
}

fn init(args: &ConfigInitArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = config_file(global);
    if path.exists() && !args.force {
        return Err(CliError::AlreadyExists {
            path: path.display().to_string(),
        });
    }

    let client_id = args
        .id
        .clone()
        .or_else(|| global.client_id.clone())
        .filter(|id| !id.trim().is_empty())
        .ok_or(CliError::NoClientId)?;

    let cfg = Config {
        client_id: Some(client_id),
        environment: args.environment.clone(),
        base_url: global.base_url.clone(),
        token_path: global.token_file.clone(),
        ..Config::default()
    };
    cfg.resolve_environment()?;

    hcsync_config::save_config_to(&cfg, &path)?;
    output::note(&format!("Wrote {}", path.display()), global.quiet);
    Ok(())
}

fn set_secret(secret: Option<String>) -> Result<(), CliError> {
    let secret = match secret {
        Some(secret) => secret,
        None => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line
        }
    };
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(CliError::Validation {
            field: "client_secret".into(),
            reason: "secret cannot be empty".into(),
        });
    }
    hcsync_config::store_client_secret(secret)?;
    output::note("Client secret stored in the system keyring.", false);
    Ok(())
}
