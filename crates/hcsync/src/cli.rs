//! Clap derive structures for the `hcsync` command tree.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

// ── Top-level ────────────────────────────────────────────────────────

/// hcsync -- keep Home Connect appliance state in sync from the command line
#[derive(Debug, Parser)]
#[command(
    name = "hcsync",
    version,
    about = "Synchronize Home Connect appliance state",
    long_about = "Authenticates against Home Connect with the OAuth device flow, \
        loads your appliances, and follows their event stream.\n\n\
        Configuration is read from the hcsync config file and HCSYNC_* \
        environment variables; the flags below override both.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "HCSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// OAuth client id registered with Home Connect
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Talk to the Home Connect simulator
    #[arg(long, global = true, conflicts_with = "base_url")]
    pub simulator: bool,

    /// Explicit API base URL (overrides the environment)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// File holding the refresh token
    #[arg(long, global = true)]
    pub token_file: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        global = true,
        env = "HCSYNC_OUTPUT",
        default_value = "table"
    )]
    pub output: OutputFormat,

    /// When to use color: auto, always, never
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    JsonCompact,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the engine and print every message as a JSON line
    Run(RunArgs),

    /// Authenticate (device flow) and store the refresh token
    Login(LoginArgs),

    /// List appliances and their current state
    #[command(alias = "dev", alias = "d")]
    Devices(DevicesArgs),

    /// Forget the stored token so the next start authenticates again
    Reset(ResetArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Session id to register (random by default)
    #[arg(long)]
    pub session: Option<String>,

    /// Request active programs every N seconds once devices are loaded
    #[arg(long, value_name = "SECS")]
    pub programs_every: Option<u64>,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Give up after this many seconds
    #[arg(long, default_value_t = 900, value_name = "SECS")]
    pub wait: u64,
}

#[derive(Debug, Args)]
pub struct DevicesArgs {
    /// Also look up the running program of each appliance
    #[arg(long, short = 'p')]
    pub programs: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    pub wait: u64,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Skip the confirmation check
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the resolved configuration (secrets redacted)
    Show,

    /// Print the config file path
    Path,

    /// Write a config file
    Init(ConfigInitArgs),

    /// Store the OAuth client secret in the system keyring
    SetSecret {
        /// The secret; read from stdin when omitted
        secret: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct ConfigInitArgs {
    /// OAuth client id (falls back to --client-id)
    #[arg(long = "id", value_name = "CLIENT_ID")]
    pub id: Option<String>,

    /// production or simulator
    #[arg(long, default_value = "production")]
    pub environment: String,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
