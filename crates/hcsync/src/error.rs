//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use hcsync_config::ConfigError;
use hcsync_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const RATE_LIMITED: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Authentication ───────────────────────────────────────────────
    #[error("No OAuth client id configured")]
    #[diagnostic(
        code(hcsync::no_client_id),
        help(
            "Register an application at developer.home-connect.com, then run:\n  \
             hcsync config init --id <CLIENT_ID>\n\
             Or set HCSYNC_CLIENT_ID / pass --client-id."
        )
    )]
    NoClientId,

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(hcsync::auth_failed),
        help("Run `hcsync login` and complete the code prompt within its validity window.")
    )]
    AuthFailed { message: String },

    #[error("Stored credentials were rejected")]
    #[diagnostic(
        code(hcsync::reauth_required),
        help("Run `hcsync login` to authorize this client again.")
    )]
    ReauthRequired,

    // ── Upstream ─────────────────────────────────────────────────────
    #[error("Rate limited by Home Connect")]
    #[diagnostic(
        code(hcsync::rate_limited),
        help("Wait {seconds}s before trying again.")
    )]
    RateLimited { seconds: u64 },

    #[error("Home Connect is unreachable: {reason}")]
    #[diagnostic(
        code(hcsync::upstream),
        help("Check your network connection, or try again later.")
    )]
    Upstream { reason: String },

    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(hcsync::timeout),
        help("Raise the limit with --wait, or check connectivity with -vv.")
    )]
    Timeout { seconds: u64 },

    // ── Local ────────────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(hcsync::validation))]
    Validation { field: String, reason: String },

    #[error("Refusing to overwrite {path}")]
    #[diagnostic(code(hcsync::exists), help("Pass --force to replace it."))]
    AlreadyExists { path: String },

    #[error("Confirmation required")]
    #[diagnostic(
        code(hcsync::confirmation_required),
        help("Re-run with --yes to confirm.")
    )]
    ConfirmationRequired,

    #[error(transparent)]
    #[diagnostic(code(hcsync::config))]
    Config(ConfigError),

    #[error("{0}")]
    #[diagnostic(code(hcsync::error))]
    Other(String),

    #[error(transparent)]
    #[diagnostic(code(hcsync::io))]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoClientId | Self::AuthFailed { .. } | Self::ReauthRequired => exit_code::AUTH,
            Self::RateLimited { .. } => exit_code::RATE_LIMITED,
            Self::Upstream { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::AlreadyExists { .. }
            | Self::ConfirmationRequired
            | Self::Config(_) => exit_code::USAGE,
            Self::Other(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthFailure { message } => Self::AuthFailed { message },
            CoreError::AuthTimeout { attempts } => Self::AuthFailed {
                message: format!("no approval after {attempts} polling attempts"),
            },
            CoreError::InvalidGrant { .. } | CoreError::NotAuthenticated => Self::ReauthRequired,
            CoreError::RateLimited { retry_after_secs } => Self::RateLimited {
                seconds: retry_after_secs.unwrap_or(60),
            },
            CoreError::UpstreamUnavailable { reason } => Self::Upstream { reason },
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingClientId => Self::NoClientId,
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}
