//! Shared configuration for hcsync front ends.
//!
//! TOML file plus `HCSYNC_` environment overrides, client-secret
//! resolution (env + keyring + plaintext), the refresh-token location,
//! and translation to `hcsync_core::EngineConfig`. The core never reads
//! these types; it receives a pre-built `EngineConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hcsync_api::{Environment, TransportConfig};
use hcsync_core::EngineConfig;

const KEYRING_SERVICE: &str = "hcsync";
const KEYRING_SECRET_ENTRY: &str = "client-secret";
const TOKEN_FILE: &str = "refresh_token";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no OAuth client id configured")]
    MissingClientId,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// OAuth client id of the registered application.
    pub client_id: Option<String>,

    /// `production` or `simulator`.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Explicit API base URL. Overrides `environment`.
    pub base_url: Option<String>,

    /// Client secret (plaintext -- prefer keyring or env var).
    pub client_secret: Option<String>,

    /// Environment variable name containing the client secret.
    pub client_secret_env: Option<String>,

    /// Refresh-token file. Defaults to the platform data directory.
    pub token_path: Option<PathBuf>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Full device refresh period in seconds; 0 disables it.
    #[serde(default)]
    pub update_interval: u64,

    /// Default tracing filter when neither `-v` nor `RUST_LOG` is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub stream: StreamSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: None,
            environment: default_environment(),
            base_url: None,
            client_secret: None,
            client_secret_env: None,
            token_path: None,
            timeout: default_timeout(),
            update_interval: 0,
            log_level: default_log_level(),
            stream: StreamSettings::default(),
        }
    }
}

/// Event-stream tuning, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamSettings {
    #[serde(default = "default_true")]
    pub heartbeat: bool,

    #[serde(default = "default_stale_after")]
    pub stale_after: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    #[serde(default = "default_auth_retry")]
    pub auth_retry_delay: u64,

    #[serde(default = "default_transient_retry")]
    pub transient_retry_delay: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat: true,
            stale_after: default_stale_after(),
            check_interval: default_check_interval(),
            auth_retry_delay: default_auth_retry(),
            transient_retry_delay: default_transient_retry(),
        }
    }
}

fn default_environment() -> String {
    "production".into()
}
fn default_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "warn".into()
}
fn default_true() -> bool {
    true
}
fn default_stale_after() -> u64 {
    180
}
fn default_check_interval() -> u64 {
    60
}
fn default_auth_retry() -> u64 {
    30
}
fn default_transient_retry() -> u64 {
    10
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "hcsync", "hcsync")
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hcsync");
    p
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default location of the persisted refresh token.
pub fn default_token_path() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback().join(TOKEN_FILE),
        |dirs| dirs.data_dir().join(TOKEN_FILE),
    )
}

// ── Loading / saving ────────────────────────────────────────────────

/// Defaults, then the TOML file at `path`, then `HCSYNC_*` variables.
///
/// Nested keys use a double underscore: `HCSYNC_STREAM__HEARTBEAT=false`.
pub fn figment_for(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HCSYNC_").split("__"))
}

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    Ok(figment_for(path).extract()?)
}

/// Load config, returning a default if the file is missing or broken.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the client secret: named env var, then keyring, then the
/// plaintext field (which `HCSYNC_CLIENT_SECRET` also fills).
///
/// The device flow works without a secret, so absence is not an error.
pub fn resolve_client_secret(cfg: &Config) -> Option<SecretString> {
    let from_env = cfg
        .client_secret_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok());
    let from_keyring = || {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_SECRET_ENTRY)
            .ok()
            .and_then(|entry| entry.get_password().ok())
    };
    first_secret(from_env, from_keyring, cfg.client_secret.as_deref())
}

fn first_secret(
    from_env: Option<String>,
    from_keyring: impl FnOnce() -> Option<String>,
    plaintext: Option<&str>,
) -> Option<SecretString> {
    from_env
        .filter(|s| !s.is_empty())
        .or_else(from_keyring)
        .or_else(|| plaintext.map(str::to_owned))
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

/// Store the client secret in the system keyring.
pub fn store_client_secret(secret: &str) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_SECRET_ENTRY)
        .map_err(|e| ConfigError::Keyring(e.to_string()))?;
    entry
        .set_password(secret)
        .map_err(|e| ConfigError::Keyring(e.to_string()))
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Where the refresh token lives.
    pub fn token_path(&self) -> PathBuf {
        self.token_path.clone().unwrap_or_else(default_token_path)
    }

    pub fn resolve_environment(&self) -> Result<Environment, ConfigError> {
        if let Some(raw) = self.base_url.as_deref().filter(|s| !s.is_empty()) {
            let url = raw.parse().map_err(|_| ConfigError::Validation {
                field: "base_url".into(),
                reason: format!("invalid URL: {raw}"),
            })?;
            return Ok(Environment::Custom(url));
        }
        match self.environment.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "simulator" | "sim" => Ok(Environment::Simulator),
            other => Err(ConfigError::Validation {
                field: "environment".into(),
                reason: format!("expected 'production' or 'simulator', got '{other}'"),
            }),
        }
    }

    /// Build an `EngineConfig`, resolving the client secret.
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        self.engine_config_with_secret(resolve_client_secret(self))
    }

    /// Build an `EngineConfig` with an already-resolved secret.
    pub fn engine_config_with_secret(
        &self,
        client_secret: Option<SecretString>,
    ) -> Result<EngineConfig, ConfigError> {
        let client_id = self
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingClientId)?;

        let mut engine = EngineConfig::new(self.resolve_environment()?, client_id);
        engine.client_secret = client_secret;
        engine.transport = TransportConfig {
            timeout: Duration::from_secs(self.timeout.max(1)),
            ..TransportConfig::default()
        };
        engine.update_interval =
            (self.update_interval > 0).then_some(Duration::from_secs(self.update_interval));

        let stream = &self.stream;
        engine.supervisor.heartbeat.enabled = stream.heartbeat;
        engine.supervisor.heartbeat.stale_after = Duration::from_secs(stream.stale_after);
        engine.supervisor.heartbeat.check_interval =
            Duration::from_secs(stream.check_interval.max(1));
        engine.supervisor.auth_retry_delay = Duration::from_secs(stream.auth_retry_delay);
        engine.supervisor.transient_retry_delay =
            Duration::from_secs(stream.transient_retry_delay);
        Ok(engine)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.environment, "production");
        assert_eq!(cfg.timeout, 30);
        assert_eq!(cfg.stream, StreamSettings::default());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
client_id = "abc123"
environment = "simulator"
update_interval = 300

[stream]
heartbeat = false
transient_retry_delay = 5
"#,
        );
        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.client_id.as_deref(), Some("abc123"));
        assert_eq!(cfg.environment, "simulator");
        assert!(!cfg.stream.heartbeat);
        assert_eq!(cfg.stream.stale_after, 180);

        let engine = cfg.engine_config_with_secret(None).unwrap();
        assert_eq!(engine.environment, Environment::Simulator);
        assert_eq!(engine.update_interval, Some(Duration::from_secs(300)));
        assert!(!engine.supervisor.heartbeat.enabled);
        assert_eq!(
            engine.supervisor.transient_retry_delay,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn base_url_wins_over_environment() {
        let cfg = Config {
            client_id: Some("abc".into()),
            base_url: Some("http://127.0.0.1:8080".into()),
            ..Config::default()
        };
        let Environment::Custom(url) = cfg.resolve_environment().unwrap() else {
            panic!("expected a custom environment");
        };
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let cfg = Config {
            environment: "staging".into(),
            ..Config::default()
        };
        assert!(matches!(
            cfg.resolve_environment(),
            Err(ConfigError::Validation { field, .. }) if field == "environment"
        ));
    }

    #[test]
    fn client_id_is_required() {
        let cfg = Config {
            client_id: Some("   ".into()),
            ..Config::default()
        };
        assert!(matches!(
            cfg.engine_config_with_secret(None),
            Err(ConfigError::MissingClientId)
        ));
    }

    #[test]
    fn secret_chain_prefers_env_then_keyring_then_plaintext() {
        let pick = |env: Option<&str>, keyring: Option<&str>, plain: Option<&str>| {
            let keyring = keyring.map(str::to_owned);
            first_secret(env.map(str::to_owned), || keyring, plain)
                .map(|s| s.expose_secret().to_owned())
        };
        assert_eq!(pick(Some("e"), Some("k"), Some("p")).as_deref(), Some("e"));
        assert_eq!(pick(None, Some("k"), Some("p")).as_deref(), Some("k"));
        assert_eq!(pick(Some(""), None, Some("p")).as_deref(), Some("p"));
        assert_eq!(pick(None, None, None), None);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            client_id: Some("abc".into()),
            token_path: Some(dir.path().join("token")),
            ..Config::default()
        };
        save_config_to(&cfg, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), cfg);
    }

    #[test]
    fn token_path_defaults_to_data_dir() {
        let cfg = Config::default();
        assert!(cfg.token_path().ends_with(TOKEN_FILE));
    }
}
