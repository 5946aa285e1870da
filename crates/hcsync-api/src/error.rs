use thiserror::Error;

/// Top-level error type for the `hcsync-api` crate.
///
/// Covers every failure mode across the three upstream surfaces:
/// the OAuth endpoints, the REST resources, and the event stream.
/// `hcsync-core` classifies these into its own remediation taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The access token was rejected (HTTP 401/403).
    #[error("Authentication rejected (HTTP {status})")]
    Authentication { status: u16 },

    /// The user declined the device authorization request.
    #[error("Device authorization was denied by the user")]
    AccessDenied,

    /// The device code expired before the user completed authorization.
    #[error("Device code expired before authorization completed")]
    ExpiredToken,

    /// The refresh token is no longer accepted.
    #[error("Refresh token rejected: {description}")]
    InvalidGrant { description: String },

    /// Any other OAuth error response.
    #[error("OAuth error `{error}`: {description}")]
    OAuth { error: String, description: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Client construction failed.
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    /// Rate limited by the cloud (HTTP 429).
    #[error("Rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    // ── REST ────────────────────────────────────────────────────────
    /// Structured vendor error (`{"error": {"key", "description"}}`).
    #[error("Home Connect API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        key: Option<String>,
        message: String,
    },

    // ── Event stream ────────────────────────────────────────────────
    /// The event stream could not be opened or broke mid-flight.
    #[error("Event stream error: {message}")]
    Stream { status: Option<u16>, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates the access token has expired
    /// and a refresh might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        match self {
            Self::Authentication { .. } => true,
            Self::Stream { status: Some(s), .. } => matches!(s, 401 | 403),
            _ => false,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Stream { status, .. } => !matches!(status, Some(401 | 403)),
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Api { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Returns `true` for HTTP 429 responses on any surface.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Stream { status: Some(429), .. }
        )
    }

    /// The HTTP status that produced this error, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { status } | Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Stream { status, .. } => *status,
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Extract the vendor error key, if available.
    pub fn api_error_key(&self) -> Option<&str> {
        match self {
            Self::Api { key, .. } => key.as_deref(),
            Self::OAuth { error, .. } => Some(error),
            _ => None,
        }
    }
}
