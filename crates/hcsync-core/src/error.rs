// ── Core error types ──
//
// Remediation-oriented errors from hcsync-core. Consumers never see raw
// HTTP details; the `From<hcsync_api::Error>` impl sorts transport-layer
// failures into the class that decides what happens next (refresh,
// cooldown, backoff, re-authenticate).

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Authentication ───────────────────────────────────────────────
    /// The device-flow handshake was refused or its code expired. Terminal.
    #[error("Authentication failed: {message}")]
    AuthFailure { message: String },

    /// The user never completed the device-flow handshake.
    #[error("Authentication timed out after {attempts} polling attempts")]
    AuthTimeout { attempts: u32 },

    /// The access token was rejected; a refresh should fix it.
    #[error("Access token rejected (HTTP {status})")]
    AuthTransient { status: u16 },

    /// The refresh token is dead. Stored credentials must be discarded.
    #[error("Refresh token rejected: {message}")]
    InvalidGrant { message: String },

    /// No token has been obtained yet.
    #[error("Not authenticated")]
    NotAuthenticated,

    // ── Upstream ─────────────────────────────────────────────────────
    /// HTTP 429 from upstream.
    #[error("Rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Network failure or 5xx.
    #[error("Upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    /// 404 on a resource that may simply not exist yet.
    #[error("No data available for {identifier}")]
    DataUnavailable { identifier: String },

    #[error("Operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Other structured API error.
    #[error("API error: {message}")]
    Api {
        message: String,
        key: Option<String>,
        status: Option<u16>,
    },

    // ── Local ────────────────────────────────────────────────────────
    #[error("Token storage error: {message}")]
    Storage { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_auth_transient(&self) -> bool {
        matches!(self, Self::AuthTransient { .. })
    }

    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::InvalidGrant { .. })
    }

    /// Terminal for the current authentication attempt.
    pub fn is_auth_terminal(&self) -> bool {
        matches!(self, Self::AuthFailure { .. } | Self::AuthTimeout { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<hcsync_api::Error> for CoreError {
    fn from(err: hcsync_api::Error) -> Self {
        use hcsync_api::Error as Api;

        match err {
            Api::Authentication { status } => CoreError::AuthTransient { status },
            Api::AccessDenied => CoreError::AuthFailure {
                message: "authorization was denied".into(),
            },
            Api::ExpiredToken => CoreError::AuthFailure {
                message: "device code expired".into(),
            },
            Api::InvalidGrant { description } => CoreError::InvalidGrant {
                message: description,
            },
            Api::OAuth { error, description } => CoreError::AuthFailure {
                message: if description.is_empty() {
                    error
                } else {
                    format!("{error}: {description}")
                },
            },
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else {
                    CoreError::UpstreamUnavailable {
                        reason: e.to_string(),
                    }
                }
            }
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::ClientBuild(message) => CoreError::Config { message },
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::RateLimited { retry_after_secs } => CoreError::RateLimited { retry_after_secs },
            Api::Api { status: 429, .. } => CoreError::RateLimited {
                retry_after_secs: None,
            },
            Api::Api {
                status: 404,
                message,
                ..
            } => CoreError::DataUnavailable {
                identifier: message,
            },
            Api::Api { status, message, .. } if status >= 500 => {
                CoreError::UpstreamUnavailable {
                    reason: format!("HTTP {status}: {message}"),
                }
            }
            Api::Api {
                status,
                key,
                message,
            } => CoreError::Api {
                message,
                key,
                status: Some(status),
            },
            Api::Stream {
                status: Some(status @ (401 | 403)),
                ..
            } => CoreError::AuthTransient { status },
            Api::Stream {
                status: Some(429), ..
            } => CoreError::RateLimited {
                retry_after_secs: None,
            },
            Api::Stream { message, .. } => CoreError::UpstreamUnavailable { reason: message },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_from_api_errors() {
        let e: CoreError = hcsync_api::Error::Authentication { status: 403 }.into();
        assert!(e.is_auth_transient());

        let e: CoreError = hcsync_api::Error::InvalidGrant {
            description: "gone".into(),
        }
        .into();
        assert!(e.is_invalid_grant());

        let e: CoreError = hcsync_api::Error::AccessDenied.into();
        assert!(e.is_auth_terminal());

        let e: CoreError = hcsync_api::Error::Api {
            status: 404,
            key: None,
            message: "no program".into(),
        }
        .into();
        assert!(matches!(e, CoreError::DataUnavailable { .. }));

        let e: CoreError = hcsync_api::Error::Stream {
            status: Some(429),
            message: "busy".into(),
        }
        .into();
        assert!(e.is_rate_limited());

        let e: CoreError = hcsync_api::Error::Api {
            status: 429,
            key: None,
            message: "too many requests".into(),
        }
        .into();
        assert!(e.is_rate_limited());
    }
}
