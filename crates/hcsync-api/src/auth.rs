// OAuth endpoints: device authorization and token exchange.
//
// Both endpoints take form-urlencoded bodies. Errors come back as
// `{"error": "...", "error_description": "..."}` with a 4xx status;
// the device-flow "keep waiting" answers are errors on the wire but
// ordinary outcomes here (`TokenPoll::Pending` / `TokenPoll::SlowDown`).

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::transport::{Environment, TransportConfig};

const DEVICE_AUTHORIZATION_PATH: &str = "security/oauth/device_authorization";
const TOKEN_PATH: &str = "security/oauth/token";

/// Answer to a device authorization request, shown to the user out of band.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Seconds until `device_code` expires.
    pub expires_in: u64,
    /// Server-suggested polling interval in seconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

/// Successful token endpoint response.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: SecretString,
    /// Absent when the server keeps the previous refresh token valid.
    pub refresh_token: Option<SecretString>,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct RawTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<RawTokenResponse> for TokenResponse {
    fn from(raw: RawTokenResponse) -> Self {
        Self {
            access_token: SecretString::from(raw.access_token),
            refresh_token: raw.refresh_token.map(SecretString::from),
            // Home Connect issues 24h tokens; assume that if the field is missing.
            expires_in: raw.expires_in.unwrap_or(86_400),
            scope: raw.scope,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Outcome of a single device-token poll.
#[derive(Debug)]
pub enum TokenPoll {
    /// The user approved; tokens issued.
    Granted(TokenResponse),
    /// The user has not acted yet; poll again at the same interval.
    Pending,
    /// Polling too fast; the caller must lengthen its interval.
    SlowDown,
}

/// Client for the OAuth endpoints of one environment.
pub struct OAuthClient {
    http: reqwest::Client,
    base_url: Url,
    client_id: String,
    client_secret: Option<SecretString>,
}

impl OAuthClient {
    pub fn new(
        environment: &Environment,
        client_id: impl Into<String>,
        client_secret: Option<SecretString>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            base_url: environment.base_url()?,
            client_id: client_id.into(),
            client_secret,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `POST security/oauth/device_authorization`
    pub async fn request_device_code(&self) -> Result<DeviceAuthorization, Error> {
        let url = self.base_url.join(DEVICE_AUTHORIZATION_PATH)?;
        debug!(%url, "requesting device code");

        let resp = self
            .http
            .post(url)
            .form(&[("client_id", self.client_id.as_str())])
            .send()
            .await?;

        let status = resp.status();
        let retry_after = retry_after(resp.headers());
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(oauth_error(status.as_u16(), &body, retry_after));
        }

        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: format!("device authorization: {e}"),
            body,
        })
    }

    /// `POST security/oauth/token` with `grant_type=device_code`.
    pub async fn poll_device_token(&self, device_code: &str) -> Result<TokenPoll, Error> {
        let mut form = vec![
            ("grant_type", "device_code"),
            ("device_code", device_code),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret()));
        }

        match self.token_request(&form).await {
            Ok(token) => Ok(TokenPoll::Granted(token)),
            Err(Error::OAuth { error, .. }) if error == "authorization_pending" => {
                Ok(TokenPoll::Pending)
            }
            Err(Error::OAuth { error, .. }) if error == "slow_down" => Ok(TokenPoll::SlowDown),
            Err(e) => Err(e),
        }
    }

    /// `POST security/oauth/token` with `grant_type=refresh_token`.
    pub async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenResponse, Error> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret()));
        }
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, Error> {
        let url = self.base_url.join(TOKEN_PATH)?;
        let resp = self.http.post(url).form(form).send().await?;

        let status = resp.status();
        let retry_after = retry_after(resp.headers());
        let body = resp.text().await?;

        if !status.is_success() {
            let err = oauth_error(status.as_u16(), &body, retry_after);
            if err.is_rate_limited() {
                warn!(status = status.as_u16(), "token endpoint rate limited");
            }
            return Err(err);
        }

        let raw: RawTokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: format!("token response: {e}"),
                // Token bodies carry secrets; never keep them.
                body: String::new(),
            })?;
        Ok(raw.into())
    }
}

/// Map an OAuth error body (or a bare status) to an [`Error`].
///
/// HTTP 429 and a "polling too quickly" description are rate limits
/// whatever the error code says; `slow_down` on any other status stays
/// an ordinary OAuth answer.
fn oauth_error(status: u16, body: &str, retry_after_secs: Option<u64>) -> Error {
    let parsed = serde_json::from_str::<OAuthErrorBody>(body).ok();
    let polling_too_quickly = parsed.as_ref().is_some_and(|p| {
        p.error_description
            .as_deref()
            .is_some_and(|d| d.to_ascii_lowercase().contains("polling too quickly"))
    });
    if status == 429 || polling_too_quickly {
        return Error::RateLimited { retry_after_secs };
    }
    let Some(parsed) = parsed else {
        return Error::Api {
            status,
            key: None,
            message: body.chars().take(200).collect(),
        };
    };
    let description = parsed.error_description.unwrap_or_default();
    match parsed.error.as_str() {
        "access_denied" => Error::AccessDenied,
        "expired_token" => Error::ExpiredToken,
        "invalid_grant" => Error::InvalidGrant { description },
        _ => Error::OAuth {
            error: parsed.error,
            description,
        },
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl TokenResponse {
    /// Access token lifetime as a `Duration`.
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_error_mapping() {
        assert!(matches!(
            oauth_error(400, r#"{"error":"access_denied"}"#, None),
            Error::AccessDenied
        ));
        assert!(matches!(
            oauth_error(400, r#"{"error":"expired_token"}"#, None),
            Error::ExpiredToken
        ));
        match oauth_error(
            400,
            r#"{"error":"invalid_grant","error_description":"revoked"}"#,
            None,
        ) {
            Error::InvalidGrant { description } => assert_eq!(description, "revoked"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            oauth_error(502, "<html>bad gateway</html>", None),
            Error::Api { status: 502, .. }
        ));
    }

    #[test]
    fn rate_limits_override_the_oauth_code() {
        assert!(matches!(
            oauth_error(429, "", Some(30)),
            Error::RateLimited {
                retry_after_secs: Some(30)
            }
        ));
        assert!(matches!(
            oauth_error(
                429,
                r#"{"error":"invalid_request","error_description":"client is polling too quickly"}"#,
                None
            ),
            Error::RateLimited { .. }
        ));
        assert!(matches!(
            oauth_error(
                400,
                r#"{"error":"invalid_request","error_description":"Client is polling too quickly"}"#,
                None
            ),
            Error::RateLimited { .. }
        ));
        match oauth_error(400, r#"{"error":"slow_down"}"#, None) {
            Error::OAuth { error, .. } => assert_eq!(error, "slow_down"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
