// Shared transport configuration for building reqwest::Client instances.
//
// The OAuth client, the REST client and the event-stream connector all
// build their HTTP clients here so timeouts and headers stay consistent.

use std::time::Duration;

use url::Url;

use crate::error::Error;

const USER_AGENT: &str = concat!("hcsync/", env!("CARGO_PKG_VERSION"));

/// Media type the REST surface negotiates on.
pub const VENDOR_JSON: &str = "application/vnd.bsh.sdk.v1+json";

/// Upstream deployment to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    /// The production cloud.
    Production,
    /// The vendor's appliance simulator.
    Simulator,
    /// An explicit base URL (test servers, proxies).
    Custom(Url),
}

impl Environment {
    /// Base URL with a trailing slash, suitable for `Url::join`.
    pub fn base_url(&self) -> Result<Url, Error> {
        let url = match self {
            Self::Production => Url::parse("https://api.home-connect.com/")?,
            Self::Simulator => Url::parse("https://simulator.home-connect.com/")?,
            Self::Custom(url) => url.clone(),
        };
        Ok(ensure_trailing_slash(url))
    }
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Total request timeout for REST and OAuth calls.
    pub timeout: Duration,
    /// TCP/TLS connect timeout, also applied to event streams.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` for request/response traffic.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::ClientBuild(e.to_string()))
    }

    /// Build a `reqwest::Client` for long-lived event streams.
    ///
    /// No total timeout: an event stream stays open indefinitely and
    /// staleness is detected by the heartbeat monitor instead.
    pub fn build_stream_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::ClientBuild(e.to_string()))
    }
}
