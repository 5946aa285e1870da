// REST client for the appliance resources.
//
// Wraps `reqwest::Client` with bearer auth, vendor media type negotiation
// and `{"data": ...}` envelope unwrapping. The access token is swapped in
// place by the token store whenever it rotates.

use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use url::Url;

use crate::auth::retry_after;
use crate::error::Error;
use crate::models::{
    ActiveProgram, ApplianceList, Envelope, ErrorEnvelope, HomeAppliance, SettingList,
    StatusList, ValueItem,
};
use crate::transport::{Environment, TransportConfig, VENDOR_JSON};

/// Requests slower than this are logged; the active-program endpoint in
/// particular is known to stall.
const SLOW_REQUEST_SECS: u64 = 4;

/// Raw HTTP client for the Home Connect REST surface.
///
/// All methods return unwrapped `data` payloads.
pub struct HomeConnectClient {
    http: reqwest::Client,
    /// Separate client without a total timeout, for event streams.
    stream_http: reqwest::Client,
    base_url: Url,
    access_token: RwLock<Option<SecretString>>,
}

impl HomeConnectClient {
    pub fn new(environment: &Environment, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            stream_http: transport.build_stream_client()?,
            base_url: environment.base_url()?,
            access_token: RwLock::new(None),
        })
    }

    /// The environment base URL (with trailing slash).
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Token management ─────────────────────────────────────────────

    /// Install a (rotated) access token for subsequent requests.
    pub fn set_access_token(&self, token: SecretString) {
        trace!("access token installed");
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    /// Forget the access token (used on full reset).
    pub fn clear_access_token(&self) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn current_token(&self) -> Option<SecretString> {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn stream_http(&self) -> &reqwest::Client {
        &self.stream_http
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let guard = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// `{base}api/homeappliances[/{ha_id}[/{suffix}]]`
    pub(crate) fn appliance_url(&self, ha_id: Option<&str>, suffix: &str) -> Result<Url, Error> {
        let mut path = String::from("api/homeappliances");
        if let Some(id) = ha_id {
            path.push('/');
            path.push_str(id);
        }
        if !suffix.is_empty() {
            path.push('/');
            path.push_str(suffix);
        }
        Ok(self.base_url.join(&path)?)
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `GET api/homeappliances`
    pub async fn list_appliances(&self) -> Result<Vec<HomeAppliance>, Error> {
        let url = self.appliance_url(None, "")?;
        let list: ApplianceList = self.get(url).await?;
        Ok(list.homeappliances)
    }

    /// `GET api/homeappliances/{id}/status`
    pub async fn get_status(&self, ha_id: &str) -> Result<Vec<ValueItem>, Error> {
        let url = self.appliance_url(Some(ha_id), "status")?;
        let list: StatusList = self.get(url).await?;
        Ok(list.status)
    }

    /// `GET api/homeappliances/{id}/settings`
    pub async fn get_settings(&self, ha_id: &str) -> Result<Vec<ValueItem>, Error> {
        let url = self.appliance_url(Some(ha_id), "settings")?;
        let list: SettingList = self.get(url).await?;
        Ok(list.settings)
    }

    /// `GET api/homeappliances/{id}/programs/active`
    ///
    /// A 404 means "no program running" and surfaces as
    /// `Error::Api { status: 404, .. }` (see [`Error::is_not_found`]).
    pub async fn get_active_program(&self, ha_id: &str) -> Result<ActiveProgram, Error> {
        let url = self.appliance_url(Some(ha_id), "programs/active")?;
        let started = Instant::now();
        let result = self.get(url).await;
        let elapsed = started.elapsed();
        if elapsed.as_secs() >= SLOW_REQUEST_SECS {
            warn!(ha_id, ?elapsed, "slow active-program response");
        }
        result
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!("GET {}", url);

        let builder = self
            .apply_auth(self.http.get(url))
            .header(reqwest::header::ACCEPT, VENDOR_JSON);
        let resp = builder.send().await.map_err(Error::Transport)?;

        parse_envelope(resp).await
    }
}

/// Unwrap `{"data": T}` or map the failure status to an [`Error`].
async fn parse_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Error::Authentication {
            status: status.as_u16(),
        });
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited {
            retry_after_secs: retry_after(resp.headers()),
        });
    }

    let body = resp.text().await.map_err(Error::Transport)?;

    if !status.is_success() {
        let (key, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(env) => (
                env.error.key,
                env.error
                    .description
                    .or(env.error.value)
                    .unwrap_or_else(|| format!("HTTP {status}")),
            ),
            Err(_) => (None, body.chars().take(200).collect()),
        };
        return Err(Error::Api {
            status: status.as_u16(),
            key,
            message,
        });
    }

    let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Error::Deserialization {
            message: format!("{e} (body preview: {preview:?})"),
            body: body.clone(),
        }
    })?;
    Ok(envelope.data)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn appliance_urls() {
        let env = Environment::Custom(Url::parse("http://localhost:8080").unwrap());
        let client = HomeConnectClient::new(&env, &TransportConfig::default()).unwrap();
        assert_eq!(
            client.appliance_url(None, "").unwrap().as_str(),
            "http://localhost:8080/api/homeappliances"
        );
        assert_eq!(
            client
                .appliance_url(Some("SIEMENS-HB1"), "programs/active")
                .unwrap()
                .as_str(),
            "http://localhost:8080/api/homeappliances/SIEMENS-HB1/programs/active"
        );
        assert_eq!(
            client.appliance_url(Some("x"), "events").unwrap().path(),
            "/api/homeappliances/x/events"
        );
    }

    #[test]
    fn token_swap() {
        let client =
            HomeConnectClient::new(&Environment::Production, &TransportConfig::default()).unwrap();
        assert!(!client.has_access_token());
        client.set_access_token(SecretString::from("abc".to_owned()));
        assert!(client.has_access_token());
        client.clear_access_token();
        assert!(!client.has_access_token());
    }
}
