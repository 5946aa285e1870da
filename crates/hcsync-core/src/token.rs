// ── Token store ──
//
// Holds the current OAuth token pair, keeps the REST client's bearer in
// sync, persists the refresh token, and refreshes ahead of expiry.
// Every rotation bumps a generation counter and is announced on a
// broadcast channel so event streams opened with an older credential
// can be recreated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hcsync_api::{HomeConnectClient, OAuthClient, TokenResponse};

use crate::error::CoreError;

const TOKEN_EVENT_CHANNEL_SIZE: usize = 16;

/// Fraction of the token lifetime after which a refresh is scheduled.
const REFRESH_AT_NUMERATOR: u32 = 9;
const REFRESH_AT_DENOMINATOR: u32 = 10;

// ── Token ────────────────────────────────────────────────────────────

/// One issued access/refresh token pair.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: Duration,
    pub issued_at: DateTime<Utc>,
    /// Monotonic issue time, used for scheduling.
    obtained: Instant,
}

impl Token {
    pub fn from_response(response: TokenResponse, previous_refresh: Option<SecretString>) -> Self {
        Self {
            expires_in: response.lifetime(),
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            issued_at: Utc::now(),
            obtained: Instant::now(),
        }
    }

    /// Point in the token's life at which it should be refreshed.
    pub fn refresh_after(&self) -> Duration {
        self.expires_in * REFRESH_AT_NUMERATOR / REFRESH_AT_DENOMINATOR
    }

    /// Time left until the scheduled refresh (zero if overdue).
    pub fn refresh_due_in(&self) -> Duration {
        self.refresh_after().saturating_sub(self.obtained.elapsed())
    }

    /// Time since this token was issued.
    pub fn age(&self) -> Duration {
        self.obtained.elapsed()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + chrono::Duration::from_std(self.expires_in).unwrap_or_default()
    }
}

/// Change notifications from the token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    /// A new credential is active.
    Rotated { generation: u64 },
    /// The refresh token was rejected and discarded.
    Revoked,
}

// ── Persistence ──────────────────────────────────────────────────────

/// Durable storage for the refresh token.
pub trait TokenPersistence: Send + Sync {
    fn load(&self) -> Result<Option<SecretString>, CoreError>;
    fn save(&self, refresh_token: &SecretString) -> Result<(), CoreError>;
    fn clear(&self) -> Result<(), CoreError>;
}

/// Refresh token in a file holding the bare token string.
#[derive(Debug, Clone)]
pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage_error(path: &Path, err: &std::io::Error) -> CoreError {
    CoreError::Storage {
        message: format!("{}: {err}", path.display()),
    }
}

impl TokenPersistence for FileTokenStorage {
    fn load(&self) -> Result<Option<SecretString>, CoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(SecretString::from(token.to_owned())))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(&self.path, &e)),
        }
    }

    fn save(&self, refresh_token: &SecretString) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage_error(parent, &e))?;
        }
        std::fs::write(&self.path, refresh_token.expose_secret())
            .map_err(|e| storage_error(&self.path, &e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| storage_error(&self.path, &e))?;
        }
        debug!(path = %self.path.display(), "refresh token persisted");
        Ok(())
    }

    fn clear(&self) -> Result<(), CoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "refresh token deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&self.path, &e)),
        }
    }
}

/// In-process storage, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    pub fn stored(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TokenPersistence for MemoryTokenStorage {
    fn load(&self) -> Result<Option<SecretString>, CoreError> {
        Ok(self.stored().map(SecretString::from))
    }

    fn save(&self, refresh_token: &SecretString) -> Result<(), CoreError> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(refresh_token.expose_secret().to_owned());
        Ok(())
    }

    fn clear(&self) -> Result<(), CoreError> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

// ── TokenStore ───────────────────────────────────────────────────────

/// Owner of the active credential.
pub struct TokenStore {
    oauth: OAuthClient,
    client: Arc<HomeConnectClient>,
    storage: Arc<dyn TokenPersistence>,
    current: ArcSwapOption<Token>,
    generation: AtomicU64,
    /// Serializes refreshes; concurrent callers wait and share the result.
    refresh_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<TokenEvent>,
    retry_delay: Duration,
}

impl TokenStore {
    pub fn new(
        oauth: OAuthClient,
        client: Arc<HomeConnectClient>,
        storage: Arc<dyn TokenPersistence>,
        retry_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(TOKEN_EVENT_CHANNEL_SIZE);
        Self {
            oauth,
            client,
            storage,
            current: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            events,
            retry_delay,
        }
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    pub fn current(&self) -> Option<Arc<Token>> {
        self.current.load_full()
    }

    pub fn has_token(&self) -> bool {
        self.current.load().is_some()
    }

    /// Monotonic credential counter. Zero means no credential yet.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    /// Whether a refresh token is persisted.
    pub fn has_stored_token(&self) -> bool {
        matches!(self.storage.load(), Ok(Some(_)))
    }

    /// Activate a freshly issued token: persist, hand to the REST client,
    /// and announce the rotation.
    pub fn install(&self, response: TokenResponse) -> Result<Arc<Token>, CoreError> {
        let previous = self.current().and_then(|t| t.refresh_token.clone());
        let token = Arc::new(Token::from_response(response, previous));

        if let Some(refresh) = &token.refresh_token {
            self.storage.save(refresh)?;
        }
        self.client.set_access_token(token.access_token.clone());
        self.current.store(Some(Arc::clone(&token)));

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            generation,
            expires_in_secs = token.expires_in.as_secs(),
            "token installed"
        );
        let _ = self.events.send(TokenEvent::Rotated { generation });
        Ok(token)
    }

    /// Exchange the persisted refresh token for a new pair.
    ///
    /// Returns `false` when nothing is persisted.
    pub async fn restore(&self) -> Result<bool, CoreError> {
        let Some(stored) = self.storage.load()? else {
            return Ok(false);
        };
        debug!("restoring session from stored refresh token");
        let _guard = self.refresh_lock.lock().await;
        self.exchange(&stored).await?;
        Ok(true)
    }

    /// Refresh the access token.
    ///
    /// Single-flight: a caller that waited on an in-flight refresh returns
    /// the token it produced instead of refreshing again.
    pub async fn refresh(&self) -> Result<Arc<Token>, CoreError> {
        let seen = self.generation();
        let _guard = self.refresh_lock.lock().await;
        if self.generation() != seen {
            if let Some(token) = self.current() {
                debug!("refresh already completed by a concurrent caller");
                return Ok(token);
            }
        }

        let refresh_token = match self.current().and_then(|t| t.refresh_token.clone()) {
            Some(token) => token,
            None => self.storage.load()?.ok_or(CoreError::NotAuthenticated)?,
        };
        self.exchange(&refresh_token).await
    }

    /// Refresh only if the current token is older than `max_age`.
    pub async fn ensure_fresh(&self, max_age: Duration) -> Result<(), CoreError> {
        match self.current() {
            Some(token) if token.age() <= max_age => Ok(()),
            _ => self.refresh().await.map(|_| ()),
        }
    }

    /// Forget the credential everywhere without announcing it.
    pub fn invalidate(&self) -> Result<(), CoreError> {
        self.current.store(None);
        self.client.clear_access_token();
        self.storage.clear()
    }

    async fn exchange(&self, refresh_token: &SecretString) -> Result<Arc<Token>, CoreError> {
        match self.oauth.refresh(refresh_token).await {
            Ok(response) => self.install(response),
            Err(hcsync_api::Error::InvalidGrant { description }) => {
                warn!(%description, "refresh token rejected, discarding it");
                if let Err(e) = self.invalidate() {
                    warn!(error = %e, "failed to delete stored token");
                }
                let _ = self.events.send(TokenEvent::Revoked);
                Err(CoreError::InvalidGrant {
                    message: description,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Background refresh ───────────────────────────────────────────

    /// Spawn the refresh timer.
    ///
    /// Refreshes at 90% of each token's lifetime. A failed refresh is
    /// retried after the configured delay. Any rotation reschedules.
    pub fn start_auto_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut events = self.subscribe();

        tokio::spawn(async move {
            let mut retry_at: Option<Duration> = None;
            loop {
                let delay = retry_at
                    .take()
                    .or_else(|| store.current().map(|t| t.refresh_due_in()));

                let sleep = async {
                    match delay {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Ok(event) => debug!(?event, "token changed, rescheduling refresh"),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!(skipped = n, "token events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    () = sleep => {
                        match store.refresh().await {
                            Ok(_) => debug!("scheduled token refresh complete"),
                            Err(CoreError::InvalidGrant { .. }) => {
                                // Revoked; wait for a new credential.
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    retry_secs = store.retry_delay.as_secs(),
                                    "token refresh failed, will retry"
                                );
                                retry_at = Some(store.retry_delay);
                            }
                        }
                    }
                }
            }
            debug!("token refresh task stopped");
        })
    }
}
