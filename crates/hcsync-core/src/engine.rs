// ── Engine ──
//
// Wires the token store, device flow, registry, supervisor, scheduler
// and broadcaster together. Reacts to session registration, refresh
// requests and authentication outcomes; owns the authenticated and
// authenticating flags through the shared `SessionContext`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hcsync_api::{HomeConnectClient, OAuthClient, StreamEvent, StreamEventKind};

use crate::broadcast::{
    AuthEvent, AuthPrompt, Delivery, Message, SessionBroadcaster, SessionId, StatusKind,
};
use crate::config::EngineConfig;
use crate::device_flow::{DeviceFlowAuthenticator, FlowProgress};
use crate::error::CoreError;
use crate::model::{Appliance, ApplianceUpdate, OptionValue, event_values, rest_values};
use crate::scheduler::{ActiveProgramScheduler, BatchOutcome};
use crate::session::SessionContext;
use crate::store::DeviceRegistry;
use crate::supervisor::{EventHandler, EventStreamSupervisor, StreamId};
use crate::token::{TokenEvent, TokenPersistence, TokenStore};

// ── Engine ───────────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Nothing happens until a
/// session registers: the first registration starts initialization
/// (stored token or device flow), then devices are fetched and the
/// global event stream is subscribed.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    client: Arc<HomeConnectClient>,
    tokens: Arc<TokenStore>,
    registry: Arc<DeviceRegistry>,
    broadcaster: Arc<SessionBroadcaster>,
    session: Arc<SessionContext>,
    supervisor: EventStreamSupervisor,
    scheduler: ActiveProgramScheduler,
    /// One handler for the engine's lifetime, so re-subscribing is a no-op.
    stream_handler: EventHandler,
    cancel: CancellationToken,
    /// Child token for the current authentication cycle; replaced on reset.
    cancel_child: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    init_attempts: AtomicU32,
    /// Devices fetched and streams subscribed at least once this cycle.
    initialized: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    /// Build the engine. Does not touch the network.
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn TokenPersistence>,
    ) -> Result<Self, CoreError> {
        let client = Arc::new(HomeConnectClient::new(
            &config.environment,
            &config.transport,
        )?);
        let oauth = OAuthClient::new(
            &config.environment,
            config.client_id.clone(),
            config.client_secret.clone(),
            &config.transport,
        )?;
        let tokens = Arc::new(TokenStore::new(
            oauth,
            Arc::clone(&client),
            storage,
            config.token_retry_delay,
        ));
        let registry = Arc::new(DeviceRegistry::new());
        let broadcaster = Arc::new(SessionBroadcaster::new());
        let session = Arc::new(SessionContext::new(config.session.clone()));
        let cancel = CancellationToken::new();

        let supervisor = EventStreamSupervisor::new(
            Arc::clone(&client),
            Arc::clone(&tokens),
            Arc::clone(&broadcaster),
            config.supervisor.clone(),
            &cancel,
        );
        let scheduler = ActiveProgramScheduler::new(
            Arc::clone(&client),
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            Arc::clone(&session),
            config.scheduler.clone(),
            &cancel,
        );
        let stream_handler = stream_handler(Arc::clone(&registry), Arc::clone(&broadcaster));
        let cancel_child = cancel.child_token();

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                client,
                tokens,
                registry,
                broadcaster,
                session,
                supervisor,
                scheduler,
                stream_handler,
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task_handles: Mutex::new(Vec::new()),
                init_attempts: AtomicU32::new(0),
                initialized: AtomicBool::new(false),
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn session_context(&self) -> &Arc<SessionContext> {
        &self.inner.session
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    pub fn supervisor(&self) -> &EventStreamSupervisor {
        &self.inner.supervisor
    }

    pub fn scheduler(&self) -> &ActiveProgramScheduler {
        &self.inner.scheduler
    }

    /// Every message addressed to any session.
    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.inner.broadcaster.subscribe()
    }

    pub fn devices_snapshot(&self) -> Arc<Vec<Arc<Appliance>>> {
        self.inner.registry.snapshot()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session.is_authenticated()
    }

    fn current_cancel(&self) -> CancellationToken {
        lock(&self.inner.cancel_child).clone()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = lock(&self.inner.task_handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    // ── Session registration ─────────────────────────────────────────

    /// Register a logical client session and bring it up to date.
    ///
    /// An authenticated engine replies with its current device list. A
    /// registration while authentication is in flight is answered with
    /// `auth_in_progress` and starts nothing. Otherwise initialization
    /// starts in the background.
    pub fn register_session(&self, session: SessionId) {
        let is_new = self.inner.broadcaster.register(session.clone());
        let hub = &self.inner.broadcaster;

        if self.inner.session.is_authenticated() {
            if is_new {
                hub.notify_session(
                    &session,
                    StatusKind::SessionActive,
                    "Session active - using existing authentication",
                );
            } else {
                hub.notify_session(&session, StatusKind::Complete, "Already initialized");
            }
            hub.send_to(&session, Message::Devices(self.inner.registry.snapshot()));
            return;
        }

        if !self.claim_initialization() {
            info!(%session, "authentication already in progress");
            hub.notify_session(&session, StatusKind::AuthInProgress, "Authentication in progress");
            return;
        }

        hub.notify_session(&session, StatusKind::Initializing, "Initialization started");
        self.spawn_initialization();
    }

    /// Start initialization unless authenticated or already authenticating.
    /// Returns whether a new attempt was started.
    pub fn initialize(&self) -> bool {
        if !self.claim_initialization() {
            return false;
        }
        self.spawn_initialization();
        true
    }

    /// Take the authentication slot. Only one caller wins it.
    fn claim_initialization(&self) -> bool {
        !self.inner.session.is_authenticated() && self.inner.session.try_begin_authentication()
    }

    fn spawn_initialization(&self) {
        let this = self.clone();
        let cancel = self.current_cancel();
        self.track(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => debug!("initialization cancelled"),
                () = this.run_initialization() => {}
            }
        }));
    }

    async fn run_initialization(&self) {
        let hub = &self.inner.broadcaster;
        let has_stored = self.inner.tokens.has_stored_token();
        if !has_stored {
            self.authenticate_and_start(false).await;
            return;
        }

        info!("stored refresh token found, initializing client");
        hub.notify(StatusKind::TokenFound, "Token found - initializing client");
        let timeout = self.inner.config.init.client_init_timeout;
        match tokio::time::timeout(timeout, self.inner.tokens.restore()).await {
            Ok(Ok(true)) => self.on_authenticated().await,
            Ok(Ok(false)) => self.authenticate_and_start(false).await,
            Ok(Err(CoreError::InvalidGrant { .. })) => {
                hub.notify(
                    StatusKind::ReauthRequired,
                    "Stored token rejected - new authentication required",
                );
                self.authenticate_and_start(false).await;
            }
            Ok(Err(e)) => {
                error!(error = %e, "client initialization failed");
                self.inner.session.finish_authentication(false);
                hub.notify(StatusKind::ClientError, format!("Client error: {e}"));
            }
            Err(_) => {
                error!(timeout_secs = timeout.as_secs(), "client initialization timed out");
                self.inner.session.finish_authentication(false);
                hub.notify(StatusKind::ClientError, "Client initialization timeout");
            }
        }
    }

    // ── Device flow ──────────────────────────────────────────────────

    /// Run one device-flow attempt and, on success, bring the engine up.
    ///
    /// Must be called holding the authentication slot. `bypass_interval`
    /// skips the minimum spacing between attempts (scheduled retries).
    pub async fn authenticate_and_start(&self, bypass_interval: bool) {
        let hub = &self.inner.broadcaster;
        if !bypass_interval {
            if let Some(wait) = self.inner.session.auth_wait() {
                warn!(wait_secs = wait.as_secs(), "authentication attempted too soon");
                self.inner.session.finish_authentication(false);
                hub.notify_rate_limited("Rate limit - please wait...", wait.as_secs());
                return;
            }
        }
        self.inner.session.record_auth_attempt();

        let attempt = self.inner.init_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let max_attempts = self.inner.config.init.max_attempts;
        info!(attempt, max_attempts, "starting device flow authentication");
        hub.notify(
            StatusKind::NeedAuth,
            format!("Authentication required (attempt {attempt}/{max_attempts})"),
        );

        let authenticator = DeviceFlowAuthenticator::new(
            self.inner.tokens.oauth(),
            self.inner.config.device_flow.clone(),
        );
        let progress_hub = Arc::clone(hub);
        let result = authenticator
            .authenticate(move |progress| {
                if let Some(event) = auth_event(progress) {
                    progress_hub.broadcast(Message::Auth(event));
                }
            })
            .await;

        match result {
            Ok(response) => {
                hub.broadcast(Message::Auth(AuthEvent::Success));
                hub.notify(StatusKind::InitializingClient, "Initializing client...");
                match self.inner.tokens.install(response) {
                    Ok(_) => self.on_authenticated().await,
                    Err(e) => {
                        error!(error = %e, "failed to activate token");
                        self.inner.session.finish_authentication(false);
                        hub.notify(StatusKind::ClientError, format!("Client error: {e}"));
                    }
                }
            }
            Err(e) => self.handle_init_failure(&e, attempt),
        }
    }

    /// Release the slot after a failed device flow and decide whether to
    /// try again.
    fn handle_init_failure(&self, err: &CoreError, attempt: u32) {
        let hub = &self.inner.broadcaster;
        self.inner.session.finish_authentication(false);
        warn!(error = %err, attempt, "device flow authentication failed");
        hub.broadcast(Message::Auth(AuthEvent::Error {
            message: format!("Authentication failed: {err}"),
        }));

        if err.is_rate_limited() {
            info!("rate limited during authentication, not retrying automatically");
            let secs = self.inner.session.trip_rate_limit().as_secs();
            hub.notify_rate_limited("Rate limit reached - please try again later", secs);
            return;
        }

        let max_attempts = self.inner.config.init.max_attempts;
        if attempt >= max_attempts {
            error!(max_attempts, "authentication attempts exhausted");
            hub.notify(
                StatusKind::AuthFailed,
                "Authentication failed - please check manually",
            );
            return;
        }

        let delay = self.inner.config.init.retry_delay;
        info!(attempt, max_attempts, ?delay, "authentication will be retried");
        let this = self.clone();
        let cancel = self.current_cancel();
        self.track(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if this.inner.session.is_authenticated()
                || !this.inner.session.try_begin_authentication()
            {
                return;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = this.authenticate_and_start(true) => {}
            }
        }));
    }

    async fn on_authenticated(&self) {
        self.inner.session.finish_authentication(true);
        info!("authenticated");
        self.inner
            .broadcaster
            .notify(StatusKind::Success, "Successfully initialized");
        self.start_background();
        if let Err(e) = self.fetch_devices().await {
            warn!(error = %e, "initial device fetch failed");
        }
        self.inner.initialized.store(true, Ordering::Release);
    }

    // ── Background tasks ─────────────────────────────────────────────

    fn start_background(&self) {
        let cancel = self.current_cancel();
        self.inner.supervisor.start();
        self.track(self.inner.tokens.start_auto_refresh(cancel.clone()));
        self.track(self.spawn_token_watcher(cancel.clone()));
        if let Some(period) = self.inner.config.update_interval {
            self.track(self.spawn_periodic_refresh(cancel, period));
        }
    }

    fn spawn_token_watcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let mut events = self.inner.tokens.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(TokenEvent::Rotated { generation }) => {
                            if this.inner.initialized.load(Ordering::Acquire) {
                                info!(generation, "token rotated after init, refreshing devices");
                                if let Err(e) = this.fetch_devices().await {
                                    warn!(error = %e, "device refresh after rotation failed");
                                }
                            }
                        }
                        Ok(TokenEvent::Revoked) => {
                            let engine = this.clone();
                            tokio::spawn(async move { engine.reauthenticate().await });
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "token events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn spawn_periodic_refresh(
        &self,
        cancel: CancellationToken,
        period: std::time::Duration,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if this.inner.session.is_authenticating() {
                            continue;
                        }
                        if let Err(e) = this.fetch_devices().await {
                            warn!(error = %e, "periodic device refresh failed");
                        }
                    }
                }
            }
        })
    }

    /// Credentials were revoked: reset, keep sessions, start over.
    async fn reauthenticate(&self) {
        warn!("refresh token revoked, re-authentication required");
        self.inner.broadcaster.notify(
            StatusKind::ReauthRequired,
            "Authorization expired - please authenticate again",
        );
        self.reset_state(false);
        self.initialize();
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Fetch the appliance list plus status and settings of every
    /// reachable appliance, then make sure the global stream is up.
    ///
    /// Returns the number of appliances listed.
    pub async fn fetch_devices(&self) -> Result<usize, CoreError> {
        let hub = &self.inner.broadcaster;
        if !self.inner.client.has_access_token() {
            warn!("device fetch requested without a token");
            hub.notify(StatusKind::ClientNotReady, "Client not ready");
            return Err(CoreError::NotAuthenticated);
        }

        info!("fetching devices");
        hub.notify(StatusKind::FetchingDevices, "Fetching devices...");

        let listing = match self.inner.client.list_appliances().await {
            Ok(listing) => listing,
            Err(e) if e.is_auth_expired() => {
                debug!("appliance list rejected, refreshing token and retrying once");
                let retried = match self.inner.tokens.refresh().await {
                    Ok(_) => self
                        .inner
                        .client
                        .list_appliances()
                        .await
                        .map_err(CoreError::from),
                    Err(refresh_err) => Err(refresh_err),
                };
                match retried {
                    Ok(listing) => listing,
                    Err(e) => return Err(self.device_error(e)),
                }
            }
            Err(e) => return Err(self.device_error(e.into())),
        };

        if listing.is_empty() {
            warn!("no appliances found");
            hub.notify(StatusKind::NoDevices, "No devices found - check the Home Connect app");
        }

        for appliance in &listing {
            self.inner
                .registry
                .apply_snapshot(&appliance.ha_id, &ApplianceUpdate::from_listing(appliance));
        }

        let reachable: Vec<String> = listing
            .iter()
            .filter_map(|a| self.inner.registry.get(&a.ha_id))
            .filter(|a| {
                if a.connected {
                    return true;
                }
                if a.appears_active() {
                    info!(appliance = %a.id, "appears active while not connected, fetching anyway");
                    return true;
                }
                debug!(appliance = %a.id, "appliance not connected");
                false
            })
            .map(|a| a.id.clone())
            .collect();
        join_all(reachable.iter().map(|id| self.fetch_appliance_state(id))).await;

        self.inner
            .supervisor
            .subscribe(StreamId::Global, Arc::clone(&self.inner.stream_handler));

        hub.broadcast(Message::Devices(self.inner.registry.snapshot()));
        hub.notify(
            StatusKind::Complete,
            format!("{} device(s) loaded", listing.len()),
        );
        Ok(listing.len())
    }

    fn device_error(&self, err: CoreError) -> CoreError {
        error!(error = %err, "failed to fetch devices");
        if err.is_rate_limited() {
            let secs = self.inner.session.trip_rate_limit().as_secs();
            self.inner
                .broadcaster
                .notify_rate_limited("Rate limited while fetching devices", secs);
        } else {
            self.inner
                .broadcaster
                .notify(StatusKind::DeviceError, format!("Device error: {err}"));
        }
        err
    }

    async fn fetch_appliance_state(&self, id: &str) {
        let (status, settings) = tokio::join!(
            self.inner.client.get_status(id),
            self.inner.client.get_settings(id)
        );
        match status {
            Ok(items) => {
                self.inner.registry.apply_batch(id, &rest_values(&items));
            }
            Err(e) => warn!(appliance = id, error = %e, "status fetch failed"),
        }
        match settings {
            Ok(items) => {
                self.inner.registry.apply_batch(id, &rest_values(&items));
            }
            Err(e) => warn!(appliance = id, error = %e, "settings fetch failed"),
        }
    }

    /// Refetch devices on behalf of a client. Ignored while not
    /// authenticated or while authentication runs.
    pub async fn request_refresh(&self) -> Result<usize, CoreError> {
        if !self.inner.session.is_authenticated() || self.inner.session.is_authenticating() {
            warn!("refresh request ignored, client not ready or authentication in progress");
            return Err(CoreError::NotAuthenticated);
        }
        self.fetch_devices().await
    }

    /// Look up active programs for `ids` (all appliances when empty).
    pub async fn request_active_programs(
        &self,
        ids: &[String],
        requested_by: Option<SessionId>,
        force: bool,
    ) -> Result<BatchOutcome, CoreError> {
        if !self.inner.session.is_authenticated() {
            warn!("active programs requested before authentication");
            if let Some(session) = &requested_by {
                self.inner.broadcaster.notify_session(
                    session,
                    StatusKind::ClientNotReady,
                    "Client not ready",
                );
            }
            return Err(CoreError::NotAuthenticated);
        }
        Ok(self
            .inner
            .scheduler
            .request_active_programs(ids, requested_by, force)
            .await)
    }

    // ── Reset / shutdown ─────────────────────────────────────────────

    /// Full reset: forget sessions, appliances and tokens (including the
    /// persisted one), cancel every timer and stream. The next session
    /// registration starts a fresh device flow.
    pub fn retry_authentication(&self) {
        info!("authentication reset requested");
        self.reset_state(true);
    }

    fn reset_state(&self, clear_sessions: bool) {
        {
            let mut child = lock(&self.inner.cancel_child);
            child.cancel();
            *child = self.inner.cancel.child_token();
        }
        for handle in lock(&self.inner.task_handles).drain(..) {
            handle.abort();
        }

        self.inner.supervisor.close_all();
        self.inner.scheduler.cancel_all();
        self.inner.registry.clear();
        self.inner.session.reset();
        if clear_sessions {
            self.inner.broadcaster.clear();
        }
        if let Err(e) = self.inner.tokens.invalidate() {
            warn!(error = %e, "failed to delete stored token");
        }
        self.inner.init_attempts.store(0, Ordering::Release);
        self.inner.initialized.store(false, Ordering::Release);
    }

    /// Stop every task and stream.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.scheduler.cancel_all();
        self.inner.supervisor.shutdown().await;
        let handles: Vec<JoinHandle<()>> = lock(&self.inner.task_handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!("engine stopped");
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn auth_event(progress: FlowProgress) -> Option<AuthEvent> {
    match progress {
        FlowProgress::Prompt(authorization) => Some(AuthEvent::Waiting(AuthPrompt {
            verification_uri: authorization.verification_uri,
            verification_uri_complete: authorization.verification_uri_complete,
            user_code: authorization.user_code,
            expires_in_secs: authorization.expires_in,
        })),
        FlowProgress::Polling {
            attempt,
            max_attempts,
        } => Some(AuthEvent::Polling {
            attempt,
            max_attempts,
        }),
        FlowProgress::SlowedDown { .. } => None,
    }
}

/// Build the stream handler: apply each event to the registry and
/// broadcast the device list when anything changed.
fn stream_handler(
    registry: Arc<DeviceRegistry>,
    broadcaster: Arc<SessionBroadcaster>,
) -> EventHandler {
    Arc::new(move |stream: &StreamId, event: StreamEvent| {
        if apply_stream_event(&registry, stream, &event) {
            broadcaster.broadcast(Message::Devices(registry.snapshot()));
        }
    })
}

/// Apply one stream event. Returns whether any appliance changed.
pub fn apply_stream_event(
    registry: &DeviceRegistry,
    stream: &StreamId,
    event: &StreamEvent,
) -> bool {
    let fallback = event
        .appliance_id
        .clone()
        .or_else(|| stream.appliance_id().map(str::to_owned));

    match &event.kind {
        StreamEventKind::Connected | StreamEventKind::Disconnected => {
            let connected = event.kind == StreamEventKind::Connected;
            fallback.is_some_and(|id| {
                debug!(appliance = %id, connected, "connection state event");
                registry.set_connected(&id, connected)
            })
        }
        kind if kind.carries_values() => {
            let mut batches: IndexMap<String, Vec<&hcsync_api::EventItem>> = IndexMap::new();
            for item in &event.items {
                let Some(id) = item.ha_id.clone().or_else(|| fallback.clone()) else {
                    continue;
                };
                batches.entry(id).or_default().push(item);
            }
            let mut changed = false;
            for (id, items) in batches {
                let values: Vec<(String, OptionValue)> = event_values(items);
                changed |= registry.apply_batch(&id, &values);
            }
            changed
        }
        StreamEventKind::KeepAlive => false,
        other => {
            debug!(kind = %other, appliance = ?fallback, "ignoring stream event");
            false
        }
    }
}
