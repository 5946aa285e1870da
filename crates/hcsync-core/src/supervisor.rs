// ── Event stream supervisor ──
//
// Owns the global event stream and any per-appliance streams. Each
// stream is one slot: a handler, a state, a cancel token and an epoch.
// A connection task only acts while its epoch is still the slot's
// epoch, so a detached stream can neither dispatch nor report errors.
//
// Failures feed a single reconnect plan. The first failure arms its
// timer; later failures join the pending set. Auth failures make the
// plan refresh the token first, and the resulting rotation recreates
// every stream opened with an older credential.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hcsync_api::{HomeConnectClient, StreamEvent};

use crate::broadcast::{SessionBroadcaster, StatusKind};
use crate::error::CoreError;
use crate::heartbeat::{Heartbeat, HeartbeatConfig, Liveness};
use crate::token::{TokenEvent, TokenStore};

/// Slot generation while the pre-subscribe refresh is still running.
const PENDING_GENERATION: u64 = u64::MAX;

// ── Public types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// `api/homeappliances/events`
    Global,
    /// `api/homeappliances/{id}/events`
    Appliance(String),
}

impl StreamId {
    pub fn appliance_id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Appliance(id) => Some(id),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Appliance(id) => write!(f, "appliance:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Connecting,
    Open,
    /// Open, but silent past the heartbeat threshold.
    Degraded,
}

/// Receives every event of a stream.
pub type EventHandler = Arc<dyn Fn(&StreamId, StreamEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat: HeartbeatConfig,
    /// Reconnect delay after a 401/403.
    pub auth_retry_delay: Duration,
    /// Reconnect delay after 429, transport errors or end of stream.
    pub transient_retry_delay: Duration,
    /// A token older than this is refreshed before a new subscription.
    pub pre_subscribe_max_age: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            auth_retry_delay: Duration::from_secs(30),
            transient_retry_delay: Duration::from_secs(10),
            pre_subscribe_max_age: Duration::from_secs(5 * 60),
        }
    }
}

// ── Internal state ───────────────────────────────────────────────────

struct Slot {
    epoch: u64,
    handler: EventHandler,
    state: StreamState,
    cancel: CancellationToken,
    /// Token generation the connection was opened with.
    generation: u64,
}

struct ReconnectPlan {
    pending: HashSet<StreamId>,
    refresh_first: bool,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Auth,
    Transient,
}

impl Failure {
    fn classify(err: &hcsync_api::Error) -> Self {
        if err.is_auth_expired() {
            Self::Auth
        } else {
            Self::Transient
        }
    }
}

struct SupervisorInner {
    client: Arc<HomeConnectClient>,
    tokens: Arc<TokenStore>,
    broadcaster: Arc<SessionBroadcaster>,
    config: SupervisorConfig,
    slots: Mutex<HashMap<StreamId, Slot>>,
    reconnect: Mutex<Option<ReconnectPlan>>,
    heartbeat: Mutex<Heartbeat>,
    next_epoch: AtomicU64,
    connection_attempts: AtomicU64,
    started: AtomicBool,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── EventStreamSupervisor ────────────────────────────────────────────

/// Cheaply cloneable handle to the supervisor.
#[derive(Clone)]
pub struct EventStreamSupervisor {
    inner: Arc<SupervisorInner>,
}

impl EventStreamSupervisor {
    pub fn new(
        client: Arc<HomeConnectClient>,
        tokens: Arc<TokenStore>,
        broadcaster: Arc<SessionBroadcaster>,
        config: SupervisorConfig,
        parent: &CancellationToken,
    ) -> Self {
        let heartbeat = Heartbeat::new(config.heartbeat.stale_after);
        Self {
            inner: Arc::new(SupervisorInner {
                client,
                tokens,
                broadcaster,
                config,
                slots: Mutex::new(HashMap::new()),
                reconnect: Mutex::new(None),
                heartbeat: Mutex::new(heartbeat),
                next_epoch: AtomicU64::new(1),
                connection_attempts: AtomicU64::new(0),
                started: AtomicBool::new(false),
                cancel: parent.child_token(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the rotation listener and, if enabled, the heartbeat monitor.
    /// Calling it again does nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handles = lock(&self.inner.task_handles);
        handles.push(self.spawn_rotation_listener());
        if self.inner.config.heartbeat.enabled {
            handles.push(self.spawn_heartbeat_monitor());
        }
    }

    /// Ensure `id` is connected and dispatching to `handler`.
    ///
    /// Returns `false` when the stream already exists with this exact
    /// handler. A different handler replaces the old one and the stream is
    /// recreated.
    pub fn subscribe(&self, id: StreamId, handler: EventHandler) -> bool {
        let mut slots = lock(&self.inner.slots);
        if let Some(slot) = slots.get(&id) {
            if Arc::ptr_eq(&slot.handler, &handler) {
                debug!(stream = %id, "already subscribed with this handler");
                return false;
            }
            info!(stream = %id, "replacing stream handler");
        }
        self.insert_slot(&mut slots, id, handler, true);
        true
    }

    pub fn state(&self, id: &StreamId) -> StreamState {
        lock(&self.inner.slots)
            .get(id)
            .map_or(StreamState::Closed, |slot| slot.state)
    }

    pub fn streams(&self) -> Vec<StreamId> {
        lock(&self.inner.slots).keys().cloned().collect()
    }

    /// Number of connection attempts made so far.
    pub fn connection_attempts(&self) -> u64 {
        self.inner.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.inner.reconnect).is_some()
    }

    /// Detach and cancel one stream. Idempotent.
    pub fn close(&self, id: &StreamId) {
        let removed = lock(&self.inner.slots).remove(id);
        if let Some(plan) = lock(&self.inner.reconnect).as_mut() {
            plan.pending.remove(id);
        }
        if let Some(slot) = removed {
            slot.cancel.cancel();
            info!(stream = %id, "event stream closed");
        }
    }

    /// Detach and cancel every stream and any pending reconnect. Idempotent.
    pub fn close_all(&self) {
        let removed: Vec<(StreamId, Slot)> = lock(&self.inner.slots).drain().collect();
        if let Some(plan) = lock(&self.inner.reconnect).take() {
            plan.cancel.cancel();
        }
        for (id, slot) in removed {
            slot.cancel.cancel();
            debug!(stream = %id, "event stream closed");
        }
        lock(&self.inner.heartbeat).reset();
    }

    /// Close everything and stop the background tasks.
    pub async fn shutdown(&self) {
        self.close_all();
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.inner.task_handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ── Slot management ──────────────────────────────────────────────

    fn insert_slot(
        &self,
        slots: &mut HashMap<StreamId, Slot>,
        id: StreamId,
        handler: EventHandler,
        pre_refresh: bool,
    ) {
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        let generation = if pre_refresh {
            PENDING_GENERATION
        } else {
            self.inner.tokens.generation()
        };

        let previous = slots.insert(
            id.clone(),
            Slot {
                epoch,
                handler,
                state: StreamState::Connecting,
                cancel: cancel.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_stream(id, epoch, cancel, pre_refresh).await;
        });
    }

    /// Run `f` on the slot if `epoch` is still current.
    fn with_slot(&self, id: &StreamId, epoch: u64, f: impl FnOnce(&mut Slot)) -> bool {
        match lock(&self.inner.slots).get_mut(id) {
            Some(slot) if slot.epoch == epoch => {
                f(slot);
                true
            }
            _ => false,
        }
    }

    // ── Connection task ──────────────────────────────────────────────

    async fn run_stream(
        self,
        id: StreamId,
        epoch: u64,
        cancel: CancellationToken,
        pre_refresh: bool,
    ) {
        if pre_refresh {
            let max_age = self.inner.config.pre_subscribe_max_age;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = self.inner.tokens.ensure_fresh(max_age) => {
                    if let Err(e) = result {
                        warn!(stream = %id, error = %e, "pre-subscribe token refresh failed, connecting anyway");
                    }
                }
            }
            let generation = self.inner.tokens.generation();
            if !self.with_slot(&id, epoch, |slot| slot.generation = generation) {
                return;
            }
        }

        self.inner.connection_attempts.fetch_add(1, Ordering::Relaxed);
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = self.inner.client.open_event_stream(id.appliance_id()) => result,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(e) => {
                warn!(stream = %id, error = %e, "event stream connect failed");
                self.on_stream_failure(&id, epoch, Failure::classify(&e));
                return;
            }
        };

        if !self.with_slot(&id, epoch, |slot| slot.state = StreamState::Open) {
            return;
        }
        info!(stream = %id, "event stream open");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                next = events.next() => match next {
                    Some(Ok(event)) => self.dispatch(&id, epoch, event),
                    Some(Err(e)) => {
                        warn!(stream = %id, error = %e, "event stream failed");
                        self.on_stream_failure(&id, epoch, Failure::classify(&e));
                        return;
                    }
                    None => {
                        info!(stream = %id, "event stream ended");
                        self.on_stream_failure(&id, epoch, Failure::Transient);
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, id: &StreamId, epoch: u64, event: StreamEvent) {
        let handler = match lock(&self.inner.slots).get(id) {
            Some(slot) if slot.epoch == epoch => Arc::clone(&slot.handler),
            _ => return,
        };
        self.observe_event();
        handler(id, event);
    }

    // ── Reconnect ────────────────────────────────────────────────────

    fn on_stream_failure(&self, id: &StreamId, epoch: u64, failure: Failure) {
        if !self.with_slot(id, epoch, |slot| slot.state = StreamState::Closed) {
            debug!(stream = %id, "ignoring failure from detached stream");
            return;
        }
        self.schedule_reconnect(id.clone(), failure == Failure::Auth);
    }

    fn schedule_reconnect(&self, id: StreamId, refresh_first: bool) {
        let mut plan = lock(&self.inner.reconnect);
        if let Some(plan) = plan.as_mut() {
            debug!(stream = %id, refresh_first, "reconnect already scheduled, coalescing");
            plan.pending.insert(id);
            plan.refresh_first |= refresh_first;
            return;
        }

        let delay = if refresh_first {
            self.inner.config.auth_retry_delay
        } else {
            self.inner.config.transient_retry_delay
        };
        let cancel = self.inner.cancel.child_token();
        info!(stream = %id, refresh_first, ?delay, "reconnect scheduled");
        *plan = Some(ReconnectPlan {
            pending: HashSet::from([id]),
            refresh_first,
            cancel: cancel.clone(),
        });
        drop(plan);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            this.run_reconnect().await;
        });
    }

    async fn run_reconnect(&self) {
        let Some(plan) = lock(&self.inner.reconnect).take() else {
            return;
        };
        if plan.cancel.is_cancelled() {
            return;
        }

        if plan.refresh_first {
            match self.inner.tokens.refresh().await {
                Ok(_) => {}
                Err(CoreError::InvalidGrant { .. }) => {
                    warn!("token revoked, streams stay closed until re-authentication");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "token refresh before reconnect failed");
                    for id in plan.pending {
                        self.schedule_reconnect(id, true);
                    }
                    return;
                }
            }
        }

        self.reset_heartbeat();
        let generation = self.inner.tokens.generation();
        let mut slots = lock(&self.inner.slots);
        for id in plan.pending {
            let Some(slot) = slots.get(&id) else {
                continue;
            };
            let stale_credential = plan.refresh_first
                && slot.generation != PENDING_GENERATION
                && slot.generation < generation;
            if slot.state == StreamState::Closed || stale_credential {
                let handler = Arc::clone(&slot.handler);
                info!(stream = %id, "reconnecting event stream");
                self.insert_slot(&mut slots, id, handler, false);
            }
        }
    }

    // ── Credential rotation ──────────────────────────────────────────

    fn spawn_rotation_listener(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut events = self.inner.tokens.subscribe();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(TokenEvent::Rotated { generation }) => this.recreate_older_than(generation),
                        Ok(TokenEvent::Revoked) => debug!("token revoked"),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "token events lagged");
                            this.recreate_older_than(this.inner.tokens.generation());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Recreate every stream opened with a credential older than
    /// `generation`.
    fn recreate_older_than(&self, generation: u64) {
        let mut slots = lock(&self.inner.slots);
        let stale: Vec<(StreamId, EventHandler)> = slots
            .iter()
            .filter(|(_, slot)| slot.generation < generation)
            .map(|(id, slot)| (id.clone(), Arc::clone(&slot.handler)))
            .collect();
        for (id, handler) in stale {
            info!(stream = %id, generation, "credential rotated, recreating stream");
            self.insert_slot(&mut slots, id, handler, false);
        }
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    fn spawn_heartbeat_monitor(&self) -> JoinHandle<()> {
        let this = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.heartbeat.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => this.check_heartbeat(),
                }
            }
        })
    }

    fn check_heartbeat(&self) {
        let transition = lock(&self.inner.heartbeat).check(Instant::now());
        if let Some(Liveness::BecameStale { silent_for }) = transition {
            self.set_open_states(StreamState::Open, StreamState::Degraded);
            warn!(silent_secs = silent_for.as_secs(), "event streams are stale");
            self.inner.broadcaster.notify(
                StatusKind::SseStale,
                format!("No events received for {}s", silent_for.as_secs()),
            );
        }
    }

    fn observe_event(&self) {
        if !self.inner.config.heartbeat.enabled {
            return;
        }
        let transition = lock(&self.inner.heartbeat).record_event(Instant::now());
        if transition == Some(Liveness::Recovered) {
            self.announce_recovery();
        }
    }

    fn reset_heartbeat(&self) {
        if !self.inner.config.heartbeat.enabled {
            return;
        }
        let transition = lock(&self.inner.heartbeat).reset();
        if transition == Some(Liveness::Recovered) {
            self.announce_recovery();
        }
    }

    fn announce_recovery(&self) {
        self.set_open_states(StreamState::Degraded, StreamState::Open);
        info!("event streams recovered");
        self.inner
            .broadcaster
            .notify(StatusKind::SseRecovered, "Event stream recovered");
    }

    fn set_open_states(&self, from: StreamState, to: StreamState) {
        for slot in lock(&self.inner.slots).values_mut() {
            if slot.state == from {
                slot.state = to;
            }
        }
    }
}
