// ── Active-program scheduler ──
//
// Sequential, paced active-program lookups with a bounded per-appliance
// retry for appliances that look busy but report no program yet.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hcsync_api::HomeConnectClient;

use crate::broadcast::{
    ActivePrograms, Message, Notification, ProgramEntry, SessionBroadcaster, SessionId,
    StatusKind,
};
use crate::error::CoreError;
use crate::model::{Appliance, ProgramSummary, rest_values};
use crate::session::{BatchRefusal, SessionContext};
use crate::store::DeviceRegistry;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between two lookups of one batch.
    pub pacing: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(500),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

// ── Retry state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    /// Timer armed.
    Scheduled,
    /// Lookup running.
    InFlight,
}

/// Read-only view of one appliance's retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySnapshot {
    pub attempt: u32,
    pub phase: RetryPhase,
    pub requested_by: Option<SessionId>,
}

struct RetryState {
    attempt: u32,
    phase: RetryPhase,
    timer: Option<CancellationToken>,
    requested_by: Option<SessionId>,
}

/// How a batch request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed {
        fetched: usize,
        skipped: usize,
        retries_scheduled: usize,
    },
    /// Upstream answered 429; the batch was aborted.
    RateLimited { cooldown: Duration },
    /// Too soon after the previous batch.
    Throttled { wait: Duration },
    /// A rate-limit cooldown is running.
    Suppressed { remaining: Duration },
}

/// Result of one lookup, after the registry has been updated.
enum Lookup {
    Running(ProgramSummary),
    Idle,
    /// Looks busy, but no program reported yet.
    NotYet,
    RateLimited,
    Failed(CoreError),
}

// ── Scheduler ────────────────────────────────────────────────────────

struct SchedulerInner {
    client: Arc<HomeConnectClient>,
    registry: Arc<DeviceRegistry>,
    broadcaster: Arc<SessionBroadcaster>,
    session: Arc<SessionContext>,
    config: SchedulerConfig,
    retries: Mutex<HashMap<String, RetryState>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ActiveProgramScheduler {
    inner: Arc<SchedulerInner>,
}

impl ActiveProgramScheduler {
    pub fn new(
        client: Arc<HomeConnectClient>,
        registry: Arc<DeviceRegistry>,
        broadcaster: Arc<SessionBroadcaster>,
        session: Arc<SessionContext>,
        config: SchedulerConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                client,
                registry,
                broadcaster,
                session,
                config,
                retries: Mutex::new(HashMap::new()),
                cancel: parent.child_token(),
            }),
        }
    }

    fn retries(&self) -> MutexGuard<'_, HashMap<String, RetryState>> {
        self.inner
            .retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up active programs for `ids` (every known appliance when
    /// empty), subject to the batch throttle and the rate-limit cooldown.
    pub async fn request_active_programs(
        &self,
        ids: &[String],
        requested_by: Option<SessionId>,
        force: bool,
    ) -> BatchOutcome {
        match self.inner.session.try_acquire_batch_slot(force) {
            Ok(()) => {}
            Err(BatchRefusal::Cooldown { remaining }) => {
                info!(
                    remaining_secs = remaining.as_secs(),
                    "active-program batch suppressed by cooldown"
                );
                if let Some(session) = &requested_by {
                    self.inner.broadcaster.send_to(
                        session,
                        Message::Status(Notification {
                            kind: StatusKind::RateLimited,
                            message: "Rate limited, try again later".into(),
                            rate_limit_seconds: Some(remaining.as_secs()),
                        }),
                    );
                }
                return BatchOutcome::Suppressed { remaining };
            }
            Err(BatchRefusal::Throttled { wait }) => {
                debug!(?wait, "active-program batch throttled");
                return BatchOutcome::Throttled { wait };
            }
        }

        let targets: Vec<Arc<Appliance>> = if ids.is_empty() {
            self.inner.registry.snapshot().iter().cloned().collect()
        } else {
            ids.iter()
                .filter_map(|id| self.inner.registry.get(id))
                .collect()
        };

        self.inner
            .broadcaster
            .notify(StatusKind::FetchingPrograms, "Fetching active programs");
        self.run_batch(&targets, requested_by).await
    }

    async fn run_batch(
        &self,
        targets: &[Arc<Appliance>],
        requested_by: Option<SessionId>,
    ) -> BatchOutcome {
        let mut programs = BTreeMap::new();
        let (mut fetched, mut skipped, mut retries_scheduled) = (0, 0, 0);

        for appliance in targets {
            if !appliance.connected && !appliance.appears_active() {
                skipped += 1;
                continue;
            }
            if fetched > 0 {
                tokio::select! {
                    biased;
                    () = self.inner.cancel.cancelled() => {
                        return BatchOutcome::Completed { fetched, skipped, retries_scheduled };
                    }
                    () = tokio::time::sleep(self.inner.config.pacing) => {}
                }
            }
            fetched += 1;

            let program = match self.lookup(&appliance.id).await {
                Lookup::Running(summary) => Some(summary),
                Lookup::Idle => None,
                Lookup::NotYet => {
                    if self.schedule_retry(&appliance.id, requested_by.clone()) {
                        retries_scheduled += 1;
                    }
                    None
                }
                Lookup::RateLimited => {
                    let cooldown = self.trip_cooldown();
                    return BatchOutcome::RateLimited { cooldown };
                }
                Lookup::Failed(e) => {
                    warn!(appliance = %appliance.id, error = %e, "active program lookup failed");
                    continue;
                }
            };
            programs.insert(
                appliance.id.clone(),
                ProgramEntry {
                    name: appliance.name.clone(),
                    program,
                },
            );
        }

        self.publish(programs, requested_by);
        BatchOutcome::Completed {
            fetched,
            skipped,
            retries_scheduled,
        }
    }

    /// One lookup; the registry is updated before returning.
    async fn lookup(&self, id: &str) -> Lookup {
        match self.inner.client.get_active_program(id).await {
            Ok(program) => {
                let summary = ProgramSummary {
                    key: program.key,
                    name: program.name,
                };
                let options = rest_values(&program.options);
                self.inner
                    .registry
                    .apply_program(id, Some(summary.clone()), &options);
                self.clear_retry(id);
                debug!(appliance = id, program = %summary.key, "active program found");
                Lookup::Running(summary)
            }
            Err(e) if e.is_not_found() => {
                let busy = self
                    .inner
                    .registry
                    .get(id)
                    .is_some_and(|a| a.appears_active());
                if busy {
                    debug!(appliance = id, "appliance busy but no program reported yet");
                    Lookup::NotYet
                } else {
                    self.inner.registry.apply_program(id, None, &[]);
                    self.clear_retry(id);
                    Lookup::Idle
                }
            }
            Err(e) if e.is_rate_limited() => Lookup::RateLimited,
            Err(e) => Lookup::Failed(e.into()),
        }
    }

    fn trip_cooldown(&self) -> Duration {
        let cooldown = self.inner.session.trip_rate_limit();
        self.inner.broadcaster.notify_rate_limited(
            format!("Rate limited by upstream, pausing for {} minutes", cooldown.as_secs() / 60),
            cooldown.as_secs(),
        );
        cooldown
    }

    fn publish(&self, programs: BTreeMap<String, ProgramEntry>, requested_by: Option<SessionId>) {
        self.inner
            .broadcaster
            .broadcast(Message::Devices(self.inner.registry.snapshot()));
        self.inner
            .broadcaster
            .broadcast(Message::ActivePrograms(ActivePrograms {
                programs,
                requested_by,
                timestamp: Utc::now(),
            }));
    }

    // ── Retries ──────────────────────────────────────────────────────

    /// Arm a retry timer for `id`. Returns `false` when a retry is already
    /// pending or running, or when the attempt budget is spent (the retry
    /// state is then dropped).
    pub fn schedule_retry(&self, id: &str, requested_by: Option<SessionId>) -> bool {
        let mut retries = self.retries();
        let state = retries.entry(id.to_owned()).or_insert_with(|| RetryState {
            attempt: 0,
            phase: RetryPhase::Idle,
            timer: None,
            requested_by: None,
        });
        if state.phase != RetryPhase::Idle {
            debug!(appliance = id, "retry already pending");
            return false;
        }
        if state.attempt >= self.inner.config.max_retries {
            debug!(appliance = id, attempts = state.attempt, "active program retries exhausted");
            retries.remove(id);
            return false;
        }

        let timer = self.inner.cancel.child_token();
        state.attempt += 1;
        state.phase = RetryPhase::Scheduled;
        state.timer = Some(timer.clone());
        if requested_by.is_some() {
            state.requested_by = requested_by;
        }
        debug!(appliance = id, attempt = state.attempt, "active program retry scheduled");
        drop(retries);

        let this = self.clone();
        let id = id.to_owned();
        let delay = self.inner.config.retry_delay;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timer.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            this.run_retry(&id).await;
        });
        true
    }

    async fn run_retry(&self, id: &str) {
        let requested_by = {
            let mut retries = self.retries();
            let Some(state) = retries.get_mut(id) else {
                return;
            };
            if state.phase != RetryPhase::Scheduled {
                return;
            }
            state.phase = RetryPhase::InFlight;
            state.requested_by.clone()
        };

        if self.inner.session.rate_limit_remaining().is_some() {
            debug!(appliance = id, "cooldown running, dropping retry");
            self.clear_retry(id);
            return;
        }

        match self.lookup(id).await {
            Lookup::Running(summary) => self.publish_single(id, Some(summary), requested_by),
            Lookup::Idle => self.publish_single(id, None, requested_by),
            Lookup::NotYet => {
                if let Some(state) = self.retries().get_mut(id) {
                    state.phase = RetryPhase::Idle;
                    state.timer = None;
                }
                self.schedule_retry(id, None);
            }
            Lookup::RateLimited => {
                self.clear_retry(id);
                self.trip_cooldown();
            }
            Lookup::Failed(e) => {
                warn!(appliance = id, error = %e, "active program retry failed");
                self.clear_retry(id);
            }
        }
    }

    fn publish_single(
        &self,
        id: &str,
        program: Option<ProgramSummary>,
        requested_by: Option<SessionId>,
    ) {
        let name = self
            .inner
            .registry
            .get(id)
            .map(|a| a.name.clone())
            .unwrap_or_default();
        let programs = BTreeMap::from([(id.to_owned(), ProgramEntry { name, program })]);
        self.publish(programs, requested_by);
    }

    fn clear_retry(&self, id: &str) {
        if let Some(state) = self.retries().remove(id) {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
        }
    }

    /// Cancel every pending retry.
    pub fn cancel_all(&self) {
        let drained: Vec<RetryState> = self.retries().drain().map(|(_, s)| s).collect();
        for state in drained {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
        }
    }

    pub fn retry_state(&self, id: &str) -> Option<RetrySnapshot> {
        self.retries().get(id).map(|s| RetrySnapshot {
            attempt: s.attempt,
            phase: s.phase,
            requested_by: s.requested_by.clone(),
        })
    }

    /// Number of appliances with a retry timer armed or running.
    pub fn pending_retries(&self) -> usize {
        self.retries()
            .values()
            .filter(|s| s.phase != RetryPhase::Idle)
            .count()
    }
}
