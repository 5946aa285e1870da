// ── Session context ──
//
// Engine-wide authentication and throttling state, injected into every
// component that needs it. Replaces process-global flags.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Timing policy for authentication attempts and program batches.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Minimum spacing between two authentication attempts.
    pub min_auth_interval: Duration,
    /// Minimum spacing between two active-program batches.
    pub min_batch_interval: Duration,
    /// Cooldown lengths a 429 picks from.
    pub cooldown_choices: Vec<Duration>,
    /// Upper bound for any cooldown.
    pub cooldown_cap: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            min_auth_interval: Duration::from_secs(60),
            min_batch_interval: Duration::from_secs(10),
            cooldown_choices: vec![
                Duration::from_secs(2 * 60),
                Duration::from_secs(4 * 60),
                Duration::from_secs(8 * 60),
            ],
            cooldown_cap: Duration::from_secs(10 * 60),
        }
    }
}

/// Why a batch request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRefusal {
    /// A 429 cooldown is running. Never bypassed.
    Cooldown { remaining: Duration },
    /// The previous batch was too recent. Bypassed by `force`.
    Throttled { wait: Duration },
}

#[derive(Debug, Default)]
struct Timers {
    last_auth_attempt: Option<Instant>,
    rate_limit_until: Option<DateTime<Utc>>,
    last_batch_at: Option<Instant>,
}

/// Authentication flags plus throttle timers.
#[derive(Debug)]
pub struct SessionContext {
    authenticated: AtomicBool,
    authenticating: AtomicBool,
    timers: Mutex<Timers>,
    policy: SessionPolicy,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}

impl SessionContext {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            authenticated: AtomicBool::new(false),
            authenticating: AtomicBool::new(false),
            timers: Mutex::new(Timers::default()),
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Authentication flags ─────────────────────────────────────────

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_authenticating(&self) -> bool {
        self.authenticating.load(Ordering::Acquire)
    }

    /// Time left before another authentication attempt is allowed.
    pub fn auth_wait(&self) -> Option<Duration> {
        let timers = self.timers();
        let last = timers.last_auth_attempt?;
        self.policy
            .min_auth_interval
            .checked_sub(last.elapsed())
            .filter(|d| !d.is_zero())
    }

    /// Claim the single authentication slot. Returns `false` if an attempt
    /// is already in flight.
    pub fn try_begin_authentication(&self) -> bool {
        self.authenticating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stamp the start of a device-flow attempt for the interval check.
    pub fn record_auth_attempt(&self) {
        self.timers().last_auth_attempt = Some(Instant::now());
    }

    /// Release the authentication slot and record the outcome.
    pub fn finish_authentication(&self, success: bool) {
        self.authenticated.store(success, Ordering::Release);
        self.authenticating.store(false, Ordering::Release);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    // ── Rate-limit cooldown ──────────────────────────────────────────

    /// Start (or extend) a cooldown of a pseudo-random length from the
    /// policy's choices. Returns the chosen length.
    pub fn trip_rate_limit(&self) -> Duration {
        let choices = &self.policy.cooldown_choices;
        let chosen = if choices.is_empty() {
            self.policy.cooldown_cap
        } else {
            let index = rand::thread_rng().gen_range(0..choices.len());
            choices
                .get(index)
                .copied()
                .unwrap_or(self.policy.cooldown_cap)
        };
        self.trip_rate_limit_for(chosen)
    }

    /// Start (or extend) a cooldown of exactly `duration` (capped).
    pub fn trip_rate_limit_for(&self, duration: Duration) -> Duration {
        let duration = duration.min(self.policy.cooldown_cap);
        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        let mut timers = self.timers();
        if timers.rate_limit_until.is_none_or(|current| current < until) {
            timers.rate_limit_until = Some(until);
        }
        warn!(cooldown_secs = duration.as_secs(), "rate limit cooldown started");
        duration
    }

    /// Remaining cooldown, if one is running.
    pub fn rate_limit_remaining(&self) -> Option<Duration> {
        let until = self.timers().rate_limit_until?;
        (until - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn rate_limited_until(&self) -> Option<DateTime<Utc>> {
        self.timers()
            .rate_limit_until
            .filter(|until| *until > Utc::now())
    }

    // ── Batch throttle ───────────────────────────────────────────────

    /// Claim the right to run an active-program batch now.
    ///
    /// The cooldown always applies. The minimum interval applies unless
    /// `force` is set. On success the batch clock restarts.
    pub fn try_acquire_batch_slot(&self, force: bool) -> Result<(), BatchRefusal> {
        if let Some(remaining) = self.rate_limit_remaining() {
            return Err(BatchRefusal::Cooldown { remaining });
        }
        let mut timers = self.timers();
        if !force {
            if let Some(wait) = timers.last_batch_at.and_then(|last| {
                self.policy
                    .min_batch_interval
                    .checked_sub(last.elapsed())
                    .filter(|d| !d.is_zero())
            }) {
                return Err(BatchRefusal::Throttled { wait });
            }
        }
        timers.last_batch_at = Some(Instant::now());
        Ok(())
    }

    // ── Reset ────────────────────────────────────────────────────────

    /// Back to the pre-authentication state.
    ///
    /// A running cooldown survives: upstream still enforces it.
    pub fn reset(&self) {
        self.authenticated.store(false, Ordering::Release);
        self.authenticating.store(false, Ordering::Release);
        let mut timers = self.timers();
        timers.last_auth_attempt = None;
        timers.last_batch_at = None;
        debug!("session context reset");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn single_authentication_slot() {
        let session = SessionContext::default();
        assert!(session.try_begin_authentication());
        assert!(!session.try_begin_authentication());
        assert!(session.is_authenticating());
        assert!(session.auth_wait().is_none());

        session.finish_authentication(true);
        assert!(!session.is_authenticating());
        assert!(session.is_authenticated());
        assert!(session.try_begin_authentication());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_attempts_are_spaced() {
        let session = SessionContext::default();
        session.record_auth_attempt();
        let wait = session.auth_wait().unwrap();
        assert!(wait <= Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.auth_wait().is_none());
    }

    #[test]
    fn cooldown_is_capped_and_picked_from_choices() {
        let session = SessionContext::default();
        let chosen = session.trip_rate_limit();
        assert!(
            [120, 240, 480].contains(&chosen.as_secs()),
            "unexpected cooldown {chosen:?}"
        );
        let remaining = session.rate_limit_remaining().unwrap();
        assert!(remaining <= chosen);
        assert!(remaining > Duration::from_secs(100));

        let session = SessionContext::default();
        let capped = session.trip_rate_limit_for(Duration::from_secs(3600));
        assert_eq!(capped, Duration::from_secs(600));
    }

    #[test]
    fn cooldown_suppresses_forced_batches() {
        let session = SessionContext::default();
        session.trip_rate_limit_for(Duration::from_secs(120));
        assert!(matches!(
            session.try_acquire_batch_slot(true),
            Err(BatchRefusal::Cooldown { .. })
        ));
    }

    #[test]
    fn min_interval_throttles_unless_forced() {
        let session = SessionContext::default();
        assert!(session.try_acquire_batch_slot(false).is_ok());
        assert!(matches!(
            session.try_acquire_batch_slot(false),
            Err(BatchRefusal::Throttled { .. })
        ));
        assert!(session.try_acquire_batch_slot(true).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_interval_elapses() {
        let session = SessionContext::default();
        assert!(session.try_acquire_batch_slot(false).is_ok());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(session.try_acquire_batch_slot(false).is_ok());
    }

    #[test]
    fn reset_keeps_cooldown() {
        let session = SessionContext::default();
        session.try_begin_authentication();
        session.record_auth_attempt();
        session.finish_authentication(true);
        session.trip_rate_limit_for(Duration::from_secs(120));
        session.reset();
        assert!(!session.is_authenticated());
        assert!(session.auth_wait().is_none());
        assert!(session.rate_limit_remaining().is_some());
    }
}
