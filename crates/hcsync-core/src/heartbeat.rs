// ── Stream heartbeat ──
//
// Liveness tracking for event streams. Pure state: the supervisor feeds
// it event timestamps and polls it on a fixed interval.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// How often staleness is checked.
    pub check_interval: Duration,
    /// Silence longer than this marks the streams stale.
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(180),
        }
    }
}

/// Transition reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    BecameStale { silent_for: Duration },
    Recovered,
}

/// Last-event tracking with stale/recovered edges.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    stale_after: Duration,
    /// `None` until the first event after a (re)subscribe.
    last_event: Option<Instant>,
    stale: bool,
}

impl Heartbeat {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last_event: None,
            stale: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.last_event.is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Any event, keep-alives included. Returns `Recovered` if the
    /// streams were stale.
    pub fn record_event(&mut self, now: Instant) -> Option<Liveness> {
        self.last_event = Some(now);
        if self.stale {
            self.stale = false;
            return Some(Liveness::Recovered);
        }
        None
    }

    /// Periodic check. Returns `BecameStale` on the first check past the
    /// threshold; later checks stay quiet until recovery.
    pub fn check(&mut self, now: Instant) -> Option<Liveness> {
        let last = self.last_event?;
        let silent_for = now.saturating_duration_since(last);
        if !self.stale && silent_for > self.stale_after {
            self.stale = true;
            return Some(Liveness::BecameStale { silent_for });
        }
        None
    }

    /// Explicit reconnect: disarm and clear staleness. Returns
    /// `Recovered` if the streams were stale.
    pub fn reset(&mut self) -> Option<Liveness> {
        self.last_event = None;
        if self.stale {
            self.stale = false;
            return Some(Liveness::Recovered);
        }
        None
    }
}
