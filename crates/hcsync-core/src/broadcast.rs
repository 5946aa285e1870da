// ── Session broadcaster ──
//
// Fan-out of status notifications, auth events, device lists and
// active-program payloads to every registered logical client session.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::model::{Appliance, ProgramSummary};

const DELIVERY_CHANNEL_SIZE: usize = 256;

// ── Session identity ─────────────────────────────────────────────────

/// Opaque identifier for one logical consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

// ── Messages ─────────────────────────────────────────────────────────

/// Named status notifications.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusKind {
    Initializing,
    SessionActive,
    TokenFound,
    NeedAuth,
    InitializingClient,
    Success,
    FetchingDevices,
    Complete,
    NoDevices,
    DeviceError,
    ClientNotReady,
    ClientError,
    FetchingPrograms,
    SseStale,
    SseRecovered,
    RateLimited,
    AuthInProgress,
    ReauthRequired,
    AuthFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: StatusKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_seconds: Option<u64>,
}

/// What the user must do to finish a device-flow login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPrompt {
    pub verification_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    pub user_code: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthEvent {
    Waiting(AuthPrompt),
    Polling { attempt: u32, max_attempts: u32 },
    Success,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramEntry {
    pub name: String,
    pub program: Option<ProgramSummary>,
}

/// Result of one active-program batch, keyed by appliance id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePrograms {
    pub programs: BTreeMap<String, ProgramEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<SessionId>,
    pub timestamp: DateTime<Utc>,
}

/// One message for the collaborator surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    Status(Notification),
    Devices(Arc<Vec<Arc<Appliance>>>),
    ActivePrograms(ActivePrograms),
    Auth(AuthEvent),
}

impl Message {
    pub fn status(kind: StatusKind, message: impl Into<String>) -> Self {
        Self::Status(Notification {
            kind,
            message: message.into(),
            rate_limit_seconds: None,
        })
    }

    pub fn status_kind(&self) -> Option<StatusKind> {
        match self {
            Self::Status(n) => Some(n.kind),
            _ => None,
        }
    }
}

/// A message addressed to one session.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub session: SessionId,
    pub message: Arc<Message>,
}

// ── Broadcaster ──────────────────────────────────────────────────────

/// Registered sessions plus the delivery channel.
///
/// The session set only grows until [`clear`](Self::clear).
pub struct SessionBroadcaster {
    sessions: Mutex<IndexSet<SessionId>>,
    tx: broadcast::Sender<Delivery>,
}

impl Default for SessionBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DELIVERY_CHANNEL_SIZE);
        Self {
            sessions: Mutex::new(IndexSet::new()),
            tx,
        }
    }

    fn sessions_guard(&self) -> std::sync::MutexGuard<'_, IndexSet<SessionId>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session. Returns `false` if it was already known.
    pub fn register(&self, session: SessionId) -> bool {
        let added = self.sessions_guard().insert(session.clone());
        debug!(%session, added, "session registered");
        added
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions_guard().iter().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions_guard().len()
    }

    /// Forget every session.
    pub fn clear(&self) {
        self.sessions_guard().clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }

    /// Deliver `message` to every registered session.
    pub fn broadcast(&self, message: Message) {
        let message = Arc::new(message);
        let sessions = self.sessions();
        trace!(sessions = sessions.len(), "broadcast");
        for session in sessions {
            // No receivers is fine: nobody is listening yet.
            let _ = self.tx.send(Delivery {
                session,
                message: Arc::clone(&message),
            });
        }
    }

    /// Deliver `message` to a single session.
    pub fn send_to(&self, session: &SessionId, message: Message) {
        let _ = self.tx.send(Delivery {
            session: session.clone(),
            message: Arc::new(message),
        });
    }

    // ── Convenience ──────────────────────────────────────────────────

    pub fn notify(&self, kind: StatusKind, message: impl Into<String>) {
        self.broadcast(Message::status(kind, message));
    }

    pub fn notify_rate_limited(&self, message: impl Into<String>, remaining_secs: u64) {
        self.broadcast(Message::Status(Notification {
            kind: StatusKind::RateLimited,
            message: message.into(),
            rate_limit_seconds: Some(remaining_secs),
        }));
    }

    pub fn notify_session(
        &self,
        session: &SessionId,
        kind: StatusKind,
        message: impl Into<String>,
    ) {
        self.send_to(session, Message::status(kind, message));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_names_are_snake_case() {
        assert_eq!(StatusKind::SseStale.to_string(), "sse_stale");
        assert_eq!(StatusKind::AuthInProgress.to_string(), "auth_in_progress");
        let json = serde_json::to_value(Message::status(StatusKind::NoDevices, "none")).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["payload"]["kind"], "no_devices");
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let hub = SessionBroadcaster::new();
        let mut rx = hub.subscribe();
        assert!(hub.register("a".into()));
        assert!(hub.register("b".into()));
        assert!(!hub.register("a".into()));

        hub.notify(StatusKind::Complete, "done");
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.session.as_str(), "a");
        assert_eq!(second.session.as_str(), "b");
        assert_eq!(first.message.status_kind(), Some(StatusKind::Complete));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_to_addresses_one_session() {
        let hub = SessionBroadcaster::new();
        let mut rx = hub.subscribe();
        hub.register("a".into());
        hub.register("b".into());
        hub.notify_session(&"b".into(), StatusKind::AuthInProgress, "busy");
        assert_eq!(rx.try_recv().unwrap().session.as_str(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clear_drops_sessions() {
        let hub = SessionBroadcaster::new();
        let mut rx = hub.subscribe();
        hub.register(SessionId::generate());
        hub.clear();
        hub.notify(StatusKind::Initializing, "");
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.session_count(), 0);
    }
}
