#![allow(clippy::unwrap_used)]
// End-to-end tests for `Engine` against a wiremock upstream.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::broadcast;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hcsync_api::Environment;
use hcsync_core::{
    AuthEvent, CoreError, Delivery, DoorState, Engine, EngineConfig, HeartbeatConfig,
    MemoryTokenStorage, Message, PowerState, SessionId, StatusKind,
};

const COOLDOWN_CHOICES_SECS: [u64; 3] = [120, 240, 480];

// ── Helpers ─────────────────────────────────────────────────────────

fn config(server: &MockServer) -> EngineConfig {
    let mut config = EngineConfig::new(
        Environment::Custom(Url::parse(&server.uri()).unwrap()),
        "client-abc",
    );
    config.supervisor.heartbeat = HeartbeatConfig {
        enabled: false,
        ..HeartbeatConfig::default()
    };
    config.supervisor.transient_retry_delay = Duration::from_secs(3600);
    config.device_flow.min_interval = Duration::from_millis(10);
    config.init.retry_delay = Duration::from_millis(50);
    config
}

async fn mount_devices(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/homeappliances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "homeappliances": [
                { "haId": "ha-1", "name": "Dishwasher", "type": "Dishwasher",
                  "brand": "Bosch", "connected": true }
            ]}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/homeappliances/ha-1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "status": [
                { "key": "BSH.Common.Status.DoorState",
                  "value": "BSH.Common.EnumType.DoorState.Open" }
            ]}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/homeappliances/ha-1/settings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "settings": [
                { "key": "BSH.Common.Setting.PowerState",
                  "value": "BSH.Common.EnumType.PowerState.On" }
            ]}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/homeappliances/events"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/event-stream"))
        .mount(server)
        .await;
}

async fn mount_device_code(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/security/oauth/device_authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "dc-1",
            "user_code": "WXYZ-1234",
            "verification_uri": "https://verify.example.test",
            "expires_in": 600
        })))
        .mount(server)
        .await;
}

/// Collect messages for `session` until `stop` matches one of them.
async fn collect_until(
    rx: &mut broadcast::Receiver<Delivery>,
    session: &SessionId,
    stop: impl Fn(&Message) -> bool,
) -> Vec<Arc<Message>> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let delivery = rx.recv().await.unwrap();
            if &delivery.session != session {
                continue;
            }
            let done = stop(&delivery.message);
            seen.push(delivery.message);
            if done {
                break;
            }
        }
    })
    .await
    .unwrap();
    seen
}

fn statuses(messages: &[Arc<Message>]) -> Vec<StatusKind> {
    messages.iter().filter_map(|m| m.status_kind()).collect()
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}

// ── Stored token ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stored_token_initializes_and_loads_devices() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "refresh_token": "refresh-2",
            "expires_in": 86400
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_devices(&server).await;

    let storage = Arc::new(MemoryTokenStorage::with_token("refresh-1"));
    let engine = Engine::new(config(&server), storage.clone()).unwrap();
    let mut rx = engine.subscribe();

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    let messages = collect_until(&mut rx, &session, |m| {
        m.status_kind() == Some(StatusKind::Complete)
    })
    .await;

    assert_eq!(
        statuses(&messages),
        vec![
            StatusKind::Initializing,
            StatusKind::TokenFound,
            StatusKind::Success,
            StatusKind::FetchingDevices,
            StatusKind::Complete,
        ]
    );
    assert!(messages.iter().any(|m| matches!(m.as_ref(), Message::Devices(list) if list.len() == 1)));
    if let Some(Message::Status(done)) = messages.last().map(AsRef::as_ref) {
        assert_eq!(done.message, "1 device(s) loaded");
    }

    assert!(engine.is_authenticated());
    let dishwasher = engine.registry().get("ha-1").unwrap();
    assert_eq!(dishwasher.name, "Dishwasher");
    assert_eq!(dishwasher.door_state, DoorState::Open);
    assert_eq!(dishwasher.power_state, PowerState::On);
    assert_eq!(storage.stored().as_deref(), Some("refresh-2"));

    // A second session gets the current list without re-initializing.
    let late = SessionId::from("ui-2");
    engine.register_session(late.clone());
    let replay = collect_until(&mut rx, &late, |m| matches!(m, Message::Devices(_))).await;
    assert_eq!(statuses(&replay), vec![StatusKind::SessionActive]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_refresh_is_refused_before_authentication() {
    let server = MockServer::start().await;
    let engine = Engine::new(config(&server), Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    let err = engine.request_refresh().await.unwrap_err();
    assert!(matches!(err, CoreError::NotAuthenticated));

    let session = SessionId::from("ui-1");
    let err = engine
        .request_active_programs(&[], Some(session.clone()), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotAuthenticated));
    let delivery = rx.try_recv().unwrap();
    assert_eq!(delivery.session, session);
    assert_eq!(delivery.message.status_kind(), Some(StatusKind::ClientNotReady));
}

// ── Device flow ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_registration_during_authentication_does_not_restart_it() {
    let server = MockServer::start().await;
    mount_device_code(&server).await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "authorization_pending",
            "error_description": "waiting for the user"
        })))
        .mount(&server)
        .await;

    let engine = Engine::new(config(&server), Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    let first = SessionId::from("ui-1");
    let second = SessionId::from("ui-2");
    engine.register_session(first.clone());
    engine.register_session(second.clone());

    let prompt = collect_until(&mut rx, &first, |m| {
        matches!(m, Message::Auth(AuthEvent::Waiting(_)))
    })
    .await;
    let Some(Message::Auth(AuthEvent::Waiting(waiting))) = prompt.last().map(AsRef::as_ref) else {
        panic!("expected an auth prompt");
    };
    assert_eq!(waiting.user_code, "WXYZ-1234");
    assert_eq!(waiting.verification_uri, "https://verify.example.test");
    assert_eq!(
        statuses(&prompt),
        vec![StatusKind::Initializing, StatusKind::NeedAuth]
    );

    assert!(engine.session_context().is_authenticating());
    assert_eq!(
        requests_to(&server, "/security/oauth/device_authorization").await,
        1
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_second_session_is_told_auth_is_in_progress() {
    let server = MockServer::start().await;
    mount_device_code(&server).await;

    let engine = Engine::new(config(&server), Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    let first = SessionId::from("ui-1");
    let second = SessionId::from("ui-2");
    engine.register_session(first);
    engine.register_session(second.clone());

    let reply = collect_until(&mut rx, &second, |m| m.status_kind().is_some()).await;
    assert_eq!(statuses(&reply), vec![StatusKind::AuthInProgress]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_denied_authorization_is_retried_then_given_up() {
    let server = MockServer::start().await;
    mount_device_code(&server).await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "access_denied",
            "error_description": "the user said no"
        })))
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.init.max_attempts = 2;
    let engine = Engine::new(config, Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    let messages = collect_until(&mut rx, &session, |m| {
        m.status_kind() == Some(StatusKind::AuthFailed)
    })
    .await;

    let errors = messages
        .iter()
        .filter(|m| matches!(m.as_ref(), Message::Auth(AuthEvent::Error { .. })))
        .count();
    assert_eq!(errors, 2);
    assert_eq!(
        statuses(&messages)
            .iter()
            .filter(|k| **k == StatusKind::NeedAuth)
            .count(),
        2
    );
    assert_eq!(
        requests_to(&server, "/security/oauth/device_authorization").await,
        2
    );
    assert!(!engine.is_authenticated());
    assert!(!engine.session_context().is_authenticating());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_registration_loses_to_a_claimed_slot() {
    let server = MockServer::start().await;
    let engine = Engine::new(config(&server), Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    // Another caller already holds the authentication slot.
    assert!(engine.session_context().try_begin_authentication());
    assert!(!engine.initialize());

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    let reply = collect_until(&mut rx, &session, |m| m.status_kind().is_some()).await;
    assert_eq!(statuses(&reply), vec![StatusKind::AuthInProgress]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        requests_to(&server, "/security/oauth/device_authorization").await,
        0
    );

    engine.shutdown().await;
}

fn cooldown_secs(messages: &[Arc<Message>]) -> Option<u64> {
    messages.iter().find_map(|m| match m.as_ref() {
        Message::Status(n) if n.kind == StatusKind::RateLimited => n.rate_limit_seconds,
        _ => None,
    })
}

#[tokio::test]
async fn test_polling_too_quickly_ends_the_device_flow() {
    let server = MockServer::start().await;
    mount_device_code(&server).await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": "invalid_request",
            "error_description": "client is polling too quickly"
        })))
        .mount(&server)
        .await;

    let engine = Engine::new(config(&server), Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    let messages = collect_until(&mut rx, &session, |m| {
        m.status_kind() == Some(StatusKind::RateLimited)
    })
    .await;

    assert!(
        messages
            .iter()
            .any(|m| matches!(m.as_ref(), Message::Auth(AuthEvent::Error { .. })))
    );
    let secs = cooldown_secs(&messages).unwrap();
    assert!(COOLDOWN_CHOICES_SECS.contains(&secs), "unexpected cooldown {secs}");
    assert!(engine.session_context().rate_limit_remaining().is_some());

    // Well past the retry delay: nothing was retried.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        requests_to(&server, "/security/oauth/device_authorization").await,
        1
    );
    assert_eq!(requests_to(&server, "/security/oauth/token").await, 1);
    assert!(!engine.session_context().is_authenticating());
    assert!(!engine.is_authenticated());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_rate_limited_device_code_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/device_authorization"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "60"))
        .mount(&server)
        .await;

    let engine = Engine::new(config(&server), Arc::new(MemoryTokenStorage::new())).unwrap();
    let mut rx = engine.subscribe();

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    let messages = collect_until(&mut rx, &session, |m| {
        m.status_kind() == Some(StatusKind::RateLimited)
    })
    .await;
    assert!(cooldown_secs(&messages).is_some());
    assert!(!statuses(&messages).contains(&StatusKind::AuthFailed));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        requests_to(&server, "/security/oauth/device_authorization").await,
        1
    );

    engine.shutdown().await;
}

// ── Revoked credentials ─────────────────────────────────────────────

#[tokio::test]
async fn test_rejected_stored_token_starts_a_device_flow() {
    let server = MockServer::start().await;
    mount_device_code(&server).await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "token revoked"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .and(body_string_contains("grant_type=device_code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "authorization_pending"
        })))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryTokenStorage::with_token("refresh-1"));
    let engine = Engine::new(config(&server), storage.clone()).unwrap();
    let mut rx = engine.subscribe();

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    let messages = collect_until(&mut rx, &session, |m| {
        matches!(m, Message::Auth(AuthEvent::Waiting(_)))
    })
    .await;

    assert_eq!(
        statuses(&messages),
        vec![
            StatusKind::Initializing,
            StatusKind::TokenFound,
            StatusKind::ReauthRequired,
            StatusKind::NeedAuth,
        ]
    );
    assert!(storage.stored().is_none());
    assert!(engine.session_context().is_authenticating());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_revoked_token_after_startup_reauthenticates() {
    let server = MockServer::start().await;
    mount_devices(&server).await;
    mount_device_code(&server).await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "refresh_token": "refresh-2",
            "expires_in": 86400
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .and(body_string_contains("refresh_token=refresh-2"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "token revoked"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/security/oauth/token"))
        .and(body_string_contains("grant_type=device_code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "authorization_pending"
        })))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryTokenStorage::with_token("refresh-1"));
    let engine = Engine::new(config(&server), storage.clone()).unwrap();
    let mut rx = engine.subscribe();

    let session = SessionId::from("ui-1");
    engine.register_session(session.clone());
    collect_until(&mut rx, &session, |m| {
        m.status_kind() == Some(StatusKind::Complete)
    })
    .await;
    assert_eq!(storage.stored().as_deref(), Some("refresh-2"));

    let err = engine.tokens().refresh().await.unwrap_err();
    assert!(err.is_invalid_grant());

    let messages = collect_until(&mut rx, &session, |m| {
        matches!(m, Message::Auth(AuthEvent::Waiting(_)))
    })
    .await;
    let kinds = statuses(&messages);
    let reauth = kinds
        .iter()
        .position(|k| *k == StatusKind::ReauthRequired)
        .unwrap();
    let need_auth = kinds.iter().position(|k| *k == StatusKind::NeedAuth).unwrap();
    assert!(reauth < need_auth);

    // Sessions survive; appliances and credentials do not.
    assert!(storage.stored().is_none());
    assert!(!engine.is_authenticated());
    assert!(engine.registry().is_empty());
    assert_eq!(
        requests_to(&server, "/security/oauth/device_authorization").await,
        1
    );

    engine.shutdown().await;
}

// ── Reset ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_authentication_forgets_stored_token() {
    let server = MockServer::start().await;
    let storage = Arc::new(MemoryTokenStorage::with_token("refresh-1"));
    let engine = Engine::new(config(&server), storage.clone()).unwrap();

    engine.retry_authentication();

    assert!(storage.stored().is_none());
    assert!(!engine.is_authenticated());
    assert!(engine.registry().is_empty());
    assert!(!engine.tokens().has_token());
}
