// ── Engine configuration ──

use std::time::Duration;

use secrecy::SecretString;

use hcsync_api::{Environment, TransportConfig};

use crate::device_flow::DeviceFlowConfig;
use crate::scheduler::SchedulerConfig;
use crate::session::SessionPolicy;
use crate::supervisor::SupervisorConfig;

/// Bounds on bringing the engine up.
#[derive(Debug, Clone)]
pub struct InitPolicy {
    /// Device-flow attempts before giving up with `auth_failed`.
    pub max_attempts: u32,
    /// Delay before a failed device flow is retried.
    pub retry_delay: Duration,
    /// Upper bound on exchanging a stored refresh token.
    pub client_init_timeout: Duration,
}

impl Default for InitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(30),
            client_init_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub environment: Environment,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub transport: TransportConfig,
    pub device_flow: DeviceFlowConfig,
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionPolicy,
    pub init: InitPolicy,
    /// Retry delay after a failed scheduled token refresh.
    pub token_retry_delay: Duration,
    /// Periodic full device refresh; `None` disables it.
    pub update_interval: Option<Duration>,
}

impl EngineConfig {
    pub fn new(environment: Environment, client_id: impl Into<String>) -> Self {
        Self {
            environment,
            client_id: client_id.into(),
            client_secret: None,
            transport: TransportConfig::default(),
            device_flow: DeviceFlowConfig::default(),
            supervisor: SupervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionPolicy::default(),
            init: InitPolicy::default(),
            token_retry_delay: Duration::from_secs(60),
            update_interval: None,
        }
    }
}
