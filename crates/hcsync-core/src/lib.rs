//! Device synchronization and session engine for Home Connect appliances.
//!
//! Sits between `hcsync-api` and whatever fronts it (the `hcsync` CLI, a
//! UI bridge, a home-automation adapter):
//!
//! - **[`Engine`]**: Central facade. The first
//!   [`register_session()`](Engine::register_session) starts initialization:
//!   a stored refresh token is exchanged, or the OAuth device flow runs.
//!   Once authenticated it fetches appliances, subscribes to the global
//!   event stream and keeps the token fresh in the background.
//!
//! - **[`DeviceRegistry`]**: Canonical per-appliance state built on
//!   `EntityCollection<T>` (`DashMap` + `tokio::sync::watch`). REST
//!   snapshots, stream batches and program lookups all merge through it.
//!
//! - **[`EventStreamSupervisor`]**: Owns the SSE connections: coalesced
//!   reconnects, refresh-before-reconnect on 401, recreation after token
//!   rotation, and a heartbeat that flags silent streams.
//!
//! - **[`ActiveProgramScheduler`]**: Paced, rate-limit aware lookups of
//!   running programs, with bounded per-appliance retries.
//!
//! - **[`SessionBroadcaster`]**: Fan-out of typed [`Message`]s to every
//!   registered session, or to one.

pub mod broadcast;
pub mod config;
pub mod device_flow;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod model;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod token;

// ── Primary re-exports ──────────────────────────────────────────────
pub use broadcast::{
    ActivePrograms, AuthEvent, AuthPrompt, Delivery, Message, Notification, ProgramEntry,
    SessionBroadcaster, SessionId, StatusKind,
};
pub use config::{EngineConfig, InitPolicy};
pub use device_flow::{DeviceFlowAuthenticator, DeviceFlowConfig, FlowProgress, PollSchedule};
pub use engine::Engine;
pub use error::CoreError;
pub use heartbeat::{Heartbeat, HeartbeatConfig, Liveness};
pub use scheduler::{
    ActiveProgramScheduler, BatchOutcome, RetryPhase, RetrySnapshot, SchedulerConfig,
};
pub use session::{BatchRefusal, SessionContext, SessionPolicy};
pub use store::DeviceRegistry;
pub use supervisor::{EventHandler, EventStreamSupervisor, StreamId, StreamState, SupervisorConfig};
pub use token::{
    FileTokenStorage, MemoryTokenStorage, Token, TokenEvent, TokenPersistence, TokenStore,
};

pub use model::{Appliance, ApplianceUpdate, DoorState, OptionValue, PowerState, ProgramSummary};
