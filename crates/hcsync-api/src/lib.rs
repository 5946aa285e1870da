// hcsync-api: Async Rust client for the Home Connect cloud (OAuth, REST, SSE)

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod sse;
pub mod transport;

pub use auth::{DeviceAuthorization, OAuthClient, TokenPoll, TokenResponse};
pub use client::HomeConnectClient;
pub use error::Error;
pub use models::{ActiveProgram, HomeAppliance, ValueItem};
pub use sse::{EventItem, EventStream, StreamEvent, StreamEventKind};
pub use transport::{Environment, TransportConfig};
