// ── Domain model ──

pub mod appliance;
pub mod value;

pub use appliance::{
    Appliance, ApplianceKey, ApplianceUpdate, DoorState, PowerState, ProgramSummary,
};
pub use value::{OptionValue, event_values, is_connected, rest_values};
