// ── Appliance domain type ──
//
// Canonical per-appliance state merged from REST snapshots, event-stream
// deltas and active-program lookups. Fields are overwritten in place;
// absent fields in a partial update keep their previous value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::value::{OptionValue, enum_suffix, is_connected};

/// Power setting of an appliance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Standby,
    #[default]
    Unknown,
}

impl PowerState {
    /// Parse `BSH.Common.EnumType.PowerState.*` (or its bare suffix).
    pub fn from_vendor(value: &str) -> Self {
        match enum_suffix(value) {
            "On" => Self::On,
            "Off" => Self::Off,
            "Standby" => Self::Standby,
            _ => Self::Unknown,
        }
    }
}

/// Door status of an appliance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum DoorState {
    Open,
    Closed,
    Locked,
    #[default]
    Unknown,
}

impl DoorState {
    /// Parse `BSH.Common.EnumType.DoorState.*` (or its bare suffix).
    pub fn from_vendor(value: &str) -> Self {
        match enum_suffix(value) {
            "Open" => Self::Open,
            "Closed" => Self::Closed,
            "Locked" => Self::Locked,
            _ => Self::Unknown,
        }
    }
}

/// The vendor keys this engine tracks. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum ApplianceKey {
    #[strum(serialize = "BSH.Common.Option.RemainingProgramTime")]
    RemainingProgramTime,
    #[strum(serialize = "BSH.Common.Option.ProgramProgress")]
    ProgramProgress,
    #[strum(serialize = "BSH.Common.Status.OperationState")]
    OperationState,
    #[strum(serialize = "BSH.Common.Setting.PowerState")]
    Power,
    #[strum(serialize = "BSH.Common.Status.DoorState")]
    Door,
    #[strum(serialize = "Cooking.Common.Setting.Lighting")]
    Lighting,
}

/// Operation state suffix that forces remaining time to zero.
pub const FINISHED_STATE: &str = "Finished";

/// The program an appliance is running, as last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ProgramSummary {
    /// Display name, falling back to the last segment of the key.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| enum_suffix(&self.key))
    }
}

/// Latest known state of one appliance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appliance {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub brand: String,
    pub connected: bool,
    pub power_state: PowerState,
    pub door_state: DoorState,
    pub lighting: Option<bool>,
    pub operation_state: Option<String>,
    pub remaining_program_seconds: Option<u64>,
    pub program_progress_percent: Option<u8>,
    /// Remaining time when the current program was first observed running.
    pub initial_remaining_seconds: Option<u64>,
    pub active_program: Option<ProgramSummary>,
    pub updated_at: DateTime<Utc>,
}

impl Appliance {
    /// A blank record for a newly observed appliance.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            kind: String::new(),
            brand: String::new(),
            connected: false,
            power_state: PowerState::Unknown,
            door_state: DoorState::Unknown,
            lighting: None,
            operation_state: None,
            remaining_program_seconds: None,
            program_progress_percent: None,
            initial_remaining_seconds: None,
            active_program: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the appliance looks like it is running something.
    ///
    /// True when remaining time is positive, progress is strictly between
    /// 0 and 100, or the operation state is one of the running states
    /// (`Run`, `Active`, `DelayedStart`, `InProgress`).
    pub fn appears_active(&self) -> bool {
        if self.remaining_program_seconds.is_some_and(|s| s > 0) {
            return true;
        }
        if self
            .program_progress_percent
            .is_some_and(|p| p > 0 && p < 100)
        {
            return true;
        }
        self.operation_state
            .as_deref()
            .is_some_and(operation_state_is_active)
    }

    pub fn is_finished(&self) -> bool {
        self.operation_state
            .as_deref()
            .is_some_and(|s| enum_suffix(s) == FINISHED_STATE)
    }

    /// Progress in percent: the reported value, else derived from the
    /// remaining time against the remaining time first observed.
    pub fn estimated_progress_percent(&self) -> Option<u8> {
        if let Some(p) = self.program_progress_percent {
            return Some(p);
        }
        let initial = self.initial_remaining_seconds.filter(|i| *i > 0)?;
        let remaining = self.remaining_program_seconds?.min(initial);
        let done = (initial - remaining).saturating_mul(100) / initial;
        u8::try_from(done).ok()
    }
}

/// Running-state test on the last segment of an operation state value.
pub fn operation_state_is_active(state: &str) -> bool {
    let suffix = enum_suffix(state).to_ascii_lowercase();
    suffix.starts_with("run")
        || matches!(suffix.as_str(), "active" | "delayedstart" | "inprogress")
}

/// Partial appliance update from a REST listing. Only `Some` fields are
/// applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplianceUpdate {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub brand: Option<String>,
    pub connected: Option<bool>,
}

impl ApplianceUpdate {
    /// Build from an appliance-list entry.
    pub fn from_listing(listing: &hcsync_api::HomeAppliance) -> Self {
        Self {
            name: Some(listing.name.clone()).filter(|n| !n.is_empty()),
            kind: Some(listing.kind.clone()).filter(|k| !k.is_empty()),
            brand: Some(listing.brand.clone()).filter(|b| !b.is_empty()),
            connected: Some(is_connected(&OptionValue::from_json(&listing.connected))),
        }
    }

    /// Apply every present field to `appliance`.
    pub fn merge_into(&self, appliance: &mut Appliance) {
        if let Some(ref name) = self.name {
            appliance.name.clone_from(name);
        }
        if let Some(ref kind) = self.kind {
            appliance.kind.clone_from(kind);
        }
        if let Some(ref brand) = self.brand {
            appliance.brand.clone_from(brand);
        }
        if let Some(connected) = self.connected {
            appliance.connected = connected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_enums_parse() {
        assert_eq!(
            PowerState::from_vendor("BSH.Common.EnumType.PowerState.Standby"),
            PowerState::Standby
        );
        assert_eq!(PowerState::from_vendor("weird"), PowerState::Unknown);
        assert_eq!(
            DoorState::from_vendor("BSH.Common.EnumType.DoorState.Locked"),
            DoorState::Locked
        );
        assert_eq!(
            "Cooking.Common.Setting.Lighting".parse::<ApplianceKey>().ok(),
            Some(ApplianceKey::Lighting)
        );
        assert!("BSH.Common.Option.Duration".parse::<ApplianceKey>().is_err());
    }

    #[test]
    fn appears_active_truth_table() {
        let mut a = Appliance::new("ha");
        assert!(!a.appears_active());

        a.remaining_program_seconds = Some(10);
        assert!(a.appears_active());
        a.remaining_program_seconds = Some(0);
        assert!(!a.appears_active());

        a.program_progress_percent = Some(50);
        assert!(a.appears_active());
        a.program_progress_percent = Some(100);
        assert!(!a.appears_active());
        a.program_progress_percent = Some(0);
        assert!(!a.appears_active());

        for state in [
            "BSH.Common.EnumType.OperationState.Run",
            "BSH.Common.EnumType.OperationState.DelayedStart",
            "Active",
            "InProgress",
        ] {
            a.operation_state = Some(state.into());
            assert!(a.appears_active(), "{state}");
        }
        for state in [
            "BSH.Common.EnumType.OperationState.Inactive",
            "BSH.Common.EnumType.OperationState.Ready",
            "BSH.Common.EnumType.OperationState.Finished",
            "BSH.Common.EnumType.OperationState.Pause",
        ] {
            a.operation_state = Some(state.into());
            assert!(!a.appears_active(), "{state}");
        }
    }

    #[test]
    fn progress_estimate_from_remaining_time() {
        let mut a = Appliance::new("ha");
        assert_eq!(a.estimated_progress_percent(), None);

        a.initial_remaining_seconds = Some(1000);
        a.remaining_program_seconds = Some(250);
        assert_eq!(a.estimated_progress_percent(), Some(75));

        a.program_progress_percent = Some(40);
        assert_eq!(a.estimated_progress_percent(), Some(40));
    }

    #[test]
    fn listing_update_merges_present_fields() {
        let listing = hcsync_api::HomeAppliance {
            ha_id: "ha".into(),
            name: "Kitchen Oven".into(),
            kind: "Oven".into(),
            brand: String::new(),
            vib: None,
            enumber: None,
            connected: serde_json::json!("online"),
        };
        let mut a = Appliance::new("ha");
        a.brand = "Siemens".into();
        ApplianceUpdate::from_listing(&listing).merge_into(&mut a);
        assert_eq!(a.name, "Kitchen Oven");
        assert_eq!(a.kind, "Oven");
        assert_eq!(a.brand, "Siemens");
        assert!(a.connected);
    }
}
