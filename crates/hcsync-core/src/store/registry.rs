// ── Device registry ──
//
// Sole writer of appliance state. REST snapshots, event-stream batches
// and active-program results all funnel through here; each mutation of
// one appliance runs under that appliance's entry lock.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::trace;

use super::collection::EntityCollection;
use crate::model::appliance::FINISHED_STATE;
use crate::model::value::enum_suffix;
use crate::model::{
    Appliance, ApplianceKey, ApplianceUpdate, DoorState, OptionValue, PowerState, ProgramSummary,
};

/// Authoritative map of appliance id to appliance state.
pub struct DeviceRegistry {
    appliances: EntityCollection<Appliance>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            appliances: EntityCollection::with_order(Some(by_name)),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Merge a REST listing over the record, creating it if absent.
    pub fn apply_snapshot(&self, id: &str, update: &ApplianceUpdate) {
        self.appliances.upsert_with(
            id,
            || Appliance::new(id),
            |appliance| {
                update.merge_into(appliance);
                appliance.updated_at = Utc::now();
            },
        );
    }

    /// Apply one keyed value. Returns `false` for unknown appliances or
    /// keys outside the tracked table.
    pub fn apply_event(&self, id: &str, key: &str, value: &OptionValue) -> bool {
        self.apply_batch(id, &[(key.to_owned(), value.clone())])
    }

    /// Apply a batch of keyed values in order.
    ///
    /// If any value in the batch reported the Finished operation state,
    /// remaining time is forced to zero after the whole batch, so a
    /// stale remaining-time value later in the same batch cannot revive
    /// the program. Returns whether any tracked key was applied.
    pub fn apply_batch(&self, id: &str, items: &[(String, OptionValue)]) -> bool {
        self.appliances
            .modify(id, |appliance| apply_items(appliance, items))
            .unwrap_or(false)
    }

    /// Record an active-program lookup result and merge its options.
    ///
    /// `None` means nothing is running: the recorded program is cleared.
    pub fn apply_program(
        &self,
        id: &str,
        program: Option<ProgramSummary>,
        options: &[(String, OptionValue)],
    ) -> bool {
        self.appliances
            .modify(id, |appliance| {
                appliance.active_program = program;
                apply_items(appliance, options);
                appliance.updated_at = Utc::now();
            })
            .is_some()
    }

    pub fn set_connected(&self, id: &str, connected: bool) -> bool {
        self.appliances
            .modify(id, |appliance| {
                appliance.connected = connected;
                appliance.updated_at = Utc::now();
            })
            .is_some()
    }

    pub fn clear(&self) {
        self.appliances.clear();
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Arc<Appliance>> {
        self.appliances.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.appliances.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.appliances.keys()
    }

    /// Copy-on-read snapshot, sorted by name.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Appliance>>> {
        self.appliances.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Appliance>>>> {
        self.appliances.subscribe()
    }

    pub fn len(&self) -> usize {
        self.appliances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appliances.is_empty()
    }
}

fn by_name(a: &Appliance, b: &Appliance) -> std::cmp::Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.id.cmp(&b.id))
}

// ── Field table ─────────────────────────────────────────────────────

fn apply_items(appliance: &mut Appliance, items: &[(String, OptionValue)]) -> bool {
    let mut applied = false;
    let mut finished = false;
    for (key, value) in items {
        let Ok(key) = key.parse::<ApplianceKey>() else {
            trace!(key = %key, "ignoring untracked key");
            continue;
        };
        finished |= apply_field(appliance, key, value);
        applied = true;
    }
    if finished {
        mark_finished(appliance);
    }
    if applied {
        appliance.updated_at = Utc::now();
    }
    applied
}

/// Apply one tracked field. Returns `true` if it reported Finished.
fn apply_field(appliance: &mut Appliance, key: ApplianceKey, value: &OptionValue) -> bool {
    match key {
        ApplianceKey::RemainingProgramTime => {
            let Some(seconds) = value.as_number().map(whole_seconds) else {
                return false;
            };
            appliance.remaining_program_seconds = Some(seconds);
            if seconds == 0 {
                appliance.initial_remaining_seconds = None;
            } else if appliance.initial_remaining_seconds.is_none() {
                appliance.initial_remaining_seconds = Some(seconds);
            }
            false
        }
        ApplianceKey::ProgramProgress => {
            let Some(percent) = value.as_number().map(percent) else {
                return false;
            };
            appliance.program_progress_percent = Some(percent);
            if percent >= 100 {
                appliance.initial_remaining_seconds = None;
            }
            false
        }
        ApplianceKey::OperationState => {
            let Some(state) = value.as_text() else {
                return false;
            };
            let finished = enum_suffix(&state) == FINISHED_STATE;
            appliance.operation_state = Some(state);
            finished
        }
        ApplianceKey::Power => {
            if let Some(text) = value.as_text() {
                appliance.power_state = PowerState::from_vendor(&text);
            }
            false
        }
        ApplianceKey::Door => {
            if let Some(text) = value.as_text() {
                appliance.door_state = DoorState::from_vendor(&text);
            }
            false
        }
        ApplianceKey::Lighting => {
            appliance.lighting = value.as_bool();
            false
        }
    }
}

fn mark_finished(appliance: &mut Appliance) {
    appliance.remaining_program_seconds = Some(0);
    appliance.initial_remaining_seconds = None;
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_seconds(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent(value: f64) -> u8 {
    if value.is_finite() {
        value.round().clamp(0.0, 100.0) as u8
    } else {
        0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const REMAINING: &str = "BSH.Common.Option.RemainingProgramTime";
    const PROGRESS: &str = "BSH.Common.Option.ProgramProgress";
    const OPERATION: &str = "BSH.Common.Status.OperationState";
    const DOOR: &str = "BSH.Common.Status.DoorState";
    const POWER: &str = "BSH.Common.Setting.PowerState";

    fn registry_with(id: &str) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.apply_snapshot(
            id,
            &ApplianceUpdate {
                name: Some(format!("{id} name")),
                connected: Some(true),
                ..ApplianceUpdate::default()
            },
        );
        registry
    }

    fn item(key: &str, value: serde_json::Value) -> (String, OptionValue) {
        (key.to_owned(), OptionValue::from(value))
    }

    #[test]
    fn events_for_unknown_appliances_are_ignored() {
        let registry = DeviceRegistry::new();
        assert!(!registry.apply_event("ghost", REMAINING, &OptionValue::from(json!(5))));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_keys_leave_state_untouched() {
        let registry = registry_with("ha-1");
        let before = registry.get("ha-1").unwrap();
        assert!(!registry.apply_event(
            "ha-1",
            "BSH.Common.Option.Duration",
            &OptionValue::from(json!(60))
        ));
        assert_eq!(registry.get("ha-1").unwrap().remaining_program_seconds, None);
        assert_eq!(registry.get("ha-1").unwrap().updated_at, before.updated_at);
    }

    #[test]
    fn remaining_to_zero_clears_initial_and_activity() {
        let registry = registry_with("ha-1");
        registry.apply_event("ha-1", REMAINING, &OptionValue::from(json!(1200)));
        let a = registry.get("ha-1").unwrap();
        assert_eq!(a.initial_remaining_seconds, Some(1200));
        assert!(a.appears_active());

        registry.apply_event("ha-1", REMAINING, &OptionValue::from(json!(600)));
        assert_eq!(registry.get("ha-1").unwrap().initial_remaining_seconds, Some(1200));

        registry.apply_event("ha-1", REMAINING, &OptionValue::from(json!(0)));
        let a = registry.get("ha-1").unwrap();
        assert_eq!(a.remaining_program_seconds, Some(0));
        assert_eq!(a.initial_remaining_seconds, None);
        assert!(!a.appears_active());
    }

    #[test]
    fn progress_complete_clears_initial() {
        let registry = registry_with("ha-1");
        registry.apply_event("ha-1", REMAINING, &OptionValue::from(json!(300)));
        registry.apply_event(
            "ha-1",
            PROGRESS,
            &OptionValue::from(json!({"value": 100, "displayValue": "100 %"})),
        );
        let a = registry.get("ha-1").unwrap();
        assert_eq!(a.program_progress_percent, Some(100));
        assert_eq!(a.initial_remaining_seconds, None);
    }

    #[test]
    fn finished_in_batch_forces_remaining_zero() {
        let registry = registry_with("ha-1");
        let batch = vec![
            item(OPERATION, json!("BSH.Common.EnumType.OperationState.Finished")),
            item(REMAINING, json!(540)),
        ];
        assert!(registry.apply_batch("ha-1", &batch));
        let a = registry.get("ha-1").unwrap();
        assert_eq!(a.remaining_program_seconds, Some(0));
        assert_eq!(a.initial_remaining_seconds, None);
        assert!(a.is_finished());
    }

    #[test]
    fn operation_state_accepts_labeled_value() {
        let registry = registry_with("ha-1");
        registry.apply_event(
            "ha-1",
            OPERATION,
            &OptionValue::from(json!({"value": "BSH.Common.EnumType.OperationState.Run"})),
        );
        let a = registry.get("ha-1").unwrap();
        assert_eq!(
            a.operation_state.as_deref(),
            Some("BSH.Common.EnumType.OperationState.Run")
        );
        assert!(a.appears_active());
    }

    #[test]
    fn disjoint_fields_commute() {
        let first = registry_with("ha-1");
        first.apply_event(
            "ha-1",
            DOOR,
            &OptionValue::from(json!("BSH.Common.EnumType.DoorState.Open")),
        );
        first.apply_event(
            "ha-1",
            POWER,
            &OptionValue::from(json!("BSH.Common.EnumType.PowerState.On")),
        );

        let second = registry_with("ha-1");
        second.apply_event(
            "ha-1",
            POWER,
            &OptionValue::from(json!("BSH.Common.EnumType.PowerState.On")),
        );
        second.apply_event(
            "ha-1",
            DOOR,
            &OptionValue::from(json!("BSH.Common.EnumType.DoorState.Open")),
        );

        let (a, b) = (first.get("ha-1").unwrap(), second.get("ha-1").unwrap());
        assert_eq!(a.door_state, b.door_state);
        assert_eq!(a.power_state, b.power_state);
        assert_eq!(a.door_state, DoorState::Open);
        assert_eq!(a.power_state, PowerState::On);
    }

    #[test]
    fn snapshot_merge_keeps_event_fields() {
        let registry = registry_with("ha-1");
        registry.apply_event("ha-1", "Cooking.Common.Setting.Lighting", &OptionValue::from(json!(true)));
        registry.apply_snapshot(
            "ha-1",
            &ApplianceUpdate {
                connected: Some(false),
                ..ApplianceUpdate::default()
            },
        );
        let a = registry.get("ha-1").unwrap();
        assert_eq!(a.lighting, Some(true));
        assert!(!a.connected);
        assert_eq!(a.name, "ha-1 name");
    }

    #[test]
    fn program_lookup_sets_and_clears() {
        let registry = registry_with("ha-1");
        registry.apply_program(
            "ha-1",
            Some(ProgramSummary {
                key: "Dishcare.Dishwasher.Program.Eco50".into(),
                name: None,
            }),
            &[item(REMAINING, json!(3600))],
        );
        let a = registry.get("ha-1").unwrap();
        assert_eq!(a.active_program.as_ref().unwrap().label(), "Eco50");
        assert_eq!(a.remaining_program_seconds, Some(3600));

        registry.apply_program("ha-1", None, &[]);
        assert!(registry.get("ha-1").unwrap().active_program.is_none());
    }

    #[test]
    fn snapshot_sorted_by_name() {
        let registry = DeviceRegistry::new();
        for (id, name) in [("b", "Washer"), ("a", "dryer"), ("c", "Oven")] {
            registry.apply_snapshot(
                id,
                &ApplianceUpdate {
                    name: Some(name.into()),
                    ..ApplianceUpdate::default()
                },
            );
        }
        let names: Vec<String> = registry.snapshot().iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["dryer", "Oven", "Washer"]);
    }
}
