// Wire types for the REST surface.
//
// Every successful response is wrapped in `{"data": ...}`; errors use
// `{"error": {"key", "description"}}`. Field names follow the vendor's
// JSON exactly via serde renames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{"data": T}` response wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// Body of `GET /api/homeappliances`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceList {
    #[serde(default)]
    pub homeappliances: Vec<HomeAppliance>,
}

/// One entry of the appliance list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeAppliance {
    #[serde(rename = "haId")]
    pub ha_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub vib: Option<String>,
    #[serde(default)]
    pub enumber: Option<String>,
    /// Seen as a bool, a number or a string depending on firmware.
    #[serde(default)]
    pub connected: Value,
}

/// Body of `GET .../status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusList {
    #[serde(default)]
    pub status: Vec<ValueItem>,
}

/// Body of `GET .../settings`.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingList {
    #[serde(default)]
    pub settings: Vec<ValueItem>,
}

/// A key/value pair as returned by status, settings and program options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueItem {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayvalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Body of `GET .../programs/active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveProgram {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub options: Vec<ValueItem>,
}

/// Vendor error envelope.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}
