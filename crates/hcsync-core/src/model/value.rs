// ── Vendor value normalization ──
//
// Upstream values arrive either as a bare scalar or as an object carrying
// `value` plus a human-readable label. Both are folded into `OptionValue`
// at ingress; everything downstream coerces through one path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized upstream value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// `{"value": ..., "displayValue": "..."}`
    Labeled {
        value: Value,
        #[serde(rename = "displayValue", default, skip_serializing_if = "Option::is_none")]
        display_value: Option<String>,
    },
    /// A bare JSON scalar (or anything else).
    Scalar(Value),
}

impl OptionValue {
    /// Fold a raw JSON value into its normalized form.
    pub fn from_json(raw: &Value) -> Self {
        match raw {
            Value::Object(map) if map.contains_key("value") => Self::Labeled {
                value: map.get("value").cloned().unwrap_or(Value::Null),
                display_value: map
                    .get("displayValue")
                    .or_else(|| map.get("displayvalue"))
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            other => Self::Scalar(other.clone()),
        }
    }

    /// Build from a value plus an optional label (REST items carry both).
    pub fn with_label(value: Value, display_value: Option<String>) -> Self {
        match display_value {
            Some(label) => Self::Labeled {
                value,
                display_value: Some(label),
            },
            None => Self::from_json(&value),
        }
    }

    /// The underlying raw value.
    pub fn raw(&self) -> &Value {
        match self {
            Self::Labeled { value, .. } | Self::Scalar(value) => value,
        }
    }

    pub fn display_value(&self) -> Option<&str> {
        match self {
            Self::Labeled { display_value, .. } => display_value.as_deref(),
            Self::Scalar(_) => None,
        }
    }

    /// Numeric view: numbers as-is, numeric strings parsed.
    pub fn as_number(&self) -> Option<f64> {
        match self.raw() {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Textual view: strings as-is, numbers and bools rendered.
    pub fn as_text(&self) -> Option<String> {
        match self.raw() {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Boolean view: bools, non-zero numbers, and the usual truthy words.
    pub fn as_bool(&self) -> Option<bool> {
        match self.raw() {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f.abs() > f64::EPSILON),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" | "yes" => Some(true),
                "false" | "off" | "0" | "no" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Value> for OptionValue {
    fn from(raw: Value) -> Self {
        Self::from_json(&raw)
    }
}

/// Normalize the many encodings of an appliance connection flag.
///
/// `true`, any non-zero number, and the strings `true`, `connected`,
/// `online`, `available` (any case) mean connected; everything else,
/// including absence, means disconnected.
pub fn is_connected(raw: &OptionValue) -> bool {
    match raw.raw() {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > f64::EPSILON),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "connected" | "online" | "available"
        ),
        _ => false,
    }
}

/// Key/value pairs from a REST status, settings or program-options list.
pub fn rest_values(items: &[hcsync_api::ValueItem]) -> Vec<(String, OptionValue)> {
    items
        .iter()
        .map(|item| {
            (
                item.key.clone(),
                OptionValue::with_label(item.value.clone(), item.displayvalue.clone()),
            )
        })
        .collect()
}

/// Key/value pairs from decoded stream items.
pub fn event_values<'a>(
    items: impl IntoIterator<Item = &'a hcsync_api::EventItem>,
) -> Vec<(String, OptionValue)> {
    items
        .into_iter()
        .map(|item| {
            (
                item.key.clone(),
                OptionValue::with_label(item.value.clone(), item.display_value.clone()),
            )
        })
        .collect()
}

/// Last dot-separated segment of a vendor enum value
/// (`BSH.Common.EnumType.DoorState.Open` -> `Open`).
pub fn enum_suffix(value: &str) -> &str {
    value.rsplit('.').next().unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn labeled_and_scalar_coerce_alike() {
        let labeled = OptionValue::from_json(&json!({"value": 42, "displayValue": "42 min"}));
        let scalar = OptionValue::from_json(&json!(42));
        assert_eq!(labeled.as_number(), Some(42.0));
        assert_eq!(scalar.as_number(), Some(42.0));
        assert_eq!(labeled.display_value(), Some("42 min"));
        assert_eq!(scalar.display_value(), None);
    }

    #[test]
    fn numeric_strings_parse() {
        assert_eq!(OptionValue::from(json!(" 17 ")).as_number(), Some(17.0));
        assert_eq!(OptionValue::from(json!("soon")).as_number(), None);
    }

    #[test]
    fn connection_flag_truth_table() {
        let connected = [
            json!(true),
            json!(1),
            json!(2.5),
            json!("true"),
            json!("Connected"),
            json!("ONLINE"),
            json!("available"),
        ];
        for raw in connected {
            assert!(is_connected(&OptionValue::from(raw.clone())), "{raw}");
        }
        let disconnected = [
            json!(false),
            json!(0),
            json!("false"),
            json!("offline"),
            json!(null),
            json!({}),
        ];
        for raw in disconnected {
            assert!(!is_connected(&OptionValue::from(raw.clone())), "{raw}");
        }
    }

    #[test]
    fn bool_view() {
        assert_eq!(OptionValue::from(json!(true)).as_bool(), Some(true));
        assert_eq!(OptionValue::from(json!("off")).as_bool(), Some(false));
        assert_eq!(OptionValue::from(json!([1])).as_bool(), None);
    }

    #[test]
    fn suffix() {
        assert_eq!(enum_suffix("BSH.Common.EnumType.DoorState.Open"), "Open");
        assert_eq!(enum_suffix("Open"), "Open");
    }
}
