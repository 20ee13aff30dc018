//! Per-model clean-up of report payloads before they are published.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Whether report payloads are published as the gateway sent them or with
/// units and flags normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Parsed,
    Raw,
}

/// Groups of models that share a payload transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Temperature/humidity sensors reporting hundredths
    Climate,
    Gateway,
    Motion,
    /// Known models whose payload needs no change
    Passthrough,
    Unknown,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        match model {
            "weather.v1" | "sensor_ht" => ModelFamily::Climate,
            "gateway" => ModelFamily::Gateway,
            m if m.starts_with("gateway.") => ModelFamily::Gateway,
            "motion" | "sensor_motion.aq2" => ModelFamily::Motion,
            "sensor_wleak.aq1" | "magnet" | "switch" | "86sw1" | "86sw2" | "cube"
            | "ctrl_neutral1" | "ctrl_neutral2" | "ctrl_ln1.aq1" | "vibration" => {
                ModelFamily::Passthrough
            }
            _ => ModelFamily::Unknown,
        }
    }
}

/// Applies the parsed-mode transform for `family` to `data` in place.
pub fn normalize(family: ModelFamily, data: &mut Map<String, Value>) {
    match family {
        ModelFamily::Climate => {
            for field in ["temperature", "humidity"] {
                let scaled = hundredths(data.get(field));
                data.insert(field.to_string(), scaled);
            }
        }
        ModelFamily::Gateway => {
            if let Some(rgb) = data.get("rgb").and_then(Value::as_u64).filter(|v| *v != 0) {
                data.insert("rgb".to_string(), Value::String(format!("{rgb:x}")));
            }
        }
        ModelFamily::Motion => {
            if data.get("status").and_then(Value::as_str) == Some("motion") {
                data.insert("motion".to_string(), Value::from("on"));
                data.insert("no_motion".to_string(), Value::from("0"));
            }
            if data.get("no_motion").is_some_and(is_running_countdown) {
                data.insert("motion".to_string(), Value::from("off"));
            }
        }
        ModelFamily::Passthrough | ModelFamily::Unknown => {}
    }
}

/// Converts a raw reading in hundredths to units. Zero and empty readings are
/// the firmware's "no value" marker and map to null.
fn hundredths(raw: Option<&Value>) -> Value {
    let reading = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    reading
        .filter(|v| *v != 0.0)
        .and_then(|v| Number::from_f64(v / 100.0))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn is_running_countdown(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::Bool(b) => *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalized(family: ModelFamily, data: Value) -> Value {
        let mut map = data.as_object().cloned().unwrap();
        normalize(family, &mut map);
        Value::Object(map)
    }

    #[test]
    fn test_model_families() {
        assert_eq!(ModelFamily::of("sensor_ht"), ModelFamily::Climate);
        assert_eq!(ModelFamily::of("weather.v1"), ModelFamily::Climate);
        assert_eq!(ModelFamily::of("gateway"), ModelFamily::Gateway);
        assert_eq!(ModelFamily::of("gateway.v3"), ModelFamily::Gateway);
        assert_eq!(ModelFamily::of("gatewayish"), ModelFamily::Unknown);
        assert_eq!(ModelFamily::of("sensor_motion.aq2"), ModelFamily::Motion);
        assert_eq!(ModelFamily::of("cube"), ModelFamily::Passthrough);
        assert_eq!(ModelFamily::of("lumi.new"), ModelFamily::Unknown);
    }

    #[test]
    fn test_climate_scaling() {
        let data = normalized(
            ModelFamily::Climate,
            json!({"temperature": "2350", "humidity": 4512, "voltage": 3005}),
        );
        assert_eq!(data["temperature"], json!(23.5));
        assert_eq!(data["humidity"], json!(45.12));
        assert_eq!(data["voltage"], json!(3005));
    }

    #[test]
    fn test_climate_zero_and_missing_are_null() {
        let data = normalized(ModelFamily::Climate, json!({"temperature": 0}));
        assert_eq!(data["temperature"], Value::Null);
        assert_eq!(data["humidity"], Value::Null);

        let data = normalized(ModelFamily::Climate, json!({"temperature": "", "humidity": "0"}));
        assert_eq!(data["temperature"], Value::Null);
        assert_eq!(data["humidity"], Value::Null);
    }

    #[test]
    fn test_gateway_rgb_to_hex() {
        let data = normalized(ModelFamily::Gateway, json!({"rgb": 1694433280, "illumination": 300}));
        assert_eq!(data["rgb"], json!("64ff0000"));

        let data = normalized(ModelFamily::Gateway, json!({"rgb": 0}));
        assert_eq!(data["rgb"], json!(0));
    }

    #[test]
    fn test_motion_flags() {
        let data = normalized(ModelFamily::Motion, json!({"status": "motion"}));
        assert_eq!(data, json!({"status": "motion", "motion": "on", "no_motion": "0"}));

        let data = normalized(ModelFamily::Motion, json!({"no_motion": "120"}));
        assert_eq!(data["motion"], json!("off"));

        let data = normalized(ModelFamily::Motion, json!({"no_motion": 0}));
        assert!(data.get("motion").is_none());

        let data = normalized(ModelFamily::Motion, json!({"lux": "12"}));
        assert!(data.get("motion").is_none());
    }

    #[test]
    fn test_passthrough_untouched() {
        let input = json!({"status": "open"});
        assert_eq!(normalized(ModelFamily::Passthrough, input.clone()), input);
        assert_eq!(normalized(ModelFamily::Unknown, input.clone()), input);
    }

    #[test]
    fn test_data_format_names() {
        let format: DataFormat = serde_json::from_value(json!("raw")).unwrap();
        assert_eq!(format, DataFormat::Raw);
        assert_eq!(DataFormat::default(), DataFormat::Parsed);
    }
}
