use crate::model::{DeviceId, Sensors, TelemetryRecord};
use serde_json::{Map, Value};
use thiserror::Error;

/// Accepted key spellings, in lookup order. The first present non-null key wins.
const CO2_KEYS: &[&str] = &["co2", "CO2", "co2_ppm"];
const TEMP_KEYS: &[&str] = &["temp", "temperature"];
const RH_KEYS: &[&str] = &["rh", "humidity"];
const TIMESTAMP_KEYS: &[&str] = &["ts", "timestamp"];
const DEVICE_KEYS: &[&str] = &["device"];
const SENSOR_BLOCK_KEY: &str = "sensors";

/// Topic segment that precedes the device id, e.g. `cloud/uav/<device>/telemetry`
const TOPIC_DEVICE_MARKER: &str = "uav";
const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("telemetry payload is not an object")]
pub struct Malformed;

/// Parses an inbound payload without ever failing.
///
/// A JSON document that is itself a string is parsed once more (devices that
/// double-encode). Anything that is not JSON comes back as the raw text.
pub fn parse_lenient(payload: &[u8]) -> Value {
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(value) => value,
            Err(_) => Value::String(inner),
        },
        Ok(value) => value,
        Err(_) => Value::String(text.into_owned()),
    }
}

/// Maps an arbitrary payload value onto a [`TelemetryRecord`].
///
/// A string value is unwrapped once as JSON. Whatever is not an object after
/// that is [`Malformed`].
///
/// The device comes from the payload `device` field when present, otherwise
/// from the topic (see [`device_from_topic`]).
///
/// Lossy: when the payload carries no usable timestamp, `observed_at_ms`
/// (the viewer's receive time) is used instead of device time.
pub fn decode(raw: &Value, topic: &str, observed_at_ms: i64) -> Result<TelemetryRecord, Malformed> {
    let unwrapped;
    let value = match raw {
        Value::String(text) => {
            unwrapped = serde_json::from_str::<Value>(text).map_err(|_| Malformed)?;
            &unwrapped
        }
        other => other,
    };
    let obj = value.as_object().ok_or(Malformed)?;

    let device = lookup(obj, DEVICE_KEYS)
        .and_then(device_from_value)
        .unwrap_or_else(|| device_from_topic(topic));

    let timestamp = lookup(obj, TIMESTAMP_KEYS)
        .and_then(to_number_or_null)
        .map(|ts| ts as i64)
        .unwrap_or(observed_at_ms);

    let block = match obj.get(SENSOR_BLOCK_KEY) {
        Some(Value::Object(sensors)) => sensors,
        _ => obj,
    };

    let sensors = Sensors {
        co2: lookup(block, CO2_KEYS).and_then(to_number_or_null),
        temp: lookup(block, TEMP_KEYS).and_then(to_number_or_null),
        rh: lookup(block, RH_KEYS).and_then(to_number_or_null),
    };

    Ok(TelemetryRecord {
        device,
        timestamp,
        sensors,
    })
}

/// Total numeric coercion: the result is finite or `None`, never NaN or infinite.
pub fn to_number_or_null(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    n.is_finite().then_some(n)
}

/// Device id from the topic: the segment after `uav`, else the
/// second-to-last segment, else `unknown`.
pub fn device_from_topic(topic: &str) -> DeviceId {
    let parts: Vec<&str> = topic.split('/').collect();
    if let Some(idx) = parts.iter().position(|p| *p == TOPIC_DEVICE_MARKER) {
        if let Some(dev) = parts.get(idx + 1) {
            return DeviceId::new(*dev);
        }
    }
    if parts.len() >= 2 {
        return DeviceId::new(parts[parts.len() - 2]);
    }
    DeviceId::new(UNKNOWN_DEVICE)
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn device_from_value(value: &Value) -> Option<DeviceId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(DeviceId::new(s.as_str())),
        Value::Number(n) => Some(DeviceId::new(n.to_string())),
        _ => None,
    }
}
