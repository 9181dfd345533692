use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque device identity, taken from the payload or the topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Normalized sensor readings. A missing or unusable value is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sensors {
    pub co2: Option<f64>,
    pub temp: Option<f64>,
    pub rh: Option<f64>,
}

/// One decoded telemetry message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device: DeviceId,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub sensors: Sensors,
}

/// Latest known state of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub telemetry: Option<TelemetryRecord>,
    pub last_seen: i64,
}

/// Aggregate device counts at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

/// One row of the device overview, sorted by device id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevicePanel {
    pub device: DeviceId,
    pub online: bool,
    pub sensors: Option<Sensors>,
    pub last_seen: i64,
}
