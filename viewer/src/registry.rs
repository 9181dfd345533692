use crate::model::{DeviceId, DevicePanel, DeviceState, Summary, TelemetryRecord};
use std::collections::BTreeMap;
use tracing::debug;

/// Liveness predicate. Pure in `(last_seen, now, offline_ms)`; never cached.
///
/// A `last_seen` in the future (clock skew) counts as online.
pub fn is_online(last_seen: i64, offline_ms: i64, now: i64) -> bool {
    now.saturating_sub(last_seen) <= offline_ms
}

/// Latest telemetry and last-seen time per device.
///
/// Devices are kept in lexicographic order so every view is deterministic
/// regardless of arrival order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-arrived wins: the record's own timestamp is not compared.
    pub fn record_message(&mut self, record: TelemetryRecord, now: i64) {
        let device = record.device.clone();
        match self.devices.get_mut(&device) {
            Some(state) => {
                state.telemetry = Some(record);
                state.last_seen = now;
            }
            None => {
                debug!("New device discovered: {}", device);
                self.devices.insert(
                    device,
                    DeviceState {
                        telemetry: Some(record),
                        last_seen: now,
                    },
                );
            }
        }
    }

    pub fn get(&self, device: &DeviceId) -> Option<&DeviceState> {
        self.devices.get(device)
    }

    pub fn all_devices(&self) -> impl Iterator<Item = &DeviceId> + '_ {
        self.devices.keys()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn summarize(&self, now: i64, offline_ms: i64) -> Summary {
        let total = self.devices.len();
        let online = self
            .devices
            .values()
            .filter(|s| is_online(s.last_seen, offline_ms, now))
            .count();
        Summary {
            total,
            online,
            offline: total.saturating_sub(online),
        }
    }

    /// Per-device overview rows, sorted by device id.
    pub fn panels(&self, now: i64, offline_ms: i64) -> Vec<DevicePanel> {
        self.devices
            .iter()
            .map(|(device, state)| DevicePanel {
                device: device.clone(),
                online: is_online(state.last_seen, offline_ms, now),
                sensors: state.telemetry.as_ref().map(|t| t.sensors),
                last_seen: state.last_seen,
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sensors;

    fn record(device: &str, co2: f64) -> TelemetryRecord {
        TelemetryRecord {
            device: DeviceId::from(device),
            timestamp: 0,
            sensors: Sensors {
                co2: Some(co2),
                temp: None,
                rh: None,
            },
        }
    }

    #[test]
    fn test_online_then_offline() {
        let mut reg = DeviceRegistry::new();
        reg.record_message(record("uav-7", 410.0), 1000);

        assert_eq!(
            reg.summarize(2000, 8000),
            Summary { total: 1, online: 1, offline: 0 }
        );
        assert_eq!(
            reg.summarize(20000, 8000),
            Summary { total: 1, online: 0, offline: 1 }
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(is_online(1000, 8000, 9000));
        assert!(!is_online(1000, 8000, 9001));
    }

    #[test]
    fn test_liveness_non_increasing_with_elapsed_time() {
        let last_seen = 5_000;
        let offline_ms = 3_000;
        let mut was_online = true;
        for now in (0..20_000).step_by(250) {
            let online = is_online(last_seen, offline_ms, now);
            assert!(was_online || !online, "flipped back online at {now}");
            was_online = online;
        }
    }

    #[test]
    fn test_summary_invariants() {
        let mut reg = DeviceRegistry::new();
        for (i, name) in ["c", "a", "b", "d"].iter().enumerate() {
            reg.record_message(record(name, 400.0), (i as i64) * 5_000);
        }
        for now in [-100_000, 0, 7_000, 12_000, i64::MAX, i64::MIN] {
            for offline_ms in [0, 1_000, 8_000, -5] {
                let s = reg.summarize(now, offline_ms);
                assert_eq!(s.online + s.offline, s.total);
                assert_eq!(s.total, 4);
            }
        }
    }

    #[test]
    fn test_last_arrived_wins() {
        let mut reg = DeviceRegistry::new();
        let mut newer = record("uav-1", 500.0);
        newer.timestamp = 2_000;
        let mut older = record("uav-1", 400.0);
        older.timestamp = 1_000;

        reg.record_message(newer, 10);
        reg.record_message(older, 20);

        let state = reg.get(&DeviceId::from("uav-1")).unwrap();
        assert_eq!(state.last_seen, 20);
        assert_eq!(state.telemetry.as_ref().unwrap().sensors.co2, Some(400.0));
    }

    #[test]
    fn test_all_devices_sorted() {
        let mut reg = DeviceRegistry::new();
        for name in ["uav-9", "uav-10", "alpha", "uav-2"] {
            reg.record_message(record(name, 1.0), 0);
        }
        let ids: Vec<&str> = reg.all_devices().map(|d| d.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "uav-10", "uav-2", "uav-9"]);

        let panels = reg.panels(0, 8000);
        assert_eq!(panels[0].device.as_str(), "alpha");
        assert!(panels.iter().all(|p| p.online));
    }

    #[test]
    fn test_reset() {
        let mut reg = DeviceRegistry::new();
        reg.record_message(record("uav-1", 1.0), 0);
        reg.reset();
        assert!(reg.is_empty());
        assert_eq!(reg.summarize(0, 8000), Summary::default());
    }
}
