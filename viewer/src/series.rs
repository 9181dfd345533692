use crate::model::DeviceId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_MAX_POINTS: usize = 120;
const MIN_MAX_POINTS: usize = 10;

/// Clamps a configured point budget. Values of 10 or less fall back to the default.
pub fn effective_max_points(requested: usize) -> usize {
    if requested > MIN_MAX_POINTS {
        requested
    } else {
        DEFAULT_MAX_POINTS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    /// Wall-clock label, `HH:MM:SS` local time
    pub label: String,
    pub value: f64,
}

/// Axis range and latest value for one series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
}

/// Bounded CO2 history per device.
#[derive(Debug, Default)]
pub struct Co2Series {
    series: HashMap<DeviceId, VecDeque<Point>>,
    last_device: Option<DeviceId>,
}

impl Co2Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, device: &DeviceId, point: Point, max_points: usize) {
        let points = self.series.entry(device.clone()).or_default();
        points.push_back(point);
        while points.len() > max_points {
            points.pop_front();
        }
        self.last_device = Some(device.clone());
    }

    pub fn points(&self, device: &DeviceId) -> Vec<Point> {
        self.series
            .get(device)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Device that most recently received a point
    pub fn last_device(&self) -> Option<&DeviceId> {
        self.last_device.as_ref()
    }

    /// `None` below two points. A flat series is widened by one on each side.
    pub fn stats(&self, device: &DeviceId) -> Option<SeriesStats> {
        let points = self.series.get(device)?;
        if points.len() < 2 {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for p in points {
            min = min.min(p.value);
            max = max.max(p.value);
        }
        if min == max {
            min -= 1.0;
            max += 1.0;
        }
        let latest = points.back().map(|p| p.value)?;
        Some(SeriesStats {
            count: points.len(),
            min,
            max,
            latest,
        })
    }

    pub fn clear(&mut self) {
        self.series.clear();
        self.last_device = None;
    }
}
