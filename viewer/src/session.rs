//! One viewer session: device state, CO2 series and the history engine,
//! driven from a single event loop.

use crate::bus::Bus;
use crate::config::ViewerConfig;
use crate::decode::{decode, parse_lenient};
use crate::errors::Result;
use crate::metrics::{
    DEVICES, DEVICES_ONLINE, MALFORMED_TOTAL, REPLIES_REJECTED_TOTAL, RETRIEVAL_BYTES,
    RETRIEVAL_COMPLETED_TOTAL, RETRIEVAL_FAILED_TOTAL, RETRIEVAL_REQUESTS_TOTAL,
    RETRIEVAL_SUPERSEDED_TOTAL, TELEMETRY_TOTAL,
};
use crate::model::{DeviceId, DevicePanel, Summary, TelemetryRecord};
use crate::mqtt::ConnectionStatus;
use crate::registry::DeviceRegistry;
use crate::retrieval::{EngineState, Issued, Outcome, RetrievalEngine, RetrievalFailure, Step};
use crate::series::{Co2Series, Point, SeriesStats};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Last inbound message, verbatim, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMessage {
    pub topic: String,
    pub received_at: i64,
    pub payload: Value,
}

/// A reassembled history file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Download {
    pub device: DeviceId,
    pub filename: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub size: usize,
}

/// What the history panel shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStatus {
    pub engine: EngineState,
    pub progress: u8,
    pub status: String,
    pub dates: Option<Vec<String>>,
    pub failure: Option<RetrievalFailure>,
    pub download: Option<Arc<Download>>,
}

impl Default for HistoryStatus {
    fn default() -> Self {
        Self {
            engine: EngineState::Idle,
            progress: 0,
            status: "-".to_string(),
            dates: None,
            failure: None,
            download: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesView {
    pub points: Vec<Point>,
    pub stats: Option<SeriesStats>,
}

/// Read-only view of the session at one instant
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generated_at: i64,
    pub connection: ConnectionStatus,
    pub offline_ms: i64,
    pub summary: Summary,
    pub devices: Vec<DevicePanel>,
    pub latest: Option<TelemetryRecord>,
    pub last_message: Option<RawMessage>,
    pub series: BTreeMap<DeviceId, SeriesView>,
    pub chart_device: Option<DeviceId>,
    pub history: HistoryStatus,
}

impl Snapshot {
    pub fn panel(&self, device: &DeviceId) -> Option<&DevicePanel> {
        self.devices.iter().find(|p| &p.device == device)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            generated_at: 0,
            connection: ConnectionStatus::Closed,
            offline_ms: 0,
            summary: Summary::default(),
            devices: Vec::new(),
            latest: None,
            last_message: None,
            series: BTreeMap::new(),
            chart_device: None,
            history: HistoryStatus::default(),
        }
    }
}

/// How an inbound message was consumed
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Telemetry(DeviceId),
    Malformed,
    Reply(Step),
}

pub struct Session {
    offline_ms: i64,
    max_points: usize,
    connection: ConnectionStatus,
    registry: DeviceRegistry,
    series: Co2Series,
    engine: RetrievalEngine,
    history: HistoryStatus,
    latest: Option<TelemetryRecord>,
    last_message: Option<RawMessage>,
}

impl Session {
    pub fn new(config: &ViewerConfig) -> Self {
        Self {
            offline_ms: config.offline_ms,
            max_points: config.max_points,
            connection: ConnectionStatus::Connecting,
            registry: DeviceRegistry::new(),
            series: Co2Series::new(),
            engine: RetrievalEngine::new(
                &config.request_topic,
                &config.reply_prefix,
                &config.client_id,
            ),
            history: HistoryStatus::default(),
            latest: None,
            last_message: None,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    pub fn history(&self) -> &HistoryStatus {
        &self.history
    }

    pub fn connection(&self) -> &ConnectionStatus {
        &self.connection
    }

    pub fn set_connection(&mut self, status: ConnectionStatus) {
        self.connection = status;
    }

    /// Routes one inbound publish: the reply topic feeds the history engine,
    /// everything else is telemetry.
    pub fn handle_publish(&mut self, topic: &str, payload: &[u8], now: i64) -> Handled {
        if topic == self.engine.reply_topic() {
            let step = self.engine.handle_message(topic, payload);
            self.apply_step(&step);
            return Handled::Reply(step);
        }

        let value = parse_lenient(payload);
        self.last_message = Some(RawMessage {
            topic: topic.to_string(),
            received_at: now,
            payload: value.clone(),
        });

        let record = match decode(&value, topic, now) {
            Ok(record) => record,
            Err(e) => {
                debug!("Dropping message on {}: {}", topic, e);
                MALFORMED_TOTAL.inc();
                return Handled::Malformed;
            }
        };
        TELEMETRY_TOTAL.inc();

        let device = record.device.clone();
        if let Some(co2) = record.sensors.co2 {
            let point = Point {
                label: time_label(now),
                value: co2,
            };
            self.series.push(&device, point, self.max_points);
        }
        self.latest = Some(record.clone());
        self.registry.record_message(record, now);
        Handled::Telemetry(device)
    }

    /// Requests a history file. Without a device, the first known device is used.
    pub fn fetch(
        &mut self,
        bus: Option<&dyn Bus>,
        device: Option<DeviceId>,
        date: Option<&str>,
    ) -> Result<Issued> {
        let device = device.or_else(|| self.default_device());
        let issued = self.engine.fetch(bus, device.as_ref(), date)?;
        self.on_issued(&issued);
        self.history.dates = None;
        self.history.status = format!(
            "requesting {} {}",
            issued.request.device,
            issued.request.date.as_deref().unwrap_or_default()
        );
        Ok(issued)
    }

    pub fn list_dates(&mut self, bus: Option<&dyn Bus>, device: Option<DeviceId>) -> Result<Issued> {
        let device = device.or_else(|| self.default_device());
        let issued = self.engine.list_dates(bus, device.as_ref())?;
        self.on_issued(&issued);
        self.history.dates = None;
        self.history.status = format!("requesting date list for {}", issued.request.device);
        Ok(issued)
    }

    /// Forgets every device, the series and the history panel.
    /// An in-flight request keeps running.
    pub fn clear(&mut self) {
        self.registry.reset();
        self.series.clear();
        self.latest = None;
        self.last_message = None;
        self.history = HistoryStatus {
            engine: self.engine.state(),
            ..HistoryStatus::default()
        };
    }

    /// The transport went away on purpose; any request is abandoned.
    pub fn disconnected(&mut self) {
        if self.engine.abandon().is_some() {
            RETRIEVAL_SUPERSEDED_TOTAL.inc();
        }
        self.connection = ConnectionStatus::Closed;
        self.history.engine = self.engine.state();
        self.history.progress = 0;
        self.history.status = "MQTT disconnected, history unavailable".to_string();
    }

    /// Liveness is recomputed from scratch on every call.
    pub fn snapshot(&self, now: i64) -> Snapshot {
        let summary = self.registry.summarize(now, self.offline_ms);
        DEVICES.set(summary.total as f64);
        DEVICES_ONLINE.set(summary.online as f64);

        let series = self
            .registry
            .all_devices()
            .map(|d| {
                let view = SeriesView {
                    points: self.series.points(d),
                    stats: self.series.stats(d),
                };
                (d.clone(), view)
            })
            .collect();

        Snapshot {
            generated_at: now,
            connection: self.connection.clone(),
            offline_ms: self.offline_ms,
            summary,
            devices: self.registry.panels(now, self.offline_ms),
            latest: self.latest.clone(),
            last_message: self.last_message.clone(),
            series,
            chart_device: self.series.last_device().cloned(),
            history: self.history.clone(),
        }
    }

    fn default_device(&self) -> Option<DeviceId> {
        self.registry.all_devices().next().cloned()
    }

    fn on_issued(&mut self, issued: &Issued) {
        RETRIEVAL_REQUESTS_TOTAL.inc();
        if issued.superseded.is_some() {
            RETRIEVAL_SUPERSEDED_TOTAL.inc();
        }
        self.history.engine = self.engine.state();
        self.history.progress = 0;
        self.history.failure = None;
    }

    fn apply_step(&mut self, step: &Step) {
        self.history.engine = self.engine.state();
        match step {
            Step::Ignored | Step::Duplicate { .. } => {}
            Step::Rejected { .. } => REPLIES_REJECTED_TOTAL.inc(),
            Step::Progress(p) => {
                self.history.progress = p.percent;
                self.history.status = if p.end_seen {
                    format!(
                        "end received, waiting for {} of {} chunks",
                        p.expected.saturating_sub(p.received),
                        p.expected
                    )
                } else if p.received == 0 {
                    format!("transfer started: {} chunks", p.expected)
                } else {
                    format!("receiving {}/{}", p.received, p.expected)
                };
            }
            Step::Finished(Outcome::Completed {
                device,
                filename,
                bytes,
                ..
            }) => {
                RETRIEVAL_COMPLETED_TOTAL.inc();
                RETRIEVAL_BYTES.observe(bytes.len() as f64);
                self.history.progress = 100;
                self.history.status = format!("done: {} ({} bytes)", filename, bytes.len());
                self.history.download = Some(Arc::new(Download {
                    device: device.clone(),
                    filename: filename.clone(),
                    size: bytes.len(),
                    bytes: bytes.clone(),
                }));
            }
            Step::Finished(Outcome::Dates { device, dates, .. }) => {
                RETRIEVAL_COMPLETED_TOTAL.inc();
                self.history.status = format!("dates for {} ({})", device, dates.len());
                self.history.dates = Some(dates.clone());
            }
            Step::Finished(Outcome::Failed { failure, .. }) => {
                RETRIEVAL_FAILED_TOTAL.inc();
                self.history.progress = 0;
                self.history.status = format!("failed: {}", failure);
                self.history.failure = Some(failure.clone());
            }
        }
    }
}

fn time_label(now: i64) -> String {
    DateTime::from_timestamp_millis(now)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
