//! Chunked history retrieval over the pub/sub bus.
//!
//! The transport gives no ordering, acknowledgement or retry. A fetch is
//! reconstructed from a `start` / `chunk`* / `end` triad on a per-requester
//! reply topic, correlated by request id. Only the most recent request has
//! a live listener; issuing a new one supersedes the old without a terminal
//! event. There is no timeout: a request that never hears back stays
//! pending until it is superseded.

use crate::bus::Bus;
use crate::errors::{Error, Result};
use crate::model::DeviceId;
use crate::protocol::{date_list, Action, Reply, ReplyHeader, RequestEnvelope};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalRequest {
    pub request_id: RequestId,
    pub device: DeviceId,
    pub date: Option<String>,
    pub reply_topic: String,
    pub action: Action,
}

/// Returned when a request has been published.
#[derive(Debug, Clone, PartialEq)]
pub struct Issued {
    pub request: RetrievalRequest,
    pub generation: u64,
    /// In-flight request whose listener was dropped to make room
    pub superseded: Option<RequestId>,
}

/// Sparse chunk store for one fetch. Memory grows with the chunks actually
/// received, never with the announced count.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    pub request_id: RequestId,
    pub filename: String,
    expected: usize,
    chunks: BTreeMap<usize, String>,
    end_seen: bool,
}

impl ReassemblyBuffer {
    fn new(request_id: RequestId, total_chunks: usize, filename: String) -> Self {
        Self {
            request_id,
            filename,
            expected: total_chunks,
            chunks: BTreeMap::new(),
            end_seen: false,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// First content for an index wins. Returns whether the chunk was new.
    fn accept(&mut self, index: usize, data_b64: String) -> std::result::Result<bool, Rejection> {
        if index >= self.expected {
            return Err(Rejection::ChunkOutOfRange {
                index,
                expected: self.expected,
            });
        }
        match self.chunks.entry(index) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(data_b64);
                Ok(true)
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.end_seen && self.received() == self.expected
    }

    /// `floor(received / expected * 100)`; an empty file counts as 100.
    fn percent(&self) -> u8 {
        if self.expected == 0 {
            return 100;
        }
        ((self.received() as u128 * 100) / self.expected as u128) as u8
    }

    /// Decodes every chunk and concatenates them in index order.
    /// Only called once all `expected` indices are present.
    fn assemble(&self) -> std::result::Result<Vec<u8>, RetrievalFailure> {
        let mut bytes = Vec::new();
        for (&index, encoded) in &self.chunks {
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|_| RetrievalFailure::Decode { index })?;
            bytes.extend_from_slice(&decoded);
        }
        Ok(bytes)
    }
}

/// Externally visible engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    AwaitingStart { request_id: RequestId },
    Receiving { request_id: RequestId, received: usize, expected: usize },
    AwaitingDates { request_id: RequestId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ThisError)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalFailure {
    /// `error` reply from the responder, message kept verbatim
    #[error("{message}{}", .file.as_ref().map(|f| format!(" | {f}")).unwrap_or_default())]
    Remote { message: String, file: Option<String> },
    #[error("end received without start")]
    MissingStart,
    #[error("chunk {index} is not valid base64")]
    Decode { index: usize },
}

/// Why an inbound reply was refused. The request stays in its current state.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Rejection {
    #[error("unparseable reply: {0}")]
    Unparseable(String),
    #[error("chunk before start")]
    ChunkBeforeStart,
    #[error("chunk {index} outside 0..{expected}")]
    ChunkOutOfRange { index: usize, expected: usize },
    #[error("start announces {announced} chunks, transfer already expects {expected}")]
    ConflictingStart { announced: usize, expected: usize },
    #[error("{kind} reply is not valid for a {action:?} request")]
    UnexpectedReply { kind: &'static str, action: Action },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub request_id: RequestId,
    pub percent: u8,
    pub received: usize,
    pub expected: usize,
    pub end_seen: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        request_id: RequestId,
        device: DeviceId,
        filename: String,
        bytes: Vec<u8>,
    },
    Dates {
        request_id: RequestId,
        device: DeviceId,
        dates: Vec<String>,
    },
    Failed {
        request_id: RequestId,
        device: DeviceId,
        failure: RetrievalFailure,
    },
}

/// Result of feeding one inbound message to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Other topic, other request id, or nothing in flight
    Ignored,
    Progress(Progress),
    Duplicate { request_id: RequestId, index: usize },
    Rejected { request_id: RequestId, reason: Rejection },
    Finished(Outcome),
}

#[derive(Debug)]
enum Phase {
    AwaitingStart { default_filename: String },
    Receiving(ReassemblyBuffer),
    AwaitingDates,
}

/// The single live listener
#[derive(Debug)]
struct Listener {
    generation: u64,
    request: RetrievalRequest,
    phase: Phase,
}

enum Transition {
    Stay(Step),
    Finish(Outcome),
}

pub struct RetrievalEngine {
    request_topic: String,
    reply_topic: String,
    generation: u64,
    active: Option<Listener>,
}

impl RetrievalEngine {
    /// `requester_id` must be unique per viewer (the MQTT client id) so that
    /// reply topics do not overlap.
    pub fn new(request_topic: &str, reply_prefix: &str, requester_id: &str) -> Self {
        Self {
            request_topic: request_topic.to_string(),
            reply_topic: format!("{}/{}", reply_prefix.trim_end_matches('/'), requester_id),
            generation: 0,
            active: None,
        }
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> EngineState {
        match &self.active {
            None => EngineState::Idle,
            Some(l) => {
                let request_id = l.request.request_id.clone();
                match &l.phase {
                    Phase::AwaitingStart { .. } => EngineState::AwaitingStart { request_id },
                    Phase::Receiving(buf) => EngineState::Receiving {
                        request_id,
                        received: buf.received(),
                        expected: buf.expected(),
                    },
                    Phase::AwaitingDates => EngineState::AwaitingDates { request_id },
                }
            }
        }
    }

    /// Requests one day of history as a chunked file.
    pub fn fetch(
        &mut self,
        bus: Option<&dyn Bus>,
        device: Option<&DeviceId>,
        date: Option<&str>,
    ) -> Result<Issued> {
        let bus = bus.ok_or(Error::TransportUnavailable)?;
        let device = selected(device).ok_or(Error::NoDeviceSelected)?;
        let date = date
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(Error::NoDateSelected)?;

        let default_filename = format!("{}_{}.csv", device, date);
        self.issue(
            bus,
            device,
            Some(date.to_string()),
            Action::Fetch,
            Phase::AwaitingStart { default_filename },
        )
    }

    /// Asks the responder which dates it holds for a device.
    pub fn list_dates(&mut self, bus: Option<&dyn Bus>, device: Option<&DeviceId>) -> Result<Issued> {
        let bus = bus.ok_or(Error::TransportUnavailable)?;
        let device = selected(device).ok_or(Error::NoDeviceSelected)?;
        self.issue(bus, device, None, Action::ListDates, Phase::AwaitingDates)
    }

    /// Drops the live listener without a terminal event.
    pub fn abandon(&mut self) -> Option<RequestId> {
        self.active.take().map(|l| {
            info!("Abandoning history request {}", l.request.request_id);
            l.request.request_id
        })
    }

    fn issue(
        &mut self,
        bus: &dyn Bus,
        device: &DeviceId,
        date: Option<String>,
        action: Action,
        phase: Phase,
    ) -> Result<Issued> {
        let request = RetrievalRequest {
            request_id: RequestId::generate(),
            device: device.clone(),
            date,
            reply_topic: self.reply_topic.clone(),
            action,
        };
        let envelope = RequestEnvelope {
            req_id: request.request_id.to_string(),
            device: device.to_string(),
            date: request.date.clone(),
            action: match action {
                Action::Fetch => None,
                Action::ListDates => Some(Action::ListDates),
            },
            reply_to: request.reply_topic.clone(),
        };
        let payload = serde_json::to_vec(&envelope)?;

        // Subscribe first so a fast responder cannot beat us to the reply topic.
        // Until both calls succeed the in-flight request stays live.
        bus.subscribe(&self.reply_topic)?;
        bus.publish(&self.request_topic, payload)?;

        let superseded = self.active.take().map(|old| {
            info!(
                "History request {} superseded before completion",
                old.request.request_id
            );
            old.request.request_id
        });
        self.generation += 1;
        self.active = Some(Listener {
            generation: self.generation,
            request: request.clone(),
            phase,
        });

        info!(
            "History request {} ({:?}) for {} published to {}",
            request.request_id, action, request.device, self.request_topic
        );

        Ok(Issued {
            request,
            generation: self.generation,
            superseded,
        })
    }

    /// Drops the reply subscription once nothing is in flight.
    /// Returns whether an unsubscribe was sent.
    pub fn release(&self, bus: &dyn Bus) -> Result<bool> {
        if self.active.is_some() {
            return Ok(false);
        }
        bus.unsubscribe(&self.reply_topic)?;
        debug!("Unsubscribed from {}", self.reply_topic);
        Ok(true)
    }

    /// Feeds one inbound message. Anything that does not belong to the live
    /// request is [`Step::Ignored`].
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Step {
        if topic != self.reply_topic {
            return Step::Ignored;
        }
        let Some(listener) = self.active.as_mut() else {
            return Step::Ignored;
        };
        if listener.generation != self.generation {
            return Step::Ignored;
        }

        let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
            return Step::Ignored;
        };
        let matches = serde_json::from_value::<ReplyHeader>(value.clone())
            .ok()
            .and_then(|h| h.req_id)
            .is_some_and(|id| id == listener.request.request_id.as_str());
        if !matches {
            return Step::Ignored;
        }

        let request_id = listener.request.request_id.clone();
        let reply = match serde_json::from_value::<Reply>(value) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Rejected reply for {}: {}", request_id, e);
                return Step::Rejected {
                    request_id,
                    reason: Rejection::Unparseable(e.to_string()),
                };
            }
        };

        debug!("Reply {} for request {}", reply.kind(), request_id);

        match transition(listener, reply) {
            Transition::Stay(step) => {
                if let Step::Rejected { reason, .. } = &step {
                    warn!("Rejected reply for {}: {}", request_id, reason);
                }
                step
            }
            Transition::Finish(outcome) => {
                // Terminal: the listener goes away with the request.
                self.active = None;
                match &outcome {
                    Outcome::Completed { filename, bytes, .. } => {
                        info!("History {} complete: {} ({} bytes)", request_id, filename, bytes.len())
                    }
                    Outcome::Dates { dates, .. } => {
                        info!("History {} listed {} dates", request_id, dates.len())
                    }
                    Outcome::Failed { failure, .. } => {
                        warn!("History {} failed: {}", request_id, failure)
                    }
                }
                Step::Finished(outcome)
            }
        }
    }
}

fn selected(device: Option<&DeviceId>) -> Option<&DeviceId> {
    device.filter(|d| !d.as_str().trim().is_empty())
}

fn transition(listener: &mut Listener, reply: Reply) -> Transition {
    let request_id = listener.request.request_id.clone();
    let device = listener.request.device.clone();
    let action = listener.request.action;
    let kind = reply.kind();

    let reject = |reason: Rejection| {
        Transition::Stay(Step::Rejected {
            request_id: request_id.clone(),
            reason,
        })
    };
    let failed = |failure: RetrievalFailure| {
        Transition::Finish(Outcome::Failed {
            request_id: request_id.clone(),
            device: device.clone(),
            failure,
        })
    };
    let unexpected = || reject(Rejection::UnexpectedReply { kind, action });

    match reply {
        Reply::Error { message, file } => failed(RetrievalFailure::Remote { message, file }),

        Reply::Start {
            total_chunks,
            filename,
        } => match &listener.phase {
            Phase::AwaitingDates => unexpected(),
            Phase::AwaitingStart { default_filename } => {
                let filename = filename
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| default_filename.clone());
                let buf = ReassemblyBuffer::new(request_id.clone(), total_chunks, filename);
                let mut step = progress(&buf);
                step.percent = step.percent.max(1);
                listener.phase = Phase::Receiving(buf);
                Transition::Stay(Step::Progress(step))
            }
            // A redelivered start keeps what has been received so far.
            Phase::Receiving(buf) if buf.expected() == total_chunks => {
                Transition::Stay(Step::Progress(progress(buf)))
            }
            Phase::Receiving(buf) => reject(Rejection::ConflictingStart {
                announced: total_chunks,
                expected: buf.expected(),
            }),
        },

        Reply::Chunk { i, data_b64 } => match &mut listener.phase {
            Phase::AwaitingDates => unexpected(),
            Phase::AwaitingStart { .. } => reject(Rejection::ChunkBeforeStart),
            Phase::Receiving(buf) => match buf.accept(i, data_b64) {
                Ok(true) if buf.is_complete() => finish(buf, request_id.clone(), device.clone()),
                Ok(true) => Transition::Stay(Step::Progress(progress(buf))),
                Ok(false) => Transition::Stay(Step::Duplicate {
                    request_id: request_id.clone(),
                    index: i,
                }),
                Err(reason) => reject(reason),
            },
        },

        Reply::End => match &mut listener.phase {
            Phase::AwaitingDates => unexpected(),
            Phase::AwaitingStart { .. } => failed(RetrievalFailure::MissingStart),
            Phase::Receiving(buf) => {
                buf.end_seen = true;
                if buf.is_complete() {
                    finish(buf, request_id.clone(), device.clone())
                } else {
                    debug!(
                        "End for {} with {}/{} chunks, waiting for the rest",
                        request_id,
                        buf.received(),
                        buf.expected()
                    );
                    Transition::Stay(Step::Progress(progress(buf)))
                }
            }
        },

        Reply::Dates { dates } => match listener.phase {
            Phase::AwaitingDates => Transition::Finish(Outcome::Dates {
                request_id: request_id.clone(),
                device: device.clone(),
                dates: date_list(&dates),
            }),
            _ => unexpected(),
        },
    }
}

fn finish(buf: &ReassemblyBuffer, request_id: RequestId, device: DeviceId) -> Transition {
    match buf.assemble() {
        Ok(bytes) => Transition::Finish(Outcome::Completed {
            request_id,
            device,
            filename: buf.filename.clone(),
            bytes,
        }),
        Err(failure) => Transition::Finish(Outcome::Failed {
            request_id,
            device,
            failure,
        }),
    }
}

fn progress(buf: &ReassemblyBuffer) -> Progress {
    Progress {
        request_id: buf.request_id.clone(),
        percent: buf.percent(),
        received: buf.received(),
        expected: buf.expected(),
        end_seen: buf.end_seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOp, RecordingBus};
    use serde_json::json;

    const REQ_TOPIC: &str = "cloud/uav/rpc/history/request";
    const REPLY_PREFIX: &str = "cloud/uav/rpc/history/reply";

    fn engine() -> RetrievalEngine {
        RetrievalEngine::new(REQ_TOPIC, REPLY_PREFIX, "web_test")
    }

    fn send(engine: &mut RetrievalEngine, id: &RequestId, body: serde_json::Value) -> Step {
        let mut body = body;
        body["reqId"] = json!(id.as_str());
        let topic = engine.reply_topic().to_string();
        engine.handle_message(&topic, body.to_string().as_bytes())
    }

    fn issue_fetch(engine: &mut RetrievalEngine, bus: &RecordingBus) -> RequestId {
        let dev = DeviceId::from("uav-7");
        engine
            .fetch(Some(bus), Some(&dev), Some("2024-05-01"))
            .unwrap()
            .request
            .request_id
    }

    #[test]
    fn test_subscribe_before_publish() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        let ops = bus.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[0],
            BusOp::Subscribe("cloud/uav/rpc/history/reply/web_test".to_string())
        );
        let BusOp::Publish { topic, payload } = &ops[1] else {
            panic!("expected publish, got {:?}", ops[1]);
        };
        assert_eq!(topic, REQ_TOPIC);
        let envelope: RequestEnvelope = serde_json::from_slice(payload).unwrap();
        assert_eq!(envelope.req_id, id.as_str());
        assert_eq!(envelope.device, "uav-7");
        assert_eq!(envelope.date.as_deref(), Some("2024-05-01"));
        assert_eq!(envelope.reply_to, "cloud/uav/rpc/history/reply/web_test");
        assert_eq!(engine.state(), EngineState::AwaitingStart { request_id: id });
    }

    #[test]
    fn test_fetch_reassembles_scenario() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        let step = send(
            &mut engine,
            &id,
            json!({"type": "start", "totalChunks": 2, "filename": "uav-7_2024-05-01.csv"}),
        );
        assert!(matches!(step, Step::Progress(Progress { percent: 1, .. })));

        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": "QQ=="}));
        assert!(matches!(step, Step::Progress(Progress { percent: 50, .. })));
        send(&mut engine, &id, json!({"type": "chunk", "i": 1, "dataB64": "Qg=="}));

        let step = send(&mut engine, &id, json!({"type": "end"}));
        match step {
            Step::Finished(Outcome::Completed { filename, bytes, .. }) => {
                assert_eq!(filename, "uav-7_2024-05-01.csv");
                assert_eq!(bytes, b"AB");
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_out_of_order_chunks() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 3, "filename": "f.csv"}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 1, "dataB64": STANDARD.encode("bb")}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": STANDARD.encode("aa")}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 2, "dataB64": STANDARD.encode("cc")}));

        match send(&mut engine, &id, json!({"type": "end"})) {
            Step::Finished(Outcome::Completed { bytes, .. }) => assert_eq!(bytes, b"aabbcc"),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_chunk_keeps_first() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 2}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": STANDARD.encode("first")}));
        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": STANDARD.encode("second")}));
        assert_eq!(
            step,
            Step::Duplicate {
                request_id: id.clone(),
                index: 0
            }
        );
        assert_eq!(
            engine.state(),
            EngineState::Receiving {
                request_id: id.clone(),
                received: 1,
                expected: 2
            }
        );

        send(&mut engine, &id, json!({"type": "chunk", "i": 1, "dataB64": STANDARD.encode("+")}));
        match send(&mut engine, &id, json!({"type": "end"})) {
            Step::Finished(Outcome::Completed { bytes, filename, .. }) => {
                assert_eq!(bytes, b"first+");
                assert_eq!(filename, "uav-7_2024-05-01.csv");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_end_without_start_fails() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        match send(&mut engine, &id, json!({"type": "end"})) {
            Step::Finished(Outcome::Failed { failure, .. }) => {
                assert_eq!(failure, RetrievalFailure::MissingStart)
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_end_before_last_chunk_waits() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 2}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 1, "dataB64": "Qg=="}));
        let step = send(&mut engine, &id, json!({"type": "end"}));
        assert!(matches!(step, Step::Progress(Progress { end_seen: true, received: 1, .. })));

        match send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": "QQ=="})) {
            Step::Finished(Outcome::Completed { bytes, .. }) => assert_eq!(bytes, b"AB"),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_remote_error_is_verbatim() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 4}));
        let step = send(
            &mut engine,
            &id,
            json!({"type": "error", "message": "file not found", "file": "/data/x.csv"}),
        );
        let Step::Finished(Outcome::Failed { failure, .. }) = step else {
            panic!("expected failure");
        };
        assert_eq!(failure.to_string(), "file not found | /data/x.csv");

        // listener is gone
        assert_eq!(send(&mut engine, &id, json!({"type": "end"})), Step::Ignored);
    }

    #[test]
    fn test_other_request_ids_and_topics_ignored() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        let other = RequestId::generate();
        assert_eq!(send(&mut engine, &other, json!({"type": "end"})), Step::Ignored);
        let body = json!({"type": "end", "reqId": id.as_str()}).to_string();
        assert_eq!(
            engine.handle_message("cloud/uav/rpc/history/reply/someone_else", body.as_bytes()),
            Step::Ignored
        );
        let reply_topic = engine.reply_topic().to_string();
        assert_eq!(engine.handle_message(&reply_topic, b"not json"), Step::Ignored);
        assert_eq!(engine.state(), EngineState::AwaitingStart { request_id: id });
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": "QQ=="}));
        assert_eq!(
            step,
            Step::Rejected {
                request_id: id.clone(),
                reason: Rejection::ChunkBeforeStart
            }
        );

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 1}));
        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 5, "dataB64": "QQ=="}));
        assert!(matches!(
            step,
            Step::Rejected {
                reason: Rejection::ChunkOutOfRange { index: 5, expected: 1 },
                ..
            }
        ));
        let step = send(&mut engine, &id, json!({"type": "dates", "dates": []}));
        assert!(matches!(step, Step::Rejected { reason: Rejection::UnexpectedReply { .. }, .. }));
        let step = send(&mut engine, &id, json!({"type": "chunk", "i": "zero"}));
        assert!(matches!(step, Step::Rejected { reason: Rejection::Unparseable(_), .. }));

        assert_eq!(
            engine.state(),
            EngineState::Receiving {
                request_id: id,
                received: 0,
                expected: 1
            }
        );
    }

    #[test]
    fn test_bad_base64_fails() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 1}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": "!!!"}));
        match send(&mut engine, &id, json!({"type": "end"})) {
            Step::Finished(Outcome::Failed { failure, .. }) => {
                assert_eq!(failure, RetrievalFailure::Decode { index: 0 })
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_zero_chunk_file() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 0, "filename": "empty.csv"}));
        match send(&mut engine, &id, json!({"type": "end"})) {
            Step::Finished(Outcome::Completed { bytes, .. }) => assert!(bytes.is_empty()),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_supersession_is_silent() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let first = issue_fetch(&mut engine, &bus);
        send(&mut engine, &first, json!({"type": "start", "totalChunks": 1}));

        let dev = DeviceId::from("uav-7");
        let issued = engine.list_dates(Some(&bus), Some(&dev)).unwrap();
        assert_eq!(issued.superseded, Some(first.clone()));
        assert_eq!(issued.generation, 2);

        assert_eq!(
            send(&mut engine, &first, json!({"type": "chunk", "i": 0, "dataB64": "QQ=="})),
            Step::Ignored
        );

        let second = issued.request.request_id;
        match send(&mut engine, &second, json!({"type": "dates", "dates": ["2024-05-01", "2024-05-02"]})) {
            Step::Finished(Outcome::Dates { dates, .. }) => {
                assert_eq!(dates, vec!["2024-05-01", "2024-05-02"])
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_list_dates_envelope() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let dev = DeviceId::from("uav-7");
        engine.list_dates(Some(&bus), Some(&dev)).unwrap();

        let (_, payload) = bus.published().pop().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["action"], json!("list_dates"));
        assert!(value.get("date").is_none());
    }

    #[test]
    fn test_preconditions_fail_before_network() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let dev = DeviceId::from("uav-7");

        assert!(matches!(
            engine.fetch(None, Some(&dev), Some("2024-05-01")),
            Err(Error::TransportUnavailable)
        ));
        assert!(matches!(
            engine.fetch(Some(&bus), None, Some("2024-05-01")),
            Err(Error::NoDeviceSelected)
        ));
        assert!(matches!(
            engine.fetch(Some(&bus), Some(&DeviceId::from(" ")), Some("2024-05-01")),
            Err(Error::NoDeviceSelected)
        ));
        assert!(matches!(
            engine.fetch(Some(&bus), Some(&dev), Some("")),
            Err(Error::NoDateSelected)
        ));
        assert!(matches!(engine.list_dates(Some(&bus), None), Err(Error::NoDeviceSelected)));
        assert!(bus.ops().is_empty());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    /// Refuses subscribes or publishes on demand.
    struct FlakyBus {
        inner: RecordingBus,
        fail_subscribe: bool,
        fail_publish: bool,
    }

    impl Bus for FlakyBus {
        fn subscribe(&self, topic: &str) -> Result<()> {
            if self.fail_subscribe {
                return Err(Error::ChannelSend);
            }
            self.inner.subscribe(topic)
        }

        fn unsubscribe(&self, topic: &str) -> Result<()> {
            self.inner.unsubscribe(topic)
        }

        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.fail_publish {
                return Err(Error::ChannelSend);
            }
            self.inner.publish(topic, payload)
        }
    }

    #[test]
    fn test_huge_chunk_count_does_not_allocate() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        let step = send(&mut engine, &id, json!({"type": "start", "totalChunks": 1u64 << 60}));
        assert!(matches!(step, Step::Progress(Progress { percent: 1, received: 0, .. })));

        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 12345, "dataB64": "QQ=="}));
        assert!(matches!(step, Step::Progress(Progress { percent: 0, received: 1, .. })));
        let step = send(&mut engine, &id, json!({"type": "end"}));
        assert!(matches!(step, Step::Progress(Progress { end_seen: true, .. })));
        assert_eq!(
            engine.state(),
            EngineState::Receiving {
                request_id: id,
                received: 1,
                expected: 1 << 60
            }
        );
    }

    #[test]
    fn test_progress_floors_after_start() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        let step = send(&mut engine, &id, json!({"type": "start", "totalChunks": 200}));
        assert!(matches!(step, Step::Progress(Progress { percent: 1, .. })));
        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": "QQ=="}));
        assert!(matches!(step, Step::Progress(Progress { percent: 0, received: 1, .. })));
        let step = send(&mut engine, &id, json!({"type": "chunk", "i": 1, "dataB64": "QQ=="}));
        assert!(matches!(step, Step::Progress(Progress { percent: 1, received: 2, .. })));
    }

    #[test]
    fn test_repeated_start_keeps_chunks() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        send(&mut engine, &id, json!({"type": "start", "totalChunks": 2, "filename": "f.csv"}));
        send(&mut engine, &id, json!({"type": "chunk", "i": 0, "dataB64": "QQ=="}));
        let step = send(&mut engine, &id, json!({"type": "start", "totalChunks": 2}));
        assert!(matches!(step, Step::Progress(Progress { received: 1, expected: 2, .. })));

        let step = send(&mut engine, &id, json!({"type": "start", "totalChunks": 3}));
        assert_eq!(
            step,
            Step::Rejected {
                request_id: id.clone(),
                reason: Rejection::ConflictingStart {
                    announced: 3,
                    expected: 2
                }
            }
        );
        assert_eq!(
            engine.state(),
            EngineState::Receiving {
                request_id: id.clone(),
                received: 1,
                expected: 2
            }
        );

        send(&mut engine, &id, json!({"type": "chunk", "i": 1, "dataB64": "Qg=="}));
        match send(&mut engine, &id, json!({"type": "end"})) {
            Step::Finished(Outcome::Completed { bytes, filename, .. }) => {
                assert_eq!(bytes, b"AB");
                assert_eq!(filename, "f.csv");
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_failed_issue_keeps_inflight_request() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let first = issue_fetch(&mut engine, &bus);
        let dev = DeviceId::from("uav-7");

        for (fail_subscribe, fail_publish) in [(true, false), (false, true)] {
            let flaky = FlakyBus {
                inner: RecordingBus::new(),
                fail_subscribe,
                fail_publish,
            };
            assert!(engine.fetch(Some(&flaky), Some(&dev), Some("2024-05-02")).is_err());
            assert!(flaky.inner.published().is_empty());
            assert_eq!(engine.current_generation(), 1);
            assert_eq!(
                engine.state(),
                EngineState::AwaitingStart {
                    request_id: first.clone()
                }
            );
        }

        let step = send(&mut engine, &first, json!({"type": "start", "totalChunks": 1}));
        assert!(matches!(step, Step::Progress(_)));
    }

    #[test]
    fn test_release_only_when_idle() {
        let bus = RecordingBus::new();
        let mut engine = engine();
        let id = issue_fetch(&mut engine, &bus);

        assert!(!engine.release(&bus).unwrap());
        send(&mut engine, &id, json!({"type": "error", "message": "busy"}));
        assert!(engine.release(&bus).unwrap());
        assert_eq!(
            bus.ops().last(),
            Some(&BusOp::Unsubscribe(
                "cloud/uav/rpc/history/reply/web_test".to_string()
            ))
        );
    }
}
