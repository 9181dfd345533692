use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use viewer::bus::{Bus, RecordingBus};
use viewer::config::ViewerConfig;
use viewer::errors::Error;
use viewer::model::{DeviceId, Summary};
use viewer::protocol::RequestEnvelope;
use viewer::retrieval::{EngineState, Outcome, RetrievalFailure, Step};
use viewer::session::{Handled, Session};

const TELEMETRY_TOPIC: &str = "cloud/uav/uav-7/telemetry";

fn session() -> Session {
    let config = ViewerConfig {
        client_id: "web_flow".to_string(),
        ..ViewerConfig::default()
    };
    Session::new(&config)
}

/// Plays the field-side responder for whatever request the bus last published.
fn last_request(bus: &RecordingBus) -> RequestEnvelope {
    let (_, payload) = bus.published().pop().expect("no request published");
    serde_json::from_slice(&payload).unwrap()
}

fn reply(session: &mut Session, req: &RequestEnvelope, mut body: Value) -> Handled {
    body["reqId"] = json!(req.req_id);
    session.handle_publish(&req.reply_to, body.to_string().as_bytes(), 0)
}

#[test]
fn test_telemetry_and_history_in_one_session() {
    let mut s = session();
    s.handle_publish(TELEMETRY_TOPIC, br#"{"sensors": {"co2": 410, "temp": 21.0}}"#, 1_000);
    assert_eq!(
        s.snapshot(2_000).summary,
        Summary { total: 1, online: 1, offline: 0 }
    );

    let bus = RecordingBus::new();
    s.fetch(Some(&bus as &dyn Bus), None, Some("2024-05-01")).unwrap();
    let req = last_request(&bus);
    assert_eq!(req.device, "uav-7");
    assert_eq!(req.reply_to, "cloud/uav/rpc/history/reply/web_flow");

    let csv = "ts,co2,temp,rh\n1714521600000,410,21.0,40\n1714521601000,412,21.1,40\n";
    let chunks: Vec<String> = csv
        .as_bytes()
        .chunks(16)
        .map(|c| STANDARD.encode(c))
        .collect();

    reply(
        &mut s,
        &req,
        json!({"type": "start", "totalChunks": chunks.len(), "filename": "uav-7_2024-05-01.csv"}),
    );
    // reversed, with every chunk delivered twice
    for (i, data) in chunks.iter().enumerate().rev() {
        reply(&mut s, &req, json!({"type": "chunk", "i": i, "dataB64": data}));
        reply(&mut s, &req, json!({"type": "chunk", "i": i, "dataB64": "Wg=="}));
    }
    let handled = reply(&mut s, &req, json!({"type": "end"}));
    let Handled::Reply(Step::Finished(Outcome::Completed { bytes, filename, .. })) = handled else {
        panic!("expected a completed download");
    };
    assert_eq!(filename, "uav-7_2024-05-01.csv");
    assert_eq!(String::from_utf8(bytes).unwrap(), csv);

    // telemetry keeps flowing and the reply topic never becomes a device
    assert_eq!(s.snapshot(20_000).summary, Summary { total: 1, online: 0, offline: 1 });
    assert_eq!(s.history().progress, 100);
}

#[test]
fn test_end_without_start_delivers_nothing() {
    let mut s = session();
    let bus = RecordingBus::new();
    s.fetch(Some(&bus as &dyn Bus), Some(DeviceId::from("uav-7")), Some("2024-05-01"))
        .unwrap();
    let req = last_request(&bus);

    let handled = reply(&mut s, &req, json!({"type": "end"}));
    assert!(matches!(
        handled,
        Handled::Reply(Step::Finished(Outcome::Failed {
            failure: RetrievalFailure::MissingStart,
            ..
        }))
    ));
    assert!(s.history().download.is_none());
    assert_eq!(s.history().engine, EngineState::Idle);
}

#[test]
fn test_superseded_fetch_is_silent() {
    let mut s = session();
    let bus = RecordingBus::new();
    let dev = DeviceId::from("uav-7");

    s.fetch(Some(&bus as &dyn Bus), Some(dev.clone()), Some("2024-05-01")).unwrap();
    let first = last_request(&bus);
    s.list_dates(Some(&bus as &dyn Bus), Some(dev)).unwrap();
    let second = last_request(&bus);
    assert_ne!(first.req_id, second.req_id);

    let stale = reply(&mut s, &first, json!({"type": "start", "totalChunks": 1}));
    assert_eq!(stale, Handled::Reply(Step::Ignored));

    reply(&mut s, &second, json!({"type": "dates", "dates": ["2024-04-30", "2024-05-01"]}));
    assert_eq!(
        s.history().dates.as_deref(),
        Some(&["2024-04-30".to_string(), "2024-05-01".to_string()][..])
    );
}

#[test]
fn test_requests_need_transport_and_device() {
    let mut s = session();
    let bus = RecordingBus::new();

    assert!(matches!(
        s.fetch(None, Some(DeviceId::from("uav-7")), Some("2024-05-01")),
        Err(Error::TransportUnavailable)
    ));
    // no devices known yet, so there is nothing to default to
    assert!(matches!(
        s.list_dates(Some(&bus as &dyn Bus), None),
        Err(Error::NoDeviceSelected)
    ));
    assert!(bus.ops().is_empty());
}
