use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub co2: f64,
    pub temp: f64,
    pub rh: f64,
}

pub fn telemetry_topic(device: &str) -> String {
    format!("cloud/uav/{}/telemetry", device)
}

pub fn generate_reading(rng: &mut impl Rng) -> Reading {
    let co2 = if rng.gen_bool(0.05) {
        rng.gen_range(1500.0..5000.0) // 5% spikes
    } else {
        rng.gen_range(380.0..900.0)
    };

    Reading {
        co2: round1(co2),
        temp: round1(rng.gen_range(15.0..35.0)),
        rh: round1(rng.gen_range(30.0..80.0)),
    }
}

/// Field firmware is not uniform: some units nest readings under `sensors`,
/// some use long key names, some send numbers as strings.
pub fn payload(rng: &mut impl Rng, device: &str, reading: Reading, ts: i64) -> Value {
    match rng.gen_range(0..4) {
        0 => json!({
            "device": device,
            "ts": ts,
            "sensors": { "co2": reading.co2, "temp": reading.temp, "rh": reading.rh },
        }),
        1 => json!({
            "device": device,
            "timestamp": ts,
            "co2_ppm": reading.co2,
            "temperature": reading.temp,
            "humidity": reading.rh,
        }),
        2 => json!({
            "ts": ts,
            "co2": reading.co2.to_string(),
            "temp": reading.temp.to_string(),
            "rh": reading.rh.to_string(),
        }),
        _ => json!({
            "device": device,
            "CO2": reading.co2,
            "temp": reading.temp,
        }),
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
