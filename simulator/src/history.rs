//! Field-side history responder: keeps a few days of synthetic CSV per
//! device and answers requests with the chunked reply sequence.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write;

pub const REQUEST_TOPIC: &str = "cloud/uav/rpc/history/request";

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub device: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(rename = "replyTo")]
    pub reply_to: String,
}

#[derive(Debug, Clone)]
pub struct ResponderOptions {
    pub chunk_size: usize,
    pub days: u32,
    pub rows_per_day: usize,
    /// Deliver chunks in random order
    pub shuffle: bool,
    /// Send one chunk twice
    pub duplicate: bool,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            days: 7,
            rows_per_day: 1440,
            shuffle: false,
            duplicate: false,
        }
    }
}

pub struct Archive {
    today: NaiveDate,
    options: ResponderOptions,
}

impl Archive {
    pub fn new(today: NaiveDate, options: ResponderOptions) -> Self {
        Self { today, options }
    }

    /// Newest first
    pub fn dates(&self) -> Vec<String> {
        (0..self.options.days)
            .filter_map(|back| self.today.checked_sub_signed(Duration::days(back as i64)))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect()
    }

    /// Same device and date always yield the same file.
    pub fn csv(&self, device: &str, date: &str) -> Option<String> {
        if !self.dates().iter().any(|d| d == date) {
            return None;
        }
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        let start = day.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
        let step = 86_400_000 / self.options.rows_per_day.max(1) as i64;

        let seed = device
            .bytes()
            .chain(date.bytes())
            .fold(17u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
        let mut rng = StdRng::seed_from_u64(seed);

        let mut out = String::from("ts,co2,temp,rh\n");
        for row in 0..self.options.rows_per_day {
            let _ = writeln!(
                out,
                "{},{:.1},{:.1},{:.1}",
                start + row as i64 * step,
                rng.gen_range(380.0..900.0),
                rng.gen_range(15.0..35.0),
                rng.gen_range(30.0..80.0)
            );
        }
        Some(out)
    }

    /// Reply messages for one request, in publish order.
    pub fn respond(&self, req: &Request, rng: &mut impl Rng) -> Vec<Value> {
        if req.action.as_deref() == Some("list_dates") {
            return vec![json!({ "type": "dates", "reqId": req.req_id, "dates": self.dates() })];
        }

        let Some(date) = req.date.as_deref() else {
            return vec![error(req, "missing date", None)];
        };
        let filename = format!("{}_{}.csv", req.device, date);
        let Some(csv) = self.csv(&req.device, date) else {
            return vec![error(req, &format!("no data for {}", date), Some(&filename))];
        };

        let mut chunks: Vec<(usize, String)> = csv
            .as_bytes()
            .chunks(self.options.chunk_size.max(1))
            .map(|c| STANDARD.encode(c))
            .enumerate()
            .collect();

        let mut messages = vec![json!({
            "type": "start",
            "reqId": req.req_id,
            "totalChunks": chunks.len(),
            "filename": filename,
        })];
        if self.options.shuffle {
            chunks.shuffle(rng);
        }
        if self.options.duplicate {
            if let Some(first) = chunks.first().cloned() {
                chunks.push(first);
            }
        }
        for (i, data) in chunks {
            messages.push(json!({ "type": "chunk", "reqId": req.req_id, "i": i, "dataB64": data }));
        }
        messages.push(json!({ "type": "end", "reqId": req.req_id }));
        messages
    }
}

fn error(req: &Request, message: &str, file: Option<&str>) -> Value {
    let mut reply = json!({ "type": "error", "reqId": req.req_id, "message": message });
    if let Some(file) = file {
        reply["file"] = json!(file);
    }
    reply
}
