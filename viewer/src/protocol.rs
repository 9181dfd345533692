//! Wire format of the history RPC carried over MQTT.
//!
//! Requests go to one well-known topic. Replies come back on a per-requester
//! topic and always carry the `reqId` of the request they answer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_REQUEST_TOPIC: &str = "cloud/uav/rpc/history/request";
pub const DEFAULT_REPLY_PREFIX: &str = "cloud/uav/rpc/history/reply";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Fetch,
    ListDates,
}

/// Request envelope. A fetch carries `date` and no `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(rename = "replyTo")]
    pub reply_to: String,
}

/// Correlation header shared by every reply
#[derive(Debug, Deserialize)]
pub struct ReplyHeader {
    #[serde(rename = "reqId")]
    pub req_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    Start {
        #[serde(rename = "totalChunks")]
        total_chunks: usize,
        #[serde(default)]
        filename: Option<String>,
    },
    Chunk {
        i: usize,
        #[serde(rename = "dataB64", default)]
        data_b64: String,
    },
    End,
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        file: Option<String>,
    },
    Dates {
        #[serde(default)]
        dates: Value,
    },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Start { .. } => "start",
            Reply::Chunk { .. } => "chunk",
            Reply::End => "end",
            Reply::Error { .. } => "error",
            Reply::Dates { .. } => "dates",
        }
    }
}

/// Date strings out of a `dates` reply. Anything but an array is an empty list.
pub fn date_list(dates: &Value) -> Vec<String> {
    match dates {
        Value::Array(items) => items
            .iter()
            .filter_map(|d| d.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
