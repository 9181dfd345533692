use crate::errors::{Error, Result};
use crate::protocol::{DEFAULT_REPLY_PREFIX, DEFAULT_REQUEST_TOPIC};
use crate::series::{effective_max_points, DEFAULT_MAX_POINTS};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_PATH: &str = "/mqtt";
pub const DEFAULT_TOPIC: &str = "cloud/uav/+/telemetry";
pub const DEFAULT_OFFLINE_MS: i64 = 8000;
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_PREFS_PATH: &str = "viewer_prefs.json";

/// How often liveness is re-evaluated without new messages
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Delay between broker reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// Command-line flags. Every flag can also come from the environment and
/// overrides the config file.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "viewer", about = "Live UAV telemetry viewer with MQTT history retrieval")]
pub struct Cli {
    /// JSON config file with `host`, `port`, `path`, `topic`, `maxPoints`, `offlineMs`
    #[arg(long, env = "VIEWER_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "MQTT_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "MQTT_PORT")]
    pub port: Option<u16>,
    /// Websocket path, used with `ws`/`wss`
    #[arg(long, env = "MQTT_PATH")]
    pub path: Option<String>,
    /// Telemetry topic filter
    #[arg(long, env = "MQTT_TOPIC")]
    pub topic: Option<String>,
    #[arg(long, env = "MQTT_TRANSPORT", value_enum)]
    pub transport: Option<TransportKind>,
    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,
    #[arg(long, env = "MAX_POINTS")]
    pub max_points: Option<usize>,
    #[arg(long, env = "OFFLINE_MS")]
    pub offline_ms: Option<i64>,
    #[arg(long, env = "RPC_REQUEST_TOPIC")]
    pub request_topic: Option<String>,
    #[arg(long, env = "RPC_REPLY_PREFIX")]
    pub reply_prefix: Option<String>,
    #[arg(long, env = "HTTP_ADDR")]
    pub http_addr: Option<String>,
    #[arg(long, env = "DOWNLOAD_DIR")]
    pub download_dir: Option<PathBuf>,
    #[arg(long, env = "PREFS_PATH")]
    pub prefs_path: Option<PathBuf>,
}

/// Config file contents. All keys optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub topic: Option<String>,
    pub max_points: Option<usize>,
    pub offline_ms: Option<i64>,
    pub transport: Option<TransportKind>,
    pub request_topic: Option<String>,
    pub reply_prefix: Option<String>,
    pub http_addr: Option<String>,
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub topic: String,
    pub transport: TransportKind,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub max_points: usize,
    pub offline_ms: i64,
    pub request_topic: String,
    pub reply_prefix: String,
    pub http_addr: String,
    pub download_dir: PathBuf,
    pub prefs_path: PathBuf,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self::merge(Cli::default(), FileConfig::default())
    }
}

impl ViewerConfig {
    /// Reads the config file named on the command line, if any, and merges.
    pub fn load(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file))
    }

    /// Flag beats file beats default.
    pub fn merge(cli: Cli, file: FileConfig) -> Self {
        let offline_ms = cli
            .offline_ms
            .or(file.offline_ms)
            .filter(|ms| *ms >= 0)
            .unwrap_or(DEFAULT_OFFLINE_MS);

        Self {
            host: cli.host.or(file.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            path: cli.path.or(file.path).unwrap_or_else(|| DEFAULT_PATH.to_string()),
            topic: cli.topic.or(file.topic).unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            transport: cli.transport.or(file.transport).unwrap_or_default(),
            username: cli.username.filter(|u| !u.trim().is_empty()),
            password: cli.password,
            client_id: cli.client_id.unwrap_or_else(generate_client_id),
            max_points: effective_max_points(
                cli.max_points.or(file.max_points).unwrap_or(DEFAULT_MAX_POINTS),
            ),
            offline_ms,
            request_topic: cli
                .request_topic
                .or(file.request_topic)
                .unwrap_or_else(|| DEFAULT_REQUEST_TOPIC.to_string()),
            reply_prefix: cli
                .reply_prefix
                .or(file.reply_prefix)
                .unwrap_or_else(|| DEFAULT_REPLY_PREFIX.to_string()),
            http_addr: cli
                .http_addr
                .or(file.http_addr)
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            download_dir: cli
                .download_dir
                .or(file.download_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            prefs_path: cli
                .prefs_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFS_PATH)),
        }
    }

    /// `scheme://host:port/path` for websocket transports
    pub fn websocket_url(&self) -> String {
        let scheme = match self.transport {
            TransportKind::Wss | TransportKind::Tls => "wss",
            TransportKind::Ws | TransportKind::Tcp => "ws",
        };
        let mut path = self.path.trim().to_string();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        format!("{}://{}:{}{}", scheme, self.host.trim(), self.port, path)
    }
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
}

fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("web_{}", &id[..8])
}
