use crate::bus::Bus;
use crate::config::{TransportKind, ViewerConfig, KEEP_ALIVE};
use crate::errors::Result;
use crate::prefs::Preferences;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, MqttOptions, QoS, Transport};
use serde::Serialize;
use tracing::{debug, info};

const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Broker connection state as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Offline,
    Error(String),
    Closed,
}

impl ConnectionStatus {
    /// Status after a failed poll; the event loop reconnects on the next poll
    pub fn from_error(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::Io(_) | ConnectionError::NetworkTimeout => ConnectionStatus::Offline,
            other => ConnectionStatus::Error(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Explicit username, else the remembered one. No username, no credentials.
    pub fn resolve(config: &ViewerConfig, prefs: &Preferences) -> Option<Self> {
        let username = config
            .username
            .clone()
            .or_else(|| prefs.last_user().map(str::to_string))?;
        Some(Self {
            username,
            password: config.password.clone().unwrap_or_default(),
        })
    }
}

pub fn mqtt_options(config: &ViewerConfig, credentials: Option<&Credentials>) -> MqttOptions {
    let mut options = match config.transport {
        TransportKind::Ws | TransportKind::Wss => {
            MqttOptions::new(&config.client_id, config.websocket_url(), config.port)
        }
        TransportKind::Tcp | TransportKind::Tls => {
            MqttOptions::new(&config.client_id, config.host.trim(), config.port)
        }
    };
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    match config.transport {
        TransportKind::Tcp => {}
        TransportKind::Tls => {
            options.set_transport(Transport::tls_with_default_config());
        }
        TransportKind::Ws => {
            options.set_transport(Transport::Ws);
        }
        TransportKind::Wss => {
            options.set_transport(Transport::wss_with_default_config());
        }
    }

    if let Some(c) = credentials {
        options.set_credentials(c.username.as_str(), c.password.as_str());
    }
    options
}

/// One broker connection. Nothing is sent until the event loop is polled.
pub struct Connection {
    pub client: AsyncClient,
    pub eventloop: EventLoop,
}

impl Connection {
    pub fn open(config: &ViewerConfig, credentials: Option<&Credentials>) -> Self {
        match config.transport {
            TransportKind::Ws | TransportKind::Wss => {
                info!("Connecting to MQTT broker at {}", config.websocket_url())
            }
            TransportKind::Tcp | TransportKind::Tls => {
                info!("Connecting to MQTT broker at {}:{}", config.host, config.port)
            }
        }
        if let Some(c) = credentials {
            debug!("Using credentials for user {}", c.username);
        }
        let (client, eventloop) =
            AsyncClient::new(mqtt_options(config, credentials), REQUEST_CHANNEL_CAPACITY);
        Self { client, eventloop }
    }
}

impl Bus for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<()> {
        self.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}
