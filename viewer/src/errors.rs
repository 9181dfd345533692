use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT not connected: connect before requesting history")]
    TransportUnavailable,

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("No date selected")]
    NoDateSelected,

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
