//! The viewer's single event loop. It owns the session and the broker
//! connection; everything else talks to it through commands and snapshots.

use crate::bus::Bus;
use crate::config::{ViewerConfig, RECONNECT_DELAY, TICK_INTERVAL};
use crate::errors::{Error, Result};
use crate::metrics::MESSAGES_TOTAL;
use crate::model::DeviceId;
use crate::mqtt::{Connection, ConnectionStatus, Credentials};
use crate::prefs::Preferences;
use crate::retrieval::{EngineState, Issued, Outcome, Step};
use crate::session::{Download, Handled, Session, Snapshot};
use rumqttc::{AsyncClient, ConnectionError, Event, Outgoing, Packet, QoS};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub enum Command {
    Fetch {
        device: Option<DeviceId>,
        date: Option<String>,
        reply: oneshot::Sender<Result<Issued>>,
    },
    ListDates {
        device: Option<DeviceId>,
        reply: oneshot::Sender<Result<Issued>>,
    },
    Connect {
        username: Option<String>,
        password: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn run_event_loop(
    mut config: ViewerConfig,
    mut prefs: Preferences,
    mut commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Snapshot>,
) {
    info!(
        "Starting event loop: topic={}, offline_ms={}, max_points={}",
        config.topic, config.offline_ms, config.max_points
    );

    let mut session = Session::new(&config);
    let credentials = Credentials::resolve(&config, &prefs);
    let mut connection = Some(Connection::open(&config, credentials.as_ref()));
    let mut ticker = interval(TICK_INTERVAL);
    // Set after a failed poll; the broker is not polled again until then.
    let mut reconnect_at: Option<Instant> = None;

    loop {
        tokio::select! {
            event = poll(&mut connection), if reconnect_at.is_none() => {
                match event {
                    Ok(event) => {
                        let client = connection.as_ref().map(|c| c.client.clone());
                        handle_event(&config, &mut session, client, event).await;
                    }
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        session.set_connection(ConnectionStatus::from_error(&e));
                        reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                    }
                }
                snapshots.send_replace(session.snapshot(now_ms()));
            }

            _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                // rumqttc reconnects on the next poll
                reconnect_at = None;
                if connection.is_some() {
                    session.set_connection(ConnectionStatus::Reconnecting);
                }
                snapshots.send_replace(session.snapshot(now_ms()));
            }

            _ = ticker.tick() => {
                snapshots.send_replace(session.snapshot(now_ms()));
            }

            command = commands.recv() => {
                let Some(command) = command else {
                    info!("Command channel closed, stopping event loop");
                    break;
                };
                if matches!(command, Command::Connect { .. } | Command::Disconnect { .. }) {
                    reconnect_at = None;
                }
                handle_command(&mut config, &mut prefs, &mut session, &mut connection, command);
                snapshots.send_replace(session.snapshot(now_ms()));
            }
        }
    }

    if let Some(conn) = connection {
        if let Err(e) = conn.client.try_disconnect() {
            debug!("Disconnect on shutdown failed: {}", e);
        }
    }
    info!("Event loop stopped");
}

async fn poll(connection: &mut Option<Connection>) -> std::result::Result<Event, ConnectionError> {
    match connection {
        Some(conn) => conn.eventloop.poll().await,
        None => std::future::pending().await,
    }
}

/// The bus is only offered to the engine while the broker session is up.
fn available_bus<'a>(
    session: &Session,
    connection: Option<&'a Connection>,
) -> Option<&'a dyn Bus> {
    match (session.connection(), connection) {
        (ConnectionStatus::Connected, Some(conn)) => Some(&conn.client as &dyn Bus),
        _ => None,
    }
}

async fn handle_event(
    config: &ViewerConfig,
    session: &mut Session,
    client: Option<AsyncClient>,
    event: Event,
) {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("Connected to MQTT broker");
            session.set_connection(ConnectionStatus::Connected);
            let Some(client) = client else { return };

            match client.try_subscribe(config.topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => info!("Subscribed to {}", config.topic),
                Err(e) => {
                    error!("Subscribe to {} failed: {}", config.topic, e);
                    session.set_connection(ConnectionStatus::Error(format!("subscribe error: {}", e)));
                }
            }
            // A clean session drops the reply subscription of an in-flight request.
            if session.engine().state() != EngineState::Idle {
                let reply_topic = session.engine().reply_topic().to_string();
                if let Err(e) = client.try_subscribe(reply_topic.as_str(), QoS::AtMostOnce) {
                    warn!("Re-subscribe to {} failed: {}", reply_topic, e);
                }
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            MESSAGES_TOTAL.inc();
            debug!(
                "Received message on topic {}, size: {} bytes",
                publish.topic,
                publish.payload.len()
            );

            let handled = session.handle_publish(&publish.topic, &publish.payload, now_ms());
            let Handled::Reply(Step::Finished(outcome)) = handled else {
                return;
            };
            if let Some(client) = &client {
                if let Err(e) = session.engine().release(client) {
                    debug!("Releasing reply topic failed: {}", e);
                }
            }
            if let Outcome::Completed { .. } = outcome {
                if let Some(download) = session.history().download.clone() {
                    match save_download(&config.download_dir, &download).await {
                        Ok(path) => info!("Saved {} ({} bytes)", path.display(), download.size),
                        Err(e) => error!("Failed to save {}: {}", download.filename, e),
                    }
                }
            }
        }
        Event::Outgoing(Outgoing::Disconnect) => {
            info!("Disconnect sent to broker");
            session.set_connection(ConnectionStatus::Closed);
        }
        _ => {}
    }
}

fn handle_command(
    config: &mut ViewerConfig,
    prefs: &mut Preferences,
    session: &mut Session,
    connection: &mut Option<Connection>,
    command: Command,
) {
    match command {
        Command::Fetch {
            device,
            date,
            reply,
        } => {
            let bus = available_bus(session, connection.as_ref());
            let result = session.fetch(bus, device, date.as_deref());
            if let Err(e) = &result {
                warn!("History fetch not issued: {}", e);
            }
            let _ = reply.send(result);
        }
        Command::ListDates { device, reply } => {
            let bus = available_bus(session, connection.as_ref());
            let result = session.list_dates(bus, device);
            if let Err(e) = &result {
                warn!("Date list not issued: {}", e);
            }
            let _ = reply.send(result);
        }
        Command::Connect {
            username,
            password,
            reply,
        } => {
            if let Some(user) = username.filter(|u| !u.trim().is_empty()) {
                if let Err(e) = prefs.set_last_user(&user) {
                    warn!("Could not remember user {}: {}", user, e);
                }
                config.username = Some(user);
            }
            if password.is_some() {
                config.password = password;
            }
            if let Some(old) = connection.take() {
                if let Err(e) = old.client.try_disconnect() {
                    debug!("Closing previous connection failed: {}", e);
                }
            }
            let credentials = Credentials::resolve(config, prefs);
            *connection = Some(Connection::open(config, credentials.as_ref()));
            session.set_connection(ConnectionStatus::Connecting);
            let _ = reply.send(Ok(()));
        }
        Command::Disconnect { reply } => {
            if let Some(old) = connection.take() {
                if let Err(e) = old.client.try_disconnect() {
                    debug!("Disconnect failed: {}", e);
                }
            }
            session.disconnected();
            info!("Disconnected from MQTT broker");
            let _ = reply.send(());
        }
        Command::Clear { reply } => {
            session.clear();
            info!("Cleared device state");
            let _ = reply.send(());
        }
    }
}

/// Writes a reassembled file into `dir`. Only the final path component of
/// the remote filename is used.
pub async fn save_download(dir: &Path, download: &Download) -> Result<PathBuf> {
    let name = Path::new(&download.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}_history.csv", download.device));

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, &download.bytes).await?;
    Ok(path)
}

/// Sends a command and waits for the event loop's answer.
pub async fn request<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).await.map_err(|_| Error::ChannelSend)?;
    rx.await.map_err(|_| Error::ChannelSend)
}
