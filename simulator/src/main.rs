mod history;
mod telemetry;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use history::{Archive, Request, ResponderOptions, REQUEST_TOPIC};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Synthetic UAV telemetry and history responder")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Telemetry messages per second across all devices
    #[arg(long, env = "RATE", default_value_t = 5)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    /// Days of history each device can serve
    #[arg(long, env = "HISTORY_DAYS", default_value_t = 7)]
    days: u32,

    #[arg(long, env = "CHUNK_SIZE", default_value_t = 4096)]
    chunk_size: usize,

    #[arg(long, env = "ROWS_PER_DAY", default_value_t = 1440)]
    rows_per_day: usize,

    /// Send history chunks out of order
    #[arg(long)]
    shuffle: bool,

    /// Repeat one chunk per transfer
    #[arg(long)]
    duplicate: bool,

    /// Serve history only, publish no telemetry
    #[arg(long)]
    no_telemetry: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting UAV simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let client_id = format!("sim-{}", rand::thread_rng().gen::<u32>());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    let archive = Arc::new(Archive::new(
        Utc::now().date_naive(),
        ResponderOptions {
            chunk_size: args.chunk_size,
            days: args.days,
            rows_per_day: args.rows_per_day,
            shuffle: args.shuffle,
            duplicate: args.duplicate,
        },
    ));

    // Spawn eventloop handler; it also answers history requests
    let responder = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected, listening on {}", REQUEST_TOPIC);
                    if let Err(e) = responder.try_subscribe(REQUEST_TOPIC, QoS::AtMostOnce) {
                        error!("Subscribe to {} failed: {}", REQUEST_TOPIC, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == REQUEST_TOPIC => {
                    match serde_json::from_slice::<Request>(&publish.payload) {
                        Ok(req) => {
                            tokio::spawn(answer(responder.clone(), archive.clone(), req));
                        }
                        Err(e) => warn!("Ignoring malformed history request: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    if args.no_telemetry {
        tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
        info!("Received shutdown signal");
        return Ok(());
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    tokio::select! {
        result = publish_telemetry(&client, &args) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}

async fn answer(client: AsyncClient, archive: Arc<Archive>, req: Request) {
    let replies = archive.respond(&req, &mut rand::thread_rng());
    info!(
        "Answering {} for {} {} with {} messages on {}",
        req.req_id,
        req.device,
        req.date.as_deref().unwrap_or("(dates)"),
        replies.len(),
        req.reply_to
    );
    for reply in replies {
        if let Err(e) = client
            .publish(&req.reply_to, QoS::AtMostOnce, false, reply.to_string())
            .await
        {
            warn!("Failed to publish reply for {}: {}", req.req_id, e);
            return;
        }
    }
    debug!("Finished {}", req.req_id);
}

async fn publish_telemetry(client: &AsyncClient, args: &Args) -> anyhow::Result<()> {
    anyhow::ensure!(args.rate > 0, "rate must be positive");
    anyhow::ensure!(args.devices > 0, "need at least one device");

    let mut counter = 0u64;
    let burst_size = args.devices;
    let burst_interval = Duration::from_millis((burst_size as u64 * 1000) / args.rate);
    info!(
        "Publishing in bursts of {} messages every {:?}",
        burst_size, burst_interval
    );

    loop {
        let burst_start = std::time::Instant::now();

        for n in 0..burst_size {
            let device = format!("uav-{}", n + 1);
            let payload = {
                let mut rng = rand::thread_rng();
                let reading = telemetry::generate_reading(&mut rng);
                telemetry::payload(&mut rng, &device, reading, Utc::now().timestamp_millis())
            };

            match client
                .publish(
                    telemetry::telemetry_topic(&device),
                    QoS::AtMostOnce,
                    false,
                    payload.to_string(),
                )
                .await
            {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        // Log progress periodically
        if counter % 100 == 0 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?}",
                elapsed, burst_interval
            );
        }
    }
}
