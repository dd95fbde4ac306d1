//! can2mqtt-monitor - print what the bridge publishes
//!
//! Usage:
//!   can2mqtt-monitor [OPTIONS]
//!
//! Options:
//!   -b, --broker <ADDR>    Broker address (default: localhost:1883)
//!   -t, --topic <FILTER>   Topic filter, wildcards allowed (default: /can/#)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)

use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use can2mqtt::client::{
    BrokerClient, ClientError, ClientOptions, ClientStatus, InboundCallback, MqttClient,
};
use can2mqtt::protocol::QoS;

#[derive(Parser, Debug)]
#[command(name = "can2mqtt-monitor")]
#[command(version)]
#[command(about = "Subscribe to bridge topics and print every message")]
struct Args {
    /// Broker address (host, host:port or mqtt://host:port)
    #[arg(short, long, default_value = "localhost:1883")]
    broker: String,

    /// Topic filter
    #[arg(short, long, default_value = "/can/#")]
    topic: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn print_message(topic: String, payload: Bytes) {
    let bytes: Vec<String> = payload.iter().map(|b| format!("0x{:02x}", b)).collect();
    println!("topic={}", topic);
    println!("payload=[{}]", bytes.join(" "));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_id = format!("monitor-{}", std::process::id());
    let callback: InboundCallback = Arc::new(print_message);
    let client = MqttClient::spawn(
        ClientOptions::new(client_id, args.broker.clone()),
        Some(callback),
    );

    tokio::select! {
        _ = watch(&client, &args.broker, &args.topic) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    client.disconnect().await;
    Ok(())
}

/// Subscribe on every (re)connect until the client shuts down
async fn watch(client: &MqttClient, broker: &str, filter: &str) {
    let mut status = client.status_changes();
    loop {
        // Marks the current status seen; any later update ends this session
        let reached = status
            .wait_for(|s| matches!(s, ClientStatus::Connected | ClientStatus::Closed))
            .await
            .map(|s| *s);
        if !matches!(reached, Ok(ClientStatus::Connected)) {
            error!("{}: {}", broker, ClientError::Closed);
            return;
        }
        info!("connect {} status {}", broker, ClientStatus::Connected);

        if let Err(e) = client.subscribe(filter, QoS::AtMostOnce).await {
            error!("Failed to subscribe to {}: {}", filter, e);
        }

        if status.changed().await.is_err() {
            return;
        }
    }
}
