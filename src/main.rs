//! can2mqtt - CAN bus to MQTT bridge
//!
//! Usage:
//!   can2mqtt [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -p, --publish-table <FILE>   CAN -> MQTT mapping table
//!   -s, --subscribe-table <FILE> MQTT -> CAN mapping table
//!   -i, --interface <NAME>       CAN interface (default: can0)
//!   -b, --broker <ADDR>          Broker address (default: localhost:1883)
//!   --dump-tables                Log both mapping tables and exit
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use can2mqtt::bridge::{Bridge, BridgeSettings};
use can2mqtt::can::{CanBus, VirtualBus};
use can2mqtt::client::{BrokerClient, MqttClient};
use can2mqtt::config::{CanDriver, Config};
use can2mqtt::mapping::RoutingTable;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// can2mqtt - CAN bus to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "can2mqtt")]
#[command(version)]
#[command(about = "Bridge CAN frames to MQTT topics and back")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CAN -> MQTT mapping table
    #[arg(short, long)]
    publish_table: Option<PathBuf>,

    /// MQTT -> CAN mapping table
    #[arg(short, long)]
    subscribe_table: Option<PathBuf>,

    /// CAN interface name
    #[arg(short, long)]
    interface: Option<String>,

    /// Broker address (host, host:port or mqtt://host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Log both mapping tables and exit
    #[arg(long)]
    dump_tables: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error in configuration: {}", e);
                std::process::exit(1);
            }
        },
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(path) = args.publish_table {
        config.tables.publish = path;
    }
    if let Some(path) = args.subscribe_table {
        config.tables.subscribe = path;
    }
    if let Some(interface) = args.interface {
        config.can.interface = interface;
    }
    if let Some(broker) = args.broker {
        config.mqtt.address = broker;
    }
    if let Err(e) = config.validate() {
        eprintln!("Error in configuration: {}", e);
        std::process::exit(1);
    }

    let publish_table = match RoutingTable::from_path(&config.tables.publish) {
        Ok(table) => table,
        Err(e) => {
            error!("Cannot load {}: {}", config.tables.publish.display(), e);
            fatal_idle().await
        }
    };
    let subscribe_table = match RoutingTable::from_path(&config.tables.subscribe) {
        Ok(table) => table,
        Err(e) => {
            error!("Cannot load {}: {}", config.tables.subscribe.display(), e);
            fatal_idle().await
        }
    };

    publish_table.dump("publish");
    subscribe_table.dump("subscribe");
    if args.dump_tables {
        return Ok(());
    }

    let bridge = match Bridge::new(BridgeSettings::from(&config), publish_table, subscribe_table)
    {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Cannot create bridge queues: {}", e);
            fatal_idle().await
        }
    };

    info!("Starting can2mqtt");
    info!("  CAN driver: {}", config.can.driver);
    info!("  CAN interface: {}", config.can.interface);
    info!("  Broker: {}", config.mqtt.address);
    info!("  Queue capacity: {}", config.queues.capacity);

    let pub_client = MqttClient::spawn(config.mqtt.client_options("pub"), None);
    let sub_client = MqttClient::spawn(
        config.mqtt.client_options("sub"),
        Some(bridge.inbound_callback()),
    );

    match config.can.driver {
        CanDriver::Virtual => {
            // Nothing injects frames; the handle stays open so the bus idles
            let (bus, handle) = VirtualBus::new();
            std::thread::spawn(move || handle.discard_transmitted());
            run(bridge, bus, pub_client, sub_client).await;
        }
        CanDriver::Socketcan => open_socketcan(bridge, &config, pub_client, sub_client).await,
    }

    Ok(())
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
async fn open_socketcan(
    bridge: Bridge,
    config: &Config,
    pub_client: Arc<MqttClient>,
    sub_client: Arc<MqttClient>,
) {
    match can2mqtt::can::SocketCanBus::open(&config.can.interface) {
        Ok(bus) => run(bridge, bus, pub_client, sub_client).await,
        Err(e) => {
            error!("Cannot open CAN interface {}: {}", config.can.interface, e);
            fatal_idle().await
        }
    }
}

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
async fn open_socketcan(
    _bridge: Bridge,
    _config: &Config,
    _pub_client: Arc<MqttClient>,
    _sub_client: Arc<MqttClient>,
) {
    error!("This build has no SocketCAN support; use driver = \"virtual\"");
    fatal_idle().await
}

/// Run the bridge until its workers stop or Ctrl+C arrives
async fn run<B: CanBus + 'static>(
    bridge: Bridge,
    bus: B,
    pub_client: Arc<MqttClient>,
    sub_client: Arc<MqttClient>,
) {
    let tasks = bridge.spawn(
        bus,
        pub_client.clone() as Arc<dyn BrokerClient>,
        sub_client.clone() as Arc<dyn BrokerClient>,
    );

    tokio::select! {
        _ = tasks.join() => {
            error!("Bridge workers stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    pub_client.disconnect().await;
    sub_client.disconnect().await;
    info!("can2mqtt stopped");
}

/// Park after a fatal startup error instead of exiting, so a supervisor
/// does not restart the bridge in a tight loop.
async fn fatal_idle() -> ! {
    error!("Fatal error, bridge halted");
    match std::future::pending::<Infallible>().await {}
}
