//! mqttgate - point-to-point MQTT v3.1.1 device gateway
//!
//! Usage:
//!   mqttgate [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>            Configuration file path
//!   -b, --bind <ADDR>              Bind address (default: 0.0.0.0:1883)
//!   --accept-threads <N>           Concurrent accept tasks, 1-5 (default: 1)
//!   --io-threads <N>               I/O worker threads (default: CPU count)
//!   --idle-timeout <DURATION>      Read-idle timeout (default: 90s)
//!   --max-packet-size <N>          Maximum packet size (default: 102400)
//!   --max-queued-messages <N>      Inbound queue capacity (default: 100000)
//!   --charset <NAME>               Payload charset (default: UTF-8)
//!   -l, --log-level                Log level (error, warn, info, debug, trace)
//!   -h, --help                     Print help
//!
//! The binary runs the gateway with an echo handler: every message received on
//! `<topic>` is sent back to the same device on `<topic>_reply`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mqttgate::auth::StaticCredentials;
use mqttgate::charset::Charset;
use mqttgate::config::Config;
use mqttgate::gateway::{runtime, Gateway};
use mqttgate::hooks::MessageHandler;
use mqttgate::queue::PendingMessage;
use mqttgate::session::Session;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
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

/// mqttgate - MQTT device gateway
#[derive(Parser, Debug)]
#[command(name = "mqttgate")]
#[command(author = "mqttgate Contributors")]
#[command(version)]
#[command(about = "Point-to-point MQTT v3.1.1 device gateway")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Concurrent accept tasks (1-5)
    #[arg(long)]
    accept_threads: Option<usize>,

    /// I/O worker threads (0 = auto, at most 100)
    #[arg(long)]
    io_threads: Option<usize>,

    /// Close connections idle for this long (e.g. 90s, 5m)
    #[arg(long, value_parser = parse_duration)]
    idle_timeout: Option<Duration>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Capacity of the inbound message queue
    #[arg(long)]
    max_queued_messages: Option<usize>,

    /// Payload charset (UTF-8, ISO-8859-1, US-ASCII)
    #[arg(long)]
    charset: Option<Charset>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Replies to every message on `<topic>_reply` with the same content
struct EchoHandler;

impl MessageHandler for EchoHandler {
    type Extension = ();

    fn on_message(&self, message: &PendingMessage) {
        let reply_topic = format!("{}_reply", message.topic());
        if let Err(e) = message.reply(&reply_topic, message.content()) {
            warn!(
                "echo to {} ({}) failed: {}",
                message.connection(),
                message.address(),
                e
            );
        }
    }

    fn online(&self, identity: &str, session: &mut Session<()>) {
        info!(
            "{} online on {} from {}",
            identity,
            session.connection(),
            session.address()
        );
    }

    fn offline(&self, identity: &str, session: &Session<()>) {
        info!("{} offline ({})", identity, session.connection());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    match (&file_config.log.filter, args.log_level) {
        (Some(filter), None) => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(EnvFilter::try_new(filter)?)
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        _ => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(log_level.to_tracing_level())
                .with_target(false)
                .with_thread_ids(true)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let mut gateway_config = file_config.to_gateway_config();
    if let Some(bind) = args.bind {
        gateway_config.bind_addr = bind;
    }
    if let Some(n) = args.accept_threads {
        gateway_config.accept_threads = n;
    }
    if let Some(n) = args.io_threads {
        gateway_config.io_threads = n;
    }
    if let Some(timeout) = args.idle_timeout {
        gateway_config.idle_timeout = timeout;
    }
    if let Some(size) = args.max_packet_size {
        gateway_config.max_packet_size = size;
    }
    if let Some(capacity) = args.max_queued_messages {
        gateway_config.max_queued_messages = capacity;
    }
    if let Some(charset) = args.charset {
        gateway_config.charset = charset;
    }
    let gateway_config = gateway_config.normalized();

    info!("Starting mqttgate");
    info!("  Bind address: {}", gateway_config.bind_addr);
    info!("  Accept threads: {}", gateway_config.accept_threads);
    info!("  I/O threads: {}", gateway_config.io_threads);
    info!("  Idle timeout: {:?}", gateway_config.idle_timeout);
    info!("  Max packet size: {} bytes", gateway_config.max_packet_size);
    info!("  Queue capacity: {}", gateway_config.max_queued_messages);
    info!("  Charset: {}", gateway_config.charset);

    let credentials = StaticCredentials::new(&file_config.auth);
    if credentials.is_enabled() {
        info!(
            "  Authentication: enabled ({} users configured)",
            credentials.user_count()
        );
    } else {
        info!("  Authentication: disabled");
    }

    let rt = runtime::build(gateway_config.io_threads)?;

    rt.block_on(async move {
        let mut gateway = Gateway::bind(gateway_config, EchoHandler).await?;
        if credentials.is_enabled() {
            gateway = gateway.with_verifier(credentials);
        }

        let handle = gateway.handle();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down");
                    handle.close();
                }
                Err(e) => error!("Cannot listen for Ctrl+C: {}", e),
            }
        });

        gateway.run().await
    })?;

    Ok(())
}
