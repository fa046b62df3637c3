#![deny(unused_must_use)]
mod config;
mod fake;
mod handlers;
mod identity;
mod net;
mod parsers;
mod progress;
mod registry;
mod runner;
mod safety;
mod session;
mod status;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use handlers::HandlerContext;
use registry::JobRegistry;
use session::{SessionConfig, SessionContext};
use status::StatusManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install default rustls crypto provider");

    // Load configuration
    let config = config::Config::load_or_default();

    // Initialize logging with configured level/filter
    if let Some(ref filter_directive) = config.logging.filter {
        use tracing_subscriber::EnvFilter;
        match EnvFilter::try_new(filter_directive) {
            Ok(env_filter) => {
                tracing_subscriber::fmt().with_env_filter(env_filter).init();
            }
            Err(e) => {
                eprintln!(
                    "Warning: Invalid filter directive '{}': {}. Using default.",
                    filter_directive, e
                );
                tracing_subscriber::fmt()
                    .with_max_level(tracing::Level::INFO)
                    .init();
            }
        }
    } else {
        let level = match config.logging.level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        };
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    tracing::info!("Starting netpulse probe v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration loaded:");
    tracing::info!("  Coordinator: {}{}", config.api.host, config.api.ws_path);
    tracing::info!("  Command timeout: {}s", config.commands.timeout_secs);
    tracing::info!(
        "  Reconnect backoff: {}-{}ms",
        config.reconnect.backoff_min_ms,
        config.reconnect.backoff_max_ms
    );
    if fake::fake_commands_enabled() {
        tracing::warn!("FAKE_COMMANDS is set: diagnostic tools are stubbed");
    }

    let uuid = identity::load_or_create_uuid(Path::new(&config.uuid.path));
    tracing::info!("  Probe UUID: {}", uuid);

    let command_timeout = Duration::from_secs(config.commands.timeout_secs);
    let (tx, outbound_rx) = mpsc::unbounded_channel();

    let registry = Arc::new(JobRegistry::new());
    let status = Arc::new(StatusManager::new(tx.clone()));
    let ctx = Arc::new(SessionContext {
        registry: Arc::clone(&registry),
        status: Arc::clone(&status),
        handler: HandlerContext {
            tx: tx.clone(),
            command_timeout,
        },
    });

    let _sweeper = Arc::clone(&registry).spawn_sweeper();
    let _scheduler = Arc::clone(&status).spawn_scheduler(command_timeout);

    let session_config = SessionConfig {
        api_host: config.api.host.clone(),
        ws_path: config.api.ws_path.clone(),
        uuid,
        backoff_min: Duration::from_millis(config.reconnect.backoff_min_ms),
        backoff_max: Duration::from_millis(config.reconnect.backoff_max_ms),
    };
    let _session = tokio::spawn(session::run_session(
        session_config,
        Arc::clone(&ctx),
        outbound_rx,
    ));

    // SIGTERM starts the drain; running measurements finish, new ones are
    // refused, and the process exits once the registry empties (or the
    // drain deadline forces the issue).
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        _ = sigint.recv() => tracing::info!("SIGINT received"),
    }

    status.set_sigterm();
    let in_flight = registry.len();
    if in_flight > 0 {
        tracing::info!("Draining {} in-flight measurements", in_flight);
    }
    if registry.drain().await {
        tracing::info!("Drained cleanly, exiting");
    } else {
        tracing::warn!(
            "Drain timed out with {} measurements still running, forcing exit",
            registry.len()
        );
    }
    Ok(())
}
