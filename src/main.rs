//! Telemetry Batcher - demo service for the event batching pipeline
//!
//! This binary simulates an application logging analytics events, batches
//! them through the manager and delivers them to an HTTP endpoint.
//!
//! ## Features
//!
//! - Count-based and staleness-based flush triggers
//! - Failed batches re-enqueued and retried on the next trigger
//! - Periodic policy check so stale events go out without new traffic
//! - Final force flush on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `TELEMETRY_BATCHER_ENDPOINT`: batch ingestion URL
//! - `TELEMETRY_BATCHER_BATCH_SIZE`: events per batch (default: 50)
//! - `TELEMETRY_BATCHER_FLUSH_COUNT`: queued events that trigger a flush (default: 10)
//! - `TELEMETRY_BATCHER_STALENESS_SECS`: max age of the oldest event (default: 300)
//! - `TELEMETRY_BATCHER_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
//! - `TELEMETRY_BATCHER_MAX_RETRIES`: retries inside one send (default: 2)
//! - `TELEMETRY_BATCHER_CHECK_INTERVAL_SECS`: periodic policy check (default: 30)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_batcher::config::Config;
use telemetry_batcher::event::{AppLaunchEvent, StaticAttributes};
use telemetry_batcher::event_generator::EventGenerator;
use telemetry_batcher::http::HttpTransport;
use telemetry_batcher::manager::AnalyticsManager;
use telemetry_batcher::trigger::{
    spawn_periodic_check, spawn_signal_listener, ForceFlushTrigger, LifecycleSignal,
};
use telemetry_batcher::Attributes;

/// Interval between simulated user interactions in milliseconds
const DEFAULT_GENERATION_INTERVAL_MS: u64 = 250;

/// Channel capacity for lifecycle signals
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting telemetry batcher demo...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.endpoint,
                batch_size = config.batch_size,
                flush_count = config.flush_count,
                staleness_secs = config.staleness.as_secs(),
                max_retries = config.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let manager = match build_manager(&config) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!(error = %e, "Failed to build analytics manager");
            std::process::exit(1);
        }
    };

    let provider = StaticAttributes::default()
        .with("os", std::env::consts::OS)
        .with("arch", std::env::consts::ARCH)
        .with("app_version", env!("CARGO_PKG_VERSION"));
    manager
        .log(AppLaunchEvent::new(&provider, Attributes::new()))
        .await;

    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let listener_handle = spawn_signal_listener(ForceFlushTrigger::new(manager.clone()), signal_rx);
    let check_handle = spawn_periodic_check(manager.clone(), config.check_interval);

    let generator_manager = manager.clone();
    let generator_handle = tokio::spawn(async move {
        info!("Generator task started");
        run_generator(EventGenerator::with_defaults(), generator_manager).await;
    });

    info!("Telemetry batcher running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    generator_handle.abort();
    check_handle.abort();

    if signal_tx.send(LifecycleSignal::Terminate).await.is_err() {
        warn!("Signal listener already stopped");
    }
    drop(signal_tx);

    let shutdown_timeout = Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, listener_handle).await {
        Ok(Ok(())) => info!("Remaining events flushed"),
        Ok(Err(e)) => warn!(error = %e, "Signal listener panicked during shutdown"),
        Err(_) => warn!("Final flush timed out after {:?}", shutdown_timeout),
    }

    let stats = manager.stats();
    info!(
        events_logged = stats.events_logged,
        events_sent = stats.events_sent,
        send_failures = stats.send_failures,
        unencodable = stats.events_unencodable,
        pending = manager.pending_count(),
        "Telemetry batcher stopped"
    );
}

fn build_manager(config: &Config) -> Result<AnalyticsManager, Box<dyn std::error::Error>> {
    let transport = HttpTransport::new(config)?;
    let manager = AnalyticsManager::builder(Arc::new(transport))
        .policy(config.flush_policy()?)
        .build()?;
    Ok(manager)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Log simulated user interactions at a fixed pace until aborted.
async fn run_generator(generator: EventGenerator, manager: Arc<AnalyticsManager>) {
    let mut ticker = interval(Duration::from_millis(DEFAULT_GENERATION_INTERVAL_MS));

    loop {
        ticker.tick().await;

        match generator.generate() {
            Ok(event) => manager.log_detached(event),
            Err(e) => warn!(error = %e, "Skipping generated event"),
        }
    }
}
