use color_eyre::{eyre::eyre, Result};
use nodewatch::config::Config;
use nodewatch::mqtt::{ConnectionStatus, EnvTokenProvider, RumqttTransport};
use nodewatch::TelemetryService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = load_config().await?;
    info!(
        "Broker {} / namespace {}",
        config.broker.url, config.telemetry.namespace
    );

    let transport = RumqttTransport::from_config(&config.broker)
        .map_err(|e| eyre!("Invalid broker settings: {}", e))?;
    let tokens = EnvTokenProvider::new(config.identity.token_env.clone());
    let service = TelemetryService::new(&config, Arc::new(transport), Arc::new(tokens), None);

    let status_log = tokio::spawn(log_status(service.connection().status()));

    // A failed first connect is not retried by the manager; keep trying on the
    // reconnect interval until the broker is reachable
    loop {
        match service.start().await {
            Ok(()) => break,
            Err(e) => {
                error!("Initial connect failed: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted before connecting");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(config.broker.reconnect_interval()) => {}
                }
            }
        }
    }

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = summary.tick() => log_summary(&service),
        }
    }

    info!("Shutting down");
    service.stop().await;
    status_log.abort();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path))
            .await
            .map_err(|e| eyre!("Failed to load config: {}", e)),
        None => Config::ensure_default(&Config::default_path())
            .await
            .map_err(|e| eyre!("Failed to prepare default config: {}", e)),
    }
}

async fn log_status(mut status: watch::Receiver<ConnectionStatus>) {
    let mut shown = None;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        // Counter updates also wake us; only report transitions
        let key = (current.connection_state, current.last_error.clone());
        if shown.as_ref() == Some(&key) {
            continue;
        }
        match &current.last_error {
            Some(e) => info!("Broker status: {:?} ({})", current.connection_state, e),
            None => info!("Broker status: {:?}", current.connection_state),
        }
        shown = Some(key);
    }
}

fn log_summary(service: &TelemetryService) {
    let stats = service.ingest_stats();
    info!(
        "Ingest: {} accepted, {} rejected",
        stats.accepted, stats.rejected
    );

    let mut devices: Vec<String> = service.series().known_devices().into_iter().collect();
    devices.sort();
    for device in devices {
        if let Some(latest) = service.series().latest(&device) {
            info!(
                "{}: {} samples, latest {} {:?}",
                device,
                service.series().len(&device),
                latest.timestamp(),
                latest.metrics()
            );
        }
    }

    for report in service.updates().all() {
        info!(
            "{} firmware {} (active: {})",
            report.node_name, report.latest_version, report.active
        );
    }
}
