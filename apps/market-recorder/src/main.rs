//! Market Recorder Binary
//!
//! Records one exchange/symbol pair's trades and binned order book into a
//! time-series store.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-recorder
//! ```
//!
//! # Environment Variables
//!
//! ## Required (with `RECORDER_STORAGE=influx`)
//! - `INFLUX_TOKEN`: InfluxDB API token
//!
//! ## Optional
//! - `RECORDER_EXCHANGE` / `RECORDER_SYMBOL`: Instrument (default: binance / BTCUSDT)
//! - `RECORDER_STORAGE`: influx | stdout (default: influx)
//! - `INFLUX_URL`, `INFLUX_ORG`, `INFLUX_BUCKET`: Store location
//! - `RECORDER_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `RECORDER_RUN_DURATION_SECS`: Stop after this many seconds (default: run forever)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter (default: market_recorder=info)

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_recorder::application::ports::StorageBackend;
use market_recorder::infrastructure::exchange::{BinanceConfig, BinanceSource};
use market_recorder::infrastructure::storage::{InfluxConfig, InfluxStorage, StdoutStorage};
use market_recorder::infrastructure::telemetry;
use market_recorder::{
    ConfigError, HealthServer, HealthServerState, RecorderConfig, StorageBackends, StorageKind,
    Supervisor, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (tracing + optional OTLP export)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Recorder");

    match run().await {
        Ok(true) => {
            tracing::info!("Market recorder stopped");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            tracing::warn!("Market recorder stopped with forced task terminations");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Market recorder failed to start");
            ExitCode::FAILURE
        }
    }
}

/// Start the pipeline and block until it has shut down.
///
/// Returns whether every task stopped on its own.
async fn run() -> anyhow::Result<bool> {
    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = RecorderConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let storage = build_storage(&config).context("failed to create storage client")?;
    let source = Arc::new(BinanceSource::new(BinanceConfig::from_settings(
        &config.source,
        &config.websocket,
    )));
    let supervisor_config = config
        .supervisor_config()
        .context("invalid pipeline configuration")?;

    let supervisor = Supervisor::new(supervisor_config, source, storage);
    let shutdown_token = CancellationToken::new();

    // Spawn health server
    let health_cancel = CancellationToken::new();
    if config.server.health_port > 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            supervisor.status(),
        ));
        let health_server =
            HealthServer::new(config.server.health_port, health_state, health_cancel.clone());
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    tokio::spawn(await_shutdown(shutdown_token.clone(), config.run_duration));

    tracing::info!(instrument = %config.instrument(), "Market recorder ready");

    let report = supervisor.run(shutdown_token).await;
    health_cancel.cancel();

    tracing::info!(
        restarts = report.restarts,
        forced = report.forced.len(),
        "Pipeline stopped"
    );
    for task in &report.forced {
        tracing::warn!(task = %task, "Task was force-terminated");
    }

    Ok(report.is_clean())
}

/// Build one storage client per record kind.
fn build_storage(config: &RecorderConfig) -> Result<StorageBackends, anyhow::Error> {
    match config.storage.kind {
        StorageKind::Stdout => Ok(StorageBackends::shared(Arc::new(StdoutStorage::new()))),
        StorageKind::Influx => {
            let token = config
                .storage
                .token
                .clone()
                .ok_or_else(|| ConfigError::MissingEnvVar("INFLUX_TOKEN".to_string()))?;
            let influx_config = InfluxConfig {
                url: config.storage.url.clone(),
                org: config.storage.org.clone(),
                bucket: config.storage.bucket.clone(),
                token,
                timeout: config.storage.timeout,
            };
            let client = || -> Result<Arc<dyn StorageBackend>, anyhow::Error> {
                Ok(Arc::new(InfluxStorage::new(influx_config.clone())?))
            };
            Ok(StorageBackends {
                trades: client()?,
                book_bins: client()?,
                gaps: client()?,
            })
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RecorderConfig) {
    tracing::info!(
        exchange = %config.exchange,
        symbol = %config.symbol,
        storage = config.storage.kind.as_str(),
        health_port = config.server.health_port,
        run_duration_secs = config.run_duration.map(|d| d.as_secs()),
        "Configuration loaded"
    );
    tracing::debug!(
        source_url = %config.source.url,
        storage_url = %config.storage.url,
        bucket = %config.storage.bucket,
        "Endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM, SIGINT or the configured run duration.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken, run_duration: Option<Duration>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match run_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = deadline => {
            tracing::info!("Run duration elapsed, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
