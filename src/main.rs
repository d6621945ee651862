//! Edge Telemetry Agent - temperature/humidity telemetry for edge-to-cloud pipelines
//!
//! This service samples a sensor at a fixed cadence, writes every reading to
//! a local write-ahead log, and publishes the log to the cloud with
//! at-least-once delivery.
//!
//! ## Features
//!
//! - Hardware (Linux IIO) or seeded synthetic sensor
//! - Crash-tolerant JSON Lines log with bounded retention
//! - Ordered publishing with retry, backoff and reconnect handling
//! - Graceful shutdown on SIGINT
//! - Built-in self-test (`--self-test`)
//!
//! ## Configuration
//!
//! Configuration is loaded from `EDGE_AGENT_*` environment variables (see
//! `Config`). `RUST_LOG` sets the logging level filter (default: info).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_telemetry_agent::agent::{Agent, AgentConfig};
use edge_telemetry_agent::config::{Config, ConfigError};
use edge_telemetry_agent::durable_log::DurableLog;
use edge_telemetry_agent::error::AgentError;
use edge_telemetry_agent::publisher::PublisherConfig;
use edge_telemetry_agent::selftest::run_self_test;
use edge_telemetry_agent::source::{
    IioSensor, ReadingSource, SourceKind, SyntheticConfig, SyntheticSensor,
};
use edge_telemetry_agent::transport::HttpTransport;

/// How long shutdown may take once the agent has been told to stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Edge Telemetry Agent...");

    // The self-test needs no configuration, so decide on it first
    match self_test_requested(std::env::args().skip(1), |key| std::env::var(key).ok()) {
        Ok(true) => {
            return match run_self_test().await {
                Ok(()) => {
                    info!("Self-tests passed.");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Self-test failed");
                    ExitCode::FAILURE
                }
            };
        }
        Ok(false) => {}
        Err(e) => {
            report_failure(&AgentError::from(e));
            return ExitCode::FAILURE;
        }
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AgentError> {
    // Load configuration from environment
    let config = Config::from_env()?;
    info!(
        device_id = %config.device_id,
        sensor_id = %config.sensor_id,
        source = %config.source,
        interval_ms = config.sample_interval.as_millis() as u64,
        sample_count = config.sample_count,
        log_path = %config.log_path.display(),
        endpoint = %config.endpoint,
        topic = %config.topic,
        "Configuration loaded"
    );

    let log = DurableLog::open(&config.log_path, config.retention.clone()).await?;

    // Create HTTP transport with connection pooling
    let transport = HttpTransport::from_config(&config)?;
    info!(endpoint = %transport.endpoint(), "HTTP transport initialized");

    let source = build_source(&config);
    let agent = Agent::new(
        AgentConfig::from_config(&config),
        source,
        Arc::new(log),
        Arc::new(transport),
        PublisherConfig::from_config(&config),
    );

    let cancel = CancellationToken::new();
    let mut agent_handle = tokio::spawn(agent.run(cancel.clone()));

    info!("Edge Telemetry Agent running. Press Ctrl+C to stop.");
    let finished = tokio::select! {
        result = &mut agent_handle => Some(result),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            // Graceful shutdown
            info!("Initiating graceful shutdown...");
            cancel.cancel();

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut agent_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Agent shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
                    agent_handle.abort();
                    return Err(AgentError::Task("shutdown timed out".to_string()));
                }
            }
        }
    };

    let report = result.map_err(|e| AgentError::Task(e.to_string()))??;
    info!(
        samples_taken = report.samples_taken,
        undelivered = report.undelivered,
        "Edge Telemetry Agent stopped"
    );
    Ok(())
}

/// Whether the self-test was asked for on the command line or in the environment.
fn self_test_requested<I, F>(mut args: I, lookup: F) -> Result<bool, ConfigError>
where
    I: Iterator<Item = String>,
    F: Fn(&str) -> Option<String>,
{
    if args.any(|arg| arg == "--self-test") {
        return Ok(true);
    }
    Config::self_test_requested(lookup)
}

/// Headline for an error that stopped the agent.
fn failure_message(err: &AgentError) -> &'static str {
    if err.kind().is_some_and(|kind| kind.is_fatal()) {
        "Fatal error, agent cannot start"
    } else {
        "Edge Telemetry Agent failed"
    }
}

fn report_failure(err: &AgentError) {
    match err.kind() {
        Some(kind) => error!(failure_kind = %kind, error = %err, "{}", failure_message(err)),
        None => error!(error = %err, "{}", failure_message(err)),
    }
}

/// Build the configured reading source.
fn build_source(config: &Config) -> ReadingSource {
    match config.source {
        SourceKind::Hardware => ReadingSource::Hardware(IioSensor::new(
            config.device_id.as_str(),
            config.sensor_id.as_str(),
            config.iio_device.clone(),
        )),
        SourceKind::Synthetic => ReadingSource::Synthetic(SyntheticSensor::new(
            config.device_id.as_str(),
            config.sensor_id.as_str(),
            config.seed,
            SyntheticConfig::default(),
        )),
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
