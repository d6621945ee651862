//! Built-in smoke checks, run with `--self-test`.
//!
//! Everything runs against a scratch directory and a loopback transport, so
//! the checks need neither a sensor nor a network.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{Agent, AgentConfig};
use crate::durable_log::{DurableLog, EntryState, LogError, RetentionPolicy};
use crate::error::AgentError;
use crate::health::Health;
use crate::publisher::{DrainOutcome, Publisher, PublisherConfig};
use crate::reading::validate_payload;
use crate::source::{ReadingSource, SyntheticSensor};
use crate::state::StateTracker;
use crate::transport::LoopbackTransport;

const SELF_TEST_DEVICE: &str = "self-test-node";
const SELF_TEST_SENSOR: &str = "dht22-0";
const SELF_TEST_TOPIC: &str = "telemetry/self-test-node";

/// Loose plausibility bounds for synthetic indoor readings.
const PLAUSIBLE_TEMPERATURE_C: std::ops::RangeInclusive<f64> = 10.0..=40.0;
const PLAUSIBLE_HUMIDITY: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// Upper bound on any single check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SelfTestError {
    #[error("self-test setup failed: {0}")]
    Setup(#[from] std::io::Error),

    #[error("self-test log error: {0}")]
    Log(#[from] LogError),

    #[error("self-test agent error: {0}")]
    Agent(#[from] AgentError),

    /// A check ran but its expectation did not hold
    #[error("{check}: {reason}")]
    Check { check: &'static str, reason: String },
}

fn fail(check: &'static str, reason: impl Into<String>) -> SelfTestError {
    SelfTestError::Check {
        check,
        reason: reason.into(),
    }
}

/// Run every check; stops at the first failure.
pub async fn run_self_test() -> Result<(), SelfTestError> {
    let scratch = tempfile::tempdir()?;

    check_buffered_readings(scratch.path()).await?;
    info!(check = "buffered_readings", "Self-test check passed");

    check_seed_determinism()?;
    info!(check = "seed_determinism", "Self-test check passed");

    check_outage_resync(scratch.path()).await?;
    info!(check = "outage_resync", "Self-test check passed");

    Ok(())
}

/// Five seeded readings are logged, validate, and are all delivered.
async fn check_buffered_readings(dir: &std::path::Path) -> Result<(), SelfTestError> {
    const CHECK: &str = "buffered_readings";

    let log = Arc::new(DurableLog::open(dir.join("out.jsonl"), RetentionPolicy::default()).await?);
    let mut source = SyntheticSensor::with_seed(SELF_TEST_DEVICE, SELF_TEST_SENSOR, 123);
    for _ in 0..5 {
        let reading = source.sample().map_err(|e| fail(CHECK, e.to_string()))?;
        log.append(reading).await?;
    }

    let contents = tokio::fs::read_to_string(log.path()).await?;
    let lines: Vec<&str> = contents.lines().collect();
    if lines.len() != 5 {
        return Err(fail(CHECK, format!("expected 5 lines, got {}", lines.len())));
    }
    for (i, line) in lines.iter().enumerate() {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| fail(CHECK, format!("line {} is not JSON: {}", i, e)))?;
        check_payload(&value).map_err(|reason| fail(CHECK, format!("line {}: {}", i, reason)))?;
        if value["state"] != "pending" {
            return Err(fail(CHECK, format!("line {} is not pending", i)));
        }
    }

    let transport = Arc::new(LoopbackTransport::new());
    let publisher = Publisher::new(
        log.clone(),
        transport.clone(),
        Arc::new(Health::new()),
        Arc::new(StateTracker::new()),
        PublisherConfig::new(SELF_TEST_TOPIC),
    );
    let outcome = tokio::time::timeout(CHECK_TIMEOUT, publisher.drain_once(&CancellationToken::new()))
        .await
        .map_err(|_| fail(CHECK, "drain timed out"))??;
    if outcome != DrainOutcome::Idle {
        return Err(fail(CHECK, format!("drain ended with {:?}", outcome)));
    }

    let published = transport.published();
    if published.len() != 5 {
        return Err(fail(CHECK, format!("expected 5 publishes, got {}", published.len())));
    }
    for message in &published {
        let value = message
            .json()
            .map_err(|e| fail(CHECK, format!("payload is not JSON: {}", e)))?;
        check_payload(&value).map_err(|reason| fail(CHECK, reason))?;
    }

    let entries = log.entries().await;
    if entries.iter().any(|e| e.state != EntryState::Acknowledged) {
        return Err(fail(CHECK, "not every entry was acknowledged"));
    }

    Ok(())
}

/// Two sources with the same seed produce the same values.
fn check_seed_determinism() -> Result<(), SelfTestError> {
    let mut a = SyntheticSensor::with_seed("seeded", SELF_TEST_SENSOR, 42);
    let mut b = SyntheticSensor::with_seed("seeded", SELF_TEST_SENSOR, 42);

    for i in 0..10 {
        let (va, vb) = (a.next_values(), b.next_values());
        if va != vb {
            return Err(fail(
                "seed_determinism",
                format!("sample {} differs: {:?} vs {:?}", i, va, vb),
            ));
        }
    }
    Ok(())
}

/// Readings taken during an outage are delivered in order after recovery.
async fn check_outage_resync(dir: &std::path::Path) -> Result<(), SelfTestError> {
    const CHECK: &str = "outage_resync";

    let log = Arc::new(DurableLog::open(dir.join("outage.jsonl"), RetentionPolicy::default()).await?);
    let transport = Arc::new(LoopbackTransport::new());
    transport.set_connected(false);

    let agent = Agent::new(
        AgentConfig {
            sample_interval: Duration::from_millis(10),
            sample_count: 3,
            ..AgentConfig::default()
        },
        ReadingSource::Synthetic(SyntheticSensor::with_seed(SELF_TEST_DEVICE, SELF_TEST_SENSOR, 7)),
        log,
        transport.clone(),
        PublisherConfig::new(SELF_TEST_TOPIC)
            .with_backoff(Duration::from_millis(50), Duration::from_millis(200)),
    );
    let mut deliveries = agent.publisher().subscribe_deliveries();
    let health = agent.health();

    let link = transport.clone();
    let reconnect = tokio::spawn(async move {
        while health.snapshot().samples_taken < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        link.set_connected(true);
    });

    let report = tokio::time::timeout(CHECK_TIMEOUT, agent.run(CancellationToken::new()))
        .await
        .map_err(|_| fail(CHECK, "agent did not finish"))??;
    reconnect.abort();

    if report.undelivered != 0 {
        return Err(fail(CHECK, format!("{} readings left undelivered", report.undelivered)));
    }

    let mut order = Vec::new();
    while let Ok(event) = deliveries.try_recv() {
        order.push(event.sequence);
    }
    if order != [1, 2, 3] {
        return Err(fail(CHECK, format!("delivery order was {:?}", order)));
    }
    Ok(())
}

/// Schema validation plus plausibility ranges.
fn check_payload(value: &Value) -> Result<(), String> {
    validate_payload(value).map_err(|e| e.to_string())?;

    let temperature = value["temperature_C"].as_f64().unwrap_or(f64::NAN);
    let humidity = value["humidity"].as_f64().unwrap_or(f64::NAN);
    if !PLAUSIBLE_TEMPERATURE_C.contains(&temperature) {
        return Err(format!("implausible temperature {}", temperature));
    }
    if !PLAUSIBLE_HUMIDITY.contains(&humidity) {
        return Err(format!("implausible humidity {}", humidity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_self_test_passes() {
        run_self_test().await.unwrap();
    }

    #[test]
    fn test_check_payload_rejects_implausible_values() {
        let value = serde_json::json!({
            "timestamp": "2025-08-06T22:11:03Z",
            "timestamp_ms": "2025-08-06T22:11:03.123Z",
            "temperature_C": 90.0,
            "humidity": 50.0,
            "device_id": "edge-node-001",
            "sensor_id": "dht22-0",
        });
        let err = check_payload(&value).unwrap_err();
        assert!(err.contains("implausible temperature"));
    }

    #[test]
    fn test_failure_display() {
        let err = fail("outage_resync", "delivery order was [2, 1]");
        assert_eq!(err.to_string(), "outage_resync: delivery order was [2, 1]");
    }
}
