//! Edge Telemetry Agent Library
//!
//! This library provides the components of an edge-to-cloud telemetry agent:
//!
//! - **config**: Environment-based configuration for the agent
//! - **reading**: The reading type and its versioned JSON payload
//! - **source**: Hardware (IIO) and synthetic sensors behind one `sample`
//! - **durable_log**: Write-ahead JSON Lines log with retention ceiling
//! - **transport**: Publish boundary with HTTP and loopback implementations
//! - **publisher**: Ordered at-least-once delivery with retry and backoff
//! - **agent**: The sampling loop tying it all together
//! - **selftest**: Built-in smoke checks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use edge_telemetry_agent::agent::{Agent, AgentConfig};
//! use edge_telemetry_agent::config::Config;
//! use edge_telemetry_agent::durable_log::DurableLog;
//! use edge_telemetry_agent::publisher::PublisherConfig;
//! use edge_telemetry_agent::source::{ReadingSource, SyntheticSensor};
//! use edge_telemetry_agent::transport::HttpTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Open the durable log; undelivered readings from a previous run are kept
//!     let log = DurableLog::open(&config.log_path, config.retention.clone())
//!         .await
//!         .expect("Failed to open log");
//!
//!     let transport = HttpTransport::from_config(&config).expect("Failed to create transport");
//!     let source = ReadingSource::Synthetic(SyntheticSensor::with_seed(
//!         config.device_id.as_str(),
//!         config.sensor_id.as_str(),
//!         42,
//!     ));
//!
//!     let agent = Agent::new(
//!         AgentConfig::from_config(&config),
//!         source,
//!         Arc::new(log),
//!         Arc::new(transport),
//!         PublisherConfig::from_config(&config),
//!     );
//!     agent.run(CancellationToken::new()).await.ok();
//! }
//! ```

// Module declarations
pub mod agent;
pub mod config;
pub mod durable_log;
pub mod error;
pub mod health;
pub mod publisher;
pub mod reading;
pub mod selftest;
pub mod source;
pub mod state;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentConfig, AgentReport};
pub use config::{Config, ConfigError};
pub use durable_log::{
    CompactionReport, DurableLog, EntryState, Eviction, EvictionReason, LogEntry, LogError,
    RetentionPolicy,
};
pub use error::{AgentError, FailureKind};
pub use health::{Health, HealthSnapshot};
pub use publisher::{DeliveryAttempt, DeliveryEvent, Publisher, PublisherConfig};
pub use reading::{validate_payload, PayloadError, Reading, ReadingPayload, PAYLOAD_SCHEMA_VERSION};
pub use source::{IioSensor, ReadError, ReadingSource, SourceKind, SyntheticSensor};
pub use state::{AgentEvent, AgentState, StateTracker};
pub use transport::{
    Ack, Connectivity, HttpTransport, LoopbackTransport, OutboundMessage, QualityOfService,
    Transport, TransportError,
};
