//! Transport boundary for publishing readings.
//!
//! A [`Transport`] publishes one message and resolves once the far side has
//! acknowledged it (or the attempt failed). It also exposes a connectivity
//! signal so the publisher can park while the link is down.
//!
//! Two implementations are provided:
//!
//! - [`HttpTransport`]: HTTPS publish to a broker endpoint
//!   (`POST {endpoint}/topics/{topic}?qos=1`), using reqwest's pooled client
//! - [`LoopbackTransport`]: in-process transport with switchable
//!   connectivity and fault injection, used by the self-test and tests
//!
//! The transport never rewrites topics; bridge or direct-to-cloud
//! deployments differ only in the endpoint and topic they are configured with.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FailureKind;
use crate::reading::PAYLOAD_SCHEMA_VERSION;

/// Header carrying the payload schema version.
pub const SCHEMA_VERSION_HEADER: &str = "x-payload-schema-version";

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
}

impl QualityOfService {
    /// Numeric level as used by pub/sub brokers.
    pub fn level(&self) -> u8 {
        match self {
            QualityOfService::AtMostOnce => 0,
            QualityOfService::AtLeastOnce => 1,
        }
    }
}

/// Link state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
}

impl Connectivity {
    pub fn is_connected(&self) -> bool {
        matches!(self, Connectivity::Connected)
    }
}

/// A message handed to [`Transport::publish`].
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QualityOfService,
}

/// Acknowledgement returned by the far side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Broker-assigned identifier, when the broker returns one
    pub message_id: Option<String>,
}

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link is down (connection refused, DNS failure, broker offline)
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// No acknowledgement within the per-attempt timeout
    #[error("publish timed out")]
    Timeout,

    /// The broker answered but did not accept the message
    #[error("publish rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The broker's answer could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport could not be built
    #[error("transport configuration error: {0}")]
    Config(String),
}

impl TransportError {
    pub fn is_connectivity_loss(&self) -> bool {
        matches!(self, TransportError::Disconnected(_))
    }

    pub fn kind(&self) -> FailureKind {
        if self.is_connectivity_loss() {
            FailureKind::ConnectivityLoss
        } else {
            FailureKind::TransportFailure
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Disconnected(err.to_string())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }
}

/// A publish/subscribe client with acknowledgement tracking.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish one message; resolves once acknowledged or failed.
    async fn publish(&self, message: OutboundMessage<'_>) -> Result<Ack, TransportError>;

    /// Connectivity signal; changes when the link goes up or down.
    fn connectivity(&self) -> watch::Receiver<Connectivity>;
}

/// Body returned by the broker's HTTP publish endpoint.
#[derive(Debug, Clone, Deserialize)]
struct PublishResponse {
    #[serde(default)]
    message: Option<String>,

    #[serde(default, rename = "traceId")]
    trace_id: Option<String>,
}

/// HTTPS publish transport.
///
/// The client is reused across publishes for connection pooling. Connection
/// failures mark the link `Disconnected`; any HTTP answer marks it
/// `Connected` again.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    timeout: Duration,
    connectivity: watch::Sender<Connectivity>,
}

impl HttpTransport {
    /// Create a transport publishing to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the endpoint is not a valid base
    /// URL or the HTTP client cannot be built.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| TransportError::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(TransportError::Config(format!(
                "endpoint '{}' cannot carry a path",
                endpoint
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        let (connectivity, _) = watch::channel(Connectivity::Connected);

        Ok(Self {
            client,
            endpoint,
            timeout,
            connectivity,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        Self::new(&config.endpoint, config.publish_timeout)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// URL for publishing to `topic`: `{endpoint}/topics/{topic}?qos={level}`.
    fn publish_url(&self, topic: &str, qos: QualityOfService) -> Result<Url, TransportError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::Config("endpoint cannot carry a path".to_string()))?;
            segments.pop_if_empty().push("topics");
            for part in topic.split('/') {
                segments.push(part);
            }
        }
        url.query_pairs_mut()
            .append_pair("qos", &qos.level().to_string());
        Ok(url)
    }

    fn set_connectivity(&self, state: Connectivity) {
        let changed = self.connectivity.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            match state {
                Connectivity::Connected => info!(endpoint = %self.endpoint, "Transport connected"),
                Connectivity::Disconnected => {
                    warn!(endpoint = %self.endpoint, "Transport disconnected")
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(&self, message: OutboundMessage<'_>) -> Result<Ack, TransportError> {
        let url = self.publish_url(message.topic, message.qos)?;
        debug!(url = %url, bytes = message.payload.len(), "Publishing");

        let response = match self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(SCHEMA_VERSION_HEADER, PAYLOAD_SCHEMA_VERSION)
            .body(message.payload.to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let err = TransportError::from(e);
                if err.is_connectivity_loss() {
                    self.set_connectivity(Connectivity::Disconnected);
                }
                return Err(err);
            }
        };

        self.set_connectivity(Connectivity::Connected);
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            // Any 2xx is the ack; the body only carries an optional trace id
            if body.trim().is_empty() {
                return Ok(Ack::default());
            }
            match serde_json::from_str::<PublishResponse>(&body) {
                Ok(parsed) => {
                    debug!(message = ?parsed.message, "Publish acknowledged");
                    Ok(Ack {
                        message_id: parsed.trace_id,
                    })
                }
                Err(e) => {
                    warn!(
                        status = status.as_u16(),
                        error = %e,
                        "Publish acknowledged with unrecognized body"
                    );
                    Ok(Ack::default())
                }
            }
        } else {
            Err(TransportError::Rejected {
                status: status.as_u16(),
                message: if body.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown status")
                        .to_string()
                } else {
                    body
                },
            })
        }
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }
}

/// A message recorded by [`LoopbackTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
}

impl PublishedMessage {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    published: Vec<PublishedMessage>,
    attempts: u64,
    fail_next: usize,
    latency: Duration,
}

/// In-process transport that records what it is given.
///
/// Connectivity can be switched off to simulate an outage, and individual
/// attempts can be made to time out.
#[derive(Debug)]
pub struct LoopbackTransport {
    connectivity: watch::Sender<Connectivity>,
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (connectivity, _) = watch::channel(Connectivity::Connected);
        Self {
            connectivity,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Bring the simulated link up or down.
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        };
        self.connectivity.send_replace(state);
    }

    /// Make the next `count` attempts fail with a timeout.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Delay every publish by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Messages accepted so far, in acknowledgement order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Publish attempts seen, successful or not.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn publish(&self, message: OutboundMessage<'_>) -> Result<Ack, TransportError> {
        let latency = {
            let mut state = self.lock();
            state.attempts += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.connectivity.borrow().is_connected() {
            return Err(TransportError::Disconnected("loopback link is down".to_string()));
        }

        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Timeout);
        }

        state.published.push(PublishedMessage {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos,
        });

        Ok(Ack {
            message_id: Some(format!("loopback-{}", state.published.len())),
        })
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }
}

/// Whether a broker status code is worth retrying soon.
///
/// Rejections are still retried (the entry is never discarded); this only
/// decides whether the failure is logged as expected or as suspicious.
pub fn is_transient_status(status: u16) -> bool {
    StatusCode::from_u16(status)
        .map(|code| code.is_server_error() || code == StatusCode::TOO_MANY_REQUESTS)
        .unwrap_or(false)
}
