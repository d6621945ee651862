//! Publisher: drains the durable log to the transport.
//!
//! Delivery is at-least-once with one publish in flight at a time, so
//! entries reach the transport in sequence order, retries included. Each
//! entry goes `pending -> inflight`, is published with a per-attempt
//! timeout, and is then either acknowledged or reverted to `pending` and
//! retried after an exponential backoff with jitter.
//!
//! A connectivity loss suspends the whole drain until the transport reports
//! the link back up or the retry time arrives, whichever is first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::durable_log::{DurableLog, LogError};
use crate::error::FailureKind;
use crate::health::Health;
use crate::state::{AgentEvent, StateTracker};
use crate::transport::{
    is_transient_status, Connectivity, OutboundMessage, QualityOfService, Transport,
    TransportError,
};

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default maximum delay between retries.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default timeout for one publish attempt.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the delivery event channel.
const DELIVERY_CHANNEL_CAPACITY: usize = 256;

/// Settings for a [`Publisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    pub qos: QualityOfService,

    /// Timeout for one publish attempt
    pub publish_timeout: Duration,

    /// Backoff base delay
    pub base_delay: Duration,

    /// Backoff cap
    pub max_delay: Duration,
}

impl PublisherConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: QualityOfService::AtLeastOnce,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            topic: config.topic.clone(),
            qos: QualityOfService::AtLeastOnce,
            publish_timeout: config.publish_timeout,
            base_delay: config.retry_base,
            max_delay: config.retry_max,
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Retry bookkeeping for the entry at the head of the log.
///
/// Not persisted; after a restart it is rebuilt from the first failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub sequence: u64,
    pub attempt_count: u32,
    pub next_retry_at: Option<Instant>,
}

/// Emitted once per acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub sequence: u64,

    /// Attempts it took, including the successful one
    pub attempts: u32,

    pub message_id: Option<String>,
}

/// Result of one pass over the pending entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing left to attempt right now
    Idle,

    /// An attempt failed; wait `delay` before the next one
    Backoff {
        delay: Duration,
        connectivity_lost: bool,
    },

    /// Cancellation was observed between attempts
    Stopped,
}

/// Delivers durable log entries to a [`Transport`].
pub struct Publisher {
    log: Arc<DurableLog>,
    transport: Arc<dyn Transport>,
    health: Arc<Health>,
    state: Arc<StateTracker>,
    config: PublisherConfig,
    wake: Notify,
    deliveries: broadcast::Sender<DeliveryEvent>,
    attempt: Mutex<Option<DeliveryAttempt>>,
}

impl Publisher {
    pub fn new(
        log: Arc<DurableLog>,
        transport: Arc<dyn Transport>,
        health: Arc<Health>,
        state: Arc<StateTracker>,
        config: PublisherConfig,
    ) -> Self {
        let (deliveries, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);

        Self {
            log,
            transport,
            health,
            state,
            config,
            wake: Notify::new(),
            deliveries,
            attempt: Mutex::new(None),
        }
    }

    /// Ask the drain loop to look for new entries.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.deliveries.subscribe()
    }

    /// Retry state of the entry currently being delivered, if any.
    pub async fn current_attempt(&self) -> Option<DeliveryAttempt> {
        self.attempt.lock().await.clone()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Backoff delay before retry number `attempt` (zero-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.config.base_delay, self.config.max_delay)
    }

    /// Publish pending entries in order until the log is drained, an attempt
    /// fails, or `cancel` fires.
    ///
    /// A publish that has started is never abandoned because of
    /// cancellation; it completes or times out first.
    pub async fn drain_once(&self, cancel: &CancellationToken) -> Result<DrainOutcome, LogError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(DrainOutcome::Stopped);
            }

            let Some(entry) = self.log.next_pending().await else {
                return Ok(DrainOutcome::Idle);
            };
            let sequence = entry.sequence;
            let payload = entry.reading.to_json_bytes()?;

            match self.log.mark_inflight(sequence).await {
                Ok(()) => {}
                // evicted between lookup and claim
                Err(LogError::UnknownSequence(_)) => continue,
                Err(e) => return Err(e),
            }

            let attempts = self.begin_attempt(sequence).await;
            debug!(sequence, attempt = attempts, topic = %self.config.topic, "Publishing entry");

            let message = OutboundMessage {
                topic: &self.config.topic,
                payload: &payload,
                qos: self.config.qos,
            };
            let result =
                match tokio::time::timeout(self.config.publish_timeout, self.transport.publish(message))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                };

            match result {
                Ok(ack) => {
                    if let Err(e) = self.log.mark_acknowledged(sequence).await {
                        // keep the entry deliverable; it will be sent again
                        let _ = self.log.revert_to_pending(sequence).await;
                        return Err(e);
                    }
                    *self.attempt.lock().await = None;
                    self.health.record_delivery();
                    debug!(sequence, attempts, "Entry delivered");

                    // No subscribers is fine
                    let _ = self.deliveries.send(DeliveryEvent {
                        sequence,
                        attempts,
                        message_id: ack.message_id,
                    });
                }
                Err(e) => {
                    self.log.revert_to_pending(sequence).await?;
                    self.health.record_failure(e.kind());

                    let delay = self.backoff_delay(attempts.saturating_sub(1));
                    if let Some(attempt) = self.attempt.lock().await.as_mut() {
                        attempt.next_retry_at = Some(Instant::now() + delay);
                    }

                    match &e {
                        TransportError::Rejected { status, .. } if !is_transient_status(*status) => {
                            error!(
                                sequence,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Publish rejected, will retry"
                            );
                        }
                        _ => {
                            warn!(
                                sequence,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Publish failed, will retry"
                            );
                        }
                    }

                    return Ok(DrainOutcome::Backoff {
                        delay,
                        connectivity_lost: e.is_connectivity_loss(),
                    });
                }
            }
        }
    }

    /// Run the drain loop until `cancel` fires.
    ///
    /// While the transport reports the link down, pending entries are left
    /// untouched until it reconnects or a retry falls due; only a due retry
    /// tries the link with a real publish. Log errors are reported and
    /// retried after the base delay; the loop only ends on cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut connectivity = self.transport.connectivity();
        let mut retry_due = false;
        info!(topic = %self.config.topic, "Publisher started");

        loop {
            let outcome = if !retry_due && self.backlog_behind_outage(&connectivity).await {
                self.health.record_failure(FailureKind::ConnectivityLoss);
                DrainOutcome::Backoff {
                    delay: self.config.base_delay,
                    connectivity_lost: true,
                }
            } else {
                match self.drain_once(&cancel).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(error = %e, "Durable log error while draining");
                        DrainOutcome::Backoff {
                            delay: self.config.base_delay,
                            connectivity_lost: false,
                        }
                    }
                }
            };
            retry_due = false;

            match outcome {
                DrainOutcome::Stopped => break,
                DrainOutcome::Idle => {
                    self.state.fire(AgentEvent::Drained);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {
                            self.state.fire(AgentEvent::Backlog);
                        }
                    }
                }
                DrainOutcome::Backoff {
                    delay,
                    connectivity_lost,
                } => {
                    let sleep = tokio::time::sleep(delay);

                    if connectivity_lost {
                        self.state.fire(AgentEvent::ConnectivityLost);
                        let disconnected = !connectivity.borrow_and_update().is_connected();
                        info!(retry_in_ms = delay.as_millis() as u64, "Connectivity lost, suspending drain");

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep => retry_due = true,
                            _ = wait_until_connected(&mut connectivity), if disconnected => {
                                info!("Connectivity restored, resuming drain");
                            }
                        }
                    } else {
                        self.state.fire(AgentEvent::PublishFailed);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep => retry_due = true,
                        }
                    }

                    self.state.fire(AgentEvent::RetryDue);
                }
            }
        }

        info!("Publisher stopped");
    }

    /// Whether entries are waiting while the transport reports the link down.
    async fn backlog_behind_outage(&self, connectivity: &watch::Receiver<Connectivity>) -> bool {
        let link_down = !connectivity.borrow().is_connected();
        link_down && self.log.next_pending().await.is_some()
    }

    /// Count an attempt for `sequence`, starting fresh if it is a new head.
    async fn begin_attempt(&self, sequence: u64) -> u32 {
        let mut attempt = self.attempt.lock().await;
        match attempt.as_mut() {
            Some(current) if current.sequence == sequence => {
                current.attempt_count += 1;
                current.next_retry_at = None;
                current.attempt_count
            }
            _ => {
                *attempt = Some(DeliveryAttempt {
                    sequence,
                    attempt_count: 1,
                    next_retry_at: None,
                });
                1
            }
        }
    }
}

/// Calculate the backoff delay for a given retry attempt.
///
/// Uses exponential backoff with jitter:
/// delay = min(base_delay * 2^attempt + jitter, max_delay)
pub fn backoff_delay(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let base_delay = base_delay.as_millis() as u64;
    let max_delay = max_delay.as_millis() as u64;

    // Calculate exponential delay: base * 2^attempt
    let exponential_delay = base_delay.saturating_mul(1 << attempt.min(20));

    // Add jitter (up to 25% of the delay)
    let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

    let total_delay = exponential_delay.saturating_add(jitter).min(max_delay);

    Duration::from_millis(total_delay)
}

/// Resolve once the receiver observes `Connected`.
///
/// Never resolves if the transport drops its sender.
async fn wait_until_connected(rx: &mut watch::Receiver<Connectivity>) {
    loop {
        if rx.borrow_and_update().is_connected() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
