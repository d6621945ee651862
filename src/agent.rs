//! Agent loop: sampler, durable log and publisher wired together.
//!
//! A single cadence timer drives sampling. Each reading is appended to the
//! durable log before any network attempt, then the publisher (its own task)
//! is woken to drain. A stalled publish never delays a sampling tick.
//!
//! On shutdown the sampler stops, the publisher finishes or times out its
//! in-flight publish, any `inflight` entry goes back to `pending`, and the
//! log is compacted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::durable_log::{DurableLog, Eviction};
use crate::error::AgentError;
use crate::health::{Health, HealthSnapshot};
use crate::publisher::{backoff_delay, Publisher, PublisherConfig};
use crate::source::ReadingSource;
use crate::state::{AgentEvent, StateTracker};
use crate::transport::Transport;

/// How often the backlog is re-checked while waiting for it to drain.
const BACKLOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Settings for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Time between sampling ticks; zero samples as fast as possible
    pub sample_interval: Duration,

    /// Readings to take before stopping; 0 runs until cancelled
    pub sample_count: u64,

    /// Sample timeout; `None` uses the source's default
    pub sensor_timeout: Option<Duration>,

    /// First pause after the sensor stops responding
    pub unavailable_backoff: Duration,

    /// Longest pause while the sensor keeps not responding
    pub unavailable_backoff_max: Duration,

    /// How often the log is compacted and health is reported
    pub maintenance_interval: Duration,

    /// Log each buffered reading at info level
    pub echo_readings: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            sample_count: 0,
            sensor_timeout: None,
            unavailable_backoff: Duration::from_secs(1),
            unavailable_backoff_max: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(60),
            echo_readings: false,
        }
    }
}

impl AgentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_interval: config.sample_interval,
            sample_count: config.sample_count,
            sensor_timeout: config.sensor_timeout,
            echo_readings: config.echo_readings,
            ..Self::default()
        }
    }
}

/// Summary returned when the agent stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReport {
    /// Readings appended during this run
    pub samples_taken: u64,

    /// Entries still awaiting delivery (kept in the log for the next run)
    pub undelivered: usize,

    /// Entries moved from `inflight` back to `pending` at shutdown
    pub reverted: usize,

    pub health: HealthSnapshot,
}

/// The edge telemetry agent.
pub struct Agent {
    config: AgentConfig,
    source: ReadingSource,
    log: Arc<DurableLog>,
    publisher: Arc<Publisher>,
    health: Arc<Health>,
    state: Arc<StateTracker>,
}

impl Agent {
    /// Build an agent around an opened log and a transport.
    pub fn new(
        config: AgentConfig,
        source: ReadingSource,
        log: Arc<DurableLog>,
        transport: Arc<dyn Transport>,
        publisher_config: PublisherConfig,
    ) -> Self {
        let health = Arc::new(Health::new());
        let state = Arc::new(StateTracker::new());
        let publisher = Arc::new(Publisher::new(
            log.clone(),
            transport,
            health.clone(),
            state.clone(),
            publisher_config,
        ));

        Self {
            config,
            source,
            log,
            publisher,
            health,
            state,
        }
    }

    pub fn health(&self) -> Arc<Health> {
        self.health.clone()
    }

    pub fn state(&self) -> Arc<StateTracker> {
        self.state.clone()
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn log(&self) -> Arc<DurableLog> {
        self.log.clone()
    }

    /// Run until `cancel` fires, or until the configured number of readings
    /// has been taken and delivered.
    ///
    /// Read and transport failures never stop the agent. An error is only
    /// returned if the publisher task dies.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<AgentReport, AgentError> {
        let mut evictions = self.log.subscribe_evictions();
        let recovered = self.log.undelivered_count().await;

        info!(
            source = %self.source.kind(),
            interval_ms = self.config.sample_interval.as_millis() as u64,
            sample_count = self.config.sample_count,
            recovered,
            "Agent started"
        );

        let publisher_cancel = cancel.child_token();
        let publisher_task = tokio::spawn(self.publisher.clone().run(publisher_cancel.clone()));
        if recovered > 0 {
            self.publisher.wake();
        }

        let samples_taken = self.sample_loop(&cancel, &mut evictions).await;

        if self.config.sample_count > 0 && !cancel.is_cancelled() {
            self.wait_for_backlog(&cancel).await;
        }

        // Shutdown: the publisher lets an in-flight publish finish first
        info!("Shutting down agent");
        publisher_cancel.cancel();
        let joined = publisher_task.await;

        let reverted = self.log.revert_all_inflight().await;
        if reverted > 0 {
            info!(reverted, "Reverted in-flight entries to pending");
        }
        if let Err(e) = self.log.compact().await {
            warn!(error = %e, "Final compaction failed");
        }
        self.absorb_evictions(&mut evictions);

        let report = AgentReport {
            samples_taken,
            undelivered: self.log.undelivered_count().await,
            reverted,
            health: self.health.snapshot(),
        };
        log_health(&report.health, report.undelivered);
        info!(
            samples_taken = report.samples_taken,
            undelivered = report.undelivered,
            "Agent stopped"
        );

        joined.map_err(|e| AgentError::Task(format!("publisher task failed: {}", e)))?;
        Ok(report)
    }

    /// Sample until the count is reached or `cancel` fires; returns the
    /// number of readings appended.
    async fn sample_loop(
        &mut self,
        cancel: &CancellationToken,
        evictions: &mut broadcast::Receiver<Eviction>,
    ) -> u64 {
        let timeout = self
            .config
            .sensor_timeout
            .unwrap_or_else(|| self.source.default_timeout());

        let mut ticker = (!self.config.sample_interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(self.config.sample_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut last_maintenance = Instant::now();
        let mut taken = 0u64;
        let mut unavailable_streak = 0u32;

        loop {
            if self.config.sample_count > 0 && taken >= self.config.sample_count {
                info!(taken, "Sample count reached");
                return taken;
            }

            match ticker.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return taken,
                        _ = ticker.tick() => {}
                    }
                }
                None => {
                    if cancel.is_cancelled() {
                        return taken;
                    }
                    tokio::task::yield_now().await;
                }
            }

            if last_maintenance.elapsed() >= self.config.maintenance_interval {
                self.maintain(evictions).await;
                last_maintenance = Instant::now();
            }

            self.state.fire(AgentEvent::Tick);
            match self.source.sample_within(timeout).await {
                Ok(reading) => {
                    self.state.fire(AgentEvent::Sampled);
                    unavailable_streak = 0;

                    let echo = self.config.echo_readings.then(|| reading.clone());
                    match self.log.append(reading).await {
                        Ok(sequence) => {
                            taken += 1;
                            self.health.record_sample();
                            self.state.fire(AgentEvent::Appended);
                            self.absorb_evictions(evictions);
                            self.publisher.wake();
                            match echo {
                                Some(reading) => info!(
                                    sequence,
                                    timestamp = %reading.timestamp().to_rfc3339(),
                                    temperature_c = reading.temperature_c(),
                                    humidity = reading.humidity(),
                                    "Reading buffered"
                                ),
                                None => debug!(sequence, "Reading buffered"),
                            }
                        }
                        Err(e) => {
                            self.state.fire(AgentEvent::AppendFailed);
                            self.health.record_skipped_cycle();
                            error!(error = %e, "Failed to append reading, cycle skipped");
                        }
                    }
                }
                Err(e) => {
                    self.state.fire(AgentEvent::SampleFailed);
                    self.health.record_failure(e.kind());
                    self.health.record_skipped_cycle();

                    if e.is_device_unavailable() {
                        let delay = backoff_delay(
                            unavailable_streak,
                            self.config.unavailable_backoff,
                            self.config.unavailable_backoff_max,
                        );
                        unavailable_streak = unavailable_streak.saturating_add(1);
                        warn!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Sensor unavailable, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return taken,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        warn!(error = %e, "Sample failed, cycle skipped");
                    }
                }
            }
        }
    }

    /// Wait until nothing is left undelivered, or `cancel` fires.
    async fn wait_for_backlog(&self, cancel: &CancellationToken) {
        let mut deliveries = self.publisher.subscribe_deliveries();

        loop {
            let undelivered = self.log.undelivered_count().await;
            if undelivered == 0 {
                info!("Backlog delivered");
                return;
            }
            debug!(undelivered, "Waiting for backlog to drain");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(undelivered, "Stopped before backlog was delivered");
                    return;
                }
                _ = deliveries.recv() => {}
                _ = tokio::time::sleep(BACKLOG_POLL_INTERVAL) => {}
            }
        }
    }

    /// Periodic housekeeping: compact the log and report health.
    async fn maintain(&self, evictions: &mut broadcast::Receiver<Eviction>) {
        match self.log.compact().await {
            Ok(report) => debug!(
                removed = report.removed,
                evicted = report.evicted.len(),
                remaining = report.remaining,
                "Log compacted"
            ),
            Err(e) => warn!(error = %e, "Log compaction failed"),
        }
        self.absorb_evictions(evictions);
        log_health(&self.health.snapshot(), self.log.undelivered_count().await);
    }

    /// Count reported evictions into health.
    fn absorb_evictions(&self, evictions: &mut broadcast::Receiver<Eviction>) {
        loop {
            match evictions.try_recv() {
                Ok(eviction) => self.health.record_eviction(eviction.sequences.len()),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Missed eviction events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

fn log_health(health: &HealthSnapshot, undelivered: usize) {
    info!(
        samples_taken = health.samples_taken,
        cycles_skipped = health.cycles_skipped,
        deliveries = health.deliveries,
        read_failures = health.read_failures,
        transport_failures = health.transport_failures,
        connectivity_losses = health.connectivity_losses,
        capacity_exceeded = health.capacity_exceeded_events,
        entries_evicted = health.entries_evicted,
        undelivered,
        "Health"
    );
}
