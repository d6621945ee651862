//! Agent loop state machine.
//!
//! Sampling and draining run as separate tasks, so the state is a shared,
//! observable status rather than a gate: each task reports the events it
//! sees and the tracker applies the ones that are valid from the current
//! state.

use std::fmt;

use tokio::sync::watch;
use tracing::trace;

/// Where the agent loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Idle,
    Sampling,
    Buffering,
    Draining,
    Backoff,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Sampling => "sampling",
            AgentState::Buffering => "buffering",
            AgentState::Draining => "draining",
            AgentState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Events reported by the sampler and the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// The cadence timer fired
    Tick,

    /// The source produced a reading
    Sampled,

    /// The source failed; the cycle is skipped
    SampleFailed,

    /// The reading is in the durable log
    Appended,

    /// The reading could not be written; the cycle is skipped
    AppendFailed,

    /// The publisher found a backlog without a fresh append (e.g. after restart)
    Backlog,

    /// Nothing is pending for immediate attempt
    Drained,

    /// The transport reported the link down
    ConnectivityLost,

    /// A single publish attempt failed; a retry is scheduled
    PublishFailed,

    /// The scheduled retry time arrived or the link came back
    RetryDue,
}

impl AgentState {
    /// The state reached from `self` on `event`, or `None` if the event does
    /// not apply here.
    pub fn advance(self, event: AgentEvent) -> Option<AgentState> {
        use AgentEvent::*;
        use AgentState::*;

        match (self, event) {
            (Idle, Tick) => Some(Sampling),
            (Sampling, Sampled) => Some(Buffering),
            (Sampling, SampleFailed) => Some(Idle),
            (Buffering, Appended) => Some(Draining),
            (Buffering, AppendFailed) => Some(Idle),
            (Idle, Backlog) => Some(Draining),
            (Draining, Drained) => Some(Idle),
            (Draining, ConnectivityLost) | (Draining, PublishFailed) => Some(Backoff),
            (Backoff, RetryDue) => Some(Draining),
            _ => None,
        }
    }
}

/// Shared holder of the current [`AgentState`].
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<AgentState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AgentState::Idle);
        Self { tx }
    }

    /// Apply `event`; returns the new state if a transition happened.
    pub fn fire(&self, event: AgentEvent) -> Option<AgentState> {
        let mut next = None;
        self.tx.send_if_modified(|state| match state.advance(event) {
            Some(to) => {
                trace!(from = %state, to = %to, ?event, "State transition");
                *state = to;
                next = Some(to);
                true
            }
            None => false,
        });
        next
    }

    pub fn current(&self) -> AgentState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_cycle() {
        let state = AgentState::Idle
            .advance(AgentEvent::Tick)
            .and_then(|s| s.advance(AgentEvent::Sampled))
            .and_then(|s| s.advance(AgentEvent::Appended))
            .and_then(|s| s.advance(AgentEvent::Drained));
        assert_eq!(state, Some(AgentState::Idle));
    }

    #[test]
    fn test_failed_sample_returns_to_idle() {
        assert_eq!(
            AgentState::Sampling.advance(AgentEvent::SampleFailed),
            Some(AgentState::Idle)
        );
    }

    #[test]
    fn test_backoff_cycle() {
        assert_eq!(
            AgentState::Draining.advance(AgentEvent::ConnectivityLost),
            Some(AgentState::Backoff)
        );
        assert_eq!(
            AgentState::Backoff.advance(AgentEvent::RetryDue),
            Some(AgentState::Draining)
        );
    }

    #[test]
    fn test_invalid_events_are_ignored() {
        assert_eq!(AgentState::Idle.advance(AgentEvent::Appended), None);
        assert_eq!(AgentState::Backoff.advance(AgentEvent::Tick), None);

        let tracker = StateTracker::new();
        assert_eq!(tracker.fire(AgentEvent::Drained), None);
        assert_eq!(tracker.current(), AgentState::Idle);
    }

    #[test]
    fn test_tracker_notifies_subscribers() {
        let tracker = StateTracker::new();
        let mut rx = tracker.subscribe();

        assert_eq!(tracker.fire(AgentEvent::Tick), Some(AgentState::Sampling));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AgentState::Sampling);
        assert_eq!(AgentState::Sampling.to_string(), "sampling");
    }
}
