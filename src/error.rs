//! Agent-wide error taxonomy.
//!
//! Component errors ([`ReadError`](crate::source::ReadError),
//! [`TransportError`](crate::transport::TransportError),
//! [`LogError`](crate::durable_log::LogError)) each map onto a
//! [`FailureKind`], which decides how the agent reacts.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::durable_log::LogError;
use crate::transport::TransportError;

/// Failure classes the agent distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Sensor read failed; the cycle is skipped, nothing was appended
    ReadFailure,

    /// A publish attempt failed or timed out; the entry is retried
    TransportFailure,

    /// The transport is down; draining is suspended, sampling is not
    ConnectivityLoss,

    /// The retention ceiling was hit and unacknowledged data was evicted
    LogCapacityExceeded,

    /// Invalid configuration; fatal at startup
    ConfigurationError,
}

impl FailureKind {
    /// Whether the agent must stop when this failure occurs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureKind::ConfigurationError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ReadFailure => "read_failure",
            FailureKind::TransportFailure => "transport_failure",
            FailureKind::ConnectivityLoss => "connectivity_loss",
            FailureKind::LogCapacityExceeded => "log_capacity_exceeded",
            FailureKind::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that stop the agent or prevent it from starting.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("durable log error: {0}")]
    Log(#[from] LogError),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    /// A spawned task panicked or was aborted
    #[error("agent task failed: {0}")]
    Task(String),
}

impl AgentError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            AgentError::Configuration(_) => Some(FailureKind::ConfigurationError),
            AgentError::Transport(e) => Some(e.kind()),
            AgentError::Log(_) | AgentError::Task(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(FailureKind::ConfigurationError.is_fatal());
        assert!(!FailureKind::ReadFailure.is_fatal());
        assert!(!FailureKind::TransportFailure.is_fatal());
        assert!(!FailureKind::ConnectivityLoss.is_fatal());
        assert!(!FailureKind::LogCapacityExceeded.is_fatal());
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(
            FailureKind::LogCapacityExceeded.to_string(),
            "log_capacity_exceeded"
        );
    }

    #[test]
    fn test_agent_error_kind() {
        let err = AgentError::from(ConfigError::new("bad cadence", Some("EDGE_AGENT_SAMPLE_INTERVAL_SECS")));
        assert_eq!(err.kind(), Some(FailureKind::ConfigurationError));
        assert!(err.to_string().contains("bad cadence"));

        let err = AgentError::from(TransportError::Disconnected("refused".to_string()));
        assert_eq!(err.kind(), Some(FailureKind::ConnectivityLoss));

        let err = AgentError::Task("panicked".to_string());
        assert_eq!(err.kind(), None);
    }
}
