//! Configuration module for the edge telemetry agent.
//!
//! This module provides environment-based configuration: device identity,
//! sampling cadence, the durable log location and retention ceiling, and the
//! transport endpoint and retry settings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::durable_log::{RetentionPolicy, DEFAULT_MAX_AGE, DEFAULT_MAX_ENTRIES};
use crate::source::SourceKind;

/// Default device identity
const DEFAULT_DEVICE_ID: &str = "edge-node-001";

/// Default sensor identity
const DEFAULT_SENSOR_ID: &str = "dht22-0";

/// Default seconds between samples
const DEFAULT_SAMPLE_INTERVAL_SECS: f64 = 2.0;

/// Maximum seconds between samples
const MAX_SAMPLE_INTERVAL_SECS: f64 = 3600.0;

/// Default durable log path
const DEFAULT_LOG_PATH: &str = "data/sensor_log.jsonl";

/// Default IIO device directory for the hardware source
const DEFAULT_IIO_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

/// Default transport endpoint
const DEFAULT_ENDPOINT: &str = "http://localhost:8000";

/// Default per-attempt publish timeout in seconds
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

/// Upper bound on the publish timeout
const MAX_PUBLISH_TIMEOUT_SECS: u64 = 300;

/// Default backoff base in milliseconds
const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Default backoff cap in milliseconds
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Upper bound on the sensor timeout
const MAX_SENSOR_TIMEOUT_MS: u64 = 60_000;

/// Maximum identity length
const MAX_IDENTITY_LEN: usize = 128;

/// Configuration for the edge telemetry agent.
///
/// All settings can be configured via `EDGE_AGENT_*` environment variables:
/// - `EDGE_AGENT_DEVICE_ID`: device identity (default: edge-node-001)
/// - `EDGE_AGENT_SENSOR_ID`: sensor identity (default: dht22-0)
/// - `EDGE_AGENT_SAMPLE_COUNT`: readings to take, 0 = unbounded (default: 0)
/// - `EDGE_AGENT_SAMPLE_INTERVAL_SECS`: cadence, 0 = fastest (default: 2.0)
/// - `EDGE_AGENT_LOG_PATH`: durable log path (default: data/sensor_log.jsonl)
/// - `EDGE_AGENT_SEED`: synthetic source seed (default: unset)
/// - `EDGE_AGENT_SOURCE`: `synthetic` or `hardware` (default: synthetic)
/// - `EDGE_AGENT_IIO_DEVICE`: hardware device directory
/// - `EDGE_AGENT_SENSOR_TIMEOUT_MS`: sample timeout (default: per source)
/// - `EDGE_AGENT_ENDPOINT`: transport endpoint (default: http://localhost:8000)
/// - `EDGE_AGENT_TOPIC`: publish topic (default: telemetry/{device_id})
/// - `EDGE_AGENT_PUBLISH_TIMEOUT_SECS`: per-attempt timeout (default: 10)
/// - `EDGE_AGENT_RETRY_BASE_MS` / `EDGE_AGENT_RETRY_MAX_MS`: backoff (default: 500 / 30000)
/// - `EDGE_AGENT_RETENTION_MAX_ENTRIES`: log entry ceiling (default: 10000)
/// - `EDGE_AGENT_RETENTION_MAX_AGE_SECS`: log age ceiling, 0 disables (default: 7 days)
/// - `EDGE_AGENT_ECHO_READINGS`: log every buffered reading at info level (default: true)
/// - `EDGE_AGENT_SELF_TEST`: run the self-test and exit (default: false)
#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,
    pub sensor_id: String,

    /// Number of readings to take; 0 runs until stopped
    pub sample_count: u64,

    /// Time between sampling ticks; zero samples as fast as possible
    pub sample_interval: Duration,

    /// Path of the durable JSON Lines log
    pub log_path: PathBuf,

    /// Seed for the synthetic source
    pub seed: Option<u64>,

    pub source: SourceKind,

    /// IIO device directory read by the hardware source
    pub iio_device: PathBuf,

    /// Sample timeout; `None` uses the source's default
    pub sensor_timeout: Option<Duration>,

    /// Base URL of the publish endpoint
    pub endpoint: String,

    /// Topic readings are published to
    pub topic: String,

    /// Timeout for a single publish attempt
    pub publish_timeout: Duration,

    pub retry_base: Duration,
    pub retry_max: Duration,

    pub retention: RetentionPolicy,

    /// Log each buffered reading at info level instead of debug
    pub echo_readings: bool,

    pub self_test: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>, env_var: Option<&str>) -> Self {
        Self {
            message: message.into(),
            env_var: env_var.map(str::to_string),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable is malformed or out of bounds,
    /// or if the settings contradict each other (e.g. retry base above cap).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use edge_telemetry_agent::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Publishing to: {}", config.topic);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let device_id = vars.identity("EDGE_AGENT_DEVICE_ID", DEFAULT_DEVICE_ID)?;
        let sensor_id = vars.identity("EDGE_AGENT_SENSOR_ID", DEFAULT_SENSOR_ID)?;

        let sample_count = vars.parse("EDGE_AGENT_SAMPLE_COUNT", 0u64)?;
        let sample_interval = Self::parse_sample_interval(&vars)?;

        let log_path = vars
            .get("EDGE_AGENT_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));

        let seed = match vars.get("EDGE_AGENT_SEED") {
            Some(value) => Some(value.parse::<u64>().map_err(|_| {
                ConfigError::new(
                    format!("'{}' is not a valid number", value),
                    Some("EDGE_AGENT_SEED"),
                )
            })?),
            None => None,
        };

        let source = match vars.get("EDGE_AGENT_SOURCE") {
            Some(value) => value
                .parse::<SourceKind>()
                .map_err(|msg| ConfigError::new(msg, Some("EDGE_AGENT_SOURCE")))?,
            None => SourceKind::Synthetic,
        };

        let iio_device = vars
            .get("EDGE_AGENT_IIO_DEVICE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IIO_DEVICE));

        let sensor_timeout = match vars.get("EDGE_AGENT_SENSOR_TIMEOUT_MS") {
            Some(_) => {
                let ms = vars.bounded("EDGE_AGENT_SENSOR_TIMEOUT_MS", 0, 1, MAX_SENSOR_TIMEOUT_MS)?;
                Some(Duration::from_millis(ms))
            }
            None => None,
        };

        let endpoint = vars
            .get("EDGE_AGENT_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::new(
                format!("'{}' must be an http:// or https:// URL", endpoint),
                Some("EDGE_AGENT_ENDPOINT"),
            ));
        }

        let topic = vars
            .get("EDGE_AGENT_TOPIC")
            .unwrap_or_else(|| format!("telemetry/{}", device_id));
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(ConfigError::new(
                "topic must be non-empty and must not contain wildcards",
                Some("EDGE_AGENT_TOPIC"),
            ));
        }

        let publish_timeout = Duration::from_secs(vars.bounded(
            "EDGE_AGENT_PUBLISH_TIMEOUT_SECS",
            DEFAULT_PUBLISH_TIMEOUT_SECS,
            1,
            MAX_PUBLISH_TIMEOUT_SECS,
        )?);

        let retry_base =
            Duration::from_millis(vars.bounded("EDGE_AGENT_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS, 1, u64::MAX)?);
        let retry_max =
            Duration::from_millis(vars.bounded("EDGE_AGENT_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS, 1, u64::MAX)?);
        if retry_base > retry_max {
            return Err(ConfigError::new(
                format!(
                    "retry base {}ms exceeds retry cap {}ms",
                    retry_base.as_millis(),
                    retry_max.as_millis()
                ),
                Some("EDGE_AGENT_RETRY_BASE_MS"),
            ));
        }

        let max_entries = vars.bounded(
            "EDGE_AGENT_RETENTION_MAX_ENTRIES",
            DEFAULT_MAX_ENTRIES as u64,
            1,
            usize::MAX as u64,
        )? as usize;
        let max_age_secs = vars.parse("EDGE_AGENT_RETENTION_MAX_AGE_SECS", DEFAULT_MAX_AGE.as_secs())?;
        let max_age = (max_age_secs > 0).then(|| Duration::from_secs(max_age_secs));

        let echo_readings = vars.flag_or("EDGE_AGENT_ECHO_READINGS", true)?;
        let self_test = vars.flag("EDGE_AGENT_SELF_TEST")?;

        Ok(Self {
            device_id,
            sensor_id,
            sample_count,
            sample_interval,
            log_path,
            seed,
            source,
            iio_device,
            sensor_timeout,
            endpoint,
            topic,
            publish_timeout,
            retry_base,
            retry_max,
            retention: RetentionPolicy::new(max_entries, max_age),
            echo_readings,
            self_test,
        })
    }

    /// Whether `EDGE_AGENT_SELF_TEST` asks for the self-test.
    ///
    /// Read on its own so that the self-test can run even when other
    /// variables would fail validation.
    pub fn self_test_requested<F>(lookup: F) -> Result<bool, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Vars { lookup: &lookup }.flag("EDGE_AGENT_SELF_TEST")
    }

    /// Parse the sampling cadence (fractional seconds) with validation.
    fn parse_sample_interval(vars: &Vars<'_>) -> Result<Duration, ConfigError> {
        let env_var = "EDGE_AGENT_SAMPLE_INTERVAL_SECS";

        match vars.get(env_var) {
            Some(value) => {
                let secs: f64 = value.parse().map_err(|_| {
                    ConfigError::new(format!("'{}' is not a valid number", value), Some(env_var))
                })?;

                if !secs.is_finite() || secs < 0.0 {
                    return Err(ConfigError::new(
                        format!("sample interval {} must be zero or positive", value),
                        Some(env_var),
                    ));
                }

                if secs > MAX_SAMPLE_INTERVAL_SECS {
                    return Err(ConfigError::new(
                        format!(
                            "sample interval {} exceeds maximum ({}s)",
                            secs, MAX_SAMPLE_INTERVAL_SECS
                        ),
                        Some(env_var),
                    ));
                }

                Ok(Duration::from_secs_f64(secs))
            }
            None => Ok(Duration::from_secs_f64(DEFAULT_SAMPLE_INTERVAL_SECS)),
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            sensor_id: DEFAULT_SENSOR_ID.to_string(),
            sample_count: 0,
            sample_interval: Duration::from_secs_f64(DEFAULT_SAMPLE_INTERVAL_SECS),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            seed: None,
            source: SourceKind::Synthetic,
            iio_device: PathBuf::from(DEFAULT_IIO_DEVICE),
            sensor_timeout: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            topic: format!("telemetry/{}", DEFAULT_DEVICE_ID),
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            retention: RetentionPolicy::default(),
            echo_readings: true,
            self_test: false,
        }
    }
}

/// Whether `value` is a usable device or sensor identity.
pub fn is_valid_identity(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTITY_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}

/// Typed access to configuration variables.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    /// Trimmed value; empty values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value.parse().map_err(|_| {
                ConfigError::new(format!("'{}' is not a valid number", value), Some(key))
            }),
            None => Ok(default),
        }
    }

    fn bounded(&self, key: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        let value = self.parse(key, default)?;

        if value < min {
            return Err(ConfigError::new(
                format!("{} is below minimum ({})", value, min),
                Some(key),
            ));
        }

        if value > max {
            return Err(ConfigError::new(
                format!("{} exceeds maximum ({})", value, max),
                Some(key),
            ));
        }

        Ok(value)
    }

    fn identity(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        let value = self.get(key).unwrap_or_else(|| default.to_string());
        if !is_valid_identity(&value) {
            return Err(ConfigError::new(
                format!(
                    "'{}' must be 1-{} characters of letters, digits, '.', '_', ':' or '-'",
                    value, MAX_IDENTITY_LEN
                ),
                Some(key),
            ));
        }
        Ok(value)
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        self.flag_or(key, false)
    }

    fn flag_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::new(
                format!("'{}' is not a boolean", v),
                Some(key),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device_id, "edge-node-001");
        assert_eq!(config.topic, "telemetry/edge-node-001");
        assert_eq!(config.sample_interval, Duration::from_secs(2));
        assert_eq!(config.retention.max_entries, 10_000);
        assert!(config.echo_readings);
        assert!(!config.self_test);
    }

    #[test]
    fn test_config_from_lookup_with_defaults() {
        let config = load(&[]).expect("Should load with defaults");
        assert_eq!(config.device_id, "edge-node-001");
        assert_eq!(config.sensor_id, "dht22-0");
        assert_eq!(config.sample_count, 0);
        assert_eq!(config.log_path, PathBuf::from("data/sensor_log.jsonl"));
        assert_eq!(config.seed, None);
        assert_eq!(config.source, SourceKind::Synthetic);
        assert_eq!(config.sensor_timeout, None);
        assert_eq!(config.endpoint, "http://localhost:8000");
        assert_eq!(config.publish_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_base, Duration::from_millis(500));
        assert_eq!(config.retry_max, Duration::from_millis(30_000));
        assert_eq!(config.retention, RetentionPolicy::default());
    }

    #[test]
    fn test_config_custom_values() {
        let config = load(&[
            ("EDGE_AGENT_DEVICE_ID", "greenhouse-7"),
            ("EDGE_AGENT_SAMPLE_COUNT", "5"),
            ("EDGE_AGENT_SAMPLE_INTERVAL_SECS", "0.25"),
            ("EDGE_AGENT_SEED", "42"),
            ("EDGE_AGENT_SOURCE", "hardware"),
            ("EDGE_AGENT_SENSOR_TIMEOUT_MS", "750"),
            ("EDGE_AGENT_ENDPOINT", "https://iot.example.com:8443/"),
            ("EDGE_AGENT_RETENTION_MAX_ENTRIES", "3"),
            ("EDGE_AGENT_RETENTION_MAX_AGE_SECS", "0"),
            ("EDGE_AGENT_ECHO_READINGS", "off"),
            ("EDGE_AGENT_SELF_TEST", "true"),
        ])
        .expect("Should load custom values");

        assert_eq!(config.device_id, "greenhouse-7");
        assert_eq!(config.topic, "telemetry/greenhouse-7");
        assert_eq!(config.sample_count, 5);
        assert_eq!(config.sample_interval, Duration::from_millis(250));
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.source, SourceKind::Hardware);
        assert_eq!(config.sensor_timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.endpoint, "https://iot.example.com:8443"); // Trailing slash removed
        assert_eq!(config.retention, RetentionPolicy::new(3, None));
        assert!(!config.echo_readings);
        assert!(config.self_test);
    }

    #[test]
    fn test_self_test_requested_ignores_other_vars() {
        let map: HashMap<String, String> = [
            ("EDGE_AGENT_SELF_TEST", "yes"),
            ("EDGE_AGENT_SAMPLE_INTERVAL_SECS", "not-a-number"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert!(Config::from_lookup(|key| map.get(key).cloned()).is_err());
        assert!(Config::self_test_requested(|key| map.get(key).cloned()).unwrap());
        assert!(!Config::self_test_requested(|_| None).unwrap());
        assert!(Config::self_test_requested(|_| Some("maybe".to_string())).is_err());
    }

    #[test]
    fn test_zero_interval_means_fastest() {
        let config = load(&[("EDGE_AGENT_SAMPLE_INTERVAL_SECS", "0")]).unwrap();
        assert!(config.sample_interval.is_zero());
    }

    #[test]
    fn test_invalid_sample_interval() {
        let err = load(&[("EDGE_AGENT_SAMPLE_INTERVAL_SECS", "fast")]).unwrap_err();
        assert!(err.message.contains("not a valid number"));

        let err = load(&[("EDGE_AGENT_SAMPLE_INTERVAL_SECS", "-1")]).unwrap_err();
        assert!(err.message.contains("zero or positive"));

        let err = load(&[("EDGE_AGENT_SAMPLE_INTERVAL_SECS", "7200")]).unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
        assert_eq!(err.env_var.as_deref(), Some("EDGE_AGENT_SAMPLE_INTERVAL_SECS"));
    }

    #[test]
    fn test_invalid_identity() {
        let err = load(&[("EDGE_AGENT_DEVICE_ID", "node 1")]).unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("EDGE_AGENT_DEVICE_ID"));

        let long = "x".repeat(129);
        assert!(load(&[("EDGE_AGENT_SENSOR_ID", long.as_str())]).is_err());
        assert!(is_valid_identity("dht22:0.a_b-c"));
        assert!(!is_valid_identity(""));
    }

    #[test]
    fn test_zero_retention_ceiling() {
        let err = load(&[("EDGE_AGENT_RETENTION_MAX_ENTRIES", "0")]).unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_retry_base_above_cap() {
        let err = load(&[
            ("EDGE_AGENT_RETRY_BASE_MS", "5000"),
            ("EDGE_AGENT_RETRY_MAX_MS", "1000"),
        ])
        .unwrap_err();
        assert!(err.message.contains("exceeds retry cap"));
    }

    #[test]
    fn test_invalid_source_and_flag() {
        let err = load(&[("EDGE_AGENT_SOURCE", "thermocouple")]).unwrap_err();
        assert!(err.message.contains("not a source kind"));

        let err = load(&[("EDGE_AGENT_SELF_TEST", "maybe")]).unwrap_err();
        assert!(err.message.contains("not a boolean"));
    }

    #[test]
    fn test_invalid_endpoint_and_topic() {
        assert!(load(&[("EDGE_AGENT_ENDPOINT", "ftp://broker")]).is_err());
        assert!(load(&[("EDGE_AGENT_TOPIC", "telemetry/#")]).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::new("test error", Some("TEST_VAR"));
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError::new("general error", None);
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
