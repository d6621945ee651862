//! Reading model and the JSON payload shared by the transport and the durable log.
//!
//! A [`Reading`] is immutable once built. It is converted to a
//! [`ReadingPayload`] for the wire; the log stores the same payload plus its
//! own bookkeeping fields.

use std::ops::RangeInclusive;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Version of the payload schema published to the cloud side.
pub const PAYLOAD_SCHEMA_VERSION: &str = "1";

/// Physically sane temperature range in degrees Celsius.
pub const TEMPERATURE_RANGE_C: RangeInclusive<f64> = -40.0..=125.0;

/// Relative humidity range in percent.
pub const HUMIDITY_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// Keys every payload must carry.
const REQUIRED_STRING_KEYS: [&str; 4] = ["timestamp", "timestamp_ms", "device_id", "sensor_id"];
const REQUIRED_NUMBER_KEYS: [&str; 2] = ["temperature_C", "humidity"];

/// Errors raised when a reading or payload violates the schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    /// Temperature outside [`TEMPERATURE_RANGE_C`]
    #[error("temperature {0}C is outside the sane range -40..=125")]
    TemperatureOutOfRange(f64),

    /// Humidity outside [`HUMIDITY_RANGE`]
    #[error("humidity {0}% is outside 0..=100")]
    HumidityOutOfRange(f64),

    /// Payload is not a JSON object
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// A required key is absent
    #[error("missing key '{0}'")]
    MissingKey(&'static str),

    /// A key holds a value of the wrong JSON type
    #[error("key '{key}' must be a {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    /// A timestamp does not parse as ISO-8601 UTC
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// `timestamp` and `timestamp_ms` disagree
    #[error("timestamp '{seconds}' does not match timestamp_ms '{millis}'")]
    TimestampMismatch { seconds: String, millis: String },

    /// An identity field is empty
    #[error("'{0}' must not be empty")]
    EmptyIdentity(&'static str),
}

/// One timestamped temperature/humidity sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    device_id: String,
    sensor_id: String,
    timestamp: DateTime<Utc>,
    temperature_c: f64,
    humidity: f64,
}

impl Reading {
    /// Build a reading, truncating the timestamp to millisecond precision.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] when a value is outside its physical range or
    /// an identity is empty.
    pub fn new(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        temperature_c: f64,
        humidity: f64,
    ) -> Result<Self, PayloadError> {
        let device_id = device_id.into();
        let sensor_id = sensor_id.into();

        if device_id.is_empty() {
            return Err(PayloadError::EmptyIdentity("device_id"));
        }
        if sensor_id.is_empty() {
            return Err(PayloadError::EmptyIdentity("sensor_id"));
        }
        if !TEMPERATURE_RANGE_C.contains(&temperature_c) {
            return Err(PayloadError::TemperatureOutOfRange(temperature_c));
        }
        if !HUMIDITY_RANGE.contains(&humidity) {
            return Err(PayloadError::HumidityOutOfRange(humidity));
        }

        Ok(Self {
            device_id,
            sensor_id,
            timestamp: truncate_to_millis(timestamp),
            temperature_c,
            humidity,
        })
    }

    /// Build a reading stamped with the current time.
    pub fn now(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        temperature_c: f64,
        humidity: f64,
    ) -> Result<Self, PayloadError> {
        Self::new(device_id, sensor_id, Utc::now(), temperature_c, humidity)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    /// Wire representation of this reading.
    pub fn payload(&self) -> ReadingPayload {
        ReadingPayload::from(self)
    }

    /// Serialize the wire payload to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload())
    }
}

/// JSON payload published to the transport.
///
/// Field names are part of the versioned schema ([`PAYLOAD_SCHEMA_VERSION`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingPayload {
    /// ISO-8601 UTC, second precision
    pub timestamp: String,

    /// ISO-8601 UTC, millisecond precision
    pub timestamp_ms: String,

    #[serde(rename = "temperature_C")]
    pub temperature_c: f64,

    pub humidity: f64,

    pub device_id: String,

    pub sensor_id: String,
}

impl From<&Reading> for ReadingPayload {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            timestamp_ms: reading.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            temperature_c: reading.temperature_c,
            humidity: reading.humidity,
            device_id: reading.device_id.clone(),
            sensor_id: reading.sensor_id.clone(),
        }
    }
}

impl TryFrom<ReadingPayload> for Reading {
    type Error = PayloadError;

    fn try_from(payload: ReadingPayload) -> Result<Self, Self::Error> {
        let timestamp = parse_utc(&payload.timestamp_ms)?;
        Reading::new(
            payload.device_id,
            payload.sensor_id,
            timestamp,
            payload.temperature_c,
            payload.humidity,
        )
    }
}

/// Validate an arbitrary JSON value against the payload schema.
///
/// Extra keys are tolerated so that log lines (which add `sequence` and
/// `state`) validate as well.
pub fn validate_payload(value: &Value) -> Result<(), PayloadError> {
    let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

    for key in REQUIRED_STRING_KEYS {
        match object.get(key) {
            None => return Err(PayloadError::MissingKey(key)),
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(PayloadError::WrongType {
                    key,
                    expected: "string",
                })
            }
        }
    }
    for key in REQUIRED_NUMBER_KEYS {
        match object.get(key) {
            None => return Err(PayloadError::MissingKey(key)),
            Some(Value::Number(_)) => {}
            Some(_) => {
                return Err(PayloadError::WrongType {
                    key,
                    expected: "number",
                })
            }
        }
    }

    let payload: ReadingPayload = serde_json::from_value(value.clone()).map_err(|_| {
        PayloadError::WrongType {
            key: "temperature_C",
            expected: "finite number",
        }
    })?;

    let seconds = parse_utc(&payload.timestamp)?;
    let millis = parse_utc(&payload.timestamp_ms)?;
    if seconds.timestamp() != millis.timestamp() {
        return Err(PayloadError::TimestampMismatch {
            seconds: payload.timestamp,
            millis: payload.timestamp_ms,
        });
    }

    Reading::try_from(payload).map(|_| ())
}

fn parse_utc(raw: &str) -> Result<DateTime<Utc>, PayloadError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| PayloadError::InvalidTimestamp(raw.to_string()))
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_reading() -> Reading {
        let ts = Utc.with_ymd_and_hms(2025, 8, 6, 22, 11, 3).unwrap()
            + chrono::Duration::microseconds(123_456);
        Reading::new("edge-node-001", "dht22-0", ts, 24.6, 52.4).unwrap()
    }

    #[test]
    fn test_payload_timestamps() {
        let payload = sample_reading().payload();

        assert_eq!(payload.timestamp, "2025-08-06T22:11:03Z");
        assert_eq!(payload.timestamp_ms, "2025-08-06T22:11:03.123Z");
    }

    #[test]
    fn test_payload_serialization_keys() {
        let json = serde_json::to_value(sample_reading().payload()).unwrap();

        assert_eq!(json["temperature_C"], json!(24.6));
        assert_eq!(json["humidity"], json!(52.4));
        assert_eq!(json["device_id"], json!("edge-node-001"));
        assert_eq!(json["sensor_id"], json!("dht22-0"));
        assert!(json.get("temperature_c").is_none());
    }

    #[test]
    fn test_timestamp_truncated_to_millis() {
        let reading = sample_reading();
        assert_eq!(reading.timestamp().timestamp_subsec_micros(), 123_000);
    }

    #[test]
    fn test_reading_rejects_out_of_range() {
        let ts = Utc::now();
        assert_eq!(
            Reading::new("d", "s", ts, 130.0, 50.0),
            Err(PayloadError::TemperatureOutOfRange(130.0))
        );
        assert_eq!(
            Reading::new("d", "s", ts, 20.0, 100.5),
            Err(PayloadError::HumidityOutOfRange(100.5))
        );
        assert!(Reading::new("d", "s", ts, f64::NAN, 50.0).is_err());
        assert!(Reading::new("d", "s", ts, -40.0, 0.0).is_ok());
        assert!(Reading::new("d", "s", ts, 125.0, 100.0).is_ok());
    }

    #[test]
    fn test_reading_rejects_empty_identity() {
        assert_eq!(
            Reading::now("", "s", 20.0, 50.0),
            Err(PayloadError::EmptyIdentity("device_id"))
        );
    }

    #[test]
    fn test_payload_back_to_reading() {
        let original = sample_reading();
        let restored = Reading::try_from(original.payload()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_validate_payload_accepts_log_line() {
        let mut value = serde_json::to_value(sample_reading().payload()).unwrap();
        value["sequence"] = json!(7);
        value["state"] = json!("pending");

        assert!(validate_payload(&value).is_ok());
    }

    #[test]
    fn test_validate_payload_missing_temperature() {
        let value = json!({
            "timestamp": "2025-08-16T12:10:00Z",
            "timestamp_ms": "2025-08-16T12:10:00.000Z",
            "device_id": "edge-node-001",
            "sensor_id": "dht22-0",
            "humidity": 55.2
        });

        assert_eq!(
            validate_payload(&value),
            Err(PayloadError::MissingKey("temperature_C"))
        );
    }

    #[test]
    fn test_validate_payload_wrong_type() {
        let mut value = serde_json::to_value(sample_reading().payload()).unwrap();
        value["humidity"] = json!("55.2");

        assert_eq!(
            validate_payload(&value),
            Err(PayloadError::WrongType {
                key: "humidity",
                expected: "number"
            })
        );
    }

    #[test]
    fn test_validate_payload_timestamp_mismatch() {
        let mut value = serde_json::to_value(sample_reading().payload()).unwrap();
        value["timestamp"] = json!("2025-08-06T22:11:04Z");

        assert!(matches!(
            validate_payload(&value),
            Err(PayloadError::TimestampMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_payload_bad_timestamp() {
        let mut value = serde_json::to_value(sample_reading().payload()).unwrap();
        value["timestamp_ms"] = json!("yesterday");

        assert_eq!(
            validate_payload(&value),
            Err(PayloadError::InvalidTimestamp("yesterday".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_non_object() {
        assert_eq!(validate_payload(&json!([1, 2])), Err(PayloadError::NotAnObject));
    }
}
