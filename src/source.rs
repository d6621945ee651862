//! Reading sources for the telemetry agent.
//!
//! Two variants sit behind one `sample` contract:
//!
//! - **Hardware**: a Linux IIO humidity/temperature device (the `dht11`
//!   driver used for DHT11/DHT22 parts), read from sysfs
//! - **Synthetic**: a seeded random walk that mimics a DHT22 indoors, used
//!   for tests, the self-test and pipeline exercises

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use thiserror::Error;
use tracing::debug;

use crate::error::FailureKind;
use crate::reading::{PayloadError, Reading};

/// Default sampling timeout for hardware sensors.
pub const DEFAULT_HARDWARE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default sampling timeout for generated data.
pub const DEFAULT_SYNTHETIC_TIMEOUT: Duration = Duration::from_millis(50);

/// IIO channel holding the temperature in milli-degrees Celsius.
const IIO_TEMPERATURE_CHANNEL: &str = "in_temp_input";

/// IIO channel holding the relative humidity in milli-percent.
const IIO_HUMIDITY_CHANNEL: &str = "in_humidityrelative_input";

/// Failures a reading source can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The sensor answered with bad data; retry on the next tick
    #[error("transient read error: {0}")]
    Transient(String),

    /// The sensor is not responding; the agent backs off before retrying
    #[error("sensor unavailable: {0}")]
    DeviceUnavailable(String),
}

impl ReadError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::ReadFailure
    }

    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, ReadError::DeviceUnavailable(_))
    }
}

impl From<PayloadError> for ReadError {
    fn from(err: PayloadError) -> Self {
        ReadError::Transient(err.to_string())
    }
}

/// Which source variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Hardware,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "mock" => Ok(SourceKind::Synthetic),
            "hardware" | "iio" => Ok(SourceKind::Hardware),
            other => Err(format!(
                "'{}' is not a source kind (expected 'synthetic' or 'hardware')",
                other
            )),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Synthetic => write!(f, "synthetic"),
            SourceKind::Hardware => write!(f, "hardware"),
        }
    }
}

/// A reading source: one of a closed set of sensor variants.
#[derive(Debug)]
pub enum ReadingSource {
    Hardware(IioSensor),
    Synthetic(SyntheticSensor),
}

impl ReadingSource {
    /// Take one reading.
    pub async fn sample(&mut self) -> Result<Reading, ReadError> {
        match self {
            ReadingSource::Hardware(sensor) => sensor.sample().await,
            ReadingSource::Synthetic(sensor) => sensor.sample(),
        }
    }

    /// Take one reading, giving up after `timeout`.
    ///
    /// A sensor that does not answer in time is reported as
    /// [`ReadError::DeviceUnavailable`].
    pub async fn sample_within(&mut self, timeout: Duration) -> Result<Reading, ReadError> {
        match tokio::time::timeout(timeout, self.sample()).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::DeviceUnavailable(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Timeout appropriate for this variant when none is configured.
    pub fn default_timeout(&self) -> Duration {
        match self {
            ReadingSource::Hardware(_) => DEFAULT_HARDWARE_TIMEOUT,
            ReadingSource::Synthetic(_) => DEFAULT_SYNTHETIC_TIMEOUT,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            ReadingSource::Hardware(_) => SourceKind::Hardware,
            ReadingSource::Synthetic(_) => SourceKind::Synthetic,
        }
    }
}

/// Temperature/humidity sensor exposed through the Linux IIO subsystem.
#[derive(Debug, Clone)]
pub struct IioSensor {
    device_id: String,
    sensor_id: String,
    device_dir: PathBuf,
}

impl IioSensor {
    pub fn new(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        device_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
            device_dir: device_dir.into(),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// Read both channels and build a reading.
    pub async fn sample(&self) -> Result<Reading, ReadError> {
        let temperature = self.read_channel(IIO_TEMPERATURE_CHANNEL).await?;
        let humidity = self.read_channel(IIO_HUMIDITY_CHANNEL).await?;

        debug!(
            sensor_id = %self.sensor_id,
            temperature_c = temperature,
            humidity = humidity,
            "IIO sample"
        );

        Ok(Reading::now(
            self.device_id.as_str(),
            self.sensor_id.as_str(),
            temperature,
            humidity,
        )?)
    }

    async fn read_channel(&self, channel: &str) -> Result<f64, ReadError> {
        let path = self.device_dir.join(channel);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| classify_io_error(&path, e))?;

        let milli: i64 = raw.trim().parse().map_err(|_| {
            ReadError::Transient(format!("{}: unparsable value '{}'", path.display(), raw.trim()))
        })?;

        Ok(milli as f64 / 1000.0)
    }
}

/// Map an I/O failure on an IIO channel onto the read taxonomy.
///
/// A missing or unresponsive device is unavailable; anything else (the
/// driver returns EIO on a checksum mismatch) is transient.
fn classify_io_error(path: &Path, err: io::Error) -> ReadError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::TimedOut => {
            ReadError::DeviceUnavailable(format!("{}: {}", path.display(), err))
        }
        _ => ReadError::Transient(format!("{}: {}", path.display(), err)),
    }
}

/// Tuning for the synthetic random walk.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub temperature_start: f64,
    pub humidity_start: f64,
    pub temperature_bounds: (f64, f64),
    pub humidity_bounds: (f64, f64),

    /// Standard deviation of a temperature step
    pub temperature_sigma: f64,

    /// Standard deviation of a humidity step
    pub humidity_sigma: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            temperature_start: 23.5,
            humidity_start: 50.0,
            temperature_bounds: (18.0, 30.0),
            humidity_bounds: (30.0, 70.0),
            temperature_sigma: 0.15,
            humidity_sigma: 0.4,
        }
    }
}

/// Seeded mock DHT22.
///
/// Values drift gently within indoor ranges and bounce off the bounds. The
/// same seed always yields the same sequence of values.
#[derive(Debug)]
pub struct SyntheticSensor {
    device_id: String,
    sensor_id: String,
    config: SyntheticConfig,
    rng: StdRng,
    temperature: f64,
    humidity: f64,
}

impl SyntheticSensor {
    /// Create a synthetic sensor; `seed = None` draws from OS entropy.
    pub fn new(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        seed: Option<u64>,
        config: SyntheticConfig,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
            temperature: config.temperature_start,
            humidity: config.humidity_start,
            config,
            rng,
        }
    }

    pub fn with_seed(device_id: impl Into<String>, sensor_id: impl Into<String>, seed: u64) -> Self {
        Self::new(device_id, sensor_id, Some(seed), SyntheticConfig::default())
    }

    /// Advance the walk and return `(temperature_c, humidity)` rounded to tenths.
    pub fn next_values(&mut self) -> (f64, f64) {
        self.temperature = walk(
            &mut self.rng,
            self.temperature,
            self.config.temperature_sigma,
            self.config.temperature_bounds,
        );
        self.humidity = walk(
            &mut self.rng,
            self.humidity,
            self.config.humidity_sigma,
            self.config.humidity_bounds,
        );

        (round_tenth(self.temperature), round_tenth(self.humidity))
    }

    pub fn sample(&mut self) -> Result<Reading, ReadError> {
        let (temperature, humidity) = self.next_values();
        Ok(Reading::now(
            self.device_id.as_str(),
            self.sensor_id.as_str(),
            temperature,
            humidity,
        )?)
    }
}

/// One Gaussian random-walk step kept inside `(min, max)`.
///
/// A step that leaves the range is pinned to the bound it crossed and then
/// pushed back inside by a fresh draw.
fn walk<R: Rng>(rng: &mut R, value: f64, sigma: f64, (min, max): (f64, f64)) -> f64 {
    let next = value + gaussian(rng, sigma);
    if next > max {
        (max - gaussian(rng, sigma).abs()).max(min)
    } else if next < min {
        (min + gaussian(rng, sigma).abs()).min(max)
    } else {
        next
    }
}

fn gaussian<R: Rng>(rng: &mut R, sigma: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    z * sigma
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
