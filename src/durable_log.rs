//! Write-ahead durable log for readings awaiting delivery.
//!
//! Every reading is appended (and synced to disk) before the publisher may
//! touch it. The on-disk format is JSON Lines: each line is the reading
//! payload plus `sequence` and `state`. State changes append another line
//! for the same sequence and the last line wins on replay; compaction
//! rewrites the file atomically through a temp file and a rename.
//!
//! A sidecar `<log>.seq` file keeps the sequence high-water mark so that
//! sequence numbers keep increasing after compaction empties the log.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::reading::{validate_payload, Reading, ReadingPayload};

/// Default retention ceiling (entries held in the log).
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default retention ceiling by age (seven days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Capacity of the eviction event channel.
const EVICTION_CHANNEL_CAPACITY: usize = 64;

/// Delivery state of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Inflight,
    Acknowledged,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Pending => write!(f, "pending"),
            EntryState::Inflight => write!(f, "inflight"),
            EntryState::Acknowledged => write!(f, "acknowledged"),
        }
    }
}

/// A reading together with its sequence number and delivery state.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub sequence: u64,
    pub reading: Reading,
    pub state: EntryState,
}

/// One line of the persisted log.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    #[serde(flatten)]
    payload: ReadingPayload,
    sequence: u64,
    state: EntryState,
}

impl From<&LogEntry> for LogRecord {
    fn from(entry: &LogEntry) -> Self {
        Self {
            payload: entry.reading.payload(),
            sequence: entry.sequence,
            state: entry.state,
        }
    }
}

/// Errors from durable log operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No entry with this sequence is held
    #[error("no log entry with sequence {0}")]
    UnknownSequence(u64),

    /// The requested state change is not allowed from the current state
    #[error("sequence {sequence}: cannot move from {from} to {to}")]
    InvalidTransition {
        sequence: u64,
        from: EntryState,
        to: EntryState,
    },

    /// The sequence sidecar file could not be parsed
    #[error("corrupt sequence file: {0}")]
    Corrupt(String),
}

/// Bounds on how much undelivered data the log may hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of entries held, acknowledged or not
    pub max_entries: usize,

    /// Unacknowledged entries older than this are evicted on compaction
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age: Some(DEFAULT_MAX_AGE),
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_entries: usize, max_age: Option<Duration>) -> Self {
        Self {
            max_entries,
            max_age,
        }
    }
}

/// Why entries were evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The entry-count ceiling was exceeded
    EntryCeiling,

    /// The entries outlived the age ceiling
    AgeCeiling,
}

/// Capacity-exceeded event: undelivered readings were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub sequences: Vec<u64>,
    pub reason: EvictionReason,
}

/// Statistics about log operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Readings appended since open
    pub appended: u64,

    /// Entries moved to acknowledged since open
    pub acknowledged: u64,

    /// Acknowledged entries removed from the log
    pub compacted: u64,

    /// Unacknowledged entries evicted by the retention ceiling
    pub evicted: u64,

    /// Entries found pending or inflight when the log was opened
    pub recovered: u64,

    /// Unreadable lines dropped during replay
    pub skipped_lines: u64,
}

/// Outcome of a [`DurableLog::compact`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Acknowledged entries removed
    pub removed: usize,

    /// Unacknowledged entries evicted by the age ceiling
    pub evicted: Vec<u64>,

    /// Entries still held
    pub remaining: usize,
}

struct LogInner {
    file: File,
    entries: VecDeque<LogEntry>,
    next_sequence: u64,

    /// Lines in the file superseded by later lines for the same sequence
    stale_lines: usize,

    /// Set when a failed write may have left a partial line behind
    needs_rewrite: bool,

    stats: LogStats,
}

/// Append-only, crash-tolerant store of readings.
///
/// All state transitions go through this type; each one checks the current
/// state under the internal lock, so the log can be shared between the
/// sampling loop and the publisher without further coordination.
///
/// # Example
///
/// ```no_run
/// use edge_telemetry_agent::durable_log::{DurableLog, RetentionPolicy};
/// use edge_telemetry_agent::reading::Reading;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let log = DurableLog::open("data/sensor_log.jsonl", RetentionPolicy::default()).await?;
///
///     let reading = Reading::now("edge-node-001", "dht22-0", 23.4, 51.0)?;
///     let sequence = log.append(reading).await?;
///
///     log.mark_inflight(sequence).await?;
///     log.mark_acknowledged(sequence).await?;
///     log.compact().await?;
///     Ok(())
/// }
/// ```
pub struct DurableLog {
    path: PathBuf,
    watermark_path: PathBuf,
    retention: RetentionPolicy,
    inner: Mutex<LogInner>,
    evictions: broadcast::Sender<Eviction>,
}

impl DurableLog {
    /// Open (or create) the log at `path` and replay its contents.
    ///
    /// Entries found `inflight` are recovered as `pending`. Unreadable lines,
    /// such as a line torn by a crash mid-write, are skipped and the file is
    /// rewritten clean.
    pub async fn open(
        path: impl Into<PathBuf>,
        retention: RetentionPolicy,
    ) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let watermark_path = sidecar_path(&path, ".seq");
        let replay = replay(&path).await?;
        let (watermark, watermark_intact) = match read_watermark(&watermark_path).await {
            Ok(watermark) => (watermark, true),
            Err(LogError::Corrupt(reason)) => {
                // the replayed log still bounds the sequence from below
                warn!(
                    path = %watermark_path.display(),
                    reason = %reason,
                    "Sequence file unreadable, falling back to replayed log"
                );
                (0, false)
            }
            Err(e) => return Err(e),
        };

        let max_sequence = replay.entries.back().map(|e| e.sequence).unwrap_or(0);
        let next_sequence = max_sequence.max(watermark) + 1;

        let recovered = replay
            .entries
            .iter()
            .filter(|e| e.state != EntryState::Acknowledged)
            .count() as u64;

        let file = open_append(&path).await?;
        let (evictions, _) = broadcast::channel(EVICTION_CHANNEL_CAPACITY);

        let log = Self {
            path,
            watermark_path,
            retention,
            inner: Mutex::new(LogInner {
                file,
                stale_lines: replay.stale_lines,
                needs_rewrite: !replay.clean || !watermark_intact,
                entries: replay.entries,
                next_sequence,
                stats: LogStats {
                    recovered,
                    skipped_lines: replay.skipped_lines,
                    ..LogStats::default()
                },
            }),
            evictions,
        };

        {
            let mut inner = log.inner.lock().await;
            if inner.needs_rewrite {
                warn!(
                    path = %log.path.display(),
                    skipped_lines = inner.stats.skipped_lines,
                    "Log contained unreadable data, rewriting"
                );
                log.rewrite_locked(&mut inner).await?;
            }

            info!(
                path = %log.path.display(),
                entries = inner.entries.len(),
                recovered = recovered,
                next_sequence = inner.next_sequence,
                "Durable log opened"
            );
        }

        Ok(log)
    }

    /// Append a reading as `pending` and return its sequence number.
    ///
    /// The entry is synced to stable storage before this returns. If the
    /// retention ceiling is exceeded afterwards, acknowledged entries are
    /// dropped first and then the oldest pending ones, reported as an
    /// [`Eviction`].
    pub async fn append(&self, reading: Reading) -> Result<u64, LogError> {
        let mut inner = self.inner.lock().await;

        let entry = LogEntry {
            sequence: inner.next_sequence,
            reading,
            state: EntryState::Pending,
        };
        self.write_locked(&mut inner, &entry, true).await?;

        let sequence = entry.sequence;
        inner.next_sequence += 1;
        inner.entries.push_back(entry);
        inner.stats.appended += 1;
        debug!(sequence, "Reading appended");

        if inner.entries.len() > self.retention.max_entries {
            self.enforce_entry_ceiling(&mut inner).await;
        }

        Ok(sequence)
    }

    /// Move an entry from `pending` to `inflight`. Idempotent.
    pub async fn mark_inflight(&self, sequence: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock().await;
        let entry = find_mut(&mut inner.entries, sequence)?;

        match entry.state {
            EntryState::Pending => {
                entry.state = EntryState::Inflight;
                Ok(())
            }
            EntryState::Inflight => Ok(()),
            EntryState::Acknowledged => Err(LogError::InvalidTransition {
                sequence,
                from: entry.state,
                to: EntryState::Inflight,
            }),
        }
    }

    /// Move an entry from `inflight` to `acknowledged`.
    ///
    /// Any other source state is a logic error in the caller. The ack record
    /// is flushed but not synced: losing it in a crash only causes one more
    /// delivery of the same reading.
    pub async fn mark_acknowledged(&self, sequence: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock().await;
        let index = find_index(&inner.entries, sequence)?;

        let current = inner.entries[index].state;
        if current != EntryState::Inflight {
            return Err(LogError::InvalidTransition {
                sequence,
                from: current,
                to: EntryState::Acknowledged,
            });
        }

        let mut acknowledged = inner.entries[index].clone();
        acknowledged.state = EntryState::Acknowledged;
        self.write_locked(&mut inner, &acknowledged, false).await?;

        inner.entries[index].state = EntryState::Acknowledged;
        inner.stale_lines += 1;
        inner.stats.acknowledged += 1;
        debug!(sequence, "Entry acknowledged");
        Ok(())
    }

    /// Move an entry from `inflight` back to `pending`. Idempotent.
    pub async fn revert_to_pending(&self, sequence: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock().await;
        let entry = find_mut(&mut inner.entries, sequence)?;

        match entry.state {
            EntryState::Inflight => {
                entry.state = EntryState::Pending;
                Ok(())
            }
            EntryState::Pending => Ok(()),
            EntryState::Acknowledged => Err(LogError::InvalidTransition {
                sequence,
                from: entry.state,
                to: EntryState::Pending,
            }),
        }
    }

    /// Revert every `inflight` entry to `pending`; returns how many moved.
    pub async fn revert_all_inflight(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut reverted = 0;
        for entry in inner.entries.iter_mut() {
            if entry.state == EntryState::Inflight {
                entry.state = EntryState::Pending;
                reverted += 1;
            }
        }
        reverted
    }

    /// All `pending` entries in ascending sequence order.
    pub async fn iterate_pending(&self) -> Vec<LogEntry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .cloned()
            .collect()
    }

    /// The oldest undelivered entry, if it is ready to be attempted.
    ///
    /// Returns `None` when every entry is acknowledged or when the oldest
    /// undelivered entry is already `inflight`, so that nothing newer can
    /// overtake it.
    pub async fn next_pending(&self) -> Option<LogEntry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.state != EntryState::Acknowledged)
            .filter(|e| e.state == EntryState::Pending)
            .cloned()
    }

    /// Drop the acknowledged prefix and apply the age ceiling.
    ///
    /// Never removes a non-acknowledged entry except through a reported
    /// age eviction.
    pub async fn compact(&self) -> Result<CompactionReport, LogError> {
        let mut inner = self.inner.lock().await;

        let mut removed = pop_acknowledged_prefix(&mut inner.entries);

        let mut evicted = Vec::new();
        if let Some(max_age) = self.retention.max_age {
            let cutoff = chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age));

            if let Some(cutoff) = cutoff {
                inner.entries.retain(|e| {
                    let expired =
                        e.state == EntryState::Pending && e.reading.timestamp() < cutoff;
                    if expired {
                        evicted.push(e.sequence);
                    }
                    !expired
                });
            }
        }

        if !evicted.is_empty() {
            self.report_eviction(&mut inner, evicted.clone(), EvictionReason::AgeCeiling);
            removed += pop_acknowledged_prefix(&mut inner.entries);
        }

        inner.stats.compacted += removed as u64;

        if removed > 0 || !evicted.is_empty() || inner.stale_lines > 0 || inner.needs_rewrite {
            self.rewrite_locked(&mut inner).await?;
            debug!(removed, remaining = inner.entries.len(), "Log compacted");
        }

        Ok(CompactionReport {
            removed,
            evicted,
            remaining: inner.entries.len(),
        })
    }

    /// Subscribe to capacity-exceeded events.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.evictions.subscribe()
    }

    /// Snapshot of every entry currently held.
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().await.entries.iter().cloned().collect()
    }

    pub async fn get(&self, sequence: u64) -> Option<LogEntry> {
        let inner = self.inner.lock().await;
        find_index(&inner.entries, sequence)
            .ok()
            .map(|i| inner.entries[i].clone())
    }

    /// Number of entries held, including acknowledged ones not yet compacted.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Entries not yet acknowledged (pending or inflight).
    pub async fn undelivered_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.state != EntryState::Acknowledged)
            .count()
    }

    /// Sequence number the next append will receive.
    pub async fn next_sequence(&self) -> u64 {
        self.inner.lock().await.next_sequence
    }

    pub async fn stats(&self) -> LogStats {
        self.inner.lock().await.stats.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Write one record line, rewriting the file first if a previous write failed.
    async fn write_locked(
        &self,
        inner: &mut LogInner,
        entry: &LogEntry,
        sync: bool,
    ) -> Result<(), LogError> {
        if inner.needs_rewrite {
            self.rewrite_locked(inner).await?;
        }

        let mut line = serde_json::to_string(&LogRecord::from(entry))?;
        line.push('\n');

        let result = async {
            inner.file.write_all(line.as_bytes()).await?;
            inner.file.flush().await?;
            if sync {
                inner.file.sync_data().await?;
            }
            Ok::<(), io::Error>(())
        }
        .await;

        if let Err(e) = result {
            inner.needs_rewrite = true;
            return Err(LogError::Io(e));
        }
        Ok(())
    }

    /// Replace the file with one line per held entry and persist the watermark.
    async fn rewrite_locked(&self, inner: &mut LogInner) -> Result<(), LogError> {
        write_watermark(&self.watermark_path, inner.next_sequence - 1).await?;

        let mut contents = String::new();
        for entry in &inner.entries {
            contents.push_str(&serde_json::to_string(&LogRecord::from(entry))?);
            contents.push('\n');
        }

        let tmp = sidecar_path(&self.path, ".tmp");
        let mut file = File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        sync_parent_dir(&self.path).await?;

        inner.file = open_append(&self.path).await?;
        inner.stale_lines = 0;
        inner.needs_rewrite = false;
        Ok(())
    }

    /// Bring the entry count back under the ceiling after an append.
    async fn enforce_entry_ceiling(&self, inner: &mut LogInner) {
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.state != EntryState::Acknowledged);
        let dropped = before - inner.entries.len();
        inner.stats.compacted += dropped as u64;

        let mut evicted = Vec::new();
        while inner.entries.len() > self.retention.max_entries {
            // inflight entries belong to the publisher; skip them
            let Some(index) = inner
                .entries
                .iter()
                .position(|e| e.state == EntryState::Pending)
            else {
                break;
            };
            if let Some(entry) = inner.entries.remove(index) {
                evicted.push(entry.sequence);
            }
        }

        let any_evicted = !evicted.is_empty();
        if any_evicted {
            self.report_eviction(inner, evicted, EvictionReason::EntryCeiling);
        }

        if dropped > 0 || any_evicted {
            if let Err(e) = self.rewrite_locked(inner).await {
                // memory is already trimmed; the file catches up on the next write
                warn!(error = %e, "Failed to rewrite log after enforcing retention ceiling");
                inner.needs_rewrite = true;
            }
        }
    }

    fn report_eviction(&self, inner: &mut LogInner, sequences: Vec<u64>, reason: EvictionReason) {
        inner.stats.evicted += sequences.len() as u64;

        let first_sequence = sequences.first().copied().unwrap_or_default();
        let last_sequence = sequences.last().copied().unwrap_or_default();
        match reason {
            EvictionReason::EntryCeiling => warn!(
                event = "log_capacity_exceeded",
                evicted = sequences.len(),
                first_sequence,
                last_sequence,
                reason = ?reason,
                max_entries = self.retention.max_entries,
                "Retention ceiling exceeded: evicting undelivered readings"
            ),
            EvictionReason::AgeCeiling => warn!(
                event = "log_capacity_exceeded",
                evicted = sequences.len(),
                first_sequence,
                last_sequence,
                reason = ?reason,
                max_age_secs = self.retention.max_age.map(|age| age.as_secs()).unwrap_or_default(),
                "Retention ceiling exceeded: evicting undelivered readings"
            ),
        }

        // no subscribers is fine; the warning above is the record of last resort
        let _ = self.evictions.send(Eviction { sequences, reason });
    }
}

struct Replay {
    entries: VecDeque<LogEntry>,
    stale_lines: usize,
    skipped_lines: u64,

    /// False when the file had unreadable lines or lacked a final newline
    clean: bool,
}

async fn replay(path: &Path) -> Result<Replay, LogError> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(LogError::Io(e)),
    };

    let mut latest: BTreeMap<u64, LogEntry> = BTreeMap::new();
    let mut lines = 0usize;
    let mut skipped_lines = 0u64;

    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let parsed = serde_json::from_str::<serde_json::Value>(line)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                validate_payload(&value).map_err(|e| e.to_string())?;
                serde_json::from_value::<LogRecord>(value).map_err(|e| e.to_string())
            })
            .and_then(|record| {
                Reading::try_from(record.payload)
                    .map(|reading| (record.sequence, record.state, reading))
                    .map_err(|e| e.to_string())
            });

        match parsed {
            Ok((sequence, state, reading)) => {
                lines += 1;
                latest.insert(
                    sequence,
                    LogEntry {
                        sequence,
                        reading,
                        state,
                    },
                );
            }
            Err(e) => {
                warn!(line = number + 1, error = %e, "Skipping unreadable log line");
                skipped_lines += 1;
            }
        }
    }

    let entries: VecDeque<LogEntry> = latest
        .into_values()
        .map(|mut entry| {
            if entry.state == EntryState::Inflight {
                entry.state = EntryState::Pending;
            }
            entry
        })
        .collect();

    let clean = skipped_lines == 0 && (contents.is_empty() || contents.ends_with('\n'));

    Ok(Replay {
        stale_lines: lines - entries.len(),
        entries,
        skipped_lines,
        clean,
    })
}

fn find_index(entries: &VecDeque<LogEntry>, sequence: u64) -> Result<usize, LogError> {
    entries
        .binary_search_by_key(&sequence, |e| e.sequence)
        .map_err(|_| LogError::UnknownSequence(sequence))
}

fn find_mut(entries: &mut VecDeque<LogEntry>, sequence: u64) -> Result<&mut LogEntry, LogError> {
    let index = find_index(entries, sequence)?;
    Ok(&mut entries[index])
}

fn pop_acknowledged_prefix(entries: &mut VecDeque<LogEntry>) -> usize {
    let mut removed = 0;
    while entries
        .front()
        .is_some_and(|e| e.state == EntryState::Acknowledged)
    {
        entries.pop_front();
        removed += 1;
    }
    removed
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn open_append(path: &Path) -> Result<File, LogError> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

async fn read_watermark(path: &Path) -> Result<u64, LogError> {
    match fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .find_map(|line| line.trim().strip_prefix("high_water:"))
            .ok_or_else(|| LogError::Corrupt(format!("{}: missing high_water", path.display())))?
            .parse::<u64>()
            .map_err(|e| LogError::Corrupt(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(LogError::Io(e)),
    }
}

async fn write_watermark(path: &Path, high_water: u64) -> Result<(), LogError> {
    let tmp = sidecar_path(path, ".tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(format!("high_water:{}\n", high_water).as_bytes())
        .await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    sync_parent_dir(path).await
}

/// Make a rename inside the log's directory durable.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<(), LogError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<(), LogError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(temperature: f64) -> Reading {
        Reading::now("edge-node-001", "dht22-0", temperature, 50.0).unwrap()
    }

    async fn open(dir: &tempfile::TempDir, retention: RetentionPolicy) -> DurableLog {
        DurableLog::open(dir.path().join("log.jsonl"), retention)
            .await
            .expect("open log")
    }

    async fn deliver(log: &DurableLog, sequence: u64) {
        log.mark_inflight(sequence).await.unwrap();
        log.mark_acknowledged(sequence).await.unwrap();
    }

    fn sequences(entries: &[LogEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence).collect()
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequences() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;

        for i in 0..3 {
            let seq = log.append(reading(20.0 + i as f64)).await.unwrap();
            assert_eq!(seq, i + 1);
        }

        let pending = log.iterate_pending().await;
        assert_eq!(sequences(&pending), vec![1, 2, 3]);
        assert!(pending.iter().all(|e| e.state == EntryState::Pending));
        assert_eq!(log.stats().await.appended, 3);
    }

    #[tokio::test]
    async fn test_persisted_lines_are_payload_plus_bookkeeping() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        log.append(reading(21.5)).await.unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        validate_payload(&value).expect("line validates as payload");
        assert_eq!(value["sequence"], 1);
        assert_eq!(value["state"], "pending");
        assert_eq!(value["temperature_C"], 21.5);
    }

    #[tokio::test]
    async fn test_mark_inflight_is_idempotent() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        let seq = log.append(reading(20.0)).await.unwrap();

        log.mark_inflight(seq).await.unwrap();
        log.mark_inflight(seq).await.unwrap();
        assert_eq!(log.get(seq).await.unwrap().state, EntryState::Inflight);
    }

    #[tokio::test]
    async fn test_acknowledge_requires_inflight() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        let seq = log.append(reading(20.0)).await.unwrap();

        let err = log.mark_acknowledged(seq).await.unwrap_err();
        assert!(matches!(
            err,
            LogError::InvalidTransition {
                from: EntryState::Pending,
                to: EntryState::Acknowledged,
                ..
            }
        ));

        deliver(&log, seq).await;
        assert!(log.mark_acknowledged(seq).await.is_err());
        assert!(log.mark_inflight(seq).await.is_err());
        assert!(log.revert_to_pending(seq).await.is_err());
        assert_eq!(log.stats().await.acknowledged, 1);
    }

    #[tokio::test]
    async fn test_revert_to_pending() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        let seq = log.append(reading(20.0)).await.unwrap();

        log.mark_inflight(seq).await.unwrap();
        assert!(log.next_pending().await.is_none());

        log.revert_to_pending(seq).await.unwrap();
        assert_eq!(log.get(seq).await.unwrap().state, EntryState::Pending);
        assert_eq!(log.next_pending().await.unwrap().sequence, seq);
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;

        assert!(matches!(
            log.mark_inflight(42).await,
            Err(LogError::UnknownSequence(42))
        ));
    }

    #[tokio::test]
    async fn test_next_pending_does_not_skip_inflight_head() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        log.append(reading(20.0)).await.unwrap();
        log.append(reading(21.0)).await.unwrap();

        log.mark_inflight(1).await.unwrap();
        assert!(log.next_pending().await.is_none());

        log.mark_acknowledged(1).await.unwrap();
        assert_eq!(log.next_pending().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_restart_recovers_unacknowledged_as_pending() {
        let dir = tempfile::tempdir().expect("tmp dir");
        {
            let log = open(&dir, RetentionPolicy::default()).await;
            for t in [20.0, 21.0, 22.0] {
                log.append(reading(t)).await.unwrap();
            }
            log.mark_inflight(1).await.unwrap();
            deliver(&log, 2).await;
        }

        let log = open(&dir, RetentionPolicy::default()).await;
        let entries = log.entries().await;

        assert_eq!(sequences(&entries), vec![1, 2, 3]);
        assert_eq!(entries[0].state, EntryState::Pending);
        assert_eq!(entries[1].state, EntryState::Acknowledged);
        assert_eq!(entries[2].state, EntryState::Pending);
        assert_eq!(entries[0].reading.temperature_c(), 20.0);
        assert_eq!(sequences(&log.iterate_pending().await), vec![1, 3]);
        assert_eq!(log.next_sequence().await, 4);
        assert_eq!(log.stats().await.recovered, 2);
    }

    #[tokio::test]
    async fn test_compact_removes_only_acknowledged_prefix() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        for t in [20.0, 21.0, 22.0] {
            log.append(reading(t)).await.unwrap();
        }
        deliver(&log, 1).await;
        deliver(&log, 3).await;

        let report = log.compact().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(report.remaining, 2);
        assert_eq!(sequences(&log.entries().await), vec![2, 3]);

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_sequence_survives_full_compaction() {
        let dir = tempfile::tempdir().expect("tmp dir");
        {
            let log = open(&dir, RetentionPolicy::default()).await;
            for t in [20.0, 21.0, 22.0] {
                let seq = log.append(reading(t)).await.unwrap();
                deliver(&log, seq).await;
            }
            log.compact().await.unwrap();
            assert!(log.is_empty().await);
        }

        let log = open(&dir, RetentionPolicy::default()).await;
        assert!(log.is_empty().await);
        assert_eq!(log.append(reading(23.0)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unreadable_sequence_file_falls_back_to_log() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("log.jsonl");
        {
            let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
            log.append(reading(20.0)).await.unwrap();
            log.append(reading(21.0)).await.unwrap();
        }
        std::fs::write(sidecar_path(&path, ".seq"), "").unwrap();

        let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
        assert_eq!(sequences(&log.iterate_pending().await), vec![1, 2]);
        assert_eq!(log.append(reading(22.0)).await.unwrap(), 3);
        drop(log);

        // the sequence file was repaired on open
        let watermark = std::fs::read_to_string(sidecar_path(&path, ".seq")).unwrap();
        assert!(watermark.starts_with("high_water:"));
    }

    #[tokio::test]
    async fn test_entry_ceiling_evicts_oldest_pending() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::new(3, None)).await;
        let mut evictions = log.subscribe_evictions();

        for t in [20.0, 21.0, 22.0, 23.0, 24.0] {
            log.append(reading(t)).await.unwrap();
        }

        let mut evicted = Vec::new();
        while let Ok(eviction) = evictions.try_recv() {
            assert_eq!(eviction.reason, EvictionReason::EntryCeiling);
            evicted.extend(eviction.sequences);
        }
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(sequences(&log.iterate_pending().await), vec![3, 4, 5]);
        assert_eq!(log.stats().await.evicted, 2);

        drop(log);
        let reopened = open(&dir, RetentionPolicy::new(3, None)).await;
        assert_eq!(sequences(&reopened.entries().await), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_entry_ceiling_drops_acknowledged_first() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::new(3, None)).await;
        let mut evictions = log.subscribe_evictions();

        for t in [20.0, 21.0, 22.0] {
            log.append(reading(t)).await.unwrap();
        }
        deliver(&log, 2).await;
        log.append(reading(23.0)).await.unwrap();

        assert!(evictions.try_recv().is_err());
        assert_eq!(sequences(&log.entries().await), vec![1, 3, 4]);
        assert_eq!(log.stats().await.evicted, 0);
    }

    #[tokio::test]
    async fn test_entry_ceiling_never_evicts_inflight() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::new(2, None)).await;

        log.append(reading(20.0)).await.unwrap();
        log.append(reading(21.0)).await.unwrap();
        log.mark_inflight(1).await.unwrap();
        log.append(reading(22.0)).await.unwrap();

        assert_eq!(sequences(&log.entries().await), vec![1, 3]);
        assert_eq!(log.get(1).await.unwrap().state, EntryState::Inflight);
    }

    #[tokio::test]
    async fn test_age_ceiling_evicts_on_compact() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(
            &dir,
            RetentionPolicy::new(100, Some(Duration::from_secs(3600))),
        )
        .await;
        let mut evictions = log.subscribe_evictions();

        let stale = Reading::new(
            "edge-node-001",
            "dht22-0",
            Utc::now() - chrono::Duration::hours(2),
            19.0,
            40.0,
        )
        .unwrap();
        log.append(stale).await.unwrap();
        log.append(reading(20.0)).await.unwrap();

        let report = log.compact().await.unwrap();
        assert_eq!(report.evicted, vec![1]);
        assert_eq!(report.remaining, 1);

        let eviction = evictions.try_recv().expect("eviction event");
        assert_eq!(eviction.reason, EvictionReason::AgeCeiling);
        assert_eq!(eviction.sequences, vec![1]);
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped_and_rewritten() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("log.jsonl");
        {
            let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
            log.append(reading(20.0)).await.unwrap();
        }

        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str(r#"{"timestamp":"2025-08-06T22:11:03Z","timesta"#);
        std::fs::write(&path, contents).unwrap();

        let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
        assert_eq!(log.stats().await.skipped_lines, 1);
        assert_eq!(log.append(reading(21.0)).await.unwrap(), 2);
        drop(log);

        let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
        assert_eq!(log.stats().await.skipped_lines, 0);
        assert_eq!(sequences(&log.entries().await), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_invalid_payload_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("log.jsonl");
        {
            let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
            log.append(reading(20.0)).await.unwrap();
        }

        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str(concat!(
            r#"{"timestamp":"2025-08-06T22:11:03Z","timestamp_ms":"2025-08-06T22:11:03.123Z","#,
            r#""temperature_C":"warm","humidity":50.0,"device_id":"edge-node-001","#,
            r#""sensor_id":"dht22-0","sequence":2,"state":"pending"}"#,
            "\n"
        ));
        std::fs::write(&path, contents).unwrap();

        let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
        assert_eq!(log.stats().await.skipped_lines, 1);
        assert_eq!(sequences(&log.entries().await), vec![1]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rewrite_syncs_directory() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("log.jsonl");

        sync_parent_dir(&path).await.unwrap();
        // a bare file name lives in the working directory
        sync_parent_dir(Path::new("log.jsonl")).await.unwrap();
        assert!(sync_parent_dir(&dir.path().join("missing").join("log.jsonl"))
            .await
            .is_err());

        let log = DurableLog::open(&path, RetentionPolicy::default()).await.unwrap();
        let seq = log.append(reading(20.0)).await.unwrap();
        deliver(&log, seq).await;
        log.compact().await.unwrap();
        assert!(!sidecar_path(&path, ".tmp").exists());
        assert!(!sidecar_path(&sidecar_path(&path, ".seq"), ".tmp").exists());
    }

    #[tokio::test]
    async fn test_revert_all_inflight() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let log = open(&dir, RetentionPolicy::default()).await;
        log.append(reading(20.0)).await.unwrap();
        log.append(reading(21.0)).await.unwrap();
        log.mark_inflight(1).await.unwrap();

        assert_eq!(log.revert_all_inflight().await, 1);
        assert_eq!(log.undelivered_count().await, 2);
        assert_eq!(sequences(&log.iterate_pending().await), vec![1, 2]);
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("data/sensor_log.jsonl"), ".seq"),
            PathBuf::from("data/sensor_log.jsonl.seq")
        );
    }
}
