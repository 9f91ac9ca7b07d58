#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Record shapes, progress samples, and ingestion report types.
//!
//! Shared between the database crate (which knows how to bind records to
//! `INSERT` statements), the ingest pipeline (which produces them), and
//! the CLI utilities (which render progress).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default file name of the locations dataset.
pub const LOCATIONS_FILENAME: &str = "weather_big_locations.csv";

/// Default file name of the conditions dataset.
pub const CONDITIONS_FILENAME: &str = "weather_big_conditions.csv";

/// The two datasets the loader knows about, in the order they are ingested.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Dataset {
    /// Device location registrations.
    Locations,
    /// Time-stamped temperature/humidity readings.
    Conditions,
}

impl Dataset {
    /// Number of CSV fields a row of this dataset must have. Rows with any
    /// other field count are skipped.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Locations => 3,
            Self::Conditions => 4,
        }
    }

    /// Target table name.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Locations => "locations",
            Self::Conditions => "conditions",
        }
    }

    /// File name used when no explicit path is configured.
    #[must_use]
    pub const fn default_filename(self) -> &'static str {
        match self {
            Self::Locations => LOCATIONS_FILENAME,
            Self::Conditions => CONDITIONS_FILENAME,
        }
    }
}

/// A device registration: which device sits where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Device identifier. Not unique; inserts are append-only.
    pub device_id: String,
    /// Free-form location name.
    pub location: String,
    /// Environment label (e.g. `inside`, `outside`).
    pub environment: String,
}

/// A single sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRecord {
    /// Reading time. The Unix epoch unless [`TimestampMode::Parse`] is set.
    pub time: DateTime<Utc>,
    /// Device that produced the reading.
    pub device_id: String,
    /// Temperature reading.
    pub temperature: f64,
    /// Relative humidity reading.
    pub humidity: f64,
}

/// How the first field of a conditions row is turned into
/// [`ConditionRecord::time`].
///
/// [`Self::Zero`] ignores the field and stores the zero instant for every
/// reading, which is what existing tables contain. [`Self::Parse`] reads
/// the field as a timestamp.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimestampMode {
    /// Ignore the first field and store the Unix epoch.
    #[default]
    Zero,
    /// Parse the first field (RFC 3339 or `YYYY-MM-DD HH:MM:SS[.f]`).
    Parse,
}

/// What to do when concurrently dispatched batches fail to insert.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the file (and therefore the run) once all units have joined.
    #[default]
    Abort,
    /// Finish the file and return the failures in the [`IngestReport`].
    Report,
}

/// Point-in-time progress report for one file.
///
/// Counters are captured when the batch is dispatched, not when its insert
/// finishes, so samples emitted by concurrent units may arrive out of
/// order but each one is internally consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// Which dataset this file belongs to.
    pub dataset: Dataset,
    /// Path of the file being ingested, as given.
    pub filename: String,
    /// Structurally valid records read up to and including this batch.
    pub records_processed: u64,
    /// Bytes consumed from the file at dispatch time.
    pub bytes_read: u64,
    /// Total file size from `stat`.
    pub total_bytes: u64,
    /// Time since the file's ingestion started, measured at report time.
    pub elapsed: Duration,
    /// `bytes_read / total_bytes` as a percentage.
    pub percent_complete: f64,
}

impl ProgressSample {
    /// Records per second over [`Self::elapsed`].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records_processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Returns `bytes_read` as a percentage of `total_bytes`.
///
/// An empty file counts as fully consumed.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent_of(bytes_read: u64, total_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 100.0;
    }
    bytes_read as f64 / total_bytes as f64 * 100.0
}

/// A concurrently inserted batch that did not make it into the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// 1-based batch sequence number within the file.
    pub batch: u64,
    /// Number of records in the batch (none of which were committed).
    pub rows: usize,
    /// Rendered error.
    pub message: String,
}

/// Outcome of ingesting a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Which dataset was ingested.
    pub dataset: Dataset,
    /// Path of the ingested file.
    pub filename: String,
    /// Structurally valid records read from the file.
    pub records_processed: u64,
    /// Rows committed to the target table.
    pub rows_inserted: u64,
    /// Batches handed to an inserter, including the trailing partial one.
    pub batches_dispatched: u64,
    /// Concurrent batches whose insert failed.
    pub failures: Vec<BatchFailure>,
    /// Wall-clock time for the whole file.
    pub elapsed: Duration,
}

impl IngestReport {
    /// Returns `true` when every dispatched batch was committed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a full run over both datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    /// Report for the locations file.
    pub locations: IngestReport,
    /// Report for the conditions file.
    pub conditions: IngestReport,
}

/// Receives progress samples from the ingestion pipeline.
///
/// Implementations must be `Send + Sync`: samples for full batches are
/// reported from the insertion unit's own task.
pub trait ProgressCallback: Send + Sync {
    /// Called once per successfully inserted batch.
    fn report(&self, sample: &ProgressSample);

    /// Called before the first record of a file is read.
    fn file_started(&self, _dataset: Dataset, _filename: &str, _total_bytes: u64) {}

    /// Called after every unit for a file has joined.
    fn file_finished(&self, _report: &IngestReport) {}
}

/// A [`ProgressCallback`] that ignores everything.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn report(&self, _sample: &ProgressSample) {}
}

/// Returns a shared [`NullProgress`] instance.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
