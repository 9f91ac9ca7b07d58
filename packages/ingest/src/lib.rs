#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Concurrent batched loader for the weather locations and conditions
//! datasets.
//!
//! Each file is read sequentially by one driving flow. Records are grouped
//! into fixed-size batches; every full batch is inserted by its own
//! blocking task behind an [`AdmissionGate`] that bounds how many run at
//! once. Progress samples are delivered to a [`ProgressCallback`] after
//! each successful insert.

pub mod batch;
pub mod count;
pub mod gate;
pub mod parse;
mod pipeline;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use weather_load_database::bulk::CHUNK_SIZE;
use weather_load_database::{Database, DbError, InsertError, paths};
use weather_load_ingest_models::{
    ConditionRecord, Dataset, FailurePolicy, IngestReport, IngestSummary, LocationRecord,
    ProgressCallback, TimestampMode,
};

pub use gate::{AdmissionGate, MAX_CONCURRENCY};

/// Records per batch when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Errors that stop the ingestion of a single file.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input file could not be opened or stat'ed.
    #[error("failed to access {}: {source}", path.display())]
    FileAccess {
        /// Path as given.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The CSV stream could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Path as given.
        path: PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// A typed field did not parse.
    #[error("line {line}: invalid {field} {value:?}: {reason}")]
    MalformedRow {
        /// 1-based line number in the file.
        line: u64,
        /// Name of the offending field.
        field: &'static str,
        /// Raw field text.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Cancellation fired while waiting for an insertion slot.
    #[error("cancelled while waiting for an insertion slot")]
    AdmissionCancelled,

    /// The trailing partial batch failed to insert.
    #[error(transparent)]
    Insert(#[from] InsertError),

    /// One or more concurrently inserted batches failed.
    #[error("{failed} of {total} batch(es) failed; first: {first}")]
    BatchesFailed {
        /// Number of failed batches.
        failed: usize,
        /// Number of batches dispatched for the file.
        total: u64,
        /// First failure collected by the join step.
        #[source]
        first: InsertError,
    },

    /// The configured batch size is zero.
    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    /// An insertion task panicked or was aborted.
    #[error("insertion task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A connection could not be obtained.
    #[error(transparent)]
    Database(#[from] DbError),
}

/// A [`PipelineError`] tagged with the dataset being ingested when it
/// happened.
#[derive(Debug, thiserror::Error)]
#[error("ingest {phase}: {source}")]
pub struct IngestError {
    /// Dataset whose ingestion failed.
    pub phase: Dataset,
    /// What went wrong.
    #[source]
    pub source: PipelineError,
}

impl IngestError {
    const fn new(phase: Dataset, source: PipelineError) -> Self {
        Self { phase, source }
    }
}

/// Knobs for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Records per batch. Must be at least 1.
    pub batch_size: usize,
    /// Rows per multi-row `INSERT` statement.
    pub chunk_size: usize,
    /// How the conditions `time` field is handled.
    pub timestamp_mode: TimestampMode,
    /// What to do when concurrently inserted batches fail.
    pub failure_policy: FailurePolicy,
    /// Path of the locations file.
    pub locations_path: PathBuf,
    /// Path of the conditions file.
    pub conditions_path: PathBuf,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::new(&paths::data_dir(), DEFAULT_BATCH_SIZE)
    }
}

impl IngestOptions {
    /// Options reading the default file names from `data_dir`.
    #[must_use]
    pub fn new(data_dir: &Path, batch_size: usize) -> Self {
        Self {
            batch_size,
            chunk_size: CHUNK_SIZE,
            timestamp_mode: TimestampMode::default(),
            failure_policy: FailurePolicy::default(),
            locations_path: data_dir.join(Dataset::Locations.default_filename()),
            conditions_path: data_dir.join(Dataset::Conditions.default_filename()),
        }
    }

    /// Path configured for `dataset`.
    #[must_use]
    pub fn path(&self, dataset: Dataset) -> &Path {
        match dataset {
            Dataset::Locations => &self.locations_path,
            Dataset::Conditions => &self.conditions_path,
        }
    }

    /// Returns the validated batch size.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidBatchSize`] if it is zero.
    pub fn batch_size(&self) -> Result<NonZeroUsize, PipelineError> {
        NonZeroUsize::new(self.batch_size).ok_or(PipelineError::InvalidBatchSize)
    }
}

/// Ingests the locations file, then the conditions file.
///
/// Each file is completely finished, every insertion unit joined, before
/// the next one starts. Both files share one [`AdmissionGate`] of
/// [`MAX_CONCURRENCY`] slots owned by this call.
///
/// # Errors
///
/// Returns the first [`IngestError`]; the conditions file is not touched
/// if the locations file fails.
pub async fn ingest_all(
    db: &Database,
    options: &IngestOptions,
    progress: &Arc<dyn ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<IngestSummary, IngestError> {
    let gate = AdmissionGate::new(MAX_CONCURRENCY);

    let locations = ingest_locations(
        db,
        &options.locations_path,
        &gate,
        options,
        progress,
        cancel,
    )
    .await?;

    let conditions = ingest_conditions(
        db,
        &options.conditions_path,
        &gate,
        options,
        progress,
        cancel,
    )
    .await?;

    log::info!(
        "Ingested {} location(s) and {} condition(s), peak {} concurrent insert(s)",
        locations.rows_inserted,
        conditions.rows_inserted,
        gate.peak(),
    );

    Ok(IngestSummary {
        locations,
        conditions,
    })
}

/// Ingests a locations file into the `locations` table.
///
/// # Errors
///
/// Returns [`IngestError`] with phase [`Dataset::Locations`] on any
/// [`PipelineError`].
pub async fn ingest_locations(
    db: &Database,
    path: &Path,
    gate: &AdmissionGate,
    options: &IngestOptions,
    progress: &Arc<dyn ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<IngestReport, IngestError> {
    pipeline::ingest_file::<LocationRecord>(db, path, gate, options, progress, cancel)
        .await
        .map_err(|e| IngestError::new(Dataset::Locations, e))
}

/// Ingests a conditions file into the `conditions` table.
///
/// # Errors
///
/// Returns [`IngestError`] with phase [`Dataset::Conditions`] on any
/// [`PipelineError`].
pub async fn ingest_conditions(
    db: &Database,
    path: &Path,
    gate: &AdmissionGate,
    options: &IngestOptions,
    progress: &Arc<dyn ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<IngestReport, IngestError> {
    pipeline::ingest_file::<ConditionRecord>(db, path, gate, options, progress, cancel)
        .await
        .map_err(|e| IngestError::new(Dataset::Conditions, e))
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;
    use std::sync::Mutex;

    use weather_load_database::{InsertStage, SessionOptions, schema};
    use weather_load_ingest_models::{ProgressSample, null_progress};

    use super::*;

    /// Collects every sample it is given.
    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<ProgressSample>>,
        finished: Mutex<Vec<IngestReport>>,
    }

    impl ProgressCallback for Recorder {
        fn report(&self, sample: &ProgressSample) {
            self.samples.lock().unwrap().push(sample.clone());
        }

        fn file_finished(&self, report: &IngestReport) {
            self.finished.lock().unwrap().push(report.clone());
        }
    }

    impl Recorder {
        fn samples(&self) -> Vec<ProgressSample> {
            self.samples.lock().unwrap().clone()
        }
    }

    /// Holds every unit's slot a little longer by reporting slowly.
    struct SlowProgress;

    impl ProgressCallback for SlowProgress {
        fn report(&self, _sample: &ProgressSample) {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("weather_load_ingest_tests")
            .join(format!("{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn locations_csv(rows: usize) -> String {
        let mut out = String::new();
        for i in 0..rows {
            writeln!(out, "weather-pro-{i:06},field-{i},outside").unwrap();
        }
        out
    }

    fn conditions_csv(rows: usize) -> String {
        let mut out = String::new();
        for i in 0..rows {
            writeln!(
                out,
                "2016-11-15 12:00:00-06,weather-pro-{i:06},{}.5,{}.25",
                i % 40,
                i % 100
            )
            .unwrap();
        }
        out
    }

    fn memory_db() -> Database {
        let db = Database::open_in_memory(&SessionOptions::default()).unwrap();
        schema::create_tables(&db.connect().unwrap()).unwrap();
        db
    }

    fn count(db: &Database, dataset: Dataset) -> u64 {
        schema::row_count(&db.connect().unwrap(), dataset).unwrap()
    }

    fn options(dir: &Path, batch_size: usize) -> IngestOptions {
        IngestOptions::new(dir, batch_size)
    }

    async fn locations(
        db: &Database,
        path: &Path,
        batch_size: usize,
        progress: &Arc<dyn ProgressCallback>,
    ) -> Result<IngestReport, IngestError> {
        let gate = AdmissionGate::default();
        let options = options(path.parent().unwrap(), batch_size);
        ingest_locations(db, path, &gate, &options, progress, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn three_row_example_lands_in_one_batch() {
        let dir = test_dir("three_rows");
        let path = write_file(
            &dir,
            "locations.csv",
            "weather-pro-000000,field-000000,outside\n\
             weather-pro-000001,arctic-000000,outside\n\
             weather-pro-000002,door-00000,inside\n",
        );
        let db = memory_db();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        let report = locations(&db, &path, 10, &progress).await.unwrap();

        assert_eq!(report.records_processed, 3);
        assert_eq!(report.rows_inserted, 3);
        assert_eq!(report.batches_dispatched, 1);
        assert!(report.is_complete());
        assert_eq!(count(&db, Dataset::Locations), 3);

        let samples = recorder.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].records_processed, 3);
        assert!((samples[0].percent_complete - 100.0).abs() < f64::EPSILON);
        assert_eq!(recorder.finished.lock().unwrap().len(), 1);

        let conn = db.connect().unwrap();
        let env: String = conn
            .query_row(
                "SELECT environment FROM locations WHERE device_id = 'weather-pro-000002'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(env, "inside");
    }

    #[tokio::test]
    async fn short_row_between_valid_rows_is_never_inserted() {
        let dir = test_dir("short_row_example");
        let path = write_file(&dir, "locations.csv", "d1,loc1,env1\nd9,loc9\nd2,loc2,env2\n");
        let db = memory_db();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        let report = locations(&db, &path, 10, &progress).await.unwrap();

        assert_eq!(report.batches_dispatched, 1);
        assert_eq!(report.rows_inserted, 2);
        assert_eq!(recorder.samples()[0].records_processed, 2);

        let conn = db.connect().unwrap();
        let mut stmt = conn
            .prepare("SELECT device_id, location, environment FROM locations ORDER BY device_id")
            .unwrap();
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            rows,
            vec![
                ("d1".to_string(), "loc1".to_string(), "env1".to_string()),
                ("d2".to_string(), "loc2".to_string(), "env2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn partial_tail_batch_is_flushed() {
        let dir = test_dir("partial_tail");
        let path = write_file(&dir, "locations.csv", &locations_csv(23));
        let db = memory_db();

        let report = locations(&db, &path, 5, &null_progress()).await.unwrap();

        assert_eq!(report.batches_dispatched, 5);
        assert_eq!(report.rows_inserted, 23);
        assert_eq!(count(&db, Dataset::Locations), 23);
    }

    #[tokio::test]
    async fn exact_multiple_dispatches_only_full_batches() {
        let dir = test_dir("exact_multiple");
        let path = write_file(&dir, "locations.csv", &locations_csv(20));
        let db = memory_db();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        let report = locations(&db, &path, 5, &progress).await.unwrap();

        assert_eq!(report.batches_dispatched, 4);
        assert_eq!(count(&db, Dataset::Locations), 20);
        assert_eq!(recorder.samples().len(), 4);
    }

    #[tokio::test]
    async fn rows_skipped_after_the_last_batch_still_reach_100_percent() {
        let dir = test_dir("trailing_skipped");
        let mut contents = locations_csv(2);
        for i in 0..4_000 {
            writeln!(contents, "short-{i:06},row").unwrap();
        }
        let path = write_file(&dir, "locations.csv", &contents);
        let db = memory_db();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        let report = locations(&db, &path, 2, &progress).await.unwrap();

        assert_eq!(report.batches_dispatched, 1);
        assert_eq!(report.records_processed, 2);

        let samples = recorder.samples();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].percent_complete < 100.0);
        assert_eq!(samples[1].records_processed, 2);
        assert_eq!(samples[1].bytes_read, contents.len() as u64);
        assert!((samples[1].percent_complete - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn skipped_rows_are_not_counted() {
        let dir = test_dir("skipped_rows");
        let path = write_file(&dir, "locations.csv", "a,b,c\nshort,row\na,b,c,d\nx,y,z\n");
        let db = memory_db();

        let report = locations(&db, &path, 10, &null_progress()).await.unwrap();

        assert_eq!(report.records_processed, 2);
        assert_eq!(count(&db, Dataset::Locations), 2);
    }

    #[tokio::test]
    async fn empty_file_inserts_nothing() {
        let dir = test_dir("empty_file");
        let path = write_file(&dir, "locations.csv", "");
        let db = memory_db();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        let report = locations(&db, &path, 10, &progress).await.unwrap();

        assert_eq!(report.batches_dispatched, 0);
        assert!(recorder.samples().is_empty());
        assert_eq!(count(&db, Dataset::Locations), 0);
    }

    #[tokio::test]
    async fn malformed_number_aborts_after_earlier_batches_commit() {
        let dir = test_dir("malformed");
        let path = write_file(
            &dir,
            "conditions.csv",
            "t,d1,1.0,2.0\nt,d2,3.0,4.0\nt,d3,warm,5.0\nt,d4,6.0,7.0\n",
        );
        let db = memory_db();
        let gate = AdmissionGate::default();
        let options = options(&dir, 1);

        let err = ingest_conditions(
            &db,
            &path,
            &gate,
            &options,
            &null_progress(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.phase, Dataset::Conditions);
        assert!(matches!(
            err.source,
            PipelineError::MalformedRow {
                line: 3,
                field: "temperature",
                ..
            }
        ));
        assert!(err.to_string().starts_with("ingest conditions: line 3"));
        // The two batches dispatched before the bad row were joined.
        assert_eq!(count(&db, Dataset::Conditions), 2);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_units_never_exceed_the_limit() {
        let dir = test_dir("concurrency");
        let path = write_file(&dir, "locations.csv", &locations_csv(200));
        let db = memory_db();
        let gate = AdmissionGate::default();
        let options = options(&dir, 2);
        let progress: Arc<dyn ProgressCallback> = Arc::new(SlowProgress);

        let report = ingest_locations(
            &db,
            &path,
            &gate,
            &options,
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.batches_dispatched, 100);
        assert_eq!(count(&db, Dataset::Locations), 200);
        assert_eq!(gate.peak(), MAX_CONCURRENCY);
        assert_eq!(gate.in_flight(), 0);

        let conn = db.connect().unwrap();
        let distinct: i64 = conn
            .query_row("SELECT COUNT(DISTINCT device_id) FROM locations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(distinct, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn progress_is_monotonic_and_ends_at_100() {
        let dir = test_dir("progress");
        let path = write_file(&dir, "locations.csv", &locations_csv(53));
        let db = memory_db();
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        locations(&db, &path, 5, &progress).await.unwrap();

        let mut samples = recorder.samples();
        assert_eq!(samples.len(), 11);
        samples.sort_by_key(|s| s.records_processed);

        for pair in samples.windows(2) {
            assert!(pair[0].percent_complete <= pair[1].percent_complete);
            assert!(pair[0].bytes_read <= pair[1].bytes_read);
        }
        let last = samples.last().unwrap();
        assert_eq!(last.records_processed, 53);
        assert!((last.percent_complete - 100.0).abs() < f64::EPSILON);
        assert!(samples.iter().all(|s| s.filename == path.display().to_string()));
    }

    #[tokio::test]
    async fn ingest_all_loads_both_files_with_zero_time() {
        let dir = test_dir("all_zero_time");
        write_file(&dir, Dataset::Locations.default_filename(), &locations_csv(7));
        write_file(&dir, Dataset::Conditions.default_filename(), &conditions_csv(12));
        let db = memory_db();

        let summary = ingest_all(&db, &options(&dir, 4), &null_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.locations.rows_inserted, 7);
        assert_eq!(summary.conditions.rows_inserted, 12);
        assert_eq!(count(&db, Dataset::Conditions), 12);

        let conn = db.connect().unwrap();
        let time: String = conn
            .query_row("SELECT DISTINCT CAST(time AS VARCHAR) FROM conditions", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(time, "1970-01-01 00:00:00");
    }

    #[tokio::test]
    async fn ingest_all_parses_time_when_enabled() {
        let dir = test_dir("all_parse_time");
        write_file(&dir, Dataset::Locations.default_filename(), &locations_csv(1));
        write_file(&dir, Dataset::Conditions.default_filename(), &conditions_csv(3));
        let db = memory_db();
        let mut options = options(&dir, 2);
        options.timestamp_mode = TimestampMode::Parse;

        ingest_all(&db, &options, &null_progress(), &CancellationToken::new())
            .await
            .unwrap();

        let conn = db.connect().unwrap();
        let time: String = conn
            .query_row("SELECT DISTINCT CAST(time AS VARCHAR) FROM conditions", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(time, "2016-11-15 18:00:00");
    }

    #[tokio::test]
    async fn failing_units_abort_by_default() {
        let dir = test_dir("failing_abort");
        let path = write_file(&dir, "conditions.csv", &conditions_csv(4));
        let db = Database::open_in_memory(&SessionOptions::default()).unwrap();
        let gate = AdmissionGate::default();
        let options = options(&dir, 2);

        let err = ingest_conditions(
            &db,
            &path,
            &gate,
            &options,
            &null_progress(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err.source {
            PipelineError::BatchesFailed {
                failed,
                total,
                first,
            } => {
                assert_eq!(failed, 2);
                assert_eq!(total, 2);
                assert_eq!(first.stage(), Some(InsertStage::Prepare));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn failing_units_are_reported_when_asked() {
        let dir = test_dir("failing_report");
        let path = write_file(&dir, "conditions.csv", &conditions_csv(4));
        let db = Database::open_in_memory(&SessionOptions::default()).unwrap();
        let gate = AdmissionGate::default();
        let mut options = options(&dir, 2);
        options.failure_policy = FailurePolicy::Report;
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        let report = ingest_conditions(
            &db,
            &path,
            &gate,
            &options,
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.rows_inserted, 0);
        let mut batches: Vec<u64> = report.failures.iter().map(|f| f.batch).collect();
        batches.sort_unstable();
        assert_eq!(batches, vec![1, 2]);
        assert!(report.failures.iter().all(|f| f.rows == 2));
        assert!(recorder.samples().is_empty());
    }

    #[tokio::test]
    async fn tail_flush_failure_after_failed_units_aborts_with_all_failures() {
        let dir = test_dir("tail_failure_abort");
        let path = write_file(&dir, "conditions.csv", &conditions_csv(5));
        let db = Database::open_in_memory(&SessionOptions::default()).unwrap();
        let gate = AdmissionGate::default();
        let options = options(&dir, 2);

        let err = ingest_conditions(
            &db,
            &path,
            &gate,
            &options,
            &null_progress(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.phase, Dataset::Conditions);
        match err.source {
            PipelineError::BatchesFailed {
                failed,
                total,
                first,
            } => {
                assert_eq!(failed, 2);
                assert_eq!(total, 3);
                assert_eq!(first.stage(), Some(InsertStage::Prepare));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn tail_flush_failure_is_returned_when_reporting() {
        let dir = test_dir("tail_failure_report");
        let path = write_file(&dir, "conditions.csv", &conditions_csv(5));
        let db = Database::open_in_memory(&SessionOptions::default()).unwrap();
        let gate = AdmissionGate::default();
        let mut options = options(&dir, 2);
        options.failure_policy = FailurePolicy::Report;

        let err = ingest_conditions(
            &db,
            &path,
            &gate,
            &options,
            &null_progress(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.phase, Dataset::Conditions);
        match err.source {
            PipelineError::Insert(e) => assert_eq!(e.stage(), Some(InsertStage::Prepare)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_token_stops_admission() {
        let dir = test_dir("cancelled");
        let path = write_file(&dir, "locations.csv", &locations_csv(10));
        let db = memory_db();
        let gate = AdmissionGate::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ingest_locations(
            &db,
            &path,
            &gate,
            &options(&dir, 2),
            &null_progress(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err.source, PipelineError::AdmissionCancelled));
        assert_eq!(count(&db, Dataset::Locations), 0);
    }

    #[tokio::test]
    async fn missing_file_is_a_locations_error() {
        let dir = test_dir("missing_file");
        let db = memory_db();

        let err = ingest_all(&db, &options(&dir, 10), &null_progress(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase, Dataset::Locations);
        assert!(matches!(err.source, PipelineError::FileAccess { .. }));
        assert!(err.to_string().starts_with("ingest locations: failed to access"));
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let dir = test_dir("zero_batch");
        let path = write_file(&dir, "locations.csv", &locations_csv(3));
        let db = memory_db();

        let err = locations(&db, &path, 0, &null_progress()).await.unwrap_err();

        assert!(matches!(err.source, PipelineError::InvalidBatchSize));
        assert_eq!(count(&db, Dataset::Locations), 0);
    }

    #[test]
    fn default_options_use_the_standard_file_names() {
        let options = IngestOptions::new(Path::new("/data"), DEFAULT_BATCH_SIZE);
        assert_eq!(
            options.path(Dataset::Locations),
            Path::new("/data/weather_big_locations.csv")
        );
        assert_eq!(
            options.path(Dataset::Conditions),
            Path::new("/data/weather_big_conditions.csv")
        );
        assert_eq!(options.chunk_size, CHUNK_SIZE);
        assert_eq!(options.batch_size().unwrap().get(), 50_000);
    }
}
