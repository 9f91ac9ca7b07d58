//! Per-file ingestion: parse, batch, dispatch, join.
//!
//! One driving flow reads the file sequentially. Every full batch waits
//! for an [`AdmissionGate`] slot and is then inserted by its own blocking
//! task on a cloned connection. The trailing partial batch is inserted on
//! the driving flow without a slot. Before returning, the driving flow
//! joins every unit it started, also when it stops early on an error.

use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use weather_load_database::{Database, InsertError, InsertRow, insert_batch};
use weather_load_ingest_models::{
    BatchFailure, Dataset, FailurePolicy, IngestReport, ProgressCallback, ProgressSample,
    percent_of,
};

use crate::batch::{Batch, Batcher};
use crate::gate::AdmissionGate;
use crate::parse::{FromRow, RecordReader};
use crate::{IngestOptions, PipelineError};

/// Result of one concurrently inserted batch.
struct UnitOutcome {
    seq: u64,
    rows: usize,
    result: Result<u64, InsertError>,
}

/// Values every progress sample of a file shares.
#[derive(Clone)]
struct SampleContext {
    dataset: Dataset,
    filename: String,
    total_bytes: u64,
    started: Instant,
}

impl SampleContext {
    fn sample(&self, records_processed: u64, bytes_read: u64) -> ProgressSample {
        ProgressSample {
            dataset: self.dataset,
            filename: self.filename.clone(),
            records_processed,
            bytes_read,
            total_bytes: self.total_bytes,
            elapsed: self.started.elapsed(),
            percent_complete: percent_of(bytes_read, self.total_bytes),
        }
    }
}

/// Ingests the file at `path` into `T`'s table.
pub async fn ingest_file<T>(
    db: &Database,
    path: &Path,
    gate: &AdmissionGate,
    options: &IngestOptions,
    progress: &Arc<dyn ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<IngestReport, PipelineError>
where
    T: FromRow + InsertRow,
{
    let batch_size = options.batch_size()?;

    let file = File::open(path).map_err(|source| PipelineError::FileAccess {
        path: path.to_path_buf(),
        source,
    })?;
    let total_bytes = file
        .metadata()
        .map_err(|source| PipelineError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let ctx = SampleContext {
        dataset: T::DATASET,
        filename: path.display().to_string(),
        total_bytes,
        started: Instant::now(),
    };

    log::info!(
        "Ingesting {} from {} ({total_bytes} bytes, batch size {batch_size})",
        T::DATASET,
        ctx.filename,
    );
    progress.file_started(T::DATASET, &ctx.filename, total_bytes);

    let mut driver = Driver::<T> {
        db,
        gate,
        options,
        progress,
        cancel,
        ctx,
        units: JoinSet::new(),
        records_processed: 0,
        batches_dispatched: 0,
        rows_inserted: 0,
        failures: Vec::new(),
        first_failure: None,
        join_error: None,
        reported_bytes: 0,
        final_bytes: 0,
        _record: PhantomData,
    };

    let records = RecordReader::<_, T>::new(path, file, options.timestamp_mode);
    let driven = driver.drive(records, batch_size).await;

    // Join everything already dispatched, whatever happened above.
    driver.join_units().await;

    if let Err(e) = driven {
        return Err(driver.abort_with(e));
    }
    driver.finish()
}

struct Driver<'a, T> {
    db: &'a Database,
    gate: &'a AdmissionGate,
    options: &'a IngestOptions,
    progress: &'a Arc<dyn ProgressCallback>,
    cancel: &'a CancellationToken,
    ctx: SampleContext,
    units: JoinSet<UnitOutcome>,
    records_processed: u64,
    batches_dispatched: u64,
    rows_inserted: u64,
    failures: Vec<BatchFailure>,
    first_failure: Option<InsertError>,
    join_error: Option<JoinError>,
    /// Byte count carried by the latest dispatched or flushed batch.
    reported_bytes: u64,
    /// Byte count once the reader hit end of stream.
    final_bytes: u64,
    _record: PhantomData<T>,
}

impl<T> Driver<'_, T>
where
    T: FromRow + InsertRow,
{
    /// Reads every record, dispatching full batches concurrently and the
    /// tail synchronously.
    async fn drive<R: Read>(
        &mut self,
        mut records: RecordReader<R, T>,
        batch_size: NonZeroUsize,
    ) -> Result<(), PipelineError> {
        let mut batcher = Batcher::new(batch_size);

        while let Some(record) = records.next() {
            let record = record?;
            self.records_processed += 1;

            if let Some(batch) = batcher.push(record) {
                self.dispatch(batch, records.bytes_read()).await?;
            }
        }

        self.final_bytes = records.bytes_read();

        if let Some(batch) = batcher.finish() {
            self.flush(batch, self.final_bytes).await?;
        }

        Ok(())
    }

    /// Starts a concurrent insertion unit for a full batch.
    async fn dispatch(&mut self, batch: Batch<T>, bytes_read: u64) -> Result<(), PipelineError> {
        let admission = self.gate.admit(self.cancel).await?;
        let mut conn = self.db.connect()?;

        self.batches_dispatched += 1;
        self.reported_bytes = bytes_read;
        log::debug!(
            "{}: dispatching batch {} ({} records, {} in flight)",
            self.ctx.dataset,
            batch.seq,
            batch.len(),
            self.gate.in_flight(),
        );

        let records_processed = self.records_processed;
        let chunk_size = self.options.chunk_size;
        let ctx = self.ctx.clone();
        let progress = Arc::clone(self.progress);
        let cancel = self.cancel.clone();

        self.units.spawn_blocking(move || {
            let _admission = admission;
            let result = insert_batch(&mut conn, &batch.records, chunk_size, &cancel);
            if result.is_ok() {
                progress.report(&ctx.sample(records_processed, bytes_read));
            }
            UnitOutcome {
                seq: batch.seq,
                rows: batch.records.len(),
                result,
            }
        });

        Ok(())
    }

    /// Inserts the trailing partial batch on the driving flow.
    async fn flush(&mut self, batch: Batch<T>, bytes_read: u64) -> Result<(), PipelineError> {
        let mut conn = self.db.connect()?;
        let chunk_size = self.options.chunk_size;
        let cancel = self.cancel.clone();

        self.batches_dispatched += 1;
        log::debug!(
            "{}: flushing final batch {} ({} records)",
            self.ctx.dataset,
            batch.seq,
            batch.len(),
        );

        let inserted = tokio::task::spawn_blocking(move || {
            insert_batch(&mut conn, &batch.records, chunk_size, &cancel)
        })
        .await??;

        self.rows_inserted += inserted;
        self.reported_bytes = bytes_read;
        self.progress
            .report(&self.ctx.sample(self.records_processed, bytes_read));

        Ok(())
    }

    /// Waits for every dispatched unit and records its outcome.
    async fn join_units(&mut self) {
        while let Some(joined) = self.units.join_next().await {
            match joined {
                Ok(UnitOutcome {
                    result: Ok(inserted),
                    ..
                }) => self.rows_inserted += inserted,
                Ok(UnitOutcome {
                    seq,
                    rows,
                    result: Err(e),
                }) => {
                    log::error!(
                        "{}: batch {seq} ({rows} records) failed: {e}",
                        self.ctx.dataset
                    );
                    self.failures.push(BatchFailure {
                        batch: seq,
                        rows,
                        message: e.to_string(),
                    });
                    self.first_failure.get_or_insert(e);
                }
                Err(e) => {
                    log::error!("{}: insertion unit did not complete: {e}", self.ctx.dataset);
                    self.join_error.get_or_insert(e);
                }
            }
        }
    }

    /// Picks the error to return when the read loop stopped early.
    ///
    /// Under [`FailurePolicy::Abort`], batches that already failed were
    /// dispatched before the loop error happened, so they are reported
    /// first.
    fn abort_with(self, error: PipelineError) -> PipelineError {
        if let Some(e) = self.join_error {
            log::error!("{}: read loop stopped: {error}", self.ctx.dataset);
            return PipelineError::Join(e);
        }

        match self.first_failure {
            Some(first) if self.options.failure_policy == FailurePolicy::Abort => {
                log::error!("{}: read loop stopped: {error}", self.ctx.dataset);
                PipelineError::BatchesFailed {
                    failed: self.failures.len(),
                    total: self.batches_dispatched,
                    first,
                }
            }
            _ => error,
        }
    }

    /// Builds the report once every unit has joined and applies the
    /// failure policy.
    fn finish(self) -> Result<IngestReport, PipelineError> {
        if let Some(e) = self.join_error {
            return Err(PipelineError::Join(e));
        }

        // Rows skipped after the last full batch still count as consumed.
        if self.final_bytes > self.reported_bytes {
            self.progress
                .report(&self.ctx.sample(self.records_processed, self.final_bytes));
        }

        let report = IngestReport {
            dataset: self.ctx.dataset,
            filename: self.ctx.filename,
            records_processed: self.records_processed,
            rows_inserted: self.rows_inserted,
            batches_dispatched: self.batches_dispatched,
            failures: self.failures,
            elapsed: self.ctx.started.elapsed(),
        };

        log::info!(
            "{} complete: {} inserted from {} records in {} batch(es), {} failed, took {:.1}s",
            report.dataset,
            report.rows_inserted,
            report.records_processed,
            report.batches_dispatched,
            report.failures.len(),
            report.elapsed.as_secs_f64(),
        );
        self.progress.file_finished(&report);

        if let Some(first) = self.first_failure
            && self.options.failure_policy == FailurePolicy::Abort
        {
            return Err(PipelineError::BatchesFailed {
                failed: report.failures.len(),
                total: report.batches_dispatched,
                first,
            });
        }

        Ok(report)
    }
}
