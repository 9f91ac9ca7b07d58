//! Streaming CSV record parsing.
//!
//! [`RecordReader`] turns a byte stream into a lazy sequence of typed
//! records. Rows with the wrong number of fields are dropped silently;
//! a numeric (or, when enabled, timestamp) field that fails to parse ends
//! the sequence with [`PipelineError::MalformedRow`]. Text fields are not
//! validated: invalid UTF-8 is replaced with U+FFFD.

use std::io::Read;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ByteRecord, StringRecord};
use weather_load_ingest_models::{ConditionRecord, Dataset, LocationRecord, TimestampMode};

use crate::PipelineError;
use crate::count::CountingReader;

/// A record that can be built from one CSV row.
pub trait FromRow: Sized {
    /// Dataset the record belongs to; its arity decides which rows are
    /// structurally valid.
    const DATASET: Dataset;

    /// Builds a record from a row that already has the right field count.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MalformedRow`] if a typed field does not
    /// parse.
    fn from_row(
        row: &StringRecord,
        line: u64,
        timestamps: TimestampMode,
    ) -> Result<Self, PipelineError>;
}

impl FromRow for LocationRecord {
    const DATASET: Dataset = Dataset::Locations;

    fn from_row(
        row: &StringRecord,
        _line: u64,
        _timestamps: TimestampMode,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            device_id: row[0].to_string(),
            location: row[1].to_string(),
            environment: row[2].to_string(),
        })
    }
}

impl FromRow for ConditionRecord {
    const DATASET: Dataset = Dataset::Conditions;

    fn from_row(
        row: &StringRecord,
        line: u64,
        timestamps: TimestampMode,
    ) -> Result<Self, PipelineError> {
        let time = match timestamps {
            TimestampMode::Zero => DateTime::<Utc>::UNIX_EPOCH,
            TimestampMode::Parse => {
                parse_timestamp(&row[0]).ok_or_else(|| PipelineError::MalformedRow {
                    line,
                    field: "time",
                    value: row[0].to_string(),
                    reason: "unrecognized timestamp format".to_string(),
                })?
            }
        };

        Ok(Self {
            time,
            device_id: row[1].to_string(),
            temperature: parse_f64(row, 2, "temperature", line)?,
            humidity: parse_f64(row, 3, "humidity", line)?,
        })
    }
}

fn parse_f64(
    row: &StringRecord,
    index: usize,
    field: &'static str,
    line: u64,
) -> Result<f64, PipelineError> {
    row[index]
        .parse::<f64>()
        .map_err(|e| PipelineError::MalformedRow {
            line,
            field,
            value: row[index].to_string(),
            reason: e.to_string(),
        })
}

/// Parses a reading timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` with a short UTC offset (the
/// `2016-11-15 12:00:00-06` style found in the sample datasets), and the
/// same without an offset, which is taken as UTC.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// Lazy iterator of typed records read from a CSV byte stream.
///
/// The stream has no header row. The iterator owns the byte counter so
/// callers can sample [`Self::bytes_read`] between records.
pub struct RecordReader<R: Read, T> {
    path: PathBuf,
    reader: csv::Reader<CountingReader<R>>,
    row: ByteRecord,
    timestamps: TimestampMode,
    done: bool,
    _record: PhantomData<fn() -> T>,
}

impl<R: Read, T: FromRow> RecordReader<R, T> {
    /// Wraps `inner`; `path` is only used in error messages.
    pub fn new(path: &Path, inner: R, timestamps: TimestampMode) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(CountingReader::new(inner));

        Self {
            path: path.to_path_buf(),
            reader,
            row: ByteRecord::new(),
            timestamps,
            done: false,
            _record: PhantomData,
        }
    }

    /// Bytes consumed from the underlying stream so far. Includes whatever
    /// the CSV reader has buffered ahead of the current row.
    pub fn bytes_read(&self) -> u64 {
        self.reader.get_ref().bytes_read()
    }
}

impl<R: Read, T: FromRow> Iterator for RecordReader<R, T> {
    type Item = Result<T, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.reader.read_byte_record(&mut self.row) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(source) => {
                    self.done = true;
                    return Some(Err(PipelineError::Read {
                        path: self.path.clone(),
                        source,
                    }));
                }
            }

            let line = self.row.position().map_or(0, csv::Position::line);

            if self.row.len() != T::DATASET.arity() {
                log::trace!(
                    "{}:{line}: skipping row with {} field(s), expected {}",
                    self.path.display(),
                    self.row.len(),
                    T::DATASET.arity()
                );
                continue;
            }

            let row = StringRecord::from_byte_record_lossy(std::mem::take(&mut self.row));
            let record = T::from_row(&row, line, self.timestamps);
            if record.is_err() {
                self.done = true;
            }
            return Some(record);
        }
    }
}
