#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the weather loader.
//!
//! Provides two [`ProgressCallback`] renderers: [`IndicatifProgress`], one
//! `indicatif` bar per file driven by bytes consumed, and [`LogProgress`],
//! one log line per sample. [`init_logger`] sets up `indicatif-log-bridge`
//! so that `log::info!` and friends are suspended while progress bars
//! redraw.

use std::sync::{Arc, Mutex, PoisonError};

use indicatif::{ProgressBar, ProgressStyle};
use weather_load_ingest_models::{Dataset, IngestReport, ProgressCallback, ProgressSample};

pub use indicatif::MultiProgress;

/// Renders each sample as a log line:
///
/// `Progress <file>: <records> / <secs> seconds / <rate> per second / <pct>%`
pub struct LogProgress;

impl LogProgress {
    /// Returns a shared instance.
    #[must_use]
    pub fn shared() -> Arc<dyn ProgressCallback> {
        Arc::new(Self)
    }
}

/// Formats a sample the way [`LogProgress`] logs it.
#[must_use]
pub fn format_sample(sample: &ProgressSample) -> String {
    format!(
        "Progress {}: {} / {:.2} seconds / {:.0} per second / {:.2}%",
        sample.filename,
        sample.records_processed,
        sample.elapsed.as_secs_f64(),
        sample.records_per_second(),
        sample.percent_complete,
    )
}

impl ProgressCallback for LogProgress {
    fn report(&self, sample: &ProgressSample) {
        log::info!("{}", format_sample(sample));
    }

    fn file_started(&self, dataset: Dataset, filename: &str, total_bytes: u64) {
        log::info!("Loading {dataset} from {filename} ({total_bytes} bytes)");
    }
}

/// An `indicatif` bar per file, advanced by bytes consumed.
///
/// Samples from concurrent units can arrive out of order, so the bar only
/// ever moves forward.
pub struct IndicatifProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    current: Mutex<Option<ProgressBar>>,
}

impl IndicatifProgress {
    /// Creates a renderer that adds its bars to `multi`.
    #[must_use]
    pub fn new(multi: &MultiProgress) -> Arc<dyn ProgressCallback> {
        let style = ProgressStyle::with_template(
            "{msg:12} {wide_bar:.cyan/dim} {bytes}/{total_bytes} {percent}% [{elapsed_precise}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self {
            multi: multi.clone(),
            style,
            current: Mutex::new(None),
        })
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = current.as_ref() {
            f(bar);
        }
    }
}

impl ProgressCallback for IndicatifProgress {
    fn file_started(&self, dataset: Dataset, _filename: &str, total_bytes: u64) {
        let bar = self.multi.add(ProgressBar::new(total_bytes));
        bar.set_style(self.style.clone());
        bar.set_message(dataset.to_string());

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.replace(bar) {
            previous.abandon();
        }
    }

    fn report(&self, sample: &ProgressSample) {
        self.with_bar(|bar| {
            if sample.bytes_read > bar.position() {
                bar.set_position(sample.bytes_read);
            }
        });
    }

    fn file_finished(&self, report: &IngestReport) {
        let message = if report.is_complete() {
            format!("{} done: {} rows", report.dataset, report.rows_inserted)
        } else {
            format!(
                "{} finished with {} failed batch(es)",
                report.dataset,
                report.failures.len()
            )
        };
        self.with_bar(|bar| bar.finish_with_message(message));
    }
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // Already set in tests.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
