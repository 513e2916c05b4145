/// Point separation pipeline wiring registry, workers, store and flusher.
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::FootprintCatalog;
use crate::config::SeparatorConfig;
use crate::constants::{
    FLUSH_RETRY_ATTEMPTS, FLUSH_RETRY_DELAY, REPORT_INTERVAL, REPORT_MIN_POINTS,
    RUN_REPORT_FILENAME, UNMATCHED_WARNING_RATIO,
};
use crate::error::Result;
use crate::flush::{FlushController, FlushSettings};
use crate::ingest::{FailedFile, FileReport, Ingestor};
use crate::input::InputSet;
use crate::progress::{ProgressReporter, ProgressStats, StatsSnapshot};
use crate::registry::FootprintRegistry;
use crate::store::AccumulationStore;
use crate::writer::{FootprintWriter, write_json};

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Input files discovered for the run.
    pub files_total: usize,
    /// Files streamed to the end.
    pub files: Vec<FileReport>,
    /// Files given up on, with the reason.
    pub failed_files: Vec<FailedFile>,
    /// Footprints loaded.
    pub footprints: usize,
    /// Footprints that received points and were written.
    pub footprints_written: usize,
    /// Highest number of points held in memory at once.
    pub peak_resident_points: usize,
    pub stats: StatsSnapshot,
    pub elapsed_secs: f64,
    /// Path of the written `metadata.json`.
    pub catalog: PathBuf,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed_files.is_empty()
    }
}

/// Contents of `run.json`.
#[derive(Debug, Serialize)]
struct RunReport<'a> {
    config: &'a SeparatorConfig,
    summary: &'a RunSummary,
}

/// Separates point files into one point list per building footprint.
pub struct PointSeparator {
    /// Validated settings for the run.
    config: SeparatorConfig,
    /// Footprints loaded and indexed up front.
    registry: FootprintRegistry,
    /// Point files with their sizes and extents.
    inputs: InputSet,
}

impl PointSeparator {
    /// Validate the configuration, load footprints and discover input files.
    pub fn new(config: SeparatorConfig) -> Result<Self> {
        config.validate()?;
        let registry =
            FootprintRegistry::load(&config.footprints, &config.name_property, config.bucket_size)?;
        let inputs = InputSet::discover(&config.inputs)?;
        Ok(Self {
            config,
            registry,
            inputs,
        })
    }

    /// Assemble a separator from an already built registry and input set.
    pub fn from_parts(
        config: SeparatorConfig,
        registry: FootprintRegistry,
        inputs: InputSet,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            inputs,
        })
    }

    pub fn config(&self) -> &SeparatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &FootprintRegistry {
        &self.registry
    }

    pub fn inputs(&self) -> &InputSet {
        &self.inputs
    }

    /// Run ingestion and flushing to completion.
    ///
    /// Failed input files are reported in the summary; a flush failure or a
    /// broken accumulation invariant fails the whole run.
    pub fn run(self) -> Result<RunSummary> {
        let started = Instant::now();
        let config = &self.config;
        info!(
            files = self.inputs.len(),
            footprints = self.registry.len(),
            workers = config.workers,
            backlog_threshold = config.backlog_threshold,
            flush_batch = config.flush_batch_size,
            "Starting point separation"
        );

        let writer =
            FootprintWriter::new(&config.output_dir, FLUSH_RETRY_ATTEMPTS, FLUSH_RETRY_DELAY)?;
        let store = AccumulationStore::new(config.store_limits());
        let catalog = FootprintCatalog::new();
        let stats = Arc::new(ProgressStats::default());
        let reporter = ProgressReporter::new(
            Arc::clone(&stats),
            self.inputs.total_bytes(),
            REPORT_INTERVAL,
            REPORT_MIN_POINTS,
            config.show_progress,
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|index| format!("ingest-{}", index))
            .build()?;

        let ingestion_done = AtomicBool::new(false);
        let abort = AtomicBool::new(false);
        let controller = FlushController::new(
            &store,
            &self.registry,
            &self.inputs,
            &writer,
            &catalog,
            &stats,
            FlushSettings {
                batch_size: config.flush_batch_size,
                poll_interval: config.poll_interval(),
            },
        );
        let ingestor = Ingestor::new(
            &self.registry,
            &store,
            &self.inputs,
            Arc::clone(&stats),
            &abort,
            config.poll_interval(),
        );

        let (outcomes, flush_result) = thread::scope(|scope| {
            let flusher = scope.spawn(|| {
                let result = controller.run(&ingestion_done, &abort);
                if result.is_err() {
                    abort.store(true, Ordering::Release);
                }
                result
            });
            let report_thread = scope.spawn(|| reporter.run(&ingestion_done));

            // One task per file; idle workers pick up the next file.
            let outcomes: Vec<Result<FileReport>> = pool.install(|| {
                self.inputs
                    .files()
                    .par_iter()
                    .with_max_len(1)
                    .map(|file| ingestor.ingest(file))
                    .collect()
            });

            ingestion_done.store(true, Ordering::Release);
            store.wake();
            report_thread.thread().unpark();

            let flush_result = flusher
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload));
            report_thread
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload));
            (outcomes, flush_result)
        });

        let status = reporter.finish();
        let flush_report = match flush_result {
            Ok(report) => report,
            Err(err) => {
                error!("Flushing failed: {}", err);
                // Footprints written before the failure stay discoverable.
                if let Err(catalog_err) = catalog.write(&config.output_dir) {
                    error!("Writing the catalog failed too: {}", catalog_err);
                }
                return Err(err);
            }
        };

        let mut files = Vec::new();
        let mut failed_files = Vec::new();
        let mut violation = None;
        for (file, outcome) in self.inputs.files().iter().zip(outcomes) {
            match outcome {
                Ok(report) => files.push(report),
                Err(err) => {
                    failed_files.push(FailedFile {
                        path: file.path.clone(),
                        error: err.to_string(),
                    });
                    if err.is_invariant_violation() && violation.is_none() {
                        violation = Some(err);
                    }
                }
            }
        }

        // Whatever reached disk stays discoverable, even for a failing run.
        let catalog_path = catalog.write(&config.output_dir)?;
        if let Some(err) = violation {
            error!("Run failed: {}", err);
            return Err(err);
        }

        let summary = RunSummary {
            files_total: self.inputs.len(),
            files,
            failed_files,
            footprints: self.registry.len(),
            footprints_written: catalog.len(),
            peak_resident_points: store.peak_resident_points(),
            stats: status.stats,
            elapsed_secs: started.elapsed().as_secs_f64(),
            catalog: catalog_path,
        };
        write_json(
            &config.output_dir.join(RUN_REPORT_FILENAME),
            &RunReport {
                config,
                summary: &summary,
            },
        )?;

        info!(
            files = summary.files_total,
            failed = summary.failed_files.len(),
            points = summary.stats.points,
            hits = summary.stats.hits,
            unmatched = summary.stats.unmatched,
            footprints_written = summary.footprints_written,
            peak_resident_points = summary.peak_resident_points,
            batches = flush_report.batches,
            elapsed_secs = summary.elapsed_secs,
            "Point separation complete"
        );
        for failed in &summary.failed_files {
            warn!(file = %failed.path.display(), "Input failed: {}", failed.error);
        }

        let ratio = summary.stats.unmatched_ratio();
        if summary.stats.points > 0 && ratio > UNMATCHED_WARNING_RATIO {
            warn!(
                unmatched = summary.stats.unmatched,
                points = summary.stats.points,
                "{:.1}% of points matched no footprint; check that points and footprints share a coordinate system",
                ratio * 100.0
            );
        }

        Ok(summary)
    }
}

/// Convenience wrapper: build a separator from `config` and run it.
pub fn separate(config: SeparatorConfig) -> Result<RunSummary> {
    PointSeparator::new(config)?.run()
}
