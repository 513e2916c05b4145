/// Point cloud footprint separator main entry point.
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use point_cloud_separator::constants::{
    DEFAULT_BACKLOG_THRESHOLD, DEFAULT_CATALOG_BUCKET_SIZE, DEFAULT_FLUSH_BATCH_SIZE,
    DEFAULT_FOOTPRINT_BUCKET_SIZE, DEFAULT_MAX_RESIDENT_POINTS, DEFAULT_NAME_PROPERTY,
    DEFAULT_POLL_INTERVAL, DEFAULT_WORKER_COUNT,
};
use point_cloud_separator::logging::init_logging;
use point_cloud_separator::{CatalogIndex, LatePointPolicy, PointSeparator, SeparatorConfig};
use tracing::error;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LatePoints {
    /// Fail the run when a point arrives for an already written footprint
    Reject,
    /// Append late points to the footprint's output again
    Reopen,
}

impl From<LatePoints> for LatePointPolicy {
    fn from(value: LatePoints) -> Self {
        match value {
            LatePoints::Reject => LatePointPolicy::Reject,
            LatePoints::Reopen => LatePointPolicy::Reopen,
        }
    }
}

#[derive(Parser)]
#[command(name = "point-cloud-separator")]
#[command(about = "Split point clouds into per-building point lists", long_about = None)]
struct Cli {
    /// Log filter, e.g. "info" or "point_cloud_separator=debug" (RUST_LOG wins)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify point files against building footprints
    Separate {
        /// GeoJSON feature collection with building polygons
        #[arg(long)]
        footprints: PathBuf,

        /// Output directory for per-building files
        #[arg(long)]
        output: PathBuf,

        /// Point files (.xyz/.txt/.csv/.pts/.las/.laz) or directories of them
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Number of ingestion workers
        #[arg(long, default_value_t = DEFAULT_WORKER_COUNT)]
        workers: usize,

        /// Pending footprint count that triggers a flush batch
        #[arg(long, default_value_t = DEFAULT_BACKLOG_THRESHOLD)]
        backlog_threshold: usize,

        /// Footprints written per flush batch
        #[arg(long, default_value_t = DEFAULT_FLUSH_BATCH_SIZE)]
        flush_batch: usize,

        /// Longest flush controller sleep in milliseconds
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
        poll_interval_ms: u64,

        /// Footprint grid bucket size in coordinate units
        #[arg(long, default_value_t = DEFAULT_FOOTPRINT_BUCKET_SIZE)]
        bucket_size: f64,

        /// Points held in memory before a flush is forced
        #[arg(long, default_value_t = DEFAULT_MAX_RESIDENT_POINTS)]
        max_resident_points: usize,

        /// What to do with points for footprints that were already written
        #[arg(long, value_enum, default_value = "reject")]
        late_points: LatePoints,

        /// Feature property used as the building name when a feature has no id
        #[arg(long, default_value = DEFAULT_NAME_PROPERTY)]
        name_property: String,

        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },
    /// List written buildings near a location
    Nearby {
        /// Catalog written by a previous run (metadata.json)
        #[arg(long)]
        catalog: PathBuf,

        #[arg(long, allow_negative_numbers = true)]
        x: f64,

        #[arg(long, allow_negative_numbers = true)]
        y: f64,

        /// Search radius in coordinate units
        #[arg(long)]
        radius: f64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Separate {
            footprints,
            output,
            inputs,
            workers,
            backlog_threshold,
            flush_batch,
            poll_interval_ms,
            bucket_size,
            max_resident_points,
            late_points,
            name_property,
            quiet,
        } => {
            let mut config = SeparatorConfig::new(footprints, inputs, output);
            config.workers = workers;
            config.backlog_threshold = backlog_threshold;
            config.flush_batch_size = flush_batch;
            config.poll_interval_ms = poll_interval_ms;
            config.bucket_size = bucket_size;
            config.max_resident_points = max_resident_points;
            config.late_points = late_points.into();
            config.name_property = name_property;
            config.show_progress = !quiet;

            let summary = PointSeparator::new(config)?.run()?;
            if summary.has_failures() {
                error!(
                    failed = summary.failed_files.len(),
                    "Some input files could not be processed"
                );
                process::exit(1);
            }
        }
        Command::Nearby {
            catalog,
            x,
            y,
            radius,
        } => {
            let index = CatalogIndex::load(&catalog, DEFAULT_CATALOG_BUCKET_SIZE)?;
            for entry in index.nearby(x, y, radius) {
                let dx = entry.coordinates[0] - x;
                let dy = entry.coordinates[1] - y;
                println!(
                    "{}\t{:.2}\t{}\t{} points",
                    entry.filename,
                    (dx * dx + dy * dy).sqrt(),
                    entry.name,
                    entry.point_count
                );
            }
        }
    }

    Ok(())
}
