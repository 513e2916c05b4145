/// Shared defaults for the point separation pipeline.
use std::time::Duration;

/// Number of ingestion workers streaming point files in parallel.
pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Pending footprint count that triggers a mid-run flush batch.
pub const DEFAULT_BACKLOG_THRESHOLD: usize = 400;

/// Maximum number of footprints written per mid-run flush batch.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 100;

/// Upper bound on how long the flush controller sleeps between backlog checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Resident point count that triggers a flush regardless of backlog depth.
pub const DEFAULT_MAX_RESIDENT_POINTS: usize = 50_000_000;

/// Footprint grid bucket edge length in projection units (metres).
pub const DEFAULT_FOOTPRINT_BUCKET_SIZE: f64 = 50.0;

/// Catalog grid bucket edge length used for radius queries.
pub const DEFAULT_CATALOG_BUCKET_SIZE: f64 = 100.0;

/// Minimum wall time between two status lines.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum number of new points before another status line is emitted.
pub const REPORT_MIN_POINTS: u64 = 100;

/// Attempts made to persist a footprint before the run is failed.
pub const FLUSH_RETRY_ATTEMPTS: u32 = 3;

/// Delay between two flush attempts for the same footprint.
pub const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Share of unmatched points above which a coordinate mismatch is suspected.
pub const UNMATCHED_WARNING_RATIO: f64 = 0.95;

/// Property consulted for the footprint name when a feature has no id.
pub const DEFAULT_NAME_PROPERTY: &str = "id";

/// Text point file extensions, matched case-insensitively.
pub const TEXT_POINT_EXTENSIONS: &[&str] = &["xyz", "txt", "csv", "pts"];

/// LAS point file extensions, matched case-insensitively.
pub const LAS_POINT_EXTENSIONS: &[&str] = &["las", "laz"];

/// Extension of the per-footprint point list.
pub const POINTS_EXTENSION: &str = "xyz";

/// Extension of the per-footprint geometry file.
pub const GEOMETRY_EXTENSION: &str = "geojson";

/// Extension of the per-footprint metadata file.
pub const METADATA_EXTENSION: &str = "json";

/// Run-level catalog of every flushed footprint.
pub const CATALOG_FILENAME: &str = "metadata.json";

/// Effective configuration and summary of the last run.
pub const RUN_REPORT_FILENAME: &str = "run.json";
