/// Runtime configuration for a separation run.
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKLOG_THRESHOLD, DEFAULT_FLUSH_BATCH_SIZE, DEFAULT_FOOTPRINT_BUCKET_SIZE,
    DEFAULT_MAX_RESIDENT_POINTS, DEFAULT_NAME_PROPERTY, DEFAULT_POLL_INTERVAL,
    DEFAULT_WORKER_COUNT,
};
use crate::error::{Result, SeparatorError};
use crate::store::{LatePointPolicy, StoreLimits};

/// Everything a run needs besides the input data itself.
///
/// Persisted verbatim in `run.json` so a run can be reproduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparatorConfig {
    /// GeoJSON footprint collection.
    pub footprints: PathBuf,
    /// Point files or directories of point files.
    pub inputs: Vec<PathBuf>,
    /// Directory receiving per-footprint files, `metadata.json` and `run.json`.
    pub output_dir: PathBuf,
    /// Files streamed in parallel.
    pub workers: usize,
    /// Pending footprints tolerated before a mid-run flush batch.
    pub backlog_threshold: usize,
    /// Footprints written per mid-run batch.
    pub flush_batch_size: usize,
    pub poll_interval_ms: u64,
    /// Footprint grid bucket edge length.
    pub bucket_size: f64,
    /// Points held in memory before flushing is forced and new files wait.
    pub max_resident_points: usize,
    pub late_points: LatePointPolicy,
    /// Feature property naming a footprint that has no id.
    pub name_property: String,
    pub show_progress: bool,
}

impl SeparatorConfig {
    /// Configuration with default tuning.
    pub fn new(footprints: PathBuf, inputs: Vec<PathBuf>, output_dir: PathBuf) -> Self {
        Self {
            footprints,
            inputs,
            output_dir,
            workers: DEFAULT_WORKER_COUNT,
            backlog_threshold: DEFAULT_BACKLOG_THRESHOLD,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            bucket_size: DEFAULT_FOOTPRINT_BUCKET_SIZE,
            max_resident_points: DEFAULT_MAX_RESIDENT_POINTS,
            late_points: LatePointPolicy::default(),
            name_property: DEFAULT_NAME_PROPERTY.to_string(),
            show_progress: true,
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SeparatorError::Config("worker count must be at least 1".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(SeparatorError::Config("flush batch size must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SeparatorError::Config("poll interval must be positive".into()));
        }
        if !(self.bucket_size.is_finite() && self.bucket_size > 0.0) {
            return Err(SeparatorError::Config(format!(
                "bucket size must be a positive number, got {}",
                self.bucket_size
            )));
        }
        if self.inputs.is_empty() {
            return Err(SeparatorError::Config("no point inputs given".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            backlog_threshold: self.backlog_threshold,
            max_resident_points: self.max_resident_points,
            late_points: self.late_points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SeparatorConfig {
        SeparatorConfig::new(
            PathBuf::from("footprints.geojson"),
            vec![PathBuf::from("tiles")],
            PathBuf::from("out"),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 8);
        assert_eq!(config.backlog_threshold, 400);
        assert_eq!(config.flush_batch_size, 100);
        assert_eq!(config.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.store_limits().late_points, LatePointPolicy::Reject);
    }

    #[test]
    fn rejects_unusable_settings() {
        let cases: [fn(&mut SeparatorConfig); 6] = [
            |c| c.workers = 0,
            |c| c.flush_batch_size = 0,
            |c| c.poll_interval_ms = 0,
            |c| c.bucket_size = 0.0,
            |c| c.bucket_size = f64::NAN,
            |c| c.inputs.clear(),
        ];
        for mutate in cases {
            let mut config = config();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(SeparatorError::Config(_))));
        }
    }

    #[test]
    fn zero_backlog_threshold_is_allowed() {
        let mut config = config();
        config.backlog_threshold = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn serializes_late_point_policy_in_lowercase() {
        let mut config = config();
        config.late_points = LatePointPolicy::Reopen;
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["late_points"], "reopen");
    }
}
