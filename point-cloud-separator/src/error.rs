/// Error types for the point separation pipeline.
use std::path::PathBuf;

use thiserror::Error;

use crate::footprint::FootprintId;

/// Errors raised while classifying and persisting points.
#[derive(Error, Debug)]
pub enum SeparatorError {
    /// Input file could not be opened or read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Text point record that does not hold three coordinates.
    #[error("malformed point at {}:{line}: {reason}", .path.display())]
    MalformedPoint {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    /// LAS/LAZ decoding error.
    #[error("LAS error in {}: {source}", .path.display())]
    Las {
        path: PathBuf,
        #[source]
        source: las::Error,
    },

    /// Footprint collection could not be parsed or holds no polygons.
    #[error("invalid footprints in {}: {reason}", .path.display())]
    Footprints { path: PathBuf, reason: String },

    /// Unsupported point file extension.
    #[error("unsupported point file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// A point arrived for a footprint whose points were already flushed.
    #[error("point arrived for footprint {0} after it was flushed")]
    LateArrival(FootprintId),

    /// A pending footprint had no accumulation entry to flush.
    #[error("footprint {0} was pending but has no accumulated points")]
    MissingEntry(FootprintId),

    /// Output could not be written.
    #[error("failed to write {}: {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization of output documents failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Run stopped because another task failed.
    #[error("run aborted")]
    Aborted,
}

impl SeparatorError {
    /// Whether the failure is confined to a single input file.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SeparatorError::Io { .. }
                | SeparatorError::MalformedPoint { .. }
                | SeparatorError::Las { .. }
                | SeparatorError::UnsupportedFormat(_)
        )
    }

    /// Whether the failure breaks an accumulation invariant.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SeparatorError::LateArrival(_) | SeparatorError::MissingEntry(_)
        )
    }
}

/// Result type for separator operations.
pub type Result<T> = std::result::Result<T, SeparatorError>;
