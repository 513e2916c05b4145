/// Per-footprint output files.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, SeparatorError};
use crate::footprint::Footprint;
use crate::point::Point;

/// Writes flushed footprints into the output directory.
///
/// Each footprint owns three files: the appended point list, its geometry and
/// its metadata. Only the flush controller writes, so no file is ever shared
/// between two concurrent writers.
#[derive(Debug)]
pub struct FootprintWriter {
    output_dir: PathBuf,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl FootprintWriter {
    /// Create the writer and its output directory.
    pub fn new(output_dir: &Path, retry_attempts: u32, retry_delay: Duration) -> Result<Self> {
        fs::create_dir_all(output_dir).map_err(|source| SeparatorError::Output {
            path: output_dir.to_path_buf(),
            source,
        })?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            retry_attempts: retry_attempts.max(1),
            retry_delay,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Persist a batch of points, retrying transient failures.
    ///
    /// `total_points` is the footprint's cumulative count, which differs from
    /// `points.len()` when a footprint is flushed more than once.
    pub fn write(&self, footprint: &Footprint, points: &[Point], total_points: u64) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.try_write(footprint, points, total_points) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retry_attempts => {
                    warn!(
                        footprint = %footprint.name,
                        attempt,
                        "Flush failed, retrying: {}",
                        err
                    );
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_write(&self, footprint: &Footprint, points: &[Point], total_points: u64) -> Result<()> {
        let points_path = self.output_dir.join(footprint.points_filename());
        append_points(&points_path, points).map_err(|source| SeparatorError::Output {
            path: points_path.clone(),
            source,
        })?;

        write_json(
            &self.output_dir.join(footprint.geometry_filename()),
            &footprint.to_feature(),
        )?;
        write_json(
            &self.output_dir.join(footprint.metadata_filename()),
            &footprint.metadata(total_points),
        )?;

        debug!(
            footprint = %footprint.name,
            points = points.len(),
            total_points,
            "Flushed footprint"
        );
        Ok(())
    }
}

/// Append `x y z` lines. On failure the file is cut back to its previous
/// length, so a retry never duplicates records.
fn append_points(path: &Path, points: &[Point]) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let start = file.metadata()?.len();

    let result = write_points(&file, points);
    if result.is_err() {
        if let Err(truncate_err) = file.set_len(start) {
            warn!(
                "Could not roll back partial write to {}: {}",
                path.display(),
                truncate_err
            );
        }
    }
    result
}

fn write_points(file: &File, points: &[Point]) -> io::Result<()> {
    let mut writer = BufWriter::new(file);
    for point in points {
        writeln!(writer, "{}", point)?;
    }
    writer.flush()
}

/// Serialize a document as pretty JSON, replacing any previous file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    fs::write(path, json).map_err(|source| SeparatorError::Output {
        path: path.to_path_buf(),
        source,
    })
}
