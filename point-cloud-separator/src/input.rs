/// Input point file discovery and per-file completion tracking.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bounds::Extent;
use crate::constants::{LAS_POINT_EXTENSIONS, TEXT_POINT_EXTENSIONS};
use crate::error::{Result, SeparatorError};
use crate::reader::scan_extent;

/// Position of a file in the input set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// On-disk encoding of a point file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointFormat {
    /// One `x y z` record per line.
    Text,
    /// LAS or LAZ.
    Las,
}

impl PointFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_string_lossy().to_lowercase();
        if TEXT_POINT_EXTENSIONS.contains(&extension.as_str()) {
            Some(PointFormat::Text)
        } else if LAS_POINT_EXTENSIONS.contains(&extension.as_str()) {
            Some(PointFormat::Las)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputFile {
    /// Index of the file in its input set.
    pub id: FileId,
    /// Path as given on the command line or found in a scanned directory.
    pub path: PathBuf,
    /// Size in bytes at discovery time.
    pub len: u64,
    /// Encoding detected from the extension.
    pub format: PointFormat,
    /// Planar area the file's points fall in; `None` when it could not be
    /// determined, in which case the file may reach any footprint.
    pub extent: Option<Extent>,
}

impl InputFile {
    /// Whether points of this file may land inside `extent`.
    pub fn may_reach(&self, extent: &Extent) -> bool {
        self.extent.is_none_or(|own| own.intersects(extent))
    }
}

/// The full list of point files for a run.
///
/// Besides the file list it records which files have been fully streamed, so
/// the flush controller can tell whether a footprint may still grow.
#[derive(Debug)]
pub struct InputSet {
    /// Files in processing order; `files[i].id == FileId(i)`.
    files: Vec<InputFile>,
    /// Set once a file has been streamed to the end or given up on.
    finished: Vec<AtomicBool>,
    /// Sum of all file sizes, the denominator of progress.
    total_bytes: u64,
}

impl InputSet {
    /// Resolve command line inputs: files are taken as-is, directories are
    /// scanned (non-recursively) for supported point files. A file reached
    /// more than once is kept at its first position only.
    pub fn discover(paths: &[PathBuf]) -> Result<Self> {
        let mut candidates = Vec::new();

        for path in paths {
            if path.is_dir() {
                let mut found = scan_directory(path)?;
                debug!(count = found.len(), "Scanned {}", path.display());
                candidates.append(&mut found);
            } else if PointFormat::from_path(path).is_some() {
                candidates.push(path.clone());
            } else {
                return Err(SeparatorError::UnsupportedFormat(path.clone()));
            }
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(candidates.len());
        for path in candidates {
            let canonical = fs::canonicalize(&path).map_err(|source| SeparatorError::Io {
                path: path.clone(),
                source,
            })?;
            if seen.insert(canonical) {
                resolved.push(path);
            } else {
                debug!(file = %path.display(), "Skipping duplicate input");
            }
        }

        let set = Self::from_paths(resolved)?;
        info!(
            files = set.len(),
            total_bytes = set.total_bytes(),
            "Discovered point files"
        );
        Ok(set)
    }

    /// Build the set from explicit file paths and scan each file's extent.
    pub fn from_paths(paths: Vec<PathBuf>) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());

        for (index, path) in paths.into_iter().enumerate() {
            let format = PointFormat::from_path(&path)
                .ok_or_else(|| SeparatorError::UnsupportedFormat(path.clone()))?;
            let len = fs::metadata(&path)
                .map_err(|source| SeparatorError::Io {
                    path: path.clone(),
                    source,
                })?
                .len();
            files.push(InputFile {
                id: FileId(index as u32),
                path,
                len,
                format,
                extent: None,
            });
        }

        files.par_iter_mut().for_each(|file| {
            match scan_extent(&file.path, file.format) {
                Ok(extent) => file.extent = Some(extent),
                Err(err) => warn!(
                    file = %file.path.display(),
                    "Extent unknown, footprints it may reach flush last: {}",
                    err
                ),
            }
        });

        let total_bytes = files.iter().map(|f| f.len).sum();
        let finished = files.iter().map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            files,
            finished,
            total_bytes,
        })
    }

    pub fn files(&self) -> &[InputFile] {
        &self.files
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Record that no further points will come from a file.
    pub fn mark_finished(&self, id: FileId) {
        if let Some(flag) = self.finished.get(id.0 as usize) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn is_finished(&self, id: FileId) -> bool {
        self.finished
            .get(id.0 as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Whether a file that has not finished yet, started or not, may still
    /// produce points inside `extent`.
    pub fn may_still_reach(&self, extent: &Extent) -> bool {
        self.files
            .iter()
            .any(|file| !self.is_finished(file.id) && file.may_reach(extent))
    }
}

fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let io_error = |source| SeparatorError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && PointFormat::from_path(&path).is_some() {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}
