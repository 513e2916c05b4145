/// Streaming point readers for text and LAS/LAZ files.
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use las::Reader;

use crate::bounds::Extent;
use crate::error::{Result, SeparatorError};
use crate::input::{InputFile, PointFormat};
use crate::point::Point;
use crate::progress::ProgressStats;

/// Credits consumed bytes of one file to the shared statistics.
///
/// Credit is capped at the file length, so re-reads after a seek never push
/// the byte count past the input total.
#[derive(Debug)]
pub struct ByteMeter {
    stats: Arc<ProgressStats>,
    limit: u64,
    credited: AtomicU64,
}

impl ByteMeter {
    pub fn new(stats: Arc<ProgressStats>, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            stats,
            limit,
            credited: AtomicU64::new(0),
        })
    }

    fn credit(&self, n: u64) {
        let before = self.credited.fetch_add(n, Ordering::Relaxed);
        let allowed = self.limit.saturating_sub(before).min(n);
        if allowed > 0 {
            self.stats.add_bytes(allowed);
        }
    }

    /// Credit whatever is left of the file, whether or not it was read.
    pub fn finish(&self) {
        self.credit(self.limit);
    }

    pub fn credited(&self) -> u64 {
        self.credited.load(Ordering::Relaxed).min(self.limit)
    }
}

/// `Read + Seek` wrapper that reports bytes read to a `ByteMeter`.
#[derive(Debug)]
pub struct MeteredReader<R> {
    inner: R,
    meter: Arc<ByteMeter>,
}

impl<R> MeteredReader<R> {
    pub fn new(inner: R, meter: Arc<ByteMeter>) -> Self {
        Self { inner, meter }
    }
}

impl<R: Read> Read for MeteredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.meter.credit(n as u64);
        Ok(n)
    }
}

impl<R: Seek> Seek for MeteredReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Stream every point of `file` into `visit`.
///
/// Stops at the first read error or the first error returned by `visit`.
/// Returns the number of points visited.
pub fn for_each_point<F>(file: &InputFile, meter: &Arc<ByteMeter>, visit: F) -> Result<u64>
where
    F: FnMut(Point) -> Result<()>,
{
    let handle = File::open(&file.path).map_err(|source| SeparatorError::Io {
        path: file.path.clone(),
        source,
    })?;
    let reader = BufReader::new(MeteredReader::new(handle, Arc::clone(meter)));

    match file.format {
        PointFormat::Text => visit_text_points(file, reader, visit),
        PointFormat::Las => visit_las_points(file, reader, visit),
    }
}

/// Text records: one point per line, blank and comment lines skipped.
fn visit_text_points<R, F>(file: &InputFile, mut reader: R, mut visit: F) -> Result<u64>
where
    R: BufRead,
    F: FnMut(Point) -> Result<()>,
{
    let mut line = String::new();
    let mut line_number = 0u64;
    let mut count = 0u64;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|source| SeparatorError::Io {
                path: file.path.clone(),
                source,
            })?;
        if read == 0 {
            break;
        }
        line_number += 1;

        let point = Point::parse_record(&line).map_err(|reason| SeparatorError::MalformedPoint {
            path: file.path.clone(),
            line: line_number,
            reason,
        })?;
        if let Some(point) = point {
            visit(point)?;
            count += 1;
        }
    }

    Ok(count)
}

fn visit_las_points<F>(
    file: &InputFile,
    reader: BufReader<MeteredReader<File>>,
    mut visit: F,
) -> Result<u64>
where
    F: FnMut(Point) -> Result<()>,
{
    let las_error = |source| SeparatorError::Las {
        path: file.path.clone(),
        source,
    };

    let mut reader = Reader::new(reader).map_err(las_error)?;
    let mut count = 0u64;

    for point in reader.points() {
        let point = point.map_err(las_error)?;
        visit(Point::new(point.x, point.y, point.z))?;
        count += 1;
    }

    Ok(count)
}

/// Planar area a file's points can fall in, found without classifying them.
///
/// LAS/LAZ files report their header bounds, padded by one coordinate step.
/// Text files are pre-scanned; records that do not parse are skipped and an
/// I/O error ends the scan, which mirrors where streaming would stop.
pub fn scan_extent(path: &Path, format: PointFormat) -> Result<Extent> {
    let io_error = |source| SeparatorError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_error)?);

    match format {
        PointFormat::Text => {
            let mut extent = Extent::empty();
            for line in reader.lines().map_while(|line| line.ok()) {
                if let Ok(Some(point)) = Point::parse_record(&line) {
                    extent.update(point.x, point.y);
                }
            }
            Ok(extent)
        }
        PointFormat::Las => {
            let reader = Reader::new(reader).map_err(|source| SeparatorError::Las {
                path: path.to_path_buf(),
                source,
            })?;
            let header = reader.header();
            if header.number_of_points() == 0 {
                return Ok(Extent::empty());
            }
            let bounds = header.bounds();
            let step = header.transforms().x.scale.max(header.transforms().y.scale);
            let extent = Extent {
                min_x: bounds.min.x,
                max_x: bounds.max.x,
                min_y: bounds.min.y,
                max_y: bounds.max.y,
            };
            Ok(extent.padded(step.abs()))
        }
    }
}
