/// Ingestion workers streaming point files and classifying every point.
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::bounds::Extent;
use crate::error::{Result, SeparatorError};
use crate::input::{FileId, InputFile, InputSet};
use crate::point::Point;
use crate::progress::ProgressStats;
use crate::reader::{ByteMeter, for_each_point};
use crate::registry::FootprintRegistry;
use crate::store::{AccumulationStore, AddOutcome};

/// Points classified between two publications of local counters.
const PUBLISH_EVERY: u64 = 8_192;

/// Per-file result kept for the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    /// Points read from the file.
    pub points: u64,
    /// Point-footprint matches; a point inside overlapping footprints counts
    /// once per footprint.
    pub hits: u64,
    /// Points inside no footprint.
    pub unmatched: u64,
    /// Planar extent of the points read, if any.
    pub extent: Option<Extent>,
}

/// Input file that could not be fully processed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

/// Classification counters kept per worker and published in batches.
#[derive(Debug)]
struct Counters {
    points: u64,
    hits: u64,
    unmatched: u64,
    touched: u64,
    extent: Extent,
    published: Counts,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            points: 0,
            hits: 0,
            unmatched: 0,
            touched: 0,
            extent: Extent::empty(),
            published: Counts::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    points: u64,
    hits: u64,
    unmatched: u64,
    touched: u64,
}

impl Counters {
    fn publish(&mut self, stats: &ProgressStats) {
        stats.add_classified(
            self.points - self.published.points,
            self.hits - self.published.hits,
            self.unmatched - self.published.unmatched,
            self.touched - self.published.touched,
        );
        self.published = Counts {
            points: self.points,
            hits: self.hits,
            unmatched: self.unmatched,
            touched: self.touched,
        };
    }
}

/// Shared context for every ingestion task of a run.
pub struct Ingestor<'a> {
    /// Footprints points are classified against.
    registry: &'a FootprintRegistry,
    /// Destination of every match.
    store: &'a AccumulationStore,
    /// Completion flags updated as files finish.
    inputs: &'a InputSet,
    stats: Arc<ProgressStats>,
    /// Raised on a broken invariant; no new file starts afterwards.
    abort: &'a AtomicBool,
    /// Longest single wait for the flusher to free memory between files.
    poll_interval: Duration,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        registry: &'a FootprintRegistry,
        store: &'a AccumulationStore,
        inputs: &'a InputSet,
        stats: Arc<ProgressStats>,
        abort: &'a AtomicBool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            inputs,
            stats,
            abort,
            poll_interval,
        }
    }

    /// Stream one file into the accumulation store.
    ///
    /// The file is marked finished whether or not it succeeded, so footprints
    /// it touched become flushable. Input errors stay confined to the file;
    /// invariant violations raise the abort flag for the whole run.
    pub fn ingest(&self, file: &InputFile) -> Result<FileReport> {
        if self.store.wait_for_room(self.poll_interval, self.abort) {
            debug!(
                file = %file.path.display(),
                resident = self.store.resident_points(),
                "Waited for flushing before starting file"
            );
        }
        if self.abort.load(Ordering::Acquire) {
            return Err(SeparatorError::Aborted);
        }
        debug!(file = %file.path.display(), bytes = file.len, "Ingesting");

        let meter = ByteMeter::new(Arc::clone(&self.stats), file.len);
        let mut counters = Counters::default();
        let result = for_each_point(file, &meter, |point| {
            self.classify(file.id, point, &mut counters)
        });

        self.inputs.mark_finished(file.id);
        counters.publish(&self.stats);
        meter.finish();
        self.stats.file_done();
        // A finished file may complete pending footprints.
        self.store.wake();

        match result {
            Ok(_) => Ok(FileReport {
                path: file.path.clone(),
                points: counters.points,
                hits: counters.hits,
                unmatched: counters.unmatched,
                extent: (!counters.extent.is_empty()).then_some(counters.extent),
            }),
            Err(err) => {
                if err.is_invariant_violation() {
                    error!(file = %file.path.display(), "Aborting run: {}", err);
                    self.abort.store(true, Ordering::Release);
                } else if !matches!(err, SeparatorError::Aborted) {
                    warn!(
                        file = %file.path.display(),
                        points = counters.points,
                        "Skipping rest of file: {}",
                        err
                    );
                }
                Err(err)
            }
        }
    }

    fn classify(&self, file: FileId, point: Point, counters: &mut Counters) -> Result<()> {
        counters.points += 1;
        counters.extent.update(point.x, point.y);

        let mut matched = false;
        for footprint in self.registry.matches_for(&point) {
            matched = true;
            counters.hits += 1;
            if self.store.add_point(footprint.id, point, file)? == AddOutcome::Opened {
                counters.touched += 1;
            }
        }
        if !matched {
            counters.unmatched += 1;
        }

        if counters.points % PUBLISH_EVERY == 0 {
            counters.publish(&self.stats);
            if self.abort.load(Ordering::Relaxed) {
                return Err(SeparatorError::Aborted);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::FootprintId;
    use crate::footprint::tests::square;
    use crate::store::{LatePointPolicy, StoreLimits};
    use std::fs;

    const POLL: Duration = Duration::from_millis(5);

    fn limits() -> StoreLimits {
        StoreLimits {
            backlog_threshold: 100,
            max_resident_points: 1_000,
            late_points: LatePointPolicy::Reject,
        }
    }

    fn registry() -> FootprintRegistry {
        FootprintRegistry::new(
            vec![square(0, "f1", 0.0, 0.0, 10.0), square(1, "f2", 20.0, 20.0, 5.0)],
            8.0,
        )
    }

    #[test]
    fn classifies_points_of_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xyz");
        fs::write(&path, "5 5 1\n22 22 2\n15 15 3\n6 6 4\n").unwrap();
        let inputs = InputSet::from_paths(vec![path]).unwrap();

        let registry = registry();
        let store = AccumulationStore::new(limits());
        let stats = Arc::new(ProgressStats::default());
        let abort = AtomicBool::new(false);
        let ingestor = Ingestor::new(
            &registry,
            &store,
            &inputs,
            Arc::clone(&stats),
            &abort,
            POLL,
        );

        let report = ingestor.ingest(&inputs.files()[0]).unwrap();
        assert_eq!((report.points, report.hits, report.unmatched), (4, 3, 1));
        let extent = report.extent.unwrap();
        assert_eq!((extent.min_x, extent.max_x), (5.0, 22.0));
        assert!(inputs.is_finished(FileId(0)));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.points, 4);
        assert_eq!(snapshot.footprints_touched, 2);
        assert_eq!(snapshot.files, 1);
        assert_eq!(snapshot.bytes, inputs.total_bytes());

        assert_eq!(
            store.take(FootprintId(0)),
            Some(vec![Point::new(5.0, 5.0, 1.0), Point::new(6.0, 6.0, 4.0)])
        );
        assert_eq!(store.take(FootprintId(1)), Some(vec![Point::new(22.0, 22.0, 2.0)]));
    }

    #[test]
    fn malformed_file_keeps_points_before_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xyz");
        fs::write(&path, "5 5 1\nnot a point\n6 6 2\n").unwrap();
        let inputs = InputSet::from_paths(vec![path]).unwrap();

        let registry = registry();
        let store = AccumulationStore::new(limits());
        let stats = Arc::new(ProgressStats::default());
        let abort = AtomicBool::new(false);
        let ingestor = Ingestor::new(
            &registry,
            &store,
            &inputs,
            Arc::clone(&stats),
            &abort,
            POLL,
        );

        let err = ingestor.ingest(&inputs.files()[0]).unwrap_err();
        assert!(err.is_input_error());
        assert!(!abort.load(Ordering::Acquire));
        assert!(inputs.is_finished(FileId(0)));
        assert_eq!(stats.snapshot().bytes, inputs.total_bytes());
        assert_eq!(store.take(FootprintId(0)).map(|p| p.len()), Some(1));
    }

    #[test]
    fn late_arrival_raises_abort_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.xyz");
        fs::write(&path, "5 5 1\n").unwrap();
        let inputs = InputSet::from_paths(vec![path]).unwrap();

        let registry = registry();
        let store = AccumulationStore::new(limits());
        store.add_point(FootprintId(0), Point::new(1.0, 1.0, 0.0), FileId(0)).unwrap();
        store.pop_pending();
        store.take(FootprintId(0));

        let abort = AtomicBool::new(false);
        let ingestor = Ingestor::new(
            &registry,
            &store,
            &inputs,
            Arc::new(ProgressStats::default()),
            &abort,
            POLL,
        );
        let err = ingestor.ingest(&inputs.files()[0]).unwrap_err();
        assert!(matches!(err, SeparatorError::LateArrival(FootprintId(0))));
        assert!(abort.load(Ordering::Acquire));

        // Later files are not started once the run is aborting.
        let err = ingestor.ingest(&inputs.files()[0]).unwrap_err();
        assert!(matches!(err, SeparatorError::Aborted));
    }
}
