/// Flush controller moving accumulated points from memory to disk.
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::catalog::FootprintCatalog;
use crate::error::{Result, SeparatorError};
use crate::footprint::FootprintId;
use crate::input::InputSet;
use crate::point::Point;
use crate::progress::ProgressStats;
use crate::registry::FootprintRegistry;
use crate::store::{AccumulationStore, LatePointPolicy, TakeOutcome};
use crate::writer::FootprintWriter;

#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    /// Footprints written per mid-run batch.
    pub batch_size: usize,
    /// Longest sleep between two backlog checks.
    pub poll_interval: Duration,
}

/// Counts reported once the controller stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: u64,
    pub batch_flushes: u64,
    pub drain_flushes: u64,
}

/// Runs on its own thread next to the ingestion workers. While ingestion is
/// active it drains bounded batches whenever the store reports a backlog; once
/// ingestion has finished it drains every remaining footprint.
pub struct FlushController<'a> {
    /// Source of pending footprints and their points.
    store: &'a AccumulationStore,
    /// Geometry and names of the footprints being written.
    registry: &'a FootprintRegistry,
    /// Completion state and extents of the input files.
    inputs: &'a InputSet,
    /// Output files per footprint.
    writer: &'a FootprintWriter,
    /// Run-level record of everything written.
    catalog: &'a FootprintCatalog,
    stats: &'a ProgressStats,
    settings: FlushSettings,
}

impl<'a> FlushController<'a> {
    pub fn new(
        store: &'a AccumulationStore,
        registry: &'a FootprintRegistry,
        inputs: &'a InputSet,
        writer: &'a FootprintWriter,
        catalog: &'a FootprintCatalog,
        stats: &'a ProgressStats,
        settings: FlushSettings,
    ) -> Self {
        Self {
            store,
            registry,
            inputs,
            writer,
            catalog,
            stats,
            settings,
        }
    }

    /// Flush until `ingestion_done` is set, then drain everything.
    ///
    /// An aborting run still gets its final drain so nothing accumulated so
    /// far is lost.
    pub fn run(&self, ingestion_done: &AtomicBool, abort: &AtomicBool) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        loop {
            if ingestion_done.load(Ordering::Acquire) || abort.load(Ordering::Acquire) {
                break;
            }
            if !self.store.wait_for_backlog(self.settings.poll_interval) {
                continue;
            }

            let flushed = self.flush_batch()?;
            report.batches += 1;
            report.batch_flushes += flushed as u64;

            // Every pending footprint is still being written to.
            if flushed == 0 {
                thread::sleep(self.settings.poll_interval);
            }
        }

        // Workers may still be finishing their current file after an abort.
        while !ingestion_done.load(Ordering::Acquire) {
            thread::sleep(self.settings.poll_interval);
        }

        report.drain_flushes = self.drain()? as u64;
        info!(
            batches = report.batches,
            batch_flushes = report.batch_flushes,
            drain_flushes = report.drain_flushes,
            touched = self.store.touched(),
            "Flush controller finished"
        );
        Ok(report)
    }

    /// Flush up to `batch_size` complete footprints in FIFO order.
    ///
    /// A footprint is complete once every file that contributed to it has
    /// finished. When late points are rejected it must also be out of reach
    /// of every file not finished yet, including files not started. Others go
    /// back to the end of the queue. Each pending footprint is examined at
    /// most once.
    pub fn flush_batch(&self) -> Result<usize> {
        let mut flushed = 0;
        let mut examined = 0;
        let queued = self.store.pending_len();

        while flushed < self.settings.batch_size && examined < queued {
            let Some(id) = self.store.pop_pending() else {
                break;
            };
            examined += 1;

            if self.may_still_grow(id)? {
                self.store.requeue(id);
                continue;
            }
            match self
                .store
                .take_if_complete(id, |file| self.inputs.is_finished(file))
            {
                TakeOutcome::Taken(points) => {
                    self.persist(id, points)?;
                    flushed += 1;
                }
                TakeOutcome::Busy => self.store.requeue(id),
                TakeOutcome::Missing => {
                    error!(footprint = %id, "Pending footprint has no accumulation entry");
                    return Err(SeparatorError::MissingEntry(id));
                }
            }
        }

        debug!(
            flushed,
            examined,
            pending = self.store.pending_len(),
            resident = self.store.resident_points(),
            "Flushed batch"
        );
        self.store.record_flush_pass(flushed);
        Ok(flushed)
    }

    fn may_still_grow(&self, id: FootprintId) -> Result<bool> {
        if self.store.late_points() == LatePointPolicy::Reopen {
            return Ok(false);
        }
        let footprint = self
            .registry
            .get(id)
            .ok_or(SeparatorError::MissingEntry(id))?;
        Ok(self.inputs.may_still_reach(&footprint.extent))
    }

    /// Flush every pending footprint regardless of source completion.
    pub fn drain(&self) -> Result<usize> {
        let mut flushed = 0;
        while let Some(id) = self.store.pop_pending() {
            let points = self.store.take(id).ok_or_else(|| {
                error!(footprint = %id, "Pending footprint has no accumulation entry");
                SeparatorError::MissingEntry(id)
            })?;
            self.persist(id, points)?;
            flushed += 1;
        }

        if !self.store.is_empty() {
            error!(
                open_entries = self.store.open_entries(),
                "Entries left in the store after the final drain"
            );
        }
        Ok(flushed)
    }

    fn persist(&self, id: FootprintId, points: Vec<Point>) -> Result<()> {
        let footprint = self
            .registry
            .get(id)
            .ok_or(SeparatorError::MissingEntry(id))?;

        // Only footprints that reached disk are listed in the catalog.
        let total = self.catalog.recorded_points(id) + points.len() as u64;
        self.writer.write(footprint, &points, total)?;
        self.catalog.record(footprint, points.len());
        self.stats.footprint_flushed(points.len() as u64);
        Ok(())
    }
}
