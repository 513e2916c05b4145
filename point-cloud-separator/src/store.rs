/// Accumulation store: in-flight points per footprint plus the pending queue.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeparatorError};
use crate::footprint::FootprintId;
use crate::input::FileId;
use crate::point::Point;

/// What happens when a point arrives for an already flushed footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatePointPolicy {
    /// Fail the run with `SeparatorError::LateArrival`.
    #[default]
    Reject,
    /// Open a fresh entry and append to the footprint's output again.
    Reopen,
}

/// Thresholds that decide when the flush controller should run.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Pending footprints tolerated before a batch is due.
    pub backlog_threshold: usize,
    /// Points held in memory before a batch is due and workers hold off
    /// starting new files.
    pub max_resident_points: usize,
    pub late_points: LatePointPolicy,
}

/// Flush passes completed so far and what the last one achieved.
#[derive(Debug, Default)]
struct FlushPasses {
    completed: u64,
    last_flushed: usize,
}

/// Consecutive polls without a reported flush pass after which a worker
/// stops waiting for room.
const ROOM_WAIT_IDLE_POLLS: u32 = 4;

/// Result of appending a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First point for the footprint; it was queued for flushing.
    Opened,
    /// Appended to an existing entry.
    Appended,
    /// The footprint had been flushed and was opened again.
    Reopened,
}

/// Result of trying to take a pending footprint.
#[derive(Debug, PartialEq)]
pub enum TakeOutcome {
    Taken(Vec<Point>),
    /// A file that contributed points is still streaming.
    Busy,
    /// No open entry exists for the footprint.
    Missing,
}

#[derive(Debug)]
struct Accumulation {
    points: Vec<Point>,
    /// Input files that contributed at least one point.
    sources: Vec<FileId>,
}

#[derive(Debug)]
enum Slot {
    Open(Accumulation),
    Flushed,
}

impl Slot {
    fn close(&mut self) -> Option<Accumulation> {
        match std::mem::replace(self, Slot::Flushed) {
            Slot::Open(accumulation) => Some(accumulation),
            Slot::Flushed => None,
        }
    }
}

/// Points accumulated per footprint, shared by workers and the flusher.
///
/// Entries live in a sharded `DashMap`, so appends and takes for one key are
/// serialised by that key's shard lock while unrelated footprints proceed in
/// parallel. A taken entry leaves a `Flushed` marker behind, which makes a
/// late point for the same footprint detectable inside the same critical
/// section as the append.
#[derive(Debug)]
pub struct AccumulationStore {
    entries: DashMap<FootprintId, Slot>,
    /// Footprints with an open entry, oldest first.
    pending: Mutex<VecDeque<FootprintId>>,
    /// Signalled when a limit is crossed or ingestion state changes.
    backlog: Condvar,
    passes: Mutex<FlushPasses>,
    /// Signalled after every flush pass.
    room: Condvar,
    open_entries: AtomicUsize,
    resident_points: AtomicUsize,
    peak_resident_points: AtomicUsize,
    touched: AtomicUsize,
    limits: StoreLimits,
}

impl AccumulationStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            entries: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            backlog: Condvar::new(),
            passes: Mutex::new(FlushPasses::default()),
            room: Condvar::new(),
            open_entries: AtomicUsize::new(0),
            resident_points: AtomicUsize::new(0),
            peak_resident_points: AtomicUsize::new(0),
            touched: AtomicUsize::new(0),
            limits,
        }
    }

    /// Append a point for a footprint.
    ///
    /// The first point creates the entry and queues the footprint exactly
    /// once. Appends and takes for the same footprint are serialised, so a
    /// point is either part of a taken sequence or reported as late.
    pub fn add_point(&self, id: FootprintId, point: Point, source: FileId) -> Result<AddOutcome> {
        let (outcome, resident_before) = match self.entries.entry(id) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if let Slot::Open(accumulation) = slot {
                    accumulation.points.push(point);
                    if !accumulation.sources.contains(&source) {
                        accumulation.sources.push(source);
                    }
                    let before = self.resident_points.fetch_add(1, Ordering::AcqRel);
                    (AddOutcome::Appended, before)
                } else {
                    match self.limits.late_points {
                        LatePointPolicy::Reject => return Err(SeparatorError::LateArrival(id)),
                        LatePointPolicy::Reopen => {
                            *slot = Slot::Open(Accumulation {
                                points: vec![point],
                                sources: vec![source],
                            });
                            self.open_entries.fetch_add(1, Ordering::AcqRel);
                            let before = self.resident_points.fetch_add(1, Ordering::AcqRel);
                            (AddOutcome::Reopened, before)
                        }
                    }
                }
            }
            Entry::Vacant(entry) => {
                self.open_entries.fetch_add(1, Ordering::AcqRel);
                let before = self.resident_points.fetch_add(1, Ordering::AcqRel);
                entry.insert(Slot::Open(Accumulation {
                    points: vec![point],
                    sources: vec![source],
                }));
                (AddOutcome::Opened, before)
            }
        };

        self.peak_resident_points
            .fetch_max(resident_before + 1, Ordering::Relaxed);
        let mut crossed = resident_before == self.limits.max_resident_points;

        if outcome != AddOutcome::Appended {
            if outcome == AddOutcome::Opened {
                self.touched.fetch_add(1, Ordering::Relaxed);
            }
            // Queued only after the entry exists, so a pending id always has one.
            let depth = {
                let mut pending = self.pending.lock();
                pending.push_back(id);
                pending.len()
            };
            crossed |= depth == self.limits.backlog_threshold.saturating_add(1);
        }

        if crossed {
            self.backlog.notify_one();
        }

        Ok(outcome)
    }

    /// Remove and return the accumulated points unconditionally.
    pub fn take(&self, id: FootprintId) -> Option<Vec<Point>> {
        let accumulation = self.entries.get_mut(&id)?.close()?;
        Some(self.release(accumulation))
    }

    /// Take the entry only when every contributing file has finished.
    pub fn take_if_complete<F>(&self, id: FootprintId, is_finished: F) -> TakeOutcome
    where
        F: Fn(FileId) -> bool,
    {
        let Some(mut slot) = self.entries.get_mut(&id) else {
            return TakeOutcome::Missing;
        };
        let complete = match slot.value() {
            Slot::Flushed => return TakeOutcome::Missing,
            Slot::Open(accumulation) => accumulation.sources.iter().all(|&s| is_finished(s)),
        };
        if !complete {
            return TakeOutcome::Busy;
        }

        let accumulation = slot.value_mut().close();
        drop(slot);
        match accumulation {
            Some(accumulation) => TakeOutcome::Taken(self.release(accumulation)),
            None => TakeOutcome::Missing,
        }
    }

    fn release(&self, accumulation: Accumulation) -> Vec<Point> {
        self.resident_points
            .fetch_sub(accumulation.points.len(), Ordering::AcqRel);
        self.open_entries.fetch_sub(1, Ordering::AcqRel);
        accumulation.points
    }

    /// Oldest pending footprint.
    pub fn pop_pending(&self) -> Option<FootprintId> {
        self.pending.lock().pop_front()
    }

    /// Put a footprint that could not be flushed yet at the back of the queue.
    pub fn requeue(&self, id: FootprintId) {
        self.pending.lock().push_back(id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Points currently held in memory across all open entries.
    pub fn resident_points(&self) -> usize {
        self.resident_points.load(Ordering::Acquire)
    }

    /// Highest resident point count seen so far.
    pub fn peak_resident_points(&self) -> usize {
        self.peak_resident_points.load(Ordering::Relaxed)
    }

    pub fn late_points(&self) -> LatePointPolicy {
        self.limits.late_points
    }

    pub fn open_entries(&self) -> usize {
        self.open_entries.load(Ordering::Acquire)
    }

    /// Footprints that received at least one point.
    pub fn touched(&self) -> usize {
        self.touched.load(Ordering::Relaxed)
    }

    /// True when no points are held and nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.open_entries() == 0 && self.pending.lock().is_empty()
    }

    /// Whether backlog depth or resident points exceed their limits.
    pub fn needs_flush(&self) -> bool {
        let depth = self.pending.lock().len();
        self.over_limits(depth)
    }

    fn over_limits(&self, depth: usize) -> bool {
        depth > self.limits.backlog_threshold
            || self.resident_points() > self.limits.max_resident_points
    }

    /// Block until a limit is exceeded, `wake` is called, or `timeout` passes.
    ///
    /// Returns whether a flush is needed.
    pub fn wait_for_backlog(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if self.over_limits(pending.len()) {
            return true;
        }
        self.backlog.wait_for(&mut pending, timeout);
        self.over_limits(pending.len())
    }

    /// Wake the flush controller, e.g. once ingestion has finished.
    pub fn wake(&self) {
        self.backlog.notify_all();
    }

    /// Called by the flush controller after each mid-run pass.
    pub fn record_flush_pass(&self, flushed: usize) {
        let mut passes = self.passes.lock();
        passes.completed += 1;
        passes.last_flushed = flushed;
        self.room.notify_all();
    }

    /// Hold a worker between files while resident points exceed the ceiling.
    ///
    /// Returns once the flusher has brought the count back under the ceiling,
    /// once a pass that started after this call flushed nothing (the rest
    /// waits on files still streaming), when no pass is reported for several
    /// polls, or when `abort` is raised. Returns whether the worker waited.
    pub fn wait_for_room(&self, poll: Duration, abort: &AtomicBool) -> bool {
        if self.resident_points() <= self.limits.max_resident_points {
            return false;
        }
        self.backlog.notify_one();

        let mut passes = self.passes.lock();
        // A pass already running may have started before the caller's file
        // was marked finished; only the one after it is conclusive.
        let conclusive = passes.completed + 2;
        let mut idle_polls = 0;

        while self.resident_points() > self.limits.max_resident_points
            && !abort.load(Ordering::Acquire)
        {
            if passes.completed >= conclusive && passes.last_flushed == 0 {
                break;
            }
            let seen = passes.completed;
            self.room.wait_for(&mut passes, poll);
            if passes.completed == seen {
                idle_polls += 1;
                if idle_polls >= ROOM_WAIT_IDLE_POLLS {
                    break;
                }
            } else {
                idle_polls = 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn limits(backlog_threshold: usize, max_resident_points: usize) -> StoreLimits {
        StoreLimits {
            backlog_threshold,
            max_resident_points,
            late_points: LatePointPolicy::Reject,
        }
    }

    fn p(i: usize) -> Point {
        Point::new(i as f64, 0.0, 0.0)
    }

    #[test]
    fn first_point_queues_footprint_once() {
        let store = AccumulationStore::new(limits(10, 100));
        let id = FootprintId(4);

        assert_eq!(store.add_point(id, p(0), FileId(0)).unwrap(), AddOutcome::Opened);
        assert_eq!(store.add_point(id, p(1), FileId(1)).unwrap(), AddOutcome::Appended);
        assert_eq!(store.add_point(id, p(2), FileId(0)).unwrap(), AddOutcome::Appended);

        assert_eq!(store.pending_len(), 1);
        assert_eq!(store.resident_points(), 3);
        assert_eq!(store.touched(), 1);

        assert_eq!(store.pop_pending(), Some(id));
        assert_eq!(store.take(id), Some(vec![p(0), p(1), p(2)]));
        assert!(store.is_empty());
        assert_eq!(store.resident_points(), 0);
    }

    #[test]
    fn take_of_unknown_or_flushed_footprint_is_none() {
        let store = AccumulationStore::new(limits(10, 100));
        assert_eq!(store.take(FootprintId(1)), None);

        store.add_point(FootprintId(1), p(0), FileId(0)).unwrap();
        assert!(store.take(FootprintId(1)).is_some());
        assert_eq!(store.take(FootprintId(1)), None);
        assert_eq!(
            store.take_if_complete(FootprintId(1), |_| true),
            TakeOutcome::Missing
        );
    }

    #[test]
    fn late_point_is_rejected_after_flush() {
        let store = AccumulationStore::new(limits(10, 100));
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();
        store.pop_pending();
        store.take(FootprintId(0));

        let err = store.add_point(FootprintId(0), p(1), FileId(0)).unwrap_err();
        assert!(matches!(err, SeparatorError::LateArrival(FootprintId(0))));
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.resident_points(), 0);
    }

    #[test]
    fn late_point_reopens_when_allowed() {
        let store = AccumulationStore::new(StoreLimits {
            late_points: LatePointPolicy::Reopen,
            ..limits(10, 100)
        });
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();
        store.pop_pending();
        store.take(FootprintId(0));

        assert_eq!(
            store.add_point(FootprintId(0), p(1), FileId(1)).unwrap(),
            AddOutcome::Reopened
        );
        assert_eq!(store.pending_len(), 1);
        assert_eq!(store.touched(), 1);
        assert_eq!(store.take(FootprintId(0)), Some(vec![p(1)]));
    }

    #[test]
    fn busy_until_all_sources_finish() {
        let store = AccumulationStore::new(limits(10, 100));
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();
        store.add_point(FootprintId(0), p(1), FileId(1)).unwrap();

        assert_eq!(
            store.take_if_complete(FootprintId(0), |file| file == FileId(0)),
            TakeOutcome::Busy
        );
        assert_eq!(store.resident_points(), 2);
        assert_eq!(
            store.take_if_complete(FootprintId(0), |_| true),
            TakeOutcome::Taken(vec![p(0), p(1)])
        );
    }

    #[test]
    fn reports_limits() {
        let store = AccumulationStore::new(limits(1, 3));
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();
        assert!(!store.needs_flush());
        store.add_point(FootprintId(1), p(1), FileId(0)).unwrap();
        assert!(store.needs_flush());

        let store = AccumulationStore::new(limits(10, 3));
        for i in 0..4 {
            store.add_point(FootprintId(0), p(i), FileId(0)).unwrap();
        }
        assert!(store.needs_flush());
        assert!(store.wait_for_backlog(Duration::from_millis(1)));
    }

    #[test]
    fn wait_times_out_below_limits() {
        let store = AccumulationStore::new(limits(10, 100));
        assert!(!store.wait_for_backlog(Duration::from_millis(5)));
    }

    #[test]
    fn backlog_crossing_wakes_waiter() {
        let store = Arc::new(AccumulationStore::new(limits(2, 1_000)));
        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.wait_for_backlog(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        for id in 0..3 {
            store.add_point(FootprintId(id), p(0), FileId(0)).unwrap();
        }
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn tracks_peak_resident_points() {
        let store = AccumulationStore::new(limits(10, 100));
        for i in 0..5 {
            store.add_point(FootprintId(0), p(i), FileId(0)).unwrap();
        }
        store.take(FootprintId(0));
        store.add_point(FootprintId(1), p(0), FileId(0)).unwrap();

        assert_eq!(store.resident_points(), 1);
        assert_eq!(store.peak_resident_points(), 5);
    }

    #[test]
    fn room_wait_returns_at_once_below_ceiling() {
        let store = AccumulationStore::new(limits(10, 2));
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();
        assert!(!store.wait_for_room(Duration::from_secs(10), &AtomicBool::new(false)));
    }

    #[test]
    fn room_wait_ends_when_flusher_frees_points() {
        let store = Arc::new(AccumulationStore::new(limits(10, 1)));
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();
        store.add_point(FootprintId(1), p(1), FileId(0)).unwrap();

        let flusher = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.take(FootprintId(0));
                store.record_flush_pass(1);
            })
        };
        assert!(store.wait_for_room(Duration::from_secs(10), &AtomicBool::new(false)));
        assert!(store.resident_points() <= 1);
        flusher.join().unwrap();
    }

    #[test]
    fn room_wait_gives_up_on_a_stalled_flusher() {
        let store = Arc::new(AccumulationStore::new(limits(10, 0)));
        store.add_point(FootprintId(0), p(0), FileId(0)).unwrap();

        let flusher = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..2 {
                    thread::sleep(Duration::from_millis(10));
                    store.record_flush_pass(0);
                }
            })
        };
        assert!(store.wait_for_room(Duration::from_secs(10), &AtomicBool::new(false)));
        assert_eq!(store.resident_points(), 1);
        flusher.join().unwrap();

        // Without any flusher the wait ends after a few idle polls.
        assert!(store.wait_for_room(Duration::from_millis(2), &AtomicBool::new(false)));
    }

    #[test]
    fn concurrent_appends_and_takes_lose_nothing() {
        const WRITERS: usize = 8;
        const POINTS_PER_WRITER: usize = 5_000;
        const FOOTPRINTS: u32 = 16;

        let store = Arc::new(AccumulationStore::new(StoreLimits {
            late_points: LatePointPolicy::Reopen,
            ..limits(0, usize::MAX)
        }));

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..POINTS_PER_WRITER {
                        let id = FootprintId((i as u32) % FOOTPRINTS);
                        let point = Point::new(w as f64, i as f64, 0.0);
                        store.add_point(id, point, FileId(w as u32)).unwrap();
                    }
                })
            })
            .collect();

        // Flush concurrently with the writers.
        let mut flushed = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            if let Some(id) = store.pop_pending() {
                flushed.extend(store.take(id).expect("pending footprint has an entry"));
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        while let Some(id) = store.pop_pending() {
            flushed.extend(store.take(id).expect("pending footprint has an entry"));
        }

        assert!(store.is_empty());
        assert_eq!(flushed.len(), WRITERS * POINTS_PER_WRITER);
        let mut keys: Vec<_> = flushed.iter().map(|p| (p.x as usize, p.y as usize)).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), WRITERS * POINTS_PER_WRITER);
    }
}
