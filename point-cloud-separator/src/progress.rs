/// Run statistics and the periodic status line.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Counters shared by workers, the flush controller and the reporter.
///
/// All updates are relaxed: readers only need a best-effort view.
#[derive(Debug, Default)]
pub struct ProgressStats {
    bytes: AtomicU64,
    files: AtomicU64,
    points: AtomicU64,
    hits: AtomicU64,
    unmatched: AtomicU64,
    footprints_touched: AtomicU64,
    footprints_flushed: AtomicU64,
    points_flushed: AtomicU64,
}

impl ProgressStats {
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish a worker's locally accumulated counts.
    pub fn add_classified(&self, points: u64, hits: u64, unmatched: u64, touched: u64) {
        self.points.fetch_add(points, Ordering::Relaxed);
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.unmatched.fetch_add(unmatched, Ordering::Relaxed);
        self.footprints_touched.fetch_add(touched, Ordering::Relaxed);
    }

    pub fn footprint_flushed(&self, points: u64) {
        self.footprints_flushed.fetch_add(1, Ordering::Relaxed);
        self.points_flushed.fetch_add(points, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            points: self.points.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            footprints_touched: self.footprints_touched.load(Ordering::Relaxed),
            footprints_flushed: self.footprints_flushed.load(Ordering::Relaxed),
            points_flushed: self.points_flushed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `ProgressStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub files: u64,
    pub points: u64,
    /// Footprint memberships recorded; one point may hit several footprints.
    pub hits: u64,
    pub unmatched: u64,
    pub footprints_touched: u64,
    pub footprints_flushed: u64,
    pub points_flushed: u64,
}

impl StatsSnapshot {
    /// Share of classified points that fell outside every footprint.
    pub fn unmatched_ratio(&self) -> f64 {
        if self.points == 0 {
            0.0
        } else {
            self.unmatched as f64 / self.points as f64
        }
    }
}

/// One formatted status line.
#[derive(Debug, Clone, Copy)]
pub struct StatusLine {
    pub stats: StatsSnapshot,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl StatusLine {
    /// Fraction of input bytes consumed, clamped to `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.stats.bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    /// Linear estimate of the remaining time, once any progress was made.
    pub fn remaining(&self) -> Option<Duration> {
        let progress = self.progress();
        if progress <= 0.0 {
            return None;
        }
        let remaining = self.elapsed.as_secs_f64() * (1.0 - progress) / progress;
        Some(Duration::from_secs_f64(remaining))
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eta = self
            .remaining()
            .map(format_hours_minutes)
            .unwrap_or_else(|| "-:--".to_string());
        write!(
            f,
            "{}B, {:>3} files, {} points, {} hits, {} b, {:.1}%, {} / -{}",
            format_number(self.stats.bytes),
            self.stats.files,
            format_number(self.stats.points),
            format_number(self.stats.hits),
            self.stats.footprints_touched,
            self.progress() * 100.0,
            format_hours_minutes(self.elapsed),
            eta
        )
    }
}

/// Compact magnitude formatting: `250`, `45.6K`, `1.23M`, ` 123G`.
///
/// Switches to the next suffix half an order of magnitude early, so values
/// just below a thousand print as e.g. `0.40K`.
pub fn format_number(value: u64) -> String {
    const SUFFIXES: [char; 7] = [' ', 'K', 'M', 'G', 'T', 'P', 'E'];

    if value == 0 {
        return "0".to_string();
    }
    let step = (((value as f64).log10() + 0.5) / 3.0).floor() as usize;
    if step == 0 {
        return value.to_string();
    }
    let step = step.min(SUFFIXES.len() - 1);
    let scaled = value as f64 / 10f64.powi(3 * step as i32);
    let suffix = SUFFIXES[step];
    if scaled < 10.0 {
        format!("{:.2}{}", scaled, suffix)
    } else if scaled < 100.0 {
        format!("{:.1}{}", scaled, suffix)
    } else {
        format!(" {:.0}{}", scaled, suffix)
    }
}

/// `h:mm`.
pub fn format_hours_minutes(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}", secs / 3600, (secs % 3600) / 60)
}

/// Emits the status line while ingestion runs.
pub struct ProgressReporter {
    stats: Arc<ProgressStats>,
    bar: ProgressBar,
    total_bytes: u64,
    started: Instant,
    interval: Duration,
    min_points: u64,
}

impl ProgressReporter {
    /// Create a reporter; a hidden bar is used when `visible` is false.
    pub fn new(
        stats: Arc<ProgressStats>,
        total_bytes: u64,
        interval: Duration,
        min_points: u64,
        visible: bool,
    ) -> Self {
        let bar = if visible {
            ProgressBar::new(total_bytes)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.green/blue}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏"),
        );

        Self {
            stats,
            bar,
            total_bytes,
            started: Instant::now(),
            interval,
            min_points,
        }
    }

    pub fn status(&self) -> StatusLine {
        StatusLine {
            stats: self.stats.snapshot(),
            total_bytes: self.total_bytes,
            elapsed: self.started.elapsed(),
        }
    }

    /// Report until `done` is set. Wake the thread with `unpark` to stop promptly.
    pub fn run(&self, done: &AtomicBool) {
        let mut last_points = 0;
        while !done.load(Ordering::Acquire) {
            thread::park_timeout(self.interval);
            if done.load(Ordering::Acquire) {
                break;
            }

            // Skip lines when almost nothing happened since the last one.
            let status = self.status();
            if status.stats.points.saturating_sub(last_points) < self.min_points {
                continue;
            }
            last_points = status.stats.points;
            self.emit(&status);
        }
    }

    fn emit(&self, status: &StatusLine) {
        self.bar.set_position(status.stats.bytes);
        self.bar.set_message(status.to_string());
        debug!(status = %status, "Progress");
    }

    /// Print the final line and clear the bar.
    pub fn finish(&self) -> StatusLine {
        let status = self.status();
        self.emit(&status);
        self.bar.finish_with_message(status.to_string());
        status
    }
}
