//! Query latency accounting for the executor.
//!
//! One observation series per query label: business statement execution,
//! commit, and the loopback mark update. Observations land in
//! doubling-width buckets so the hot path is a handful of relaxed atomic
//! operations and no lock. Snapshots are cumulative and report in seconds;
//! quantiles are computed on the snapshot, not on the live counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Width of the first bucket, in microseconds. Anything faster is noise
/// next to a downstream round trip.
const BUCKET_FLOOR_US: u64 = 64;
/// Number of doubling buckets. The last one opens past half a minute,
/// beyond any statement a healthy downstream returns.
const BUCKET_COUNT: usize = 20;

/// Label of a timed downstream query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLabel {
    Exec,
    Commit,
    UpdateMarkTable,
}

impl QueryLabel {
    /// Label name as it appears in logs and dashboards.
    pub fn as_str(self) -> &'static str {
        match self {
            QueryLabel::Exec => "exec",
            QueryLabel::Commit => "commit",
            QueryLabel::UpdateMarkTable => "update_mark_table",
        }
    }

    fn slot(self) -> usize {
        match self {
            QueryLabel::Exec => 0,
            QueryLabel::Commit => 1,
            QueryLabel::UpdateMarkTable => 2,
        }
    }
}

/// Bucket index for a latency: bucket 0 is `[0, floor)`, bucket `i` is
/// `[floor * 2^(i-1), floor * 2^i)`, the last bucket absorbs the tail.
fn bucket_for(us: u64) -> usize {
    if us < BUCKET_FLOOR_US {
        return 0;
    }
    ((us / BUCKET_FLOOR_US).ilog2() as usize + 1).min(BUCKET_COUNT - 1)
}

/// Upper bound of bucket `idx`, in microseconds.
fn ceiling_us(idx: usize) -> u64 {
    BUCKET_FLOOR_US << idx
}

/// Live counters for one label.
struct LabelSeries {
    buckets: [AtomicU64; BUCKET_COUNT],
    sum_us: AtomicU64,
    slowest_us: AtomicU64,
}

impl Default for LabelSeries {
    fn default() -> Self {
        Self {
            buckets: [(); BUCKET_COUNT].map(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            slowest_us: AtomicU64::new(0),
        }
    }
}

impl LabelSeries {
    fn observe(&self, us: u64) {
        self.buckets[bucket_for(us)].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.slowest_us.fetch_max(us, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LabelSnapshot {
        let mut buckets = [0u64; BUCKET_COUNT];
        let mut samples = 0u64;
        for (slot, counter) in buckets.iter_mut().zip(&self.buckets) {
            *slot = counter.load(Ordering::Relaxed);
            samples += *slot;
        }
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        let slowest_us = self.slowest_us.load(Ordering::Relaxed);
        LabelSnapshot {
            samples,
            mean_secs: if samples == 0 {
                0.0
            } else {
                sum_us as f64 / samples as f64 / 1e6
            },
            slowest_secs: slowest_us as f64 / 1e6,
            buckets,
        }
    }
}

/// Cumulative view of one label's latency distribution, in seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelSnapshot {
    pub samples: u64,
    pub mean_secs: f64,
    pub slowest_secs: f64,
    buckets: [u64; BUCKET_COUNT],
}

impl LabelSnapshot {
    /// Latency below which a `q` share of the samples fall, `0.0..=1.0`.
    ///
    /// Resolution is the width of the bucket the rank lands in, and the
    /// answer never exceeds the slowest observation.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        let rank = (self.samples as f64 * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (idx, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let ceiling = ceiling_us(idx) as f64 / 1e6;
                return ceiling.min(self.slowest_secs);
            }
        }
        self.slowest_secs
    }
}

/// Per-executor query metrics keyed by [`QueryLabel`].
#[derive(Default)]
pub struct QueryMetrics {
    series: [LabelSeries; 3],
    /// Extension hook failures tolerated under the log-only policy.
    hook_failures: AtomicU64,
}

/// Point-in-time copy of all query metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMetricsSnapshot {
    pub exec: LabelSnapshot,
    pub commit: LabelSnapshot,
    pub update_mark_table: LabelSnapshot,
    pub hook_failures: u64,
}

impl QueryMetrics {
    /// Record one observation under `label`.
    pub fn observe(&self, label: QueryLabel, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.series[label.slot()].observe(us);
    }

    /// Count one tolerated hook failure.
    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative snapshot of every label.
    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        QueryMetricsSnapshot {
            exec: self.series[QueryLabel::Exec.slot()].snapshot(),
            commit: self.series[QueryLabel::Commit.slot()].snapshot(),
            update_mark_table: self.series[QueryLabel::UpdateMarkTable.slot()].snapshot(),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
        }
    }
}
