//! Time-bucket aggregation of analysis results
//!
//! Each bucket keeps its per-capture entries keyed by `(captured_at, capture_id)`
//! and derives its metrics from the full entry set on every change. Ingesting
//! the same result twice, or the same results split across batches in any
//! completion order, therefore yields the same bucket.
//!
//! Buckets are locked individually; the map lock is held only to find or
//! create a bucket. Every change is written through to the [`BucketSink`]
//! while the bucket lock is held, so writes for one bucket never reorder.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::MetricsConfig;
use crate::error::Result;
use crate::types::{bucket_start_for, AnalysisResult, Capture, CaptureRecord, FocusState, TimeBucket};

use super::scoring::{FocusScorer, LabelScorer};

/// Durable destination for bucket aggregates.
pub trait BucketSink: Send + Sync {
    fn upsert_bucket(&self, bucket: &TimeBucket) -> Result<()>;
}

/// What happened to one `ingest` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Entries folded into open buckets
    pub accepted: usize,
    /// Entries for windows that were already finalized
    pub late: usize,
    /// Buckets changed by this call
    pub buckets_touched: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Sample {
    Analyzed {
        label: String,
        state: FocusState,
        value: f64,
        duplicate: bool,
    },
    Unanalyzed,
}

type EntryKey = (DateTime<Utc>, Uuid);

#[derive(Debug)]
struct BucketState {
    start: DateTime<Utc>,
    entries: BTreeMap<EntryKey, Sample>,
}

impl BucketState {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            entries: BTreeMap::new(),
        }
    }

    /// Insert or replace an entry. An analyzed entry is never downgraded to a gap.
    fn put(&mut self, key: EntryKey, sample: Sample) {
        if matches!(sample, Sample::Unanalyzed)
            && matches!(self.entries.get(&key), Some(Sample::Analyzed { .. }))
        {
            return;
        }
        self.entries.insert(key, sample);
    }

    fn derive(&self, width: chrono::Duration, capture_interval_secs: u64) -> TimeBucket {
        let mut bucket = TimeBucket::empty(self.start, width);
        let mut value_sum = 0.0;
        let mut previous_label: Option<&str> = None;

        for sample in self.entries.values() {
            bucket.total_captures += 1;

            let Sample::Analyzed {
                label,
                state,
                value,
                duplicate,
            } = sample
            else {
                bucket.unanalyzed_captures += 1;
                continue;
            };

            *bucket.activity_counts.entry(label.clone()).or_insert(0) += 1;
            *bucket.focus_state_counts.entry(*state).or_insert(0) += 1;

            // An idle duplicate carries no new information about what the user is doing
            if *duplicate {
                continue;
            }

            value_sum += value;
            bucket.scored_captures += 1;
            bucket.active_seconds += capture_interval_secs;

            if let Some(prev) = previous_label {
                if prev != label.as_str() {
                    bucket.context_switches += 1;
                }
            }
            previous_label = Some(label.as_str());
        }

        if bucket.scored_captures > 0 {
            bucket.focus_score = (value_sum / bucket.scored_captures as f64).clamp(0.0, 100.0);
        }

        bucket
    }
}

/// Folds results into fixed-width buckets and finalizes them after a horizon.
pub struct MetricsAggregator {
    width: chrono::Duration,
    horizon: chrono::Duration,
    capture_interval_secs: u64,
    scorer: Arc<dyn FocusScorer>,
    sink: Option<Arc<dyn BucketSink>>,
    buckets: Mutex<HashMap<DateTime<Utc>, Arc<Mutex<BucketState>>>>,
    late: AtomicU64,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig, capture_interval: Duration) -> Self {
        Self {
            width: config.bucket_width(),
            horizon: config.finalization_horizon(),
            capture_interval_secs: capture_interval.as_secs(),
            scorer: Arc::new(LabelScorer::new(config.scoring.clone())),
            sink: None,
            buckets: Mutex::new(HashMap::new()),
            late: AtomicU64::new(0),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn FocusScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn BucketSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn bucket_width(&self) -> chrono::Duration {
        self.width
    }

    /// Whether the window containing `ts` is past its finalization horizon at `now`.
    pub fn is_finalized(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        bucket_start_for(ts, self.width) + self.width + self.horizon <= now
    }

    /// Earliest instant whose window is still open at `now`.
    pub fn open_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start_for(now - self.horizon - self.width, self.width) + self.width
    }

    pub fn ingest(&self, results: &[AnalysisResult]) -> IngestReport {
        self.ingest_at(results, Utc::now())
    }

    pub fn ingest_at(&self, results: &[AnalysisResult], now: DateTime<Utc>) -> IngestReport {
        let entries = results.iter().map(|r| {
            (
                (r.captured_at, r.capture_id),
                Sample::Analyzed {
                    label: r.activity_label.clone(),
                    state: r.focus_state,
                    value: self.scorer.score(r),
                    duplicate: r.duplicate,
                },
            )
        });
        self.apply(entries, now)
    }

    /// Record captures from a failed batch as explicit gaps.
    pub fn mark_unanalyzed(&self, captures: &[Capture]) -> IngestReport {
        self.mark_unanalyzed_at(captures, Utc::now())
    }

    pub fn mark_unanalyzed_at(&self, captures: &[Capture], now: DateTime<Utc>) -> IngestReport {
        let entries = captures
            .iter()
            .map(|c| ((c.captured_at, c.id), Sample::Unanalyzed));
        self.apply(entries, now)
    }

    /// Re-fold persisted capture rows after a restart.
    pub fn rebuild_from(&self, records: &[CaptureRecord], now: DateTime<Utc>) -> IngestReport {
        let entries = records.iter().map(|record| {
            let sample = match record.to_result() {
                Some(result) => Sample::Analyzed {
                    value: self.scorer.score(&result),
                    label: result.activity_label,
                    state: result.focus_state,
                    duplicate: result.duplicate,
                },
                None => Sample::Unanalyzed,
            };
            ((record.captured_at, record.capture_id), sample)
        });
        self.apply(entries, now)
    }

    fn apply(
        &self,
        entries: impl Iterator<Item = (EntryKey, Sample)>,
        now: DateTime<Utc>,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let mut grouped: BTreeMap<DateTime<Utc>, Vec<(EntryKey, Sample)>> = BTreeMap::new();

        for (key, sample) in entries {
            if self.is_finalized(key.0, now) {
                report.late += 1;
                continue;
            }
            grouped
                .entry(bucket_start_for(key.0, self.width))
                .or_default()
                .push((key, sample));
        }

        if report.late > 0 {
            self.late.fetch_add(report.late as u64, Ordering::Relaxed);
            tracing::warn!(late = report.late, "Rejected results for finalized windows");
        }

        for (start, bucket_entries) in grouped {
            let handle = {
                let mut buckets = self.buckets.lock().unwrap();
                Arc::clone(
                    buckets
                        .entry(start)
                        .or_insert_with(|| Arc::new(Mutex::new(BucketState::new(start)))),
                )
            };

            let mut state = handle.lock().unwrap();
            report.accepted += bucket_entries.len();
            for (key, sample) in bucket_entries {
                state.put(key, sample);
            }
            let bucket = state.derive(self.width, self.capture_interval_secs);
            self.write_through(&bucket);
            report.buckets_touched += 1;
        }

        report
    }

    /// Finalize every bucket whose end plus the horizon is at or before `now`.
    ///
    /// Finalized buckets are written one last time and evicted.
    pub fn finalize_due(&self, now: DateTime<Utc>) -> Vec<TimeBucket> {
        let due: Vec<Arc<Mutex<BucketState>>> = {
            let mut buckets = self.buckets.lock().unwrap();
            let keys: Vec<DateTime<Utc>> = buckets
                .keys()
                .filter(|start| **start + self.width + self.horizon <= now)
                .copied()
                .collect();
            keys.iter().filter_map(|k| buckets.remove(k)).collect()
        };

        let mut finalized: Vec<TimeBucket> = due
            .iter()
            .map(|handle| {
                let state = handle.lock().unwrap();
                let mut bucket = state.derive(self.width, self.capture_interval_secs);
                bucket.finalized = true;
                self.write_through(&bucket);
                bucket
            })
            .collect();
        finalized.sort_by_key(|b| b.bucket_start);

        if !finalized.is_empty() {
            tracing::debug!(count = finalized.len(), "Finalized buckets");
        }
        finalized
    }

    /// Write every open bucket through to the sink without finalizing it.
    pub fn flush_open(&self) -> Vec<TimeBucket> {
        let open = self.open_buckets();
        for bucket in &open {
            self.write_through(bucket);
        }
        open
    }

    /// Current aggregate of the bucket starting at `bucket_start`, if open.
    pub fn snapshot(&self, bucket_start: DateTime<Utc>) -> Option<TimeBucket> {
        let handle = self.buckets.lock().unwrap().get(&bucket_start).cloned()?;
        let state = handle.lock().unwrap();
        Some(state.derive(self.width, self.capture_interval_secs))
    }

    /// All open buckets, oldest first.
    pub fn open_buckets(&self) -> Vec<TimeBucket> {
        let handles: Vec<Arc<Mutex<BucketState>>> =
            self.buckets.lock().unwrap().values().cloned().collect();
        let mut open: Vec<TimeBucket> = handles
            .iter()
            .map(|h| h.lock().unwrap().derive(self.width, self.capture_interval_secs))
            .collect();
        open.sort_by_key(|b| b.bucket_start);
        open
    }

    /// Results rejected because their window was already finalized.
    pub fn late_results(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }

    fn write_through(&self, bucket: &TimeBucket) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.upsert_bucket(bucket) {
                tracing::warn!(
                    bucket_start = %bucket.bucket_start,
                    error = %e,
                    "Failed to persist bucket"
                );
            }
        }
    }
}
