//! Cadence driver for the capture-to-metrics pipeline.
//!
//! The RUNNING loop only schedules. Database writes happen elsewhere: a
//! journal task writes every batch update to the recovery log before the
//! batch is launched, and each analysis task commits its own outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::{AnalysisClient, AnalysisOutcome, AnalysisStatsSnapshot, RetryPolicy, VisionAnalyzer};
use crate::analytics::{BucketSink, MetricsAggregator};
use crate::batch::{AddOutcome, BatchAccumulator, BatchUpdate};
use crate::capture::{CaptureSource, ImageNormalizer};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{Batch, BatchState, Capture, CaptureRecord};

use super::ServiceState;

const SHUTDOWN_GRACE_REASON: &str = "shutdown grace expired";

/// Counters from one run of the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Pending batches found in the recovery log at startup
    pub recovered_batches: usize,
    /// Captures added to a batch
    pub captures: u64,
    pub capture_errors: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    /// Batches left in the recovery log by shutdown
    pub batches_interrupted: u64,
    /// Results rejected because their window was already finalized
    pub late_results: u64,
    pub analysis: AnalysisStatsSnapshot,
}

/// Owns the pipeline and drives it until the shutdown token is cancelled.
pub struct ServiceRunner {
    config: Config,
    source: Arc<dyn CaptureSource>,
    normalizer: Arc<ImageNormalizer>,
    analysis: AnalysisClient,
    aggregator: Arc<MetricsAggregator>,
    db: Arc<Database>,
    state: watch::Sender<ServiceState>,
}

/// How an analysis task left its batch.
enum Settled {
    Completed { late: usize },
    Failed { late: usize },
    Interrupted,
    /// Still analyzing when the shutdown grace period ran out; payload-free
    Expired(Batch),
}

/// Mutable scheduling state for the RUNNING loop.
struct Pipeline {
    accumulator: BatchAccumulator,
    /// Journal task; hands its update receiver back when stopped
    journal: JoinSet<mpsc::UnboundedReceiver<BatchUpdate>>,
    journal_stop: CancellationToken,
    /// Flushed batches already in the recovery log
    recorded_rx: mpsc::UnboundedReceiver<Batch>,
    captures: JoinSet<Result<Capture>>,
    /// Set while a capture job occupies the blocking pool, even after its task timed out
    capture_busy: Arc<AtomicBool>,
    inflight: JoinSet<Result<Settled>>,
    grace_expired: CancellationToken,
    consecutive_capture_errors: u32,
    skip_next_tick: bool,
    last_prune: Option<Instant>,
    summary: RunSummary,
}

/// Marks a capture job as running until dropped.
struct CaptureBusy(Arc<AtomicBool>);

impl CaptureBusy {
    fn claim(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Release);
        Self(Arc::clone(flag))
    }
}

impl Drop for CaptureBusy {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ServiceRunner {
    pub fn new(
        config: Config,
        source: Arc<dyn CaptureSource>,
        analyzer: Arc<dyn VisionAnalyzer>,
        db: Arc<Database>,
    ) -> Self {
        let normalizer = Arc::new(ImageNormalizer::from_config(&config.capture));
        let analysis = AnalysisClient::new(
            analyzer,
            config.analysis.analysis_concurrency,
            RetryPolicy::from_config(&config.analysis),
        );
        let sink: Arc<dyn BucketSink> = Arc::clone(&db) as Arc<dyn BucketSink>;
        let aggregator = Arc::new(
            MetricsAggregator::new(&config.metrics, config.capture.interval()).with_sink(sink),
        );
        let (state, _) = watch::channel(ServiceState::Stopped);

        Self {
            config,
            source,
            normalizer,
            analysis,
            aggregator,
            db,
            state,
        }
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Run until `shutdown` is cancelled, then drain and return counters.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunSummary> {
        self.set_state(ServiceState::Starting);

        let (accumulator, updates_rx) = BatchAccumulator::new(&self.config.batch);
        let (recorded_tx, recorded_rx) = mpsc::unbounded_channel();
        let journal_stop = CancellationToken::new();
        let mut journal = JoinSet::new();
        journal.spawn(run_journal(
            Arc::clone(&self.db),
            updates_rx,
            recorded_tx,
            journal_stop.clone(),
        ));

        let mut pipeline = Pipeline {
            accumulator,
            journal,
            journal_stop,
            recorded_rx,
            captures: JoinSet::new(),
            capture_busy: Arc::new(AtomicBool::new(false)),
            inflight: JoinSet::new(),
            grace_expired: CancellationToken::new(),
            consecutive_capture_errors: 0,
            skip_next_tick: false,
            last_prune: None,
            summary: RunSummary::default(),
        };

        self.recover(&mut pipeline).await;

        self.set_state(ServiceState::Running);
        tracing::info!(
            interval_secs = self.config.capture.screenshot_interval_seconds,
            batch_size = self.config.batch.batch_size,
            concurrency = self.config.analysis.analysis_concurrency,
            "Service running"
        );

        let mut capture_ticker = tokio::time::interval(self.config.capture.interval());
        capture_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance_ticker = tokio::time::interval(self.config.service.maintenance_interval());
        maintenance_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(batch) = pipeline.recorded_rx.recv() => {
                    self.launch(batch, &mut pipeline);
                }
                Some(joined) = pipeline.inflight.join_next(), if !pipeline.inflight.is_empty() => {
                    self.handle_settled(joined, &mut pipeline).await;
                }
                Some(joined) = pipeline.captures.join_next(), if !pipeline.captures.is_empty() => {
                    self.handle_capture(joined, &mut pipeline);
                }
                _ = capture_ticker.tick() => {
                    if pipeline.skip_next_tick {
                        pipeline.skip_next_tick = false;
                        tracing::debug!("Skipping capture tick after repeated failures");
                    } else if pipeline.capture_busy.load(Ordering::Acquire) {
                        tracing::debug!("Previous capture still running, skipping tick");
                    } else {
                        self.spawn_capture(&mut pipeline);
                    }
                }
                _ = maintenance_ticker.tick() => {
                    self.maintain(&mut pipeline).await;
                }
            }
        }

        self.set_state(ServiceState::Stopping);
        tracing::info!("Shutdown requested, draining pipeline");
        let summary = self.drain(pipeline).await;

        self.set_state(ServiceState::Stopped);
        tracing::info!(
            captures = summary.captures,
            completed = summary.batches_completed,
            failed = summary.batches_failed,
            interrupted = summary.batches_interrupted,
            "Service stopped"
        );
        Ok(summary)
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
        tracing::debug!(state = %state, "Service state changed");
    }

    // ============================================
    // Starting
    // ============================================

    async fn recover(&self, pipeline: &mut Pipeline) {
        let db = Arc::clone(&self.db);
        let aggregator = Arc::clone(&self.aggregator);

        let loaded = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let snapshot = db.load_unflushed_state(aggregator.open_since(now))?;
            let report = aggregator.rebuild_from(&snapshot.open_captures, now);
            Ok::<_, Error>((snapshot.pending_batches, snapshot.open_captures.len(), report))
        })
        .await
        .map_err(|e| Error::Recovery(format!("recovery worker failed: {}", e)))
        .and_then(|r| r);

        match loaded {
            Ok((pending, rebuilt, report)) => {
                tracing::info!(
                    pending_batches = pending.len(),
                    rebuilt_captures = rebuilt,
                    buckets = report.buckets_touched,
                    "Recovered state"
                );
                pipeline.summary.recovered_batches = pending.len();
                for batch in pending {
                    tracing::info!(
                        batch_id = %batch.id,
                        captures = batch.len(),
                        attempts = batch.attempts,
                        "Re-submitting pending batch"
                    );
                    self.launch(batch, pipeline);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Recovery failed, starting clean");
            }
        }
    }

    // ============================================
    // Capture
    // ============================================

    fn spawn_capture(&self, pipeline: &mut Pipeline) {
        let source = Arc::clone(&self.source);
        let normalizer = Arc::clone(&self.normalizer);
        let timeout = self.config.capture.timeout();
        let busy = CaptureBusy::claim(&pipeline.capture_busy);

        pipeline.captures.spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                let _busy = busy;
                let raw = source.capture()?;
                normalizer.normalize(raw)
            });
            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(Error::Capture(format!("capture worker failed: {}", e))),
                Err(_) => Err(Error::Capture(format!("capture timed out after {:?}", timeout))),
            }
        });
    }

    fn handle_capture(&self, joined: std::result::Result<Result<Capture>, JoinError>, pipeline: &mut Pipeline) {
        let result = joined.unwrap_or_else(|e| Err(Error::Capture(format!("capture task failed: {}", e))));

        match result {
            Ok(capture) => {
                pipeline.consecutive_capture_errors = 0;
                pipeline.summary.captures += 1;
                let capture_id = capture.id;
                match pipeline.accumulator.add(capture) {
                    AddOutcome::Queued { batch_id, position } => {
                        tracing::debug!(%capture_id, %batch_id, position, "Capture queued");
                    }
                    AddOutcome::Flushed { batch_id, captures } => {
                        tracing::debug!(%capture_id, %batch_id, captures, "Capture filled batch");
                    }
                }
            }
            Err(e) => {
                pipeline.consecutive_capture_errors += 1;
                pipeline.summary.capture_errors += 1;
                let limit = self.config.capture.max_consecutive_errors.max(1);

                if pipeline.consecutive_capture_errors >= limit {
                    tracing::error!(
                        consecutive = pipeline.consecutive_capture_errors,
                        error = %e,
                        "Repeated capture failures, backing off one interval"
                    );
                    pipeline.consecutive_capture_errors = 0;
                    pipeline.skip_next_tick = true;
                } else {
                    tracing::warn!(
                        consecutive = pipeline.consecutive_capture_errors,
                        error = %e,
                        "Capture failed, skipping tick"
                    );
                }
            }
        }
    }

    // ============================================
    // Analysis
    // ============================================

    /// Hand a recorded batch to the analysis pool. The task commits its own outcome.
    fn launch(&self, batch: Batch, pipeline: &mut Pipeline) {
        let client = self.analysis.clone();
        let db = Arc::clone(&self.db);
        let aggregator = Arc::clone(&self.aggregator);
        let grace_expired = pipeline.grace_expired.clone();

        pipeline.inflight.spawn(async move {
            let manifest = manifest_of(&batch);
            mark_analyzing(&db, batch.id).await;

            let outcome = tokio::select! {
                biased;
                outcome = client.analyze(batch) => outcome,
                _ = grace_expired.cancelled() => return Ok(Settled::Expired(manifest)),
            };

            tokio::task::spawn_blocking(move || commit_outcome(&db, &aggregator, outcome))
                .await
                .map_err(|e| Error::Persistence(format!("commit worker failed: {}", e)))
        });
    }

    async fn handle_settled(
        &self,
        joined: std::result::Result<Result<Settled>, JoinError>,
        pipeline: &mut Pipeline,
    ) {
        let summary = &mut pipeline.summary;
        match joined {
            Ok(Ok(Settled::Completed { late })) => {
                summary.batches_completed += 1;
                summary.late_results += late as u64;
            }
            Ok(Ok(Settled::Failed { late })) => {
                summary.batches_failed += 1;
                summary.late_results += late as u64;
            }
            Ok(Ok(Settled::Interrupted)) => summary.batches_interrupted += 1,
            Ok(Ok(Settled::Expired(batch))) => {
                summary.batches_failed += 1;
                let batch_id = batch.id;
                let attempts = batch.attempts;
                let db = Arc::clone(&self.db);
                let aggregator = Arc::clone(&self.aggregator);
                let joined = tokio::task::spawn_blocking(move || {
                    fail_with_gaps(&db, &aggregator, &batch, attempts, SHUTDOWN_GRACE_REASON)
                })
                .await;
                match joined {
                    Ok(late) => summary.late_results += late as u64,
                    Err(e) => tracing::error!(%batch_id, error = %e, "Commit worker failed"),
                }
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to commit batch outcome"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                // The batch stays in the recovery log and is replayed next start
                tracing::error!(error = %e, "Analysis task panicked");
            }
        }
    }

    // ============================================
    // Maintenance
    // ============================================

    async fn maintain(&self, pipeline: &mut Pipeline) {
        let prune_every = Duration::from_secs(self.config.retention.prune_interval_minutes.max(1) * 60);
        let prune_due = pipeline
            .last_prune
            .map_or(true, |last| last.elapsed() >= prune_every);
        if prune_due {
            pipeline.last_prune = Some(Instant::now());
        }

        let db = Arc::clone(&self.db);
        let aggregator = Arc::clone(&self.aggregator);
        let retention = self.config.retention.retention();

        let joined = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let finalized = aggregator.finalize_due(now);
            if !finalized.is_empty() {
                tracing::info!(count = finalized.len(), "Finalized buckets");
            }

            if prune_due {
                match db.prune(now - retention) {
                    Ok(stats) if stats.total() > 0 => {
                        tracing::info!(
                            captures = stats.captures,
                            buckets = stats.buckets,
                            batch_events = stats.batch_events,
                            "Pruned old records"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Prune failed"),
                }
            }
        })
        .await;

        if let Err(e) = joined {
            tracing::error!(error = %e, "Maintenance worker failed");
        }
    }

    // ============================================
    // Stopping
    // ============================================

    async fn drain(&self, mut pipeline: Pipeline) -> RunSummary {
        pipeline.captures.abort_all();

        // Nothing is added after this, so the update channel goes quiet.
        let partial = pipeline.accumulator.force_flush();

        // Flushed batches the journal had not reached, then the partial OPEN
        // batch, go to the recovery log without being analyzed.
        pipeline.journal_stop.cancel();
        match pipeline.journal.join_next().await {
            Some(Ok(mut updates)) => {
                while let Ok(update) = updates.try_recv() {
                    // Appends are covered by their batch's flush
                    if let BatchUpdate::Flushed(batch) = update {
                        record_pending(&self.db, batch).await;
                    }
                }
            }
            Some(Err(e)) => tracing::error!(error = %e, "Journal task failed"),
            None => {}
        }
        if let Some(batch) = partial {
            tracing::info!(batch_id = %batch.id, captures = batch.len(), "Flushed partial batch for next start");
            record_pending(&self.db, batch).await;
        }

        let mut unlaunched = 0;
        while pipeline.recorded_rx.try_recv().is_ok() {
            unlaunched += 1;
        }
        if unlaunched > 0 {
            tracing::info!(batches = unlaunched, "Recorded batches left for next start");
        }

        self.analysis.cancel_queued();

        let deadline = Instant::now() + self.config.service.shutdown_grace();
        loop {
            match tokio::time::timeout_at(deadline, pipeline.inflight.join_next()).await {
                Ok(Some(joined)) => self.handle_settled(joined, &mut pipeline).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = pipeline.inflight.len(),
                        "Shutdown grace expired, abandoning in-flight analysis"
                    );
                    pipeline.grace_expired.cancel();
                    while let Some(joined) = pipeline.inflight.join_next().await {
                        self.handle_settled(joined, &mut pipeline).await;
                    }
                    break;
                }
            }
        }

        let aggregator = Arc::clone(&self.aggregator);
        match tokio::task::spawn_blocking(move || aggregator.flush_open()).await {
            Ok(open) => tracing::debug!(buckets = open.len(), "Persisted open buckets"),
            Err(e) => tracing::error!(error = %e, "Failed to persist open buckets"),
        }

        pipeline.summary.analysis = self.analysis.stats();
        pipeline.summary
    }
}

/// Write batch updates to the recovery log in order, forwarding each flushed
/// batch once it is recorded. Returns the receiver when stopped.
async fn run_journal(
    db: Arc<Database>,
    mut updates: mpsc::UnboundedReceiver<BatchUpdate>,
    recorded: mpsc::UnboundedSender<Batch>,
    stop: CancellationToken,
) -> mpsc::UnboundedReceiver<BatchUpdate> {
    loop {
        let update = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        match update {
            BatchUpdate::Appended {
                batch_id,
                created_at,
                position,
                capture,
            } => {
                let db = Arc::clone(&db);
                let joined = tokio::task::spawn_blocking(move || {
                    db.record_open_capture(batch_id, created_at, position, &capture)
                })
                .await;
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(%batch_id, position, error = %e, "Failed to journal capture");
                    }
                    Err(e) => tracing::error!(error = %e, "Journal worker failed"),
                }
            }
            BatchUpdate::Flushed(batch) => {
                if let Some(batch) = record_pending(&db, batch).await {
                    if recorded.send(batch).is_err() {
                        break;
                    }
                }
            }
        }
    }

    updates
}

/// Write a flushed batch to the recovery log.
///
/// The batch is returned even when the write fails so it can still be
/// analyzed; it is just not replayable after a crash.
async fn record_pending(db: &Arc<Database>, batch: Batch) -> Option<Batch> {
    let db = Arc::clone(db);
    let joined = tokio::task::spawn_blocking(move || {
        let result = db.record_pending_batch(&batch);
        (batch, result)
    })
    .await;

    match joined {
        Ok((batch, Ok(()))) => {
            tracing::debug!(batch_id = %batch.id, captures = batch.len(), "Batch recorded in recovery log");
            Some(batch)
        }
        Ok((batch, Err(e))) => {
            tracing::error!(batch_id = %batch.id, error = %e, "Failed to record pending batch");
            Some(batch)
        }
        Err(e) => {
            tracing::error!(error = %e, "Recovery log worker failed");
            None
        }
    }
}

async fn mark_analyzing(db: &Arc<Database>, batch_id: Uuid) {
    let db = Arc::clone(db);
    let joined =
        tokio::task::spawn_blocking(move || db.set_pending_state(batch_id, BatchState::Analyzing)).await;
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(%batch_id, error = %e, "Failed to update pending batch state"),
        Err(e) => tracing::warn!(%batch_id, error = %e, "Recovery log worker failed"),
    }
}

/// Copy of a batch without image payloads.
fn manifest_of(batch: &Batch) -> Batch {
    Batch {
        id: batch.id,
        captures: batch
            .captures
            .iter()
            .map(|c| Capture {
                id: c.id,
                captured_at: c.captured_at,
                payload: Vec::new(),
                mime_type: c.mime_type.clone(),
                fingerprint: c.fingerprint.clone(),
                duplicate: c.duplicate,
            })
            .collect(),
        state: batch.state,
        created_at: batch.created_at,
        flushed_at: batch.flushed_at,
        attempts: batch.attempts,
    }
}

/// Persist an outcome then fold it into the aggregator.
fn commit_outcome(db: &Database, aggregator: &MetricsAggregator, outcome: AnalysisOutcome) -> Settled {
    match outcome {
        AnalysisOutcome::Completed {
            batch,
            results,
            attempts,
        } => {
            let records: Vec<CaptureRecord> = batch
                .captures
                .iter()
                .zip(&results)
                .map(|(capture, result)| CaptureRecord::analyzed(batch.id, capture, result))
                .collect();

            if let Err(e) = db.complete_batch(batch.id, &records, attempts) {
                tracing::error!(
                    batch_id = %batch.id,
                    error = %Error::Persistence(e.to_string()),
                    "Failed to commit analyzed batch"
                );
            }

            let report = aggregator.ingest(&results);
            tracing::info!(
                batch_id = %batch.id,
                captures = records.len(),
                attempts,
                buckets = report.buckets_touched,
                "Batch completed"
            );
            Settled::Completed { late: report.late }
        }
        AnalysisOutcome::Failed { batch, failure } => {
            tracing::warn!(
                batch_id = %batch.id,
                attempts = failure.attempts,
                kind = failure.kind.as_str(),
                reason = %failure.reason,
                "Batch failed, recording captures as unanalyzed"
            );
            let late = fail_with_gaps(db, aggregator, &batch, failure.attempts, &failure.reason);
            Settled::Failed { late }
        }
        AnalysisOutcome::Interrupted { batch, attempts } => {
            if let Err(e) = db.interrupt_batch(batch.id, attempts, "shutdown") {
                tracing::error!(batch_id = %batch.id, error = %e, "Failed to update interrupted batch");
            }
            Settled::Interrupted
        }
    }
}

fn fail_with_gaps(
    db: &Database,
    aggregator: &MetricsAggregator,
    batch: &Batch,
    attempts: u32,
    reason: &str,
) -> usize {
    let records: Vec<CaptureRecord> = batch
        .captures
        .iter()
        .map(|capture| CaptureRecord::unanalyzed(batch.id, capture, reason))
        .collect();

    if let Err(e) = db.fail_batch(batch.id, &records, attempts, reason) {
        tracing::error!(
            batch_id = %batch.id,
            error = %Error::Persistence(e.to_string()),
            "Failed to record failed batch"
        );
    }

    aggregator.mark_unanalyzed(&batch.captures).late
}
