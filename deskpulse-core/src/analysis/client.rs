//! Bounded-concurrency analysis with retry and backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AnalysisResult, Batch, BatchState, Observation};

use super::{RetryPolicy, VisionAnalyzer};

/// Why a batch gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failures exhausted the attempt budget
    Exhausted,
    /// The endpoint rejected the batch outright
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Exhausted => "exhausted",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// Terminal failure of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub batch_id: Uuid,
    pub reason: String,
    pub attempts: u32,
    pub kind: FailureKind,
}

/// Result of [`AnalysisClient::analyze`]. The batch is handed back in every case.
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// One result per capture, in batch order
    Completed {
        batch: Batch,
        results: Vec<AnalysisResult>,
        attempts: u32,
    },
    /// No results; captures are recorded as unanalyzed
    Failed { batch: Batch, failure: BatchFailure },
    /// Shutdown cancelled a queued attempt; the batch stays in the recovery log
    Interrupted { batch: Batch, attempts: u32 },
}

impl AnalysisOutcome {
    pub fn batch(&self) -> &Batch {
        match self {
            AnalysisOutcome::Completed { batch, .. }
            | AnalysisOutcome::Failed { batch, .. }
            | AnalysisOutcome::Interrupted { batch, .. } => batch,
        }
    }
}

/// Running counters for the analysis pool
#[derive(Debug, Default)]
pub struct AnalysisStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
}

/// Point-in-time copy of [`AnalysisStats`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnalysisStatsSnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub completed: u64,
    pub failed: u64,
    pub interrupted: u64,
}

impl AnalysisStats {
    pub fn snapshot(&self) -> AnalysisStatsSnapshot {
        AnalysisStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Wraps a [`VisionAnalyzer`] with at most `K` batches in flight.
///
/// Waiters for a slot are served in FIFO order. Cancelling the shutdown token
/// interrupts batches that are waiting for a slot or sleeping between
/// attempts; an attempt already on the wire runs to completion or timeout.
#[derive(Clone)]
pub struct AnalysisClient {
    analyzer: Arc<dyn VisionAnalyzer>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    stats: Arc<AnalysisStats>,
}

impl AnalysisClient {
    pub fn new(analyzer: Arc<dyn VisionAnalyzer>, concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            analyzer,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            policy,
            shutdown: CancellationToken::new(),
            stats: Arc::new(AnalysisStats::default()),
        }
    }

    /// Stop handing out slots and abandon pending retries.
    pub fn cancel_queued(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> AnalysisStatsSnapshot {
        self.stats.snapshot()
    }

    /// Analyze one batch.
    ///
    /// `batch.attempts` counts attempts spent on earlier runs; they come out of
    /// the same budget, and every outcome reports the running total.
    pub async fn analyze(&self, mut batch: Batch) -> AnalysisOutcome {
        let batch_id = batch.id;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = batch.attempts;

        if attempt >= max_attempts {
            let reason = format!("attempt budget spent ({} of {})", attempt, max_attempts);
            return self.failed(batch, reason, attempt, FailureKind::Exhausted);
        }

        let _permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return self.interrupted(batch, attempt),
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.interrupted(batch, attempt),
            },
        };

        batch.state = BatchState::Analyzing;

        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let result = match tokio::time::timeout(
                self.policy.timeout,
                self.analyzer.submit(batch_id, &batch.captures),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::TransientAnalysis(format!(
                    "attempt timed out after {:?}",
                    self.policy.timeout
                ))),
            };

            match result.and_then(|observations| join_observations(&batch, observations)) {
                Ok(results) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    batch.state = BatchState::Completed;
                    batch.attempts = attempt;
                    tracing::debug!(%batch_id, attempts = attempt, results = results.len(), "Batch analyzed");
                    return AnalysisOutcome::Completed {
                        batch,
                        results,
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        %batch_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient analysis error, retrying"
                    );
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return self.interrupted(batch, attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let kind = if e.is_transient() {
                        FailureKind::Exhausted
                    } else {
                        FailureKind::Permanent
                    };
                    return self.failed(batch, e.to_string(), attempt, kind);
                }
            }
        }
    }

    fn failed(&self, mut batch: Batch, reason: String, attempts: u32, kind: FailureKind) -> AnalysisOutcome {
        tracing::warn!(
            batch_id = %batch.id,
            attempts,
            kind = kind.as_str(),
            error = %reason,
            "Batch analysis failed"
        );
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        batch.state = BatchState::Failed;
        batch.attempts = attempts;
        AnalysisOutcome::Failed {
            failure: BatchFailure {
                batch_id: batch.id,
                reason,
                attempts,
                kind,
            },
            batch,
        }
    }

    fn interrupted(&self, mut batch: Batch, attempts: u32) -> AnalysisOutcome {
        tracing::info!(batch_id = %batch.id, attempts, "Analysis interrupted by shutdown");
        self.stats.interrupted.fetch_add(1, Ordering::Relaxed);
        batch.state = BatchState::Flushed;
        batch.attempts = attempts;
        AnalysisOutcome::Interrupted { batch, attempts }
    }
}

/// Pair every capture with exactly one observation.
///
/// A response that misses a capture, repeats one, or names an unknown id is a
/// contract violation and is not retried.
fn join_observations(batch: &Batch, observations: Vec<Observation>) -> Result<Vec<AnalysisResult>> {
    if observations.len() != batch.captures.len() {
        return Err(Error::PermanentAnalysis(format!(
            "expected {} results, got {}",
            batch.captures.len(),
            observations.len()
        )));
    }

    let mut by_id: HashMap<Uuid, Observation> = HashMap::with_capacity(observations.len());
    for observation in observations {
        let id = observation.capture_id;
        if by_id.insert(id, observation).is_some() {
            return Err(Error::PermanentAnalysis(format!(
                "duplicate result for capture {}",
                id
            )));
        }
    }

    batch
        .captures
        .iter()
        .map(|capture| {
            by_id
                .remove(&capture.id)
                .map(|observation| AnalysisResult::from_observation(capture, observation))
                .ok_or_else(|| {
                    Error::PermanentAnalysis(format!("no result for capture {}", capture.id))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Capture, FocusState};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn batch(n: usize) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            captures: (0..n)
                .map(|i| Capture {
                    id: Uuid::new_v4(),
                    captured_at: Utc::now(),
                    payload: vec![0xFF, 0xD8],
                    mime_type: "image/jpeg".to_string(),
                    fingerprint: format!("fp{}", i),
                    duplicate: false,
                })
                .collect(),
            state: BatchState::Flushed,
            created_at: Utc::now(),
            flushed_at: Some(Utc::now()),
            attempts: 0,
        }
    }

    fn observe(captures: &[Capture]) -> Vec<Observation> {
        captures
            .iter()
            .map(|c| Observation {
                capture_id: c.id,
                activity_label: "coding".to_string(),
                focus_state: FocusState::Focused,
                context: "editor".to_string(),
                confidence: 0.9,
                focus_score: None,
            })
            .collect()
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            jitter: false,
        }
    }

    /// Fails with the scripted errors in order, then succeeds.
    struct Scripted {
        failures: Mutex<Vec<Error>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(failures: Vec<Error>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VisionAnalyzer for Scripted {
        async fn submit(&self, _batch_id: Uuid, captures: &[Capture]) -> Result<Vec<Observation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(observe(captures))
            } else {
                Err(failures.remove(0))
            }
        }
    }

    struct AlwaysTransient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VisionAnalyzer for AlwaysTransient {
        async fn submit(&self, _batch_id: Uuid, _captures: &[Capture]) -> Result<Vec<Observation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::TransientAnalysis("HTTP 503".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempt_budget() {
        let analyzer = Arc::new(AlwaysTransient {
            calls: AtomicUsize::new(0),
        });
        let client = AnalysisClient::new(analyzer.clone(), 1, policy(3));

        let outcome = client.analyze(batch(2)).await;
        match outcome {
            AnalysisOutcome::Failed { batch, failure } => {
                assert_eq!(failure.attempts, 3);
                assert_eq!(failure.kind, FailureKind::Exhausted);
                assert_eq!(batch.state, BatchState::Failed);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);

        let stats = client.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_from_earlier_runs_share_the_budget() {
        let analyzer = Arc::new(AlwaysTransient {
            calls: AtomicUsize::new(0),
        });
        let client = AnalysisClient::new(analyzer.clone(), 1, policy(3));

        let mut carried = batch(1);
        carried.attempts = 1;
        match client.analyze(carried).await {
            AnalysisOutcome::Failed { batch, failure } => {
                assert_eq!(failure.attempts, 3);
                assert_eq!(batch.attempts, 3);
                assert_eq!(failure.kind, FailureKind::Exhausted);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_spent_budget_fails_without_a_call() {
        let analyzer = Arc::new(AlwaysTransient {
            calls: AtomicUsize::new(0),
        });
        let client = AnalysisClient::new(analyzer.clone(), 1, policy(2));

        let mut spent = batch(1);
        spent.attempts = 2;
        match client.analyze(spent).await {
            AnalysisOutcome::Failed { failure, .. } => {
                assert_eq!(failure.attempts, 2);
                assert_eq!(failure.kind, FailureKind::Exhausted);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.stats().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let analyzer = Scripted::new(vec![Error::PermanentAnalysis("HTTP 413".to_string())]);
        let client = AnalysisClient::new(analyzer.clone(), 1, policy(5));

        let outcome = client.analyze(batch(2)).await;
        match outcome {
            AnalysisOutcome::Failed { failure, .. } => {
                assert_eq!(failure.attempts, 1);
                assert_eq!(failure.kind, FailureKind::Permanent);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let analyzer = Scripted::new(vec![
            Error::TransientAnalysis("HTTP 503".to_string()),
            Error::TransientAnalysis("connection reset".to_string()),
        ]);
        let client = AnalysisClient::new(analyzer.clone(), 1, policy(3));

        let b = batch(3);
        let ids: Vec<Uuid> = b.captures.iter().map(|c| c.id).collect();
        match client.analyze(b).await {
            AnalysisOutcome::Completed {
                results, attempts, ..
            } => {
                assert_eq!(attempts, 3);
                let result_ids: Vec<Uuid> = results.iter().map(|r| r.capture_id).collect();
                assert_eq!(result_ids, ids);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    struct Slow;

    #[async_trait]
    impl VisionAnalyzer for Slow {
        async fn submit(&self, _batch_id: Uuid, captures: &[Capture]) -> Result<Vec<Observation>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(observe(captures))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let client = AnalysisClient::new(Arc::new(Slow), 1, policy(2));

        match client.analyze(batch(1)).await {
            AnalysisOutcome::Failed { failure, .. } => {
                assert_eq!(failure.attempts, 2);
                assert_eq!(failure.kind, FailureKind::Exhausted);
                assert!(failure.reason.contains("timed out"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    struct Mismatched;

    #[async_trait]
    impl VisionAnalyzer for Mismatched {
        async fn submit(&self, _batch_id: Uuid, captures: &[Capture]) -> Result<Vec<Observation>> {
            let mut observations = observe(captures);
            observations[0].capture_id = Uuid::new_v4();
            Ok(observations)
        }
    }

    #[tokio::test]
    async fn test_mismatched_response_is_permanent() {
        let client = AnalysisClient::new(Arc::new(Mismatched), 1, policy(3));
        match client.analyze(batch(2)).await {
            AnalysisOutcome::Failed { failure, .. } => {
                assert_eq!(failure.attempts, 1);
                assert_eq!(failure.kind, FailureKind::Permanent);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    /// Tracks the highest number of concurrent submissions.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl VisionAnalyzer for Gauge {
        async fn submit(&self, _batch_id: Uuid, captures: &[Capture]) -> Result<Vec<Observation>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(observe(captures))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let client = AnalysisClient::new(gauge.clone(), 2, policy(1));

        let mut handles = Vec::new();
        for _ in 0..7 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.analyze(batch(1)).await }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                AnalysisOutcome::Completed { .. }
            ));
        }

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(client.stats().completed, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let analyzer = Arc::new(AlwaysTransient {
            calls: AtomicUsize::new(0),
        });
        let mut slow_policy = policy(5);
        slow_policy.base_delay = Duration::from_secs(10);
        slow_policy.max_delay = Duration::from_secs(10);
        let client = AnalysisClient::new(analyzer.clone(), 1, slow_policy);

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.analyze(batch(1)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        client.cancel_queued();

        match task.await.unwrap() {
            AnalysisOutcome::Interrupted { batch, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(batch.state, BatchState::Flushed);
            }
            other => panic!("expected interruption, got {:?}", other),
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_queued_batches() {
        let client = AnalysisClient::new(Arc::new(Slow), 1, policy(1));
        client.cancel_queued();

        assert!(matches!(
            client.analyze(batch(1)).await,
            AnalysisOutcome::Interrupted { attempts: 0, .. }
        ));
        assert_eq!(client.stats().interrupted, 1);
    }
}
