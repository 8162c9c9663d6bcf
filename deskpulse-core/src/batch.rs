//! Batch accumulation with a dual size/time flush trigger
//!
//! Exactly one batch is OPEN at a time. A batch is flushed when it reaches
//! `batch_size` captures or when `batch_interval` has elapsed since its first
//! capture was added, whichever comes first.
//!
//! Every change is published on the channel returned by
//! [`BatchAccumulator::new`]: each appended capture as it joins the OPEN batch,
//! then the whole batch once it is flushed. Updates are sent while the OPEN
//! batch is locked, so a batch's appends always arrive before its flush.
//!
//! The interval timer is armed when the first capture enters the OPEN batch.
//! Its cancellation handle is kept alongside the batch and cancelled when a
//! size flush gets there first; a timer that fires for a batch that is no
//! longer OPEN does nothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::types::{Batch, BatchState, Capture};

/// Where an added capture ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended to the OPEN batch at `position` (0-based)
    Queued { batch_id: Uuid, position: usize },
    /// The capture filled its batch, which was flushed
    Flushed { batch_id: Uuid, captures: usize },
}

/// A change to the accumulated batches, in the order it happened.
#[derive(Debug, Clone)]
pub enum BatchUpdate {
    /// A capture joined the OPEN batch at `position` (0-based)
    Appended {
        batch_id: Uuid,
        created_at: DateTime<Utc>,
        position: usize,
        capture: Capture,
    },
    /// A batch was closed by its size or time trigger
    Flushed(Batch),
}

/// Which trigger closed a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timer,
    Forced,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Forced => "forced",
        }
    }
}

struct OpenBatch {
    batch: Batch,
    /// Interval timer for this batch; armed with the first capture
    timer: Option<CancellationToken>,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            batch: Batch {
                id: Uuid::new_v4(),
                captures: Vec::new(),
                state: BatchState::Open,
                created_at: Utc::now(),
                flushed_at: None,
                attempts: 0,
            },
            timer: None,
        }
    }
}

struct Shared {
    open: Mutex<OpenBatch>,
    updates_tx: mpsc::UnboundedSender<BatchUpdate>,
    batch_size: usize,
    interval: Duration,
}

/// Groups captures into bounded batches.
///
/// `add` must be called from within a tokio runtime; the interval timer is a
/// spawned task.
#[derive(Clone)]
pub struct BatchAccumulator {
    shared: Arc<Shared>,
}

impl BatchAccumulator {
    pub fn new(config: &BatchConfig) -> (Self, mpsc::UnboundedReceiver<BatchUpdate>) {
        Self::with_limits(config.batch_size, config.interval())
    }

    pub fn with_limits(
        batch_size: usize,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<BatchUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            open: Mutex::new(OpenBatch::new()),
            updates_tx,
            batch_size: batch_size.max(1),
            interval,
        });
        (Self { shared }, updates_rx)
    }

    /// Add a capture to the OPEN batch, flushing it if it is now full.
    ///
    /// A capture whose fingerprint matches the preceding capture in the same
    /// batch is kept but tagged `duplicate`.
    pub fn add(&self, mut capture: Capture) -> AddOutcome {
        let mut open = self.shared.open.lock().unwrap();

        if open.batch.captures.is_empty() {
            open.timer = Some(self.arm_timer(open.batch.id));
        }

        capture.duplicate = open
            .batch
            .captures
            .last()
            .is_some_and(|prev| prev.fingerprint == capture.fingerprint);

        let batch_id = open.batch.id;
        let position = open.batch.captures.len();
        publish(
            &self.shared,
            BatchUpdate::Appended {
                batch_id,
                created_at: open.batch.created_at,
                position,
                capture: capture.clone(),
            },
        );
        open.batch.captures.push(capture);

        if open.batch.captures.len() >= self.shared.batch_size {
            if let Some(batch) = flush_locked(&mut open, FlushTrigger::Size) {
                let captures = batch.len();
                publish(&self.shared, BatchUpdate::Flushed(batch));
                return AddOutcome::Flushed { batch_id, captures };
            }
        }

        AddOutcome::Queued { batch_id, position }
    }

    /// Flush a partial OPEN batch and hand it back instead of publishing it.
    ///
    /// Returns `None` when the OPEN batch has no captures.
    pub fn force_flush(&self) -> Option<Batch> {
        let mut open = self.shared.open.lock().unwrap();
        flush_locked(&mut open, FlushTrigger::Forced)
    }

    #[cfg(test)]
    fn open_len(&self) -> usize {
        self.shared.open.lock().unwrap().batch.captures.len()
    }

    #[cfg(test)]
    fn open_batch_id(&self) -> Uuid {
        self.shared.open.lock().unwrap().batch.id
    }

    fn arm_timer(&self, batch_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(shared.interval) => {
                    let mut open = shared.open.lock().unwrap();
                    let flushed = if open.batch.id == batch_id {
                        flush_locked(&mut open, FlushTrigger::Timer)
                    } else {
                        None
                    };
                    match flushed {
                        Some(batch) => publish(&shared, BatchUpdate::Flushed(batch)),
                        None => tracing::trace!(%batch_id, "Batch timer fired after batch closed"),
                    }
                }
            }
        });

        token
    }
}

/// Close the OPEN batch and open a fresh one. No-op for an empty batch.
fn flush_locked(open: &mut OpenBatch, trigger: FlushTrigger) -> Option<Batch> {
    if open.batch.captures.is_empty() {
        return None;
    }

    let previous = std::mem::replace(open, OpenBatch::new());
    if let Some(timer) = previous.timer {
        timer.cancel();
    }

    let mut batch = previous.batch;
    batch.state = BatchState::Flushed;
    batch.flushed_at = Some(Utc::now());

    tracing::debug!(
        batch_id = %batch.id,
        captures = batch.len(),
        trigger = trigger.as_str(),
        "Flushed batch"
    );

    Some(batch)
}

/// Send an update. Callers hold the OPEN lock.
fn publish(shared: &Shared, update: BatchUpdate) {
    if let Err(mpsc::error::SendError(update)) = shared.updates_tx.send(update) {
        match update {
            BatchUpdate::Flushed(batch) => {
                tracing::warn!(batch_id = %batch.id, "Flushed batch dropped: receiver closed");
            }
            BatchUpdate::Appended { batch_id, .. } => {
                tracing::trace!(%batch_id, "Append not journaled: receiver closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    /// Next flushed batch, skipping appends.
    fn try_flushed(rx: &mut mpsc::UnboundedReceiver<BatchUpdate>) -> Result<Batch, TryRecvError> {
        loop {
            if let BatchUpdate::Flushed(batch) = rx.try_recv()? {
                return Ok(batch);
            }
        }
    }

    async fn next_flushed(rx: &mut mpsc::UnboundedReceiver<BatchUpdate>) -> Batch {
        loop {
            match rx.recv().await {
                Some(BatchUpdate::Flushed(batch)) => return batch,
                Some(BatchUpdate::Appended { .. }) => continue,
                None => panic!("update channel closed"),
            }
        }
    }

    fn capture(fingerprint: &str) -> Capture {
        Capture {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            payload: vec![0xFF, 0xD8],
            mime_type: "image/jpeg".to_string(),
            fingerprint: fingerprint.to_string(),
            duplicate: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_on_twelfth_capture() {
        let (acc, mut rx) = BatchAccumulator::with_limits(12, Duration::from_secs(120));

        for i in 0..11 {
            let outcome = acc.add(capture(&format!("fp{}", i)));
            assert!(matches!(outcome, AddOutcome::Queued { position, .. } if position == i));
            tokio::time::sleep(Duration::from_millis(900)).await;
        }
        assert!(matches!(try_flushed(&mut rx), Err(TryRecvError::Empty)));

        let outcome = acc.add(capture("fp11"));
        assert!(matches!(outcome, AddOutcome::Flushed { captures: 12, .. }));

        let batch = try_flushed(&mut rx).unwrap();
        assert_eq!(batch.len(), 12);
        assert_eq!(batch.state, BatchState::Flushed);
        assert!(batch.flushed_at.is_some());
        assert_eq!(acc.open_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_flushes_partial_batch() {
        let (acc, mut rx) = BatchAccumulator::with_limits(12, Duration::from_secs(120));
        let start = Instant::now();

        for i in 0..3 {
            acc.add(capture(&format!("fp{}", i)));
            if i < 2 {
                tokio::time::sleep(Duration::from_secs(40)).await;
            }
        }

        let batch = next_flushed(&mut rx).await;
        let elapsed = start.elapsed();
        assert_eq!(batch.len(), 3);
        assert!(elapsed >= Duration::from_secs(120));
        assert!(elapsed < Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_cancels_timer() {
        let (acc, mut rx) = BatchAccumulator::with_limits(2, Duration::from_secs(120));

        acc.add(capture("a"));
        acc.add(capture("b"));
        assert_eq!(try_flushed(&mut rx).unwrap().len(), 2);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(matches!(try_flushed(&mut rx), Err(TryRecvError::Empty)));

        // The next batch gets its own timer
        acc.add(capture("c"));
        let batch = next_flushed(&mut rx).await;
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_tagging() {
        let (acc, _rx) = BatchAccumulator::with_limits(12, Duration::from_secs(120));

        acc.add(capture("same"));
        acc.add(capture("same"));
        acc.add(capture("other"));
        acc.add(capture("same"));

        let batch = acc.force_flush().unwrap();
        let tags: Vec<bool> = batch.captures.iter().map(|c| c.duplicate).collect();
        assert_eq!(tags, vec![false, true, false, false]);
    }

    #[tokio::test]
    async fn test_duplicate_tag_does_not_cross_batches() {
        let (acc, mut rx) = BatchAccumulator::with_limits(1, Duration::from_secs(120));

        acc.add(capture("same"));
        acc.add(capture("same"));

        assert!(!try_flushed(&mut rx).unwrap().captures[0].duplicate);
        assert!(!try_flushed(&mut rx).unwrap().captures[0].duplicate);
    }

    #[tokio::test]
    async fn test_force_flush_empty_is_noop() {
        let (acc, mut rx) = BatchAccumulator::with_limits(12, Duration::from_secs(120));
        let open_id = acc.open_batch_id();

        assert!(acc.force_flush().is_none());
        assert_eq!(acc.open_batch_id(), open_id);
        assert!(matches!(try_flushed(&mut rx), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_is_not_delivered_and_disarms_timer() {
        let (acc, mut rx) = BatchAccumulator::with_limits(12, Duration::from_secs(120));

        acc.add(capture("a"));
        let batch = acc.force_flush().unwrap();
        assert_eq!(batch.len(), 1);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(matches!(try_flushed(&mut rx), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_capture_lands_in_exactly_one_batch() {
        let (acc, mut rx) = BatchAccumulator::with_limits(5, Duration::from_secs(30));
        let mut added = Vec::new();

        for i in 0..23u64 {
            let c = capture(&format!("fp{}", i % 4));
            added.push(c.id);
            acc.add(c);
            // Irregular spacing so both triggers fire
            tokio::time::sleep(Duration::from_secs(3 + (i % 5) * 4)).await;
        }

        let mut seen = Vec::new();
        while let Ok(batch) = try_flushed(&mut rx) {
            assert!(batch.len() <= 5);
            seen.extend(batch.captures.iter().map(|c| c.id));
        }
        if let Some(batch) = acc.force_flush() {
            seen.extend(batch.captures.iter().map(|c| c.id));
        }

        let unique: HashSet<Uuid> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len());
        assert_eq!(seen, added);
    }

    #[tokio::test]
    async fn test_appends_precede_their_flush() {
        let (acc, mut rx) = BatchAccumulator::with_limits(2, Duration::from_secs(120));

        let first = capture("a");
        let second = capture("b");
        acc.add(first.clone());
        acc.add(second.clone());
        acc.add(capture("c"));

        let mut order = Vec::new();
        while let Ok(update) = rx.try_recv() {
            match update {
                BatchUpdate::Appended {
                    position, capture, ..
                } => order.push(format!("append {} {}", position, capture.fingerprint)),
                BatchUpdate::Flushed(batch) => {
                    assert_eq!(
                        batch.captures.iter().map(|c| c.id).collect::<Vec<_>>(),
                        vec![first.id, second.id]
                    );
                    order.push(format!("flush {}", batch.len()));
                }
            }
        }
        assert_eq!(order, vec!["append 0 a", "append 1 b", "flush 2", "append 0 c"]);
    }
}
