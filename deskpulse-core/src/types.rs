//! Core domain types for deskpulse
//!
//! These types describe a capture as it moves through the pipeline, from the
//! raw screenshot to the persisted per-capture record and the time bucket it
//! is folded into.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Capture** | One normalized screenshot with its perceptual fingerprint |
//! | **Batch** | An ordered group of captures submitted together for analysis |
//! | **Observation** | What the analysis endpoint says about one capture |
//! | **AnalysisResult** | An observation joined with its capture's timestamp and tags |
//! | **Bucket** | A fixed-width time window over which metrics are aggregated |
//! | **Gap** | A capture whose batch failed analysis; counted, never scored |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================
// Captures
// ============================================

/// Output of a [`CaptureSource`](crate::capture::CaptureSource): an undecoded screenshot.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub captured_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// A normalized screenshot ready for analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Unique identifier, stable across restarts
    pub id: Uuid,
    /// When the screenshot was taken
    pub captured_at: DateTime<Utc>,
    /// Encoded image bytes (bounded size)
    pub payload: Vec<u8>,
    /// MIME type of `payload`
    pub mime_type: String,
    /// Perceptual hash of the image, base64
    pub fingerprint: String,
    /// Same fingerprint as the preceding capture in its batch (idle screen)
    pub duplicate: bool,
}

// ============================================
// Batches
// ============================================

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Accepting captures
    Open,
    /// Closed by a size or time trigger, waiting for an analysis slot
    Flushed,
    /// Submitted to the analysis endpoint
    Analyzing,
    /// Results persisted and aggregated
    Completed,
    /// Analysis gave up; captures recorded as unanalyzed
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Open => "open",
            BatchState::Flushed => "flushed",
            BatchState::Analyzing => "analyzing",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BatchState::Open),
            "flushed" => Ok(BatchState::Flushed),
            "analyzing" => Ok(BatchState::Analyzing),
            "completed" => Ok(BatchState::Completed),
            "failed" => Ok(BatchState::Failed),
            _ => Err(format!("unknown batch state: {}", s)),
        }
    }
}

/// An ordered group of captures.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    /// Captures in the order they were added
    pub captures: Vec<Capture>,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub flushed_at: Option<DateTime<Utc>>,
    /// Analysis attempts already spent, carried across restarts
    pub attempts: u32,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.captures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }
}

// ============================================
// Analysis
// ============================================

/// Attention state reported by the analysis endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusState {
    Focused,
    #[serde(alias = "transitioning")]
    Neutral,
    Scattered,
}

impl FocusState {
    pub const ALL: [FocusState; 3] = [FocusState::Focused, FocusState::Neutral, FocusState::Scattered];

    pub fn as_str(&self) -> &'static str {
        match self {
            FocusState::Focused => "focused",
            FocusState::Neutral => "neutral",
            FocusState::Scattered => "scattered",
        }
    }
}

impl std::str::FromStr for FocusState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "focused" => Ok(FocusState::Focused),
            "neutral" => Ok(FocusState::Neutral),
            // Older analyzer prompts use "transitioning" for the middle state
            "transitioning" => Ok(FocusState::Neutral),
            "scattered" => Ok(FocusState::Scattered),
            _ => Err(format!("unknown focus state: {}", s)),
        }
    }
}

/// Per-capture output of the analysis endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub capture_id: Uuid,
    pub activity_label: String,
    pub focus_state: FocusState,
    /// Free-form descriptor of what the capture shows
    #[serde(default)]
    pub context: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Finer-grained 0-100 score, when the analyzer provides one
    #[serde(default)]
    pub focus_score: Option<f64>,
}

fn default_confidence() -> f64 {
    1.0
}

/// An observation joined with the capture it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub capture_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub activity_label: String,
    pub focus_state: FocusState,
    pub detected_context: String,
    pub confidence: f64,
    pub focus_score: Option<f64>,
    /// Idle-duplicate tag carried over from the batch
    pub duplicate: bool,
}

impl AnalysisResult {
    pub fn from_observation(capture: &Capture, observation: Observation) -> Self {
        Self {
            capture_id: capture.id,
            captured_at: capture.captured_at,
            activity_label: observation.activity_label,
            focus_state: observation.focus_state,
            detected_context: observation.context,
            confidence: clamp_confidence(observation.confidence),
            focus_score: observation.focus_score,
            duplicate: capture.duplicate,
        }
    }
}

/// Clamp a reported confidence into `[0, 1]`; a non-finite value counts as full confidence.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

// ============================================
// Persisted records
// ============================================

/// Durable per-capture row, keyed by `capture_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub capture_id: Uuid,
    pub batch_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub fingerprint: String,
    pub duplicate: bool,
    /// `None` marks the capture as unanalyzed
    pub analysis: Option<RecordedAnalysis>,
    /// Why analysis failed, for unanalyzed captures
    pub failure_reason: Option<String>,
}

/// Analysis fields stored on a capture row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAnalysis {
    pub activity_label: String,
    pub focus_state: FocusState,
    pub detected_context: String,
    pub confidence: f64,
    pub focus_score: Option<f64>,
}

impl CaptureRecord {
    pub fn analyzed(batch_id: Uuid, capture: &Capture, result: &AnalysisResult) -> Self {
        Self {
            capture_id: capture.id,
            batch_id,
            captured_at: capture.captured_at,
            fingerprint: capture.fingerprint.clone(),
            duplicate: capture.duplicate,
            analysis: Some(RecordedAnalysis {
                activity_label: result.activity_label.clone(),
                focus_state: result.focus_state,
                detected_context: result.detected_context.clone(),
                confidence: result.confidence,
                focus_score: result.focus_score,
            }),
            failure_reason: None,
        }
    }

    pub fn unanalyzed(batch_id: Uuid, capture: &Capture, reason: &str) -> Self {
        Self {
            capture_id: capture.id,
            batch_id,
            captured_at: capture.captured_at,
            fingerprint: capture.fingerprint.clone(),
            duplicate: capture.duplicate,
            analysis: None,
            failure_reason: Some(reason.to_string()),
        }
    }

    pub fn is_analyzed(&self) -> bool {
        self.analysis.is_some()
    }

    /// Rebuild the aggregation input for an analyzed row.
    pub fn to_result(&self) -> Option<AnalysisResult> {
        self.analysis.as_ref().map(|a| AnalysisResult {
            capture_id: self.capture_id,
            captured_at: self.captured_at,
            activity_label: a.activity_label.clone(),
            focus_state: a.focus_state,
            detected_context: a.detected_context.clone(),
            confidence: a.confidence,
            focus_score: a.focus_score,
            duplicate: self.duplicate,
        })
    }
}

// ============================================
// Buckets
// ============================================

/// Aggregate metrics for one fixed-width window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    /// Inclusive window start (aligned to the bucket width)
    pub bucket_start: DateTime<Utc>,
    /// Exclusive window end
    pub bucket_end: DateTime<Utc>,
    /// Mean focus value over scored captures, 0-100; 0 when nothing was scored
    pub focus_score: f64,
    /// Non-duplicate analyzed captures contributing to `focus_score`
    pub scored_captures: u32,
    pub active_seconds: u64,
    pub context_switches: u32,
    pub activity_counts: BTreeMap<String, u32>,
    pub focus_state_counts: BTreeMap<FocusState, u32>,
    /// Analyzed plus unanalyzed captures in the window
    pub total_captures: u32,
    /// Captures from failed batches; non-zero marks a gap
    pub unanalyzed_captures: u32,
    pub finalized: bool,
}

impl TimeBucket {
    pub fn empty(bucket_start: DateTime<Utc>, width: chrono::Duration) -> Self {
        Self {
            bucket_start,
            bucket_end: bucket_start + width,
            focus_score: 0.0,
            scored_captures: 0,
            active_seconds: 0,
            context_switches: 0,
            activity_counts: BTreeMap::new(),
            focus_state_counts: BTreeMap::new(),
            total_captures: 0,
            unanalyzed_captures: 0,
            finalized: false,
        }
    }

    pub fn has_gap(&self) -> bool {
        self.unanalyzed_captures > 0
    }
}

/// Align a timestamp to the start of its bucket.
pub fn bucket_start_for(ts: DateTime<Utc>, width: chrono::Duration) -> DateTime<Utc> {
    let width_secs = width.num_seconds().max(1);
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(width_secs);
    DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
}

// ============================================
// Recovery
// ============================================

/// State loaded at startup to resume after a crash or shutdown.
#[derive(Debug, Default)]
pub struct RecoverySnapshot {
    /// Batches that were flushed but never committed, oldest first
    pub pending_batches: Vec<Batch>,
    /// Capture rows inside windows that are not yet finalized
    pub open_captures: Vec<CaptureRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_alignment() {
        let width = chrono::Duration::minutes(15);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 22, 31).unwrap();
        assert_eq!(
            bucket_start_for(ts, width),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap()
        );

        let boundary = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        assert_eq!(bucket_start_for(boundary, width), boundary);
    }

    #[test]
    fn test_focus_state_parse() {
        assert_eq!("focused".parse::<FocusState>(), Ok(FocusState::Focused));
        assert_eq!("transitioning".parse::<FocusState>(), Ok(FocusState::Neutral));
        assert!("sleepy".parse::<FocusState>().is_err());
    }

    #[test]
    fn test_batch_state_roundtrip_names() {
        for state in [
            BatchState::Open,
            BatchState::Flushed,
            BatchState::Analyzing,
            BatchState::Completed,
            BatchState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<BatchState>(), Ok(state));
        }
        assert!("closed".parse::<BatchState>().is_err());
    }

    #[test]
    fn test_observation_defaults() {
        let json = r#"{
            "capture_id": "6f1c7f1e-9a2b-4c1d-8e3f-1a2b3c4d5e6f",
            "activity_label": "coding",
            "focus_state": "focused"
        }"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.confidence, 1.0);
        assert!(obs.focus_score.is_none());
        assert_eq!(obs.context, "");
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(0.4), 0.4);
        assert_eq!(clamp_confidence(f64::NAN), 1.0);
        assert_eq!(clamp_confidence(f64::INFINITY), 1.0);
    }
}
