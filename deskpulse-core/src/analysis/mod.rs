//! Vision analysis
//!
//! The classification model lives behind the [`VisionAnalyzer`] trait. The
//! [`AnalysisClient`] wraps it with bounded concurrency, per-attempt timeouts
//! and a bounded retry loop with exponential backoff.
//!
//! ## Usage
//!
//! Point the service at an analysis endpoint in `~/.config/deskpulse/config.toml`:
//!
//! ```toml
//! [analysis]
//! endpoint = "https://vision.example.com"
//! model = "gemini-1.5-flash"
//! analysis_concurrency = 2
//! max_attempts = 3
//! ```
//!
//! The API key is read from `analysis.api_key` or `DESKPULSE_API_KEY`.

mod client;
mod http;
mod retry;

pub use client::{
    AnalysisClient, AnalysisOutcome, AnalysisStats, AnalysisStatsSnapshot, BatchFailure, FailureKind,
};
pub use http::HttpVisionAnalyzer;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Capture;

/// External classification capability.
///
/// Implementations return one [`Observation`](crate::types::Observation) per
/// capture, or fail with [`Error::TransientAnalysis`](crate::Error::TransientAnalysis)
/// (retried) or [`Error::PermanentAnalysis`](crate::Error::PermanentAnalysis) (not retried).
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn submit(
        &self,
        batch_id: Uuid,
        captures: &[Capture],
    ) -> Result<Vec<crate::types::Observation>>;
}
