//! Analytics module for deskpulse
//!
//! Turns analysis results into metrics:
//! - Per-capture focus values ([`scoring`])
//! - Fixed-width time buckets with focus score, active time, context
//!   switches and category counts ([`aggregator`])
//! - Daily, date-range and recent-activity views over persisted buckets ([`daily`])

pub mod aggregator;
pub mod daily;
pub mod scoring;

pub use aggregator::{BucketSink, IngestReport, MetricsAggregator};
pub use daily::{
    ActivityBreakdown, DailyMetrics, DailySummary, FocusStateDistribution, HourlyPattern,
    PeriodSummary, RangeExport, RangeSummary, RecentActivity,
};
pub use scoring::{FocusScorer, LabelScorer};
