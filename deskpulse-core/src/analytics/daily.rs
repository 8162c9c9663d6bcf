//! Daily metrics view for dashboards and exports.
//!
//! Dates are UTC calendar days. Scores are combined across buckets weighted
//! by each bucket's scored captures, so an hour with one capture does not
//! count as much as an hour with forty.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;

use crate::types::{CaptureRecord, FocusState, TimeBucket};

/// Everything the dashboard shows for one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMetrics {
    pub summary: DailySummary,
    /// Keyed by UTC hour, 0-23; hours without captures are omitted
    pub hourly_patterns: BTreeMap<u32, HourlyPattern>,
    pub focus_states: FocusStateDistribution,
    pub activities: ActivityBreakdown,
    /// Weight of this day's score when days are combined
    #[serde(skip)]
    scored_captures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub focus_score: f64,
    pub active_hours: f64,
    pub context_switches: u32,
    pub total_captures: u32,
    pub unanalyzed_captures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyPattern {
    pub focus_score: f64,
    /// Activity labels recorded in the hour, counting repeats
    pub activities: u32,
    /// Captures taken in the hour, analyzed or not
    pub snapshots: u32,
}

#[derive(Default)]
struct HourTotals {
    score: WeightedScore,
    activities: u32,
    snapshots: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FocusStateDistribution {
    pub focused: u32,
    pub neutral: u32,
    pub scattered: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityBreakdown {
    pub total_activities: u32,
    pub categories: BTreeMap<String, u32>,
}

/// Daily views for a date range plus a combined summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeExport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub aggregate: RangeSummary,
    pub days: Vec<DailyMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSummary {
    pub days: u32,
    pub focus_score: f64,
    pub active_hours: f64,
    pub context_switches: u32,
    pub total_captures: u32,
    pub unanalyzed_captures: u32,
}

/// Per-bucket listing of recent activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentActivity {
    pub periods: Vec<PeriodSummary>,
    pub total_snapshots: u32,
    pub unique_activities: usize,
}

/// One bucket in a [`RecentActivity`] listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub bucket_start: DateTime<Utc>,
    pub focus_score: f64,
    /// Distinct activity labels, most frequent first
    pub activities: Vec<String>,
    pub snapshots: u32,
    /// Distinct detected contexts in capture order
    pub contexts: Vec<String>,
}

/// Running weighted mean.
#[derive(Default)]
struct WeightedScore {
    sum: f64,
    weight: u64,
}

impl WeightedScore {
    fn add(&mut self, score: f64, weight: u32) {
        self.sum += score * weight as f64;
        self.weight += weight as u64;
    }

    fn value(&self) -> f64 {
        if self.weight == 0 {
            0.0
        } else {
            round2((self.sum / self.weight as f64).clamp(0.0, 100.0))
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn hours(seconds: u64) -> f64 {
    round2(seconds as f64 / 3600.0)
}

impl DailyMetrics {
    /// Build the view for `date` from that day's buckets.
    pub fn from_buckets(date: NaiveDate, buckets: &[TimeBucket]) -> Self {
        let mut score = WeightedScore::default();
        let mut scored_captures = 0u32;
        let mut active_seconds = 0u64;
        let mut context_switches = 0u32;
        let mut total_captures = 0u32;
        let mut unanalyzed_captures = 0u32;
        let mut hourly: BTreeMap<u32, HourTotals> = BTreeMap::new();
        let mut focus_states = FocusStateDistribution::default();
        let mut activities = ActivityBreakdown::default();

        for bucket in buckets.iter().filter(|b| b.bucket_start.date_naive() == date) {
            score.add(bucket.focus_score, bucket.scored_captures);
            scored_captures += bucket.scored_captures;
            active_seconds += bucket.active_seconds;
            context_switches += bucket.context_switches;
            total_captures += bucket.total_captures;
            unanalyzed_captures += bucket.unanalyzed_captures;

            if bucket.total_captures > 0 {
                let hour = hourly.entry(bucket.bucket_start.hour()).or_default();
                hour.score.add(bucket.focus_score, bucket.scored_captures);
                hour.activities += bucket.activity_counts.values().sum::<u32>();
                hour.snapshots += bucket.total_captures;
            }

            for (state, count) in &bucket.focus_state_counts {
                match state {
                    FocusState::Focused => focus_states.focused += count,
                    FocusState::Neutral => focus_states.neutral += count,
                    FocusState::Scattered => focus_states.scattered += count,
                }
            }

            for (label, count) in &bucket.activity_counts {
                *activities.categories.entry(label.clone()).or_insert(0) += count;
                activities.total_activities += count;
            }
        }

        Self {
            summary: DailySummary {
                date,
                focus_score: score.value(),
                active_hours: hours(active_seconds),
                context_switches,
                total_captures,
                unanalyzed_captures,
            },
            hourly_patterns: hourly
                .into_iter()
                .map(|(hour, totals)| {
                    (
                        hour,
                        HourlyPattern {
                            focus_score: totals.score.value(),
                            activities: totals.activities,
                            snapshots: totals.snapshots,
                        },
                    )
                })
                .collect(),
            focus_states,
            activities,
            scored_captures,
        }
    }
}

impl RecentActivity {
    /// List `buckets` with the contexts of the analyzed captures that fall in each.
    pub fn from_records(buckets: &[TimeBucket], captures: &[CaptureRecord]) -> Self {
        let mut labels: BTreeSet<&str> = BTreeSet::new();
        let mut total_snapshots = 0;

        let periods = buckets
            .iter()
            .map(|bucket| {
                total_snapshots += bucket.total_captures;
                labels.extend(bucket.activity_counts.keys().map(String::as_str));

                let mut activities: Vec<(&String, &u32)> = bucket.activity_counts.iter().collect();
                activities.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

                let mut contexts: Vec<String> = Vec::new();
                for record in captures.iter().filter(|c| {
                    c.captured_at >= bucket.bucket_start && c.captured_at < bucket.bucket_end
                }) {
                    let Some(analysis) = &record.analysis else {
                        continue;
                    };
                    let context = analysis.detected_context.trim();
                    if !context.is_empty() && !contexts.iter().any(|c| c == context) {
                        contexts.push(context.to_string());
                    }
                }

                PeriodSummary {
                    bucket_start: bucket.bucket_start,
                    focus_score: round2(bucket.focus_score),
                    activities: activities.into_iter().map(|(l, _)| l.clone()).collect(),
                    snapshots: bucket.total_captures,
                    contexts,
                }
            })
            .collect();

        Self {
            periods,
            total_snapshots,
            unique_activities: labels.len(),
        }
    }
}

impl RangeExport {
    /// Combine daily views, one per date in `start..=end`.
    pub fn from_days(start: NaiveDate, end: NaiveDate, days: Vec<DailyMetrics>) -> Self {
        let mut score = WeightedScore::default();
        let mut active_hours = 0.0;
        let mut context_switches = 0;
        let mut total_captures = 0;
        let mut unanalyzed_captures = 0;

        for day in &days {
            score.add(day.summary.focus_score, day.scored_captures);
            active_hours += day.summary.active_hours;
            context_switches += day.summary.context_switches;
            total_captures += day.summary.total_captures;
            unanalyzed_captures += day.summary.unanalyzed_captures;
        }

        Self {
            start,
            end,
            aggregate: RangeSummary {
                days: days.len() as u32,
                focus_score: score.value(),
                active_hours: round2(active_hours),
                context_switches,
                total_captures,
                unanalyzed_captures,
            },
            days,
        }
    }
}
