//! Database repository layer
//!
//! Capture rows are upserted on `capture_id` and buckets on `bucket_start`, so
//! replaying a write never creates a second row. Batch outcomes commit the
//! capture rows, the recovery-log removal and the batch event in one
//! transaction.

use crate::analytics::{BucketSink, DailyMetrics, RangeExport, RecentActivity};
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub captures: usize,
    pub buckets: usize,
    pub batch_events: usize,
}

impl PruneStats {
    pub fn total(&self) -> usize {
        self.captures + self.buckets + self.batch_events
    }
}

/// Store overview for the `status` command.
#[derive(Debug, Clone, Default)]
pub struct StoreStatus {
    pub schema_version: i32,
    pub total_captures: i64,
    pub unanalyzed_captures: i64,
    /// Batches in the recovery log
    pub pending_batches: i64,
    pub completed_batches: i64,
    pub failed_batches: i64,
    pub bucket_count: i64,
    pub first_capture_at: Option<DateTime<Utc>>,
    pub last_capture_at: Option<DateTime<Utc>>,
    /// Most recent bucket, open or finalized
    pub latest_bucket: Option<TimeBucket>,
}

/// A recorded batch outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEvent {
    pub batch_id: Uuid,
    pub event: String,
    pub attempts: u32,
    pub captures: u32,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

/// Fixed-width RFC 3339 so text comparison matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn get_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let idx = row.as_ref().column_index(column)?;
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_opt_ts(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let idx = row.as_ref().column_index(column)?;
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let idx = row.as_ref().column_index(column)?;
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn get_uuid(row: &Row, column: &str) -> rusqlite::Result<Uuid> {
    let idx = row.as_ref().column_index(column)?;
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e))
}

/// UTC midnight at the start of `date`.
fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;  -- 16MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        super::schema::get_schema_version(&conn)
    }

    // ============================================
    // Capture operations
    // ============================================

    /// Insert or update one capture row.
    ///
    /// An analyzed row is never overwritten by an unanalyzed one.
    pub fn write_capture(&self, record: &CaptureRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_capture_row(&conn, record, &ts(Utc::now()))?;
        Ok(())
    }

    fn upsert_capture_row(
        conn: &Connection,
        record: &CaptureRecord,
        recorded_at: &str,
    ) -> rusqlite::Result<usize> {
        let analysis = record.analysis.as_ref();
        conn.execute(
            r#"
            INSERT INTO captures (capture_id, batch_id, captured_at, fingerprint, duplicate, analyzed,
                                  activity_label, focus_state, detected_context, confidence, focus_score,
                                  failure_reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(capture_id) DO UPDATE SET
                batch_id = excluded.batch_id,
                captured_at = excluded.captured_at,
                fingerprint = excluded.fingerprint,
                duplicate = excluded.duplicate,
                analyzed = excluded.analyzed,
                activity_label = excluded.activity_label,
                focus_state = excluded.focus_state,
                detected_context = excluded.detected_context,
                confidence = excluded.confidence,
                focus_score = excluded.focus_score,
                failure_reason = excluded.failure_reason
            WHERE excluded.analyzed >= captures.analyzed
            "#,
            params![
                record.capture_id.to_string(),
                record.batch_id.to_string(),
                ts(record.captured_at),
                record.fingerprint,
                record.duplicate,
                record.is_analyzed(),
                analysis.map(|a| a.activity_label.as_str()),
                analysis.map(|a| a.focus_state.as_str()),
                analysis.map(|a| a.detected_context.as_str()),
                analysis.map(|a| a.confidence),
                analysis.and_then(|a| a.focus_score),
                record.failure_reason,
                recorded_at,
            ],
        )
    }

    /// Get a capture row by id
    pub fn get_capture(&self, capture_id: Uuid) -> Result<Option<CaptureRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM captures WHERE capture_id = ?",
            [capture_id.to_string()],
            Self::row_to_capture,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Capture rows at or after `since`, oldest first
    pub fn captures_since(&self, since: DateTime<Utc>) -> Result<Vec<CaptureRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM captures WHERE captured_at >= ? ORDER BY captured_at ASC, capture_id ASC",
        )?;

        let records = stmt
            .query_map([ts(since)], Self::row_to_capture)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Capture rows in `[start, end)`, oldest first
    pub fn captures_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CaptureRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM captures WHERE captured_at >= ?1 AND captured_at < ?2 ORDER BY captured_at ASC, capture_id ASC",
        )?;

        let records = stmt
            .query_map(params![ts(start), ts(end)], Self::row_to_capture)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn count_captures(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM captures", [], |r| r.get(0))?;
        Ok(count)
    }

    fn row_to_capture(row: &Row) -> rusqlite::Result<CaptureRecord> {
        let analyzed: bool = row.get("analyzed")?;
        let analysis = if analyzed {
            let idx = row.as_ref().column_index("focus_state")?;
            let state_str: String = row.get(idx)?;
            let focus_state = state_str.parse::<FocusState>().map_err(|e| {
                conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            Some(RecordedAnalysis {
                activity_label: row.get("activity_label")?,
                focus_state,
                detected_context: row
                    .get::<_, Option<String>>("detected_context")?
                    .unwrap_or_default(),
                confidence: row.get::<_, Option<f64>>("confidence")?.unwrap_or(1.0),
                focus_score: row.get("focus_score")?,
            })
        } else {
            None
        };

        Ok(CaptureRecord {
            capture_id: get_uuid(row, "capture_id")?,
            batch_id: get_uuid(row, "batch_id")?,
            captured_at: get_ts(row, "captured_at")?,
            fingerprint: row.get("fingerprint")?,
            duplicate: row.get("duplicate")?,
            analysis,
            failure_reason: row.get("failure_reason")?,
        })
    }

    // ============================================
    // Bucket operations
    // ============================================

    /// Insert or update a bucket. A finalized bucket is never changed again.
    pub fn upsert_bucket(&self, bucket: &TimeBucket) -> Result<()> {
        let activity_counts = serde_json::to_string(&bucket.activity_counts)?;
        let focus_state_counts: BTreeMap<&str, u32> = bucket
            .focus_state_counts
            .iter()
            .map(|(state, count)| (state.as_str(), *count))
            .collect();
        let focus_state_counts = serde_json::to_string(&focus_state_counts)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO buckets (bucket_start, bucket_end, focus_score, scored_captures, active_seconds,
                                 context_switches, activity_counts, focus_state_counts, total_captures,
                                 unanalyzed_captures, finalized, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(bucket_start) DO UPDATE SET
                bucket_end = excluded.bucket_end,
                focus_score = excluded.focus_score,
                scored_captures = excluded.scored_captures,
                active_seconds = excluded.active_seconds,
                context_switches = excluded.context_switches,
                activity_counts = excluded.activity_counts,
                focus_state_counts = excluded.focus_state_counts,
                total_captures = excluded.total_captures,
                unanalyzed_captures = excluded.unanalyzed_captures,
                finalized = excluded.finalized,
                updated_at = excluded.updated_at
            WHERE buckets.finalized = 0
            "#,
            params![
                ts(bucket.bucket_start),
                ts(bucket.bucket_end),
                bucket.focus_score,
                bucket.scored_captures,
                bucket.active_seconds as i64,
                bucket.context_switches,
                activity_counts,
                focus_state_counts,
                bucket.total_captures,
                bucket.unanalyzed_captures,
                bucket.finalized,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Get a bucket by its start
    pub fn get_bucket(&self, bucket_start: DateTime<Utc>) -> Result<Option<TimeBucket>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM buckets WHERE bucket_start = ?",
            [ts(bucket_start)],
            Self::row_to_bucket,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Buckets starting in `[start, end)`, oldest first
    pub fn buckets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeBucket>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM buckets WHERE bucket_start >= ?1 AND bucket_start < ?2 ORDER BY bucket_start ASC",
        )?;

        let buckets = stmt
            .query_map(params![ts(start), ts(end)], Self::row_to_bucket)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(buckets)
    }

    fn row_to_bucket(row: &Row) -> rusqlite::Result<TimeBucket> {
        let raw_states: BTreeMap<String, u32> = get_json(row, "focus_state_counts")?;
        let active_seconds: i64 = row.get("active_seconds")?;

        Ok(TimeBucket {
            bucket_start: get_ts(row, "bucket_start")?,
            bucket_end: get_ts(row, "bucket_end")?,
            focus_score: row.get("focus_score")?,
            scored_captures: row.get("scored_captures")?,
            active_seconds: active_seconds.max(0) as u64,
            context_switches: row.get("context_switches")?,
            activity_counts: get_json(row, "activity_counts")?,
            focus_state_counts: raw_states
                .into_iter()
                .filter_map(|(k, v)| k.parse::<FocusState>().ok().map(|s| (s, v)))
                .collect(),
            total_captures: row.get("total_captures")?,
            unanalyzed_captures: row.get("unanalyzed_captures")?,
            finalized: row.get("finalized")?,
        })
    }

    // ============================================
    // Recovery log
    // ============================================

    /// Journal one capture of the OPEN batch so it survives a crash.
    ///
    /// The batch row is created in state `open` by its first capture. Journaling
    /// the same position twice is a no-op.
    pub fn record_open_capture(
        &self,
        batch_id: Uuid,
        created_at: DateTime<Utc>,
        seq: usize,
        capture: &Capture,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = ts(Utc::now());

        tx.execute(
            r#"
            INSERT INTO pending_batches (batch_id, state, created_at, flushed_at, attempts, last_error, updated_at)
            VALUES (?1, ?2, ?3, NULL, 0, NULL, ?4)
            ON CONFLICT(batch_id) DO NOTHING
            "#,
            params![
                batch_id.to_string(),
                BatchState::Open.as_str(),
                ts(created_at),
                now,
            ],
        )?;
        Self::insert_pending_capture(&tx, batch_id, seq, capture)?;

        tx.commit()?;
        Ok(())
    }

    /// Record a flushed batch, with its payloads, so it survives a crash.
    ///
    /// A batch already journaled as `open` is moved to `flushed`. Recording
    /// the same flushed batch twice is a no-op.
    pub fn record_pending_batch(&self, batch: &Batch) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = ts(Utc::now());

        tx.execute(
            r#"
            INSERT INTO pending_batches (batch_id, state, created_at, flushed_at, attempts, last_error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
            ON CONFLICT(batch_id) DO UPDATE SET
                state = excluded.state,
                flushed_at = excluded.flushed_at,
                updated_at = excluded.updated_at
            WHERE pending_batches.state = 'open'
            "#,
            params![
                batch.id.to_string(),
                BatchState::Flushed.as_str(),
                ts(batch.created_at),
                batch.flushed_at.map(ts),
                batch.attempts,
                now,
            ],
        )?;

        for (seq, capture) in batch.captures.iter().enumerate() {
            Self::insert_pending_capture(&tx, batch.id, seq, capture)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn insert_pending_capture(
        conn: &Connection,
        batch_id: Uuid,
        seq: usize,
        capture: &Capture,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            r#"
            INSERT INTO pending_captures (batch_id, seq, capture_id, captured_at, mime_type,
                                          fingerprint, duplicate, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(batch_id, seq) DO NOTHING
            "#,
            params![
                batch_id.to_string(),
                seq as i64,
                capture.id.to_string(),
                ts(capture.captured_at),
                capture.mime_type,
                capture.fingerprint,
                capture.duplicate,
                capture.payload,
            ],
        )
    }

    /// Update a pending batch's lifecycle state.
    pub fn set_pending_state(&self, batch_id: Uuid, state: BatchState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pending_batches SET state = ?2, updated_at = ?3 WHERE batch_id = ?1",
            params![batch_id.to_string(), state.as_str(), ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Keep an interrupted batch in the recovery log for the next launch.
    ///
    /// `attempts` is the batch's running total; the stored count never goes down.
    pub fn interrupt_batch(&self, batch_id: Uuid, attempts: u32, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = ts(Utc::now());

        let captures: i64 = tx.query_row(
            "SELECT COUNT(*) FROM pending_captures WHERE batch_id = ?",
            [batch_id.to_string()],
            |r| r.get(0),
        )?;
        tx.execute(
            r#"
            UPDATE pending_batches
            SET state = ?2, attempts = MAX(attempts, ?3), last_error = ?4, updated_at = ?5
            WHERE batch_id = ?1
            "#,
            params![
                batch_id.to_string(),
                BatchState::Flushed.as_str(),
                attempts,
                reason,
                now,
            ],
        )?;
        Self::insert_batch_event(&tx, batch_id, "interrupted", attempts, captures as u32, Some(reason), &now)?;

        tx.commit()?;
        Ok(())
    }

    /// Commit analyzed capture rows and drop the batch from the recovery log.
    pub fn complete_batch(
        &self,
        batch_id: Uuid,
        records: &[CaptureRecord],
        attempts: u32,
    ) -> Result<()> {
        self.commit_batch(batch_id, records, attempts, "completed", None)
    }

    /// Commit unanalyzed capture rows, record the failure, and drop the batch
    /// from the recovery log.
    pub fn fail_batch(
        &self,
        batch_id: Uuid,
        records: &[CaptureRecord],
        attempts: u32,
        reason: &str,
    ) -> Result<()> {
        self.commit_batch(batch_id, records, attempts, "failed", Some(reason))
    }

    fn commit_batch(
        &self,
        batch_id: Uuid,
        records: &[CaptureRecord],
        attempts: u32,
        event: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = ts(Utc::now());

        for record in records {
            Self::upsert_capture_row(&tx, record, &now)?;
        }

        tx.execute(
            "DELETE FROM pending_captures WHERE batch_id = ?",
            [batch_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM pending_batches WHERE batch_id = ?",
            [batch_id.to_string()],
        )?;
        Self::insert_batch_event(&tx, batch_id, event, attempts, records.len() as u32, reason, &now)?;

        tx.commit()?;
        Ok(())
    }

    fn insert_batch_event(
        conn: &Connection,
        batch_id: Uuid,
        event: &str,
        attempts: u32,
        captures: u32,
        reason: Option<&str>,
        occurred_at: &str,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            r#"
            INSERT INTO batch_events (batch_id, event, attempts, captures, reason, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![batch_id.to_string(), event, attempts, captures, reason, occurred_at],
        )
    }

    /// Batch outcomes for one batch, oldest first
    pub fn batch_events(&self, batch_id: Uuid) -> Result<Vec<BatchEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM batch_events WHERE batch_id = ? ORDER BY id ASC")?;

        let events = stmt
            .query_map([batch_id.to_string()], |row| {
                Ok(BatchEvent {
                    batch_id: get_uuid(row, "batch_id")?,
                    event: row.get("event")?,
                    attempts: row.get("attempts")?,
                    captures: row.get("captures")?,
                    reason: row.get("reason")?,
                    occurred_at: get_ts(row, "occurred_at")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Load everything needed to resume after a restart.
    ///
    /// `open_since` is the start of the oldest window that is not yet
    /// finalized; capture rows from there on are returned for re-aggregation.
    pub fn load_unflushed_state(&self, open_since: DateTime<Utc>) -> Result<RecoverySnapshot> {
        let pending_batches = self
            .load_pending_batches()
            .map_err(|e| Error::Recovery(format!("failed to load pending batches: {}", e)))?;
        let open_captures = self
            .captures_since(open_since)
            .map_err(|e| Error::Recovery(format!("failed to load open captures: {}", e)))?;

        Ok(RecoverySnapshot {
            pending_batches,
            open_captures,
        })
    }

    /// Pending batches, oldest first. A batch journaled while OPEN comes back
    /// as flushed so it is analyzed like any other.
    fn load_pending_batches(&self) -> Result<Vec<Batch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM pending_batches ORDER BY created_at ASC, batch_id ASC",
        )?;
        let headers = stmt
            .query_map([], |row| {
                Ok(Batch {
                    id: get_uuid(row, "batch_id")?,
                    captures: Vec::new(),
                    state: BatchState::Flushed,
                    created_at: get_ts(row, "created_at")?,
                    flushed_at: get_opt_ts(row, "flushed_at")?,
                    attempts: row.get("attempts")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut captures_stmt =
            conn.prepare("SELECT * FROM pending_captures WHERE batch_id = ? ORDER BY seq ASC")?;

        let mut batches = Vec::with_capacity(headers.len());
        for mut batch in headers {
            batch.captures = captures_stmt
                .query_map([batch.id.to_string()], |row| {
                    Ok(Capture {
                        id: get_uuid(row, "capture_id")?,
                        captured_at: get_ts(row, "captured_at")?,
                        payload: row.get("payload")?,
                        mime_type: row.get("mime_type")?,
                        fingerprint: row.get("fingerprint")?,
                        duplicate: row.get("duplicate")?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            batches.push(batch);
        }

        Ok(batches)
    }

    pub fn count_pending_batches(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_batches", [], |r| r.get(0))?;
        Ok(count)
    }

    // ============================================
    // Retention
    // ============================================

    /// Delete capture rows, buckets and batch events older than `cutoff`.
    ///
    /// The recovery log is left alone; pending batches are always replayed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneStats> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let cutoff = ts(cutoff);

        let captures = tx.execute("DELETE FROM captures WHERE captured_at < ?", [&cutoff])?;
        let buckets = tx.execute("DELETE FROM buckets WHERE bucket_end <= ?", [&cutoff])?;
        let batch_events = tx.execute("DELETE FROM batch_events WHERE occurred_at < ?", [&cutoff])?;

        tx.commit()?;
        Ok(PruneStats {
            captures,
            buckets,
            batch_events,
        })
    }

    // ============================================
    // Read views
    // ============================================

    /// Dashboard view for one UTC day
    pub fn daily_metrics(&self, date: NaiveDate) -> Result<DailyMetrics> {
        let start = day_start(date);
        let buckets = self.buckets_between(start, start + chrono::Duration::days(1))?;
        Ok(DailyMetrics::from_buckets(date, &buckets))
    }

    /// Daily views for every date in `start..=end`
    pub fn metrics_range(&self, start: NaiveDate, end: NaiveDate) -> Result<RangeExport> {
        if end < start {
            return Err(Error::Config(format!(
                "range end {} is before start {}",
                end, start
            )));
        }

        let buckets = self.buckets_between(
            day_start(start),
            day_start(end) + chrono::Duration::days(1),
        )?;

        let days = start
            .iter_days()
            .take_while(|d| *d <= end)
            .map(|d| DailyMetrics::from_buckets(d, &buckets))
            .collect();

        Ok(RangeExport::from_days(start, end, days))
    }

    /// Buckets starting in `[start, end)` with the contexts seen in each
    pub fn recent_activity(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RecentActivity> {
        let buckets = self.buckets_between(start, end)?;
        let until = buckets.last().map_or(end, |b| b.bucket_end.max(end));
        let captures = self.captures_between(start, until)?;
        Ok(RecentActivity::from_records(&buckets, &captures))
    }

    /// Overview of what the store holds
    pub fn status(&self) -> Result<StoreStatus> {
        let schema_version = self.schema_version()?;
        let conn = self.conn.lock().unwrap();

        let (total_captures, unanalyzed_captures, first, last): (i64, i64, Option<String>, Option<String>) =
            conn.query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN analyzed = 0 THEN 1 ELSE 0 END), 0),
                       MIN(captured_at),
                       MAX(captured_at)
                FROM captures
                "#,
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;

        let pending_batches: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_batches", [], |r| r.get(0))?;
        let completed_batches: i64 = conn.query_row(
            "SELECT COUNT(*) FROM batch_events WHERE event = 'completed'",
            [],
            |r| r.get(0),
        )?;
        let failed_batches: i64 = conn.query_row(
            "SELECT COUNT(*) FROM batch_events WHERE event = 'failed'",
            [],
            |r| r.get(0),
        )?;
        let bucket_count: i64 = conn.query_row("SELECT COUNT(*) FROM buckets", [], |r| r.get(0))?;
        let latest_bucket = conn
            .query_row(
                "SELECT * FROM buckets ORDER BY bucket_start DESC LIMIT 1",
                [],
                Self::row_to_bucket,
            )
            .optional()?;

        let parse = |s: Option<String>| {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        Ok(StoreStatus {
            schema_version,
            total_captures,
            unanalyzed_captures,
            pending_batches,
            completed_batches,
            failed_batches,
            bucket_count,
            first_capture_at: parse(first),
            last_capture_at: parse(last),
            latest_bucket,
        })
    }
}

impl BucketSink for Database {
    fn upsert_bucket(&self, bucket: &TimeBucket) -> Result<()> {
        Database::upsert_bucket(self, bucket)
            .map_err(|e| Error::Persistence(format!("bucket {}: {}", bucket.bucket_start, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    fn capture(captured_at: DateTime<Utc>) -> Capture {
        Capture {
            id: Uuid::new_v4(),
            captured_at,
            payload: vec![0xFF, 0xD8, 0x01, 0x02],
            mime_type: "image/jpeg".to_string(),
            fingerprint: "AAAAAAAAAAA=".to_string(),
            duplicate: false,
        }
    }

    fn batch(captures: Vec<Capture>) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            captures,
            state: BatchState::Flushed,
            created_at: at(9, 0, 0),
            flushed_at: Some(at(9, 2, 0)),
            attempts: 0,
        }
    }

    fn analyzed(batch_id: Uuid, capture: &Capture, label: &str) -> CaptureRecord {
        let result = AnalysisResult {
            capture_id: capture.id,
            captured_at: capture.captured_at,
            activity_label: label.to_string(),
            focus_state: FocusState::Focused,
            detected_context: "editor".to_string(),
            confidence: 0.8,
            focus_score: Some(91.5),
            duplicate: capture.duplicate,
        };
        CaptureRecord::analyzed(batch_id, capture, &result)
    }

    #[test]
    fn test_write_capture_is_idempotent() {
        let db = setup_db();
        let c = capture(at(9, 0, 10));
        let record = analyzed(Uuid::new_v4(), &c, "coding");

        db.write_capture(&record).unwrap();
        db.write_capture(&record).unwrap();

        assert_eq!(db.count_captures().unwrap(), 1);
        assert_eq!(db.get_capture(c.id).unwrap(), Some(record));
    }

    #[test]
    fn test_analyzed_row_is_not_downgraded() {
        let db = setup_db();
        let c = capture(at(9, 0, 10));
        let batch_id = Uuid::new_v4();
        let record = analyzed(batch_id, &c, "coding");

        db.write_capture(&record).unwrap();
        db.write_capture(&CaptureRecord::unanalyzed(batch_id, &c, "HTTP 503"))
            .unwrap();

        assert_eq!(db.get_capture(c.id).unwrap(), Some(record));
    }

    #[test]
    fn test_bucket_upsert_and_finalized_guard() {
        let db = setup_db();
        let mut bucket = TimeBucket::empty(at(9, 0, 0), chrono::Duration::minutes(15));
        bucket.focus_score = 75.0;
        bucket.scored_captures = 2;
        bucket.total_captures = 2;
        bucket.active_seconds = 20;
        bucket.context_switches = 1;
        bucket.activity_counts.insert("coding".to_string(), 2);
        bucket.focus_state_counts.insert(FocusState::Neutral, 2);

        db.upsert_bucket(&bucket).unwrap();
        db.upsert_bucket(&bucket).unwrap();
        assert_eq!(db.get_bucket(at(9, 0, 0)).unwrap(), Some(bucket.clone()));

        bucket.finalized = true;
        db.upsert_bucket(&bucket).unwrap();

        let mut changed = bucket.clone();
        changed.finalized = false;
        changed.total_captures = 99;
        db.upsert_bucket(&changed).unwrap();
        assert_eq!(db.get_bucket(at(9, 0, 0)).unwrap(), Some(bucket));
    }

    #[test]
    fn test_pending_batch_roundtrip_and_complete() {
        let db = setup_db();
        let b = batch(vec![capture(at(9, 0, 0)), capture(at(9, 0, 10))]);

        db.record_pending_batch(&b).unwrap();
        db.record_pending_batch(&b).unwrap();

        let snapshot = db.load_unflushed_state(at(9, 0, 0)).unwrap();
        assert_eq!(snapshot.pending_batches.len(), 1);
        let loaded = &snapshot.pending_batches[0];
        assert_eq!(loaded.id, b.id);
        assert_eq!(loaded.captures, b.captures);
        assert_eq!(loaded.flushed_at, b.flushed_at);
        assert!(snapshot.open_captures.is_empty());

        let records: Vec<CaptureRecord> = b
            .captures
            .iter()
            .map(|c| analyzed(b.id, c, "coding"))
            .collect();
        db.complete_batch(b.id, &records, 2).unwrap();

        let snapshot = db.load_unflushed_state(at(9, 0, 0)).unwrap();
        assert!(snapshot.pending_batches.is_empty());
        assert_eq!(snapshot.open_captures, records);

        let events = db.batch_events(b.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "completed");
        assert_eq!(events[0].attempts, 2);
        assert_eq!(events[0].captures, 2);

        let orphaned: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM pending_captures", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orphaned, 0);
    }

    #[test]
    fn test_fail_batch_records_gap() {
        let db = setup_db();
        let b = batch(vec![capture(at(9, 0, 0))]);
        db.record_pending_batch(&b).unwrap();

        let records: Vec<CaptureRecord> = b
            .captures
            .iter()
            .map(|c| CaptureRecord::unanalyzed(b.id, c, "HTTP 413"))
            .collect();
        db.fail_batch(b.id, &records, 1, "HTTP 413").unwrap();

        let row = db.get_capture(b.captures[0].id).unwrap().unwrap();
        assert!(!row.is_analyzed());
        assert_eq!(row.failure_reason.as_deref(), Some("HTTP 413"));
        assert_eq!(db.count_pending_batches().unwrap(), 0);

        let events = db.batch_events(b.id).unwrap();
        assert_eq!(events[0].event, "failed");
        assert_eq!(events[0].reason.as_deref(), Some("HTTP 413"));
    }

    #[test]
    fn test_interrupted_batch_stays_pending() {
        let db = setup_db();
        let b = batch(vec![capture(at(9, 0, 0))]);
        db.record_pending_batch(&b).unwrap();
        db.set_pending_state(b.id, BatchState::Analyzing).unwrap();

        db.interrupt_batch(b.id, 2, "shutdown").unwrap();

        let snapshot = db.load_unflushed_state(at(9, 0, 0)).unwrap();
        assert_eq!(snapshot.pending_batches.len(), 1);
        assert_eq!(snapshot.pending_batches[0].attempts, 2);
        assert_eq!(db.batch_events(b.id).unwrap()[0].event, "interrupted");
    }

    #[test]
    fn test_attempts_accumulate_across_interruptions() {
        let db = setup_db();
        let b = batch(vec![capture(at(9, 0, 0))]);
        db.record_pending_batch(&b).unwrap();

        db.interrupt_batch(b.id, 1, "shutdown").unwrap();
        // A queued batch interrupted on the next run reports the carried total
        db.interrupt_batch(b.id, 1, "shutdown").unwrap();
        db.interrupt_batch(b.id, 3, "shutdown").unwrap();

        let loaded = db.load_unflushed_state(at(9, 0, 0)).unwrap().pending_batches;
        assert_eq!(loaded[0].attempts, 3);
    }

    #[test]
    fn test_open_captures_are_journaled_and_replayed() {
        let db = setup_db();
        let batch_id = Uuid::new_v4();
        let first = capture(at(9, 0, 0));
        let second = capture(at(9, 0, 10));

        db.record_open_capture(batch_id, at(9, 0, 0), 0, &first).unwrap();
        db.record_open_capture(batch_id, at(9, 0, 0), 1, &second).unwrap();
        db.record_open_capture(batch_id, at(9, 0, 0), 1, &second).unwrap();

        let state: String = db
            .connection()
            .query_row("SELECT state FROM pending_batches", [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "open");

        let loaded = db.load_unflushed_state(at(9, 0, 0)).unwrap().pending_batches;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, batch_id);
        assert_eq!(loaded[0].state, BatchState::Flushed);
        assert_eq!(loaded[0].captures, vec![first.clone(), second.clone()]);

        // Flushing the same batch later promotes the journaled row
        let flushed = Batch {
            id: batch_id,
            captures: vec![first, second],
            state: BatchState::Flushed,
            created_at: at(9, 0, 0),
            flushed_at: Some(at(9, 2, 0)),
            attempts: 0,
        };
        db.record_pending_batch(&flushed).unwrap();

        let (state, flushed_at): (String, Option<String>) = db
            .connection()
            .query_row("SELECT state, flushed_at FROM pending_batches", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(state, "flushed");
        assert!(flushed_at.is_some());
        let pending_rows: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM pending_captures", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pending_rows, 2);
    }

    #[test]
    fn test_flushing_does_not_reset_an_analyzing_batch() {
        let db = setup_db();
        let b = batch(vec![capture(at(9, 0, 0))]);
        db.record_pending_batch(&b).unwrap();
        db.set_pending_state(b.id, BatchState::Analyzing).unwrap();

        db.record_pending_batch(&b).unwrap();

        let state: String = db
            .connection()
            .query_row("SELECT state FROM pending_batches", [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "analyzing");
    }

    #[test]
    fn test_corrupt_bucket_json_is_an_error() {
        let db = setup_db();
        let mut bucket = TimeBucket::empty(at(9, 0, 0), chrono::Duration::minutes(15));
        bucket.activity_counts.insert("coding".to_string(), 3);
        db.upsert_bucket(&bucket).unwrap();

        db.connection()
            .execute("UPDATE buckets SET activity_counts = 'not json'", [])
            .unwrap();
        assert!(db.get_bucket(at(9, 0, 0)).is_err());
        assert!(db.status().is_err());

        db.connection()
            .execute(
                "UPDATE buckets SET activity_counts = '{}', focus_state_counts = '[1, 2'",
                [],
            )
            .unwrap();
        assert!(db.get_bucket(at(9, 0, 0)).is_err());
    }

    #[test]
    fn test_recent_activity_includes_captures_of_the_last_bucket() {
        let db = setup_db();
        let mut bucket = TimeBucket::empty(at(9, 0, 0), chrono::Duration::minutes(15));
        bucket.total_captures = 1;
        bucket.activity_counts.insert("coding".to_string(), 1);
        db.upsert_bucket(&bucket).unwrap();

        let late = capture(at(9, 10, 0));
        let mut record = analyzed(Uuid::new_v4(), &late, "coding");
        if let Some(analysis) = record.analysis.as_mut() {
            analysis.detected_context = "code review".to_string();
        }
        db.write_capture(&record).unwrap();

        // The window ends inside the bucket; its captures still count
        let recent = db.recent_activity(at(8, 0, 0), at(9, 5, 0)).unwrap();
        assert_eq!(recent.periods.len(), 1);
        assert_eq!(recent.periods[0].contexts, vec!["code review"]);
        assert_eq!(recent.total_snapshots, 1);
    }

    #[test]
    fn test_captures_between() {
        let db = setup_db();
        let early = capture(at(8, 59, 59));
        let inside = capture(at(9, 5, 0));
        let edge = capture(at(9, 15, 0));
        for c in [&early, &inside, &edge] {
            db.write_capture(&analyzed(Uuid::new_v4(), c, "coding")).unwrap();
        }

        let rows = db.captures_between(at(9, 0, 0), at(9, 15, 0)).unwrap();
        let ids: Vec<Uuid> = rows.iter().map(|r| r.capture_id).collect();
        assert_eq!(ids, vec![inside.id]);
    }

    #[test]
    fn test_pending_batches_load_oldest_first() {
        let db = setup_db();
        let mut older = batch(vec![capture(at(8, 0, 0))]);
        older.created_at = at(8, 0, 0);
        let newer = batch(vec![capture(at(9, 0, 0))]);

        db.record_pending_batch(&newer).unwrap();
        db.record_pending_batch(&older).unwrap();

        let ids: Vec<Uuid> = db
            .load_unflushed_state(at(0, 0, 0))
            .unwrap()
            .pending_batches
            .iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[test]
    fn test_prune() {
        let db = setup_db();
        let old = capture(at(1, 0, 0));
        let recent = capture(at(12, 0, 0));
        db.write_capture(&analyzed(Uuid::new_v4(), &old, "coding")).unwrap();
        db.write_capture(&analyzed(Uuid::new_v4(), &recent, "coding")).unwrap();
        db.upsert_bucket(&TimeBucket::empty(at(1, 0, 0), chrono::Duration::minutes(15)))
            .unwrap();
        db.upsert_bucket(&TimeBucket::empty(at(12, 0, 0), chrono::Duration::minutes(15)))
            .unwrap();

        let stats = db.prune(at(6, 0, 0)).unwrap();
        assert_eq!(stats.captures, 1);
        assert_eq!(stats.buckets, 1);
        assert_eq!(db.count_captures().unwrap(), 1);
        assert!(db.get_capture(recent.id).unwrap().is_some());
    }

    #[test]
    fn test_daily_metrics_and_range() {
        let db = setup_db();
        let mut bucket = TimeBucket::empty(at(9, 0, 0), chrono::Duration::minutes(15));
        bucket.focus_score = 80.0;
        bucket.scored_captures = 4;
        bucket.total_captures = 5;
        bucket.unanalyzed_captures = 1;
        bucket.active_seconds = 40;
        bucket.activity_counts.insert("coding".to_string(), 4);
        bucket.focus_state_counts.insert(FocusState::Focused, 4);
        db.upsert_bucket(&bucket).unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let daily = db.daily_metrics(date).unwrap();
        assert_eq!(daily.summary.focus_score, 80.0);
        assert_eq!(daily.summary.total_captures, 5);
        assert_eq!(daily.summary.unanalyzed_captures, 1);
        assert_eq!(daily.focus_states.focused, 4);

        let range = db
            .metrics_range(date.pred_opt().unwrap(), date.succ_opt().unwrap())
            .unwrap();
        assert_eq!(range.days.len(), 3);
        assert_eq!(range.aggregate.total_captures, 5);
        assert_eq!(range.aggregate.focus_score, 80.0);

        assert!(db.metrics_range(date, date.pred_opt().unwrap()).is_err());
    }

    #[test]
    fn test_status() {
        let db = setup_db();
        let b = batch(vec![capture(at(9, 0, 0)), capture(at(9, 0, 10))]);
        db.record_pending_batch(&b).unwrap();
        db.write_capture(&CaptureRecord::unanalyzed(Uuid::new_v4(), &capture(at(8, 0, 0)), "HTTP 500"))
            .unwrap();

        let status = db.status().unwrap();
        assert_eq!(status.schema_version, super::super::schema::SCHEMA_VERSION);
        assert_eq!(status.total_captures, 1);
        assert_eq!(status.unanalyzed_captures, 1);
        assert_eq!(status.pending_batches, 1);
        assert_eq!(status.last_capture_at, Some(at(8, 0, 0)));
        assert!(status.latest_bucket.is_none());
    }
}
