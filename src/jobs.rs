//! Download job store
//!
//! Append-only queue of download jobs with crash-safe state transitions.
//! Identity fields are frozen at insert time by a storage-level trigger;
//! `claim_next` is the per-source serialization point.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{ensure_columns, utc_now_string};
use crate::models::DeliveryMode;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Playlist,
    Search,
}

impl JobOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOrigin::Playlist => "playlist",
            JobOrigin::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "playlist" => JobOrigin::Playlist,
            "search" => JobOrigin::Search,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaIntent {
    Track,
    Album,
    Playlist,
    Episode,
    Movie,
}

impl MediaIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaIntent::Track => "track",
            MediaIntent::Album => "album",
            MediaIntent::Playlist => "playlist",
            MediaIntent::Episode => "episode",
            MediaIntent::Movie => "movie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "track" => MediaIntent::Track,
            "album" => MediaIntent::Album,
            "playlist" => MediaIntent::Playlist,
            "episode" => MediaIntent::Episode,
            "movie" => MediaIntent::Movie,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "canceled" => JobStatus::Canceled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// Opaque per-job context carried from the enqueuer to the executor.
/// Persisted as JSON; unknown keys survive round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remove_after_download: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub subscribe_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_format: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub audio_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub music_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies_path: Option<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<crate::models::ItemMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modifier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
}

impl JobContext {
    fn to_json(&self) -> Option<String> {
        let value = serde_json::to_value(self).ok()?;
        if value.as_object().map_or(true, |o| o.is_empty()) {
            return None;
        }
        serde_json::to_string(&value).ok()
    }

    fn from_json(raw: Option<&str>) -> JobContext {
        raw.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

/// Identity fields for a new job. Immutable after insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub origin: JobOrigin,
    pub origin_id: String,
    pub media_type: MediaType,
    pub media_intent: MediaIntent,
    pub source: String,
    pub url: String,
    pub output_template: Option<String>,
    pub output_dir: PathBuf,
    pub context: JobContext,
    pub max_attempts: Option<u32>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: String,
    pub origin: JobOrigin,
    pub origin_id: String,
    pub media_type: MediaType,
    pub media_intent: MediaIntent,
    pub source: String,
    pub url: String,
    pub output_template: Option<String>,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub queued_at: Option<String>,
    pub running_at: Option<String>,
    pub completed_at: Option<String>,
    pub failed_at: Option<String>,
    pub canceled_at: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    pub updated_at: String,
    pub last_error: Option<String>,
    pub trace_id: String,
    pub context: JobContext,
}

fn job_log(level: log::Level, job_id: &str, trace_id: &str, source: &str, event: &str, extra: Value) {
    let mut payload = serde_json::json!({
        "event": event,
        "job_id": job_id,
        "trace_id": trace_id,
        "source": source,
    });
    if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    log::log!(level, "{payload}");
}

/// Handle to the download-jobs table in the main database.
#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
}

impl JobStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        if let Some(dir) = self.db_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("open sqlite db: {}", self.db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        ensure_jobs_schema(&conn)?;
        Ok(conn)
    }

    /// Insert a new job in `queued` state and return its id.
    pub fn enqueue(&self, new: NewJob) -> Result<String> {
        if new.source.is_empty() {
            bail!("source is required");
        }
        if new.url.is_empty() {
            bail!("url is required");
        }
        if new.output_dir.as_os_str().is_empty() {
            bail!("output_dir is required");
        }

        let now = utc_now_string();
        let job_id = Uuid::new_v4().simple().to_string();
        let trace_id = new
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let max_attempts = new.max_attempts.filter(|m| *m > 0).unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let context_json = new.context.to_json();

        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO download_jobs (
                id, origin, origin_id, media_type, media_intent, source, url,
                output_template, output_dir, status, queued, attempts, max_attempts,
                created_at, updated_at, trace_id, context_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                job_id,
                new.origin.as_str(),
                new.origin_id,
                new.media_type.as_str(),
                new.media_intent.as_str(),
                new.source,
                new.url,
                new.output_template,
                new.output_dir.to_string_lossy().to_string(),
                JobStatus::Queued.as_str(),
                now,
                0,
                max_attempts,
                now,
                now,
                trace_id,
                context_json,
            ],
        )?;

        job_log(
            log::Level::Info,
            &job_id,
            &trace_id,
            &new.source,
            "job_enqueued",
            serde_json::json!({
                "status": "queued",
                "origin": new.origin.as_str(),
                "media_type": new.media_type.as_str(),
                "media_intent": new.media_intent.as_str(),
            }),
        );
        Ok(job_id)
    }

    /// Atomically claim the oldest ready job for `source`.
    ///
    /// The IMMEDIATE transaction is the serialization point: at most one
    /// worker per source can flip a job to `running` at any instant.
    pub fn claim_next(&self, source: &str, now: Option<&str>) -> Result<Option<DownloadJob>> {
        let now = now.map(str::to_string).unwrap_or_else(utc_now_string);
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = tx
            .query_row(
                r#"
                SELECT * FROM download_jobs
                WHERE status = 'queued' AND source = ?1 AND (queued IS NULL OR queued <= ?2)
                ORDER BY queued ASC, created_at ASC
                LIMIT 1
                "#,
                params![source, now],
                row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            tx.commit()?;
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE download_jobs SET status='running', running=?1, updated_at=?1
             WHERE id=?2 AND status='queued'",
            params![now, job.id],
        )?;
        if updated != 1 {
            tx.commit()?;
            return Ok(None);
        }
        tx.commit()?;

        job.status = JobStatus::Running;
        job.running_at = Some(now);
        Ok(Some(job))
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<DownloadJob>> {
        let conn = self.open()?;
        let job = conn
            .query_row(
                "SELECT * FROM download_jobs WHERE id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// True when the same (source, url) is already queued or running.
    pub fn has_active_job(&self, source: &str, url: &str) -> Result<bool> {
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM download_jobs
                 WHERE source=?1 AND url=?2 AND status IN ('queued','running') LIMIT 1",
                params![source, url],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// True when the (origin, origin_id, url) triple was ever enqueued.
    pub fn has_job_for_origin(&self, origin: JobOrigin, origin_id: &str, url: &str) -> Result<bool> {
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM download_jobs
                 WHERE origin=?1 AND origin_id=?2 AND url=?3 LIMIT 1",
                params![origin.as_str(), origin_id, url],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Sources that have a claimable job right now.
    pub fn list_ready_sources(&self, now: Option<&str>) -> Result<Vec<String>> {
        let now = now.map(str::to_string).unwrap_or_else(utc_now_string);
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT source FROM download_jobs
             WHERE status='queued' AND (queued IS NULL OR queued <= ?1)",
        )?;
        let sources = stmt
            .query_map(params![now], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Earliest future `queued` timestamp (the nearest scheduled retry).
    pub fn next_ready_time(&self, now: Option<&str>) -> Result<Option<String>> {
        let now = now.map(str::to_string).unwrap_or_else(utc_now_string);
        let conn = self.open()?;
        let ts = conn
            .query_row(
                "SELECT queued FROM download_jobs
                 WHERE status='queued' AND queued IS NOT NULL AND queued > ?1
                 ORDER BY queued ASC LIMIT 1",
                params![now],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ts)
    }

    pub fn count_queued(&self) -> Result<u64> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM download_jobs WHERE status='queued'",
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// running -> completed. Returns whether the transition occurred.
    pub fn mark_completed(&self, job: &DownloadJob) -> Result<bool> {
        let now = utc_now_string();
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE download_jobs SET status='completed', completed=?1, updated_at=?1
             WHERE id=?2 AND status='running'",
            params![now, job.id],
        )?;
        if updated != 1 {
            return Ok(false);
        }
        job_log(
            log::Level::Info,
            &job.id,
            &job.trace_id,
            &job.source,
            "job_completed",
            serde_json::json!({"status": "completed"}),
        );
        Ok(true)
    }

    /// running -> canceled.
    pub fn mark_canceled(&self, job: &DownloadJob, reason: &str) -> Result<bool> {
        let now = utc_now_string();
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE download_jobs SET status='canceled', canceled=?1, updated_at=?1, last_error=?2
             WHERE id=?3 AND status='running'",
            params![now, reason, job.id],
        )?;
        if updated != 1 {
            return Ok(false);
        }
        job_log(
            log::Level::Warn,
            &job.id,
            &job.trace_id,
            &job.source,
            "job_canceled",
            serde_json::json!({"status": "canceled", "reason": reason}),
        );
        Ok(true)
    }

    /// running -> failed, or running -> queued when `retry_at` is given
    /// (a scheduled retry: status queued with a future queued timestamp).
    pub fn mark_failed(
        &self,
        job: &DownloadJob,
        error_message: &str,
        retry_at: Option<&str>,
        attempts: Option<u32>,
    ) -> Result<bool> {
        let now = utc_now_string();
        let attempts = attempts.unwrap_or(job.attempts + 1);
        let (status, failed_at, queued_at) = match retry_at {
            Some(retry_at) => (JobStatus::Queued, None, Some(retry_at.to_string())),
            None => (JobStatus::Failed, Some(now.clone()), None),
        };

        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE download_jobs
             SET status=?1, failed=COALESCE(failed, ?2), queued=?3, attempts=?4,
                 updated_at=?5, last_error=?6
             WHERE id=?7 AND status='running'",
            params![
                status.as_str(),
                failed_at,
                queued_at,
                attempts,
                now,
                error_message,
                job.id
            ],
        )?;
        if updated != 1 {
            return Ok(false);
        }

        let (level, event) = match status {
            JobStatus::Queued => (log::Level::Warn, "job_requeued"),
            _ => (log::Level::Error, "job_failed"),
        };
        job_log(
            level,
            &job.id,
            &job.trace_id,
            &job.source,
            event,
            serde_json::json!({
                "status": status.as_str(),
                "attempts": attempts,
                "error": error_message,
                "retry_at": retry_at,
            }),
        );
        Ok(true)
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<DownloadJob> {
    fn field<T: rusqlite::types::FromSql>(row: &Row, name: &str) -> rusqlite::Result<T> {
        row.get(name)
    }

    let origin_raw: String = field(row, "origin")?;
    let media_type_raw: String = field(row, "media_type")?;
    let media_intent_raw: String = field(row, "media_intent")?;
    let status_raw: String = field(row, "status")?;
    let output_dir: String = field(row, "output_dir")?;
    let context_raw: Option<String> = field(row, "context_json")?;

    Ok(DownloadJob {
        id: field(row, "id")?,
        origin: JobOrigin::parse(&origin_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        origin_id: field(row, "origin_id")?,
        media_type: MediaType::parse(&media_type_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        media_intent: MediaIntent::parse(&media_intent_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        source: field(row, "source")?,
        url: field(row, "url")?,
        output_template: field(row, "output_template")?,
        output_dir: PathBuf::from(output_dir),
        status: JobStatus::parse(&status_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        queued_at: field(row, "queued")?,
        running_at: field(row, "running")?,
        completed_at: field(row, "completed")?,
        failed_at: field(row, "failed")?,
        canceled_at: field(row, "canceled")?,
        attempts: field::<i64>(row, "attempts")? as u32,
        max_attempts: field::<i64>(row, "max_attempts")? as u32,
        created_at: field(row, "created_at")?,
        updated_at: field(row, "updated_at")?,
        last_error: field(row, "last_error")?,
        trace_id: field(row, "trace_id")?,
        context: JobContext::from_json(context_raw.as_deref()),
    })
}

/// Create the download_jobs table, its indexes, and the immutability trigger.
pub fn ensure_jobs_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS download_jobs (
            id TEXT PRIMARY KEY,
            origin TEXT NOT NULL,
            origin_id TEXT NOT NULL,
            media_type TEXT NOT NULL,
            media_intent TEXT NOT NULL,
            source TEXT NOT NULL,
            url TEXT NOT NULL,
            output_template TEXT,
            output_dir TEXT NOT NULL,
            status TEXT NOT NULL,
            queued TIMESTAMP,
            running TIMESTAMP,
            completed TIMESTAMP,
            failed TIMESTAMP,
            canceled TIMESTAMP,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            last_error TEXT,
            trace_id TEXT NOT NULL UNIQUE,
            context_json TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_download_jobs_status ON download_jobs (status);
        CREATE INDEX IF NOT EXISTS idx_download_jobs_source_status ON download_jobs (source, status);
        CREATE INDEX IF NOT EXISTS idx_download_jobs_created_at ON download_jobs (created_at);

        CREATE TRIGGER IF NOT EXISTS download_jobs_immutable_fields
        BEFORE UPDATE ON download_jobs
        FOR EACH ROW
        WHEN
            OLD.source != NEW.source
            OR OLD.url != NEW.url
            OR COALESCE(OLD.output_template, '') != COALESCE(NEW.output_template, '')
            OR OLD.media_intent != NEW.media_intent
        BEGIN
            SELECT RAISE(ABORT, 'download_jobs immutable field update blocked');
        END;
        "#,
    )?;

    ensure_columns(
        conn,
        "download_jobs",
        &[
            ("output_template", "output_template TEXT"),
            ("context_json", "context_json TEXT"),
            ("last_error", "last_error TEXT"),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format_ts;
    use chrono::{Duration, Utc};

    fn store() -> (tempfile::TempDir, JobStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path().join("main.db"));
        (tmp, store)
    }

    fn new_job(url: &str) -> NewJob {
        NewJob {
            origin: JobOrigin::Playlist,
            origin_id: "PL123".into(),
            media_type: MediaType::Video,
            media_intent: MediaIntent::Playlist,
            source: "youtube".into(),
            url: url.into(),
            output_template: None,
            output_dir: PathBuf::from("/tmp"),
            context: JobContext::default(),
            max_attempts: None,
            trace_id: None,
        }
    }

    #[test]
    fn test_enqueue_and_claim_fifo() {
        let (_tmp, store) = store();
        let job_a = store.enqueue(new_job("https://example.com/a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let job_b = store.enqueue(new_job("https://example.com/b")).unwrap();

        let claimed = store.claim_next("youtube", None).unwrap().unwrap();
        assert_eq!(claimed.id, job_a);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(store.has_active_job("youtube", "https://example.com/a").unwrap());
        assert!(store.has_active_job("youtube", "https://example.com/b").unwrap());

        let next = store.claim_next("youtube", None).unwrap().unwrap();
        assert_eq!(next.id, job_b);

        assert!(store.claim_next("youtube", None).unwrap().is_none());
    }

    #[test]
    fn test_claim_respects_source_partition() {
        let (_tmp, store) = store();
        store.enqueue(new_job("https://example.com/a")).unwrap();
        assert!(store.claim_next("soundcloud", None).unwrap().is_none());
    }

    #[test]
    fn test_scheduled_retry_not_claimable_early() {
        let (_tmp, store) = store();
        store.enqueue(new_job("https://example.com/a")).unwrap();
        let job = store.claim_next("youtube", None).unwrap().unwrap();

        let retry_at = format_ts(Utc::now() + Duration::seconds(3600));
        assert!(store.mark_failed(&job, "timeout", Some(&retry_at), None).unwrap());

        let refreshed = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Queued);
        assert_eq!(refreshed.attempts, 1);
        assert_eq!(refreshed.queued_at.as_deref(), Some(retry_at.as_str()));

        // Not claimable before the retry instant.
        assert!(store.claim_next("youtube", None).unwrap().is_none());
        assert!(store.list_ready_sources(None).unwrap().is_empty());
        assert_eq!(store.next_ready_time(None).unwrap().as_deref(), Some(retry_at.as_str()));

        // Claimable once the clock passes it.
        let later = format_ts(Utc::now() + Duration::seconds(7200));
        let claimed = store.claim_next("youtube", Some(&later)).unwrap();
        assert!(claimed.is_some());
    }

    #[test]
    fn test_terminal_failure() {
        let (_tmp, store) = store();
        store.enqueue(new_job("https://example.com/a")).unwrap();
        let job = store.claim_next("youtube", None).unwrap().unwrap();
        assert!(store.mark_failed(&job, "drm protected", None, None).unwrap());

        let refreshed = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Failed);
        assert!(refreshed.failed_at.is_some());
        assert_eq!(refreshed.last_error.as_deref(), Some("drm protected"));

        // A second transition on a non-running job reports no-op.
        assert!(!store.mark_completed(&job).unwrap());
    }

    #[test]
    fn test_mark_canceled() {
        let (_tmp, store) = store();
        store.enqueue(new_job("https://example.com/a")).unwrap();
        let job = store.claim_next("youtube", None).unwrap().unwrap();
        assert!(store.mark_canceled(&job, "canceled").unwrap());
        let refreshed = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Canceled);
        assert_eq!(refreshed.last_error.as_deref(), Some("canceled"));
    }

    #[test]
    fn test_identity_fields_immutable() {
        let (_tmp, store) = store();
        let job_id = store.enqueue(new_job("https://example.com/a")).unwrap();
        let conn = store.open().unwrap();

        for update in [
            "UPDATE download_jobs SET source='other' WHERE id=?1",
            "UPDATE download_jobs SET url='https://example.com/x' WHERE id=?1",
            "UPDATE download_jobs SET output_template='%(title)s' WHERE id=?1",
            "UPDATE download_jobs SET media_intent='movie' WHERE id=?1",
        ] {
            let err = conn.execute(update, params![job_id]).unwrap_err();
            assert!(err.to_string().contains("immutable field update blocked"));
        }
    }

    #[test]
    fn test_trace_id_unique() {
        let (_tmp, store) = store();
        let mut job = new_job("https://example.com/a");
        job.trace_id = Some("trace-1".into());
        store.enqueue(job).unwrap();

        let mut dup = new_job("https://example.com/b");
        dup.trace_id = Some("trace-1".into());
        assert!(store.enqueue(dup).is_err());
    }

    #[test]
    fn test_origin_dedup_probe() {
        let (_tmp, store) = store();
        store.enqueue(new_job("https://example.com/a")).unwrap();
        assert!(store
            .has_job_for_origin(JobOrigin::Playlist, "PL123", "https://example.com/a")
            .unwrap());
        assert!(!store
            .has_job_for_origin(JobOrigin::Search, "PL123", "https://example.com/a")
            .unwrap());
    }

    #[test]
    fn test_context_roundtrip() {
        let (_tmp, store) = store();
        let mut job = new_job("https://example.com/a");
        job.context.item_id = Some("v1".into());
        job.context.subscribe_mode = true;
        job.context.delivery_mode = DeliveryMode::Client;
        let id = store.enqueue(job).unwrap();

        let loaded = store.get_job(&id).unwrap().unwrap();
        assert_eq!(loaded.context.item_id.as_deref(), Some("v1"));
        assert!(loaded.context.subscribe_mode);
        assert_eq!(loaded.context.delivery_mode, DeliveryMode::Client);
    }

    #[test]
    fn test_enqueue_rejects_empty_fields() {
        let (_tmp, store) = store();
        let mut job = new_job("");
        job.url = String::new();
        assert!(store.enqueue(job).is_err());
    }
}
