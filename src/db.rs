//! Main database: downloads log, playlist-seen set, playlist-watch rows,
//! persisted schedule state.
//!
//! Schema changes are additive only: on open, any missing table is created
//! and any missing column is ALTERed in. Renames and type changes require a
//! real migration and are not done here.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// Sortable timestamp format shared by both databases. Fixed-width UTC so
/// lexicographic ordering in SQL matches chronological ordering.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn utc_now_string() -> String {
    Utc::now().format(TS_FORMAT).to_string()
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// One row in the downloads log. Created exactly once per successful file
/// placement; never mutated.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub item_id: String,
    pub playlist_id: Option<String>,
    pub downloaded_at: String,
    pub filepath: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistorySort {
    #[default]
    Date,
    Title,
    Size,
}

impl HistorySort {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "title" => HistorySort::Title,
            "size" => HistorySort::Size,
            _ => HistorySort::Date,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub search: Option<String>,
    pub playlist_id: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub sort_by: HistorySort,
    pub descending: bool,
}

/// Handle to the main database. Connections are opened per operation so the
/// store can be shared freely across worker tasks; SQLite's own locking
/// serializes writers.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    db_path: PathBuf,
}

impl HistoryStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> Result<Connection> {
        if let Some(dir) = self.db_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("open sqlite db: {}", self.db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        ensure_main_schema(&conn)?;
        Ok(conn)
    }

    /// Idempotent insert into the downloads log; duplicates are dropped.
    pub fn record_download(
        &self,
        item_id: &str,
        playlist_id: Option<&str>,
        filepath: &str,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO downloads (item_id, playlist_id, downloaded_at, filepath)
             VALUES (?1, ?2, ?3, ?4)",
            params![item_id, playlist_id, utc_now_string(), filepath],
        )?;
        Ok(())
    }

    pub fn is_downloaded(&self, item_id: &str) -> Result<bool> {
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM downloads WHERE item_id = ?1 LIMIT 1",
                params![item_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Whether a collection has ever been observed (any seen rows at all).
    pub fn has_seen_any(&self, playlist_id: &str) -> Result<bool> {
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM playlist_seen WHERE playlist_id = ?1 LIMIT 1",
                params![playlist_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn is_seen(&self, playlist_id: &str, item_id: &str) -> Result<bool> {
        let conn = self.open()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM playlist_seen WHERE playlist_id = ?1 AND item_id = ?2 LIMIT 1",
                params![playlist_id, item_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Idempotent seen-set insert. `downloaded` is a monotonic latch: once a
    /// row holds 1 it never returns to 0.
    pub fn mark_seen(&self, playlist_id: &str, item_id: &str, downloaded: bool) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO playlist_seen (playlist_id, item_id, first_seen_at, downloaded)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(playlist_id, item_id) DO UPDATE
             SET downloaded = MAX(playlist_seen.downloaded, excluded.downloaded)",
            params![playlist_id, item_id, utc_now_string(), downloaded as i64],
        )?;
        Ok(())
    }

    pub fn mark_item_downloaded(&self, playlist_id: &str, item_id: &str) -> Result<()> {
        self.mark_seen(playlist_id, item_id, true)
    }

    /// Record a discovery failure on the watch row without touching the
    /// polling cadence.
    pub fn record_playlist_error(&self, playlist_id: &str, error: &str) -> Result<()> {
        let conn = self.open()?;
        let now = utc_now_string();
        conn.execute(
            "INSERT INTO playlist_watch (playlist_id, last_error, last_error_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(playlist_id) DO UPDATE
             SET last_error = excluded.last_error, last_error_at = excluded.last_error_at",
            params![playlist_id, error, now],
        )?;
        Ok(())
    }

    /// Update the adaptive-polling bookkeeping after a successful check.
    ///
    /// A change resets the interval to `min_interval_min`; quiet checks back
    /// off multiplicatively up to `max_interval_min`.
    pub fn record_playlist_checked(
        &self,
        playlist_id: &str,
        changed: bool,
        min_interval_min: u32,
        max_interval_min: u32,
        backoff_factor: f64,
    ) -> Result<()> {
        let conn = self.open()?;
        let now = Utc::now();
        let now_s = format_ts(now);

        let prev: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT current_interval_min, consecutive_no_change
                 FROM playlist_watch WHERE playlist_id = ?1",
                params![playlist_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let (prev_interval, prev_quiet) = prev.unwrap_or((None, None));
        let (interval, quiet, last_change) = if changed {
            (min_interval_min as i64, 0i64, Some(now_s.clone()))
        } else {
            let base = prev_interval.unwrap_or(min_interval_min as i64).max(1);
            let next = ((base as f64) * backoff_factor.max(1.0)).round() as i64;
            (
                next.min(max_interval_min as i64),
                prev_quiet.unwrap_or(0) + 1,
                None,
            )
        };
        let next_poll = format_ts(now + chrono::Duration::minutes(interval));

        conn.execute(
            "INSERT INTO playlist_watch (
                playlist_id, last_checked_at, next_poll_at, current_interval_min,
                consecutive_no_change, last_change_at, last_error, last_error_at, skip_reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL)
             ON CONFLICT(playlist_id) DO UPDATE SET
                last_checked_at = excluded.last_checked_at,
                next_poll_at = excluded.next_poll_at,
                current_interval_min = excluded.current_interval_min,
                consecutive_no_change = excluded.consecutive_no_change,
                last_change_at = COALESCE(excluded.last_change_at, playlist_watch.last_change_at),
                last_error = NULL,
                last_error_at = NULL,
                skip_reason = NULL",
            params![playlist_id, now_s, next_poll, interval, quiet, last_change],
        )?;
        Ok(())
    }

    /// Query the downloads log with optional filters.
    ///
    /// Date sorting happens in SQL; title/size sorts load matching rows and
    /// order them here (size stats the filesystem lazily, missing files
    /// pushed last) before the limit applies.
    pub fn query_history(&self, query: &HistoryQuery) -> Result<Vec<DownloadRecord>> {
        let conn = self.open()?;

        use rusqlite::types::Value as SqlValue;

        let mut clauses: Vec<&str> = Vec::new();
        let mut params_vec: Vec<SqlValue> = Vec::new();
        if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
            let like = format!("%{search}%");
            clauses.push("(filepath LIKE ?) OR (item_id LIKE ?)");
            params_vec.push(SqlValue::Text(like.clone()));
            params_vec.push(SqlValue::Text(like));
        }
        if let Some(pl) = query.playlist_id.as_deref().filter(|s| !s.is_empty()) {
            clauses.push("playlist_id = ?");
            params_vec.push(SqlValue::Text(pl.to_string()));
        }
        if let Some(from) = query.date_from.as_deref() {
            clauses.push("downloaded_at >= ?");
            params_vec.push(SqlValue::Text(from.to_string()));
        }
        if let Some(to) = query.date_to.as_deref() {
            clauses.push("downloaded_at <= ?");
            params_vec.push(SqlValue::Text(to.to_string()));
        }

        let mut sql =
            "SELECT item_id, playlist_id, downloaded_at, filepath FROM downloads".to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(
                &clauses
                    .iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            );
        }

        let date_sorted = query.sort_by == HistorySort::Date;
        if date_sorted {
            sql.push_str(if query.descending {
                " ORDER BY downloaded_at DESC"
            } else {
                " ORDER BY downloaded_at ASC"
            });
            if let Some(limit) = query.limit {
                sql.push_str(" LIMIT ?");
                params_vec.push(SqlValue::Integer(limit as i64));
            }
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = Vec::new();
        let mapped = stmt.query_map(rusqlite::params_from_iter(params_vec), |r| {
            Ok(DownloadRecord {
                item_id: r.get(0)?,
                playlist_id: r.get(1)?,
                downloaded_at: r.get(2)?,
                filepath: r.get(3)?,
            })
        })?;
        for row in mapped {
            rows.push(row?);
        }

        match query.sort_by {
            HistorySort::Date => {}
            HistorySort::Title => {
                rows.sort_by_key(|r| {
                    Path::new(&r.filepath)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_lowercase())
                        .unwrap_or_default()
                });
                if query.descending {
                    rows.reverse();
                }
            }
            HistorySort::Size => {
                let desc = query.descending;
                rows.sort_by_key(|r| {
                    let size = fs::metadata(&r.filepath).map(|m| m.len() as i64).ok();
                    let missing = size.is_none();
                    let mut key = size.unwrap_or(0);
                    if desc {
                        key = -key;
                    }
                    (missing, key)
                });
            }
        }

        if !date_sorted {
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
        }
        Ok(rows)
    }

    // --- persisted schedule state -------------------------------------

    pub fn get_schedule_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM schedule_state WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_schedule_value(&self, key: &str, value: Option<&str>) -> Result<()> {
        let conn = self.open()?;
        match value {
            Some(v) => {
                conn.execute(
                    "INSERT INTO schedule_state (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, v],
                )?;
            }
            None => {
                conn.execute("DELETE FROM schedule_state WHERE key = ?1", params![key])?;
            }
        }
        Ok(())
    }
}

/// Create missing tables and add missing columns.
pub fn ensure_main_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
          item_id TEXT PRIMARY KEY,
          playlist_id TEXT,
          downloaded_at TIMESTAMP,
          filepath TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_downloads_playlist ON downloads(playlist_id);
        CREATE INDEX IF NOT EXISTS idx_downloads_downloaded_at ON downloads(downloaded_at);

        CREATE TABLE IF NOT EXISTS playlist_seen (
          playlist_id TEXT NOT NULL,
          item_id TEXT NOT NULL,
          first_seen_at TIMESTAMP,
          downloaded INTEGER DEFAULT 0,
          PRIMARY KEY (playlist_id, item_id)
        );
        CREATE INDEX IF NOT EXISTS idx_playlist_seen_playlist ON playlist_seen(playlist_id);

        CREATE TABLE IF NOT EXISTS playlist_watch (
          playlist_id TEXT PRIMARY KEY,
          last_checked_at TIMESTAMP,
          next_poll_at TIMESTAMP,
          current_interval_min INTEGER,
          consecutive_no_change INTEGER,
          last_change_at TIMESTAMP,
          last_error TEXT,
          last_error_at TIMESTAMP,
          skip_reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_playlist_watch_next_poll ON playlist_watch(next_poll_at);

        CREATE TABLE IF NOT EXISTS schedule_state (
          key TEXT PRIMARY KEY,
          value TEXT
        );
        "#,
    )?;

    ensure_columns(
        conn,
        "playlist_watch",
        &[
            ("last_checked_at", "last_checked_at TIMESTAMP"),
            ("next_poll_at", "next_poll_at TIMESTAMP"),
            ("current_interval_min", "current_interval_min INTEGER"),
            ("consecutive_no_change", "consecutive_no_change INTEGER"),
            ("last_change_at", "last_change_at TIMESTAMP"),
            ("last_error", "last_error TEXT"),
            ("last_error_at", "last_error_at TIMESTAMP"),
            ("skip_reason", "skip_reason TEXT"),
        ],
    )?;
    ensure_columns(
        conn,
        "playlist_seen",
        &[
            ("first_seen_at", "first_seen_at TIMESTAMP"),
            ("downloaded", "downloaded INTEGER DEFAULT 0"),
        ],
    )?;

    Ok(())
}

/// ALTER in any column missing from an existing table.
pub fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: HashSet<String> = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<std::result::Result<_, _>>()?;
    for (name, ddl) in columns {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {ddl}"), [])?;
            log::warn!("Migrated {table}: added column {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(tmp.path().join("main.db"));
        (tmp, store)
    }

    #[test]
    fn test_record_download_idempotent() {
        let (_tmp, store) = store();
        store.record_download("v1", Some("PL1"), "/lib/a.webm").unwrap();
        store.record_download("v1", Some("PL1"), "/lib/other.webm").unwrap();
        assert!(store.is_downloaded("v1").unwrap());

        let rows = store.query_history(&HistoryQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].filepath, "/lib/a.webm");
    }

    #[test]
    fn test_mark_seen_monotonic_latch() {
        let (_tmp, store) = store();
        assert!(!store.has_seen_any("PL1").unwrap());
        store.mark_seen("PL1", "v1", false).unwrap();
        assert!(store.has_seen_any("PL1").unwrap());
        assert!(store.is_seen("PL1", "v1").unwrap());

        store.mark_seen("PL1", "v1", true).unwrap();
        // Setting false after true must be a no-op.
        store.mark_seen("PL1", "v1", false).unwrap();

        let conn = store.open().unwrap();
        let downloaded: i64 = conn
            .query_row(
                "SELECT downloaded FROM playlist_seen WHERE playlist_id='PL1' AND item_id='v1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(downloaded, 1);
    }

    #[test]
    fn test_query_history_filters() {
        let (_tmp, store) = store();
        store.record_download("v1", Some("PL1"), "/lib/alpha.webm").unwrap();
        store.record_download("v2", Some("PL2"), "/lib/beta.webm").unwrap();

        let rows = store
            .query_history(&HistoryQuery {
                playlist_id: Some("PL2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id, "v2");

        let rows = store
            .query_history(&HistoryQuery {
                search: Some("alpha".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id, "v1");
    }

    #[test]
    fn test_size_sort_pushes_missing_last() {
        let tmp = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(tmp.path().join("main.db"));
        let big = tmp.path().join("big.bin");
        let small = tmp.path().join("small.bin");
        fs::write(&big, vec![0u8; 4096]).unwrap();
        fs::write(&small, vec![0u8; 16]).unwrap();
        store.record_download("big", None, big.to_str().unwrap()).unwrap();
        store.record_download("gone", None, "/nonexistent/file.bin").unwrap();
        store.record_download("small", None, small.to_str().unwrap()).unwrap();

        let rows = store
            .query_history(&HistoryQuery {
                sort_by: HistorySort::Size,
                descending: true,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["big", "small", "gone"]);
    }

    #[test]
    fn test_playlist_watch_backoff() {
        let (_tmp, store) = store();
        store.record_playlist_checked("PL1", true, 15, 720, 2.0).unwrap();
        store.record_playlist_checked("PL1", false, 15, 720, 2.0).unwrap();
        store.record_playlist_checked("PL1", false, 15, 720, 2.0).unwrap();

        let conn = store.open().unwrap();
        let (interval, quiet): (i64, i64) = conn
            .query_row(
                "SELECT current_interval_min, consecutive_no_change
                 FROM playlist_watch WHERE playlist_id='PL1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(interval, 60);
        assert_eq!(quiet, 2);

        store.record_playlist_checked("PL1", true, 15, 720, 2.0).unwrap();
        let interval: i64 = conn
            .query_row(
                "SELECT current_interval_min FROM playlist_watch WHERE playlist_id='PL1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(interval, 15);
    }

    #[test]
    fn test_schedule_state_roundtrip() {
        let (_tmp, store) = store();
        assert!(store.get_schedule_value("last_run").unwrap().is_none());
        store.set_schedule_value("last_run", Some("2026-01-01T00:00:00")).unwrap();
        assert_eq!(
            store.get_schedule_value("last_run").unwrap().as_deref(),
            Some("2026-01-01T00:00:00")
        );
        store.set_schedule_value("last_run", None).unwrap();
        assert!(store.get_schedule_value("last_run").unwrap().is_none());
    }
}
