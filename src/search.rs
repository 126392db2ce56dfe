//! Search resolution service
//!
//! Turns free-form "find this track/album" requests into ranked candidates
//! across the adapter registry and enqueues the chosen ones as download
//! jobs. Requests, items, and candidates persist in their own database so
//! the resolver can resume after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{ensure_columns, utc_now_string};
use crate::jobs::{JobContext, JobOrigin, JobStore, MediaIntent, MediaType, NewJob};
use crate::models::ItemMetadata;
use crate::paths::resolve_dir;
use crate::search_adapters::AdapterRegistry;
use crate::search_scoring::{rank_candidates, Candidate, RankedCandidate, ScoreTarget};

pub const DEFAULT_MIN_MATCH_SCORE: f64 = 0.92;
pub const DEFAULT_MAX_CANDIDATES: u32 = 5;

fn default_source_priority() -> Vec<String> {
    vec![
        "bandcamp".to_string(),
        "youtube_music".to_string(),
        "soundcloud".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchIntent {
    Track,
    Album,
    Artist,
    ArtistCollection,
}

impl SearchIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchIntent::Track => "track",
            SearchIntent::Album => "album",
            SearchIntent::Artist => "artist",
            SearchIntent::ArtistCollection => "artist_collection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "track" => SearchIntent::Track,
            "album" => SearchIntent::Album,
            "artist" => SearchIntent::Artist,
            "artist_collection" => SearchIntent::ArtistCollection,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Resolving,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Resolving => "resolving",
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => RequestStatus::Queued,
            "resolving" => RequestStatus::Resolving,
            "running" => RequestStatus::Running,
            "completed" => RequestStatus::Completed,
            "failed" => RequestStatus::Failed,
            "canceled" => RequestStatus::Canceled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Searching,
    CandidateFound,
    Selected,
    Enqueued,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Searching => "searching",
            ItemStatus::CandidateFound => "candidate_found",
            ItemStatus::Selected => "selected",
            ItemStatus::Enqueued => "enqueued",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => ItemStatus::Queued,
            "searching" => ItemStatus::Searching,
            "candidate_found" => ItemStatus::CandidateFound,
            "selected" => ItemStatus::Selected,
            "enqueued" => ItemStatus::Enqueued,
            "skipped" => ItemStatus::Skipped,
            "failed" => ItemStatus::Failed,
            _ => return None,
        })
    }

    fn is_open(self) -> bool {
        matches!(
            self,
            ItemStatus::Queued | ItemStatus::Searching | ItemStatus::CandidateFound | ItemStatus::Selected
        )
    }
}

/// Request payload accepted by `POST /api/search`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequestPayload {
    pub intent: Option<String>,
    pub media_type: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    pub include_albums: Option<bool>,
    pub include_singles: Option<bool>,
    pub min_match_score: Option<f64>,
    pub duration_hint_sec: Option<u32>,
    pub quality_min_bitrate_kbps: Option<u32>,
    pub lossless_only: Option<bool>,
    pub source_priority: Option<Vec<String>>,
    pub max_candidates_per_source: Option<u32>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequestRow {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub created_by: Option<String>,
    pub intent: SearchIntent,
    pub media_type: MediaType,
    pub artist: String,
    pub album: Option<String>,
    pub track: Option<String>,
    pub include_albums: bool,
    pub include_singles: bool,
    pub min_match_score: f64,
    pub duration_hint_sec: Option<u32>,
    pub quality_min_bitrate_kbps: Option<u32>,
    pub lossless_only: bool,
    pub source_priority: Vec<String>,
    pub max_candidates_per_source: u32,
    pub status: RequestStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchItemRow {
    pub id: String,
    pub request_id: String,
    pub position: u32,
    pub item_type: String,
    pub media_type: MediaType,
    pub artist: String,
    pub album: Option<String>,
    pub track: Option<String>,
    pub duration_hint_sec: Option<u32>,
    pub status: ItemStatus,
    pub chosen_source: Option<String>,
    pub chosen_url: Option<String>,
    pub chosen_score: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchCandidateRow {
    pub id: String,
    pub item_id: String,
    pub source: String,
    pub url: String,
    pub title: String,
    pub uploader: Option<String>,
    pub artist_detected: Option<String>,
    pub album_detected: Option<String>,
    pub track_detected: Option<String>,
    pub duration_sec: Option<u32>,
    pub artwork_url: Option<String>,
    pub score_artist: f64,
    pub score_track: f64,
    pub score_album: f64,
    pub score_duration: f64,
    pub source_modifier: f64,
    pub penalty_multiplier: f64,
    pub final_score: f64,
    pub rank: u32,
}

fn log_event(level: log::Level, payload: serde_json::Value) {
    log::log!(level, "{payload}");
}

pub struct SearchResolutionService {
    db_path: PathBuf,
    jobs: JobStore,
    adapters: AdapterRegistry,
    library_root: PathBuf,
    // One resolver pass at a time.
    pass_lock: Mutex<()>,
}

impl SearchResolutionService {
    pub fn new(
        db_path: PathBuf,
        jobs: JobStore,
        adapters: AdapterRegistry,
        library_root: PathBuf,
    ) -> Self {
        Self {
            db_path,
            jobs,
            adapters,
            library_root,
            pass_lock: Mutex::new(()),
        }
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
        ensure_search_schema(&conn)?;
        Ok(conn)
    }

    /// Validate and persist a new request in `queued` state.
    pub fn create_request(&self, payload: &SearchRequestPayload) -> Result<String> {
        let intent_raw = payload
            .intent
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let Some(intent) = SearchIntent::parse(&intent_raw) else {
            bail!("intent must be track, album, artist, or artist_collection");
        };
        let media_raw = payload
            .media_type
            .as_deref()
            .unwrap_or("audio")
            .trim()
            .to_lowercase();
        let Some(media_type) = MediaType::parse(&media_raw) else {
            bail!("media_type must be audio or video");
        };
        let artist = payload.artist.as_deref().unwrap_or("").trim().to_string();
        if artist.is_empty() {
            bail!("artist is required");
        }
        let album = payload
            .album
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let track = payload
            .track
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if intent == SearchIntent::Track && track.is_none() {
            bail!("track is required for track intent");
        }
        if intent == SearchIntent::Album && album.is_none() {
            bail!("album is required for album intent");
        }

        let min_match_score = payload
            .min_match_score
            .filter(|s| s.is_finite())
            .unwrap_or(DEFAULT_MIN_MATCH_SCORE);
        let max_candidates = payload
            .max_candidates_per_source
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_MAX_CANDIDATES);
        let source_priority = payload
            .source_priority
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(default_source_priority);

        let now = utc_now_string();
        let request_id = Uuid::new_v4().simple().to_string();
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO search_requests (
                id, created_at, updated_at, created_by, intent, media_type, artist,
                album, track, include_albums, include_singles, min_match_score,
                duration_hint_sec, quality_min_bitrate_kbps, lossless_only,
                source_priority_json, max_candidates_per_source, status, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                request_id,
                now,
                now,
                payload.created_by.as_deref().unwrap_or(""),
                intent.as_str(),
                media_type.as_str(),
                artist,
                album,
                track,
                payload.include_albums.unwrap_or(true) as i64,
                payload.include_singles.unwrap_or(true) as i64,
                min_match_score,
                payload.duration_hint_sec,
                payload.quality_min_bitrate_kbps,
                payload.lossless_only.unwrap_or(false) as i64,
                serde_json::to_string(&source_priority)?,
                max_candidates,
                RequestStatus::Queued.as_str(),
                Option::<String>::None,
            ],
        )?;

        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_request_created",
                "request_id": request_id,
                "status": "queued",
                "intent": intent.as_str(),
                "media_type": media_type.as_str(),
            }),
        );
        Ok(request_id)
    }

    pub fn get_request(&self, request_id: &str) -> Result<Option<(SearchRequestRow, HashMap<String, u32>)>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT * FROM search_requests WHERE id = ?1",
                params![request_id],
                row_to_request,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM search_items WHERE request_id = ?1 GROUP BY status",
        )?;
        let summary: HashMap<String, u32> = stmt
            .query_map(params![request_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u32))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(Some((row, summary)))
    }

    pub fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: u32,
    ) -> Result<Vec<SearchRequestRow>> {
        let limit = limit.clamp(1, 200);
        let conn = self.open()?;
        let mut rows = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM search_requests WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2",
                )?;
                let mapped = stmt.query_map(params![status.as_str(), limit], row_to_request)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM search_requests ORDER BY created_at ASC LIMIT ?1")?;
                let mapped = stmt.query_map(params![limit], row_to_request)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
        }
        Ok(rows)
    }

    pub fn list_items(&self, request_id: &str) -> Result<Vec<SearchItemRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM search_items WHERE request_id = ?1 ORDER BY position ASC",
        )?;
        let mapped = stmt.query_map(params![request_id], row_to_item)?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    pub fn list_candidates(&self, item_id: &str) -> Result<Vec<SearchCandidateRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM search_candidates WHERE item_id = ?1 ORDER BY rank ASC",
        )?;
        let mapped = stmt.query_map(params![item_id], row_to_candidate)?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Cancel a request and skip its open items. Returns false when the
    /// request was already terminal.
    pub fn cancel_request(&self, request_id: &str) -> Result<bool> {
        let now = utc_now_string();
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE search_requests SET status='canceled', updated_at=?1, error='canceled'
             WHERE id=?2 AND status NOT IN ('completed','failed','canceled')",
            params![now, request_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE search_items SET status='skipped', error='request_canceled'
             WHERE request_id=?1 AND status IN ('queued','searching','candidate_found','selected')",
            params![request_id],
        )?;
        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_request_canceled",
                "request_id": request_id,
                "status": "canceled",
            }),
        );
        Ok(true)
    }

    /// Claim and fully process the next queued request. Returns its id, or
    /// None when the queue is empty.
    pub fn run_resolution_once(&self, config: &Config) -> Result<Option<String>> {
        let _guard = self.pass_lock.lock().expect("resolver pass lock");

        let Some(request) = self.claim_next_request()? else {
            return Ok(None);
        };
        let request_id = request.id.clone();

        if matches!(
            request.intent,
            SearchIntent::Artist | SearchIntent::ArtistCollection
        ) {
            self.update_request_status(&request_id, RequestStatus::Failed, Some("not_implemented"))?;
            return Ok(Some(request_id));
        }

        self.ensure_items(&request)?;
        self.update_request_status(&request_id, RequestStatus::Running, None)?;

        for item in self.list_items(&request_id)? {
            if !matches!(
                item.status,
                ItemStatus::Queued | ItemStatus::Searching | ItemStatus::CandidateFound
            ) {
                continue;
            }
            self.process_item(&request, &item, config)?;
        }

        self.finalize_request(&request_id)?;
        Ok(Some(request_id))
    }

    fn claim_next_request(&self) -> Result<Option<SearchRequestRow>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                "SELECT * FROM search_requests WHERE status='queued' ORDER BY created_at ASC LIMIT 1",
                [],
                row_to_request,
            )
            .optional()?;
        let Some(mut row) = row else {
            tx.commit()?;
            return Ok(None);
        };
        let updated = tx.execute(
            "UPDATE search_requests SET status='resolving', updated_at=?1 WHERE id=?2 AND status='queued'",
            params![utc_now_string(), row.id],
        )?;
        tx.commit()?;
        if updated != 1 {
            return Ok(None);
        }
        row.status = RequestStatus::Resolving;
        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_request_status",
                "request_id": row.id,
                "status": "resolving",
            }),
        );
        Ok(Some(row))
    }

    fn update_request_status(
        &self,
        request_id: &str,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE search_requests SET status=?1, updated_at=?2, error=?3 WHERE id=?4",
            params![status.as_str(), utc_now_string(), error, request_id],
        )?;
        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_request_status",
                "request_id": request_id,
                "status": status.as_str(),
                "error": error,
            }),
        );
        Ok(())
    }

    /// Materialize the resolvable units: one item per track/album intent.
    fn ensure_items(&self, request: &SearchRequestRow) -> Result<()> {
        let conn = self.open()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM search_items WHERE request_id = ?1 LIMIT 1",
                params![request.id],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(());
        }

        let item_type = request.intent.as_str();
        conn.execute(
            r#"
            INSERT INTO search_items (
                id, request_id, position, item_type, media_type, artist, album,
                track, duration_hint_sec, status
            ) VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, 'queued')
            "#,
            params![
                Uuid::new_v4().simple().to_string(),
                request.id,
                item_type,
                request.media_type.as_str(),
                request.artist,
                request.album,
                request.track,
                request.duration_hint_sec,
            ],
        )?;
        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_items_created",
                "request_id": request.id,
                "count": 1,
            }),
        );
        Ok(())
    }

    fn process_item(
        &self,
        request: &SearchRequestRow,
        item: &SearchItemRow,
        config: &Config,
    ) -> Result<()> {
        {
            let conn = self.open()?;
            let updated = conn.execute(
                "UPDATE search_items SET status='searching' WHERE id=?1 AND status='queued'",
                params![item.id],
            )?;
            if updated != 1 {
                return Ok(());
            }
        }
        self.log_item_status(&request.id, &item.id, ItemStatus::Searching, None);

        let target = ScoreTarget {
            artist: item.artist.clone(),
            track: item.track.clone().unwrap_or_default(),
            album: item.album.clone().unwrap_or_default(),
            duration_hint_sec: item.duration_hint_sec,
        };

        let mut candidates: Vec<Candidate> = Vec::new();
        for source in &request.source_priority {
            let Some(adapter) = self.adapters.get(source) else {
                continue;
            };
            let hits = if item.item_type == "track" {
                adapter.search_track(
                    &item.artist,
                    item.track.as_deref().unwrap_or(""),
                    item.album.as_deref(),
                    request.max_candidates_per_source,
                )
            } else {
                adapter.search_album(
                    &item.artist,
                    item.album.as_deref().unwrap_or(""),
                    request.max_candidates_per_source,
                )
            };
            let hits = match hits {
                Ok(hits) => hits,
                Err(err) => {
                    log::warn!("Search adapter {source} failed: {err:#}");
                    continue;
                }
            };
            for hit in hits
                .into_iter()
                .take(request.max_candidates_per_source as usize)
            {
                if hit.url.is_empty() {
                    continue;
                }
                let modifier = adapter.source_modifier(&hit);
                candidates.push(hit.into_candidate(source, modifier));
            }
        }

        if candidates.is_empty() {
            self.set_item_status(&request.id, &item.id, ItemStatus::Failed, Some("no_candidates"))?;
            return Ok(());
        }

        let ranked = rank_candidates(&target, &candidates, &request.source_priority);
        self.persist_candidates(&item.id, &ranked)?;
        self.set_item_status(&request.id, &item.id, ItemStatus::CandidateFound, None)?;

        let chosen = ranked
            .iter()
            .find(|r| r.breakdown.final_score >= request.min_match_score);
        let Some(chosen) = chosen else {
            self.set_item_status(
                &request.id,
                &item.id,
                ItemStatus::Failed,
                Some("no_candidate_above_threshold"),
            )?;
            return Ok(());
        };

        {
            let conn = self.open()?;
            conn.execute(
                "UPDATE search_items SET chosen_source=?1, chosen_url=?2, chosen_score=?3, status='selected'
                 WHERE id=?4",
                params![
                    chosen.candidate.source,
                    chosen.candidate.url,
                    chosen.breakdown.final_score,
                    item.id
                ],
            )?;
        }
        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_item_selected",
                "request_id": request.id,
                "item_id": item.id,
                "status": "selected",
                "source": chosen.candidate.source,
                "url": chosen.candidate.url,
                "score": chosen.breakdown.final_score,
            }),
        );

        match self.enqueue_download_job(request, item, chosen, config) {
            Ok(trace_id) => self.set_item_status_with_trace(
                &request.id,
                &item.id,
                ItemStatus::Enqueued,
                None,
                Some(&chosen.candidate.source),
                trace_id.as_deref(),
            ),
            Err(err) => {
                log::error!("Failed to enqueue search job: {err:#}");
                self.set_item_status(&request.id, &item.id, ItemStatus::Failed, Some("enqueue_failed"))
            }
        }
    }

    fn persist_candidates(&self, item_id: &str, ranked: &[RankedCandidate]) -> Result<()> {
        let conn = self.open()?;
        for entry in ranked {
            conn.execute(
                r#"
                INSERT INTO search_candidates (
                    id, item_id, source, url, title, uploader, artist_detected,
                    album_detected, track_detected, duration_sec, artwork_url,
                    score_artist, score_track, score_album, score_duration,
                    source_modifier, penalty_multiplier, final_score, rank
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                "#,
                params![
                    Uuid::new_v4().simple().to_string(),
                    item_id,
                    entry.candidate.source,
                    entry.candidate.url,
                    entry.candidate.title,
                    entry.candidate.uploader,
                    entry.candidate.artist,
                    entry.candidate.album,
                    entry.candidate.track,
                    entry.candidate.duration_sec,
                    entry.candidate.artwork_url,
                    entry.breakdown.score_artist,
                    entry.breakdown.score_track,
                    entry.breakdown.score_album,
                    entry.breakdown.score_duration,
                    entry.breakdown.source_modifier,
                    entry.breakdown.penalty_multiplier,
                    entry.breakdown.final_score,
                    entry.rank,
                ],
            )?;
        }
        Ok(())
    }

    /// Enqueue the chosen candidate as a download job; a previously recorded
    /// (origin, origin_id, url) triple collapses to a no-op.
    fn enqueue_download_job(
        &self,
        request: &SearchRequestRow,
        item: &SearchItemRow,
        chosen: &RankedCandidate,
        config: &Config,
    ) -> Result<Option<String>> {
        if self
            .jobs
            .has_job_for_origin(JobOrigin::Search, &request.id, &chosen.candidate.url)?
        {
            log_event(
                log::Level::Info,
                serde_json::json!({
                    "event": "download_job_exists",
                    "request_id": request.id,
                    "item_id": item.id,
                    "source": chosen.candidate.source,
                    "url": chosen.candidate.url,
                }),
            );
            return Ok(None);
        }

        let output_dir = resolve_dir(
            config.single_download_folder.as_deref(),
            &self.library_root,
        )
        .unwrap_or_else(|_| self.library_root.clone());
        let is_audio = request.media_type == MediaType::Audio;
        let output_template = if is_audio {
            config.music_filename_template.clone()
        } else {
            config.filename_template.clone()
        };

        let metadata = ItemMetadata {
            item_id: String::new(),
            title: Some(chosen.candidate.title.clone()),
            artist: chosen.candidate.artist.clone(),
            album: chosen.candidate.album.clone(),
            track: chosen
                .candidate
                .track
                .clone()
                .or_else(|| Some(chosen.candidate.title.clone())),
            url: Some(chosen.candidate.url.clone()),
            thumbnail_url: chosen.candidate.artwork_url.clone(),
            ..Default::default()
        };

        let trace_id = Uuid::new_v4().simple().to_string();
        let media_intent = if item.item_type == "album" {
            MediaIntent::Album
        } else {
            MediaIntent::Track
        };

        self.jobs.enqueue(NewJob {
            origin: JobOrigin::Search,
            origin_id: request.id.clone(),
            media_type: request.media_type,
            media_intent,
            source: chosen.candidate.source.clone(),
            url: chosen.candidate.url.clone(),
            output_template,
            output_dir,
            context: JobContext {
                request_id: Some(request.id.clone()),
                search_item_id: Some(item.id.clone()),
                target_format: config.final_format.clone(),
                audio_only: is_audio,
                music_mode: is_audio,
                metadata: Some(metadata),
                source_modifier: Some(chosen.breakdown.source_modifier),
                final_score: Some(chosen.breakdown.final_score),
                ..Default::default()
            },
            max_attempts: config.job_max_attempts,
            trace_id: Some(trace_id.clone()),
        })?;

        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "download_job_enqueued",
                "request_id": request.id,
                "item_id": item.id,
                "trace_id": trace_id,
                "source": chosen.candidate.source,
                "url": chosen.candidate.url,
            }),
        );
        Ok(Some(trace_id))
    }

    fn set_item_status(
        &self,
        request_id: &str,
        item_id: &str,
        status: ItemStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.set_item_status_with_trace(request_id, item_id, status, error, None, None)
    }

    fn set_item_status_with_trace(
        &self,
        request_id: &str,
        item_id: &str,
        status: ItemStatus,
        error: Option<&str>,
        source: Option<&str>,
        trace_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE search_items SET status=?1, error=?2 WHERE id=?3",
            params![status.as_str(), error, item_id],
        )?;
        let mut payload = serde_json::json!({
            "event": "search_item_status",
            "request_id": request_id,
            "item_id": item_id,
            "status": status.as_str(),
            "error": error,
        });
        if let Some(obj) = payload.as_object_mut() {
            if let Some(source) = source {
                obj.insert("source".to_string(), source.into());
            }
            if let Some(trace_id) = trace_id {
                obj.insert("trace_id".to_string(), trace_id.into());
            }
        }
        log_event(log::Level::Info, payload);
        Ok(())
    }

    fn log_item_status(&self, request_id: &str, item_id: &str, status: ItemStatus, error: Option<&str>) {
        log_event(
            log::Level::Info,
            serde_json::json!({
                "event": "search_item_status",
                "request_id": request_id,
                "item_id": item_id,
                "status": status.as_str(),
                "error": error,
            }),
        );
    }

    /// Completed when any item reached enqueued; running when work remains;
    /// failed otherwise.
    fn finalize_request(&self, request_id: &str) -> Result<()> {
        let items = self.list_items(request_id)?;
        if items.iter().any(|i| i.status.is_open()) {
            self.update_request_status(request_id, RequestStatus::Running, None)?;
            return Ok(());
        }
        if items.iter().any(|i| i.status == ItemStatus::Enqueued) {
            self.update_request_status(request_id, RequestStatus::Completed, None)?;
            return Ok(());
        }
        self.update_request_status(request_id, RequestStatus::Failed, Some("no_items_enqueued"))
    }
}

fn row_to_request(row: &Row) -> rusqlite::Result<SearchRequestRow> {
    let intent_raw: String = row.get("intent")?;
    let media_raw: String = row.get("media_type")?;
    let status_raw: String = row.get("status")?;
    let priority_raw: String = row.get("source_priority_json")?;
    let source_priority: Vec<String> =
        serde_json::from_str(&priority_raw).unwrap_or_else(|_| default_source_priority());

    Ok(SearchRequestRow {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        created_by: row.get("created_by")?,
        intent: SearchIntent::parse(&intent_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        media_type: MediaType::parse(&media_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        artist: row.get("artist")?,
        album: row.get("album")?,
        track: row.get("track")?,
        include_albums: row.get::<_, i64>("include_albums")? != 0,
        include_singles: row.get::<_, i64>("include_singles")? != 0,
        min_match_score: row.get("min_match_score")?,
        duration_hint_sec: row.get::<_, Option<i64>>("duration_hint_sec")?.map(|v| v as u32),
        quality_min_bitrate_kbps: row
            .get::<_, Option<i64>>("quality_min_bitrate_kbps")?
            .map(|v| v as u32),
        lossless_only: row.get::<_, i64>("lossless_only")? != 0,
        source_priority,
        max_candidates_per_source: row.get::<_, i64>("max_candidates_per_source")? as u32,
        status: RequestStatus::parse(&status_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        error: row.get("error")?,
    })
}

fn row_to_item(row: &Row) -> rusqlite::Result<SearchItemRow> {
    let media_raw: String = row.get("media_type")?;
    let status_raw: String = row.get("status")?;
    Ok(SearchItemRow {
        id: row.get("id")?,
        request_id: row.get("request_id")?,
        position: row.get::<_, i64>("position")? as u32,
        item_type: row.get("item_type")?,
        media_type: MediaType::parse(&media_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        artist: row.get("artist")?,
        album: row.get("album")?,
        track: row.get("track")?,
        duration_hint_sec: row.get::<_, Option<i64>>("duration_hint_sec")?.map(|v| v as u32),
        status: ItemStatus::parse(&status_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        chosen_source: row.get("chosen_source")?,
        chosen_url: row.get("chosen_url")?,
        chosen_score: row.get("chosen_score")?,
        error: row.get("error")?,
    })
}

fn row_to_candidate(row: &Row) -> rusqlite::Result<SearchCandidateRow> {
    Ok(SearchCandidateRow {
        id: row.get("id")?,
        item_id: row.get("item_id")?,
        source: row.get("source")?,
        url: row.get("url")?,
        title: row.get("title")?,
        uploader: row.get("uploader")?,
        artist_detected: row.get("artist_detected")?,
        album_detected: row.get("album_detected")?,
        track_detected: row.get("track_detected")?,
        duration_sec: row.get::<_, Option<i64>>("duration_sec")?.map(|v| v as u32),
        artwork_url: row.get("artwork_url")?,
        score_artist: row.get("score_artist")?,
        score_track: row.get("score_track")?,
        score_album: row.get("score_album")?,
        score_duration: row.get("score_duration")?,
        source_modifier: row.get("source_modifier")?,
        penalty_multiplier: row.get("penalty_multiplier")?,
        final_score: row.get("final_score")?,
        rank: row.get::<_, i64>("rank")? as u32,
    })
}

/// Create the search tables, indexes, and any missing columns.
pub fn ensure_search_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS search_requests (
            id TEXT PRIMARY KEY,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            created_by TEXT,
            intent TEXT NOT NULL,
            media_type TEXT NOT NULL,
            artist TEXT NOT NULL,
            album TEXT,
            track TEXT,
            include_albums INTEGER DEFAULT 1,
            include_singles INTEGER DEFAULT 1,
            min_match_score REAL DEFAULT 0.92,
            duration_hint_sec INTEGER,
            quality_min_bitrate_kbps INTEGER,
            lossless_only INTEGER DEFAULT 0,
            source_priority_json TEXT NOT NULL,
            max_candidates_per_source INTEGER DEFAULT 5,
            status TEXT NOT NULL,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS search_items (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            item_type TEXT NOT NULL,
            media_type TEXT NOT NULL,
            artist TEXT NOT NULL,
            album TEXT,
            track TEXT,
            duration_hint_sec INTEGER,
            status TEXT NOT NULL,
            chosen_source TEXT,
            chosen_url TEXT,
            chosen_score REAL,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS search_candidates (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            source TEXT NOT NULL,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            uploader TEXT,
            artist_detected TEXT,
            album_detected TEXT,
            track_detected TEXT,
            duration_sec INTEGER,
            artwork_url TEXT,
            score_artist REAL,
            score_track REAL,
            score_album REAL,
            score_duration REAL,
            source_modifier REAL,
            penalty_multiplier REAL,
            final_score REAL,
            rank INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_search_requests_status ON search_requests (status);
        CREATE INDEX IF NOT EXISTS idx_search_requests_created_at ON search_requests (created_at);
        CREATE INDEX IF NOT EXISTS idx_search_items_request_status ON search_items (request_id, status);
        CREATE INDEX IF NOT EXISTS idx_search_items_status ON search_items (status);
        CREATE INDEX IF NOT EXISTS idx_search_candidates_item_score ON search_candidates (item_id, final_score DESC);
        CREATE INDEX IF NOT EXISTS idx_search_candidates_source ON search_candidates (source);
        "#,
    )?;

    ensure_columns(
        conn,
        "search_requests",
        &[
            ("created_by", "created_by TEXT"),
            ("duration_hint_sec", "duration_hint_sec INTEGER"),
            ("quality_min_bitrate_kbps", "quality_min_bitrate_kbps INTEGER"),
            ("lossless_only", "lossless_only INTEGER DEFAULT 0"),
            ("max_candidates_per_source", "max_candidates_per_source INTEGER DEFAULT 5"),
            ("error", "error TEXT"),
        ],
    )?;
    ensure_columns(
        conn,
        "search_items",
        &[
            ("chosen_source", "chosen_source TEXT"),
            ("chosen_url", "chosen_url TEXT"),
            ("chosen_score", "chosen_score REAL"),
            ("error", "error TEXT"),
        ],
    )?;
    ensure_columns(
        conn,
        "search_candidates",
        &[
            ("artwork_url", "artwork_url TEXT"),
            ("penalty_multiplier", "penalty_multiplier REAL"),
            ("rank", "rank INTEGER"),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_adapters::{AdapterHit, SearchAdapter};
    use std::sync::Arc;

    struct FakeAdapter {
        hits: Vec<AdapterHit>,
    }

    impl SearchAdapter for FakeAdapter {
        fn source_name(&self) -> &'static str {
            "youtube_music"
        }

        fn search_track(
            &self,
            _artist: &str,
            _track: &str,
            _album: Option<&str>,
            _limit: u32,
        ) -> Result<Vec<AdapterHit>> {
            Ok(self.hits.clone())
        }

        fn source_modifier(&self, hit: &AdapterHit) -> f64 {
            if hit.is_official {
                1.0
            } else {
                0.90
            }
        }
    }

    fn service_with(hits: Vec<AdapterHit>) -> (tempfile::TempDir, SearchResolutionService, JobStore) {
        let tmp = tempfile::tempdir().unwrap();
        let jobs = JobStore::new(tmp.path().join("main.db"));
        let mut adapters: AdapterRegistry = HashMap::new();
        adapters.insert(
            "youtube_music".to_string(),
            Arc::new(FakeAdapter { hits }) as Arc<dyn SearchAdapter>,
        );
        let library = tmp.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let service = SearchResolutionService::new(
            tmp.path().join("search.db"),
            jobs.clone(),
            adapters,
            library,
        );
        (tmp, service, jobs)
    }

    fn official_hit() -> AdapterHit {
        AdapterHit {
            url: "https://music.example/track".to_string(),
            title: "Track Name".to_string(),
            artist: Some("Artist".to_string()),
            track: Some("Track Name".to_string()),
            duration_sec: Some(201),
            is_official: true,
            ..Default::default()
        }
    }

    fn track_payload() -> SearchRequestPayload {
        SearchRequestPayload {
            intent: Some("track".to_string()),
            media_type: Some("audio".to_string()),
            artist: Some("Artist".to_string()),
            track: Some("Track Name".to_string()),
            duration_hint_sec: Some(200),
            source_priority: Some(vec!["youtube_music".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_request_validation() {
        let (_tmp, service, _) = service_with(vec![]);
        let err = service
            .create_request(&SearchRequestPayload {
                intent: Some("mixtape".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("intent must be"));

        let err = service
            .create_request(&SearchRequestPayload {
                intent: Some("track".to_string()),
                artist: Some("Artist".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("track is required"));

        let err = service
            .create_request(&SearchRequestPayload {
                intent: Some("album".to_string()),
                artist: Some("Artist".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("album is required"));
    }

    #[test]
    fn test_resolution_enqueues_job() {
        let (_tmp, service, jobs) = service_with(vec![official_hit()]);
        let request_id = service.create_request(&track_payload()).unwrap();

        let mut config = Config::default();
        config.final_format = Some("mp3".to_string());
        let processed = service.run_resolution_once(&config).unwrap();
        assert_eq!(processed.as_deref(), Some(request_id.as_str()));

        let (request, summary) = service.get_request(&request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(summary.get("enqueued"), Some(&1));

        let items = service.list_items(&request_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Enqueued);
        assert_eq!(items[0].chosen_url.as_deref(), Some("https://music.example/track"));
        assert!(items[0].chosen_score.unwrap() >= DEFAULT_MIN_MATCH_SCORE);

        assert!(jobs
            .has_job_for_origin(JobOrigin::Search, &request_id, "https://music.example/track")
            .unwrap());

        let candidates = service.list_candidates(&items[0].id).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rank, 1);
        assert_eq!(candidates[0].source_modifier, 1.0);
    }

    #[test]
    fn test_resolution_threshold_failure() {
        let mut hit = official_hit();
        hit.is_official = false;
        let (_tmp, service, _) = service_with(vec![hit]);

        let mut payload = track_payload();
        payload.min_match_score = Some(0.98);
        let request_id = service.create_request(&payload).unwrap();

        service.run_resolution_once(&Config::default()).unwrap();

        let items = service.list_items(&request_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert_eq!(items[0].error.as_deref(), Some("no_candidate_above_threshold"));

        let (request, _) = service.get_request(&request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.error.as_deref(), Some("no_items_enqueued"));
    }

    #[test]
    fn test_resolution_no_candidates() {
        let (_tmp, service, _) = service_with(vec![]);
        let request_id = service.create_request(&track_payload()).unwrap();
        service.run_resolution_once(&Config::default()).unwrap();

        let items = service.list_items(&request_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert_eq!(items[0].error.as_deref(), Some("no_candidates"));
    }

    #[test]
    fn test_enqueue_idempotency() {
        let (_tmp, service, jobs) = service_with(vec![official_hit()]);
        let request_id = service.create_request(&track_payload()).unwrap();

        // A job for this (origin, origin_id, url) already exists.
        jobs.enqueue(NewJob {
            origin: JobOrigin::Search,
            origin_id: request_id.clone(),
            media_type: MediaType::Audio,
            media_intent: MediaIntent::Track,
            source: "youtube_music".to_string(),
            url: "https://music.example/track".to_string(),
            output_template: None,
            output_dir: PathBuf::from("/tmp"),
            context: JobContext::default(),
            max_attempts: None,
            trace_id: None,
        })
        .unwrap();

        let mut config = Config::default();
        config.final_format = Some("mp3".to_string());
        service.run_resolution_once(&config).unwrap();

        let conn = jobs_count_conn(&jobs);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM download_jobs WHERE origin='search' AND origin_id=?1 AND url=?2",
                params![request_id, "https://music.example/track"],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);

        // The item still reports enqueued even though the insert collapsed.
        let items = service.list_items(&request_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Enqueued);
    }

    fn jobs_count_conn(jobs: &JobStore) -> Connection {
        Connection::open(jobs.path()).unwrap()
    }

    struct NamedAdapter {
        name: &'static str,
        modifier: f64,
        hits: Vec<AdapterHit>,
    }

    impl SearchAdapter for NamedAdapter {
        fn source_name(&self) -> &'static str {
            self.name
        }

        fn search_track(
            &self,
            _artist: &str,
            _track: &str,
            _album: Option<&str>,
            _limit: u32,
        ) -> Result<Vec<AdapterHit>> {
            Ok(self.hits.clone())
        }

        fn source_modifier(&self, _hit: &AdapterHit) -> f64 {
            self.modifier
        }
    }

    #[test]
    fn test_catalog_beats_cover_across_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let jobs = JobStore::new(tmp.path().join("main.db"));
        let library = tmp.path().join("library");
        std::fs::create_dir_all(&library).unwrap();

        let mut adapters: AdapterRegistry = HashMap::new();
        adapters.insert(
            "catalog".to_string(),
            Arc::new(NamedAdapter {
                name: "catalog",
                modifier: 1.05,
                hits: vec![AdapterHit {
                    url: "https://catalog.example/track".to_string(),
                    title: "Track".to_string(),
                    artist: Some("Artist".to_string()),
                    is_official: true,
                    ..Default::default()
                }],
            }) as Arc<dyn SearchAdapter>,
        );
        adapters.insert(
            "general".to_string(),
            Arc::new(NamedAdapter {
                name: "general",
                modifier: 0.95,
                hits: vec![AdapterHit {
                    url: "https://general.example/track".to_string(),
                    title: "Track (cover)".to_string(),
                    artist: Some("Artist".to_string()),
                    ..Default::default()
                }],
            }) as Arc<dyn SearchAdapter>,
        );

        let service = SearchResolutionService::new(
            tmp.path().join("search.db"),
            jobs.clone(),
            adapters,
            library,
        );
        let request_id = service
            .create_request(&SearchRequestPayload {
                intent: Some("track".to_string()),
                media_type: Some("audio".to_string()),
                artist: Some("Artist".to_string()),
                track: Some("Track".to_string()),
                min_match_score: Some(0.92),
                source_priority: Some(vec!["catalog".to_string(), "general".to_string()]),
                ..Default::default()
            })
            .unwrap();

        service.run_resolution_once(&Config::default()).unwrap();

        let items = service.list_items(&request_id).unwrap();
        assert_eq!(items[0].status, ItemStatus::Enqueued);
        assert_eq!(items[0].chosen_source.as_deref(), Some("catalog"));

        let candidates = service.list_candidates(&items[0].id).unwrap();
        assert_eq!(candidates.len(), 2);
        let catalog = candidates.iter().find(|c| c.source == "catalog").unwrap();
        let general = candidates.iter().find(|c| c.source == "general").unwrap();
        assert_eq!(catalog.penalty_multiplier, 1.0);
        assert_eq!(catalog.rank, 1);
        assert_eq!(general.penalty_multiplier, 0.10);

        // Exactly one download job, carrying the search origin.
        let conn = jobs_count_conn(&jobs);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM download_jobs WHERE origin='search'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_artist_intent_not_implemented() {
        let (_tmp, service, _) = service_with(vec![]);
        let request_id = service
            .create_request(&SearchRequestPayload {
                intent: Some("artist".to_string()),
                artist: Some("Artist".to_string()),
                ..Default::default()
            })
            .unwrap();

        service.run_resolution_once(&Config::default()).unwrap();
        let (request, _) = service.get_request(&request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.error.as_deref(), Some("not_implemented"));
    }

    #[test]
    fn test_cancel_request_skips_open_items() {
        let (_tmp, service, _) = service_with(vec![]);
        let request_id = service.create_request(&track_payload()).unwrap();
        assert!(service.cancel_request(&request_id).unwrap());
        assert!(!service.cancel_request(&request_id).unwrap());

        let (request, _) = service.get_request(&request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Canceled);
    }
}
