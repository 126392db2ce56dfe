//! Discovery
//!
//! Turns a configured playlist into a set of new work: enumerate current
//! items (API client when an account is bound, public extract-flat fallback
//! otherwise), apply the mode policy against the history store, and enqueue
//! jobs with duplicate suppression.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::{Config, PlaylistMode, PlaylistSpec};
use crate::db::HistoryStore;
use crate::jobs::{JobContext, JobOrigin, JobStore, MediaIntent, MediaType, NewJob};
use crate::models::{DeliveryMode, PlaylistItem};
use crate::paths::resolve_dir;
use crate::platform::{AccountClients, ApiError};
use crate::status::{EngineStatus, StopEvent};
use crate::urls;
use crate::ytdlp::YtDlpRunner;

const DEFAULT_MIN_POLL_MIN: u32 = 15;
const DEFAULT_MAX_POLL_MIN: u32 = 720;
const DEFAULT_IDLE_BACKOFF: f64 = 2.0;

/// Everything discovery needs for one run.
pub struct DiscoveryCtx<'a> {
    pub config: &'a Config,
    pub history: &'a HistoryStore,
    pub jobs: &'a JobStore,
    pub clients: &'a AccountClients,
    pub runner: &'a YtDlpRunner,
    pub status: &'a EngineStatus,
    pub stop: &'a StopEvent,
    pub library_root: PathBuf,
    pub js_runtime: Option<String>,
    pub cookies_path: Option<PathBuf>,
    pub dry_run: bool,
}

/// Put items in newest-first order for the subscribe cutoff.
///
/// Entries with explicit positions keep the playlist's native order; when
/// the enumeration carried no positions at all, the listing arrives
/// oldest-first and is reversed.
pub fn order_newest_first(mut items: Vec<PlaylistItem>) -> Vec<PlaylistItem> {
    if items.iter().any(|i| i.position.is_some()) {
        items.sort_by_key(|i| i.position.unwrap_or(u32::MAX));
        items
    } else {
        items.reverse();
        items
    }
}

/// Apply the mode policy and return the new-work set, in enqueue order.
///
/// `full`: everything not in the downloads log, present order preserved.
/// `subscribe`: on the first observation of the collection, seed every item
/// as seen (downloaded=false) and return nothing; afterwards walk
/// newest-first and stop at the first already-seen item.
pub fn plan_new_work(
    history: &HistoryStore,
    playlist_id: &str,
    mode: PlaylistMode,
    items: &[PlaylistItem],
) -> Result<Vec<PlaylistItem>> {
    match mode {
        PlaylistMode::Full => {
            let mut work = Vec::new();
            for item in items {
                if !history.is_downloaded(&item.item_id)? {
                    work.push(item.clone());
                }
            }
            Ok(work)
        }
        PlaylistMode::Subscribe => {
            if !history.has_seen_any(playlist_id)? {
                for item in items {
                    history.mark_seen(playlist_id, &item.item_id, false)?;
                }
                log::info!(
                    "Subscribe: seeded {} items for {playlist_id}; nothing to download",
                    items.len()
                );
                return Ok(Vec::new());
            }

            let mut work = Vec::new();
            for item in items {
                if history.is_seen(playlist_id, &item.item_id)? {
                    log::info!(
                        "Subscribe: {playlist_id} reached seen item {}; stopping scan",
                        item.item_id
                    );
                    break;
                }
                work.push(item.clone());
            }
            Ok(work)
        }
    }
}

/// Enqueue the planned items for one playlist. Returns how many jobs were
/// actually inserted after duplicate suppression.
pub fn enqueue_new_items(
    ctx: &DiscoveryCtx<'_>,
    spec: &PlaylistSpec,
    playlist_id: &str,
    target_folder: &std::path::Path,
    work: &[PlaylistItem],
    enqueued_urls: &mut HashSet<String>,
) -> Result<u32> {
    let music_mode = spec.music_mode;
    let source = if music_mode { "youtube_music" } else { "youtube" };
    let target_format = spec
        .final_format
        .clone()
        .or_else(|| ctx.config.final_format.clone());
    let output_template = if music_mode {
        ctx.config.music_filename_template.clone()
    } else {
        ctx.config.filename_template.clone()
    };

    let mut enqueued = 0u32;
    for item in work {
        let url = urls::build_download_url(&item.item_id, music_mode, item.url.as_deref());

        if ctx.dry_run {
            log::info!("Dry-run: would enqueue {} -> {}", item.item_id, url);
            continue;
        }
        if enqueued_urls.contains(&url)
            || ctx.jobs.has_active_job(source, &url)?
            || ctx
                .jobs
                .has_job_for_origin(JobOrigin::Playlist, playlist_id, &url)?
        {
            log::info!("Skipping enqueue (already queued): {}", item.item_id);
            continue;
        }

        ctx.jobs.enqueue(NewJob {
            origin: JobOrigin::Playlist,
            origin_id: playlist_id.to_string(),
            media_type: if music_mode {
                MediaType::Audio
            } else {
                MediaType::Video
            },
            media_intent: MediaIntent::Playlist,
            source: source.to_string(),
            url: url.clone(),
            output_template: output_template.clone(),
            output_dir: target_folder.to_path_buf(),
            context: JobContext {
                item_id: Some(item.item_id.clone()),
                playlist_entry_id: item.entry_id.clone(),
                remove_after_download: spec.remove_after_download,
                subscribe_mode: spec.mode == PlaylistMode::Subscribe,
                account: spec.account.clone(),
                target_format: target_format.clone(),
                audio_only: false,
                music_mode,
                js_runtime: ctx.js_runtime.clone(),
                cookies_path: ctx
                    .cookies_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                delivery_mode: DeliveryMode::Server,
                ..Default::default()
            },
            max_attempts: ctx.config.job_max_attempts,
            trace_id: None,
        })?;

        if spec.mode == PlaylistMode::Subscribe {
            // The seen row must exist before the executor can latch it.
            ctx.history.mark_seen(playlist_id, &item.item_id, false)?;
        }
        enqueued_urls.insert(url);
        enqueued += 1;
    }
    Ok(enqueued)
}

/// Enumerate one playlist through the configured paths.
///
/// Returns (items, had_error). The public fallback only runs for playlists
/// with no account bound.
async fn fetch_playlist_items(
    ctx: &DiscoveryCtx<'_>,
    spec: &PlaylistSpec,
    playlist_id: &str,
) -> (Vec<PlaylistItem>, bool) {
    let mut had_error = false;

    if let Some(account) = spec.account.as_deref().filter(|a| !a.is_empty()) {
        let Some(client) = ctx.clients.get(account, ctx.config).await else {
            log::error!("No valid API client for account '{account}'; skipping playlist {playlist_id}");
            return (Vec::new(), true);
        };
        match client.list_playlist_items(playlist_id).await {
            Ok(items) => return (items, false),
            Err(ApiError::RefreshFailure(err)) => {
                log::error!(
                    "OAuth refresh failed for account {account} while fetching playlist {playlist_id}: {err}"
                );
                ctx.clients.invalidate(account).await;
                return (Vec::new(), true);
            }
            Err(err) => {
                log::error!("Playlist fetch failed {playlist_id}: {err}");
                return (Vec::new(), true);
            }
        }
    }

    let playlist_url = urls::build_playlist_url(playlist_id);
    match ctx
        .runner
        .enumerate_playlist(&playlist_url, ctx.cookies_path.as_deref())
        .await
    {
        Ok(items) => (items, false),
        Err(err) => {
            log::error!("Public playlist fallback failed for {playlist_id}: {err:#}");
            had_error = true;
            (Vec::new(), had_error)
        }
    }
}

/// Run discovery for one playlist spec. Returns the number of jobs enqueued.
pub async fn discover_playlist(
    ctx: &DiscoveryCtx<'_>,
    spec: &PlaylistSpec,
    enqueued_urls: &mut HashSet<String>,
) -> Result<u32> {
    let Some(playlist_id) = spec.playlist_id.as_deref().filter(|s| !s.is_empty()) else {
        log::error!("Playlist entry missing id; skipping");
        return Ok(0);
    };
    let Some(folder) = spec.folder.as_deref().filter(|s| !s.is_empty()) else {
        log::error!("Playlist {playlist_id} missing folder; skipping");
        return Ok(0);
    };

    ctx.status.set_current_playlist(Some(playlist_id.to_string()));
    ctx.status.set_current_item(None, None);

    let target_folder = match resolve_dir(Some(folder), &ctx.library_root) {
        Ok(path) => path,
        Err(err) => {
            log::error!("Invalid playlist folder path: {err}");
            ctx.status.push_failure(format!("{playlist_id} (invalid folder)"));
            return Ok(0);
        }
    };

    let (items, had_error) = fetch_playlist_items(ctx, spec, playlist_id).await;
    if ctx.stop.is_set() {
        return Ok(0);
    }

    if items.is_empty() {
        if had_error {
            log::error!("No items found for playlist {playlist_id} (auth or public fetch failed)");
            ctx.status.push_failure(format!("{playlist_id} (auth)"));
            ctx.history.record_playlist_error(playlist_id, "fetch failed")?;
        } else {
            log::info!("Playlist {playlist_id} is empty; skipping.");
            record_checked(ctx, playlist_id, false)?;
        }
        return Ok(0);
    }

    let ordered = order_newest_first(items);
    let work = plan_new_work(ctx.history, playlist_id, spec.mode, &ordered)?;
    let enqueued = enqueue_new_items(ctx, spec, playlist_id, &target_folder, &work, enqueued_urls)?;

    record_checked(ctx, playlist_id, enqueued > 0)?;
    log::info!("Playlist {playlist_id}: {enqueued} new jobs enqueued");
    Ok(enqueued)
}

fn record_checked(ctx: &DiscoveryCtx<'_>, playlist_id: &str, changed: bool) -> Result<()> {
    if ctx.dry_run {
        return Ok(());
    }
    let policy = ctx.config.watch_policy.as_ref();
    let min = policy
        .and_then(|p| p.min_interval_minutes)
        .unwrap_or(DEFAULT_MIN_POLL_MIN);
    let max = policy
        .and_then(|p| p.max_interval_minutes)
        .unwrap_or(DEFAULT_MAX_POLL_MIN);
    let backoff = policy
        .and_then(|p| p.idle_backoff_factor)
        .unwrap_or(DEFAULT_IDLE_BACKOFF);
    ctx.history
        .record_playlist_checked(playlist_id, changed, min, max.max(min), backoff)
}
