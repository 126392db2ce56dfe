//! Download executor
//!
//! Runs one claimed job end to end: resolve metadata, stage, walk the
//! attempt plan until a step yields a valid artifact, post-process, file
//! into the library (or a client-delivery handle), record history.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use thiserror::Error;

use crate::config::Config;
use crate::db::HistoryStore;
use crate::delivery::DeliveryRegistry;
use crate::enrich::EnrichmentQueue;
use crate::filename::build_output_filename;
use crate::jobs::{DownloadJob, JobOrigin, MediaType};
use crate::models::{DeliveryMode, ItemMetadata};
use crate::notify;
use crate::paths::{ensure_dir, EnginePaths};
use crate::platform::AccountClients;
use crate::status::{ClientDeliveryInfo, EngineStatus, StopEvent};
use crate::transcode::{is_audio_ext, Transcoder};
use crate::urls;
use crate::ytdlp::{hardened_profiles, ClientProfile, DownloadOptions, YtDlpError, YtDlpErrorKind, YtDlpRunner};

/// A partial smaller than this after a prior attempt means the transfer was
/// stuck, not resumable.
const STUCK_PARTIAL_BYTES: u64 = 512 * 1024;

/// Resolution-capped video selector, WebM family first.
const FORMAT_VIDEO_STRICT: &str = "bestvideo[ext=webm][height<=1080]+bestaudio[ext=webm]/\
bestvideo[ext=webm][height<=720]+bestaudio[ext=webm]/\
bestvideo[ext=mp4][height<=1080]+bestaudio[ext=m4a]/\
bestvideo[ext=mp4][height<=720]+bestaudio[ext=m4a]";

/// Opus/WebM audio family first for music mode.
const FORMAT_AUDIO_STRICT: &str = "bestaudio[ext=webm]/bestaudio[acodec=opus]/bestaudio";

const FORMAT_VIDEO_PERMISSIVE: &str = "bestvideo*+bestaudio/best";
const FORMAT_AUDIO_PERMISSIVE: &str = "bestaudio/best";

/// Raised when the stop event interrupted an attempt; the worker maps it to
/// a canceled job rather than a failure.
#[derive(Debug, Error)]
#[error("canceled")]
pub struct CanceledError;

/// One extractor variant in the attempt plan.
#[derive(Debug, Clone)]
pub struct AttemptStep {
    pub label: String,
    pub client_profile: Option<ClientProfile>,
    pub format_selector: String,
    pub use_cookies: bool,
    pub permissive: bool,
}

impl AttemptStep {
    pub fn is_default_client(&self) -> bool {
        self.client_profile.is_none()
    }
}

/// Build the ordered attempt plan.
///
/// Hardened client profiles under a strict selector first, then the default
/// client strict, then a permissive selector, then (cookies permitting) a
/// plain `best` with cookies. The plan is truncated at the attempts cap; a
/// post-construction check guarantees at least one default-client and one
/// permissive step survive.
pub fn build_attempt_plan(
    music_mode: bool,
    cookies_available: bool,
    max_steps: u32,
) -> Vec<AttemptStep> {
    let strict = if music_mode {
        FORMAT_AUDIO_STRICT
    } else {
        FORMAT_VIDEO_STRICT
    };
    let permissive = if music_mode {
        FORMAT_AUDIO_PERMISSIVE
    } else {
        FORMAT_VIDEO_PERMISSIVE
    };

    let mut plan: Vec<AttemptStep> = hardened_profiles()
        .iter()
        .map(|profile| AttemptStep {
            label: format!("{}/strict", profile.name),
            client_profile: Some(profile.clone()),
            format_selector: strict.to_string(),
            use_cookies: false,
            permissive: false,
        })
        .collect();
    plan.push(AttemptStep {
        label: "default/strict".to_string(),
        client_profile: None,
        format_selector: strict.to_string(),
        use_cookies: false,
        permissive: false,
    });
    plan.push(AttemptStep {
        label: "default/permissive".to_string(),
        client_profile: None,
        format_selector: permissive.to_string(),
        use_cookies: false,
        permissive: true,
    });
    if cookies_available {
        plan.push(AttemptStep {
            label: "cookies/best".to_string(),
            client_profile: None,
            format_selector: "best".to_string(),
            use_cookies: true,
            permissive: true,
        });
    }

    plan.truncate(max_steps.max(1) as usize);

    if !plan.iter().any(AttemptStep::is_default_client) {
        plan.push(AttemptStep {
            label: "default/strict".to_string(),
            client_profile: None,
            format_selector: strict.to_string(),
            use_cookies: false,
            permissive: false,
        });
    }
    if !plan.iter().any(|s| s.permissive) {
        plan.push(AttemptStep {
            label: "default/permissive".to_string(),
            client_profile: None,
            format_selector: permissive.to_string(),
            use_cookies: false,
            permissive: true,
        });
    }
    plan
}

/// Extension preference when picking the artifact out of staging.
pub fn preferred_extensions(music_mode: bool, target_format: Option<&str>) -> Vec<String> {
    let mut exts: Vec<String> = Vec::new();
    if music_mode {
        exts.push(target_format.unwrap_or("mp3").to_string());
        for ext in ["opus", "m4a", "mp3", "webm"] {
            if !exts.iter().any(|e| e == ext) {
                exts.push(ext.to_string());
            }
        }
    } else {
        if let Some(fmt) = target_format {
            exts.push(fmt.to_string());
        }
        for ext in ["webm", "mp4", "mkv", "m4a", "opus"] {
            if !exts.iter().any(|e| e == ext) {
                exts.push(ext.to_string());
            }
        }
    }
    exts
}

/// Pick the finished artifact from the staging dir by preferred extension,
/// falling back to any non-partial file with the item id prefix.
pub fn select_output(staging_dir: &Path, item_id: &str, preferred: &[String]) -> Option<PathBuf> {
    for ext in preferred {
        let candidate = staging_dir.join(format!("{item_id}.{ext}"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let entries = std::fs::read_dir(staging_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(item_id) && !name.ends_with(".part") && entry.path().is_file() {
            return Some(entry.path());
        }
    }
    None
}

/// True when the staging dir holds a partial for this item that is too small
/// to be worth resuming.
pub fn has_stuck_partial(staging_dir: &Path, item_id: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(staging_dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(item_id) && name.ends_with(".part") {
            match entry.metadata() {
                Ok(meta) if meta.len() >= STUCK_PARTIAL_BYTES => {}
                _ => return true,
            }
        }
    }
    false
}

/// Move a finished file into its final location: atomic rename when source
/// and target share a filesystem, copy + rename otherwise.
pub fn move_into_library(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            let staged = dst.with_extension(format!(
                "{}.incoming",
                dst.extension().map(|e| e.to_string_lossy()).unwrap_or_default()
            ));
            std::fs::copy(src, &staged)
                .with_context(|| format!("copy {} -> {}", src.display(), staged.display()))?;
            std::fs::rename(&staged, dst)
                .with_context(|| format!("rename {} -> {}", staged.display(), dst.display()))?;
            let _ = std::fs::remove_file(src);
            Ok(())
        }
    }
}

/// Shared collaborators for job execution.
pub struct Executor {
    pub config: Config,
    pub paths: EnginePaths,
    pub history: HistoryStore,
    pub runner: YtDlpRunner,
    pub transcoder: Transcoder,
    pub clients: Arc<AccountClients>,
    pub status: Arc<EngineStatus>,
    pub delivery: DeliveryRegistry,
    pub enrich: EnrichmentQueue,
}

impl Executor {
    /// Resolve item metadata: API when an account is available, toolkit
    /// fallback otherwise; in music mode the fallback's richer fields are
    /// overlaid onto the API record, preferring non-empty values.
    async fn resolve_metadata(&self, job: &DownloadJob, item_id: &str) -> ItemMetadata {
        let cookies = job.context.cookies_path.as_deref().map(PathBuf::from);
        let mut base: Option<ItemMetadata> = job
            .context
            .metadata
            .clone()
            .filter(|m| m.title.as_deref().map_or(false, |t| !t.is_empty()));

        if base.is_none() {
            if let Some(account) = job.context.account.as_deref() {
                if let Some(client) = self.clients.get(account, &self.config).await {
                    match client.fetch_item_metadata(item_id).await {
                        Ok(meta) => base = meta,
                        Err(err) => log::error!("Metadata fetch failed {item_id}: {err}"),
                    }
                }
            }
        }

        let music_mode = job.context.music_mode || job.media_type == MediaType::Audio;
        let need_fallback = base.is_none() || music_mode;
        if need_fallback {
            match self.runner.fetch_metadata(&job.url, cookies.as_deref()).await {
                Ok(fallback) => match base.as_mut() {
                    Some(meta) => meta.overlay_music_fields(&fallback),
                    None => base = Some(fallback),
                },
                Err(err) => log::warn!("Metadata fallback failed for {item_id}: {err:#}"),
            }
        }

        let mut meta = base.unwrap_or_else(|| ItemMetadata::stub(item_id, &job.url));
        if meta.item_id.is_empty() {
            meta.item_id = item_id.to_string();
        }
        meta
    }

    /// Execute one claimed job. Errors bubble to the worker for retry
    /// classification; cancellation surfaces as `CanceledError`.
    pub async fn execute(&self, job: &DownloadJob, stop: &StopEvent) -> Result<()> {
        let item_id = job
            .context
            .item_id
            .clone()
            .or_else(|| urls::extract_item_id(&job.url))
            .unwrap_or_else(|| job.id.clone());
        let music_mode = job.context.music_mode || job.media_type == MediaType::Audio;
        let target_format = job
            .context
            .target_format
            .clone()
            .or_else(|| self.config.final_format.clone())
            .map(|f| f.to_ascii_lowercase());
        let audio_mode = music_mode
            || job.context.audio_only
            || target_format.as_deref().map_or(false, is_audio_ext);

        if stop.is_set() {
            return Err(CanceledError.into());
        }

        let meta = self.resolve_metadata(job, &item_id).await;
        self.status
            .set_current_item(Some(item_id.clone()), Some(meta.display_label()));
        self.status.set_phase(Some("downloading"));
        self.status.reset_item_progress();

        // Stage under the temp area, wiping a stuck prior attempt.
        let staging_dir = self.paths.temp_downloads_dir.join(&job.id);
        if staging_dir.exists() && has_stuck_partial(&staging_dir, &item_id) {
            log::warn!("[{item_id}] Stuck partial detected, wiping staging dir");
            let _ = std::fs::remove_dir_all(&staging_dir);
        }
        ensure_dir(&staging_dir)?;
        ensure_dir(&self.paths.ytdlp_temp_dir)?;

        let cookies_path = job.context.cookies_path.as_deref().map(PathBuf::from);
        let plan = build_attempt_plan(
            audio_mode,
            cookies_path.as_deref().map_or(false, Path::exists),
            job.max_attempts.max(1),
        );
        let preferred = preferred_extensions(audio_mode, target_format.as_deref());

        let result = self
            .run_attempt_plan(job, &item_id, &meta, &staging_dir, &plan, &preferred, audio_mode, cookies_path.as_deref(), stop)
            .await;
        self.status.reset_item_progress();

        let local_file = match result {
            Ok(file) => file,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&staging_dir);
                return Err(err);
            }
        };

        // Post-process: tag embed and optional remux are video-mode only;
        // audio extraction already produced the target container.
        let mut local_file = local_file;
        if !music_mode {
            if let Err(err) = self
                .transcoder
                .embed_metadata(&local_file, &meta, &self.paths.thumbs_dir)
                .await
            {
                // The raw artifact is still a success without tags.
                log::warn!("[{item_id}] Continuing without embedded metadata: {err:#}");
            }
            if !audio_mode {
                if let Some(desired) = target_format.as_deref() {
                    if let Some(converted) = self.transcoder.remux(&local_file, desired).await? {
                        local_file = converted;
                    }
                }
            }
        }

        let ext = local_file
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .or_else(|| target_format.clone())
            .unwrap_or_else(|| "webm".to_string());
        let template = job
            .output_template
            .clone()
            .or_else(|| {
                if music_mode {
                    self.config.music_filename_template.clone()
                } else {
                    self.config.filename_template.clone()
                }
            });
        let final_name = build_output_filename(&meta, &item_id, &ext, template.as_deref(), music_mode);
        let display_name = final_name
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| final_name.to_string_lossy().to_string());

        self.status.set_phase(Some("finalizing"));

        let delivery_mode = job.context.delivery_mode;
        let final_path = match delivery_mode {
            DeliveryMode::Server => {
                let path = job.output_dir.join(&final_name);
                move_into_library(&local_file, &path)?;
                path
            }
            DeliveryMode::Client => {
                ensure_dir(&self.paths.client_delivery_dir)?;
                let path = self.paths.client_delivery_dir.join(&display_name);
                move_into_library(&local_file, &path)?;
                path
            }
        };
        let _ = std::fs::remove_dir_all(&staging_dir);

        match delivery_mode {
            DeliveryMode::Client => {
                let handle = self.delivery.register(final_path.clone(), display_name.clone());
                self.status.set_client_delivery(ClientDeliveryInfo {
                    id: Some(handle.id.clone()),
                    filename: Some(display_name.clone()),
                    expires_at: Some(handle.expires_at.to_rfc3339()),
                    mode: Some("client".to_string()),
                });
                self.status.set_phase(Some("ready for client download"));
            }
            DeliveryMode::Server => {
                self.status.set_client_delivery(ClientDeliveryInfo {
                    mode: Some("server".to_string()),
                    ..Default::default()
                });
                self.status.set_phase(None);
            }
        }

        self.status.set_last_completed(
            Some(display_name.clone()),
            Some(Utc::now().to_rfc3339()),
            (delivery_mode == DeliveryMode::Server)
                .then(|| final_path.to_string_lossy().to_string()),
        );

        if music_mode {
            self.enrich
                .enqueue(final_path.clone(), meta.clone(), &self.config);
        }

        // The file lands before the downloads row; a crash between the two
        // collapses on the next discovery pass via INSERT OR IGNORE.
        if delivery_mode == DeliveryMode::Server {
            let playlist_id = (job.origin == JobOrigin::Playlist).then_some(job.origin_id.as_str());
            self.history
                .record_download(&item_id, playlist_id, &final_path.to_string_lossy())?;
        }

        if job.origin == JobOrigin::Playlist {
            if job.context.subscribe_mode {
                self.history.mark_item_downloaded(&job.origin_id, &item_id)?;
            }
            if job.context.remove_after_download {
                self.remove_remote_entry(job, &item_id).await;
            }
        }

        self.status.push_success(display_name);

        if job.origin != JobOrigin::Playlist {
            let message = match delivery_mode {
                DeliveryMode::Client => "✅ Download completed → ready for client download",
                DeliveryMode::Server => "✅ Download completed → saved to server library",
            };
            notify::telegram_notify(&self.config, message).await;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt_plan(
        &self,
        job: &DownloadJob,
        item_id: &str,
        meta: &ItemMetadata,
        staging_dir: &Path,
        plan: &[AttemptStep],
        preferred: &[String],
        audio_mode: bool,
        cookies_path: Option<&Path>,
        stop: &StopEvent,
    ) -> Result<PathBuf> {
        let target_format = job.context.target_format.as_deref();
        let mut last_error: Option<String> = None;

        for (idx, step) in plan.iter().enumerate() {
            if stop.is_set() {
                return Err(CanceledError.into());
            }
            log::info!(
                "[{item_id}] Attempt {}/{} via {}",
                idx + 1,
                plan.len(),
                step.label
            );

            // Each step starts from a clean staging dir.
            let _ = std::fs::remove_dir_all(staging_dir);
            ensure_dir(staging_dir)?;

            let mut opts = DownloadOptions::new(
                step.format_selector.clone(),
                staging_dir.join("%(id)s.%(ext)s").to_string_lossy().to_string(),
            );
            opts.temp_dir = Some(self.paths.ytdlp_temp_dir.clone());
            opts.client_profile = step.client_profile.clone();
            opts.js_runtime = job.context.js_runtime.clone();
            if step.use_cookies {
                opts.cookies = cookies_path.map(Path::to_path_buf);
            }
            if audio_mode {
                opts.extract_audio = Some(
                    target_format
                        .filter(|f| is_audio_ext(f))
                        .unwrap_or("mp3")
                        .to_string(),
                );
            }

            let status = Arc::clone(&self.status);
            let outcome = self
                .runner
                .download(&job.url, &opts, stop, move |progress| {
                    status.set_item_progress(progress);
                })
                .await;

            match outcome {
                Err(YtDlpError {
                    kind: YtDlpErrorKind::Canceled,
                    ..
                }) => return Err(CanceledError.into()),
                Err(err) => {
                    log::warn!("[{item_id}] {} failed: {}", step.label, err.message);
                    last_error = Some(err.message);
                    self.runner
                        .probe_formats(&job.url, step.client_profile.as_ref())
                        .await;
                    continue;
                }
                Ok(_) => {}
            }

            let Some(chosen) = select_output(staging_dir, &meta.item_id, preferred)
                .or_else(|| select_output(staging_dir, item_id, preferred))
            else {
                log::warn!("[{item_id}] {} produced no usable output", step.label);
                last_error = Some("extractor produced no usable output".to_string());
                continue;
            };

            // Video was requested; an audio-only artifact is not a result.
            let chosen_ext = chosen
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if job.media_type == MediaType::Video && !audio_mode && is_audio_ext(&chosen_ext) {
                log::warn!(
                    "[{item_id}] {} yielded audio-only {chosen_ext} for a video job; rejecting",
                    step.label
                );
                let _ = std::fs::remove_file(&chosen);
                last_error = Some(format!("audio-only output ({chosen_ext}) for video request"));
                continue;
            }

            log::info!(
                "[{item_id}] SUCCESS via {} -> {}",
                step.label,
                chosen.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
            );
            return Ok(chosen);
        }

        Err(anyhow!(
            "{}",
            last_error.unwrap_or_else(|| "all extractor variants failed".to_string())
        ))
    }

    /// Delete the remote playlist entry after a successful archive.
    async fn remove_remote_entry(&self, job: &DownloadJob, item_id: &str) {
        let Some(entry_id) = job.context.playlist_entry_id.as_deref() else {
            return;
        };
        let Some(account) = job.context.account.as_deref() else {
            return;
        };
        let Some(client) = self.clients.get(account, &self.config).await else {
            return;
        };
        if let Err(err) = client.delete_playlist_entry(entry_id).await {
            log::error!("Failed removing playlist entry for {item_id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_shape_default() {
        let plan = build_attempt_plan(false, true, 10);
        assert_eq!(plan.len(), 6);
        assert_eq!(plan[0].client_profile.as_ref().unwrap().name, "android");
        assert_eq!(plan[1].client_profile.as_ref().unwrap().name, "tv_embedded");
        assert_eq!(plan[2].client_profile.as_ref().unwrap().name, "web");
        assert!(plan[3].is_default_client() && !plan[3].permissive);
        assert!(plan[4].permissive);
        assert!(plan[5].use_cookies);
        assert_eq!(plan[5].format_selector, "best");
    }

    #[test]
    fn test_plan_without_cookies_has_no_cookie_step() {
        let plan = build_attempt_plan(false, false, 10);
        assert!(plan.iter().all(|s| !s.use_cookies));
    }

    #[test]
    fn test_plan_truncation_keeps_guarantees() {
        // A cap of 2 would leave only hardened profiles; the guarantee pass
        // must append a default-client and a permissive step.
        let plan = build_attempt_plan(false, false, 2);
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().any(AttemptStep::is_default_client));
        assert!(plan.iter().any(|s| s.permissive));
    }

    #[test]
    fn test_music_plan_uses_audio_selectors() {
        let plan = build_attempt_plan(true, false, 10);
        assert!(plan[0].format_selector.contains("bestaudio"));
        assert!(plan.iter().any(|s| s.format_selector == "bestaudio/best"));
    }

    #[test]
    fn test_preferred_extensions() {
        let video = preferred_extensions(false, Some("mkv"));
        assert_eq!(video[0], "mkv");
        assert!(video.contains(&"webm".to_string()));

        let music = preferred_extensions(true, None);
        assert_eq!(music[0], "mp3");
    }

    #[test]
    fn test_select_output_prefers_extension_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("v1.mp4"), b"x").unwrap();
        std::fs::write(tmp.path().join("v1.webm"), b"x").unwrap();
        std::fs::write(tmp.path().join("v1.webm.part"), b"x").unwrap();

        let preferred = vec!["webm".to_string(), "mp4".to_string()];
        let chosen = select_output(tmp.path(), "v1", &preferred).unwrap();
        assert!(chosen.to_string_lossy().ends_with("v1.webm"));
    }

    #[test]
    fn test_select_output_fallback_skips_partials() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("v1.f137.part"), b"x").unwrap();
        std::fs::write(tmp.path().join("v1.unknownext"), b"x").unwrap();

        let preferred = vec!["webm".to_string()];
        let chosen = select_output(tmp.path(), "v1", &preferred).unwrap();
        assert!(chosen.to_string_lossy().ends_with("v1.unknownext"));
    }

    #[test]
    fn test_stuck_partial_detection() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_stuck_partial(tmp.path(), "v1"));

        std::fs::write(tmp.path().join("v1.webm.part"), vec![0u8; 1024]).unwrap();
        assert!(has_stuck_partial(tmp.path(), "v1"));

        std::fs::write(tmp.path().join("v1.webm.part"), vec![0u8; 600 * 1024]).unwrap();
        assert!(!has_stuck_partial(tmp.path(), "v1"));
    }

    #[test]
    fn test_move_into_library_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.webm");
        std::fs::write(&src, b"media").unwrap();
        let dst = tmp.path().join("Artist").join("Album").join("a.webm");
        move_into_library(&src, &dst).unwrap();
        assert!(dst.exists());
        assert!(!src.exists());
    }
}
