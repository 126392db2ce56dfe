//! Run pipeline
//!
//! Orchestrates one archiver run: exclusion lock, discovery, worker engine
//! until idle, end-of-run summary. Single-URL runs enqueue one job and
//! drive the same engine inline. The `RunManager` owns the running flag so
//! two concurrent starts never both succeed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::db::HistoryStore;
use crate::delivery::DeliveryRegistry;
use crate::discovery::{discover_playlist, DiscoveryCtx};
use crate::enrich::EnrichmentQueue;
use crate::executor::Executor;
use crate::jobs::{JobContext, JobOrigin, JobStore, MediaIntent, MediaType, NewJob};
use crate::models::DeliveryMode;
use crate::notify;
use crate::paths::{ensure_dir, resolve_dir, BaseRoots, EnginePaths};
use crate::platform::AccountClients;
use crate::scheduler::{parse_downtime, wait_out_downtime};
use crate::status::{EngineStatus, StopEvent};
use crate::tools::{find_ffmpeg_binary, find_ytdlp_binary};
use crate::transcode::Transcoder;
use crate::worker::{JobAdapter, WorkerEngine};
use crate::ytdlp::YtDlpRunner;

pub const ENV_PREVIEW: &str = "MEDIAVAULT_PREVIEW";
const ENV_JS_RUNTIME: &str = "YT_DLP_JS_RUNTIME";

/// Removes the exclusion file on drop, so abnormal run ends release it too.
pub struct RunLockGuard {
    path: PathBuf,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove run lock {}: {err}", self.path.display());
            }
        }
    }
}

/// Take the run-exclusion file. A pre-existing file means another run owns
/// the library; a stale file from a crashed process must be cleared by hand.
pub fn acquire_run_lock(path: &Path) -> Option<RunLockGuard> {
    if path.exists() {
        log::warn!("Lockfile present at {}; skipping run", path.display());
        return None;
    }
    if let Some(dir) = path.parent() {
        if ensure_dir(dir).is_err() {
            return None;
        }
    }
    if let Err(err) = std::fs::write(path, std::process::id().to_string()) {
        log::error!("Failed to write run lock {}: {err}", path.display());
        return None;
    }
    Some(RunLockGuard {
        path: path.to_path_buf(),
    })
}

/// Normalize a JS runtime spec to `name:/full/path`, discovering the binary
/// when only a name was given.
pub fn normalize_js_runtime(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    if value.contains(':') {
        return Some(value.to_string());
    }
    let path = which::which(value).ok()?;
    let name = if path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase().contains("deno"))
        .unwrap_or(false)
    {
        "deno"
    } else {
        "node"
    };
    Some(format!("{name}:{}", path.display()))
}

/// Resolve the JS runtime: explicit override, config, env var, then
/// deno/node discovered on PATH.
pub fn resolve_js_runtime(config: &Config, override_value: Option<&str>) -> Option<String> {
    let configured = override_value
        .map(str::to_string)
        .or_else(|| config.js_runtime.clone())
        .or_else(|| std::env::var(ENV_JS_RUNTIME).ok());
    if let Some(runtime) = configured.as_deref().and_then(normalize_js_runtime) {
        return Some(runtime);
    }
    if let Ok(deno) = which::which("deno") {
        return Some(format!("deno:{}", deno.display()));
    }
    if let Ok(node) = which::which("node") {
        return Some(format!("node:{}", node.display()));
    }
    None
}

/// Resolve the configured cookies file under the tokens root.
pub fn resolve_cookiefile(config: &Config, tokens_root: &Path) -> Option<PathBuf> {
    let cookies = config.yt_dlp_cookies.as_deref()?;
    match resolve_dir(Some(cookies), tokens_root) {
        Ok(path) if path.exists() => Some(path),
        Ok(path) => {
            log::warn!("yt-dlp cookies file not found: {}", path.display());
            None
        }
        Err(err) => {
            log::error!("Invalid yt-dlp cookies path: {err}");
            None
        }
    }
}

pub fn preview_enabled() -> bool {
    std::env::var(ENV_PREVIEW)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub single_url: Option<String>,
    pub destination: Option<String>,
    pub final_format_override: Option<String>,
    pub js_runtime_override: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub run_source: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStateSnapshot {
    pub running: bool,
    pub state: String,
    pub run_id: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    state: &'static str,
    run_id: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<String>,
}

/// Owns the archiver's run lifecycle and the collaborators a run needs.
pub struct RunManager {
    pub roots: BaseRoots,
    pub paths: EnginePaths,
    pub status: Arc<EngineStatus>,
    pub history: HistoryStore,
    pub jobs: JobStore,
    pub delivery: DeliveryRegistry,
    pub enrich: EnrichmentQueue,
    pub stop: StopEvent,
    state: Mutex<RunState>,
}

impl RunManager {
    pub fn new(
        roots: BaseRoots,
        paths: EnginePaths,
        status: Arc<EngineStatus>,
        stop: StopEvent,
    ) -> Arc<Self> {
        let history = HistoryStore::new(&paths.db_path);
        let jobs = JobStore::new(&paths.db_path);
        Arc::new(Self {
            roots,
            paths,
            status,
            history,
            jobs,
            delivery: DeliveryRegistry::default(),
            enrich: EnrichmentQueue::new(),
            stop,
            state: Mutex::new(RunState {
                state: "idle",
                ..Default::default()
            }),
        })
    }

    pub fn snapshot(&self) -> RunStateSnapshot {
        let state = self.state.lock().expect("run state lock");
        RunStateSnapshot {
            running: state.running,
            state: state.state.to_string(),
            run_id: state.run_id.clone(),
            started_at: state.started_at.clone(),
            finished_at: state.finished_at.clone(),
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("run state lock").running
    }

    /// Start a run in the background. Returns false (without side effects)
    /// when one is already active.
    pub fn try_start_run(self: &Arc<Self>, config: Config, opts: RunOptions) -> bool {
        {
            let mut state = self.state.lock().expect("run state lock");
            if state.running {
                return false;
            }
            state.running = true;
            state.state = "running";
            state.run_id = Some(Uuid::new_v4().to_string());
            state.started_at = Some(Utc::now().to_rfc3339());
            state.finished_at = None;
            state.last_error = None;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.run_archive(config, opts).await;
            let mut state = manager.state.lock().expect("run state lock");
            state.running = false;
            state.finished_at = Some(Utc::now().to_rfc3339());
            match result {
                Ok(()) if manager.stop.is_set() => {
                    state.last_error = Some("Run stopped".to_string());
                    state.state = "error";
                }
                Ok(()) => state.state = "idle",
                Err(err) => {
                    log::error!("Archive run failed: {err:#}");
                    state.last_error = Some(err.to_string());
                    state.state = "error";
                }
            }
        });
        true
    }

    /// Entry point shared by the CLI and the HTTP surface.
    pub async fn run_archive(&self, config: Config, opts: RunOptions) -> Result<()> {
        log::info!("Run started (source={})", opts.run_source);
        self.status.reset_for_run();

        if opts.single_url.is_some() {
            let ok = self.run_single(&config, &opts).await?;
            self.status.set_single_download_ok(Some(ok));
            return Ok(());
        }
        self.run_playlists(&config, &opts).await
    }

    fn build_executor(&self, config: &Config) -> Arc<Executor> {
        let runner = YtDlpRunner::new(
            find_ytdlp_binary(&self.paths.tools_dir),
            config.yt_dlp_opts.clone(),
        );
        Arc::new(Executor {
            config: config.clone(),
            paths: self.paths.clone(),
            history: self.history.clone(),
            runner,
            transcoder: Transcoder::new(find_ffmpeg_binary()),
            clients: Arc::new(AccountClients::new(self.roots.tokens.clone())),
            status: Arc::clone(&self.status),
            delivery: self.delivery.clone(),
            enrich: self.enrich.clone(),
        })
    }

    fn adapters_for(executor: Arc<Executor>) -> HashMap<String, Arc<dyn JobAdapter>> {
        let mut adapters: HashMap<String, Arc<dyn JobAdapter>> = HashMap::new();
        for source in ["youtube", "youtube_music", "bandcamp", "soundcloud"] {
            adapters.insert(source.to_string(), Arc::clone(&executor) as Arc<dyn JobAdapter>);
        }
        adapters
    }

    async fn drain_queue(&self, config: &Config, executor: Arc<Executor>) {
        let engine = WorkerEngine::new(
            self.jobs.clone(),
            self.history.clone(),
            Arc::clone(&self.status),
            self.stop.clone(),
            Self::adapters_for(executor),
            Some(config.job_retry_delay_seconds()),
        );
        engine.run_until_idle().await;
    }

    /// The scheduled/manual playlist run.
    async fn run_playlists(&self, config: &Config, opts: &RunOptions) -> Result<()> {
        let started = Instant::now();

        if self.stop.is_set() {
            log::warn!("Stop requested before run start");
            return Ok(());
        }

        if opts.run_source == "scheduled" {
            let window = config
                .watch_policy
                .as_ref()
                .and_then(|p| p.downtime.as_ref())
                .and_then(parse_downtime);
            wait_out_downtime(window, &self.stop).await;
            if self.stop.is_set() {
                return Ok(());
            }
        }

        let Some(_lock) = acquire_run_lock(&self.paths.lock_file) else {
            return Ok(());
        };

        let dry_run = config.dry_run || preview_enabled();
        if dry_run {
            log::info!("Dry-run enabled: no downloads or DB writes will occur");
        }

        let executor = self.build_executor(config);
        let js_runtime = resolve_js_runtime(config, opts.js_runtime_override.as_deref());
        if js_runtime.is_none() && !self.status.runtime_warned() {
            log::warn!(
                "No JS runtime configured/detected; set js_runtime in config to reduce missing-format issues."
            );
            self.status.set_runtime_warned();
        }
        let cookies_path = resolve_cookiefile(config, &self.roots.tokens);

        let ctx = DiscoveryCtx {
            config,
            history: &self.history,
            jobs: &self.jobs,
            clients: executor.clients.as_ref(),
            runner: &executor.runner,
            status: &self.status,
            stop: &self.stop,
            library_root: self.roots.downloads.clone(),
            js_runtime,
            cookies_path,
            dry_run,
        };

        let mut enqueued_urls: HashSet<String> = HashSet::new();
        let mut jobs_enqueued = 0u32;
        for spec in &config.playlists {
            if self.stop.is_set() {
                log::warn!("Stop requested; ending discovery loop");
                break;
            }
            match discover_playlist(&ctx, spec, &mut enqueued_urls).await {
                Ok(count) => jobs_enqueued += count,
                Err(err) => {
                    log::error!(
                        "Discovery failed for playlist {:?}: {err:#}",
                        spec.playlist_id
                    );
                }
            }
        }
        self.status.set_current_playlist(None);
        self.status.set_current_item(None, None);

        if jobs_enqueued > 0 && !dry_run && !self.stop.is_set() {
            self.status.set_progress(Some(0), Some(jobs_enqueued));
            self.drain_queue(config, executor).await;
        }

        log::info!("Run complete.");

        let snapshot = self.status.snapshot();
        notify::send_run_summary(
            config,
            &snapshot.run_successes,
            &snapshot.run_failures,
            started.elapsed().as_secs(),
        )
        .await;
        Ok(())
    }

    /// Download a single URL through the queue. Returns whether the job
    /// completed.
    async fn run_single(&self, config: &Config, opts: &RunOptions) -> Result<bool> {
        let url = opts.single_url.clone().unwrap_or_default();
        let music_mode = crate::urls::is_music_url(&url);
        let item_id = crate::urls::extract_item_id(&url).unwrap_or_else(|| "item".to_string());

        if self.stop.is_set() {
            log::warn!("[{item_id}] Stop requested before single download");
            return Ok(false);
        }

        self.status.set_current_item(Some(item_id.clone()), Some(item_id.clone()));
        self.status.set_progress(Some(0), Some(1));
        self.status.set_phase(Some("queued"));

        let output_dir = match opts.delivery_mode {
            DeliveryMode::Client => {
                ensure_dir(&self.paths.client_delivery_dir)?;
                self.paths.client_delivery_dir.clone()
            }
            DeliveryMode::Server => {
                let configured = opts
                    .destination
                    .as_deref()
                    .or(config.single_download_folder.as_deref());
                match resolve_dir(configured, &self.roots.downloads) {
                    Ok(dir) => {
                        ensure_dir(&dir)?;
                        dir
                    }
                    Err(err) => {
                        log::error!("Invalid destination path: {err}");
                        self.status.set_last_error(Some(format!("Invalid destination path: {err}")));
                        self.status.set_progress(Some(1), Some(1));
                        self.status.set_phase(None);
                        return Ok(false);
                    }
                }
            }
        };

        let download_url = crate::urls::build_download_url(&item_id, music_mode, Some(&url));
        let js_runtime = resolve_js_runtime(config, opts.js_runtime_override.as_deref());
        let cookies_path = resolve_cookiefile(config, &self.roots.tokens);
        let output_template = if music_mode {
            config.music_filename_template.clone()
        } else {
            config.filename_template.clone()
        };
        let source = if music_mode { "youtube_music" } else { "youtube" };

        let job_id = self.jobs.enqueue(NewJob {
            origin: JobOrigin::Search,
            origin_id: item_id.clone(),
            media_type: if music_mode {
                MediaType::Audio
            } else {
                MediaType::Video
            },
            media_intent: if music_mode {
                MediaIntent::Track
            } else {
                MediaIntent::Episode
            },
            source: source.to_string(),
            url: download_url,
            output_template,
            output_dir,
            context: JobContext {
                item_id: Some(item_id),
                delivery_mode: opts.delivery_mode,
                target_format: opts.final_format_override.clone(),
                music_mode,
                js_runtime,
                cookies_path: cookies_path.map(|p| p.to_string_lossy().to_string()),
                ..Default::default()
            },
            max_attempts: config.job_max_attempts,
            trace_id: None,
        })?;

        let executor = self.build_executor(config);
        self.drain_queue(config, executor).await;

        let job = self.jobs.get_job(&job_id)?;
        Ok(job.map_or(false, |j| j.status == crate::jobs::JobStatus::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lock_exclusion() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("tmp").join("mediavault.lock");

        let first = acquire_run_lock(&lock_path);
        assert!(first.is_some());
        assert!(lock_path.exists());

        // The lock file payload is the owning pid.
        let pid: u32 = std::fs::read_to_string(&lock_path).unwrap().parse().unwrap();
        assert_eq!(pid, std::process::id());

        assert!(acquire_run_lock(&lock_path).is_none());

        drop(first);
        assert!(!lock_path.exists());
        assert!(acquire_run_lock(&lock_path).is_some());
    }

    #[test]
    fn test_normalize_js_runtime_passthrough() {
        assert_eq!(
            normalize_js_runtime("node:/usr/bin/node").as_deref(),
            Some("node:/usr/bin/node")
        );
        assert_eq!(normalize_js_runtime(""), None);
    }

    #[test]
    fn test_resolve_cookiefile_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.yt_dlp_cookies = Some("cookies.txt".to_string());
        assert!(resolve_cookiefile(&config, tmp.path()).is_none());

        std::fs::write(tmp.path().join("cookies.txt"), b"# cookies").unwrap();
        let resolved = resolve_cookiefile(&config, tmp.path()).unwrap();
        assert!(resolved.ends_with("cookies.txt"));
    }

    #[test]
    fn test_resolve_cookiefile_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.yt_dlp_cookies = Some("../outside.txt".to_string());
        assert!(resolve_cookiefile(&config, tmp.path()).is_none());
    }

    // Current-thread runtime: the spawned run cannot progress between the
    // two synchronous start calls, so the overlap assertion is stable.
    #[tokio::test]
    async fn test_try_start_run_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::remove_var(ENV_PREVIEW);
        let roots = BaseRoots {
            config: tmp.path().join("config"),
            data: tmp.path().join("data"),
            downloads: tmp.path().join("downloads"),
            logs: tmp.path().join("logs"),
            tokens: tmp.path().join("tokens"),
        };
        roots.ensure_dirs().unwrap();
        let paths = EnginePaths::build(&roots);
        let manager = RunManager::new(roots, paths, EngineStatus::new(), StopEvent::new());

        // An empty config run finishes fast, but the immediate second start
        // while the first holds the flag must be declined.
        let first = manager.try_start_run(Config::default(), RunOptions::default());
        let second = manager.try_start_run(Config::default(), RunOptions::default());
        assert!(first);
        assert!(!second);

        // Wait for the background run to settle back to idle.
        for _ in 0..100 {
            if !manager.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!manager.is_running());
        assert!(manager.try_start_run(Config::default(), RunOptions::default()));
    }
}
