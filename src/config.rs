//! User configuration
//!
//! The config is a keyed JSON document living under the config root. It is
//! read fresh for every run so edits through `/api/config` (or by hand) take
//! effect without a restart. Validation never panics; it yields a list of
//! human-readable errors, and an empty list means the document is usable.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default cap on attempts per download job.
pub const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 3;
/// Default delay before a retryable failure is requeued.
pub const DEFAULT_JOB_RETRY_DELAY_SECONDS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Account name -> OAuth token file under the tokens root.
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,

    /// Ordered list of playlists to archive.
    #[serde(default)]
    pub playlists: Vec<PlaylistSpec>,

    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,

    #[serde(default)]
    pub watch_policy: Option<WatchPolicy>,

    /// Default container/codec tag (e.g. "mp4", "webm", "mp3").
    #[serde(default)]
    pub final_format: Option<String>,

    /// `%(key)s` templates consumed by the filename builder.
    #[serde(default)]
    pub filename_template: Option<String>,
    #[serde(default)]
    pub music_filename_template: Option<String>,

    /// Cookies file under the tokens root, for the unauthenticated fallback.
    #[serde(default)]
    pub yt_dlp_cookies: Option<String>,

    /// Passthrough yt-dlp options. Download invocations filter these against
    /// a closed allowlist; metadata invocations merge wholesale.
    #[serde(default)]
    pub yt_dlp_opts: BTreeMap<String, Value>,

    #[serde(default)]
    pub dry_run: bool,

    /// Log what the music enrichment worker would tag instead of writing.
    #[serde(default)]
    pub music_metadata_debug: bool,

    /// Music metadata enrichment (MusicBrainz/AcoustID) tuning.
    #[serde(default)]
    pub music_metadata: Option<MusicMetadataConfig>,

    /// Destination for single-URL downloads (under the downloads root).
    #[serde(default)]
    pub single_download_folder: Option<String>,

    #[serde(default)]
    pub job_max_attempts: Option<u32>,
    #[serde(default)]
    pub job_retry_delay_seconds: Option<u64>,

    /// JS runtime for yt-dlp ("node:/usr/bin/node" or a bare binary name).
    #[serde(default)]
    pub js_runtime: Option<String>,

    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Path to the OAuth token file, resolved under the tokens root.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistMode {
    #[default]
    Full,
    Subscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistSpec {
    #[serde(alias = "id")]
    pub playlist_id: Option<String>,

    #[serde(alias = "directory")]
    pub folder: Option<String>,

    #[serde(default)]
    pub mode: PlaylistMode,

    #[serde(default)]
    pub music_mode: bool,

    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub final_format: Option<String>,

    #[serde(default)]
    pub remove_after_download: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_schedule_mode")]
    pub mode: String,

    #[serde(default)]
    pub interval_hours: Option<u32>,

    #[serde(default)]
    pub run_on_startup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_schedule_mode(),
            interval_hours: Some(6),
            run_on_startup: false,
        }
    }
}

fn default_schedule_mode() -> String {
    "interval".to_string()
}

/// Partial schedule update accepted by `POST /api/schedule`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulePatch {
    pub enabled: Option<bool>,
    pub mode: Option<String>,
    pub interval_hours: Option<u32>,
    pub run_on_startup: Option<bool>,
}

impl ScheduleConfig {
    pub fn merged_with(&self, patch: &SchedulePatch) -> ScheduleConfig {
        ScheduleConfig {
            enabled: patch.enabled.unwrap_or(self.enabled),
            mode: patch.mode.clone().unwrap_or_else(|| self.mode.clone()),
            interval_hours: patch.interval_hours.or(self.interval_hours),
            run_on_startup: patch.run_on_startup.unwrap_or(self.run_on_startup),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchPolicy {
    #[serde(default)]
    pub min_interval_minutes: Option<u32>,
    #[serde(default)]
    pub max_interval_minutes: Option<u32>,
    #[serde(default)]
    pub idle_backoff_factor: Option<f64>,
    #[serde(default)]
    pub active_reset_minutes: Option<u32>,
    #[serde(default)]
    pub downtime: Option<DowntimeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DowntimeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Local wall-clock "HH:MM".
    pub start: Option<String>,
    pub end: Option<String>,
    /// IANA timezone name; falls back to UTC when invalid.
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

/// Settings for the music metadata enrichment worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicMetadataConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum match score (0-100) before tags are written.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u32,

    #[serde(default)]
    pub use_acoustid: bool,

    #[serde(default)]
    pub acoustid_api_key: String,

    #[serde(default = "default_true")]
    pub embed_artwork: bool,

    #[serde(default = "default_true")]
    pub allow_overwrite_tags: bool,

    #[serde(default = "default_max_artwork_size")]
    pub max_artwork_size_px: u32,

    /// Pause between lookups; the public endpoints rate-limit per IP.
    #[serde(default = "default_metadata_rate_limit")]
    pub rate_limit_seconds: f64,

    #[serde(default)]
    pub dry_run: bool,
}

impl Default for MusicMetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            use_acoustid: false,
            acoustid_api_key: String::new(),
            embed_artwork: true,
            allow_overwrite_tags: true,
            max_artwork_size_px: default_max_artwork_size(),
            rate_limit_seconds: default_metadata_rate_limit(),
            dry_run: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> u32 {
    70
}

fn default_max_artwork_size() -> u32 {
    1500
}

fn default_metadata_rate_limit() -> f64 {
    1.5
}

impl Config {
    pub fn job_max_attempts(&self) -> u32 {
        self.job_max_attempts
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_JOB_MAX_ATTEMPTS)
    }

    pub fn job_retry_delay_seconds(&self) -> u64 {
        self.job_retry_delay_seconds
            .unwrap_or(DEFAULT_JOB_RETRY_DELAY_SECONDS)
    }

    pub fn schedule_or_default(&self) -> ScheduleConfig {
        self.schedule.clone().unwrap_or_default()
    }

    /// Effective enrichment settings; `music_metadata_debug` forces the
    /// dry-run path so tag writes are logged instead of applied.
    pub fn music_metadata_config(&self) -> MusicMetadataConfig {
        let mut cfg = self.music_metadata.clone().unwrap_or_default();
        if self.music_metadata_debug {
            cfg.dry_run = true;
        }
        cfg
    }
}

/// Load and deserialize the config document.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config: {}", path.display()))?;
    Ok(config)
}

/// Load the config as an untyped document (for `GET /api/config`).
pub fn load_config_value(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse config: {}", path.display()))?;
    Ok(value)
}

/// Atomically replace the config file: write a temp sibling, fsync, rename.
pub fn write_config_atomic(path: &Path, value: &Value) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("create config dir: {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .context("create temp config file")?;
    serde_json::to_writer_pretty(&mut tmp, value).context("serialize config")?;
    tmp.write_all(b"\n").ok();
    tmp.as_file().sync_all().context("fsync config")?;
    tmp.persist(path)
        .with_context(|| format!("replace config: {}", path.display()))?;
    Ok(())
}

/// Validate a parsed document. Returns human-readable errors; empty = ok.
pub fn validate_config(config: &Config) -> Vec<String> {
    let mut errors = Vec::new();

    for (idx, pl) in config.playlists.iter().enumerate() {
        if pl.playlist_id.as_deref().map_or(true, str::is_empty) {
            errors.push(format!("playlists[{idx}] missing playlist_id"));
        }
        if pl.folder.as_deref().map_or(true, str::is_empty) {
            errors.push(format!("playlists[{idx}] missing folder"));
        }
        if let Some(account) = pl.account.as_deref() {
            if !account.is_empty() && !config.accounts.contains_key(account) {
                errors.push(format!("playlists[{idx}] references unknown account '{account}'"));
            }
        }
    }

    for (name, account) in &config.accounts {
        if account.token.as_deref().map_or(true, str::is_empty) {
            errors.push(format!("accounts.{name} missing token path"));
        }
    }

    if let Some(schedule) = &config.schedule {
        errors.extend(validate_schedule(schedule));
    }

    if let Some(policy) = &config.watch_policy {
        if let Some(downtime) = &policy.downtime {
            if downtime.enabled {
                for (label, value) in [("start", &downtime.start), ("end", &downtime.end)] {
                    match value.as_deref() {
                        Some(v) if parse_hhmm(v).is_some() => {}
                        Some(v) => errors.push(format!(
                            "watch_policy.downtime.{label} must be HH:MM, got '{v}'"
                        )),
                        None => errors.push(format!(
                            "watch_policy.downtime.{label} is required when downtime is enabled"
                        )),
                    }
                }
            }
        }
    }

    errors
}

pub fn validate_schedule(schedule: &ScheduleConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if schedule.mode != "interval" {
        errors.push("schedule.mode must be 'interval'".to_string());
    }
    match schedule.interval_hours {
        Some(hours) if hours < 1 => {
            errors.push("schedule.interval_hours must be >= 1".to_string());
        }
        None if schedule.enabled => {
            errors.push("schedule.interval_hours is required when schedule is enabled".to_string());
        }
        _ => {}
    }
    errors
}

/// Parse "HH:MM" into (hour, minute).
pub fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Config {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_playlist_aliases() {
        let config = parse(
            r#"{"playlists":[{"id":"PL1","directory":"music","mode":"subscribe"}]}"#,
        );
        let pl = &config.playlists[0];
        assert_eq!(pl.playlist_id.as_deref(), Some("PL1"));
        assert_eq!(pl.folder.as_deref(), Some("music"));
        assert_eq!(pl.mode, PlaylistMode::Subscribe);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_missing_playlist_fields() {
        let config = parse(r#"{"playlists":[{}]}"#);
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("missing playlist_id")));
        assert!(errors.iter().any(|e| e.contains("missing folder")));
    }

    #[test]
    fn test_schedule_requires_interval_when_enabled() {
        let config = parse(r#"{"schedule":{"enabled":true}}"#);
        let errors = validate_config(&config);
        assert!(errors
            .iter()
            .any(|e| e.contains("interval_hours is required")));
    }

    #[test]
    fn test_schedule_rejects_zero_interval() {
        let config = parse(r#"{"schedule":{"enabled":true,"interval_hours":0}}"#);
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains(">= 1")));
    }

    #[test]
    fn test_schedule_patch_merge() {
        let base = ScheduleConfig::default();
        let merged = base.merged_with(&SchedulePatch {
            enabled: Some(true),
            interval_hours: Some(12),
            ..Default::default()
        });
        assert!(merged.enabled);
        assert_eq!(merged.interval_hours, Some(12));
        assert_eq!(merged.mode, "interval");
    }

    #[test]
    fn test_unknown_account_reference() {
        let config = parse(
            r#"{"playlists":[{"playlist_id":"PL1","folder":"a","account":"alice"}]}"#,
        );
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("unknown account")));
    }

    #[test]
    fn test_downtime_validation() {
        let config = parse(
            r#"{"watch_policy":{"downtime":{"enabled":true,"start":"23:00","end":"7:99"}}}"#,
        );
        let errors = validate_config(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("downtime.end"));
    }

    #[test]
    fn test_atomic_write_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let value = serde_json::json!({"final_format": "mp4"});
        write_config_atomic(&path, &value).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.final_format.as_deref(), Some("mp4"));
    }

    #[test]
    fn test_job_defaults() {
        let config = Config::default();
        assert_eq!(config.job_max_attempts(), 3);
        assert_eq!(config.job_retry_delay_seconds(), 30);
    }

    #[test]
    fn test_music_metadata_defaults() {
        let config = Config::default();
        let meta = config.music_metadata_config();
        assert!(meta.enabled);
        assert_eq!(meta.confidence_threshold, 70);
        assert!(!meta.use_acoustid);
        assert!(meta.embed_artwork);
        assert!(meta.allow_overwrite_tags);
        assert_eq!(meta.max_artwork_size_px, 1500);
        assert!(!meta.dry_run);
    }

    #[test]
    fn test_music_metadata_debug_forces_dry_run() {
        let config = parse(
            r#"{"music_metadata_debug":true,"music_metadata":{"confidence_threshold":85}}"#,
        );
        let meta = config.music_metadata_config();
        assert_eq!(meta.confidence_threshold, 85);
        assert!(meta.dry_run);
    }
}
