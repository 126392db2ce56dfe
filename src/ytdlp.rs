//! yt-dlp invocation layer
//!
//! Wraps the download toolkit as a subprocess: JSON-line parsing for
//! enumeration/metadata, progress-template parsing for transfers, bounded
//! stderr capture for the retry classifier, kill on cancel.
//!
//! Option safety: caller-supplied passthrough options merge wholesale for
//! metadata operations, but download invocations only honor keys on a closed
//! allowlist; anything else is dropped with a warning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::models::{ItemMetadata, PlaylistItem, TransferProgress};
use crate::status::StopEvent;
use crate::urls;

/// Keys honored when merging passthrough options into a download invocation.
pub const DOWNLOAD_OPTS_ALLOWLIST: &[&str] = &[
    "concurrent_fragment_downloads",
    "cookiefile",
    "cookiesfrombrowser",
    "forceipv4",
    "forceipv6",
    "fragment_retries",
    "geo_verification_proxy",
    "http_headers",
    "max_sleep_interval",
    "nocheckcertificate",
    "noproxy",
    "proxy",
    "ratelimit",
    "retries",
    "sleep_interval",
    "socket_timeout",
    "source_address",
    "throttledratelimit",
    "user_agent",
];

/// Flags that must never leak into a download invocation.
pub const METADATA_ONLY_OPTS: &[&str] = &["skip_download", "extract_flat", "simulate", "download"];

const MAX_CAPTURED_LINES: usize = 20_000;
const STDERR_TAIL_LINES: usize = 40;

/// A named header/user-agent bundle for one extractor variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub name: &'static str,
    pub user_agent: &'static str,
}

/// Hardened profiles tried before the default web client.
pub fn hardened_profiles() -> &'static [ClientProfile] {
    &[
        ClientProfile {
            name: "android",
            user_agent: "com.google.android.youtube/19.42.37 (Linux; Android 14)",
        },
        ClientProfile {
            name: "tv_embedded",
            user_agent: "Mozilla/5.0 (SmartTV; Linux; Tizen 6.5) AppleWebKit/537.36",
        },
        ClientProfile {
            name: "web",
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Safari/605.1.15",
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YtDlpErrorKind {
    NotFound,
    Timeout,
    InvalidJson,
    NonZeroExit,
    Canceled,
}

#[derive(Debug)]
pub struct YtDlpError {
    pub kind: YtDlpErrorKind,
    pub message: String,
}

impl std::fmt::Display for YtDlpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for YtDlpError {}

/// Captured subprocess output, bounded.
#[derive(Debug, Clone, Default)]
pub struct YtDlpOutput {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub exit_code: Option<i32>,
}

impl YtDlpOutput {
    pub fn stderr_tail(&self) -> String {
        let start = self.stderr_lines.len().saturating_sub(STDERR_TAIL_LINES);
        self.stderr_lines[start..].join("\n")
    }
}

/// Typed option set for one download invocation.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub format_selector: String,
    /// Staging output template, e.g. `<dir>/%(id)s.%(ext)s`.
    pub output_template: String,
    pub temp_dir: Option<PathBuf>,
    pub client_profile: Option<ClientProfile>,
    pub cookies: Option<PathBuf>,
    pub js_runtime: Option<String>,
    /// Extract audio via the toolkit's post-processor.
    pub extract_audio: Option<String>,
    pub socket_timeout: u32,
    pub retries: u32,
}

impl DownloadOptions {
    pub fn new(format_selector: impl Into<String>, output_template: impl Into<String>) -> Self {
        Self {
            format_selector: format_selector.into(),
            output_template: output_template.into(),
            socket_timeout: 120,
            retries: 5,
            ..Default::default()
        }
    }
}

/// Translate one passthrough key/value into CLI arguments. Returns false for
/// keys this runner cannot express.
fn push_passthrough_arg(args: &mut Vec<String>, key: &str, value: &Value) -> bool {
    fn push2(args: &mut Vec<String>, flag: &str, value: String) {
        args.push(flag.to_string());
        args.push(value);
    }
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    match key {
        "cookiefile" => scalar(value).map(|v| push2(args, "--cookies", v)).is_some(),
        "cookiesfrombrowser" => scalar(value)
            .map(|v| push2(args, "--cookies-from-browser", v))
            .is_some(),
        "proxy" => scalar(value).map(|v| push2(args, "--proxy", v)).is_some(),
        "noproxy" => {
            if value.as_bool() == Some(true) {
                push2(args, "--proxy", String::new());
                true
            } else {
                false
            }
        }
        "geo_verification_proxy" => scalar(value)
            .map(|v| push2(args, "--geo-verification-proxy", v))
            .is_some(),
        "ratelimit" => scalar(value).map(|v| push2(args, "--limit-rate", v)).is_some(),
        "throttledratelimit" => scalar(value)
            .map(|v| push2(args, "--throttled-rate", v))
            .is_some(),
        "retries" => scalar(value).map(|v| push2(args, "--retries", v)).is_some(),
        "fragment_retries" => scalar(value)
            .map(|v| push2(args, "--fragment-retries", v))
            .is_some(),
        "concurrent_fragment_downloads" => scalar(value)
            .map(|v| push2(args, "--concurrent-fragments", v))
            .is_some(),
        "socket_timeout" => scalar(value)
            .map(|v| push2(args, "--socket-timeout", v))
            .is_some(),
        "sleep_interval" => scalar(value)
            .map(|v| push2(args, "--sleep-interval", v))
            .is_some(),
        "max_sleep_interval" => scalar(value)
            .map(|v| push2(args, "--max-sleep-interval", v))
            .is_some(),
        "user_agent" => scalar(value).map(|v| push2(args, "--user-agent", v)).is_some(),
        "source_address" => scalar(value)
            .map(|v| push2(args, "--source-address", v))
            .is_some(),
        "forceipv4" => {
            if value.as_bool() == Some(true) {
                args.push("--force-ipv4".to_string());
            }
            true
        }
        "forceipv6" => {
            if value.as_bool() == Some(true) {
                args.push("--force-ipv6".to_string());
            }
            true
        }
        "nocheckcertificate" => {
            if value.as_bool() == Some(true) {
                args.push("--no-check-certificates".to_string());
            }
            true
        }
        "http_headers" => {
            if let Some(map) = value.as_object() {
                for (name, v) in map {
                    if let Some(v) = v.as_str() {
                        push2(args, "--add-header", format!("{name}:{v}"));
                    }
                }
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Apply the download allowlist to a passthrough map and render the
/// surviving keys as CLI args. Forbidden keys are dropped with a warning.
pub fn filtered_download_passthrough(opts: &BTreeMap<String, Value>) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in opts {
        if METADATA_ONLY_OPTS.contains(&key.as_str()) {
            log::warn!("Dropping metadata-only yt-dlp option from download: {key}");
            continue;
        }
        if !DOWNLOAD_OPTS_ALLOWLIST.contains(&key.as_str()) {
            log::warn!("Dropping disallowed yt-dlp option from download: {key}");
            continue;
        }
        if !push_passthrough_arg(&mut args, key, value) {
            log::warn!("Unsupported value for yt-dlp option {key}; dropped");
        }
    }
    debug_assert!(
        !args.iter().any(|a| {
            matches!(
                a.as_str(),
                "--skip-download" | "--flat-playlist" | "--simulate"
            )
        }),
        "metadata-only flag leaked into a download invocation"
    );
    args
}

/// Render a passthrough map for a metadata operation: merged wholesale,
/// unknown keys dropped only because they have no CLI rendering.
pub fn metadata_passthrough(opts: &BTreeMap<String, Value>) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in opts {
        if METADATA_ONLY_OPTS.contains(&key.as_str()) {
            // Enumeration/metadata calls already pin these flags themselves.
            continue;
        }
        if !push_passthrough_arg(&mut args, key, value) {
            log::debug!("No CLI rendering for yt-dlp option {key}; skipped");
        }
    }
    args
}

/// Primary runner for enumeration, metadata, and download operations.
#[derive(Debug, Clone)]
pub struct YtDlpRunner {
    binary: PathBuf,
    passthrough: BTreeMap<String, Value>,
    metadata_timeout: Duration,
}

impl YtDlpRunner {
    pub fn new(binary: PathBuf, passthrough: BTreeMap<String, Value>) -> Self {
        Self {
            binary,
            passthrough,
            metadata_timeout: Duration::from_secs(60),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Enumerate a playlist into flat entries (no media fetch).
    pub async fn enumerate_playlist(
        &self,
        playlist_url: &str,
        cookies: Option<&Path>,
    ) -> Result<Vec<PlaylistItem>> {
        let mut args = vec![
            "--flat-playlist".to_string(),
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--force-ipv4".to_string(),
        ];
        if let Some(cookies) = cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        args.extend(metadata_passthrough(&self.passthrough));
        args.push(playlist_url.to_string());

        let (json_lines, _output) = self.exec_json_lines(&args, self.metadata_timeout).await?;
        let mut entries = Vec::with_capacity(json_lines.len());
        for (idx, line) in json_lines.iter().enumerate() {
            match parse_playlist_entry(line, idx) {
                Ok(entry) => entries.push(entry),
                // One bad entry must not kill the whole enumeration.
                Err(err) => log::debug!("Skipping unparsable playlist entry: {err}"),
            }
        }
        Ok(entries)
    }

    /// Fetch metadata for one URL via `--dump-json` (no download).
    pub async fn fetch_metadata(
        &self,
        url: &str,
        cookies: Option<&Path>,
    ) -> Result<ItemMetadata> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--force-ipv4".to_string(),
        ];
        if let Some(cookies) = cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        args.extend(metadata_passthrough(&self.passthrough));
        args.push(url.to_string());

        let (json_lines, _output) = self.exec_json_lines(&args, self.metadata_timeout).await?;
        let first = json_lines
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("yt-dlp returned no JSON output for {url}"))?;
        let value: Value = serde_json::from_str(&first).map_err(|e| YtDlpError {
            kind: YtDlpErrorKind::InvalidJson,
            message: format!("invalid yt-dlp JSON: {e}"),
        })?;
        Ok(parse_item_metadata(&value, url))
    }

    /// Log what an extractor variant believes is available. Best-effort;
    /// used after a failed attempt step for diagnostics only.
    pub async fn probe_formats(&self, url: &str, profile: Option<&ClientProfile>) {
        let mut args = vec![
            "--list-formats".to_string(),
            "--no-warnings".to_string(),
            "--force-ipv4".to_string(),
        ];
        if let Some(profile) = profile {
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:player_client={}", profile.name));
        }
        args.push(url.to_string());

        match self
            .exec_capture(&args, Duration::from_secs(45), None, None)
            .await
        {
            Ok(output) => {
                for line in output.stdout_lines.iter().take(60) {
                    log::info!("format probe: {line}");
                }
            }
            Err(err) => log::debug!("Format probe failed: {err}"),
        }
    }

    /// Run one download attempt. Progress lines feed `on_progress`; the stop
    /// event kills the child and surfaces a `Canceled` error.
    pub async fn download(
        &self,
        url: &str,
        opts: &DownloadOptions,
        stop: &StopEvent,
        mut on_progress: impl FnMut(TransferProgress) + Send,
    ) -> Result<YtDlpOutput, YtDlpError> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-warnings".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            "download:[mediavault] %(progress._percent_str)s %(progress._speed_str)s %(progress._eta_str)s %(progress._total_bytes_str)s".to_string(),
            "--continue".to_string(),
            "--force-ipv4".to_string(),
            "--socket-timeout".to_string(),
            opts.socket_timeout.to_string(),
            "--retries".to_string(),
            opts.retries.to_string(),
            "-f".to_string(),
            opts.format_selector.clone(),
            "-o".to_string(),
            opts.output_template.clone(),
        ];

        if let Some(temp) = &opts.temp_dir {
            args.push("--paths".to_string());
            args.push(format!("temp:{}", temp.to_string_lossy()));
        }
        if let Some(profile) = &opts.client_profile {
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:player_client={}", profile.name));
            args.push("--user-agent".to_string());
            args.push(profile.user_agent.to_string());
            args.push("--add-header".to_string());
            args.push("Accept-Language:en-US,en;q=0.9".to_string());
        }
        if let Some(cookies) = &opts.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        if let Some(runtime) = &opts.js_runtime {
            // "name:/path" -> "name@/path" per the toolkit's runtime syntax.
            if let Some((name, path)) = runtime.split_once(':') {
                args.push("--js-runtimes".to_string());
                args.push(format!("{name}@{path}"));
            }
            args.push("--remote-components".to_string());
            args.push("ejs:github".to_string());
        }
        if let Some(codec) = &opts.extract_audio {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(codec.clone());
            args.push("--audio-quality".to_string());
            args.push("0".to_string());
        }
        args.extend(filtered_download_passthrough(&self.passthrough));
        args.push(url.to_string());

        self.exec_capture(&args, Duration::ZERO, Some(stop), Some(&mut on_progress))
            .await
    }

    /// Execute yt-dlp and return each stdout line that parses as a JSON
    /// object, failing on non-zero exit.
    async fn exec_json_lines(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<(Vec<String>, YtDlpOutput)> {
        let output = self
            .exec_capture(args, timeout, None, None)
            .await
            .map_err(|e| anyhow!("{e}"))?;
        let json_lines = output
            .stdout_lines
            .iter()
            .filter(|l| looks_like_json_object(l))
            .cloned()
            .collect();
        Ok((json_lines, output))
    }

    /// Spawn the binary, capture bounded output, optionally parse progress
    /// and honor cancellation. `timeout == 0` means no deadline (downloads
    /// are bounded by socket timeouts and cancellation instead).
    async fn exec_capture(
        &self,
        args: &[String],
        timeout: Duration,
        stop: Option<&StopEvent>,
        mut on_progress: Option<&mut (dyn FnMut(TransferProgress) + Send)>,
    ) -> Result<YtDlpOutput, YtDlpError> {
        if !self.binary.exists() && which::which(&self.binary).is_err() {
            return Err(YtDlpError {
                kind: YtDlpErrorKind::NotFound,
                message: format!("yt-dlp not found at {}", self.binary.display()),
            });
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| YtDlpError {
            kind: YtDlpErrorKind::NotFound,
            message: format!("failed to spawn yt-dlp: {e}"),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| YtDlpError {
            kind: YtDlpErrorKind::NonZeroExit,
            message: "failed to capture yt-dlp stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| YtDlpError {
            kind: YtDlpErrorKind::NonZeroExit,
            message: "failed to capture yt-dlp stderr".to_string(),
        })?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut output = YtDlpOutput::default();
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };

        let mut stdout_done = false;
        let mut stderr_done = false;
        while !(stdout_done && stderr_done) {
            let stop_wait = async {
                match stop {
                    Some(stop) => stop.wait().await,
                    None => futures::future::pending::<()>().await,
                }
            };
            let timeout_wait = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = stop_wait => {
                    let _ = child.kill().await;
                    return Err(YtDlpError {
                        kind: YtDlpErrorKind::Canceled,
                        message: "canceled".to_string(),
                    });
                }
                _ = timeout_wait => {
                    let _ = child.kill().await;
                    return Err(YtDlpError {
                        kind: YtDlpErrorKind::Timeout,
                        message: format!("yt-dlp timed out after {timeout:?}"),
                    });
                }
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(on_progress) = on_progress.as_mut() {
                                if let Some(update) = parse_progress_line(&line) {
                                    on_progress(update);
                                }
                            }
                            if output.stdout_lines.len() < MAX_CAPTURED_LINES {
                                output.stdout_lines.push(line);
                            }
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            log::error!("Error reading yt-dlp stdout: {e}");
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            if output.stderr_lines.len() < MAX_CAPTURED_LINES {
                                output.stderr_lines.push(line);
                            }
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            log::error!("Error reading yt-dlp stderr: {e}");
                            stderr_done = true;
                        }
                    }
                }
            }
        }

        let exit = child.wait().await.map_err(|e| YtDlpError {
            kind: YtDlpErrorKind::NonZeroExit,
            message: format!("failed to wait for yt-dlp: {e}"),
        })?;
        output.exit_code = exit.code();

        if !exit.success() {
            let tail = output.stderr_tail();
            return Err(YtDlpError {
                kind: YtDlpErrorKind::NonZeroExit,
                message: if tail.is_empty() {
                    format!("yt-dlp exited with status {:?}", output.exit_code)
                } else {
                    tail
                },
            });
        }
        Ok(output)
    }
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn get_u32(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .map(|n| n as u32)
}

/// Map a `--dump-json` info record onto the normalized metadata shape,
/// including the richer music fields when the extractor surfaces them.
pub fn parse_item_metadata(value: &Value, fallback_url: &str) -> ItemMetadata {
    let item_id = get_str(value, "id")
        .or_else(|| urls::extract_item_id(fallback_url))
        .unwrap_or_else(|| fallback_url.to_string());
    let url = get_str(value, "webpage_url").unwrap_or_else(|| fallback_url.to_string());

    let tags = value
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    ItemMetadata {
        item_id,
        title: get_str(value, "title"),
        channel: get_str(value, "channel").or_else(|| get_str(value, "uploader")),
        artist: get_str(value, "artist").or_else(|| get_str(value, "creator")),
        album: get_str(value, "album"),
        album_artist: get_str(value, "album_artist"),
        track: get_str(value, "track"),
        track_number: get_u32(value, "track_number"),
        disc: get_u32(value, "disc_number"),
        release_date: get_str(value, "release_date").or_else(|| get_str(value, "release_year")),
        upload_date: get_str(value, "upload_date"),
        description: get_str(value, "description"),
        tags,
        url: Some(url),
        thumbnail_url: get_str(value, "thumbnail"),
    }
}

fn parse_playlist_entry(json_line: &str, position: usize) -> Result<PlaylistItem> {
    let value: Value = serde_json::from_str(json_line).context("invalid playlist entry JSON")?;
    let item_id = get_str(&value, "id")
        .or_else(|| get_str(&value, "url").as_deref().and_then(urls::extract_item_id))
        .ok_or_else(|| anyhow!("playlist entry missing id"))?;

    let url = get_str(&value, "webpage_url").or_else(|| {
        get_str(&value, "url").filter(|u| u.starts_with("http://") || u.starts_with("https://"))
    });

    let position = value
        .get("playlist_index")
        .and_then(|v| v.as_u64())
        .map(|n| n as u32)
        .or(Some(position as u32 + 1));

    Ok(PlaylistItem {
        item_id,
        entry_id: None,
        position,
        url,
        title: get_str(&value, "title"),
    })
}

// --- progress parsing -------------------------------------------------

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[mediavault\]\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)").unwrap())
}

fn fallback_progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[download\]\s+(\d+\.?\d*)%").unwrap())
}

fn size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\d.]+)\s*(Ki?B|Mi?B|Gi?B|B)").unwrap())
}

/// Parse one stdout line into a progress update, if it is one.
pub fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    if let Some(caps) = progress_re().captures(line) {
        let percent = parse_percent(caps.get(1)?.as_str());
        let speed = parse_speed(caps.get(2)?.as_str());
        let eta = parse_eta(caps.get(3)?.as_str());
        let total = parse_bytes(caps.get(4)?.as_str());
        let downloaded = match (percent, total) {
            (Some(p), Some(t)) => Some(((p as u64) * t) / 100),
            _ => None,
        };
        return Some(TransferProgress {
            percent,
            bytes_downloaded: downloaded,
            bytes_total: total,
            speed_bps: speed,
            eta_seconds: eta,
        });
    }

    if let Some(caps) = fallback_progress_re().captures(line) {
        let percent = caps.get(1)?.as_str().parse::<f64>().ok()? as u32;
        return Some(TransferProgress {
            percent: Some(percent.min(100)),
            ..Default::default()
        });
    }
    None
}

fn parse_percent(s: &str) -> Option<u32> {
    let cleaned = s.trim_end_matches('%').trim();
    cleaned.parse::<f64>().ok().map(|p| (p as u32).min(100))
}

fn parse_speed(s: &str) -> Option<f64> {
    let s = s.trim().trim_end_matches("/s");
    if s == "N/A" || s.is_empty() {
        return None;
    }
    parse_bytes(s).map(|b| b as f64)
}

fn parse_eta(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }
    let parts: Vec<&str> = s.split(':').collect();
    match parts.len() {
        1 => parts[0].parse().ok(),
        2 => {
            let mins: u64 = parts[0].parse().ok()?;
            let secs: u64 = parts[1].parse().ok()?;
            Some(mins * 60 + secs)
        }
        3 => {
            let hours: u64 = parts[0].parse().ok()?;
            let mins: u64 = parts[1].parse().ok()?;
            let secs: u64 = parts[2].parse().ok()?;
            Some(hours * 3600 + mins * 60 + secs)
        }
        _ => None,
    }
}

fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }
    let caps = size_re().captures(s)?;
    let num: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: f64 = match caps.get(2)?.as_str() {
        "B" => 1.0,
        "KB" | "KiB" => 1024.0,
        "MB" | "MiB" => 1024.0 * 1024.0,
        "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Some((num * multiplier) as u64)
}
