//! Toolkit binaries
//!
//! Discovery, version probing, and self-update for yt-dlp plus discovery for
//! ffmpeg. Downloaded updates are checksum-verified and swapped atomically.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const YTDLP_RELEASE_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";
const YTDLP_CHECKSUM_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/SHA2-256SUMS";

/// Locate the yt-dlp binary: managed tools dir first, then common install
/// locations, then PATH.
pub fn find_ytdlp_binary(tools_dir: &Path) -> PathBuf {
    let managed = tools_dir.join("yt-dlp");
    if managed.exists() {
        return managed;
    }

    let common_paths = [
        "/usr/local/bin/yt-dlp",
        "/usr/bin/yt-dlp",
        "/opt/homebrew/bin/yt-dlp",
        "/opt/local/bin/yt-dlp",
    ];
    for path in common_paths {
        let path = PathBuf::from(path);
        if path.exists() {
            return path;
        }
    }
    if let Some(home) = dirs::home_dir() {
        let user_local = home.join(".local/bin/yt-dlp");
        if user_local.exists() {
            return user_local;
        }
    }

    if let Ok(found) = which::which("yt-dlp") {
        return found;
    }

    log::warn!("Could not find yt-dlp in common paths, falling back to PATH lookup");
    PathBuf::from("yt-dlp")
}

pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    find_companion_binary("ffmpeg")
}

pub fn find_ffprobe_binary() -> Option<PathBuf> {
    find_companion_binary("ffprobe")
}

/// Chromaprint's fingerprinter, needed for AcoustID lookups.
pub fn find_fpcalc_binary() -> Option<PathBuf> {
    find_companion_binary("fpcalc")
}

fn find_companion_binary(name: &str) -> Option<PathBuf> {
    let common_dirs = ["/usr/local/bin", "/usr/bin", "/opt/homebrew/bin", "/opt/local/bin"];
    for dir in common_dirs {
        let path = PathBuf::from(dir).join(name);
        if path.exists() {
            return Some(path);
        }
    }
    if let Ok(found) = which::which(name) {
        return Some(found);
    }
    log::warn!("Could not find {name}");
    None
}

/// Run `<binary> <args>` and return the first stdout line.
pub async fn probe_version(binary: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let output = tokio::time::timeout(Duration::from_secs(10), cmd.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().map(|l| l.trim().to_string())
}

/// Build info for `/api/version`.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub app: &'static str,
    pub version: &'static str,
    pub yt_dlp_path: String,
    pub yt_dlp_version: Option<String>,
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_version: Option<String>,
}

pub async fn runtime_info(tools_dir: &Path) -> RuntimeInfo {
    let yt_dlp = find_ytdlp_binary(tools_dir);
    let ffmpeg = find_ffmpeg_binary();
    let yt_dlp_version = probe_version(&yt_dlp, &["--version"]).await;
    let ffmpeg_version = match &ffmpeg {
        Some(path) => probe_version(path, &["-version"]).await,
        None => None,
    };
    RuntimeInfo {
        app: "mediavault",
        version: env!("CARGO_PKG_VERSION"),
        yt_dlp_path: yt_dlp.to_string_lossy().to_string(),
        yt_dlp_version,
        ffmpeg_path: ffmpeg.map(|p| p.to_string_lossy().to_string()),
        ffmpeg_version,
    }
}

/// Self-updater for the managed yt-dlp binary. At most one update runs at a
/// time; a second request is refused while one is in flight.
#[derive(Clone)]
pub struct ToolUpdater {
    tools_dir: PathBuf,
    client: reqwest::Client,
    running: Arc<AtomicBool>,
}

impl ToolUpdater {
    pub fn new(tools_dir: PathBuf) -> Self {
        Self {
            tools_dir,
            client: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Try to reserve the update slot. Returns false when an update is
    /// already in flight.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Download the latest yt-dlp release, verify its sha256 against the
    /// published checksum list, and swap it into the tools dir atomically.
    pub async fn update_ytdlp(&self) -> Result<String> {
        tokio::fs::create_dir_all(&self.tools_dir)
            .await
            .with_context(|| format!("create tools dir: {}", self.tools_dir.display()))?;

        let checksums = self
            .client
            .get(YTDLP_CHECKSUM_URL)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("fetch yt-dlp checksums")?
            .error_for_status()?
            .text()
            .await?;
        let expected = parse_checksum_line(&checksums, "yt-dlp")
            .ok_or_else(|| anyhow!("no checksum entry for yt-dlp"))?;

        let response = self
            .client
            .get(YTDLP_RELEASE_URL)
            .timeout(Duration::from_secs(600))
            .send()
            .await
            .context("download yt-dlp")?
            .error_for_status()?;
        let bytes = response.bytes().await.context("read yt-dlp body")?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            bail!("yt-dlp checksum mismatch: expected {expected}, got {actual}");
        }

        let staging = self.tools_dir.join("yt-dlp.download");
        let target = self.tools_dir.join("yt-dlp");
        {
            let mut file = tokio::fs::File::create(&staging)
                .await
                .with_context(|| format!("create {}", staging.display()))?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).await?;
        }
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("install {}", target.display()))?;

        let version = probe_version(&target, &["--version"])
            .await
            .unwrap_or_else(|| "unknown".to_string());
        log::info!("Updated yt-dlp to {version} at {}", target.display());
        Ok(version)
    }
}

fn parse_checksum_line(body: &str, name: &str) -> Option<String> {
    for line in body.lines() {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        if let Some(file) = parts.next() {
            if file.trim_start_matches('*') == name {
                return Some(hash.to_lowercase());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checksum_line() {
        let body = "abc123  yt-dlp.exe\n0123456789abcdef  yt-dlp\nffff  yt-dlp.tar.gz";
        assert_eq!(
            parse_checksum_line(body, "yt-dlp").as_deref(),
            Some("0123456789abcdef")
        );
        assert!(parse_checksum_line(body, "missing").is_none());
    }

    #[test]
    fn test_updater_single_flight() {
        let updater = ToolUpdater::new(PathBuf::from("/tmp/tools"));
        assert!(updater.try_start());
        assert!(!updater.try_start());
        assert!(updater.is_running());
        updater.finish();
        assert!(updater.try_start());
        updater.finish();
    }

    #[test]
    fn test_find_ytdlp_prefers_managed_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let managed = tmp.path().join("yt-dlp");
        std::fs::write(&managed, b"#!/bin/sh\n").unwrap();
        assert_eq!(find_ytdlp_binary(tmp.path()), managed);
    }
}
