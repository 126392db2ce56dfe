//! ffmpeg collaborator
//!
//! Copy-only operations: embed metadata (and optionally a thumbnail) into a
//! finished artifact, and remux between containers when the configured final
//! format differs. No re-encoding happens here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;

use crate::models::ItemMetadata;
use crate::paths::ensure_dir;

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "opus", "flac"];

pub fn is_audio_ext(ext: &str) -> bool {
    AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Container transitions that cannot be done by stream copy. Wrapping H.264
/// output in a WebM container is the common trap.
pub fn remux_allowed(current_ext: &str, desired_ext: &str) -> bool {
    let current = current_ext.to_ascii_lowercase();
    let desired = desired_ext.to_ascii_lowercase();
    if current == desired {
        return false;
    }
    !matches!(
        (current.as_str(), desired.as_str()),
        ("mp4", "webm") | ("m4a", "webm") | ("m4a", "opus") | ("mp4", "ogg")
    )
}

pub struct Transcoder {
    ffmpeg: Option<PathBuf>,
    http: reqwest::Client,
}

impl Transcoder {
    pub fn new(ffmpeg: Option<PathBuf>) -> Self {
        Self {
            ffmpeg,
            http: reqwest::Client::new(),
        }
    }

    fn ffmpeg(&self) -> Result<&Path> {
        self.ffmpeg
            .as_deref()
            .ok_or_else(|| anyhow!("ffmpeg not available"))
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<()> {
        let binary = self.ffmpeg()?;
        let status = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("spawn ffmpeg: {}", binary.display()))?;
        if !status.success() {
            bail!("ffmpeg exited with status {:?}", status.code());
        }
        Ok(())
    }

    /// Fetch the thumbnail to a scratch file; best-effort.
    async fn fetch_thumbnail(&self, meta: &ItemMetadata, thumbs_dir: &Path) -> Option<PathBuf> {
        let url = meta.thumbnail_url.as_deref()?;
        ensure_dir(thumbs_dir).ok()?;
        let path = thumbs_dir.join(format!("{}.jpg", meta.item_id));

        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let bytes = response.bytes().await.ok()?;
        if bytes.is_empty() {
            return None;
        }
        tokio::fs::write(&path, &bytes).await.ok()?;
        Some(path)
    }

    /// Embed title/channel/date/description/tags/url and, for video
    /// containers, the thumbnail, into `local_file` in place (stream copy to
    /// a temp sibling, then rename).
    pub async fn embed_metadata(
        &self,
        local_file: &Path,
        meta: &ItemMetadata,
        thumbs_dir: &Path,
    ) -> Result<()> {
        if self.ffmpeg.is_none() {
            log::warn!("ffmpeg not found; skipping metadata embed");
            return Ok(());
        }

        let ext = local_file
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "webm".to_string());
        let audio_only = is_audio_ext(&ext);

        let title = meta.title.clone().unwrap_or_else(|| meta.item_id.clone());
        let channel = meta.channel.clone().unwrap_or_default();
        let date_tag = meta
            .upload_date
            .as_deref()
            .filter(|d| d.len() == 8 && d.chars().all(|c| c.is_ascii_digit()))
            .map(|d| format!("{}-{}-{}", &d[0..4], &d[4..6], &d[6..8]));
        let url = meta
            .url
            .clone()
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", meta.item_id));

        let thumb_path = if audio_only {
            None
        } else {
            self.fetch_thumbnail(meta, thumbs_dir).await
        };

        let parent = local_file.parent().unwrap_or_else(|| Path::new("."));
        let tagged = tempfile::Builder::new()
            .suffix(&format!(".tagged.{ext}"))
            .tempfile_in(parent)
            .context("create tagged temp file")?
            .into_temp_path();

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            local_file.to_string_lossy().into_owned(),
        ];
        if let Some(thumb) = &thumb_path {
            args.extend([
                "-attach".into(),
                thumb.to_string_lossy().into_owned(),
                "-metadata:s:t".into(),
                "mimetype=image/jpeg".into(),
                "-metadata:s:t".into(),
                "filename=cover.jpg".into(),
            ]);
        }
        args.extend(["-metadata".into(), format!("title={title}")]);
        if !channel.is_empty() {
            args.extend(["-metadata".into(), format!("artist={channel}")]);
        }
        if let Some(date) = &date_tag {
            args.extend(["-metadata".into(), format!("date={date}")]);
        }
        if let Some(description) = meta.description.as_deref().filter(|d| !d.is_empty()) {
            args.extend(["-metadata".into(), format!("description={description}")]);
        }
        if !meta.tags.is_empty() {
            args.extend(["-metadata".into(), format!("keywords={}", meta.tags.join(", "))]);
        }
        args.extend([
            "-metadata".into(),
            format!("comment=SourceID={} URL={url}", meta.item_id),
        ]);
        args.extend(["-c".into(), "copy".into(), tagged.to_string_lossy().into_owned()]);

        let result = self.run_ffmpeg(&args).await;

        if let Some(thumb) = &thumb_path {
            let _ = tokio::fs::remove_file(thumb).await;
        }

        match result {
            Ok(()) => {
                tokio::fs::rename(&tagged, local_file)
                    .await
                    .context("replace file with tagged copy")?;
                log::info!("[{}] Metadata embedded successfully", meta.item_id);
                Ok(())
            }
            Err(err) => {
                // tagged temp path cleans itself up on drop
                log::error!("ffmpeg metadata embedding failed for {}: {err:#}", meta.item_id);
                Err(err)
            }
        }
    }

    /// Copy-only container remux.
    ///
    /// Returns the new path on success, None when the transition was refused
    /// or the remux failed (the original file is kept either way; a partial
    /// converted file is removed).
    pub async fn remux(&self, input: &Path, desired_ext: &str) -> Result<Option<PathBuf>> {
        let current_ext = input
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if current_ext == desired_ext.to_ascii_lowercase() {
            return Ok(None);
        }
        if !remux_allowed(&current_ext, desired_ext) {
            log::warn!(
                "Skipping {current_ext}->{desired_ext} container copy for {}; would produce an invalid file",
                input.display()
            );
            return Ok(None);
        }
        if self.ffmpeg.is_none() {
            log::warn!("ffmpeg not found; skipping remux to {desired_ext}");
            return Ok(None);
        }

        let output = input.with_extension(desired_ext);
        let args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().into_owned(),
        ];

        match self.run_ffmpeg(&args).await {
            Ok(()) => {
                tokio::fs::remove_file(input).await.ok();
                Ok(Some(output))
            }
            Err(err) => {
                log::error!("Final format conversion failed for {}: {err:#}", input.display());
                tokio::fs::remove_file(&output).await.ok();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_ext_detection() {
        assert!(is_audio_ext("mp3"));
        assert!(is_audio_ext("M4A"));
        assert!(!is_audio_ext("webm"));
        assert!(!is_audio_ext("mp4"));
    }

    #[test]
    fn test_remux_refuses_impossible_transitions() {
        assert!(!remux_allowed("mp4", "webm"));
        assert!(!remux_allowed("m4a", "opus"));
        assert!(!remux_allowed("webm", "webm"));
        assert!(remux_allowed("webm", "mkv"));
        assert!(remux_allowed("mp4", "mkv"));
        assert!(remux_allowed("webm", "mp4"));
    }

    #[tokio::test]
    async fn test_remux_same_ext_is_noop() {
        let transcoder = Transcoder::new(None);
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("a.webm");
        std::fs::write(&input, b"x").unwrap();
        let out = transcoder.remux(&input, "webm").await.unwrap();
        assert!(out.is_none());
        assert!(input.exists());
    }
}
