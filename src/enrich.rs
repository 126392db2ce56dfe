//! Music metadata enrichment
//!
//! Completed music downloads are queued here for canonical metadata:
//! MusicBrainz recording search (optionally corroborated by an AcoustID
//! fingerprint match), fuzzy scoring against the extractor-supplied fields,
//! and direct ID3/MP4 tag writes once a match clears the confidence
//! threshold. The worker runs independently of the download pipeline and is
//! rate-limited; nothing here can fail a job.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::{Config, MusicMetadataConfig};
use crate::filename::{clean_music_artist, clean_music_title};
use crate::models::ItemMetadata;
use crate::providers::{AcoustIdClient, MatchCandidate, MusicBrainzClient};
use crate::tagger::{apply_tags, TagSet};
use crate::tools::{find_ffprobe_binary, find_fpcalc_binary};

/// What the extractor gave us to match against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFields {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub source_title: String,
}

/// Derive match inputs from item metadata, falling back to an
/// "Artist - Title" split of the filename when no artist is known.
pub fn parse_source(meta: &ItemMetadata, file_path: &Path) -> SourceFields {
    let raw_title = meta
        .track
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or(meta.title.as_deref())
        .unwrap_or("");
    let mut title = clean_music_title(raw_title);
    let mut artist = clean_music_artist(meta.artist.as_deref().unwrap_or(""));
    let album = clean_music_title(meta.album.as_deref().unwrap_or(""));

    let source_title = if title.is_empty() {
        file_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        title.clone()
    };

    if artist.is_empty() {
        if let Some((left, right)) = source_title.split_once(" - ") {
            artist = clean_music_artist(left.trim());
            let split_title = clean_music_title(right.trim());
            if !split_title.is_empty() {
                title = split_title;
            }
        }
    }
    if title.is_empty() {
        title = clean_music_title(&source_title);
    }

    SourceFields {
        artist,
        title,
        album,
        source_title,
    }
}

fn ratio_tokens(value: &str) -> BTreeSet<String> {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Token-set similarity on a 0-100 scale: compare the sorted intersection
/// against each side's full sorted token string and keep the best ratio.
pub fn token_set_ratio(left: &str, right: &str) -> u32 {
    let a = ratio_tokens(left);
    let b = ratio_tokens(right);
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let intersection: Vec<&str> = a.intersection(&b).map(String::as_str).collect();
    let only_a: Vec<&str> = a.difference(&b).map(String::as_str).collect();
    let only_b: Vec<&str> = b.difference(&a).map(String::as_str).collect();

    let base = intersection.join(" ");
    let combined_a = format!("{base} {}", only_a.join(" ")).trim().to_string();
    let combined_b = format!("{base} {}", only_b.join(" ")).trim().to_string();

    let best = [
        strsim::normalized_levenshtein(&base, &combined_a),
        strsim::normalized_levenshtein(&base, &combined_b),
        strsim::normalized_levenshtein(&combined_a, &combined_b),
    ]
    .into_iter()
    .fold(0.0f64, f64::max);
    (best * 100.0).round() as u32
}

fn fuzzy_score(left: &str, right: Option<&str>) -> u32 {
    match right {
        Some(right) if !left.is_empty() && !right.is_empty() => token_set_ratio(left, right),
        _ => 0,
    }
}

/// Bucketed confidence score: 40 artist + 30 title + 10 album + 20
/// duration, each gated on its own threshold.
pub fn score_match(source: &SourceFields, candidate: &MatchCandidate, duration: Option<u32>) -> u32 {
    let mut score = 0;
    if fuzzy_score(&source.artist, candidate.artist.as_deref()) >= 80 {
        score += 40;
    }
    if fuzzy_score(&source.title, candidate.title.as_deref()) >= 80 {
        score += 30;
    }
    if !source.album.is_empty() && fuzzy_score(&source.album, candidate.album.as_deref()) >= 80 {
        score += 10;
    }
    if let (Some(duration), Some(candidate_duration)) = (duration, candidate.duration) {
        if duration.abs_diff(candidate_duration) <= 2 {
            score += 20;
        }
    }
    score
}

/// Union of candidate lists, deduplicated by recording id (first wins).
pub fn merge_candidates(
    existing: Vec<MatchCandidate>,
    extra: Vec<MatchCandidate>,
) -> Vec<MatchCandidate> {
    let mut merged: Vec<MatchCandidate> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for candidate in existing.into_iter().chain(extra) {
        match candidate.recording_id.as_deref() {
            Some(id) => {
                if seen.insert(id.to_string()) {
                    merged.push(candidate);
                }
            }
            None => merged.push(candidate),
        }
    }
    merged
}

pub fn select_best_match(
    source: &SourceFields,
    candidates: &[MatchCandidate],
    duration: Option<u32>,
) -> Option<(MatchCandidate, u32)> {
    let mut best: Option<(MatchCandidate, u32)> = None;
    for candidate in candidates {
        let score = score_match(source, candidate, duration);
        if score > best.as_ref().map_or(0, |(_, s)| *s) {
            best = Some((candidate.clone(), score));
        }
    }
    best
}

/// Media duration in whole seconds via ffprobe; best-effort.
pub async fn probe_duration_seconds(ffprobe: &Path, file_path: &Path) -> Option<u32> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(file_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .map(|d| d.round() as u32)
}

struct EnrichmentJob {
    file_path: PathBuf,
    meta: ItemMetadata,
    config: MusicMetadataConfig,
}

/// Handle onto the enrichment worker. The worker task starts on the first
/// enqueue and drains whatever is queued, then exits when every handle is
/// gone.
#[derive(Clone, Default)]
pub struct EnrichmentQueue {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<EnrichmentJob>>>>,
}

impl EnrichmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a finished music file for enrichment. Returns whether it was
    /// accepted (enrichment disabled returns false).
    pub fn enqueue(&self, file_path: PathBuf, meta: ItemMetadata, config: &Config) -> bool {
        let normalized = config.music_metadata_config();
        if !normalized.enabled {
            return false;
        }
        let job = EnrichmentJob {
            file_path,
            meta,
            config: normalized,
        };

        let mut sender = self.sender.lock().expect("enrichment queue lock");
        let job = match sender.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return true,
                // The previous worker has exited; restart it below.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(rx));
        log::info!("Music metadata worker started");
        let accepted = tx.send(job).is_ok();
        *sender = Some(tx);
        accepted
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<EnrichmentJob>) {
    let musicbrainz = MusicBrainzClient::new();
    let acoustid = AcoustIdClient::new();
    let ffprobe = find_ffprobe_binary();

    while let Some(job) = rx.recv().await {
        let rate = job.config.rate_limit_seconds.max(0.0);
        if let Err(err) = process_job(&musicbrainz, &acoustid, ffprobe.as_deref(), job).await {
            log::error!("Music metadata worker failed: {err:#}");
        }
        if rate > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(rate)).await;
        }
    }
}

async fn process_job(
    musicbrainz: &MusicBrainzClient,
    acoustid: &AcoustIdClient,
    ffprobe: Option<&Path>,
    job: EnrichmentJob,
) -> Result<()> {
    let file_path = job.file_path;
    if !file_path.exists() {
        log::warn!("Music metadata skipped: file missing ({})", file_path.display());
        return Ok(());
    }
    let config = job.config;
    let source = parse_source(&job.meta, &file_path);
    if source.title.is_empty() || source.artist.is_empty() {
        log::warn!(
            "Music metadata skipped: missing source artist/title ({})",
            file_path.display()
        );
        return Ok(());
    }

    let duration = match ffprobe {
        Some(ffprobe) => probe_duration_seconds(ffprobe, &file_path).await,
        None => None,
    };

    let mut candidates = musicbrainz
        .search_recordings(
            &source.artist,
            &source.title,
            Some(source.album.as_str()).filter(|a| !a.is_empty()),
            5,
        )
        .await;

    if config.use_acoustid {
        let api_key = config.acoustid_api_key.trim();
        if api_key.is_empty() {
            log::warn!("Music metadata: acoustid enabled but API key is missing");
        } else if let Some(hit) = acoustid
            .match_recording(&file_path, api_key, find_fpcalc_binary().as_deref())
            .await
        {
            candidates = merge_candidates(candidates, vec![hit]);
        }
    }

    let Some((best, score)) = select_best_match(&source, &candidates, duration)
        .filter(|(_, score)| *score >= config.confidence_threshold)
    else {
        log::warn!(
            "Music metadata skipped (below threshold {}) for {}",
            config.confidence_threshold,
            file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        );
        return Ok(());
    };

    let tags = TagSet {
        artist: best.artist.clone(),
        album: best.album.clone(),
        title: best.title.clone(),
        album_artist: best.album_artist.clone().or_else(|| best.artist.clone()),
        track_number: best.track_number,
        year: best.year.clone(),
        genre: None,
        recording_id: best.recording_id.clone(),
    };

    let artwork = match (config.embed_artwork, best.release_id.as_deref()) {
        (true, Some(release_id)) => {
            musicbrainz
                .fetch_artwork(release_id, config.max_artwork_size_px)
                .await
        }
        _ => None,
    };

    log::info!(
        "Metadata matched ({score}%) - {} / {} / {}",
        tags.artist.as_deref().unwrap_or("-"),
        tags.title.as_deref().unwrap_or("-"),
        tags.album.as_deref().unwrap_or("-"),
    );

    let source_title = source.source_title.clone();
    let allow_overwrite = config.allow_overwrite_tags;
    let dry_run = config.dry_run;
    tokio::task::spawn_blocking(move || {
        apply_tags(
            &file_path,
            &tags,
            artwork.as_ref(),
            Some(&source_title),
            allow_overwrite,
            dry_run,
        )
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(artist: Option<&str>, title: Option<&str>, album: Option<&str>) -> ItemMetadata {
        ItemMetadata {
            item_id: "v1".into(),
            artist: artist.map(str::to_string),
            title: title.map(str::to_string),
            album: album.map(str::to_string),
            ..Default::default()
        }
    }

    fn candidate(artist: &str, title: &str, album: Option<&str>, duration: Option<u32>) -> MatchCandidate {
        MatchCandidate {
            recording_id: Some("rec-1".into()),
            artist: Some(artist.to_string()),
            title: Some(title.to_string()),
            album: album.map(str::to_string),
            duration,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_source_cleans_fields() {
        let source = parse_source(
            &meta(
                Some("@SomeBandVEVO"),
                Some("Song Name (Official Music Video)"),
                Some("The Album [Deluxe Edition HD]"),
            ),
            Path::new("/lib/whatever.m4a"),
        );
        assert_eq!(source.artist, "SomeBand");
        assert_eq!(source.title, "Song Name");
        assert_eq!(source.album, "The Album");
    }

    #[test]
    fn test_parse_source_splits_artist_from_title() {
        let source = parse_source(
            &meta(None, Some("Some Artist - Some Song (Lyric Video)"), None),
            Path::new("/lib/x.mp3"),
        );
        assert_eq!(source.artist, "Some Artist");
        assert_eq!(source.title, "Some Song");
    }

    #[test]
    fn test_parse_source_falls_back_to_filename() {
        let source = parse_source(
            &meta(None, None, None),
            Path::new("/lib/Another Artist - Another Song.mp3"),
        );
        assert_eq!(source.source_title, "Another Artist - Another Song");
        assert_eq!(source.artist, "Another Artist");
        assert_eq!(source.title, "Another Song");
    }

    #[test]
    fn test_token_set_ratio() {
        assert_eq!(token_set_ratio("Daft Punk", "daft punk"), 100);
        assert_eq!(token_set_ratio("Punk Daft", "Daft Punk"), 100);
        assert_eq!(token_set_ratio("", "anything"), 0);
        assert!(token_set_ratio("Daft Punk", "Daft Punk Essentials") >= 80);
        assert!(token_set_ratio("Daft Punk", "Completely Unrelated") < 50);
    }

    #[test]
    fn test_score_match_buckets() {
        let source = SourceFields {
            artist: "Artist".into(),
            title: "Track Title".into(),
            album: "The Album".into(),
            ..Default::default()
        };

        let full = candidate("Artist", "Track Title", Some("The Album"), Some(200));
        assert_eq!(score_match(&source, &full, Some(201)), 100);

        let no_duration = candidate("Artist", "Track Title", Some("The Album"), None);
        assert_eq!(score_match(&source, &no_duration, Some(201)), 80);

        let wrong_artist = candidate("Somebody Else Entirely", "Track Title", None, None);
        assert_eq!(score_match(&source, &wrong_artist, None), 30);

        // Album bucket only counts when the source knows an album.
        let source_no_album = SourceFields {
            album: String::new(),
            ..source.clone()
        };
        assert_eq!(score_match(&source_no_album, &full, None), 70);
    }

    #[test]
    fn test_merge_candidates_dedupes_by_recording_id() {
        let a = candidate("A", "T", None, None);
        let mut b = candidate("B", "T2", None, None);
        b.recording_id = Some("rec-2".into());
        let mut duplicate = candidate("A again", "T again", None, None);
        duplicate.recording_id = Some("rec-1".into());

        let merged = merge_candidates(vec![a], vec![duplicate, b]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].artist.as_deref(), Some("A"));
        assert_eq!(merged[1].recording_id.as_deref(), Some("rec-2"));
    }

    #[test]
    fn test_select_best_match() {
        let source = SourceFields {
            artist: "Artist".into(),
            title: "Track".into(),
            ..Default::default()
        };
        let weak = candidate("Artist", "Different Words", None, None);
        let strong = candidate("Artist", "Track", None, None);
        let (best, score) = select_best_match(&source, &[weak, strong], None).unwrap();
        assert_eq!(best.title.as_deref(), Some("Track"));
        assert_eq!(score, 70);

        assert!(select_best_match(&source, &[], None).is_none());
    }

    #[tokio::test]
    async fn test_enqueue_respects_disabled() {
        let queue = EnrichmentQueue::new();
        let mut config = Config::default();
        config.music_metadata = Some(MusicMetadataConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!queue.enqueue(
            PathBuf::from("/lib/a.mp3"),
            ItemMetadata::default(),
            &config
        ));
    }

    #[tokio::test]
    async fn test_enqueue_starts_worker() {
        let queue = EnrichmentQueue::new();
        let config = Config::default();
        // File does not exist: the worker logs and skips, nothing panics.
        assert!(queue.enqueue(
            PathBuf::from("/nonexistent/a.mp3"),
            ItemMetadata::default(),
            &config
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
