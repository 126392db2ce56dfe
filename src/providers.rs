//! Metadata lookup providers
//!
//! Canonical recording lookup via the MusicBrainz web service, cover art via
//! the Cover Art Archive, and fingerprint matching via AcoustID (fpcalc +
//! the lookup endpoint). Everything here is best-effort: lookup failures log
//! and yield nothing, they never fail a download.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::tagger::Artwork;

const MUSICBRAINZ_BASE: &str = "https://musicbrainz.org/ws/2";
const COVERART_BASE: &str = "https://coverartarchive.org";
const ACOUSTID_LOOKUP: &str = "https://api.acoustid.org/v2/lookup";
const USER_AGENT: &str = concat!("mediavault/", env!("CARGO_PKG_VERSION"));

/// One candidate recording from any provider.
#[derive(Debug, Clone, Default)]
pub struct MatchCandidate {
    pub recording_id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<u32>,
    pub release_id: Option<String>,
    pub year: Option<String>,
    pub duration: Option<u32>,
    pub acoustid_score: Option<f64>,
}

pub struct MusicBrainzClient {
    http: reqwest::Client,
    /// Release lookups repeat across a candidate list; cache per worker.
    release_cache: Mutex<HashMap<String, Value>>,
}

impl MusicBrainzClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            release_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Search recordings by artist/title (and release when known).
    pub async fn search_recordings(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
        limit: u32,
    ) -> Vec<MatchCandidate> {
        if artist.is_empty() || title.is_empty() {
            return Vec::new();
        }
        let mut query = format!(
            "artist:\"{}\" AND recording:\"{}\"",
            escape_lucene(artist),
            escape_lucene(title)
        );
        if let Some(album) = album.filter(|a| !a.is_empty()) {
            query.push_str(&format!(" AND release:\"{}\"", escape_lucene(album)));
        }

        let url = format!("{MUSICBRAINZ_BASE}/recording");
        let limit_param = limit.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", query.as_str()),
                ("fmt", "json"),
                ("limit", limit_param.as_str()),
            ])
            .send()
            .await;
        let body: Value = match response {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(body) => body,
                    Err(err) => {
                        log::error!("MusicBrainz search failed: {err}");
                        return Vec::new();
                    }
                }
            }
            Ok(response) => {
                log::error!("MusicBrainz search failed: HTTP {}", response.status());
                return Vec::new();
            }
            Err(err) => {
                log::error!("MusicBrainz search failed: {err}");
                return Vec::new();
            }
        };

        let mut candidates = parse_recording_search(&body);
        for candidate in &mut candidates {
            if let (Some(release_id), Some(recording_id)) =
                (candidate.release_id.clone(), candidate.recording_id.clone())
            {
                candidate.track_number = self.find_track_number(&release_id, &recording_id).await;
            }
        }
        candidates
    }

    /// Track position of a recording within a release (cached per release).
    async fn find_track_number(&self, release_id: &str, recording_id: &str) -> Option<u32> {
        let cached = {
            let cache = self.release_cache.lock().await;
            cache.get(release_id).cloned()
        };
        let release = match cached {
            Some(release) => release,
            None => {
                let url = format!("{MUSICBRAINZ_BASE}/release/{release_id}");
                let response = self
                    .http
                    .get(&url)
                    .query(&[("inc", "recordings"), ("fmt", "json")])
                    .send()
                    .await
                    .ok()?;
                if !response.status().is_success() {
                    log::debug!("MusicBrainz release lookup failed for {release_id}");
                    return None;
                }
                let body: Value = response.json().await.ok()?;
                self.release_cache
                    .lock()
                    .await
                    .insert(release_id.to_string(), body.clone());
                body
            }
        };
        find_track_in_release(&release, recording_id)
    }

    /// Front cover from the Cover Art Archive. The archive serves fixed
    /// thumbnail sizes, so the size cap picks an endpoint instead of
    /// resizing locally.
    pub async fn fetch_artwork(&self, release_id: &str, max_size_px: u32) -> Option<Artwork> {
        if release_id.is_empty() {
            return None;
        }
        let name = artwork_endpoint(max_size_px);
        let url = format!("{COVERART_BASE}/release/{release_id}/{name}");
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            log::debug!("Artwork download failed for release {release_id}");
            return None;
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let data = response.bytes().await.ok()?;
        if data.is_empty() {
            return None;
        }
        Some(Artwork {
            data: data.to_vec(),
            mime,
        })
    }
}

impl Default for MusicBrainzClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Map the configured pixel cap onto the archive's thumbnail endpoints.
fn artwork_endpoint(max_size_px: u32) -> &'static str {
    match max_size_px {
        0..=250 => "front-250",
        251..=500 => "front-500",
        501..=1200 => "front-1200",
        _ => "front",
    }
}

fn escape_lucene(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn credit_name(value: &Value) -> Option<String> {
    let credit = value.get("artist-credit")?.as_array()?;
    let first = credit.first()?;
    first
        .get("artist")
        .and_then(|a| a.get("name"))
        .and_then(|v| v.as_str())
        .or_else(|| first.get("name").and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Parse a recording search response into candidates (without track
/// numbers; those need per-release lookups).
pub fn parse_recording_search(body: &Value) -> Vec<MatchCandidate> {
    let Some(recordings) = body.get("recordings").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    recordings
        .iter()
        .filter_map(|rec| {
            let recording_id = get_str(rec, "id")?;
            let release = rec
                .get("releases")
                .and_then(|v| v.as_array())
                .and_then(|r| r.first());
            let release_date = release.and_then(|r| get_str(r, "date"));
            Some(MatchCandidate {
                recording_id: Some(recording_id),
                title: get_str(rec, "title"),
                artist: credit_name(rec),
                album: release.and_then(|r| get_str(r, "title")),
                album_artist: release.and_then(credit_name),
                track_number: None,
                release_id: release.and_then(|r| get_str(r, "id")),
                year: release_date
                    .as_deref()
                    .and_then(|d| d.split('-').next())
                    .filter(|y| !y.is_empty())
                    .map(str::to_string),
                duration: rec
                    .get("length")
                    .and_then(|v| v.as_u64())
                    .map(|ms| ((ms as f64) / 1000.0).round() as u32),
                acoustid_score: None,
            })
        })
        .collect()
}

/// Find a recording's track position inside a release lookup response.
pub fn find_track_in_release(release: &Value, recording_id: &str) -> Option<u32> {
    let media = release.get("media")?.as_array()?;
    for medium in media {
        let Some(tracks) = medium.get("tracks").and_then(|v| v.as_array()) else {
            continue;
        };
        for track in tracks {
            let id = track
                .get("recording")
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str());
            if id == Some(recording_id) {
                if let Some(position) = track.get("position").and_then(|v| v.as_u64()) {
                    return Some(position as u32);
                }
                return track
                    .get("number")
                    .and_then(|v| v.as_str())
                    .and_then(|n| n.parse().ok());
            }
        }
    }
    None
}

pub struct AcoustIdClient {
    http: reqwest::Client,
}

impl AcoustIdClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fingerprint the file with fpcalc and look it up on AcoustID.
    pub async fn match_recording(
        &self,
        file_path: &Path,
        api_key: &str,
        fpcalc: Option<&Path>,
    ) -> Option<MatchCandidate> {
        let Some(fpcalc) = fpcalc else {
            log::warn!("fpcalc not found; skipping acoustid lookup");
            return None;
        };
        let (duration, fingerprint) = fingerprint_file(fpcalc, file_path).await?;

        let duration_param = duration.to_string();
        let response = self
            .http
            .get(ACOUSTID_LOOKUP)
            .query(&[
                ("client", api_key),
                ("meta", "recordings"),
                ("duration", duration_param.as_str()),
                ("fingerprint", fingerprint.as_str()),
            ])
            .send()
            .await;
        let body: Value = match response {
            Ok(response) if response.status().is_success() => response.json().await.ok()?,
            Ok(response) => {
                log::error!("AcoustID match failed: HTTP {}", response.status());
                return None;
            }
            Err(err) => {
                log::error!("AcoustID match failed: {err}");
                return None;
            }
        };
        parse_acoustid_lookup(&body)
    }
}

impl Default for AcoustIdClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fpcalc -json` and return (duration seconds, fingerprint).
async fn fingerprint_file(fpcalc: &Path, file_path: &Path) -> Option<(u32, String)> {
    let output = Command::new(fpcalc)
        .arg("-json")
        .arg(file_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        log::warn!("fpcalc failed for {}", file_path.display());
        return None;
    }
    let body: Value = serde_json::from_slice(&output.stdout).ok()?;
    let duration = body
        .get("duration")
        .and_then(|v| v.as_f64())
        .map(|d| d.round() as u32)?;
    let fingerprint = get_str(&body, "fingerprint")?;
    Some((duration, fingerprint))
}

/// Pick the highest-score result and its first recording.
pub fn parse_acoustid_lookup(body: &Value) -> Option<MatchCandidate> {
    let results = body.get("results")?.as_array()?;
    let best = results.iter().max_by(|a, b| {
        let sa = a.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let sb = b.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
    })?;
    let score = best.get("score").and_then(|v| v.as_f64());
    let recording = best
        .get("recordings")
        .and_then(|v| v.as_array())
        .and_then(|r| r.first())?;
    let artist = recording
        .get("artists")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|a| a.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Some(MatchCandidate {
        recording_id: get_str(recording, "id"),
        title: get_str(recording, "title"),
        artist,
        acoustid_score: score,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_recording_search() {
        let body = json!({
            "recordings": [
                {
                    "id": "rec-1",
                    "title": "Track Title",
                    "length": 203500,
                    "artist-credit": [{"name": "Artist", "artist": {"name": "Artist"}}],
                    "releases": [{
                        "id": "rel-1",
                        "title": "The Album",
                        "date": "2019-06-01",
                        "artist-credit": [{"artist": {"name": "Artist"}}]
                    }]
                },
                {"title": "no id, dropped"}
            ]
        });
        let candidates = parse_recording_search(&body);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.recording_id.as_deref(), Some("rec-1"));
        assert_eq!(c.artist.as_deref(), Some("Artist"));
        assert_eq!(c.album.as_deref(), Some("The Album"));
        assert_eq!(c.release_id.as_deref(), Some("rel-1"));
        assert_eq!(c.year.as_deref(), Some("2019"));
        assert_eq!(c.duration, Some(204));
    }

    #[test]
    fn test_parse_recording_search_empty() {
        assert!(parse_recording_search(&json!({})).is_empty());
        assert!(parse_recording_search(&json!({"recordings": []})).is_empty());
    }

    #[test]
    fn test_find_track_in_release() {
        let release = json!({
            "media": [
                {"tracks": [
                    {"position": 1, "recording": {"id": "other"}},
                    {"position": 4, "number": "4", "recording": {"id": "rec-1"}}
                ]}
            ]
        });
        assert_eq!(find_track_in_release(&release, "rec-1"), Some(4));
        assert_eq!(find_track_in_release(&release, "missing"), None);
    }

    #[test]
    fn test_parse_acoustid_lookup_prefers_best_score() {
        let body = json!({
            "status": "ok",
            "results": [
                {
                    "score": 0.71,
                    "recordings": [{"id": "low", "title": "Low", "artists": [{"name": "A"}]}]
                },
                {
                    "score": 0.98,
                    "recordings": [{"id": "high", "title": "High", "artists": [{"name": "B"}]}]
                }
            ]
        });
        let hit = parse_acoustid_lookup(&body).unwrap();
        assert_eq!(hit.recording_id.as_deref(), Some("high"));
        assert_eq!(hit.artist.as_deref(), Some("B"));
        assert_eq!(hit.acoustid_score, Some(0.98));
    }

    #[test]
    fn test_parse_acoustid_lookup_empty() {
        assert!(parse_acoustid_lookup(&json!({"results": []})).is_none());
        assert!(parse_acoustid_lookup(&json!({})).is_none());
    }

    #[test]
    fn test_artwork_endpoint_sizing() {
        assert_eq!(artwork_endpoint(250), "front-250");
        assert_eq!(artwork_endpoint(500), "front-500");
        assert_eq!(artwork_endpoint(1500), "front");
        assert_eq!(artwork_endpoint(1200), "front-1200");
    }

    #[test]
    fn test_escape_lucene() {
        assert_eq!(escape_lucene(r#"He said "hi""#), r#"He said \"hi\""#);
    }
}
