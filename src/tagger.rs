//! Music file tagging
//!
//! Writes canonical tags straight into the audio container: ID3 frames for
//! MP3, iTunes-style atoms for M4A/MP4. This is richer than the copy-only
//! ffmpeg embed the video path uses; it runs after a confident metadata
//! match and can overwrite extractor-supplied tags.

use std::path::Path;

use anyhow::{Context, Result};
use id3::TagLike;

/// The canonical tag set produced by a metadata match.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<u32>,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub recording_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Artwork {
    pub data: Vec<u8>,
    pub mime: String,
}

const SOURCE_TAG: &str = "YouTube";

/// Apply `tags` (and optionally cover art) to `file_path` in place.
///
/// `allow_overwrite` guards every field: when false, only empty fields are
/// filled. Dry-run logs the would-be tags and touches nothing.
pub fn apply_tags(
    file_path: &Path,
    tags: &TagSet,
    artwork: Option<&Artwork>,
    source_title: Option<&str>,
    allow_overwrite: bool,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        log::info!(
            "Music metadata dry-run tags for {}: {}",
            file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            format_tags(tags)
        );
        return Ok(());
    }

    let ext = file_path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => apply_id3_tags(file_path, tags, artwork, source_title, allow_overwrite),
        "m4a" | "mp4" | "m4b" => apply_mp4_tags(file_path, tags, artwork, source_title, allow_overwrite),
        other => {
            log::warn!(
                "Music metadata tagging skipped: unsupported container .{other} ({})",
                file_path.display()
            );
            Ok(())
        }
    }
}

fn has_value(value: Option<&String>) -> bool {
    value.map_or(false, |v| !v.is_empty())
}

fn apply_id3_tags(
    file_path: &Path,
    tags: &TagSet,
    artwork: Option<&Artwork>,
    source_title: Option<&str>,
    allow_overwrite: bool,
) -> Result<()> {
    let mut tag = id3::Tag::read_from_path(file_path).unwrap_or_else(|_| id3::Tag::new());
    let mut changed = false;

    if let Some(artist) = tags.artist.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.artist().map_or(true, str::is_empty) {
            tag.set_artist(artist);
            changed = true;
        }
    }
    if let Some(album) = tags.album.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.album().map_or(true, str::is_empty) {
            tag.set_album(album);
            changed = true;
        }
    }
    if let Some(title) = tags.title.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.title().map_or(true, str::is_empty) {
            tag.set_title(title);
            changed = true;
        }
    }
    if let Some(album_artist) = tags.album_artist.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.album_artist().map_or(true, str::is_empty) {
            tag.set_album_artist(album_artist);
            changed = true;
        }
    }
    if let Some(track) = tags.track_number {
        if allow_overwrite || tag.track().is_none() {
            tag.set_track(track);
            changed = true;
        }
    }
    if let Some(year) = tags.year.as_deref().and_then(|y| y.parse::<i32>().ok()) {
        if allow_overwrite || tag.date_recorded().is_none() {
            tag.set_date_recorded(id3::Timestamp {
                year,
                month: None,
                day: None,
                hour: None,
                minute: None,
                second: None,
            });
            changed = true;
        }
    }
    if let Some(genre) = tags.genre.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.genre().map_or(true, str::is_empty) {
            tag.set_genre(genre);
            changed = true;
        }
    }

    changed |= set_id3_extended_text(&mut tag, "SOURCE", SOURCE_TAG, allow_overwrite);
    if let Some(source_title) = source_title.filter(|v| !v.is_empty()) {
        changed |= set_id3_extended_text(&mut tag, "SOURCE_TITLE", source_title, allow_overwrite);
    }
    if let Some(recording_id) = tags.recording_id.as_deref().filter(|v| !v.is_empty()) {
        changed |= set_id3_extended_text(&mut tag, "MBID", recording_id, allow_overwrite);
    }

    if let Some(artwork) = artwork {
        let has_cover = tag.pictures().any(|p| {
            p.picture_type == id3::frame::PictureType::CoverFront
        });
        if allow_overwrite || !has_cover {
            if has_cover {
                tag.remove_picture_by_type(id3::frame::PictureType::CoverFront);
            }
            tag.add_frame(id3::frame::Picture {
                mime_type: artwork.mime.clone(),
                picture_type: id3::frame::PictureType::CoverFront,
                description: "cover".to_string(),
                data: artwork.data.clone(),
            });
            changed = true;
        }
    }

    if changed {
        tag.write_to_path(file_path, id3::Version::Id3v24)
            .with_context(|| format!("write id3 tags: {}", file_path.display()))?;
    }
    Ok(())
}

fn set_id3_extended_text(tag: &mut id3::Tag, description: &str, value: &str, allow_overwrite: bool) -> bool {
    let exists = tag
        .extended_texts()
        .any(|t| t.description == description);
    if exists && !allow_overwrite {
        return false;
    }
    if exists {
        tag.remove_extended_text(Some(description), None);
    }
    tag.add_frame(id3::frame::ExtendedText {
        description: description.to_string(),
        value: value.to_string(),
    });
    true
}

fn apply_mp4_tags(
    file_path: &Path,
    tags: &TagSet,
    artwork: Option<&Artwork>,
    source_title: Option<&str>,
    allow_overwrite: bool,
) -> Result<()> {
    let mut tag = mp4ameta::Tag::read_from_path(file_path)
        .with_context(|| format!("read mp4 tags: {}", file_path.display()))?;
    let mut changed = false;

    if let Some(artist) = tags.artist.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.artist().is_none() {
            tag.set_artist(artist);
            changed = true;
        }
    }
    if let Some(album) = tags.album.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.album().is_none() {
            tag.set_album(album);
            changed = true;
        }
    }
    if let Some(title) = tags.title.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.title().is_none() {
            tag.set_title(title);
            changed = true;
        }
    }
    if let Some(album_artist) = tags.album_artist.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.album_artist().is_none() {
            tag.set_album_artist(album_artist);
            changed = true;
        }
    }
    if let Some(track) = tags.track_number {
        if allow_overwrite || tag.track_number().is_none() {
            tag.set_track_number(track.min(u16::MAX as u32) as u16);
            changed = true;
        }
    }
    if let Some(year) = tags.year.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.year().is_none() {
            tag.set_year(year.to_string());
            changed = true;
        }
    }
    if let Some(genre) = tags.genre.as_deref().filter(|v| !v.is_empty()) {
        if allow_overwrite || tag.genre().is_none() {
            tag.set_genre(genre);
            changed = true;
        }
    }

    changed |= set_mp4_freeform(&mut tag, "SOURCE", SOURCE_TAG, allow_overwrite);
    if let Some(source_title) = source_title.filter(|v| !v.is_empty()) {
        changed |= set_mp4_freeform(&mut tag, "SOURCE_TITLE", source_title, allow_overwrite);
    }
    if let Some(recording_id) = tags.recording_id.as_deref().filter(|v| !v.is_empty()) {
        changed |= set_mp4_freeform(&mut tag, "MBID", recording_id, allow_overwrite);
    }

    if let Some(artwork) = artwork {
        if allow_overwrite || tag.artwork().is_none() {
            let fmt = if artwork.mime.ends_with("png") {
                mp4ameta::ImgFmt::Png
            } else {
                mp4ameta::ImgFmt::Jpeg
            };
            tag.set_artwork(mp4ameta::Img::new(fmt, artwork.data.clone()));
            changed = true;
        }
    }

    if changed {
        tag.write_to_path(file_path)
            .with_context(|| format!("write mp4 tags: {}", file_path.display()))?;
    }
    Ok(())
}

fn set_mp4_freeform(tag: &mut mp4ameta::Tag, name: &str, value: &str, allow_overwrite: bool) -> bool {
    let ident = mp4ameta::FreeformIdent::new("com.apple.iTunes", name);
    let exists = tag.data_of(&ident).next().is_some();
    if exists && !allow_overwrite {
        return false;
    }
    tag.set_data(ident, mp4ameta::Data::Utf8(value.to_string()));
    true
}

fn format_tags(tags: &TagSet) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (key, value) in [
        ("artist", &tags.artist),
        ("album", &tags.album),
        ("title", &tags.title),
        ("album_artist", &tags.album_artist),
        ("year", &tags.year),
        ("genre", &tags.genre),
        ("recording_id", &tags.recording_id),
    ] {
        if has_value(value.as_ref()) {
            parts.push(format!("{key}={}", value.as_deref().unwrap_or_default()));
        }
    }
    if let Some(track) = tags.track_number {
        parts.push(format!("track_number={track}"));
    }
    format!("{{{}}}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tags() -> TagSet {
        TagSet {
            artist: Some("Artist".into()),
            album: Some("Album".into()),
            title: Some("Title".into()),
            album_artist: Some("Artist".into()),
            track_number: Some(3),
            year: Some("2019".into()),
            genre: Some("Electronic".into()),
            recording_id: Some("mbid-1234".into()),
        }
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("song.mp3");
        std::fs::write(&path, b"").unwrap();
        apply_tags(&path, &sample_tags(), None, Some("Source Title"), true, true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_unsupported_container_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("song.opus");
        std::fs::write(&path, b"OggS").unwrap();
        apply_tags(&path, &sample_tags(), None, None, true, false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"OggS");
    }

    #[test]
    fn test_id3_roundtrip_and_overwrite_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("song.mp3");
        std::fs::write(&path, b"").unwrap();

        apply_tags(&path, &sample_tags(), None, Some("Raw Upload Title"), true, false).unwrap();

        let tag = id3::Tag::read_from_path(&path).unwrap();
        assert_eq!(tag.artist(), Some("Artist"));
        assert_eq!(tag.album(), Some("Album"));
        assert_eq!(tag.title(), Some("Title"));
        assert_eq!(tag.track(), Some(3));
        assert_eq!(tag.genre(), Some("Electronic"));
        assert!(tag
            .extended_texts()
            .any(|t| t.description == "MBID" && t.value == "mbid-1234"));
        assert!(tag
            .extended_texts()
            .any(|t| t.description == "SOURCE_TITLE" && t.value == "Raw Upload Title"));

        // With overwrite disabled, existing fields survive.
        let mut other = sample_tags();
        other.artist = Some("Somebody Else".into());
        apply_tags(&path, &other, None, None, false, false).unwrap();
        let tag = id3::Tag::read_from_path(&path).unwrap();
        assert_eq!(tag.artist(), Some("Artist"));

        // With overwrite enabled, they are replaced.
        apply_tags(&path, &other, None, None, true, false).unwrap();
        let tag = id3::Tag::read_from_path(&path).unwrap();
        assert_eq!(tag.artist(), Some("Somebody Else"));
    }

    #[test]
    fn test_id3_artwork_embed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("song.mp3");
        std::fs::write(&path, b"").unwrap();

        let artwork = Artwork {
            data: vec![0xFF, 0xD8, 0xFF, 0xE0],
            mime: "image/jpeg".to_string(),
        };
        apply_tags(&path, &sample_tags(), Some(&artwork), None, true, false).unwrap();

        let tag = id3::Tag::read_from_path(&path).unwrap();
        let cover = tag
            .pictures()
            .find(|p| p.picture_type == id3::frame::PictureType::CoverFront)
            .unwrap();
        assert_eq!(cover.mime_type, "image/jpeg");
        assert_eq!(cover.data, vec![0xFF, 0xD8, 0xFF, 0xE0]);
    }

    #[test]
    fn test_format_tags_compact() {
        let rendered = format_tags(&TagSet {
            artist: Some("Artist".into()),
            track_number: Some(7),
            ..Default::default()
        });
        assert!(rendered.contains("artist=Artist"));
        assert!(rendered.contains("track_number=7"));
        assert!(!rendered.contains("album="));
    }
}
