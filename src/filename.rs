//! Filename construction
//!
//! Every value that ends up in a library filename passes through
//! `sanitize_for_filesystem`: no characters that are unsafe on any common
//! filesystem, no control characters, normalized whitespace, NFC
//! normalization, at most 180 codepoints.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::models::ItemMetadata;

const MAX_FILENAME_CODEPOINTS: usize = 180;

fn music_title_clean_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\s*[\(\[\{][^)\]\}]*?(official|music video|video|lyric|audio|visualizer|full video|hd|4k)[^)\]\}]*?[\)\]\}]\s*",
        )
        .unwrap()
    })
}

fn music_title_trail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s*-\s*(official|music video|video|lyric|audio|visualizer|full video).*$")
            .unwrap()
    })
}

fn template_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\((\w+)\)s").unwrap())
}

/// Remove characters unsafe for filenames and trim length.
///
/// Whitespace collapses before the scrub: the filename crate deletes
/// control characters outright, which would otherwise glue words together.
pub fn sanitize_for_filesystem(name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let scrubbed = sanitize_filename::sanitize(collapsed);
    let cleaned: String = scrubbed
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let normalized: String = collapsed.nfc().collect();
    if normalized.chars().count() > MAX_FILENAME_CODEPOINTS {
        normalized
            .chars()
            .take(MAX_FILENAME_CODEPOINTS)
            .collect::<String>()
            .trim_end()
            .to_string()
    } else {
        normalized
    }
}

/// Cleaner filename for media servers: `Title - Channel (MM-YYYY)`.
pub fn pretty_filename(title: &str, channel: &str, upload_date: &str) -> String {
    let title_s = sanitize_for_filesystem(title);
    let channel_s = sanitize_for_filesystem(channel);
    if upload_date.len() == 8 && upload_date.chars().all(|c| c.is_ascii_digit()) {
        let yyyy = &upload_date[0..4];
        let mm = &upload_date[4..6];
        format!("{title_s} - {channel_s} ({mm}-{yyyy})")
    } else {
        format!("{title_s} - {channel_s}")
    }
}

/// Render a `%(key)s` template. Returns None when the template references an
/// unknown key, so callers can fall back to the default layout.
fn render_template(template: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    let mut missing = false;
    let rendered = template_key_re().replace_all(template, |caps: &regex::Captures| {
        match lookup(&caps[1]) {
            Some(value) => value,
            None => {
                missing = true;
                String::new()
            }
        }
    });
    if missing {
        None
    } else {
        Some(rendered.trim_start_matches(['/', '\\']).to_string())
    }
}

pub fn normalize_track_number(value: Option<u32>) -> Option<u32> {
    value.filter(|n| *n > 0)
}

pub fn format_track_number(value: Option<u32>) -> Option<String> {
    normalize_track_number(value).map(|n| format!("{n:02}"))
}

/// Strip bracketed descriptor noise and trailing "- Official ..." suffixes
/// from a music title.
pub fn clean_music_title(value: &str) -> String {
    let cleaned = music_title_clean_re().replace_all(value, " ");
    let cleaned = music_title_trail_re().replace(&cleaned, "");
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip @handles and trailing "VEVO" from a channel acting as artist.
pub fn clean_music_artist(value: &str) -> String {
    let mut cleaned = value.trim();
    cleaned = cleaned.trim_start_matches('@').trim();
    let lower = cleaned.to_lowercase();
    if lower.ends_with("vevo") {
        cleaned = cleaned[..cleaned.len() - 4].trim_end();
    }
    cleaned.to_string()
}

/// Music layout: template if usable, else `Artist/Album/NN - Track.ext`.
pub fn build_music_filename(
    meta: &ItemMetadata,
    ext: &str,
    template: Option<&str>,
    fallback_id: &str,
) -> PathBuf {
    let artist = sanitize_for_filesystem(&clean_music_artist(meta.artist.as_deref().unwrap_or("")));
    let album = sanitize_for_filesystem(&clean_music_title(meta.album.as_deref().unwrap_or("")));
    let track_src = meta
        .track
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or(meta.title.as_deref())
        .unwrap_or("");
    let track = sanitize_for_filesystem(&clean_music_title(track_src));
    let track_number = format_track_number(meta.track_number);
    let album_artist = sanitize_for_filesystem(meta.album_artist.as_deref().unwrap_or(""));
    let disc = normalize_track_number(meta.disc);
    let release_date = sanitize_for_filesystem(meta.release_date.as_deref().unwrap_or(""));

    if let Some(template) = template {
        let rendered = render_template(template, |key| match key {
            "artist" => Some(artist.clone()),
            "album" => Some(album.clone()),
            "track" => Some(track.clone()),
            "track_number" => Some(track_number.clone().unwrap_or_default()),
            "album_artist" => Some(album_artist.clone()),
            "disc" => Some(disc.map(|d| d.to_string()).unwrap_or_default()),
            "release_date" => Some(release_date.clone()),
            "ext" => Some(ext.to_string()),
            _ => None,
        });
        if let Some(name) = rendered {
            return PathBuf::from(name);
        }
    }

    let mut filename = if track.is_empty() {
        fallback_id.to_string()
    } else {
        track
    };
    if let Some(num) = track_number {
        filename = format!("{num} - {filename}");
    }
    filename = format!("{filename}.{ext}");

    if !artist.is_empty() && !album.is_empty() {
        PathBuf::from(artist).join(album).join(filename)
    } else if !artist.is_empty() {
        PathBuf::from(artist).join(filename)
    } else {
        PathBuf::from(filename)
    }
}

/// Compute the final library-relative filename for an item.
pub fn build_output_filename(
    meta: &ItemMetadata,
    item_id: &str,
    ext: &str,
    template: Option<&str>,
    music_mode: bool,
) -> PathBuf {
    if music_mode {
        return build_music_filename(meta, ext, template, item_id);
    }

    let title = meta.title.as_deref().filter(|t| !t.is_empty()).unwrap_or(item_id);
    let channel = meta.channel.as_deref().unwrap_or("");
    let upload_date = meta.upload_date.as_deref().unwrap_or("");

    if let Some(template) = template {
        let rendered = render_template(template, |key| match key {
            "title" => Some(sanitize_for_filesystem(title)),
            "uploader" => Some(sanitize_for_filesystem(channel)),
            "upload_date" => Some(upload_date.to_string()),
            "ext" => Some(ext.to_string()),
            _ => None,
        });
        if let Some(name) = rendered {
            return PathBuf::from(name);
        }
    }

    let id8: String = item_id.chars().take(8).collect();
    PathBuf::from(format!(
        "{}_{id8}.{ext}",
        pretty_filename(title, channel, upload_date)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_unsafe_chars() {
        let out = sanitize_for_filesystem("a/b\\c:d*e?f\"g<h>i|j");
        for c in ['\\', '/', ':', '*', '?', '"', '<', '>', '|'] {
            assert!(!out.contains(c), "kept {c:?} in {out:?}");
        }
        assert!(out.contains('a') && out.contains('j'));
    }

    #[test]
    fn test_sanitize_strips_controls_and_collapses_whitespace() {
        let out = sanitize_for_filesystem("hello\u{0007}   world\n\ttabs");
        assert_eq!(out, "hello world tabs");
    }

    #[test]
    fn test_sanitize_length_cap() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_for_filesystem(&long).chars().count(), 180);
    }

    #[test]
    fn test_sanitize_unicode_nfc() {
        // decomposed e + combining acute -> composed é
        let out = sanitize_for_filesystem("Cafe\u{0301}");
        assert_eq!(out, "Café");
    }

    #[test]
    fn test_pretty_filename_date_layout() {
        assert_eq!(
            pretty_filename("Title", "Channel", "20240315"),
            "Title - Channel (03-2024)"
        );
        assert_eq!(pretty_filename("Title", "Channel", ""), "Title - Channel");
    }

    #[test]
    fn test_default_video_filename() {
        let meta = ItemMetadata {
            item_id: "dQw4w9WgXcQ".into(),
            title: Some("Never Gonna Give You Up".into()),
            channel: Some("Rick Astley".into()),
            upload_date: Some("20091025".into()),
            ..Default::default()
        };
        let name = build_output_filename(&meta, "dQw4w9WgXcQ", "webm", None, false);
        assert_eq!(
            name.to_str().unwrap(),
            "Never Gonna Give You Up - Rick Astley (10-2009)_dQw4w9Wg.webm"
        );
    }

    #[test]
    fn test_template_rendering() {
        let meta = ItemMetadata {
            item_id: "v1".into(),
            title: Some("A Video".into()),
            channel: Some("Someone".into()),
            upload_date: Some("20240101".into()),
            ..Default::default()
        };
        let name = build_output_filename(&meta, "v1", "mp4", Some("%(uploader)s/%(title)s.%(ext)s"), false);
        assert_eq!(name.to_str().unwrap(), "Someone/A Video.mp4");
    }

    #[test]
    fn test_template_unknown_key_falls_back() {
        let meta = ItemMetadata {
            item_id: "v1".into(),
            title: Some("A Video".into()),
            ..Default::default()
        };
        let name = build_output_filename(&meta, "v1", "mp4", Some("%(bogus)s.%(ext)s"), false);
        assert!(name.to_str().unwrap().contains("A Video"));
    }

    #[test]
    fn test_music_default_layout() {
        let meta = ItemMetadata {
            item_id: "v1".into(),
            artist: Some("ArtistVEVO".into()),
            album: Some("The Album".into()),
            track: Some("The Track (Official Video)".into()),
            track_number: Some(3),
            ..Default::default()
        };
        let name = build_output_filename(&meta, "v1", "m4a", None, true);
        assert_eq!(name.to_str().unwrap(), "Artist/The Album/03 - The Track.m4a");
    }

    #[test]
    fn test_music_title_cleanup() {
        assert_eq!(
            clean_music_title("Song Name (Official Music Video) [4K]"),
            "Song Name"
        );
        assert_eq!(clean_music_title("Song - Official Audio"), "Song");
        assert_eq!(clean_music_artist("@SomeBandVEVO"), "SomeBand");
    }

    #[test]
    fn test_track_number_formatting() {
        assert_eq!(format_track_number(Some(7)).as_deref(), Some("07"));
        assert_eq!(format_track_number(Some(12)).as_deref(), Some("12"));
        assert_eq!(format_track_number(Some(0)), None);
        assert_eq!(format_track_number(None), None);
    }
}
