use url::Url;

/// Best-effort item id extraction from a watch URL.
///
/// Handles `watch?v=`, `youtu.be/<id>`, and `shorts/<id>` shapes; anything
/// else returns None and callers fall back to treating the input as an id.
pub fn extract_item_id(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();

    if host.contains("youtu.be") {
        let id = parsed.path().trim_matches('/').split('/').next()?;
        if !id.is_empty() {
            return Some(id.to_string());
        }
        return None;
    }

    if let Some((_, v)) = parsed.query_pairs().find(|(k, _)| k == "v") {
        if !v.is_empty() {
            return Some(v.into_owned());
        }
    }

    let mut segments = parsed.path_segments()?;
    if segments.next() == Some("shorts") {
        if let Some(id) = segments.next().filter(|s| !s.is_empty()) {
            return Some(id.to_string());
        }
    }
    None
}

pub fn is_music_url(raw: &str) -> bool {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.contains("music.youtube.com")))
        .unwrap_or(false)
}

/// Build the canonical download URL for an item.
///
/// Music mode pins the music host so the extractor surfaces the richer
/// album/track fields; otherwise an existing http(s) source URL wins.
pub fn build_download_url(item_id: &str, music_mode: bool, source_url: Option<&str>) -> String {
    let id = source_url
        .and_then(extract_item_id)
        .unwrap_or_else(|| item_id.to_string());
    if music_mode {
        return format!("https://music.youtube.com/watch?v={id}");
    }
    if let Some(src) = source_url {
        if src.starts_with("http://") || src.starts_with("https://") {
            return src.to_string();
        }
    }
    format!("https://www.youtube.com/watch?v={id}")
}

pub fn build_playlist_url(playlist_id: &str) -> String {
    format!("https://www.youtube.com/playlist?list={playlist_id}")
}

/// Normalize an http(s) URL for queue dedup keys: lowercase host, no
/// fragment, no default port. Non-http schemes return None.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.set_fragment(None);
    if let Some(host) = url.host_str() {
        let lower = host.to_ascii_lowercase();
        if lower != host {
            url.set_host(Some(&lower)).ok()?;
        }
    }
    let is_default_port = matches!(
        (url.scheme(), url.port()),
        ("http", Some(80)) | ("https", Some(443))
    );
    if is_default_port {
        let _ = url.set_port(None);
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_watch_url() {
        assert_eq!(
            extract_item_id("https://www.youtube.com/watch?v=abc123XYZ_-"),
            Some("abc123XYZ_-".to_string())
        );
    }

    #[test]
    fn test_extract_short_link() {
        assert_eq!(
            extract_item_id("https://youtu.be/abc123/extra"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn test_extract_rejects_plain_id() {
        assert_eq!(extract_item_id("abc123"), None);
    }

    #[test]
    fn test_music_url_detection() {
        assert!(is_music_url("https://music.youtube.com/watch?v=x"));
        assert!(!is_music_url("https://www.youtube.com/watch?v=x"));
    }

    #[test]
    fn test_build_download_url_music_pins_host() {
        let url = build_download_url("abc", true, Some("https://www.youtube.com/watch?v=abc"));
        assert_eq!(url, "https://music.youtube.com/watch?v=abc");
    }

    #[test]
    fn test_build_download_url_prefers_source() {
        let url = build_download_url("abc", false, Some("https://example.test/watch?v=zzz"));
        assert_eq!(url, "https://example.test/watch?v=zzz");
    }

    #[test]
    fn test_normalize_strips_fragment_and_port() {
        assert_eq!(
            normalize_http_url("https://Example.COM:443/a#frag").as_deref(),
            Some("https://example.com/a")
        );
        assert_eq!(normalize_http_url("ftp://example.com/a"), None);
    }
}
