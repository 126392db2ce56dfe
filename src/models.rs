use serde::{Deserialize, Serialize};

/// Where a finalized file ends up: the server library, or a short-lived
/// client-delivery handle for one-shot pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Server,
    Client,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Server => "server",
            DeliveryMode::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "server" => DeliveryMode::Server,
            "client" => DeliveryMode::Client,
            _ => return None,
        })
    }
}

/// One entry surfaced by playlist enumeration (API or public fallback).
#[derive(Debug, Clone, Default)]
pub struct PlaylistItem {
    pub item_id: String,
    /// The remote playlist-entry id, needed for remove-after-download.
    pub entry_id: Option<String>,
    /// Explicit position in the playlist's native ordering, when provided.
    pub position: Option<u32>,
    pub url: Option<String>,
    pub title: Option<String>,
}

/// Normalized per-item metadata assembled from the platform API and/or the
/// toolkit's extract-only fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub item_id: String,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track: Option<String>,
    pub track_number: Option<u32>,
    pub disc: Option<u32>,
    pub release_date: Option<String>,
    /// YYYYMMDD.
    pub upload_date: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl ItemMetadata {
    /// Stub used when every metadata source failed; downstream naming falls
    /// back to the item id.
    pub fn stub(item_id: &str, url: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    /// Overlay richer music fields from `other`, preferring non-empty values
    /// already present on `self`.
    pub fn overlay_music_fields(&mut self, other: &ItemMetadata) {
        fn fill(dst: &mut Option<String>, src: &Option<String>) {
            let empty = dst.as_deref().map_or(true, |s| s.trim().is_empty());
            if empty {
                if let Some(v) = src.as_deref() {
                    if !v.trim().is_empty() {
                        *dst = Some(v.to_string());
                    }
                }
            }
        }
        fill(&mut self.artist, &other.artist);
        fill(&mut self.album, &other.album);
        fill(&mut self.album_artist, &other.album_artist);
        fill(&mut self.track, &other.track);
        fill(&mut self.release_date, &other.release_date);
        if self.track_number.is_none() {
            self.track_number = other.track_number;
        }
        if self.disc.is_none() {
            self.disc = other.disc;
        }
        if self.thumbnail_url.is_none() {
            self.thumbnail_url = other.thumbnail_url.clone();
        }
    }

    pub fn display_label(&self) -> String {
        self.title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.item_id.clone())
    }
}

/// Best-effort transfer progress; any field may be absent depending on what
/// the toolkit reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TransferProgress {
    pub percent: Option<u32>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub speed_bps: Option<f64>,
    pub eta_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_existing() {
        let mut meta = ItemMetadata {
            item_id: "v1".into(),
            artist: Some("API Artist".into()),
            album: Some("".into()),
            ..Default::default()
        };
        let fallback = ItemMetadata {
            item_id: "v1".into(),
            artist: Some("Fallback Artist".into()),
            album: Some("Fallback Album".into()),
            track_number: Some(3),
            ..Default::default()
        };
        meta.overlay_music_fields(&fallback);
        assert_eq!(meta.artist.as_deref(), Some("API Artist"));
        assert_eq!(meta.album.as_deref(), Some("Fallback Album"));
        assert_eq!(meta.track_number, Some(3));
    }

    #[test]
    fn test_delivery_mode_roundtrip() {
        assert_eq!(DeliveryMode::parse("client"), Some(DeliveryMode::Client));
        assert_eq!(DeliveryMode::Client.as_str(), "client");
        assert_eq!(DeliveryMode::parse("peer"), None);
    }
}
