//! Search source adapters
//!
//! Each adapter exposes the capability set {search_track, search_album,
//! expand_album_to_tracks, source_modifier} and is registered under its
//! source name. The built-ins ship the source modifiers; their search
//! calls are wired up per deployment (a plain adapter returns nothing,
//! which simply removes the source from consideration).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::search_scoring::Candidate;

/// A raw search hit before scoring.
#[derive(Debug, Clone, Default)]
pub struct AdapterHit {
    pub url: String,
    pub title: String,
    pub uploader: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    pub duration_sec: Option<u32>,
    pub artwork_url: Option<String>,
    pub is_official: bool,
}

impl AdapterHit {
    /// Attach the source name and modifier to produce a scorable candidate.
    pub fn into_candidate(self, source: &str, source_modifier: f64) -> Candidate {
        Candidate {
            source: source.to_string(),
            url: self.url,
            title: self.title,
            uploader: self.uploader,
            artist: self.artist,
            album: self.album,
            track: self.track,
            duration_sec: self.duration_sec,
            artwork_url: self.artwork_url,
            source_modifier,
            is_official: self.is_official,
        }
    }
}

pub trait SearchAdapter: Send + Sync {
    fn source_name(&self) -> &'static str;

    fn search_track(
        &self,
        _artist: &str,
        _track: &str,
        _album: Option<&str>,
        _limit: u32,
    ) -> Result<Vec<AdapterHit>> {
        Ok(Vec::new())
    }

    fn search_album(&self, _artist: &str, _album: &str, _limit: u32) -> Result<Vec<AdapterHit>> {
        Ok(Vec::new())
    }

    /// Optional capability: expand an album candidate into its tracks.
    fn expand_album_to_tracks(&self, _album: &AdapterHit) -> Option<Vec<AdapterHit>> {
        None
    }

    fn source_modifier(&self, _hit: &AdapterHit) -> f64 {
        1.0
    }
}

pub type AdapterRegistry = HashMap<String, Arc<dyn SearchAdapter>>;

/// Catalog-native source: slight boost.
pub struct BandcampAdapter;

impl SearchAdapter for BandcampAdapter {
    fn source_name(&self) -> &'static str {
        "bandcamp"
    }

    fn source_modifier(&self, _hit: &AdapterHit) -> f64 {
        1.05
    }
}

/// Official music source when the hit is flagged official; otherwise scored
/// like a generic upload.
pub struct YouTubeMusicAdapter;

impl SearchAdapter for YouTubeMusicAdapter {
    fn source_name(&self) -> &'static str {
        "youtube_music"
    }

    fn source_modifier(&self, hit: &AdapterHit) -> f64 {
        if hit.is_official {
            1.0
        } else {
            0.90
        }
    }
}

/// General audio source: slight discount.
pub struct SoundCloudAdapter;

impl SearchAdapter for SoundCloudAdapter {
    fn source_name(&self) -> &'static str {
        "soundcloud"
    }

    fn source_modifier(&self, _hit: &AdapterHit) -> f64 {
        0.95
    }
}

pub fn default_registry() -> AdapterRegistry {
    let adapters: [Arc<dyn SearchAdapter>; 3] = [
        Arc::new(BandcampAdapter),
        Arc::new(YouTubeMusicAdapter),
        Arc::new(SoundCloudAdapter),
    ];
    adapters
        .into_iter()
        .map(|a| (a.source_name().to_string(), a))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_sources() {
        let registry = default_registry();
        assert!(registry.contains_key("bandcamp"));
        assert!(registry.contains_key("youtube_music"));
        assert!(registry.contains_key("soundcloud"));
    }

    #[test]
    fn test_source_modifiers() {
        let hit = AdapterHit::default();
        let official = AdapterHit {
            is_official: true,
            ..Default::default()
        };
        assert_eq!(BandcampAdapter.source_modifier(&hit), 1.05);
        assert_eq!(SoundCloudAdapter.source_modifier(&hit), 0.95);
        assert_eq!(YouTubeMusicAdapter.source_modifier(&hit), 0.90);
        assert_eq!(YouTubeMusicAdapter.source_modifier(&official), 1.0);
    }
}
