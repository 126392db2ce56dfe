//! Candidate scoring
//!
//! Normalized-token similarity with fixed weights, a duration step curve,
//! and multiplicative penalties. Scores are deterministic: ties break by
//! source priority, then URL.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

const WEIGHT_ARTIST: f64 = 0.30;
const WEIGHT_TRACK: f64 = 0.35;
const WEIGHT_ALBUM: f64 = 0.15;
const WEIGHT_DURATION: f64 = 0.15;
const WEIGHT_BONUS: f64 = 0.05;
/// Used when a dimension cannot be judged (missing durations, empty target).
const BASELINE_NEUTRAL: f64 = 0.60;

const PENALTY_TERMS: &[&str] = &["cover", "tribute", "karaoke", "reaction", "8d", "nightcore", "slowed"];
const LIVE_TERMS: &[&str] = &["live"];
const REMASTER_TERMS: &[&str] = &["remaster", "remastered"];

fn feat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(featuring|feat\.?|ft\.?)\b").unwrap())
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\(\[\{][^)\]\}]*[\)\]\}]").unwrap())
}

fn punct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s/&]+").unwrap())
}

/// Full score breakdown, persisted with every candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub score_artist: f64,
    pub score_track: f64,
    pub score_album: f64,
    pub score_duration: f64,
    pub bonus_score: f64,
    pub weighted_sum: f64,
    pub source_modifier: f64,
    pub penalty_multiplier: f64,
    pub final_score: f64,
}

/// What the request is looking for.
#[derive(Debug, Clone, Default)]
pub struct ScoreTarget {
    pub artist: String,
    pub track: String,
    pub album: String,
    pub duration_hint_sec: Option<u32>,
}

/// A raw candidate as collected from the adapters.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub source: String,
    pub url: String,
    pub title: String,
    pub uploader: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    pub duration_sec: Option<u32>,
    pub artwork_url: Option<String>,
    pub source_modifier: f64,
    pub is_official: bool,
}

/// Lowercase, NFKD-normalize, collapse feat markers, strip bracketed noise
/// and punctuation (keeping `/` and `&`), squeeze whitespace.
pub fn normalize_text(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let text: String = value.nfkd().collect();
    let text = text.to_lowercase();
    let text = feat_re().replace_all(&text, "feat");
    let text = bracket_re().replace_all(&text, " ");
    let text = text.replace('_', " ");
    let text = punct_re().replace_all(&text, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokenize(value: &str) -> Vec<String> {
    normalize_text(value)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Tokenization for penalty-term detection: same normalization but without
/// bracket stripping, so "(cover)" and friends stay visible.
fn tokenize_for_penalty(value: &str) -> Vec<String> {
    let text: String = value.nfkd().collect();
    let text = text.to_lowercase();
    let text = feat_re().replace_all(&text, "feat");
    let text = text.replace('_', " ");
    let text = punct_re().replace_all(&text, " ");
    text.split_whitespace().map(str::to_string).collect()
}

pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Token-set similarity: |intersection| / max(|a|, |b|). 1 for identical
/// sets, 0 for disjoint or empty.
pub fn token_similarity(target: &[String], candidate: &[String]) -> f64 {
    if target.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let target_set: HashSet<&str> = target.iter().map(String::as_str).collect();
    let candidate_set: HashSet<&str> = candidate.iter().map(String::as_str).collect();
    let common = target_set.intersection(&candidate_set).count();
    common as f64 / target_set.len().max(candidate_set.len()) as f64
}

/// Step curve over the absolute duration delta in seconds.
pub fn duration_score(target_sec: Option<u32>, candidate_sec: Option<u32>) -> f64 {
    let (Some(target), Some(candidate)) = (target_sec, candidate_sec) else {
        return BASELINE_NEUTRAL;
    };
    let delta = target.abs_diff(candidate);
    match delta {
        0..=2 => 1.0,
        3..=5 => 0.90,
        6..=10 => 0.75,
        11..=20 => 0.50,
        _ => 0.20,
    }
}

fn has_terms(tokens: &[String], terms: &[&str]) -> bool {
    tokens.iter().any(|t| terms.contains(&t.as_str()))
}

fn penalty_multiplier(target_track: &[String], candidate: &[String], artist_score: f64) -> f64 {
    let mut multiplier = 1.0;
    if has_terms(candidate, PENALTY_TERMS) && !has_terms(target_track, PENALTY_TERMS) {
        multiplier *= 0.10;
    }
    if has_terms(candidate, LIVE_TERMS) != has_terms(target_track, LIVE_TERMS) {
        multiplier *= 0.85;
    }
    if has_terms(candidate, REMASTER_TERMS) != has_terms(target_track, REMASTER_TERMS) {
        multiplier *= 0.92;
    }
    if artist_score < 0.50 {
        multiplier *= 0.50;
    }
    multiplier
}

pub fn score_candidate(
    target: &ScoreTarget,
    candidate: &Candidate,
    source_modifier: f64,
) -> ScoreBreakdown {
    let candidate_artist = candidate
        .artist
        .clone()
        .or_else(|| candidate.uploader.clone())
        .unwrap_or_default();
    let candidate_track = candidate
        .track
        .clone()
        .unwrap_or_else(|| candidate.title.clone());
    let candidate_album = candidate.album.clone().unwrap_or_default();

    let target_artist_tokens = tokenize(&target.artist);
    let target_track_tokens = tokenize(&target.track);
    let target_album_tokens = tokenize(&target.album);

    let candidate_artist_tokens = tokenize(&candidate_artist);
    let candidate_track_tokens = tokenize(&candidate_track);
    let candidate_album_tokens = tokenize(&candidate_album);

    let score_artist = token_similarity(&target_artist_tokens, &candidate_artist_tokens);
    let score_track = if target_track_tokens.is_empty() {
        BASELINE_NEUTRAL
    } else {
        token_similarity(&target_track_tokens, &candidate_track_tokens)
    };
    let score_album = if target_album_tokens.is_empty() || candidate_album_tokens.is_empty() {
        BASELINE_NEUTRAL
    } else {
        token_similarity(&target_album_tokens, &candidate_album_tokens)
    };
    let score_duration = duration_score(target.duration_hint_sec, candidate.duration_sec);
    // The bonus dimension rewards source-side verification (an official
    // release flagged by the adapter), not text similarity.
    let bonus_score = if candidate.is_official { 1.0 } else { 0.0 };

    let weighted_sum = clamp01(
        WEIGHT_ARTIST * score_artist
            + WEIGHT_TRACK * score_track
            + WEIGHT_ALBUM * score_album
            + WEIGHT_DURATION * score_duration
            + WEIGHT_BONUS * bonus_score,
    );

    let mut penalty_tokens = tokenize_for_penalty(&candidate_track);
    for token in tokenize_for_penalty(&candidate.title) {
        if !penalty_tokens.contains(&token) {
            penalty_tokens.push(token);
        }
    }
    let target_penalty_tokens = tokenize_for_penalty(&target.track);
    let penalty = penalty_multiplier(&target_penalty_tokens, &penalty_tokens, score_artist);
    let final_score = weighted_sum * source_modifier * penalty;

    ScoreBreakdown {
        score_artist,
        score_track,
        score_album,
        score_duration,
        bonus_score,
        weighted_sum,
        source_modifier,
        penalty_multiplier: penalty,
        final_score,
    }
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub breakdown: ScoreBreakdown,
    /// 1-based.
    pub rank: u32,
}

/// Score and order candidates: best final score first, then source-priority
/// index, then URL lexicographic order.
pub fn rank_candidates(
    target: &ScoreTarget,
    candidates: &[Candidate],
    source_priority: &[String],
) -> Vec<RankedCandidate> {
    let priority_index = |source: &str| {
        source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    };

    let mut scored: Vec<(Candidate, ScoreBreakdown)> = candidates
        .iter()
        .map(|candidate| {
            let breakdown = score_candidate(target, candidate, candidate.source_modifier);
            (candidate.clone(), breakdown)
        })
        .collect();

    scored.sort_by(|(a, ba), (b, bb)| {
        bb.final_score
            .partial_cmp(&ba.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| priority_index(&a.source).cmp(&priority_index(&b.source)))
            .then_with(|| a.url.cmp(&b.url))
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(idx, (candidate, breakdown))| RankedCandidate {
            candidate,
            breakdown,
            rank: idx as u32 + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(artist: &str, track: &str, album: &str) -> ScoreTarget {
        ScoreTarget {
            artist: artist.to_string(),
            track: track.to_string(),
            album: album.to_string(),
            duration_hint_sec: None,
        }
    }

    fn candidate(artist: &str, track: &str, title: &str) -> Candidate {
        Candidate {
            source: "youtube_music".to_string(),
            url: "https://example/c".to_string(),
            title: title.to_string(),
            artist: Some(artist.to_string()),
            track: Some(track.to_string()),
            source_modifier: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(
            normalize_text("Song Title (Official Video) [Lyrics] feat. Artist!"),
            "song title feat artist"
        );
        assert_eq!(tokenize("AC/DC & Friends"), vec!["ac/dc", "&", "friends"]);
    }

    #[test]
    fn test_duration_score_curve() {
        assert_eq!(duration_score(Some(100), Some(102)), 1.0);
        assert_eq!(duration_score(Some(100), Some(104)), 0.90);
        assert_eq!(duration_score(Some(100), Some(108)), 0.75);
        assert_eq!(duration_score(Some(100), Some(112)), 0.50);
        assert_eq!(duration_score(Some(100), Some(130)), 0.20);
        assert_eq!(duration_score(None, Some(100)), 0.60);
        assert_eq!(duration_score(Some(100), None), 0.60);
    }

    #[test]
    fn test_token_similarity() {
        let a = tokenize("harder better faster stronger");
        let b = tokenize("harder better faster stronger");
        assert_eq!(token_similarity(&a, &b), 1.0);
        let c = tokenize("completely different words");
        assert_eq!(token_similarity(&a, &c), 0.0);
        assert!(token_similarity(&a, &tokenize("harder better")) > 0.4);
    }

    #[test]
    fn test_penalty_cover() {
        let t = target("Daft Punk", "Harder Better Faster Stronger", "");
        let c = candidate(
            "Daft Punk",
            "Harder Better Faster Stronger",
            "Harder Better Faster Stronger (cover)",
        );
        let breakdown = score_candidate(&t, &c, 1.0);
        assert_eq!(breakdown.penalty_multiplier, 0.10);
        assert!(breakdown.final_score < breakdown.weighted_sum);
        // The bracketed tag does not hurt the similarity dimension.
        assert_eq!(breakdown.score_track, 1.0);
    }

    #[test]
    fn test_penalty_live_mismatch() {
        let t = target("Artist", "Track", "");
        let mut c = candidate("Artist", "Track live", "Track live");
        c.source_modifier = 1.0;
        let breakdown = score_candidate(&t, &c, 1.0);
        assert!((breakdown.penalty_multiplier - 0.85).abs() < 1e-9);

        // Both live: no penalty.
        let t_live = target("Artist", "Track live", "");
        let breakdown = score_candidate(&t_live, &c, 1.0);
        assert!((breakdown.penalty_multiplier - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_weak_artist() {
        let t = target("Someone Entirely Different", "Track", "");
        let c = candidate("Another Person", "Track", "Track");
        let breakdown = score_candidate(&t, &c, 1.0);
        assert!(breakdown.score_artist < 0.5);
        assert!((breakdown.penalty_multiplier - 0.50).abs() < 1e-9);
    }

    #[test]
    fn test_scoring_monotonicity_in_track_overlap() {
        let t = target("Artist", "one two three four", "");
        let weak = candidate("Artist", "one five six seven", "x");
        let strong = candidate("Artist", "one two three seven", "x");
        let weak_score = score_candidate(&t, &weak, 1.0).final_score;
        let strong_score = score_candidate(&t, &strong, 1.0).final_score;
        assert!(strong_score > weak_score);
    }

    #[test]
    fn test_official_bonus_dimension() {
        let t = target("Artist", "Track", "");
        let unofficial = candidate("Artist", "Track", "Track");
        let mut official = unofficial.clone();
        official.is_official = true;
        let plain = score_candidate(&t, &unofficial, 1.0);
        let boosted = score_candidate(&t, &official, 1.0);
        assert_eq!(plain.bonus_score, 0.0);
        assert_eq!(boosted.bonus_score, 1.0);
        assert!((boosted.weighted_sum - plain.weighted_sum - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_neutral_baselines_for_empty_targets() {
        let t = target("Artist", "", "");
        let c = candidate("Artist", "Whatever", "Whatever");
        let breakdown = score_candidate(&t, &c, 1.0);
        assert_eq!(breakdown.score_track, 0.60);
        assert_eq!(breakdown.score_album, 0.60);
    }

    #[test]
    fn test_rank_candidates_prefers_modifier_then_priority() {
        let t = target("Artist", "Track", "");
        let mut a = candidate("Artist", "Track", "Track");
        a.source = "bandcamp".to_string();
        a.url = "https://example.com/a".to_string();
        a.source_modifier = 1.05;
        let mut b = candidate("Artist", "Track", "Track");
        b.source = "soundcloud".to_string();
        b.url = "https://example.com/b".to_string();
        b.source_modifier = 0.95;

        let ranked = rank_candidates(
            &t,
            &[b.clone(), a.clone()],
            &["bandcamp".to_string(), "soundcloud".to_string()],
        );
        assert_eq!(ranked[0].candidate.url, "https://example.com/a");
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn test_rank_tie_breaks_by_priority_then_url() {
        let t = target("Artist", "Track", "");
        let mut a = candidate("Artist", "Track", "Track");
        a.source = "soundcloud".to_string();
        a.url = "https://example.com/z".to_string();
        let mut b = candidate("Artist", "Track", "Track");
        b.source = "bandcamp".to_string();
        b.url = "https://example.com/m".to_string();
        let mut c = candidate("Artist", "Track", "Track");
        c.source = "bandcamp".to_string();
        c.url = "https://example.com/a".to_string();

        let ranked = rank_candidates(
            &t,
            &[a, b, c],
            &["bandcamp".to_string(), "soundcloud".to_string()],
        );
        assert_eq!(ranked[0].candidate.url, "https://example.com/a");
        assert_eq!(ranked[1].candidate.url, "https://example.com/m");
        assert_eq!(ranked[2].candidate.url, "https://example.com/z");
    }
}
