//! Title normalization and release name parsing.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

static SEASON_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^s(\d{1,2})(?:e(\d{1,3}))?(?:e\d{1,3})*$").unwrap());

static CROSS_EPISODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})x(\d{1,3})$").unwrap());

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:19|20)\d{2}$").unwrap());

static RESOLUTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3,4}[pi]$").unwrap());

/// Release tags that never belong to a title.
const NOISE: &[&str] = &[
    "4k", "uhd", "hdr", "hdr10", "dv", "sdr", "x264", "x265", "h264", "h265", "hevc", "avc",
    "xvid", "web", "webrip", "webdl", "dl", "bluray", "bdrip", "brrip", "hdtv", "dvdrip", "remux",
    "aac", "ac3", "eac3", "dts", "ddp", "dd", "atmos", "truehd", "10bit", "proper", "repack",
    "internal", "multi", "complete", "amzn", "nf", "dsnp", "hmax", "atvp",
];

/// Words dropped from titles before comparison.
const STOPWORDS: &[&str] = &["the", "a", "an", "and", "of"];

/// Words that introduce a season or episode number.
const MARKER_WORDS: &[&str] = &["season", "series", "episode", "ep"];

/// Title, season and episode pulled out of a release name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRelease {
    pub title: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub year: Option<u32>,
}

fn split_tokens(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn is_noise(token: &str) -> bool {
    NOISE.contains(&token) || RESOLUTION.is_match(token)
}

/// Season/episode numbers encoded in a single token, e.g. `s01e02` or `1x02`.
fn season_marker(token: &str) -> Option<(u32, Option<u32>)> {
    if let Some(caps) = SEASON_EPISODE.captures(token) {
        let season = caps.get(1)?.as_str().parse().ok()?;
        let episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        return Some((season, episode));
    }
    if let Some(caps) = CROSS_EPISODE.captures(token) {
        let season = caps.get(1)?.as_str().parse().ok()?;
        let episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        return Some((season, episode));
    }
    None
}

/// Parse a torrent release name such as `Show.Name.2019.S01.1080p.WEB-DL-GRP`.
///
/// The title is everything before the first season marker, year or quality
/// tag. A leading year is kept as part of the title.
pub fn parse_release(name: &str) -> ParsedRelease {
    let tokens = split_tokens(name);
    let mut title = Vec::new();
    let mut season = None;
    let mut episode = None;
    let mut year = None;

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        if let Some((s, e)) = season_marker(token) {
            season = Some(s);
            episode = e;
            break;
        }
        if MARKER_WORDS.contains(&token) {
            if let Some(n) = tokens.get(i + 1).and_then(|t| t.parse::<u32>().ok()) {
                if token == "season" || token == "series" {
                    season = Some(n);
                } else {
                    episode = Some(n);
                }
                break;
            }
        }
        if YEAR.is_match(token) && !title.is_empty() {
            year = token.parse().ok();
            // A season marker may still follow the year.
            if let Some((s, e)) = tokens.get(i + 1).and_then(|t| season_marker(t)) {
                season = Some(s);
                episode = e;
            }
            break;
        }
        if is_noise(token) {
            break;
        }
        title.push(token);
        i += 1;
    }

    ParsedRelease {
        title: title.join(" "),
        season,
        episode,
        year,
    }
}

/// Normalized tokens of a title: lower-cased, split on punctuation, with
/// season/episode markers, release noise, years and stopwords removed.
pub fn title_tokens(title: &str) -> Vec<String> {
    let raw = split_tokens(title);
    let mut tokens = Vec::with_capacity(raw.len());
    let mut skip_number = false;

    for token in &raw {
        if skip_number {
            skip_number = false;
            if token.parse::<u32>().is_ok() {
                continue;
            }
        }
        if MARKER_WORDS.contains(&token.as_str()) {
            skip_number = true;
            continue;
        }
        if season_marker(token).is_some() || is_noise(token) {
            continue;
        }
        if STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if YEAR.is_match(token) && raw.len() > 1 {
            continue;
        }
        tokens.push(token.clone());
    }

    tokens
}

/// Normalized form of a title used for comparison and display.
pub fn normalize_title(title: &str) -> String {
    title_tokens(title).join(" ")
}

/// Whether a release name carries a season or episode marker.
pub fn looks_like_series(name: &str) -> bool {
    parse_release(name).season.is_some()
}
