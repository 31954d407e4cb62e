//! Fuzzy title matching against a media manager catalog.
//!
//! Release names are reduced to a normalized title and scored against every
//! catalog entry (primary and alternate titles). Entries above the threshold
//! are ranked; when the two best are too close to call the result is
//! reported as ambiguous instead of picking one.

mod normalize;
mod scorer;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;

pub use normalize::{looks_like_series, normalize_title, parse_release, title_tokens, ParsedRelease};
pub use scorer::{TitleScorer, TokenSetScorer};

use crate::config::MatcherConfig;
use crate::media_manager::MediaEntry;

/// A catalog entry with its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry {
    pub entry: MediaEntry,
    pub score: f32,
}

/// Result of matching a title against a catalog.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// Entries at or above the threshold, best first.
    Matches(Vec<ScoredEntry>),
    /// The best entries scored within epsilon of each other.
    Ambiguous { top: Vec<ScoredEntry> },
    NoMatch,
}

impl MatchOutcome {
    /// The single best entry of an unambiguous match.
    pub fn best(&self) -> Option<&ScoredEntry> {
        match self {
            MatchOutcome::Matches(entries) => entries.first(),
            _ => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, MatchOutcome::Ambiguous { .. })
    }
}

/// Orders numeric ids numerically, anything else lexically.
fn cmp_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Ranks catalog entries by title similarity.
#[derive(Clone)]
pub struct FuzzyMatcher {
    scorer: Arc<dyn TitleScorer>,
    threshold: f32,
    epsilon: f32,
}

impl FuzzyMatcher {
    /// Matcher using [`TokenSetScorer`].
    pub fn new(config: &MatcherConfig) -> Self {
        Self::with_scorer(Arc::new(TokenSetScorer), config)
    }

    pub fn with_scorer(scorer: Arc<dyn TitleScorer>, config: &MatcherConfig) -> Self {
        Self {
            scorer,
            threshold: config.threshold,
            epsilon: config.ambiguity_epsilon,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Best score of `target` over the entry's primary and alternate titles.
    pub fn score_entry(&self, target: &str, entry: &MediaEntry) -> f32 {
        entry
            .titles()
            .map(|title| self.scorer.score(target, title))
            .fold(0.0, f32::max)
    }

    /// Entries scoring at or above the threshold, best first, ties broken by id.
    pub fn rank(&self, target: &str, catalog: &[MediaEntry]) -> Vec<ScoredEntry> {
        let mut ranked: Vec<ScoredEntry> = catalog
            .iter()
            .map(|entry| ScoredEntry {
                score: self.score_entry(target, entry),
                entry: entry.clone(),
            })
            .filter(|s| s.score >= self.threshold)
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| cmp_ids(&a.entry.id, &b.entry.id))
        });
        ranked
    }

    /// Match `target` against `catalog`.
    pub fn match_title(&self, target: &str, catalog: &[MediaEntry]) -> MatchOutcome {
        let ranked = self.rank(target, catalog);
        let Some(best) = ranked.first().map(|s| s.score) else {
            return MatchOutcome::NoMatch;
        };

        let contenders = ranked
            .iter()
            .take_while(|s| best - s.score <= self.epsilon)
            .count();
        if contenders > 1 {
            return MatchOutcome::Ambiguous {
                top: ranked.into_iter().take(contenders).collect(),
            };
        }
        MatchOutcome::Matches(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_manager::MediaKind;
    use std::collections::HashMap;

    fn series(id: &str, title: &str) -> MediaEntry {
        MediaEntry::new(id, MediaKind::Series, title, format!("/data/media/tv/{}", title))
    }

    fn config(threshold: f32, epsilon: f32) -> MatcherConfig {
        MatcherConfig {
            threshold,
            ambiguity_epsilon: epsilon,
        }
    }

    /// Fixed scores per candidate title.
    struct FixedScorer(HashMap<&'static str, f32>);

    impl TitleScorer for FixedScorer {
        fn score(&self, _target: &str, candidate: &str) -> f32 {
            self.0.get(candidate).copied().unwrap_or(0.0)
        }
    }

    #[test]
    fn test_match_above_threshold_sorted() {
        let matcher = FuzzyMatcher::new(&config(0.6, 0.05));
        let catalog = vec![
            series("3", "Other Programme"),
            series("1", "Show Name"),
            series("2", "Show Name Returns"),
        ];
        let outcome = matcher.match_title("Show Name", &catalog);
        let MatchOutcome::Matches(entries) = outcome else {
            panic!("expected matches, got {:?}", outcome);
        };
        assert_eq!(entries[0].entry.id, "1");
        assert!((entries[0].score - 1.0).abs() < f32::EPSILON);
        assert_eq!(entries[1].entry.id, "2");
        assert!(entries.iter().all(|e| e.score >= 0.6));
        assert!(entries.iter().all(|e| e.entry.id != "3"));
    }

    #[test]
    fn test_identical_normalized_titles_are_ambiguous() {
        let matcher = FuzzyMatcher::new(&config(0.6, 0.05));
        let catalog = vec![series("7", "The Office"), series("4", "Office (2001)")];
        let outcome = matcher.match_title("Office", &catalog);
        let MatchOutcome::Ambiguous { top } = outcome else {
            panic!("expected ambiguous, got {:?}", outcome);
        };
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].entry.id, "4");
        assert_eq!(top[1].entry.id, "7");
    }

    #[test]
    fn test_no_match_below_threshold() {
        let matcher = FuzzyMatcher::new(&config(0.6, 0.05));
        let outcome = matcher.match_title("Completely Different", &[series("1", "Show Name")]);
        assert!(matches!(outcome, MatchOutcome::NoMatch));
        assert!(outcome.best().is_none());
    }

    #[test]
    fn test_alternate_titles_participate() {
        let matcher = FuzzyMatcher::new(&config(0.6, 0.05));
        let entry = series("1", "La Casa de Papel")
            .with_alternate_titles(vec!["Money Heist".to_string()]);
        let outcome = matcher.match_title("Money.Heist", &[entry]);
        assert_eq!(outcome.best().unwrap().entry.id, "1");
    }

    #[test]
    fn test_season_one_above_season_two_below() {
        let scorer = FixedScorer(HashMap::from([
            ("Show Season 1", 0.95),
            ("Show Season 2", 0.40),
        ]));
        let matcher = FuzzyMatcher::with_scorer(Arc::new(scorer), &config(0.6, 0.05));
        let catalog = vec![series("1", "Show Season 1"), series("2", "Show Season 2")];

        let outcome = matcher.match_title("Show.S01", &catalog);
        let MatchOutcome::Matches(entries) = outcome else {
            panic!("expected matches");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.id, "1");
    }

    #[test]
    fn test_close_scores_within_epsilon_are_ambiguous() {
        let scorer = FixedScorer(HashMap::from([("A", 0.90), ("B", 0.87), ("C", 0.70)]));
        let matcher = FuzzyMatcher::with_scorer(Arc::new(scorer), &config(0.6, 0.05));
        let catalog = vec![series("1", "A"), series("2", "B"), series("3", "C")];
        let outcome = matcher.match_title("x", &catalog);
        let MatchOutcome::Ambiguous { top } = outcome else {
            panic!("expected ambiguous");
        };
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn test_numeric_id_tiebreak() {
        assert_eq!(cmp_ids("9", "10"), Ordering::Less);
        assert_eq!(cmp_ids("b", "a"), Ordering::Greater);
    }
}
