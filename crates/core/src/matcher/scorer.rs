//! Title similarity scoring.

use std::collections::HashSet;

use super::normalize::title_tokens;

/// Scores how similar two titles are, in `[0.0, 1.0]`.
pub trait TitleScorer: Send + Sync {
    fn score(&self, target: &str, candidate: &str) -> f32;
}

/// Dice coefficient over normalized unigrams and bigrams, averaged.
///
/// When either title has a single token only unigrams are compared.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenSetScorer;

fn dice(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    (2 * shared) as f32 / (a.len() + b.len()) as f32
}

fn bigrams(tokens: &[String]) -> HashSet<String> {
    tokens
        .windows(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect()
}

impl TitleScorer for TokenSetScorer {
    fn score(&self, target: &str, candidate: &str) -> f32 {
        let a = title_tokens(target);
        let b = title_tokens(candidate);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let uni_a: HashSet<String> = a.iter().cloned().collect();
        let uni_b: HashSet<String> = b.iter().cloned().collect();
        let unigram = dice(&uni_a, &uni_b);

        if a.len() < 2 || b.len() < 2 {
            return unigram;
        }
        let bigram = dice(&bigrams(&a), &bigrams(&b));
        (unigram + bigram) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_titles_score_one() {
        let scorer = TokenSetScorer;
        assert!((scorer.score("Show Name", "show name") - 1.0).abs() < f32::EPSILON);
        assert!((scorer.score("The Show", "Show (2019)") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_season_markers_ignored() {
        let scorer = TokenSetScorer;
        assert!((scorer.score("Show Name S02", "Show Name") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_overlap() {
        let scorer = TokenSetScorer;
        let score = scorer.score("show", "show name");
        assert!((score - 2.0 / 3.0).abs() < 0.001);

        let score = scorer.score("big bang theory", "big short");
        // unigrams 2/5, no shared bigram
        assert!((score - 0.2).abs() < 0.001);
    }

    #[test]
    fn test_word_order_matters_through_bigrams() {
        let scorer = TokenSetScorer;
        let same_order = scorer.score("dark matter", "dark matter");
        let swapped = scorer.score("dark matter", "matter dark");
        assert!(swapped < same_order);
        assert!((swapped - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_disjoint_and_empty() {
        let scorer = TokenSetScorer;
        assert_eq!(scorer.score("alpha", "beta"), 0.0);
        assert_eq!(scorer.score("", "beta"), 0.0);
        assert_eq!(scorer.score("S01", "Show"), 0.0);
    }
}
