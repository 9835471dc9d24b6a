//! Term similarity scoring used by the knowledge base matcher.

use std::collections::HashSet;
use strsim::jaro_winkler;

/// Score attached to an exact key or synonym hit
pub const EXACT_SCORE: f64 = 1.0;
/// Score for substring containment in either direction
pub const CONTAINMENT_SCORE: f64 = 0.8;

/// Lower-case, trim and collapse inner whitespace
pub fn normalize_term(term: &str) -> String {
    term.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity between two terms in `[0, 1]`.
///
/// - identical (after normalization) → 1.0
/// - one contains the other → 0.8
/// - otherwise shared distinct words / max word count of either side
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_term(a);
    let b = normalize_term(b);

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return EXACT_SCORE;
    }
    if a.contains(&b) || b.contains(&a) {
        return CONTAINMENT_SCORE;
    }

    let words_a: Vec<&str> = a.split(' ').collect();
    let words_b: Vec<&str> = b.split(' ').collect();
    let set_a: HashSet<&str> = words_a.iter().copied().collect();
    let set_b: HashSet<&str> = words_b.iter().copied().collect();

    let shared = set_a.intersection(&set_b).count();
    let total = words_a.len().max(words_b.len());
    if total == 0 {
        0.0
    } else {
        shared as f64 / total as f64
    }
}

/// Secondary ordering key for equal similarity scores
pub fn tie_breaker(a: &str, b: &str) -> f64 {
    jaro_winkler(&normalize_term(a), &normalize_term(b))
}
