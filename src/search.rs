//! Fuzzy text matching over product title/description.
//!
//! The store's text index is conceptually a trigram similarity index on
//! `Product.title`/`Product.description`; this implementation computes the
//! equivalent similarity in Rust (the store backing this core is SQLite,
//! which has no `pg_trgm`), with the query always passed as data, never
//! interpolated into SQL.

use std::collections::HashSet;

/// Character trigrams of a lowercased string, treating it as a single
/// shingle source (no cross-word boundary handling needed at this scale).
fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let chars: Vec<char> = s.to_lowercase().chars().collect();
    if chars.len() < 3 {
        return HashSet::new();
    }
    chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Dice coefficient over character trigrams, clamped to `[0, 1]`. Returns
/// 0 for strings too short to produce a trigram.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count() as f64;
    let score = (2.0 * shared) / (ta.len() as f64 + tb.len() as f64);
    score.clamp(0.0, 1.0)
}

/// `max(similarity(title, q), similarity(description, q))`.
pub fn best_similarity(query: &str, title: &str, description: &str) -> f64 {
    trigram_similarity(query, title).max(trigram_similarity(query, description))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        assert!((trigram_similarity("red shoe", "red shoe") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_strings_score_low() {
        assert!(trigram_similarity("red shoe", "xyz quantum") < 0.1);
    }

    #[test]
    fn short_strings_below_trigram_length_score_zero() {
        assert_eq!(trigram_similarity("ab", "ab"), 0.0);
    }

    #[test]
    fn score_matches_the_closest_query_in_a_near_tie() {
        // "red shirt" should score higher against "red shirt" than "red shoe" does.
        let p1 = best_similarity("red shirt", "red shoe", "");
        let p3 = best_similarity("red shirt", "red shirt", "");
        assert!(p3 > p1);
    }

    #[test]
    fn similarity_is_always_in_unit_range() {
        for (a, b) in [("", ""), ("a", "abcdef"), ("hello world", "world hello")] {
            let s = trigram_similarity(a, b);
            assert!((0.0..=1.0).contains(&s));
        }
    }
}
