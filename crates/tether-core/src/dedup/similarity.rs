//! Similarity measures used by duplicate detection.
//!
//! All scores are in `[0.0, 1.0]`; `1.0` means identical.

use std::collections::HashSet;
use std::hash::Hash;

use crate::model::Syncable;

/// Normalized Levenshtein similarity over Unicode scalar values.
///
/// Both inputs are expected to be pre-normalized (see
/// [`crate::model::normalize_title`]). Two empty strings are identical.
#[must_use]
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a, &b, longest);
    1.0 - ratio(distance, longest)
}

/// Whether two normalized titles score at least `threshold`.
///
/// Cheaper than [`title_similarity`] for the common negative case: the
/// length difference alone bounds the distance from below, and the
/// dynamic-programming pass stops once every cell exceeds the budget.
#[must_use]
pub fn titles_within(a: &str, b: &str, threshold: f64) -> Option<f64> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return Some(1.0);
    }
    let budget = max_distance(longest, threshold);
    if a.len().abs_diff(b.len()) > budget {
        return None;
    }
    let distance = levenshtein(&a, &b, budget);
    if distance > budget {
        return None;
    }
    let score = 1.0 - ratio(distance, longest);
    (score >= threshold).then_some(score)
}

/// Largest edit distance that still scores at least `threshold` for a
/// string pair whose longer side has `longest` characters.
#[must_use]
pub fn max_distance(longest: usize, threshold: f64) -> usize {
    let slack = (1.0 - threshold.clamp(0.0, 1.0)) * to_f64(longest);
    // Small epsilon so 0.9 * 10 does not round down to 8.999...
    let floored = (slack + 1e-9).floor();
    if floored <= 0.0 {
        0
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let out = floored as usize;
        out
    }
}

/// Jaccard similarity between two sets: |A ∩ B| / |A ∪ B|.
///
/// Returns `0.0` when both sets are empty.
#[must_use]
pub fn jaccard<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union_size = a.len() + b.len() - intersection;
    if union_size == 0 {
        0.0
    } else {
        ratio(intersection, union_size)
    }
}

/// Lowercased alphanumeric tokens of a record's body plus its labels.
///
/// Labels are prefixed so a label `ui` does not collide with the word "ui"
/// in a body.
#[must_use]
pub fn content_tokens(record: &dyn Syncable) -> HashSet<String> {
    let mut tokens: HashSet<String> = record
        .body()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect();
    tokens.extend(record.labels().iter().map(|l| format!("#{l}")));
    tokens
}

/// Content similarity: `1.0` on equal fingerprints, otherwise token Jaccard
/// over body and labels.
#[must_use]
pub fn content_similarity(a: &dyn Syncable, b: &dyn Syncable) -> f64 {
    if a.fingerprint() == b.fingerprint() {
        return 1.0;
    }
    jaccard(&content_tokens(a), &content_tokens(b))
}

fn levenshtein(a: &[char], b: &[char], budget: usize) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > budget {
            return row_min;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[allow(clippy::cast_precision_loss)]
const fn to_f64(n: usize) -> f64 {
    n as f64
}

fn ratio(num: usize, den: usize) -> f64 {
    to_f64(num) / to_f64(den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use chrono::{TimeZone, Utc};

    fn record(title: &str, body: &str, labels: &[&str]) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");
        let mut r = Record::new("x", title, at);
        r.body = body.into();
        r.labels = labels.iter().map(|l| (*l).to_string()).collect();
        r
    }

    #[test]
    fn identical_titles_score_one() {
        assert!((title_similarity("fix login", "fix login") - 1.0).abs() < f64::EPSILON);
        assert!((title_similarity("", "") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn one_edit_in_ten_scores_point_nine() {
        let score = title_similarity("abcdefghij", "abcdefghiX");
        assert!((score - 0.9).abs() < 1e-9);
        assert_eq!(titles_within("abcdefghij", "abcdefghiX", 0.9), Some(score));
        assert_eq!(titles_within("abcdefghij", "abcdefgXYZ", 0.9), None);
    }

    #[test]
    fn bounded_check_rejects_on_length_alone() {
        assert_eq!(titles_within("short", "a much longer title", 0.9), None);
    }

    #[test]
    fn bounded_and_unbounded_agree_when_within() {
        let a = "update the onboarding docs";
        let b = "update the onboarding doc";
        let full = title_similarity(a, b);
        assert!(full >= 0.9);
        assert_eq!(titles_within(a, b, 0.9), Some(full));
    }

    #[test]
    fn max_distance_handles_exact_multiples() {
        assert_eq!(max_distance(10, 0.9), 1);
        assert_eq!(max_distance(20, 0.9), 2);
        assert_eq!(max_distance(5, 1.0), 0);
    }

    #[test]
    fn jaccard_edge_cases() {
        let empty: HashSet<&str> = HashSet::new();
        assert!(jaccard(&empty, &empty).abs() < f64::EPSILON);
        let a: HashSet<&str> = ["x", "y"].into_iter().collect();
        let b: HashSet<&str> = ["y", "z"].into_iter().collect();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn content_similarity_short_circuits_on_fingerprint() {
        let a = record("Fix Login", "steps to reproduce", &["bug"]);
        let b = record("fix   login", "steps to reproduce", &["bug"]);
        assert!((content_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn content_similarity_uses_body_and_labels() {
        let a = record("one", "the cache evicts entries too early", &["perf"]);
        let b = record("two", "the cache evicts entries too late", &["perf"]);
        let score = content_similarity(&a, &b);
        assert!(score > 0.5 && score < 1.0, "score was {score}");
    }
}
