//! Dedup at the size of a real backlog: 1,828 records, 99 distinct items,
//! the rest near-duplicates of them.

use chrono::{Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use tether_core::dedup::{DedupConfig, DuplicateDetector, MatchScope, MatchType};
use tether_core::model::Record;

const TOTAL: usize = 1_828;
const DISTINCT: usize = 99;

const VERBS: [&str; 6] = ["Fix", "Add", "Remove", "Document", "Profile", "Refactor"];

fn random_word(rng: &mut StdRng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
        .collect()
}

/// A spelling slip: one character replaced by a different letter.
fn typo(rng: &mut StdRng, title: &str) -> String {
    let mut chars: Vec<char> = title.chars().collect();
    let letters: Vec<usize> = chars
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_ascii_lowercase())
        .map(|(i, _)| i)
        .collect();
    let at = letters[rng.gen_range(0..letters.len())];
    let c = chars[at];
    chars[at] = if c == 'z' {
        'a'
    } else {
        char::from_u32(u32::from(c) + 1).unwrap_or('a')
    };
    chars.into_iter().collect()
}

fn variant(rng: &mut StdRng, title: &str) -> String {
    match rng.gen_range(0..4) {
        0 => title.to_uppercase(),
        1 => format!("  {}  ", title.replace(' ', "   ")),
        2 => typo(rng, title),
        _ => title.to_lowercase(),
    }
}

struct Backlog {
    records: Vec<Record>,
    originals: BTreeSet<String>,
    titles: Vec<String>,
}

fn backlog(seed: u64) -> Backlog {
    let mut rng = StdRng::seed_from_u64(seed);
    let t0 = Utc
        .with_ymd_and_hms(2023, 1, 1, 0, 0, 0)
        .single()
        .expect("valid ts");

    let titles: Vec<String> = (0..DISTINCT)
        .map(|i| format!("{} {}", VERBS[i % VERBS.len()], random_word(&mut rng, 24)))
        .collect();

    // every item gets at least one copy, the rest land anywhere
    let mut owners: Vec<usize> = (0..DISTINCT).collect();
    while owners.len() < TOTAL - DISTINCT {
        owners.push(rng.gen_range(0..DISTINCT));
    }
    owners.shuffle(&mut rng);

    let mut records = Vec::with_capacity(TOTAL);
    let mut originals = BTreeSet::new();
    for (i, title) in titles.iter().enumerate() {
        let id = format!("tt-{i:04}");
        originals.insert(id.clone());
        let minutes = i64::try_from(i).expect("small index");
        records.push(Record::new(id, title.clone(), t0 + Duration::minutes(minutes)));
    }
    for (n, owner) in owners.into_iter().enumerate() {
        let idx = DISTINCT + n;
        let minutes = i64::try_from(idx).expect("small index");
        records.push(Record::new(
            format!("tt-{idx:04}"),
            variant(&mut rng, &titles[owner]),
            t0 + Duration::days(30) + Duration::minutes(minutes),
        ));
    }
    records.shuffle(&mut rng);

    Backlog {
        records,
        originals,
        titles,
    }
}

#[test]
fn backlog_has_the_intended_shape() {
    let b = backlog(7);
    assert_eq!(b.records.len(), TOTAL);
    let duplicates = TOTAL - DISTINCT;
    assert!(duplicates * 100 / TOTAL >= 94);
}

#[test]
fn self_dedup_collapses_to_the_distinct_items() {
    let b = backlog(7);
    let config = DedupConfig::default();
    let detector = DuplicateDetector::new(&config);
    let out = detector.self_dedup(MatchScope::Local, &b.records, |_| false);

    assert_eq!(out.clusters.len(), DISTINCT);
    assert_eq!(out.absorbed_count(), TOTAL - DISTINCT);
    let canonicals: BTreeSet<String> = out.canonical_ids().map(str::to_string).collect();
    assert_eq!(canonicals, b.originals);
    for cluster in &out.clusters {
        for dup in &cluster.duplicates {
            assert!(
                matches!(dup.match_type, MatchType::ExactTitle | MatchType::FuzzyTitle),
                "{} absorbed by {}",
                dup.id,
                dup.match_type
            );
            assert!(dup.confidence >= config.fuzzy_title_threshold);
        }
    }
}

#[test]
fn self_dedup_is_stable_across_seeds() {
    let config = DedupConfig::default();
    let detector = DuplicateDetector::new(&config);
    for seed in [1, 2, 3] {
        let b = backlog(seed);
        let out = detector.self_dedup(MatchScope::Local, &b.records, |_| false);
        assert_eq!(out.clusters.len(), DISTINCT, "seed {seed}");
    }
}

#[test]
fn cross_dedup_pairs_each_canonical_at_most_once() {
    let b = backlog(11);
    let config = DedupConfig::default();
    let detector = DuplicateDetector::new(&config);
    let reduced = detector.self_dedup(MatchScope::Local, &b.records, |_| false);
    let local: Vec<&Record> = b
        .records
        .iter()
        .filter(|r| !reduced.is_absorbed(&r.id))
        .collect();
    assert_eq!(local.len(), DISTINCT);

    let t0 = Utc
        .with_ymd_and_hms(2023, 6, 1, 0, 0, 0)
        .single()
        .expect("valid ts");
    let remote_records: Vec<Record> = b
        .titles
        .iter()
        .enumerate()
        .map(|(i, title)| Record::new((1000 + i).to_string(), title.to_uppercase(), t0))
        .collect();
    let remote: Vec<&Record> = remote_records.iter().collect();

    let matches = detector.cross_dedup(&local, &remote);
    assert!(matches.len() <= DISTINCT);
    assert_eq!(matches.len(), DISTINCT);
    let lefts: BTreeSet<&str> = matches.iter().map(|m| m.left.as_str()).collect();
    let rights: BTreeSet<&str> = matches.iter().map(|m| m.right.as_str()).collect();
    assert_eq!(lefts.len(), matches.len());
    assert_eq!(rights.len(), matches.len());
    assert!(
        matches
            .iter()
            .all(|m| m.confidence >= config.auto_resolve_threshold)
    );
}
