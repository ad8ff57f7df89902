//! Duplicate detection within one record set and across two.
//!
//! Self-dedup clusters near-identical records of one side through a
//! [`UnionFind`] and elects one canonical record per cluster. Cross-dedup
//! then runs on the reduced sets only, so the quadratic part of the work
//! is bounded by the number of canonical records rather than the raw
//! record counts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use super::similarity::{content_similarity, content_tokens, jaccard, max_distance, titles_within};
use super::union_find::UnionFind;
use crate::model::{Record, Syncable, normalize_title};

/// Confidence assigned to an exact (normalized) title match.
pub const EXACT_TITLE_CONFIDENCE: f64 = 0.95;

/// Token sets smaller than this are too thin for a content comparison.
const MIN_CONTENT_TOKENS: usize = 4;

/// Why two records were considered duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    IdCollision,
    ExactTitle,
    FuzzyTitle,
    ContentSimilarity,
}

impl MatchType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdCollision => "id-collision",
            Self::ExactTitle => "exact-title",
            Self::FuzzyTitle => "fuzzy-title",
            Self::ContentSimilarity => "content-similarity",
        }
    }

    /// Tie-break rank when two rules give the same confidence; lower wins.
    const fn rank(self) -> u8 {
        match self {
            Self::IdCollision => 0,
            Self::ContentSimilarity => 1,
            Self::ExactTitle => 2,
            Self::FuzzyTitle => 3,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    AutoMerge,
    ManualReview,
}

/// Which record sets a match was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchScope {
    Local,
    Remote,
    /// `left` is a local id, `right` a remote id.
    Cross,
}

/// A scored pair of duplicate candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateMatch {
    pub scope: MatchScope,
    pub left: String,
    pub right: String,
    pub match_type: MatchType,
    pub confidence: f64,
    pub recommended: RecommendedAction,
}

/// Thresholds for duplicate detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum normalized title similarity for a fuzzy-title edge.
    pub fuzzy_title_threshold: f64,
    /// Minimum body/label similarity for a content edge (cross-dedup only).
    pub content_threshold: f64,
    /// Cross matches scoring below this are dropped entirely.
    pub confidence_floor: f64,
    /// Matches at or above this are recommended for automatic merge.
    pub auto_resolve_threshold: f64,
    /// Delete unlinked local copies identical to their canonical instead of
    /// archiving them.
    pub delete_identical_copies: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_title_threshold: 0.90,
            content_threshold: 0.85,
            confidence_floor: 0.50,
            auto_resolve_threshold: 0.95,
            delete_identical_copies: false,
        }
    }
}

impl DedupConfig {
    /// Names of the fields holding values outside `[0, 1]`.
    #[must_use]
    pub fn out_of_range(&self) -> Vec<&'static str> {
        [
            ("fuzzy_title_threshold", self.fuzzy_title_threshold),
            ("content_threshold", self.content_threshold),
            ("confidence_floor", self.confidence_floor),
            ("auto_resolve_threshold", self.auto_resolve_threshold),
        ]
        .into_iter()
        .filter(|(_, v)| !(0.0..=1.0).contains(v))
        .map(|(name, _)| name)
        .collect()
    }

    const fn recommend(&self, confidence: f64) -> RecommendedAction {
        if confidence >= self.auto_resolve_threshold {
            RecommendedAction::AutoMerge
        } else {
            RecommendedAction::ManualReview
        }
    }
}

/// A record absorbed into a cluster's canonical record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsorbedDuplicate {
    pub id: String,
    /// Strongest rule that tied this record into the cluster.
    pub match_type: MatchType,
    /// Highest confidence among the record's own edges.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCluster {
    pub canonical: String,
    pub duplicates: Vec<AbsorbedDuplicate>,
}

/// Output of a self-dedup pass over one side.
#[derive(Debug, Clone, Default)]
pub struct SelfDedup {
    /// Every clustered record id → its canonical id (canonicals map to themselves).
    pub canonical_of: BTreeMap<String, String>,
    /// Clusters with at least one absorbed duplicate, ordered by canonical id.
    pub clusters: Vec<DuplicateCluster>,
    /// The edges that produced the clusters.
    pub matches: Vec<DuplicateMatch>,
    /// Records already marked `duplicate_of`; kept out of clustering.
    pub resolved: BTreeSet<String>,
}

impl SelfDedup {
    /// Whether `id` is hidden behind a canonical record.
    #[must_use]
    pub fn is_absorbed(&self, id: &str) -> bool {
        self.resolved.contains(id)
            || self
                .canonical_of
                .get(id)
                .is_some_and(|canonical| canonical != id)
    }

    /// Ids that stay visible to classification.
    pub fn canonical_ids(&self) -> impl Iterator<Item = &str> {
        self.canonical_of
            .iter()
            .filter(|(id, canonical)| id == canonical)
            .map(|(id, _)| id.as_str())
    }

    /// Number of absorbed records, excluding previously resolved ones.
    #[must_use]
    pub fn absorbed_count(&self) -> usize {
        self.clusters.iter().map(|c| c.duplicates.len()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    match_type: MatchType,
    confidence: f64,
}

impl Edge {
    fn beats(self, other: Self) -> bool {
        self.confidence > other.confidence
            || ((self.confidence - other.confidence).abs() < f64::EPSILON
                && self.match_type.rank() < other.match_type.rank())
    }
}

/// Finds duplicate records using configurable thresholds.
#[derive(Debug, Clone)]
pub struct DuplicateDetector<'a> {
    config: &'a DedupConfig,
}

impl<'a> DuplicateDetector<'a> {
    #[must_use]
    pub const fn new(config: &'a DedupConfig) -> Self {
        Self { config }
    }

    /// Cluster duplicates within one side.
    ///
    /// `is_linked` tells whether a record already has a counterpart on the
    /// other side; linked records are preferred as canonical, then the
    /// earliest created, then the lowest id.
    pub fn self_dedup<F>(&self, scope: MatchScope, records: &[Record], is_linked: F) -> SelfDedup
    where
        F: Fn(&Record) -> bool,
    {
        let mut out = SelfDedup::default();
        let active: Vec<&Record> = records
            .iter()
            .filter(|r| {
                if r.is_resolved_duplicate() {
                    out.resolved.insert(r.id.clone());
                    false
                } else {
                    true
                }
            })
            .collect();

        let mut uf: UnionFind<usize> = UnionFind::with_capacity(active.len());
        for idx in 0..active.len() {
            uf.make_set(idx);
        }
        let mut edges: HashMap<(usize, usize), Edge> = HashMap::new();
        let mut add_edge = |uf: &mut UnionFind<usize>, a: usize, b: usize, edge: Edge| {
            let pair = (a.min(b), a.max(b));
            edges
                .entry(pair)
                .and_modify(|existing| {
                    if edge.beats(*existing) {
                        *existing = edge;
                    }
                })
                .or_insert(edge);
            uf.union(&a, &b);
        };

        // (a) two records claiming the same remote identifier
        let mut by_remote: HashMap<(&str, &str), usize> = HashMap::new();
        for (idx, record) in active.iter().enumerate() {
            for (backend, rid) in &record.remote_ids {
                if let Some(&first) = by_remote.get(&(backend.as_str(), rid.as_str())) {
                    add_edge(&mut uf, first, idx, Edge {
                        match_type: MatchType::IdCollision,
                        confidence: 1.0,
                    });
                } else {
                    by_remote.insert((backend.as_str(), rid.as_str()), idx);
                }
            }
        }

        // (b) identical normalized titles
        let mut by_title: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, record) in active.iter().enumerate() {
            by_title
                .entry(normalize_title(&record.title))
                .or_default()
                .push(idx);
        }
        for members in by_title.values() {
            if let Some((&first, rest)) = members.split_first() {
                for &other in rest {
                    add_edge(&mut uf, first, other, Edge {
                        match_type: MatchType::ExactTitle,
                        confidence: EXACT_TITLE_CONFIDENCE,
                    });
                }
            }
        }

        // (c) fuzzy titles, compared once per distinct normalized title
        let titles: Vec<(&String, &Vec<usize>)> = by_title.iter().collect();
        for (a, b, score) in self.fuzzy_pairs(&titles, &titles, true) {
            let (ta, tb) = (titles[a].1, titles[b].1);
            add_edge(&mut uf, ta[0], tb[0], Edge {
                match_type: MatchType::FuzzyTitle,
                confidence: score,
            });
        }

        for group in uf.groups() {
            let canonical = group
                .iter()
                .copied()
                .min_by(|&x, &y| {
                    let (rx, ry) = (active[x], active[y]);
                    is_linked(ry)
                        .cmp(&is_linked(rx))
                        .then(rx.created_at.cmp(&ry.created_at))
                        .then(rx.id.cmp(&ry.id))
                })
                .unwrap_or(group[0]);
            let canonical_id = active[canonical].id.clone();
            let mut duplicates = Vec::new();
            for &member in &group {
                out.canonical_of
                    .insert(active[member].id.clone(), canonical_id.clone());
                if member == canonical {
                    continue;
                }
                let strongest = group
                    .iter()
                    .filter_map(|&other| edges.get(&(member.min(other), member.max(other))))
                    .copied()
                    .reduce(|best, e| if e.beats(best) { e } else { best });
                if let Some(edge) = strongest {
                    duplicates.push(AbsorbedDuplicate {
                        id: active[member].id.clone(),
                        match_type: edge.match_type,
                        confidence: edge.confidence,
                    });
                }
            }
            if !duplicates.is_empty() {
                duplicates.sort_by(|x, y| x.id.cmp(&y.id));
                out.clusters.push(DuplicateCluster {
                    canonical: canonical_id,
                    duplicates,
                });
            }
        }
        out.clusters.sort_by(|x, y| x.canonical.cmp(&y.canonical));

        let mut pairs: Vec<_> = edges.into_iter().collect();
        pairs.sort_by(|x, y| {
            (&active[x.0.0].id, &active[x.0.1].id).cmp(&(&active[y.0.0].id, &active[y.0.1].id))
        });
        out.matches = pairs
            .into_iter()
            .map(|((a, b), edge)| DuplicateMatch {
                scope,
                left: active[a].id.clone(),
                right: active[b].id.clone(),
                match_type: edge.match_type,
                confidence: edge.confidence,
                recommended: self.config.recommend(edge.confidence),
            })
            .collect();

        debug!(
            ?scope,
            records = records.len(),
            resolved = out.resolved.len(),
            clusters = out.clusters.len(),
            absorbed = out.absorbed_count(),
            "self-dedup finished"
        );
        out
    }

    /// Match unlinked local records against unlinked remote records.
    ///
    /// Both inputs should already be reduced to canonical records. The
    /// result pairs each record at most once, strongest matches first;
    /// matches below the confidence floor are dropped.
    pub fn cross_dedup(&self, local: &[&Record], remote: &[&Record]) -> Vec<DuplicateMatch> {
        let mut best: BTreeMap<(usize, usize), Edge> = BTreeMap::new();
        let mut offer = |l: usize, r: usize, edge: Edge| {
            best.entry((l, r))
                .and_modify(|existing| {
                    if edge.beats(*existing) {
                        *existing = edge;
                    }
                })
                .or_insert(edge);
        };

        // id collisions on any backend both sides know about
        let mut remote_by_link: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
        for (r, record) in remote.iter().enumerate() {
            for (backend, rid) in &record.remote_ids {
                remote_by_link
                    .entry((backend.as_str(), rid.as_str()))
                    .or_default()
                    .push(r);
            }
        }
        for (l, record) in local.iter().enumerate() {
            for (backend, rid) in &record.remote_ids {
                for &r in remote_by_link
                    .get(&(backend.as_str(), rid.as_str()))
                    .into_iter()
                    .flatten()
                {
                    offer(l, r, Edge {
                        match_type: MatchType::IdCollision,
                        confidence: 1.0,
                    });
                }
            }
        }

        // titles: exact by hash join, fuzzy by length-windowed comparison
        let mut local_titles: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (l, record) in local.iter().enumerate() {
            local_titles
                .entry(normalize_title(&record.title))
                .or_default()
                .push(l);
        }
        let mut remote_titles: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (r, record) in remote.iter().enumerate() {
            remote_titles
                .entry(normalize_title(&record.title))
                .or_default()
                .push(r);
        }
        for (title, ls) in &local_titles {
            if let Some(rs) = remote_titles.get(title) {
                for &l in ls {
                    for &r in rs {
                        offer(l, r, Edge {
                            match_type: MatchType::ExactTitle,
                            confidence: EXACT_TITLE_CONFIDENCE,
                        });
                    }
                }
            }
        }
        let lt: Vec<(&String, &Vec<usize>)> = local_titles.iter().collect();
        let rt: Vec<(&String, &Vec<usize>)> = remote_titles.iter().collect();
        for (a, b, score) in self.fuzzy_pairs(&lt, &rt, false) {
            for &l in lt[a].1 {
                for &r in rt[b].1 {
                    offer(l, r, Edge {
                        match_type: MatchType::FuzzyTitle,
                        confidence: score,
                    });
                }
            }
        }

        // content: candidates share at least one body/label token
        let mut postings: HashMap<String, Vec<usize>> = HashMap::new();
        let remote_tokens: Vec<_> = remote
            .iter()
            .map(|record| content_tokens(*record as &dyn Syncable))
            .collect();
        for (r, tokens) in remote_tokens.iter().enumerate() {
            for token in tokens {
                postings.entry(token.clone()).or_default().push(r);
            }
        }
        let remote_prints: HashMap<String, Vec<usize>> =
            remote.iter().enumerate().fold(HashMap::new(), |mut acc, (r, record)| {
                acc.entry(record.fingerprint()).or_default().push(r);
                acc
            });
        for (l, record) in local.iter().enumerate() {
            let mut candidates: BTreeSet<usize> = BTreeSet::new();
            if let Some(same) = remote_prints.get(&record.fingerprint()) {
                candidates.extend(same);
            }
            let tokens = content_tokens(*record as &dyn Syncable);
            for token in &tokens {
                if let Some(rs) = postings.get(token) {
                    candidates.extend(rs);
                }
            }
            for r in candidates {
                let score = if record.fingerprint() == remote[r].fingerprint() {
                    content_similarity(*record, remote[r])
                } else if tokens.len().min(remote_tokens[r].len()) < MIN_CONTENT_TOKENS {
                    continue;
                } else {
                    jaccard(&tokens, &remote_tokens[r])
                };
                if score >= self.config.content_threshold {
                    offer(l, r, Edge {
                        match_type: MatchType::ContentSimilarity,
                        confidence: score,
                    });
                }
            }
        }

        let candidates: Vec<((usize, usize), Edge)> = best
            .into_iter()
            .filter(|(_, edge)| edge.confidence >= self.config.confidence_floor)
            .collect();

        // Cluster candidate pairs, then pair greedily inside each cluster so
        // every record is matched at most once.
        let mut uf: UnionFind<(bool, usize)> = UnionFind::new();
        for ((l, r), _) in &candidates {
            uf.union(&(false, *l), &(true, *r));
        }
        let mut by_cluster: BTreeMap<(bool, usize), Vec<((usize, usize), Edge)>> = BTreeMap::new();
        for item in candidates {
            let root = uf.find(&(false, item.0.0));
            by_cluster.entry(root).or_default().push(item);
        }

        let mut matches = Vec::new();
        for (_, mut pairs) in by_cluster {
            pairs.sort_by(|x, y| {
                y.1.confidence
                    .total_cmp(&x.1.confidence)
                    .then(x.1.match_type.rank().cmp(&y.1.match_type.rank()))
                    .then(local[x.0.0].id.cmp(&local[y.0.0].id))
                    .then(remote[x.0.1].id.cmp(&remote[y.0.1].id))
            });
            let mut used_local = BTreeSet::new();
            let mut used_remote = BTreeSet::new();
            for ((l, r), edge) in pairs {
                if used_local.contains(&l) || used_remote.contains(&r) {
                    continue;
                }
                used_local.insert(l);
                used_remote.insert(r);
                matches.push(DuplicateMatch {
                    scope: MatchScope::Cross,
                    left: local[l].id.clone(),
                    right: remote[r].id.clone(),
                    match_type: edge.match_type,
                    confidence: edge.confidence,
                    recommended: self.config.recommend(edge.confidence),
                });
            }
        }
        matches.sort_by(|x, y| x.left.cmp(&y.left).then(x.right.cmp(&y.right)));

        debug!(
            local = local.len(),
            remote = remote.len(),
            matches = matches.len(),
            "cross-dedup finished"
        );
        matches
    }

    /// Pairs `(i, j, score)` of fuzzy-similar, non-identical titles.
    ///
    /// Titles are bucketed by character length; a pair is only compared
    /// when its length difference fits inside the edit budget. With
    /// `same_set`, `left` and `right` are the same list and each unordered
    /// pair is visited once.
    fn fuzzy_pairs(
        &self,
        left: &[(&String, &Vec<usize>)],
        right: &[(&String, &Vec<usize>)],
        same_set: bool,
    ) -> Vec<(usize, usize, f64)> {
        let threshold = self.config.fuzzy_title_threshold;
        let mut by_len: Vec<(usize, usize)> = right
            .iter()
            .enumerate()
            .map(|(j, (title, _))| (title.chars().count(), j))
            .collect();
        by_len.sort_unstable();

        let mut out = Vec::new();
        for (i, (title, _)) in left.iter().enumerate() {
            let len = title.chars().count();
            let start = by_len.partition_point(|&(l, _)| l + max_distance(len, threshold) < len);
            for &(other_len, j) in &by_len[start..] {
                let longest = len.max(other_len);
                if other_len > len && other_len - len > max_distance(longest, threshold) {
                    break;
                }
                if same_set && j <= i {
                    continue;
                }
                let other = right[j].0;
                if *title == other {
                    continue;
                }
                if let Some(score) = titles_within(title, other, threshold) {
                    out.push((i, j, score));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn rec(id: &str, title: &str, minutes: i64) -> Record {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("ts");
        Record::new(id, title, base + Duration::minutes(minutes))
    }

    #[test]
    fn duplicate_chain_collapses_to_linked_canonical() {
        let mut a = rec("A", "Fix the login redirect loop on mobile safari", 5);
        a.link("file", "42");
        let b = rec("B", "fix the login redirect loop on mobile safari", 0);
        let c = rec("C", "Fix the login redirect loop on mobile safary", 1);
        let config = DedupConfig::default();
        let detector = DuplicateDetector::new(&config);

        let out = detector.self_dedup(MatchScope::Local, &[c, b, a], |r| !r.remote_ids.is_empty());

        assert_eq!(out.clusters.len(), 1);
        assert_eq!(out.clusters[0].canonical, "A");
        let ids: Vec<_> = out.clusters[0].duplicates.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["B", "C"]);
        assert!(out.is_absorbed("B") && out.is_absorbed("C") && !out.is_absorbed("A"));
        assert_eq!(out.canonical_ids().collect::<Vec<_>>(), ["A"]);
    }

    #[test]
    fn earliest_then_lowest_id_breaks_ties() {
        let config = DedupConfig::default();
        let detector = DuplicateDetector::new(&config);
        let out = detector.self_dedup(
            MatchScope::Local,
            &[rec("b", "Same", 0), rec("a", "same", 0), rec("c", "SAME", -1)],
            |_| false,
        );
        assert_eq!(out.clusters[0].canonical, "c");

        let out = detector.self_dedup(
            MatchScope::Local,
            &[rec("b", "Same", 0), rec("a", "same", 0)],
            |_| false,
        );
        assert_eq!(out.clusters[0].canonical, "a");
    }

    #[test]
    fn unrelated_records_stay_apart() {
        let config = DedupConfig::default();
        let detector = DuplicateDetector::new(&config);
        let out = detector.self_dedup(
            MatchScope::Local,
            &[rec("1", "Add CSV export", 0), rec("2", "Migrate billing tables", 0)],
            |_| false,
        );
        assert!(out.clusters.is_empty());
        assert!(out.matches.is_empty());
    }

    #[test]
    fn remote_id_collision_is_full_confidence() {
        let mut x = rec("x", "Alpha", 0);
        let mut y = rec("y", "Completely different", 1);
        x.link("file", "9");
        y.link("file", "9");
        let config = DedupConfig::default();
        let out = DuplicateDetector::new(&config).self_dedup(MatchScope::Local, &[x, y], |_| true);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].match_type, MatchType::IdCollision);
        assert_eq!(out.matches[0].recommended, RecommendedAction::AutoMerge);
    }

    #[test]
    fn resolved_duplicates_are_kept_out_of_clusters() {
        let mut old = rec("old", "Same", 0);
        old.duplicate_of = Some("new".into());
        let config = DedupConfig::default();
        let out = DuplicateDetector::new(&config)
            .self_dedup(MatchScope::Local, &[old, rec("new", "Same", 1)], |_| false);
        assert!(out.clusters.is_empty());
        assert!(out.is_absorbed("old"));
        assert!(!out.is_absorbed("new"));
    }

    #[test]
    fn cross_dedup_pairs_each_record_once() {
        let l1 = rec("L1", "Write release notes", 0);
        let l2 = rec("L2", "write release notes", 1);
        let r1 = rec("101", "Write Release Notes", 0);
        let config = DedupConfig::default();
        let matches = DuplicateDetector::new(&config).cross_dedup(&[&l1, &l2], &[&r1]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].right, "101");
        assert_eq!(matches[0].scope, MatchScope::Cross);
    }

    #[test]
    fn cross_dedup_finds_content_matches_and_drops_weak_ones() {
        let mut l = rec("L1", "Cache evicts early", 0);
        l.body = "the lru cache evicts hot entries under memory pressure".into();
        let mut r = rec("77", "Investigate eviction", 0);
        r.body = "The LRU cache evicts hot entries under memory pressure!".into();
        let unrelated = rec("78", "Rotate signing keys", 0);
        let config = DedupConfig::default();
        let matches = DuplicateDetector::new(&config).cross_dedup(&[&l], &[&r, &unrelated]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_type, MatchType::ContentSimilarity);
        assert!((matches[0].confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn config_range_check_names_bad_fields() {
        let config = DedupConfig {
            content_threshold: 1.5,
            ..DedupConfig::default()
        };
        assert_eq!(config.out_of_range(), ["content_threshold"]);
    }
}
