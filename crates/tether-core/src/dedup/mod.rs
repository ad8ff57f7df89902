//! Duplicate detection and resolution.
//!
//! - [`union_find`]: the disjoint-set forest clusters are built on.
//! - [`similarity`]: title and content similarity scores.
//! - [`detector`]: self-dedup within one side, cross-dedup between sides.
//! - [`resolver`]: turns clusters and matches into [`ResolutionAction`]s.

pub mod detector;
pub mod resolver;
pub mod similarity;
pub mod union_find;

pub use detector::{
    AbsorbedDuplicate, DedupConfig, DuplicateCluster, DuplicateDetector, DuplicateMatch,
    MatchScope, MatchType, RecommendedAction, SelfDedup,
};
pub use resolver::{
    AppliedActions, DuplicatePlan, DuplicateResolver, ResolutionAction, ResolverContext,
    apply_actions,
};
pub use union_find::UnionFind;
