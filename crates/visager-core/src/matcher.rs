//! Nearest-neighbour identity matching.

use crate::store::IdentityStore;
use crate::types::Embedding;

/// Default cosine-distance threshold, tuned for ArcFace embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching a probe embedding against the identity store.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, set only when `distance` is below the threshold.
    pub name: Option<String>,
    /// Best cosine distance seen across all identities, whether or not it
    /// matched. `None` when nothing in the store was comparable.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.name.is_some()
    }
}

/// Strategy for resolving a probe embedding to a known identity.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, store: &IdentityStore, threshold: f32) -> MatchResult;
}

/// Minimum cosine distance matcher.
///
/// Each identity scores the distance of its closest reference embedding;
/// the identity with the lowest score wins if that score is strictly below
/// the threshold. Ties go to the identity inserted first. Embeddings whose
/// dimensionality differs from the probe are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, store: &IdentityStore, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in store.records().iter().enumerate() {
            let record_min = record
                .embeddings
                .iter()
                .filter(|e| e.dim() == probe.dim())
                .map(|e| probe.distance(e))
                // Overflowing or NaN components poison the min; drop them.
                .filter(|d| d.is_finite())
                .fold(None, |min: Option<f32>, d| match min {
                    Some(m) if m <= d => Some(m),
                    _ => Some(d),
                });

            let Some(d) = record_min else {
                continue;
            };
            if best.map_or(true, |(_, b)| d < b) {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, d)) if d < threshold => MatchResult {
                name: Some(store.records()[idx].name.clone()),
                distance: Some(d),
            },
            Some((_, d)) => MatchResult {
                name: None,
                distance: Some(d),
            },
            None => MatchResult {
                name: None,
                distance: None,
            },
        }
    }
}
