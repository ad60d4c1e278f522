//! Nearest-identity search over an [`EmbeddingStore`].

use crate::error::RegistryError;
use crate::storage::RecordStorage;
use crate::store::EmbeddingStore;
use crate::types::{Embedding, MatchResult};

/// Strategy for comparing a probe embedding against every registered identity.
///
/// Implementations must keep the first-seen candidate on equal scores and
/// accept a best score equal to `threshold`.
pub trait Matcher {
    fn best_match<S: RecordStorage>(
        &self,
        probe: &Embedding,
        store: &EmbeddingStore<S>,
        threshold: f32,
    ) -> Result<MatchResult, RegistryError>;

    /// Person ID of the best candidate scoring at least `threshold`.
    fn find_best_match<S: RecordStorage>(
        &self,
        probe: &Embedding,
        store: &EmbeddingStore<S>,
        threshold: f32,
    ) -> Result<Option<String>, RegistryError> {
        Ok(self.best_match(probe, store, threshold)?.person_id)
    }
}

/// Exhaustive cosine-similarity scan.
///
/// Always visits every registered identity; there is no pruning or early
/// exit, so cost is O(identities x dimension) per probe. Only positive
/// scores can produce a match, whatever the threshold.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearMatcher;

impl Matcher for LinearMatcher {
    fn best_match<S: RecordStorage>(
        &self,
        probe: &Embedding,
        store: &EmbeddingStore<S>,
        threshold: f32,
    ) -> Result<MatchResult, RegistryError> {
        // A candidate must beat 0.0 ("no similarity") to be considered at all.
        let mut best_sim = 0.0f32;
        let mut best_id: Option<String> = None;
        let mut scanned = 0usize;

        for person_id in store.list_ids()? {
            // Removed since the id listing was taken.
            let Some(record) = store.get(&person_id)? else {
                continue;
            };
            scanned += 1;

            let sim = probe.similarity(&record.embedding)?;
            if sim > best_sim {
                best_sim = sim;
                best_id = Some(person_id);
            }
        }

        tracing::debug!(scanned, best_similarity = best_sim, threshold, "scan complete");

        Ok(match best_id {
            Some(id) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                person_id: Some(id),
            },
            _ => MatchResult::no_match(best_sim),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn store_with(entries: &[(&str, &[f32])]) -> EmbeddingStore<MemoryStorage> {
        let store = EmbeddingStore::new(MemoryStorage::new());
        for (id, values) in entries {
            store.upsert(id, emb(values), None, None).unwrap();
        }
        store
    }

    #[test]
    fn test_scan_finds_last_entry() {
        // Best match is enumerated last, so the whole store must be visited.
        let store = store_with(&[
            ("a-decoy", &[0.0, 1.0, 0.0]),
            ("b-decoy", &[0.0, 0.0, 1.0]),
            ("c-match", &[1.0, 0.0, 0.0]),
        ]);

        let result = LinearMatcher.best_match(&emb(&[1.0, 0.0, 0.0]), &store, 0.5).unwrap();
        assert!(result.matched);
        assert_eq!(result.person_id.as_deref(), Some("c-match"));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scenario_threshold_gates_match() {
        let store = store_with(&[("A", &[1.0, 0.0, 0.0]), ("B", &[0.0, 1.0, 0.0])]);
        let query = emb(&[0.9, 0.1, 0.0]);

        assert_eq!(
            LinearMatcher.find_best_match(&query, &store, 0.5).unwrap().as_deref(),
            Some("A")
        );
        assert_eq!(LinearMatcher.find_best_match(&query, &store, 0.999).unwrap(), None);

        let result = LinearMatcher.best_match(&query, &store, 0.999).unwrap();
        assert!(!result.matched);
        assert!((result.similarity - 0.9939).abs() < 1e-3);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let store = store_with(&[("A", &[1.0, 2.0, 2.0]), ("B", &[0.0, 0.0, 1.0])]);
        let query = emb(&[2.0, 1.0, 2.0]);
        let exact = query.similarity(&emb(&[1.0, 2.0, 2.0])).unwrap();

        assert_eq!(
            LinearMatcher.find_best_match(&query, &store, exact).unwrap().as_deref(),
            Some("A")
        );
        assert_eq!(
            LinearMatcher
                .find_best_match(&query, &store, f32::from_bits(exact.to_bits() + 1))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_ties_keep_first_enumerated() {
        let store = store_with(&[
            ("zed", &[1.0, 0.0]),
            ("alpha", &[2.0, 0.0]),
            ("mid", &[3.0, 0.0]),
        ]);

        let result = LinearMatcher.best_match(&emb(&[1.0, 0.0]), &store, 0.0).unwrap();
        assert_eq!(result.person_id.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_empty_store_never_matches() {
        let store = EmbeddingStore::new(MemoryStorage::new());
        for threshold in [-5.0, -1.0, 0.0, 1.0] {
            let result = LinearMatcher.best_match(&emb(&[1.0, 0.0]), &store, threshold).unwrap();
            assert!(!result.matched);
            assert_eq!(result.person_id, None);
            assert_eq!(result.similarity, 0.0);
        }
    }

    #[test]
    fn test_non_positive_scores_never_match() {
        let store = store_with(&[("opposite", &[-1.0, 0.0]), ("orthogonal", &[0.0, 1.0])]);
        for threshold in [-1.0, -0.5, 0.0] {
            let result = LinearMatcher.best_match(&emb(&[1.0, 0.0]), &store, threshold).unwrap();
            assert!(!result.matched);
            assert_eq!(result.person_id, None);
            assert_eq!(result.similarity, 0.0);
        }
    }

    #[test]
    fn test_zero_query_matches_nobody() {
        let store = store_with(&[("A", &[1.0, 0.0])]);
        let query = emb(&[0.0, 0.0]);
        assert_eq!(LinearMatcher.find_best_match(&query, &store, 0.0).unwrap(), None);
        assert_eq!(LinearMatcher.find_best_match(&query, &store, -1.0).unwrap(), None);
    }

    #[test]
    fn test_positive_score_matches_negative_threshold() {
        let store = store_with(&[("A", &[1.0, 1.0]), ("B", &[-1.0, 0.0])]);
        let result = LinearMatcher.best_match(&emb(&[0.0, 1.0]), &store, -0.5).unwrap();
        assert_eq!(result.person_id.as_deref(), Some("A"));
        assert!((result.similarity - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_query_dimension_mismatch_is_an_error() {
        let store = store_with(&[("A", &[1.0, 0.0, 0.0])]);
        let err = LinearMatcher.best_match(&emb(&[1.0, 0.0]), &store, 0.5).unwrap_err();
        assert!(matches!(err, RegistryError::DimensionMismatch { .. }));
    }
}
