//! Public registration and verification entry points.

use crate::error::RegistryError;
use crate::matcher::{LinearMatcher, Matcher};
use crate::storage::RecordStorage;
use crate::store::EmbeddingStore;
use crate::types::{Embedding, EmbeddingRecord, MatchResult};

/// Turns an image into a face embedding.
///
/// `Ok(None)` means no face was found. Callers surface that as
/// [`RegistryError::ExtractionFailed`] and never substitute a zero vector.
pub trait EmbeddingExtractor {
    type Error: std::error::Error + Send + Sync + 'static;

    fn extract(&mut self, image: &[u8]) -> Result<Option<Embedding>, Self::Error>;
}

/// Sequences the [`EmbeddingStore`] and a [`Matcher`]. Holds no state of its
/// own beyond the store.
pub struct Registry<S, M = LinearMatcher> {
    store: EmbeddingStore<S>,
    matcher: M,
}

impl<S: RecordStorage> Registry<S> {
    pub fn new(store: EmbeddingStore<S>) -> Self {
        Self::with_matcher(store, LinearMatcher)
    }
}

impl<S: RecordStorage, M: Matcher> Registry<S, M> {
    pub fn with_matcher(store: EmbeddingStore<S>, matcher: M) -> Self {
        Self { store, matcher }
    }

    pub fn store(&self) -> &EmbeddingStore<S> {
        &self.store
    }

    /// Register one observation for `person_id`.
    ///
    /// Repeat registrations are folded into the existing centroid. Returns
    /// `Ok(false)` when the storage write failed or was not acknowledged.
    /// Shape errors such as [`RegistryError::DimensionMismatch`] and failures
    /// reading the existing record are returned as `Err`.
    pub fn register(
        &self,
        person_id: &str,
        embedding: Embedding,
        image_ref: Option<&str>,
    ) -> Result<bool, RegistryError> {
        match self.store.upsert(person_id, embedding, image_ref, None) {
            Ok(_) => Ok(true),
            Err(err) if err.is_persistence_failure() => {
                tracing::error!(person_id, error = %err, "registration not persisted");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Person ID of the best registered match at or above `threshold`.
    pub fn verify(
        &self,
        embedding: &Embedding,
        threshold: f32,
    ) -> Result<Option<String>, RegistryError> {
        self.matcher.find_best_match(embedding, &self.store, threshold)
    }

    /// Like [`verify`](Self::verify), but also reports the best similarity seen.
    pub fn verify_detailed(
        &self,
        embedding: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult, RegistryError> {
        let result = self.matcher.best_match(embedding, &self.store, threshold)?;
        tracing::info!(
            matched = result.matched,
            similarity = result.similarity,
            person_id = result.person_id.as_deref().unwrap_or(""),
            "verification finished"
        );
        Ok(result)
    }

    /// Extract an embedding from `image` and register it.
    pub fn register_image<E: EmbeddingExtractor>(
        &self,
        extractor: &mut E,
        person_id: &str,
        image: &[u8],
        image_ref: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let embedding = extract(extractor, image)?;
        self.register(person_id, embedding, image_ref)
    }

    /// Extract an embedding from `image` and verify it.
    pub fn verify_image<E: EmbeddingExtractor>(
        &self,
        extractor: &mut E,
        image: &[u8],
        threshold: f32,
    ) -> Result<MatchResult, RegistryError> {
        let embedding = extract(extractor, image)?;
        self.verify_detailed(&embedding, threshold)
    }

    pub fn get_record(&self, person_id: &str) -> Result<Option<EmbeddingRecord>, RegistryError> {
        self.store.get(person_id)
    }

    /// Fetch a record that must exist, failing with [`RegistryError::NotFound`].
    pub fn require_record(&self, person_id: &str) -> Result<EmbeddingRecord, RegistryError> {
        self.store
            .get(person_id)?
            .ok_or_else(|| RegistryError::NotFound(person_id.to_string()))
    }

    pub fn list_ids(&self) -> Result<Vec<String>, RegistryError> {
        self.store.list_ids()
    }

    pub fn delete(&self, person_id: &str) -> Result<usize, RegistryError> {
        self.store.delete(person_id)
    }
}

fn extract<E: EmbeddingExtractor>(extractor: &mut E, image: &[u8]) -> Result<Embedding, RegistryError> {
    match extractor.extract(image) {
        Ok(Some(embedding)) => Ok(embedding),
        Ok(None) => {
            tracing::warn!(bytes = image.len(), "no face detected");
            Err(RegistryError::ExtractionFailed)
        }
        Err(err) => Err(RegistryError::Extractor(Box::new(err))),
    }
}
