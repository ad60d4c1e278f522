use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Face embedding vector. Dimensionality is fixed by the extraction model
/// (typically 512) and is checked on every comparison and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Fail with [`RegistryError::DimensionMismatch`] unless `other` has the
    /// same length as `self`.
    pub fn ensure_same_dim(&self, other: &Embedding) -> Result<(), RegistryError> {
        if self.dim() != other.dim() {
            return Err(RegistryError::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }
        Ok(())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-norm operand
    /// scores 0.0, as does any pair whose arithmetic goes non-finite (NaN or
    /// infinite components). Every dimension is visited regardless of the
    /// values seen.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, RegistryError> {
        self.ensure_same_dim(other)?;

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = dot / denom;
        Ok(if denom > 0.0 && sim.is_finite() {
            sim.clamp(-1.0, 1.0)
        } else {
            0.0
        })
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, RegistryError> {
        self.ensure_same_dim(other)?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// The representative embedding registered for one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub person_id: String,
    pub embedding: Embedding,
    /// Number of observations averaged into `embedding`.
    pub sample_count: u64,
    /// Contributing image references, in first-seen order, without duplicates.
    pub image_refs: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of matching a probe embedding against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1], 0.0 when nothing was scanned.
    pub similarity: f32,
    /// Person ID of the match (only when `matched`).
    pub person_id: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            person_id: None,
        }
    }
}
