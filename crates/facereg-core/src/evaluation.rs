//! Offline accuracy evaluation of a populated registry.
//!
//! Genuine probes carry the identity they should resolve to; impostor
//! probes belong to nobody registered and should not match at all.

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::matcher::Matcher;
use crate::registry::Registry;
use crate::storage::RecordStorage;
use crate::types::Embedding;

/// Smoothing term added to ratio denominators.
const EPSILON: f64 = 1e-6;

/// A labelled probe embedding.
#[derive(Debug, Clone)]
pub enum Probe {
    Genuine { expected: String, embedding: Embedding },
    Impostor { embedding: Embedding },
}

/// Confusion counts and derived scores for one evaluation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub threshold: f32,
    pub true_positives: u64,
    pub false_negatives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
}

impl EvaluationReport {
    pub fn total(&self) -> u64 {
        self.true_positives + self.false_negatives + self.false_positives + self.true_negatives
    }

    /// Fraction of probes classified correctly; 0.0 for an empty run.
    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.true_positives + self.true_negatives) as f64 / total as f64,
        }
    }

    pub fn precision(&self) -> f64 {
        self.true_positives as f64
            / ((self.true_positives + self.false_positives) as f64 + EPSILON)
    }

    pub fn recall(&self) -> f64 {
        self.true_positives as f64
            / ((self.true_positives + self.false_negatives) as f64 + EPSILON)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        2.0 * p * r / (p + r + EPSILON)
    }
}

/// Verify every probe against `registry` and tally the outcomes.
///
/// A genuine probe resolving to a different identity counts as a false
/// negative, not a false positive.
pub fn evaluate<S, M, I>(
    registry: &Registry<S, M>,
    probes: I,
    threshold: f32,
) -> Result<EvaluationReport, RegistryError>
where
    S: RecordStorage,
    M: Matcher,
    I: IntoIterator<Item = Probe>,
{
    let mut report = EvaluationReport {
        threshold,
        ..Default::default()
    };

    for probe in probes {
        match probe {
            Probe::Genuine { expected, embedding } => {
                let predicted = registry.verify(&embedding, threshold)?;
                tracing::debug!(expected = %expected, predicted = ?predicted, "genuine probe");
                if predicted.as_deref() == Some(expected.as_str()) {
                    report.true_positives += 1;
                } else {
                    report.false_negatives += 1;
                }
            }
            Probe::Impostor { embedding } => match registry.verify(&embedding, threshold)? {
                Some(matched) => {
                    tracing::info!(matched = %matched, "impostor accepted");
                    report.false_positives += 1;
                }
                None => report.true_negatives += 1,
            },
        }
    }

    tracing::info!(
        total = report.total(),
        accuracy = report.accuracy(),
        precision = report.precision(),
        recall = report.recall(),
        "evaluation complete"
    );

    Ok(report)
}
