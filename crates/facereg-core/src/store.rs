//! Embedding registry with running-average enrolment.
//!
//! Each person keeps a single centroid: re-registering folds the new sample
//! into the stored embedding weighted by the number of samples seen so far,
//! so storage grows with identities rather than observations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::{RegistryError, StorageError};
use crate::storage::RecordStorage;
use crate::types::{Embedding, EmbeddingRecord};

/// Per-person update permits.
///
/// The read-modify-write in [`EmbeddingStore::upsert`] runs while holding the
/// permit for its id, so concurrent updates of one person cannot lose a
/// sample. Different ids never contend on the same permit. An entry lives
/// only while some caller holds or waits on it.
#[derive(Default)]
struct KeyLocks {
    permits: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Drops the map entry for `key` once its last user lets go.
struct Release<'a> {
    locks: &'a KeyLocks,
    key: &'a str,
    permit: Arc<Mutex<()>>,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let Ok(mut permits) = self.locks.permits.lock() else {
            return;
        };
        // Clones are only handed out under the map lock, so a count of two
        // (map + this caller) means nobody else holds or awaits the permit.
        if Arc::strong_count(&self.permit) == 2 {
            permits.remove(self.key);
        }
    }
}

impl KeyLocks {
    /// Run `f` while holding the permit for `key`.
    fn with_permit<T>(&self, key: &str, f: impl FnOnce() -> T) -> Result<T, StorageError> {
        let release = Release {
            locks: self,
            key,
            permit: self.permit(key)?,
        };
        // The permit guards no data, so a poisoned lock is still usable.
        let _guard = release
            .permit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f())
    }

    fn permit(&self, key: &str) -> Result<Arc<Mutex<()>>, StorageError> {
        let mut permits = self.permits.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(Arc::clone(
            permits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }
}

/// Owns the record collection through an injected [`RecordStorage`] and is
/// the only writer of `embedding` and `sample_count`.
pub struct EmbeddingStore<S> {
    storage: S,
    locks: KeyLocks,
}

impl<S: RecordStorage> EmbeddingStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            locks: KeyLocks::default(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Create the record for `person_id`, or fold `embedding` into the
    /// existing one.
    ///
    /// A new record stores `embedding` as-is with `sample_count = 1`. An
    /// existing record becomes `(old * n + embedding) / (n + 1)` with
    /// `sample_count = n + 1`; `image_ref` is appended unless already listed.
    /// `timestamp` defaults to now.
    ///
    /// A vector whose length differs from the stored one fails with
    /// [`RegistryError::DimensionMismatch`] and leaves the record untouched.
    /// Any failed or unacknowledged write is reported as
    /// [`RegistryError::PersistenceFailure`].
    pub fn upsert(
        &self,
        person_id: &str,
        embedding: Embedding,
        image_ref: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<EmbeddingRecord, RegistryError> {
        self.locks.with_permit(person_id, || {
            self.upsert_locked(person_id, embedding, image_ref, timestamp)
        })?
    }

    fn upsert_locked(
        &self,
        person_id: &str,
        embedding: Embedding,
        image_ref: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<EmbeddingRecord, RegistryError> {
        let updated_at = timestamp.unwrap_or_else(Utc::now);

        let record = match self.storage.load(person_id)? {
            None => EmbeddingRecord {
                person_id: person_id.to_string(),
                embedding,
                sample_count: 1,
                image_refs: image_ref.map(str::to_string).into_iter().collect(),
                updated_at,
            },
            Some(existing) => {
                if let Err(err) = existing.embedding.ensure_same_dim(&embedding) {
                    tracing::warn!(
                        person_id,
                        stored = existing.embedding.dim(),
                        supplied = embedding.dim(),
                        "rejecting embedding with mismatched dimension"
                    );
                    return Err(err);
                }

                let mut image_refs = existing.image_refs;
                if let Some(image_ref) = image_ref {
                    if !image_refs.iter().any(|r| r == image_ref) {
                        image_refs.push(image_ref.to_string());
                    }
                }

                EmbeddingRecord {
                    person_id: existing.person_id,
                    embedding: running_average(
                        &existing.embedding,
                        existing.sample_count,
                        &embedding,
                    ),
                    sample_count: existing.sample_count.saturating_add(1),
                    image_refs,
                    updated_at,
                }
            }
        };

        match self.storage.save(&record) {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(person_id, "storage did not acknowledge embedding write");
                return Err(RegistryError::PersistenceFailure(person_id.to_string()));
            }
            Err(err) => {
                tracing::error!(person_id, error = %err, "embedding write failed");
                return Err(RegistryError::PersistenceFailure(person_id.to_string()));
            }
        }

        if record.sample_count == 1 {
            tracing::info!(person_id, dim = record.embedding.dim(), "registered new identity");
        } else {
            tracing::debug!(
                person_id,
                sample_count = record.sample_count,
                "folded sample into existing identity"
            );
        }

        Ok(record)
    }

    /// Point lookup; a missing id is `Ok(None)`.
    pub fn get(&self, person_id: &str) -> Result<Option<EmbeddingRecord>, RegistryError> {
        Ok(self.storage.load(person_id)?)
    }

    /// Every registered id, in the storage's stable enumeration order.
    pub fn list_ids(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.storage.ids()?)
    }

    /// Remove the record for `person_id`, returning 1 if it existed and 0
    /// otherwise.
    pub fn delete(&self, person_id: &str) -> Result<usize, RegistryError> {
        let removed = self
            .locks
            .with_permit(person_id, || self.storage.remove(person_id))??;
        if removed > 0 {
            tracing::info!(person_id, "removed identity");
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.storage.count()?)
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len()? == 0)
    }
}

/// Weighted mean of `current` (standing for `count` samples) and one new sample.
/// Accumulates in f64 so long enrolment histories do not drift.
fn running_average(current: &Embedding, count: u64, sample: &Embedding) -> Embedding {
    let n = count as f64;
    let values = current
        .values
        .iter()
        .zip(sample.values.iter())
        .map(|(&c, &s)| ((f64::from(c) * n + f64::from(s)) / (n + 1.0)) as f32)
        .collect();
    Embedding::new(values)
}
