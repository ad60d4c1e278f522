//! Storage handles injected into [`EmbeddingStore`](crate::store::EmbeddingStore).
//!
//! A backend only persists whole records; averaging and per-key
//! serialisation live in the store. Every backend enumerates ids in
//! lexicographic order so matching is reproducible across backends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::types::{Embedding, EmbeddingRecord};

/// Persistence seam for embedding records.
pub trait RecordStorage: Send + Sync {
    fn load(&self, person_id: &str) -> Result<Option<EmbeddingRecord>, StorageError>;

    /// Write `record` in full, replacing any existing row for its id.
    ///
    /// Returns whether the backend acknowledged the write.
    fn save(&self, record: &EmbeddingRecord) -> Result<bool, StorageError>;

    /// All stored ids, lexicographically ordered.
    fn ids(&self) -> Result<Vec<String>, StorageError>;

    /// Remove a record, returning the number of rows deleted (0 or 1).
    fn remove(&self, person_id: &str) -> Result<usize, StorageError>;

    fn count(&self) -> Result<usize, StorageError>;
}

/// Process-local storage, used by tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<String, EmbeddingRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStorage for MemoryStorage {
    fn load(&self, person_id: &str) -> Result<Option<EmbeddingRecord>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        Ok(records.get(person_id).cloned())
    }

    fn save(&self, record: &EmbeddingRecord) -> Result<bool, StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        records.insert(record.person_id.clone(), record.clone());
        Ok(true)
    }

    fn ids(&self) -> Result<Vec<String>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        Ok(records.keys().cloned().collect())
    }

    fn remove(&self, person_id: &str) -> Result<usize, StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        Ok(usize::from(records.remove(person_id).is_some()))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        Ok(records.len())
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS face_embeddings (
    person_id TEXT PRIMARY KEY NOT NULL,
    dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    sample_count INTEGER NOT NULL CHECK(sample_count >= 1),
    image_refs TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed storage. One row per person; the embedding is a
/// little-endian f32 blob alongside its dimension.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

/// Raw column values of one `face_embeddings` row.
struct RawRow {
    person_id: String,
    dimension: i64,
    embedding: Vec<u8>,
    sample_count: i64,
    image_refs: String,
    updated_at: String,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(path = %path.display(), "opened sqlite embedding storage");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        f(&conn)
    }
}

impl RecordStorage for SqliteStorage {
    fn load(&self, person_id: &str) -> Result<Option<EmbeddingRecord>, StorageError> {
        let raw = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT person_id, dimension, embedding, sample_count, image_refs, updated_at
                     FROM face_embeddings WHERE person_id = ?1",
                    params![person_id],
                    |row| {
                        Ok(RawRow {
                            person_id: row.get(0)?,
                            dimension: row.get(1)?,
                            embedding: row.get(2)?,
                            sample_count: row.get(3)?,
                            image_refs: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        raw.map(decode_row).transpose()
    }

    fn save(&self, record: &EmbeddingRecord) -> Result<bool, StorageError> {
        let dimension = to_i64(record.embedding.dim(), &record.person_id, "dimension")?;
        let sample_count = i64::try_from(record.sample_count).map_err(|_| StorageError::Corrupt {
            person_id: record.person_id.clone(),
            reason: "sample_count overflows i64".to_string(),
        })?;
        let blob = encode_f32_blob(&record.embedding.values);
        let image_refs = serde_json::to_string(&record.image_refs)?;
        let updated_at = record.updated_at.to_rfc3339();

        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO face_embeddings (
                    person_id, dimension, embedding, sample_count, image_refs, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(person_id) DO UPDATE SET
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    sample_count = excluded.sample_count,
                    image_refs = excluded.image_refs,
                    updated_at = excluded.updated_at",
                params![
                    record.person_id,
                    dimension,
                    blob,
                    sample_count,
                    image_refs,
                    updated_at
                ],
            )?)
        })?;

        Ok(changed == 1)
    }

    fn ids(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT person_id FROM face_embeddings ORDER BY person_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn remove(&self, person_id: &str) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM face_embeddings WHERE person_id = ?1",
                params![person_id],
            )?)
        })
    }

    fn count(&self) -> Result<usize, StorageError> {
        let count = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM face_embeddings", [], |row| {
                row.get::<_, i64>(0)
            })?)
        })?;
        usize::try_from(count).map_err(|_| StorageError::Corrupt {
            person_id: String::new(),
            reason: format!("negative row count {count}"),
        })
    }
}

fn decode_row(raw: RawRow) -> Result<EmbeddingRecord, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        person_id: raw.person_id.clone(),
        reason,
    };

    let dimension = usize::try_from(raw.dimension)
        .map_err(|_| corrupt(format!("invalid dimension {}", raw.dimension)))?;
    let values = decode_f32_blob(&raw.embedding, dimension).map_err(corrupt)?;
    let sample_count = u64::try_from(raw.sample_count)
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| corrupt(format!("invalid sample_count {}", raw.sample_count)))?;
    let image_refs: Vec<String> = serde_json::from_str(&raw.image_refs)?;
    let updated_at = DateTime::parse_from_rfc3339(&raw.updated_at)
        .map_err(|e| corrupt(format!("invalid updated_at {:?}: {e}", raw.updated_at)))?
        .with_timezone(&Utc);

    Ok(EmbeddingRecord {
        person_id: raw.person_id,
        embedding: Embedding::new(values),
        sample_count,
        image_refs,
        updated_at,
    })
}

fn to_i64(value: usize, person_id: &str, field: &str) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Corrupt {
        person_id: person_id.to_string(),
        reason: format!("{field} overflows i64"),
    })
}

fn encode_f32_blob(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_f32_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>, String> {
    let expected = dimension
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| "embedding blob length overflows".to_string())?;
    if blob.len() != expected {
        return Err(format!(
            "embedding blob is {} bytes, expected {expected}",
            blob.len()
        ));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, values: &[f32], refs: &[&str]) -> EmbeddingRecord {
        EmbeddingRecord {
            person_id: id.to_string(),
            embedding: Embedding::new(values.to_vec()),
            sample_count: 1,
            image_refs: refs.iter().map(|r| r.to_string()).collect(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn exercise_backend(storage: &dyn RecordStorage) {
        assert!(storage.load("CU/21/0001").unwrap().is_none());
        assert_eq!(storage.count().unwrap(), 0);

        let a = record("CU/21/0002", &[0.25, -0.5, 1.0], &["a.jpg"]);
        let b = record("CU/21/0001", &[1.0, 0.0, 0.0], &[]);
        assert!(storage.save(&a).unwrap());
        assert!(storage.save(&b).unwrap());

        assert_eq!(storage.load("CU/21/0002").unwrap(), Some(a.clone()));
        assert_eq!(storage.ids().unwrap(), vec!["CU/21/0001", "CU/21/0002"]);
        assert_eq!(storage.count().unwrap(), 2);

        let mut updated = a.clone();
        updated.sample_count = 2;
        updated.image_refs.push("b.jpg".into());
        assert!(storage.save(&updated).unwrap());
        assert_eq!(storage.load("CU/21/0002").unwrap(), Some(updated));
        assert_eq!(storage.count().unwrap(), 2);

        assert_eq!(storage.remove("CU/21/0002").unwrap(), 1);
        assert_eq!(storage.remove("CU/21/0002").unwrap(), 0);
        assert_eq!(storage.ids().unwrap(), vec!["CU/21/0001"]);
    }

    #[test]
    fn test_memory_backend() {
        exercise_backend(&MemoryStorage::new());
    }

    #[test]
    fn test_sqlite_backend() {
        exercise_backend(&SqliteStorage::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("faces.db");
        let rec = record("p1", &[0.1, 0.2, 0.3, f32::MIN_POSITIVE], &["x.png", "y.png"]);

        {
            let storage = SqliteStorage::open(&path).unwrap();
            assert!(storage.save(&rec).unwrap());
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let loaded = storage.load("p1").unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.embedding.values[3].to_bits(), f32::MIN_POSITIVE.to_bits());
    }

    #[test]
    fn test_sqlite_rejects_truncated_blob() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO face_embeddings VALUES ('bad', 3, x'0000803f', 1, '[]', '2024-05-01T12:00:00+00:00')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        match storage.load("bad") {
            Err(StorageError::Corrupt { person_id, .. }) => assert_eq!(person_id, "bad"),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_blob_codec() {
        let values = [1.0f32, -2.5, 0.0, 3.25];
        let blob = encode_f32_blob(&values);
        assert_eq!(blob.len(), 16);
        assert_eq!(decode_f32_blob(&blob, 4).unwrap(), values);
        assert!(decode_f32_blob(&blob, 3).is_err());
    }
}
