//! facereg-core — Face embedding registry and verification engine.
//!
//! Keeps one running-average embedding per registered person and
//! identifies probes with an exhaustive cosine-similarity scan.
//! Embedding extraction is supplied by the caller through
//! [`EmbeddingExtractor`].

pub mod error;
pub mod evaluation;
pub mod matcher;
pub mod registry;
pub mod storage;
pub mod store;
pub mod types;

pub use error::{RegistryError, StorageError};
pub use matcher::{LinearMatcher, Matcher};
pub use registry::{EmbeddingExtractor, Registry};
pub use storage::{MemoryStorage, RecordStorage, SqliteStorage};
pub use store::EmbeddingStore;
pub use types::{Embedding, EmbeddingRecord, MatchResult};
