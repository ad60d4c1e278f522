use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Cosine similarity required for a positive identification.
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// CLI configuration: an optional TOML file named by `FACEREG_CONFIG`,
/// overridden field by field by `FACEREG_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite embedding database.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Reject input vectors of any other length before they reach the registry.
    pub expected_dimension: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("embeddings.db"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            expected_dimension: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let base = match std::env::var_os("FACEREG_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(base.with_env())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `FACEREG_DB_PATH`, `FACEREG_SIMILARITY_THRESHOLD` and
    /// `FACEREG_EXPECTED_DIMENSION` on top of `self`.
    pub fn with_env(self) -> Self {
        Self {
            db_path: std::env::var("FACEREG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(self.db_path),
            similarity_threshold: env_f32("FACEREG_SIMILARITY_THRESHOLD", self.similarity_threshold),
            expected_dimension: env_usize("FACEREG_EXPECTED_DIMENSION").or(self.expected_dimension),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facereg")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facereg.toml");
        std::fs::write(&path, "similarity_threshold = 0.55\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.similarity_threshold, 0.55);
        assert_eq!(config.expected_dimension, None);
        assert_eq!(config.db_path, Config::default().db_path);
    }

    #[test]
    fn test_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facereg.toml");
        std::fs::write(
            &path,
            "db_path = \"/srv/facereg/faces.db\"\nsimilarity_threshold = 0.8\nexpected_dimension = 512\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/srv/facereg/faces.db"));
        assert_eq!(config.similarity_threshold, 0.8);
        assert_eq!(config.expected_dimension, Some(512));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facereg.toml");
        std::fs::write(&path, "treshold = 0.5\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_default_threshold() {
        assert_eq!(Config::default().similarity_threshold, 0.7);
    }
}
