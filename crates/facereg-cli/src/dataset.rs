//! Embedding files on disk.
//!
//! An embedding file is a JSON array of numbers. An evaluation dataset is a
//! directory with one sub-directory per registered person holding genuine
//! probes, plus an `impostors/` sub-directory of unregistered faces.

use anyhow::{bail, Context, Result};
use facereg_core::evaluation::Probe;
use facereg_core::Embedding;
use std::path::{Path, PathBuf};

const IMPOSTOR_DIR: &str = "impostors";
/// The enrolment sample inside a person's directory; never used as a probe.
const ENROLMENT_FILE: &str = "reg.json";

pub fn read_embedding(path: &Path, expected_dimension: Option<usize>) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading embedding {}", path.display()))?;
    let embedding: Embedding = serde_json::from_str(&raw)
        .with_context(|| format!("parsing embedding {}", path.display()))?;

    if embedding.values.is_empty() {
        bail!("embedding {} is empty", path.display());
    }
    if let Some(expected) = expected_dimension {
        if embedding.dim() != expected {
            bail!(
                "embedding {} has {} dimensions, expected {expected}",
                path.display(),
                embedding.dim()
            );
        }
    }
    Ok(embedding)
}

/// Load all probes under `root`, in sorted path order.
pub fn load_probes(root: &Path, expected_dimension: Option<usize>) -> Result<Vec<Probe>> {
    let mut probes = Vec::new();

    for dir in sorted_entries(root)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };

        for file in sorted_entries(&dir)? {
            if file.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if name == IMPOSTOR_DIR {
                probes.push(Probe::Impostor {
                    embedding: read_embedding(&file, expected_dimension)?,
                });
            } else if file.file_name().and_then(|n| n.to_str()) != Some(ENROLMENT_FILE) {
                probes.push(Probe::Genuine {
                    expected: name.clone(),
                    embedding: read_embedding(&file, expected_dimension)?,
                });
            }
        }
    }

    tracing::debug!(root = %root.display(), count = probes.len(), "loaded probes");
    Ok(probes)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}
