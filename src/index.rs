//! Source index loading and filtering.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::types::{BValue, SplitDiffusionIndex};

/// One subject entry of the source index.
///
/// Everything besides the known fields is kept in `extra` so metadata such
/// as the series UID can be looked up later.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SourceEntry {
    #[serde(default)]
    pub(crate) split_dwi: Option<BTreeMap<PathBuf, BValue>>,
    #[serde(default)]
    pub(crate) metadata: Option<PathBuf>,
    #[serde(default)]
    pub(crate) non_head: Option<serde_json::Value>,
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, serde_json::Value>,
}

impl SourceEntry {
    pub(crate) fn is_non_head(&self) -> bool {
        match &self.non_head {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y")
            }
            Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => false,
        }
    }
}

pub(crate) type SourceIndex = BTreeMap<String, SourceEntry>;

pub(crate) fn load_source_index(path: &Path) -> Result<SourceIndex> {
    if !path.is_file() {
        return Err(PipelineError::config(format!(
            "index file {} does not exist",
            path.display()
        )));
    }
    let data = fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("cannot read index {}: {e}", path.display()))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        PipelineError::config(format!("malformed index {}: {e}", path.display()))
    })
}

/// Keep entries that carry diffusion split information and are not
/// flagged as non-head acquisitions.
pub(crate) fn split_diffusion_index(source: &SourceIndex) -> SplitDiffusionIndex {
    let mut index = SplitDiffusionIndex::new();
    for (key, entry) in source {
        let Some(split) = entry.split_dwi.as_ref() else {
            tracing::debug!(subject = %key, "no split_dwi, skipping");
            continue;
        };
        if entry.is_non_head() {
            tracing::debug!(subject = %key, "flagged non-head, skipping");
            continue;
        }
        if split.is_empty() {
            tracing::debug!(subject = %key, "empty split_dwi, skipping");
            continue;
        }
        index.insert(key.clone(), split.clone());
    }
    index
}

pub(crate) fn read_split_index(path: &Path) -> Result<(SourceIndex, SplitDiffusionIndex)> {
    let source = load_source_index(path)?;
    let index = split_diffusion_index(&source);
    tracing::info!(
        entries = source.len(),
        subjects = index.len(),
        "loaded diffusion index"
    );
    Ok((source, index))
}
