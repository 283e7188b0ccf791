//! Manifest persistence.
//!
//! Manifests are strongly typed in memory and only become nested JSON
//! mappings here, at the storage boundary.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};
use crate::types::{GlobalManifest, SubjectManifest, GLOBAL_MANIFEST_FILE, SUBJECT_MANIFEST_FILE};
use crate::util::write_json_atomic;

pub(crate) fn subject_manifest_path(subject_dir: &Path) -> PathBuf {
    subject_dir.join(SUBJECT_MANIFEST_FILE)
}

pub(crate) fn global_manifest_path(root: &Path) -> PathBuf {
    root.join(GLOBAL_MANIFEST_FILE)
}

/// Read a manifest file of shape `{subject-key: {stage: {bvalue: path}}}`.
pub(crate) fn read_manifest_file(path: &Path) -> Result<GlobalManifest> {
    let data = fs::read_to_string(path).at(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Persist one subject's manifest, keyed by its subject key.
pub(crate) fn write_subject_manifest(
    subject_dir: &Path,
    key: &str,
    manifest: &SubjectManifest,
) -> Result<PathBuf> {
    write_merged_manifest(subject_dir, &[key.to_string()], manifest)
}

/// Persist a manifest shared by several subject keys, one entry per key, so
/// a rescan of the output root finds every member of a merged subject.
pub(crate) fn write_merged_manifest(
    subject_dir: &Path,
    keys: &[String],
    manifest: &SubjectManifest,
) -> Result<PathBuf> {
    let path = subject_manifest_path(subject_dir);
    let wrapped: GlobalManifest = keys.iter().map(|k| (k.clone(), manifest.clone())).collect();
    write_json_atomic(&path, &wrapped)?;
    Ok(path)
}

pub(crate) fn write_global_manifest(path: &Path, manifest: &GlobalManifest) -> Result<()> {
    write_json_atomic(path, manifest)
}
