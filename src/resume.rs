//! Integrity checks and rerun decisions for a subject directory.

use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::manifest::{read_manifest_file, subject_manifest_path};
use crate::types::{RerunStrategy, SubjectManifest};
use crate::util::remove_dir_with_retry;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResumeDecision {
    /// A complete prior result exists; nothing to run.
    Cached(SubjectManifest),
    Run,
}

/// First leaf path of `manifest` that does not exist on disk.
pub(crate) fn find_missing_output(manifest: &SubjectManifest) -> Option<&Path> {
    manifest.leaf_paths().into_iter().find(|p| !p.exists())
}

/// Check that a manifest file exists, is non-empty and only points at files
/// that are present.
pub(crate) fn verify_manifest(manifest_path: &Path) -> Result<SubjectManifest> {
    verify_entries(manifest_path, None)
}

/// Like [`verify_manifest`], but the file must also hold a record saved under
/// `key`; that record is the one returned.
pub(crate) fn verify_subject_manifest(manifest_path: &Path, key: &str) -> Result<SubjectManifest> {
    verify_entries(manifest_path, Some(key))
}

fn verify_entries(manifest_path: &Path, key: Option<&str>) -> Result<SubjectManifest> {
    let missing_file = || PipelineError::Integrity {
        path: manifest_path.to_path_buf(),
        missing: manifest_path.to_path_buf(),
    };
    match fs::metadata(manifest_path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Err(missing_file()),
    }
    let mut entries = read_manifest_file(manifest_path)?;
    for manifest in entries.values() {
        if let Some(missing) = find_missing_output(manifest) {
            return Err(PipelineError::Integrity {
                path: manifest_path.to_path_buf(),
                missing: missing.to_path_buf(),
            });
        }
    }
    let found = match key {
        Some(key) => entries.remove(key).filter(|m| !m.is_empty()),
        None => entries.into_values().find(|m| !m.is_empty()),
    };
    found.ok_or_else(missing_file)
}

pub(crate) fn manifest_is_complete(manifest_path: &Path) -> bool {
    verify_manifest(manifest_path).is_ok()
}

/// Decide whether subject `key` has to run, cleaning its directory as the
/// strategy requires.
pub(crate) fn prepare_subject_dir(subject_dir: &Path, key: &str, strategy: RerunStrategy) -> ResumeDecision {
    match strategy {
        RerunStrategy::Force => ResumeDecision::Run,
        RerunStrategy::Delete => {
            if subject_dir.exists() {
                remove_dir_with_retry(subject_dir);
            }
            ResumeDecision::Run
        }
        RerunStrategy::Resume => {
            let manifest_path = subject_manifest_path(subject_dir);
            match verify_subject_manifest(&manifest_path, key) {
                Ok(manifest) => ResumeDecision::Cached(manifest),
                Err(err) => {
                    if subject_dir.exists() {
                        tracing::info!(
                            dir = %subject_dir.display(),
                            reason = %err,
                            "incomplete prior run, rerunning"
                        );
                        remove_dir_with_retry(subject_dir);
                    }
                    ResumeDecision::Run
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::write_subject_manifest;
    use crate::types::{BValue, Stage};

    fn complete_subject(dir: &Path) -> SubjectManifest {
        fs::create_dir_all(dir).unwrap();
        let image = dir.join("resliced_co-rigid_geomean__bval0.nii");
        fs::write(&image, b"img").unwrap();
        let mut manifest = SubjectManifest::default();
        manifest.record(Stage::Rigid, BValue::ZERO, image);
        write_subject_manifest(dir, "A", &manifest).unwrap();
        manifest
    }

    #[test]
    fn test_integrity_false_when_manifest_missing_or_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("__preproc_dict.json");
        assert!(!manifest_is_complete(&path));

        fs::write(&path, b"").unwrap();
        assert!(!manifest_is_complete(&path));

        fs::write(&path, b"{}").unwrap();
        assert!(!manifest_is_complete(&path));

        fs::write(&path, br#"{"A": {"rigid": {}}}"#).unwrap();
        assert!(!manifest_is_complete(&path));
    }

    #[test]
    fn test_integrity_false_when_a_leaf_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("A");
        let mut manifest = complete_subject(&dir);
        manifest.record(Stage::Affine, BValue::ZERO, dir.join("gone.nii"));
        write_subject_manifest(&dir, "A", &manifest).unwrap();

        let err = verify_manifest(&subject_manifest_path(&dir)).unwrap_err();
        assert!(matches!(err, PipelineError::Integrity { ref missing, .. } if missing.ends_with("gone.nii")));
    }

    #[test]
    fn test_integrity_true_when_every_leaf_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("A");
        complete_subject(&dir);
        assert!(manifest_is_complete(&subject_manifest_path(&dir)));
    }

    #[test]
    fn test_resume_returns_cached_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("A");
        let manifest = complete_subject(&dir);
        assert_eq!(
            prepare_subject_dir(&dir, "A", RerunStrategy::Resume),
            ResumeDecision::Cached(manifest)
        );
        assert!(dir.exists());
    }

    #[test]
    fn test_resume_deletes_incomplete_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("A");
        fs::create_dir_all(dir.join("tmp")).unwrap();
        fs::write(dir.join("tmp/partial.nii"), b"x").unwrap();

        assert_eq!(prepare_subject_dir(&dir, "A", RerunStrategy::Resume), ResumeDecision::Run);
        assert!(!dir.exists());
    }

    #[test]
    fn test_delete_and_force_strategies() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("A");
        complete_subject(&dir);
        assert_eq!(prepare_subject_dir(&dir, "A", RerunStrategy::Force), ResumeDecision::Run);
        assert!(dir.exists());

        assert_eq!(prepare_subject_dir(&dir, "A", RerunStrategy::Delete), ResumeDecision::Run);
        assert!(!dir.exists());
    }

    #[test]
    fn test_resume_reruns_when_manifest_belongs_to_another_key() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("s_1");
        fs::create_dir_all(&dir).unwrap();
        let image = dir.join("resliced_co-rigid_geomean__bval0.nii");
        fs::write(&image, b"img").unwrap();
        let mut manifest = SubjectManifest::default();
        manifest.record(Stage::Rigid, BValue::ZERO, image);
        write_subject_manifest(&dir, "s_1", &manifest).unwrap();

        let path = subject_manifest_path(&dir);
        assert!(verify_subject_manifest(&path, "s_1").is_ok());
        assert!(matches!(
            verify_subject_manifest(&path, "s/1"),
            Err(PipelineError::Integrity { .. })
        ));
        assert_eq!(prepare_subject_dir(&dir, "s/1", RerunStrategy::Resume), ResumeDecision::Run);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_strategy_runs_even_when_removal_fails() {
        let tmp = tempfile::tempdir().unwrap();
        // A plain file where the subject directory should be cannot be
        // removed as a directory tree.
        let dir = tmp.path().join("A");
        fs::write(&dir, b"not a directory").unwrap();

        assert_eq!(prepare_subject_dir(&dir, "A", RerunStrategy::Delete), ResumeDecision::Run);
        assert!(dir.exists());
    }
}
