//! Path prefix rewriting across persisted manifests.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{IoContext, PipelineError, Result};
use crate::types::{GLOBAL_MANIFEST_FILE, GROUP_STATS_MANIFEST_FILE, SUBJECT_MANIFEST_FILE};
use crate::util::write_json_atomic;

/// Replace `old` with `new` at the start of every string leaf. Returns the
/// number of leaves rewritten. Keys and nesting are left as they are.
pub(crate) fn relocate_value(value: &mut Value, old: &str, new: &str) -> usize {
    match value {
        Value::String(s) => match s.strip_prefix(old) {
            Some(rest) => {
                *s = format!("{new}{rest}");
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(|v| relocate_value(v, old, new)).sum(),
        Value::Object(map) => map.values_mut().map(|v| relocate_value(v, old, new)).sum(),
        _ => 0,
    }
}

pub(crate) fn relocate_manifest_file(path: &Path, old: &str, new: &str) -> Result<usize> {
    if old.is_empty() {
        return Err(PipelineError::config("old prefix must not be empty"));
    }
    let data = fs::read_to_string(path).at(path)?;
    let mut value: Value = serde_json::from_str(&data)?;
    let rewritten = relocate_value(&mut value, old, new);
    if rewritten > 0 {
        write_json_atomic(path, &value)?;
    }
    tracing::debug!(path = %path.display(), rewritten, "relocated manifest");
    Ok(rewritten)
}

/// Every manifest file the pipeline writes under `root`.
pub(crate) fn find_manifest_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name();
            name == SUBJECT_MANIFEST_FILE
                || name == GLOBAL_MANIFEST_FILE
                || name == GROUP_STATS_MANIFEST_FILE
        })
        .map(|e| e.into_path())
        .collect()
}

pub(crate) fn relocate_manifests(files: &[PathBuf], old: &str, new: &str) -> Result<Vec<(PathBuf, usize)>> {
    let mut report = Vec::with_capacity(files.len());
    for file in files {
        let count = relocate_manifest_file(file, old, new)?;
        report.push((file.clone(), count));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relocate_only_matching_prefixes() {
        let mut value = json!({
            "A": {
                "rigid": {"0.0": "/data/old/A/r0.nii", "1000.0": "/data/old/A/r1000.nii"},
                "affine": {"0.0": "/elsewhere/data/old/a0.nii"}
            },
            "B": {"def_field": {"0.0": "/data/older/y.nii"}}
        });
        let count = relocate_value(&mut value, "/data/old/", "/data/new/");
        assert_eq!(count, 2);
        assert_eq!(
            value,
            json!({
                "A": {
                    "rigid": {"0.0": "/data/new/A/r0.nii", "1000.0": "/data/new/A/r1000.nii"},
                    "affine": {"0.0": "/elsewhere/data/old/a0.nii"}
                },
                "B": {"def_field": {"0.0": "/data/older/y.nii"}}
            })
        );
    }

    #[test]
    fn test_relocate_file_preserves_key_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(SUBJECT_MANIFEST_FILE);
        fs::write(
            &path,
            r#"{"S": {"rigid": {"1000.0": "/data/old/r1.nii", "0.0": "/data/old/r0.nii"}, "denoise": {"0.0": "/data/old/d.nii"}}}"#,
        )
        .unwrap();

        let count = relocate_manifest_file(&path, "/data/old", "/data/new").unwrap();
        assert_eq!(count, 3);

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let stages: Vec<&String> = value["S"].as_object().unwrap().keys().collect();
        assert_eq!(stages, vec!["rigid", "denoise"]);
        let bvals: Vec<&String> = value["S"]["rigid"].as_object().unwrap().keys().collect();
        assert_eq!(bvals, vec!["1000.0", "0.0"]);
        assert_eq!(value["S"]["denoise"]["0.0"], "/data/new/d.nii");
    }

    #[test]
    fn test_find_manifest_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("A/tmp")).unwrap();
        fs::write(tmp.path().join("A").join(SUBJECT_MANIFEST_FILE), "{}").unwrap();
        fs::write(tmp.path().join(GLOBAL_MANIFEST_FILE), "{}").unwrap();
        fs::write(tmp.path().join("A/tmp/other.json"), "{}").unwrap();
        assert_eq!(find_manifest_files(tmp.path()).len(), 2);
    }

    #[test]
    fn test_empty_old_prefix_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.json");
        fs::write(&path, "{}").unwrap();
        assert!(relocate_manifest_file(&path, "", "/x").is_err());
    }
}
