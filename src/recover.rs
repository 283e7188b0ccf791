//! Recovering manifests from subject directories.
//!
//! Output file names carry their stage as a prefix and their bvalue as a
//! `__bval<label>` suffix, so a directory left without a manifest (an
//! interrupted run, a manual fix-up) can be indexed again from its contents.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::aggregate::load_global_manifest;
use crate::engine::EngineFactory;
use crate::error::{IoContext, Result};
use crate::executor::{CO_AFFINE_PREFIX, CO_RIGID_PREFIX, GEOMEAN_PREFIX, NONLINEAR_PREFIX, RESLICED_PREFIX};
use crate::manifest::{subject_manifest_path, write_subject_manifest};
use crate::resume::manifest_is_complete;
use crate::types::{BValue, Stage, SubjectManifest, ERRORS_DIR, GROUP_STATS_DIR, TMP_DIR};
use crate::util::{copy_file, file_name_string, is_image_file};

const BVAL_MARKER: &str = "__bval";

fn stage_for_name(name: &str) -> Option<Stage> {
    let rigid = format!("{RESLICED_PREFIX}{CO_RIGID_PREFIX}");
    let affine = format!("{RESLICED_PREFIX}{CO_AFFINE_PREFIX}");
    let denoise = format!("{GEOMEAN_PREFIX}{BVAL_MARKER}");
    if name.starts_with(&rigid) {
        Some(Stage::Rigid)
    } else if name.starts_with(&affine) {
        Some(Stage::Affine)
    } else if name.starts_with(NONLINEAR_PREFIX) {
        Some(Stage::Nonlinear)
    } else if name.starts_with(&denoise) {
        Some(Stage::Denoise)
    } else {
        None
    }
}

/// Bvalue encoded in a file name such as `geomean__bval1000.nii.gz`.
pub(crate) fn bvalue_from_name(name: &str) -> Option<BValue> {
    let (_, tail) = name.rsplit_once(BVAL_MARKER)?;
    let label = tail
        .strip_suffix(".nii.gz")
        .or_else(|| tail.strip_suffix(".nii"))
        .or_else(|| tail.strip_suffix(".img"))
        .unwrap_or(tail);
    BValue::parse(label).ok()
}

/// Rebuild a subject manifest from the files present in `dir`.
pub(crate) fn rebuild_manifest_from_dir(dir: &Path) -> Result<SubjectManifest> {
    let mut manifest = SubjectManifest::default();
    let mut bvalues: BTreeSet<BValue> = BTreeSet::new();

    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if !path.is_file() || !is_image_file(&path) {
            continue;
        }
        let name = file_name_string(&path);
        let Some(bval) = bvalue_from_name(&name) else { continue };
        bvalues.insert(bval);
        if let Some(stage) = stage_for_name(&name) {
            manifest.record(stage, bval, path);
        }
    }

    let field_prefix = format!("y_{CO_RIGID_PREFIX}");
    let inverse_prefix = format!("iy_{CO_RIGID_PREFIX}");
    let tmp = dir.join(TMP_DIR);
    for entry in WalkDir::new(&tmp).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let stage = if name.starts_with(&field_prefix) {
            Stage::DefField
        } else if name.starts_with(&inverse_prefix) {
            Stage::InvDefField
        } else {
            continue;
        };
        // One field serves every bvalue of the subject.
        for bval in &bvalues {
            manifest.record(stage, *bval, entry.path());
        }
    }

    manifest.prune_empty();
    Ok(manifest)
}

#[derive(Debug, Default)]
pub(crate) struct RepairReport {
    pub(crate) repaired: Vec<String>,
    pub(crate) skipped: Vec<String>,
}

fn has_required_groups(manifest: &SubjectManifest) -> bool {
    let bvalues: BTreeSet<BValue> = [Stage::Denoise, Stage::Rigid]
        .iter()
        .filter_map(|s| manifest.stage(*s))
        .flat_map(|outputs| outputs.keys().copied())
        .collect();
    bvalues.len() >= 2 && bvalues.contains(&BValue::ZERO)
}

/// Warp rigid images that have no nonlinear counterpart yet.
fn fill_nonlinear(
    dir: &Path,
    key: &str,
    manifest: &mut SubjectManifest,
    factory: &dyn EngineFactory,
    voxel_size: f64,
) -> Result<()> {
    let (Some(rigid), Some(fields)) = (manifest.rigid.clone(), manifest.def_field.clone()) else {
        return Ok(());
    };
    let done: BTreeSet<BValue> = manifest
        .nonlinear
        .as_ref()
        .map(|m| m.keys().copied().collect())
        .unwrap_or_default();
    let pending: Vec<(BValue, PathBuf)> = rigid.into_iter().filter(|(b, _)| !done.contains(b)).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let engine = factory.open_session(key)?;
    for (bval, resliced) in pending {
        let Some(field) = fields.get(&bval) else { continue };
        let name = file_name_string(&resliced);
        let unresliced = dir
            .join(TMP_DIR)
            .join(name.strip_prefix(RESLICED_PREFIX).unwrap_or(&name));
        let warped = engine.apply_deformation(&unresliced, field, voxel_size)?;
        let target = dir.join(format!("{NONLINEAR_PREFIX}{}", file_name_string(&unresliced)));
        manifest.record(Stage::Nonlinear, bval, copy_file(&warped, &target)?);
    }
    Ok(())
}

fn repair_subject(dir: &Path, key: &str, factory: &dyn EngineFactory, voxel_size: f64) -> Result<bool> {
    let mut manifest = rebuild_manifest_from_dir(dir)?;
    if !has_required_groups(&manifest) {
        tracing::warn!(subject = %key, "not enough bvalue groups to persist, skipping");
        return Ok(false);
    }
    fill_nonlinear(dir, key, &mut manifest, factory, voxel_size)?;
    write_subject_manifest(dir, key, &manifest)?;
    Ok(true)
}

/// Index every subject directory under `root` without a complete manifest,
/// finishing missing nonlinear outputs on the way, then refresh the global
/// manifest.
pub(crate) fn repair_root(root: &Path, factory: &dyn EngineFactory, voxel_size: f64) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .at(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let key = file_name_string(&dir);
        if matches!(key.as_str(), ERRORS_DIR | GROUP_STATS_DIR | TMP_DIR) {
            continue;
        }
        if manifest_is_complete(&subject_manifest_path(&dir)) {
            continue;
        }
        match repair_subject(&dir, &key, factory, voxel_size) {
            Ok(true) => {
                tracing::info!(subject = %key, "repaired subject manifest");
                report.repaired.push(key);
            }
            Ok(false) => report.skipped.push(key),
            Err(err) => {
                tracing::error!(subject = %key, error = %err, "repair failed");
                report.skipped.push(key);
            }
        }
    }

    load_global_manifest(root, true)?;
    Ok(report)
}
