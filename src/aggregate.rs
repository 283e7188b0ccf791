//! Cross-subject aggregation: the global manifest and group statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::engine::{AverageMethod, RegistrationEngine};
use crate::error::{PipelineError, Result};
use crate::manifest::{global_manifest_path, read_manifest_file, write_global_manifest};
use crate::nifti::{is_uncompressed_nifti, write_zero_like};
use crate::types::{
    BValue, GlobalManifest, Stage, GROUP_STATS_DIR, GROUP_STATS_MANIFEST_FILE, SUBJECT_MANIFEST_FILE,
};
use crate::util::{copy_file, ensure_dir, image_suffix, write_json_atomic};

// ── Global manifest ─────────────────────────────────────────────────────

/// Union of every `<root>/<subject>/__preproc_dict.json`.
pub(crate) fn collect_global_manifest(root: &Path) -> Result<GlobalManifest> {
    let mut global = GlobalManifest::new();
    let walker = WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .follow_links(false);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() || entry.file_name() != SUBJECT_MANIFEST_FILE {
            continue;
        }
        let manifests = match read_manifest_file(entry.path()) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "skipping unreadable manifest");
                continue;
            }
        };
        for (key, manifest) in manifests {
            if global.contains_key(&key) {
                tracing::warn!(subject = %key, path = %entry.path().display(), "duplicate subject key, keeping first");
                continue;
            }
            global.insert(key, manifest);
        }
    }
    Ok(global)
}

/// Load the cached global manifest, or rebuild it from subject directories
/// and refresh the cache.
pub(crate) fn load_global_manifest(root: &Path, rescan: bool) -> Result<GlobalManifest> {
    let cache = global_manifest_path(root);
    if !rescan && cache.is_file() {
        match read_manifest_file(&cache) {
            Ok(global) => return Ok(global),
            Err(err) => {
                tracing::warn!(path = %cache.display(), error = %err, "cached manifest unreadable, rescanning");
            }
        }
    }
    if !root.is_dir() {
        return Err(PipelineError::config(format!(
            "{} is not an output directory",
            root.display()
        )));
    }
    let global = collect_global_manifest(root)?;
    write_global_manifest(&cache, &global)?;
    tracing::info!(path = %cache.display(), subjects = global.len(), "rebuilt global manifest");
    Ok(global)
}

// ── Group statistics ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct StatImages {
    pub(crate) mean: PathBuf,
    pub(crate) std: PathBuf,
}

/// Stage name to bvalue to mean/std images.
pub(crate) type GroupStats = BTreeMap<String, BTreeMap<BValue, StatImages>>;

/// Distinct images per (stage, bvalue). Merged subjects share their
/// outputs, so the same file is only counted once.
pub(crate) fn images_by_stage(global: &GlobalManifest) -> BTreeMap<(Stage, BValue), Vec<PathBuf>> {
    let mut grouped: BTreeMap<(Stage, BValue), BTreeSet<PathBuf>> = BTreeMap::new();
    for manifest in global.values() {
        for stage in Stage::IMAGES {
            let Some(outputs) = manifest.stage(stage) else { continue };
            for (bval, path) in outputs {
                grouped.entry((stage, *bval)).or_default().insert(path.clone());
            }
        }
    }
    grouped
        .into_iter()
        .map(|(k, set)| (k, set.into_iter().collect()))
        .collect()
}

fn single_image_stats(
    engine: &dyn RegistrationEngine,
    image: &Path,
    out_dir: &Path,
    prefix: &str,
) -> Result<StatImages> {
    let suffix = image_suffix(image);
    let mean = copy_file(image, &out_dir.join(format!("{prefix}mean{suffix}")))?;
    let std = if is_uncompressed_nifti(image) {
        let out = out_dir.join(format!("{prefix}std{suffix}"));
        write_zero_like(image, &out)?;
        out
    } else {
        engine.average(&[image.to_path_buf()], AverageMethod::Std, out_dir, prefix)?
    };
    Ok(StatImages { mean, std })
}

pub(crate) fn group_statistics(
    global: &GlobalManifest,
    engine: &dyn RegistrationEngine,
    out_dir: &Path,
) -> Result<GroupStats> {
    ensure_dir(out_dir)?;
    let mut stats = GroupStats::new();
    for ((stage, bval), images) in images_by_stage(global) {
        let prefix = format!("{stage}__bval{}_", bval.label());
        let entry = match images.as_slice() {
            [] => continue,
            [single] => single_image_stats(engine, single, out_dir, &prefix)?,
            _ => StatImages {
                mean: engine.average(&images, AverageMethod::Mean, out_dir, &prefix)?,
                std: engine.average(&images, AverageMethod::Std, out_dir, &prefix)?,
            },
        };
        tracing::debug!(stage = %stage, bvalue = %bval, images = images.len(), "group statistics");
        stats.entry(stage.to_string()).or_default().insert(bval, entry);
    }
    let index = out_dir.join(GROUP_STATS_MANIFEST_FILE);
    write_json_atomic(&index, &stats)?;
    tracing::info!(path = %index.display(), "wrote group statistics");
    Ok(stats)
}

pub(crate) fn group_stats_dir(root: &Path) -> PathBuf {
    root.join(GROUP_STATS_DIR)
}
