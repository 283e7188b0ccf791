//! Per-subject registration pipeline.
//!
//! Stages run in a fixed order with no way back:
//! reset origin, geometric mean per bvalue, rigid/affine alignment,
//! cross-bvalue co-registration onto the b0 image, reslicing, nonlinear
//! registration of the b0 rigid image, deformation of every bvalue, and
//! finally the manifest write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::engine::RegistrationEngine;
use crate::error::{PipelineError, Result};
use crate::manifest::write_subject_manifest;
use crate::types::{group_by_bvalue, BValue, Stage, SubjectManifest, SubjectVolumes, TMP_DIR};
use crate::util::{copy_file, ensure_dir, file_name_string, image_suffix, remove_dir_with_retry};

pub(crate) const GEOMEAN_PREFIX: &str = "geomean";
pub(crate) const CO_RIGID_PREFIX: &str = "co-rigid_";
pub(crate) const CO_AFFINE_PREFIX: &str = "co-affine_";
pub(crate) const RESLICED_PREFIX: &str = "resliced_";
pub(crate) const NONLINEAR_PREFIX: &str = "nonlinear_";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SubjectRun {
    Completed(SubjectManifest),
    /// Not preprocessable: no b0 group, or a single bvalue group.
    Discarded,
}

/// A subject needs a b0 group and at least one other bvalue group.
pub(crate) fn is_preprocessable(volumes: &SubjectVolumes) -> bool {
    let groups = group_by_bvalue(volumes);
    groups.len() >= 2 && groups.contains_key(&BValue::ZERO)
}

pub(crate) fn geomean_file_name(bval: BValue, suffix: &str) -> String {
    format!("{GEOMEAN_PREFIX}__bval{}{suffix}", bval.label())
}

/// Fail the stage unless the engine actually produced `path`.
fn expect_output(stage: &str, path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(PipelineError::engine(
            stage,
            format!("engine reported {} but it does not exist", path.display()),
        ))
    }
}

pub(crate) struct SubjectPipeline<'a> {
    pub(crate) engine: &'a dyn RegistrationEngine,
    pub(crate) key: &'a str,
    pub(crate) volumes: &'a SubjectVolumes,
    pub(crate) subject_dir: &'a Path,
    pub(crate) voxel_size: f64,
}

impl SubjectPipeline<'_> {
    pub(crate) fn run(&self) -> Result<SubjectRun> {
        if !is_preprocessable(self.volumes) {
            tracing::info!(subject = %self.key, "no b0 group or single bvalue group, discarding");
            remove_dir_with_retry(self.subject_dir);
            return Ok(SubjectRun::Discarded);
        }

        let tmp_dir = self.subject_dir.join(TMP_DIR);
        ensure_dir(&tmp_dir)?;

        let resets = self.reset_origins(&tmp_dir)?;
        let mut manifest = SubjectManifest::default();

        let geomeans = self.geometric_means(&resets)?;
        for (bval, path) in &geomeans {
            manifest.record(Stage::Denoise, *bval, path.clone());
        }

        let aligned = self.align(&geomeans, &tmp_dir)?;
        let co_rigid = self.coregister(&aligned, &tmp_dir, CO_RIGID_PREFIX, |a| &a.0)?;
        let co_affine = self.coregister(&aligned, &tmp_dir, CO_AFFINE_PREFIX, |a| &a.1)?;

        tracing::debug!(subject = %self.key, stage = "reslice");
        for (bval, path) in &co_rigid {
            let out = self
                .engine
                .reslice(path, self.subject_dir, self.voxel_size, RESLICED_PREFIX)?;
            manifest.record(Stage::Rigid, *bval, expect_output("reslice", out)?);
        }
        for (bval, path) in &co_affine {
            let out = self
                .engine
                .reslice(path, self.subject_dir, self.voxel_size, RESLICED_PREFIX)?;
            manifest.record(Stage::Affine, *bval, expect_output("reslice", out)?);
        }

        tracing::debug!(subject = %self.key, stage = "nonlinear_register");
        let reference = co_rigid
            .get(&BValue::ZERO)
            .ok_or_else(|| PipelineError::engine("nonlinear_register", "no b0 rigid image"))?;
        let field = expect_output(
            "nonlinear_register",
            self.engine.nonlinear_register(reference)?,
        )?;

        tracing::debug!(subject = %self.key, stage = "apply_deformation");
        for (bval, path) in &co_rigid {
            let warped = expect_output(
                "apply_deformation",
                self.engine.apply_deformation(path, &field, self.voxel_size)?,
            )?;
            let target = self
                .subject_dir
                .join(format!("{NONLINEAR_PREFIX}{}", file_name_string(path)));
            manifest.record(Stage::Nonlinear, *bval, copy_file(&warped, &target)?);
            manifest.record(Stage::DefField, *bval, field.clone());
        }

        write_subject_manifest(self.subject_dir, self.key, &manifest)?;
        tracing::info!(subject = %self.key, bvalues = geomeans.len(), "subject complete");
        Ok(SubjectRun::Completed(manifest))
    }

    /// Copy each input into `tmp/` and reset its origin there, grouped by bvalue.
    fn reset_origins(&self, tmp_dir: &Path) -> Result<BTreeMap<BValue, Vec<PathBuf>>> {
        tracing::debug!(subject = %self.key, stage = "reset_origin");
        let mut groups: BTreeMap<BValue, Vec<PathBuf>> = BTreeMap::new();
        for (i, (path, bval)) in self.volumes.iter().enumerate() {
            // Merged subjects can carry volumes with the same file name.
            let local = tmp_dir.join(format!("{i}_{}", file_name_string(path)));
            copy_file(path, &local)?;
            let reset = expect_output("reset_origin", self.engine.reset_origin(&local)?)?;
            groups.entry(*bval).or_default().push(reset);
        }
        Ok(groups)
    }

    fn geometric_means(
        &self,
        groups: &BTreeMap<BValue, Vec<PathBuf>>,
    ) -> Result<BTreeMap<BValue, PathBuf>> {
        tracing::debug!(subject = %self.key, stage = "geometric_mean");
        let mut means = BTreeMap::new();
        for (bval, paths) in groups {
            let suffix = image_suffix(&paths[0]);
            let out = self.subject_dir.join(geomean_file_name(*bval, &suffix));
            let mean = if paths.len() == 1 {
                copy_file(&paths[0], &out)?
            } else {
                expect_output("geometric_mean", self.engine.geometric_mean(paths, &out)?)?
            };
            means.insert(*bval, mean);
        }
        Ok(means)
    }

    fn align(
        &self,
        geomeans: &BTreeMap<BValue, PathBuf>,
        tmp_dir: &Path,
    ) -> Result<BTreeMap<BValue, (PathBuf, PathBuf)>> {
        tracing::debug!(subject = %self.key, stage = "align");
        let mut aligned = BTreeMap::new();
        for (bval, path) in geomeans {
            let alignment = self.engine.align(path, tmp_dir)?;
            let rigid = expect_output("align", alignment.rigid)?;
            let affine = expect_output("align", alignment.affine)?;
            aligned.insert(*bval, (rigid, affine));
        }
        Ok(aligned)
    }

    /// Bring every bvalue onto the b0 image. The b0 image goes first so the
    /// engine uses it as the reference.
    fn coregister(
        &self,
        aligned: &BTreeMap<BValue, (PathBuf, PathBuf)>,
        tmp_dir: &Path,
        prefix: &str,
        pick: impl Fn(&(PathBuf, PathBuf)) -> &PathBuf,
    ) -> Result<BTreeMap<BValue, PathBuf>> {
        tracing::debug!(subject = %self.key, stage = "coregister", prefix);
        let mut order: Vec<BValue> = Vec::with_capacity(aligned.len());
        order.push(BValue::ZERO);
        order.extend(aligned.keys().filter(|b| !b.is_zero()).copied());

        let inputs: Vec<PathBuf> = order.iter().map(|b| pick(&aligned[b]).clone()).collect();
        let outputs = self.engine.coregister(&inputs, tmp_dir, prefix)?;
        if outputs.len() != inputs.len() {
            return Err(PipelineError::engine(
                "coregister",
                format!("expected {} images, engine returned {}", inputs.len(), outputs.len()),
            ));
        }
        let mut registered = BTreeMap::new();
        for (bval, out) in order.into_iter().zip(outputs) {
            registered.insert(bval, expect_output("coregister", out)?);
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{read_manifest_file, subject_manifest_path};
    use crate::testing::{make_inputs, FakeFactory, Fault};
    use crate::engine::EngineFactory;

    fn volumes(paths: &[PathBuf], bvals: &[f64]) -> SubjectVolumes {
        paths
            .iter()
            .zip(bvals)
            .map(|(p, b)| (p.clone(), BValue::new(*b).unwrap()))
            .collect()
    }

    #[test]
    fn test_full_pipeline_produces_every_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = make_inputs(&tmp.path().join("in"), &["a_b0.nii", "a_b1000.nii"]);
        let vols = volumes(&inputs, &[0.0, 1000.0]);
        let dir = tmp.path().join("out/A");
        let factory = FakeFactory::default();
        let engine = factory.open_session("A").unwrap();

        let run = SubjectPipeline {
            engine: engine.as_ref(),
            key: "A",
            volumes: &vols,
            subject_dir: &dir,
            voxel_size: 2.0,
        }
        .run()
        .unwrap();

        let SubjectRun::Completed(manifest) = run else {
            panic!("subject should complete");
        };
        for stage in [Stage::Denoise, Stage::Rigid, Stage::Affine, Stage::Nonlinear, Stage::DefField] {
            let outputs = manifest.stage(stage).unwrap();
            let keys: Vec<String> = outputs.keys().map(|b| b.to_string()).collect();
            assert_eq!(keys, vec!["0.0", "1000.0"], "stage {stage}");
        }
        assert!(manifest.inv_def_field.is_none());
        assert!(manifest.leaf_paths().iter().all(|p| p.exists()));

        let def = manifest.def_field.as_ref().unwrap();
        assert_eq!(def[&BValue::ZERO], def[&BValue::new(1000.0).unwrap()]);

        let on_disk = read_manifest_file(&subject_manifest_path(&dir)).unwrap();
        assert_eq!(on_disk["A"], manifest);
    }

    #[test]
    fn test_single_group_subject_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = make_inputs(&tmp.path().join("in"), &["b_b0.nii", "b_b0_rep.nii"]);
        let vols = volumes(&inputs, &[0.0, 0.0]);
        let dir = tmp.path().join("out/B");
        std::fs::create_dir_all(dir.join("tmp")).unwrap();
        let factory = FakeFactory::default();
        let engine = factory.open_session("B").unwrap();

        let run = SubjectPipeline {
            engine: engine.as_ref(),
            key: "B",
            volumes: &vols,
            subject_dir: &dir,
            voxel_size: 2.0,
        }
        .run()
        .unwrap();

        assert_eq!(run, SubjectRun::Discarded);
        assert!(!dir.exists());
        assert_eq!(factory.call_count(), 0);
    }

    #[test]
    fn test_missing_b0_group_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = make_inputs(&tmp.path().join("in"), &["c_b500.nii", "c_b1000.nii"]);
        let vols = volumes(&inputs, &[500.0, 1000.0]);
        assert!(!is_preprocessable(&vols));
    }

    #[test]
    fn test_repeated_volumes_use_engine_geometric_mean() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = make_inputs(
            &tmp.path().join("in"),
            &["b0_1.nii", "b0_2.nii", "b1000.nii"],
        );
        let vols = volumes(&inputs, &[0.0, 0.0, 1000.0]);
        let dir = tmp.path().join("out/R");
        let factory = FakeFactory::default();
        let engine = factory.open_session("R").unwrap();

        let run = SubjectPipeline {
            engine: engine.as_ref(),
            key: "R",
            volumes: &vols,
            subject_dir: &dir,
            voxel_size: 1.5,
        }
        .run()
        .unwrap();
        let SubjectRun::Completed(manifest) = run else {
            panic!("subject should complete");
        };
        let b0_mean = &manifest.denoise.as_ref().unwrap()[&BValue::ZERO];
        assert_eq!(std::fs::read_to_string(b0_mean).unwrap(), "geomean");
        let b1000_mean = &manifest.denoise.as_ref().unwrap()[&BValue::new(1000.0).unwrap()];
        assert_eq!(std::fs::read_to_string(b1000_mean).unwrap(), "volume");
    }

    #[test]
    fn test_stage_failure_aborts_without_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let inputs = make_inputs(&tmp.path().join("in"), &["a_b0.nii", "a_b1000.nii"]);
        let vols = volumes(&inputs, &[0.0, 1000.0]);
        let dir = tmp.path().join("out/X");
        let factory = FakeFactory::failing("X", "nonlinear_register", Fault::Error);
        let engine = factory.open_session("X").unwrap();

        let err = SubjectPipeline {
            engine: engine.as_ref(),
            key: "X",
            volumes: &vols,
            subject_dir: &dir,
            voxel_size: 2.0,
        }
        .run()
        .unwrap_err();

        assert!(matches!(err, PipelineError::Engine { ref stage, .. } if stage == "nonlinear_register"));
        assert!(!subject_manifest_path(&dir).exists());
    }
}
