//! In-process engine double for tests. Every operation writes a small file
//! where a real engine would write its output and counts the call.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::{Alignment, AverageMethod, EngineFactory, RegistrationEngine};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Error,
    Panic,
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub(crate) calls: Arc<AtomicUsize>,
    /// Session name to (operation, fault).
    pub(crate) faults: BTreeMap<String, (&'static str, Fault)>,
}

impl FakeFactory {
    pub(crate) fn failing(session: &str, op: &'static str, fault: Fault) -> Self {
        let mut factory = Self::default();
        factory.faults.insert(session.to_string(), (op, fault));
        factory
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EngineFactory for FakeFactory {
    fn open_session(&self, session: &str) -> Result<Box<dyn RegistrationEngine>> {
        Ok(Box::new(FakeEngine {
            calls: Arc::clone(&self.calls),
            fault: self.faults.get(session).copied(),
        }))
    }
}

pub(crate) struct FakeEngine {
    calls: Arc<AtomicUsize>,
    fault: Option<(&'static str, Fault)>,
}

fn touch(path: &Path, content: &str) -> Result<PathBuf> {
    fs::write(path, content).map_err(|e| PipelineError::io(path, e))?;
    Ok(path.to_path_buf())
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn sibling(path: &Path, prefix: &str) -> PathBuf {
    path.with_file_name(format!("{prefix}{}", name_of(path)))
}

impl FakeEngine {
    fn enter(&self, op: &'static str, inputs: &[&Path]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((fault_op, fault)) = self.fault {
            if fault_op == op {
                match fault {
                    Fault::Error => return Err(PipelineError::engine(op, "injected failure")),
                    Fault::Panic => panic!("injected panic in {op}"),
                }
            }
        }
        for input in inputs {
            if !input.is_file() {
                return Err(PipelineError::engine(
                    op,
                    format!("{} does not exist", input.display()),
                ));
            }
        }
        Ok(())
    }
}

impl RegistrationEngine for FakeEngine {
    fn reset_origin(&self, path: &Path) -> Result<PathBuf> {
        self.enter("reset_origin", &[path])?;
        Ok(path.to_path_buf())
    }

    fn geometric_mean(&self, paths: &[PathBuf], out_path: &Path) -> Result<PathBuf> {
        let inputs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.enter("geometric_mean", &inputs)?;
        touch(out_path, "geomean")
    }

    fn align(&self, path: &Path, out_dir: &Path) -> Result<Alignment> {
        self.enter("align", &[path])?;
        let name = name_of(path);
        Ok(Alignment {
            rigid: touch(&out_dir.join(format!("rigid_{name}")), "rigid")?,
            affine: touch(&out_dir.join(format!("affine_{name}")), "affine")?,
        })
    }

    fn coregister(&self, paths: &[PathBuf], out_dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
        let inputs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.enter("coregister", &inputs)?;
        paths
            .iter()
            .map(|p| touch(&out_dir.join(format!("{prefix}{}", name_of(p))), "co"))
            .collect()
    }

    fn reslice(&self, path: &Path, out_dir: &Path, _voxel_size: f64, prefix: &str) -> Result<PathBuf> {
        self.enter("reslice", &[path])?;
        touch(&out_dir.join(format!("{prefix}{}", name_of(path))), "resliced")
    }

    fn nonlinear_register(&self, path: &Path) -> Result<PathBuf> {
        self.enter("nonlinear_register", &[path])?;
        touch(&sibling(path, "y_"), "field")
    }

    fn apply_deformation(&self, path: &Path, field: &Path, _voxel_size: f64) -> Result<PathBuf> {
        self.enter("apply_deformation", &[path, field])?;
        touch(&sibling(path, "w"), "warped")
    }

    fn average(
        &self,
        paths: &[PathBuf],
        method: AverageMethod,
        out_dir: &Path,
        prefix: &str,
    ) -> Result<PathBuf> {
        let inputs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.enter("average", &inputs)?;
        touch(
            &out_dir.join(format!("{prefix}{}.nii", method.as_str())),
            method.as_str(),
        )
    }
}

/// Create empty input volumes and return them.
pub(crate) fn make_inputs(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"volume").unwrap();
            path
        })
        .collect()
}
