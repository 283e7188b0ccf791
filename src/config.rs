//! Run configuration.
//!
//! Built once from CLI flags, environment and an optional JSON file, then
//! passed by reference into the dispatcher and executors. Precedence is
//! CLI, then environment, then file, then defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::{EngineArgs, RunArgs};
use crate::error::{PipelineError, Result};
use crate::pairing::DEFAULT_UID_FIELD;
use crate::types::{CommandSpec, EngineSpec, RerunStrategy};
use crate::util::{env_optional, env_u64, env_usize};

pub(crate) const DEFAULT_VOXEL_SIZE: f64 = 2.0;
pub(crate) const CONFIG_FILE_NAME: &str = "dwireg.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) engine: Option<EngineSpec>,
    #[serde(default)]
    pub(crate) voxel_size: Option<f64>,
    #[serde(default)]
    pub(crate) rerun: Option<RerunStrategy>,
    #[serde(default)]
    pub(crate) workers: Option<usize>,
    #[serde(default)]
    pub(crate) pairing: Option<bool>,
    #[serde(default)]
    pub(crate) uid_field: Option<String>,
}

/// Load the config file. An explicit path must be valid; the implicit one
/// under the output root falls back to defaults.
pub(crate) fn load_file_config(explicit: Option<&Path>, output_root: &Path) -> Result<FileConfig> {
    match explicit {
        Some(path) => {
            let data = fs::read_to_string(path).map_err(|e| {
                PipelineError::config(format!("cannot read config {}: {e}", path.display()))
            })?;
            serde_json::from_str(&data).map_err(|e| {
                PipelineError::config(format!("malformed config {}: {e}", path.display()))
            })
        }
        None => {
            let path = output_root.join(CONFIG_FILE_NAME);
            match fs::read_to_string(&path) {
                Ok(data) => Ok(serde_json::from_str(&data).unwrap_or_else(|err| {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring malformed config");
                    FileConfig::default()
                })),
                Err(_) => Ok(FileConfig::default()),
            }
        }
    }
}

pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(4)
}

/// Engine command from CLI, `DWIREG_ENGINE`, or the file, in that order.
pub(crate) fn resolve_engine_spec(args: &EngineArgs, file: Option<EngineSpec>) -> Result<EngineSpec> {
    let timeout_ms = match args.engine_timeout_ms {
        Some(ms) => Some(ms),
        None => env_u64("DWIREG_ENGINE_TIMEOUT_MS")?,
    };
    let command = args.engine.clone().or_else(|| env_optional("DWIREG_ENGINE"));
    if let Some(cmd) = command {
        return Ok(EngineSpec {
            command: CommandSpec::String(cmd),
            timeout_ms: timeout_ms.or(file.and_then(|spec| spec.timeout_ms)),
        });
    }
    match file {
        Some(mut spec) => {
            if timeout_ms.is_some() {
                spec.timeout_ms = timeout_ms;
            }
            Ok(spec)
        }
        None => Err(PipelineError::config(
            "no registration engine configured (use --engine, DWIREG_ENGINE or the config file)",
        )),
    }
}

pub(crate) fn validate_voxel_size(voxel_size: f64) -> Result<f64> {
    if voxel_size.is_finite() && voxel_size > 0.0 {
        Ok(voxel_size)
    } else {
        Err(PipelineError::config(format!(
            "voxel size must be positive, got {voxel_size}"
        )))
    }
}

/// Immutable settings for one batch.
#[derive(Debug, Clone)]
pub(crate) struct RunConfig {
    pub(crate) index_path: PathBuf,
    pub(crate) output_root: PathBuf,
    pub(crate) voxel_size: f64,
    pub(crate) strategy: RerunStrategy,
    pub(crate) workers: usize,
    pub(crate) pairing: bool,
    pub(crate) uid_field: String,
    pub(crate) engine: EngineSpec,
}

impl RunConfig {
    pub(crate) fn from_args(args: &RunArgs) -> Result<Self> {
        if !args.index.is_file() {
            return Err(PipelineError::config(format!(
                "{} is not an existing index file",
                args.index.display()
            )));
        }
        fs::create_dir_all(&args.output).map_err(|e| {
            PipelineError::config(format!(
                "cannot create output root {}: {e}",
                args.output.display()
            ))
        })?;

        let file = load_file_config(args.engine.config.as_deref(), &args.output)?;
        let voxel_size =
            validate_voxel_size(args.voxel_size.or(file.voxel_size).unwrap_or(DEFAULT_VOXEL_SIZE))?;
        let workers = match args.workers {
            Some(n) => Some(n),
            None => env_usize("DWIREG_WORKERS")?,
        }
        .or(file.workers)
        .filter(|n| *n > 0)
        .unwrap_or_else(default_workers);

        Ok(Self {
            index_path: args.index.clone(),
            output_root: args.output.clone(),
            voxel_size,
            strategy: args.rerun.or(file.rerun).unwrap_or_default(),
            workers,
            pairing: !args.no_pairing && file.pairing.unwrap_or(true),
            uid_field: args
                .uid_field
                .clone()
                .or(file.uid_field)
                .unwrap_or_else(|| DEFAULT_UID_FIELD.to_string()),
            engine: resolve_engine_spec(&args.engine, file.engine)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(dir: &Path) -> RunArgs {
        let index = dir.join("index.json");
        fs::write(&index, "{}").unwrap();
        RunArgs {
            index,
            output: dir.join("out"),
            voxel_size: None,
            rerun: None,
            workers: None,
            no_pairing: false,
            uid_field: None,
            group_stats: false,
            json: false,
            engine: EngineArgs {
                engine: Some("engine-cli".into()),
                engine_timeout_ms: None,
                config: None,
            },
        }
    }

    #[test]
    fn test_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RunConfig::from_args(&run_args(tmp.path())).unwrap();
        assert_eq!(config.voxel_size, DEFAULT_VOXEL_SIZE);
        assert_eq!(config.strategy, RerunStrategy::Resume);
        assert!(config.workers >= 1);
        assert!(config.pairing);
        assert_eq!(config.uid_field, DEFAULT_UID_FIELD);
        assert!(config.output_root.is_dir());
    }

    #[test]
    fn test_file_config_is_overridden_by_cli() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg.json");
        fs::write(
            &cfg,
            r#"{"engine": {"command": ["eng", "--x"], "timeout_ms": 500},
                "voxel_size": 1.0, "rerun": "delete", "workers": 3, "pairing": false}"#,
        )
        .unwrap();
        let mut args = run_args(tmp.path());
        args.engine.engine = None;
        args.engine.config = Some(cfg);
        args.voxel_size = Some(1.5);

        let config = RunConfig::from_args(&args).unwrap();
        assert_eq!(config.voxel_size, 1.5);
        assert_eq!(config.strategy, RerunStrategy::Delete);
        assert_eq!(config.workers, 3);
        assert!(!config.pairing);
        assert_eq!(config.engine.timeout_ms, Some(500));
        assert!(matches!(config.engine.command, CommandSpec::Array(ref argv) if argv[0] == "eng"));
    }

    #[test]
    fn test_missing_index_is_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut args = run_args(tmp.path());
        args.index = tmp.path().join("missing.json");
        assert!(RunConfig::from_args(&args).unwrap_err().is_configuration());
    }

    #[test]
    fn test_malformed_explicit_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg.json");
        fs::write(&cfg, "{not json").unwrap();
        let mut args = run_args(tmp.path());
        args.engine.config = Some(cfg);
        assert!(RunConfig::from_args(&args).unwrap_err().is_configuration());
    }

    #[test]
    fn test_invalid_voxel_size() {
        assert!(validate_voxel_size(0.0).is_err());
        assert!(validate_voxel_size(f64::NAN).is_err());
        assert_eq!(validate_voxel_size(1.25).unwrap(), 1.25);
    }
}
