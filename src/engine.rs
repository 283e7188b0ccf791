//! Registration engine seam.
//!
//! The numerical work (origin reset, registration, reslicing, warping,
//! averaging) lives in an external engine. The pipeline only hands it file
//! paths and gets file paths back. `CommandEngine` talks to an engine
//! executable: one process per operation, a JSON request on stdin and a
//! JSON response on stdout.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use crate::error::{PipelineError, Result};
use crate::types::{CommandSpec, EngineSpec};
use crate::util::{build_external_command, kill_process_tree};

const ENGINE_STREAM_CAP_BYTES: usize = 64 * 1024;
const ENGINE_POLL_SLEEP_MS: u64 = 10;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Alignment {
    pub(crate) rigid: PathBuf,
    pub(crate) affine: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AverageMethod {
    Mean,
    Std,
}

impl AverageMethod {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
        }
    }
}

/// Operations the pipeline needs from a registration engine.
///
/// Every call is synchronous and must fail when an input file is missing.
pub(crate) trait RegistrationEngine {
    fn reset_origin(&self, path: &Path) -> Result<PathBuf>;
    fn geometric_mean(&self, paths: &[PathBuf], out_path: &Path) -> Result<PathBuf>;
    fn align(&self, path: &Path, out_dir: &Path) -> Result<Alignment>;
    /// The first returned path is the reference image.
    fn coregister(&self, paths: &[PathBuf], out_dir: &Path, prefix: &str) -> Result<Vec<PathBuf>>;
    fn reslice(&self, path: &Path, out_dir: &Path, voxel_size: f64, prefix: &str) -> Result<PathBuf>;
    fn nonlinear_register(&self, path: &Path) -> Result<PathBuf>;
    fn apply_deformation(&self, path: &Path, field: &Path, voxel_size: f64) -> Result<PathBuf>;
    fn average(
        &self,
        paths: &[PathBuf],
        method: AverageMethod,
        out_dir: &Path,
        prefix: &str,
    ) -> Result<PathBuf>;
}

/// Opens engine sessions. Sessions are never shared between subjects.
pub(crate) trait EngineFactory: Sync {
    fn open_session(&self, session: &str) -> Result<Box<dyn RegistrationEngine>>;
}

// ── Command engine ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct EngineResponse {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    rigid: Option<PathBuf>,
    #[serde(default)]
    affine: Option<PathBuf>,
}

pub(crate) fn command_spec_to_vec(spec: &CommandSpec) -> Vec<String> {
    match spec {
        CommandSpec::Array(items) => items.clone(),
        CommandSpec::String(cmd) => {
            if cfg!(windows) {
                vec!["cmd".to_string(), "/C".to_string(), cmd.clone()]
            } else {
                vec!["sh".to_string(), "-c".to_string(), cmd.clone()]
            }
        }
    }
}

pub(crate) struct CommandEngineFactory {
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandEngineFactory {
    pub(crate) fn new(spec: &EngineSpec) -> Result<Self> {
        let command = command_spec_to_vec(&spec.command);
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(PipelineError::config("engine command is empty"));
        }
        Ok(Self {
            command,
            timeout: spec.timeout_ms.map(|ms| Duration::from_millis(ms.max(1))),
        })
    }
}

impl EngineFactory for CommandEngineFactory {
    fn open_session(&self, session: &str) -> Result<Box<dyn RegistrationEngine>> {
        let serial = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(CommandEngine {
            command: self.command.clone(),
            timeout: self.timeout,
            session: format!("{session}#{}-{serial}", std::process::id()),
        }))
    }
}

pub(crate) struct CommandEngine {
    command: Vec<String>,
    timeout: Option<Duration>,
    session: String,
}

fn require_inputs<'a>(op: &str, paths: impl IntoIterator<Item = &'a Path>) -> Result<()> {
    for path in paths {
        if !path.is_file() {
            return Err(PipelineError::engine(
                op,
                format!("{} does not exist", path.display()),
            ));
        }
    }
    Ok(())
}

fn require_dir(op: &str, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(PipelineError::engine(
            op,
            format!("{} is not a directory", dir.display()),
        ));
    }
    Ok(())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn path_list(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| path_str(p)).collect()
}

impl CommandEngine {
    fn call(&self, op: &str, args: serde_json::Value) -> Result<EngineResponse> {
        let request = json!({ "op": op, "session": self.session, "args": args });
        tracing::trace!(op, session = %self.session, "engine call");
        let raw = run_engine_command(&self.command, &request, self.timeout, op, &self.session)
            .map_err(|e| PipelineError::engine(op, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| PipelineError::engine(op, format!("invalid engine output: {e}")))
    }

    fn single_path(&self, op: &str, args: serde_json::Value) -> Result<PathBuf> {
        self.call(op, args)?
            .path
            .ok_or_else(|| PipelineError::engine(op, "engine response lacks 'path'"))
    }
}

impl RegistrationEngine for CommandEngine {
    fn reset_origin(&self, path: &Path) -> Result<PathBuf> {
        require_inputs("reset_origin", [path])?;
        self.single_path("reset_origin", json!({ "path": path_str(path) }))
    }

    fn geometric_mean(&self, paths: &[PathBuf], out_path: &Path) -> Result<PathBuf> {
        require_inputs("geometric_mean", paths.iter().map(PathBuf::as_path))?;
        self.single_path(
            "geometric_mean",
            json!({ "paths": path_list(paths), "out_path": path_str(out_path) }),
        )
    }

    fn align(&self, path: &Path, out_dir: &Path) -> Result<Alignment> {
        require_inputs("align", [path])?;
        require_dir("align", out_dir)?;
        let response = self.call(
            "align",
            json!({ "path": path_str(path), "out_dir": path_str(out_dir) }),
        )?;
        match (response.rigid, response.affine) {
            (Some(rigid), Some(affine)) => Ok(Alignment { rigid, affine }),
            _ => Err(PipelineError::engine(
                "align",
                "engine response lacks 'rigid' or 'affine'",
            )),
        }
    }

    fn coregister(&self, paths: &[PathBuf], out_dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
        require_inputs("coregister", paths.iter().map(PathBuf::as_path))?;
        require_dir("coregister", out_dir)?;
        self.call(
            "coregister",
            json!({
                "paths": path_list(paths),
                "out_dir": path_str(out_dir),
                "prefix": prefix,
            }),
        )?
        .paths
        .ok_or_else(|| PipelineError::engine("coregister", "engine response lacks 'paths'"))
    }

    fn reslice(&self, path: &Path, out_dir: &Path, voxel_size: f64, prefix: &str) -> Result<PathBuf> {
        require_inputs("reslice", [path])?;
        require_dir("reslice", out_dir)?;
        self.single_path(
            "reslice",
            json!({
                "path": path_str(path),
                "out_dir": path_str(out_dir),
                "voxel_size": voxel_size,
                "prefix": prefix,
            }),
        )
    }

    fn nonlinear_register(&self, path: &Path) -> Result<PathBuf> {
        require_inputs("nonlinear_register", [path])?;
        self.single_path("nonlinear_register", json!({ "path": path_str(path) }))
    }

    fn apply_deformation(&self, path: &Path, field: &Path, voxel_size: f64) -> Result<PathBuf> {
        require_inputs("apply_deformation", [path, field])?;
        self.single_path(
            "apply_deformation",
            json!({
                "path": path_str(path),
                "field": path_str(field),
                "voxel_size": voxel_size,
            }),
        )
    }

    fn average(
        &self,
        paths: &[PathBuf],
        method: AverageMethod,
        out_dir: &Path,
        prefix: &str,
    ) -> Result<PathBuf> {
        require_inputs("average", paths.iter().map(PathBuf::as_path))?;
        require_dir("average", out_dir)?;
        self.single_path(
            "average",
            json!({
                "paths": path_list(paths),
                "method": method.as_str(),
                "out_dir": path_str(out_dir),
                "prefix": prefix,
            }),
        )
    }
}

// ── Process plumbing ────────────────────────────────────────────────────

fn capture_stream<R: Read + Send + 'static>(reader: R) -> thread::JoinHandle<(Vec<u8>, bool)> {
    thread::spawn(move || {
        let mut captured: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut buffer = [0_u8; 4096];
        let mut reader = reader;
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let remaining = ENGINE_STREAM_CAP_BYTES.saturating_sub(captured.len());
                    if remaining > 0 {
                        let take = remaining.min(n);
                        captured.extend_from_slice(&buffer[..take]);
                        if n > take {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        (captured, truncated)
    })
}

/// Run one engine operation and return its trimmed stdout.
pub(crate) fn run_engine_command(
    command: &[String],
    input: &serde_json::Value,
    timeout: Option<Duration>,
    op: &str,
    session: &str,
) -> std::result::Result<String, String> {
    if command.is_empty() {
        return Err("engine command is empty".into());
    }
    let mut cmd = build_external_command(&command[0], &command[1..]);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("DWIREG_ENGINE_OP", op)
        .env("DWIREG_SESSION", session);

    let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;
    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(input).map_err(|e| format!("encode input: {e}"))?;
        stdin
            .write_all(&payload)
            .and_then(|_| stdin.flush())
            .map_err(|e| format!("write stdin: {e}"))?;
    }

    let start = Instant::now();
    let mut stdout_handle = child.stdout.take().map(capture_stream);
    let mut stderr_handle = child.stderr.take().map(capture_stream);

    let mut timed_out = false;
    let status = loop {
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                timed_out = true;
                kill_process_tree(&mut child);
                break Err("engine killed after timeout".to_string());
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                thread::sleep(Duration::from_millis(ENGINE_POLL_SLEEP_MS));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                break Err(format!("engine wait failed: {e}"));
            }
        }
    };

    let collect = |handle: &mut Option<thread::JoinHandle<(Vec<u8>, bool)>>| -> (Vec<u8>, bool) {
        handle
            .take()
            .and_then(|join| join.join().ok())
            .unwrap_or_else(|| (Vec::new(), false))
    };
    let (stdout, stdout_truncated) = collect(&mut stdout_handle);
    let (stderr, stderr_truncated) = collect(&mut stderr_handle);

    if timed_out {
        let ms = timeout.map(|t| t.as_millis()).unwrap_or_default();
        return Err(format!("engine op '{op}' timed out after {ms}ms"));
    }

    let status = status?;
    if !status.success() {
        let mut stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        if stderr.is_empty() {
            if stderr_truncated {
                return Err("engine error: stderr output exceeded capture limit".into());
            }
            return Err(format!("engine exited with {status}"));
        }
        if stderr_truncated {
            stderr.push_str(" (stderr output truncated)");
        }
        return Err(format!("engine error: {stderr}"));
    }

    let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
    if stdout.is_empty() {
        if stdout_truncated {
            return Err("engine output exceeded capture limit".into());
        }
        return Err("engine returned empty output".into());
    }
    Ok(stdout)
}
