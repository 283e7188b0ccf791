use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::error::{IoContext, PipelineError, Result};

pub(crate) const REMOVE_ATTEMPTS: u32 = 5;
pub(crate) const REMOVE_BACKOFF_MS: u64 = 200;

// ── Environment ─────────────────────────────────────────────────────────

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u64(name: &str) -> Result<Option<u64>> {
    match env_optional(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| PipelineError::config(format!("Invalid {name}"))),
        None => Ok(None),
    }
}

pub(crate) fn env_usize(name: &str) -> Result<Option<usize>> {
    match env_optional(name) {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| PipelineError::config(format!("Invalid {name}"))),
        None => Ok(None),
    }
}

// ── External commands ───────────────────────────────────────────────────

pub(crate) fn command_wrapper() -> Option<Vec<String>> {
    env_optional("DWIREG_COMMAND_WRAPPER").and_then(|raw| shlex::split(&raw))
}

pub(crate) fn build_external_command(program: &str, args: &[String]) -> ProcessCommand {
    let mut cmd = match command_wrapper() {
        Some(wrapper) if !wrapper.is_empty() => {
            let mut c = ProcessCommand::new(&wrapper[0]);
            c.args(&wrapper[1..]).arg(program).args(args);
            c
        }
        _ => {
            let mut c = ProcessCommand::new(program);
            c.args(args);
            c
        }
    };

    // The engine runs as its own process group so a timeout can take down
    // everything it spawned.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Kill a child process and its entire process group.
/// Sends SIGTERM first, then SIGKILL after 2 seconds.
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    thread::sleep(Duration::from_secs(2));
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => unsafe {
            libc::killpg(pid, libc::SIGKILL);
        },
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

// ── Filesystem ──────────────────────────────────────────────────────────

/// Remove a directory tree, retrying a few times with a fixed backoff.
///
/// Returns `false` if the directory still exists after the last attempt;
/// the failure is logged, never raised.
pub(crate) fn remove_dir_with_retry(dir: &Path) -> bool {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match fs::remove_dir_all(dir) {
            Ok(()) => return true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
            Err(err) => {
                tracing::debug!(
                    dir = %dir.display(),
                    attempt,
                    error = %err,
                    "directory removal failed"
                );
                if attempt < REMOVE_ATTEMPTS {
                    thread::sleep(Duration::from_millis(REMOVE_BACKOFF_MS));
                }
            }
        }
    }
    tracing::warn!(
        dir = %dir.display(),
        attempts = REMOVE_ATTEMPTS,
        "could not remove directory, continuing"
    );
    false
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).at(dir)
}

pub(crate) fn copy_file(from: &Path, to: &Path) -> Result<PathBuf> {
    if from != to {
        fs::copy(from, to).at(from)?;
    }
    Ok(to.to_path_buf())
}

/// Serialize `value` as pretty JSON next to `path`, then rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).at(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}

// ── Image file names ────────────────────────────────────────────────────

/// Image extension including the leading dot (`.nii`, `.nii.gz`).
pub(crate) fn image_suffix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.ends_with(".nii.gz") {
        ".nii.gz".to_string()
    } else {
        path.extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_else(|| ".nii".to_string())
    }
}

pub(crate) fn is_image_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".nii") || name.ends_with(".nii.gz") || name.ends_with(".img")
}

pub(crate) fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_suffix() {
        assert_eq!(image_suffix(Path::new("/d/a_b0.nii")), ".nii");
        assert_eq!(image_suffix(Path::new("/d/a_b0.nii.gz")), ".nii.gz");
        assert_eq!(image_suffix(Path::new("/d/noext")), ".nii");
    }

    #[test]
    fn test_remove_dir_with_retry_missing_dir_is_success() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(remove_dir_with_retry(&tmp.path().join("never-created")));
    }

    #[test]
    fn test_remove_dir_with_retry_removes_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("subject");
        fs::create_dir_all(dir.join("tmp")).unwrap();
        fs::write(dir.join("tmp/a.nii"), b"x").unwrap();
        assert!(remove_dir_with_retry(&dir));
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_dir_with_retry_gives_up_without_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain-file");
        fs::write(&file, b"x").unwrap();
        assert!(!remove_dir_with_retry(&file));
        assert!(file.exists());
    }

    #[test]
    fn test_write_json_atomic_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/out.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        assert!(path.is_file());
        assert!(!path.with_extension("json.tmp").exists());
        let back: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back["a"], 1);
    }
}
