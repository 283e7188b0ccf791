//! Batch dispatcher.
//!
//! Every subject becomes a task that owns its key, volumes, output directory
//! and engine session. Tasks run on a bounded rayon pool and report typed
//! outcomes over a channel. Errors and panics stop at the task boundary: the
//! subject gets an error record and the batch carries on.

use std::collections::BTreeMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;

use chrono::Utc;
use rayon::ThreadPoolBuilder;

use crate::config::RunConfig;
use crate::engine::EngineFactory;
use crate::error::{IoContext, PipelineError, Result};
use crate::executor::{SubjectPipeline, SubjectRun};
use crate::index::read_split_index;
use crate::manifest::{global_manifest_path, write_global_manifest, write_merged_manifest};
use crate::pairing::{propagate_results, resolve_singletons, PairingMap};
use crate::resume::{prepare_subject_dir, ResumeDecision};
use crate::types::{safe_key, GlobalManifest, SplitDiffusionIndex, SubjectManifest, SubjectVolumes, ERRORS_DIR};

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SubjectOutcome {
    Completed(SubjectManifest),
    /// Complete result from an earlier run; no engine calls were made.
    Cached(SubjectManifest),
    Discarded,
    Failed(String),
}

pub(crate) struct SubjectTask {
    pub(crate) key: String,
    /// Every subject key the result stands for; `[key]` unless merged.
    pub(crate) members: Vec<String>,
    pub(crate) volumes: SubjectVolumes,
    pub(crate) subject_dir: PathBuf,
}

#[derive(Debug, Default)]
pub(crate) struct BatchReport {
    pub(crate) results: GlobalManifest,
    pub(crate) completed: Vec<String>,
    pub(crate) cached: Vec<String>,
    pub(crate) discarded: Vec<String>,
    pub(crate) failed: Vec<String>,
}

impl BatchReport {
    fn record(&mut self, key: String, outcome: SubjectOutcome) {
        match outcome {
            SubjectOutcome::Completed(manifest) => {
                self.results.insert(key.clone(), manifest);
                self.completed.push(key);
            }
            SubjectOutcome::Cached(manifest) => {
                self.results.insert(key.clone(), manifest);
                self.cached.push(key);
            }
            SubjectOutcome::Discarded => self.discarded.push(key),
            SubjectOutcome::Failed(_) => self.failed.push(key),
        }
    }

    fn sort(&mut self) {
        self.completed.sort();
        self.cached.sort();
        self.discarded.sort();
        self.failed.sort();
    }
}

// ── Error records ───────────────────────────────────────────────────────

pub(crate) fn error_record_path(output_root: &Path, key: &str) -> PathBuf {
    output_root
        .join(ERRORS_DIR)
        .join(format!("{}.txt", safe_key(key)))
}

fn write_error_record(output_root: &Path, key: &str, cause: &str) -> Result<()> {
    let dir = output_root.join(ERRORS_DIR);
    fs::create_dir_all(&dir).at(&dir)?;
    let path = error_record_path(output_root, key);
    let body = format!(
        "subject: {key}\ntime: {}\nerror: {cause}\n",
        Utc::now().to_rfc3339()
    );
    fs::write(&path, body).at(&path)
}

fn clear_error_record(output_root: &Path, key: &str) {
    let path = error_record_path(output_root, key);
    if !path.exists() {
        return;
    }
    if let Err(err) = fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), error = %err, "could not remove stale error record");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Task execution ──────────────────────────────────────────────────────

fn process_subject(
    task: &SubjectTask,
    config: &RunConfig,
    factory: &dyn EngineFactory,
) -> Result<SubjectOutcome> {
    if let ResumeDecision::Cached(manifest) =
        prepare_subject_dir(&task.subject_dir, &task.key, config.strategy)
    {
        tracing::info!(subject = %task.key, "complete result found, skipping");
        return Ok(SubjectOutcome::Cached(manifest));
    }
    let engine = factory.open_session(&task.key)?;
    let run = SubjectPipeline {
        engine: engine.as_ref(),
        key: &task.key,
        volumes: &task.volumes,
        subject_dir: &task.subject_dir,
        voxel_size: config.voxel_size,
    }
    .run()?;
    Ok(match run {
        SubjectRun::Completed(manifest) => {
            if task.members.len() > 1 {
                write_merged_manifest(&task.subject_dir, &task.members, &manifest)?;
            }
            SubjectOutcome::Completed(manifest)
        }
        SubjectRun::Discarded => SubjectOutcome::Discarded,
    })
}

fn run_task(task: &SubjectTask, config: &RunConfig, factory: &dyn EngineFactory) -> SubjectOutcome {
    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| process_subject(task, config, factory)));
    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => SubjectOutcome::Failed(err.to_string()),
        Err(payload) => SubjectOutcome::Failed(format!("panic: {}", panic_message(payload.as_ref()))),
    };

    match &outcome {
        SubjectOutcome::Failed(cause) => {
            tracing::error!(subject = %task.key, error = %cause, "subject failed");
            for member in &task.members {
                if let Err(err) = write_error_record(&config.output_root, member, cause) {
                    tracing::error!(subject = %member, error = %err, "could not write error record");
                }
            }
        }
        _ => {
            for member in &task.members {
                clear_error_record(&config.output_root, member);
            }
            tracing::debug!(
                subject = %task.key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "subject finished"
            );
        }
    }
    outcome
}

/// One task per subject, each with its own output directory. Two keys that
/// sanitize to the same directory name are a configuration error.
pub(crate) fn build_tasks(
    index: &SplitDiffusionIndex,
    groups: &PairingMap,
    output_root: &Path,
) -> Result<Vec<SubjectTask>> {
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    let mut tasks = Vec::with_capacity(index.len());
    for (key, volumes) in index {
        let dir_name = safe_key(key);
        if let Some(owner) = owners.insert(dir_name.clone(), key) {
            return Err(PipelineError::config(format!(
                "subjects '{owner}' and '{key}' would share output directory '{dir_name}'"
            )));
        }
        let members = groups.get(key).cloned().unwrap_or_else(|| vec![key.clone()]);
        tasks.push(SubjectTask {
            key: key.clone(),
            members,
            volumes: volumes.clone(),
            subject_dir: output_root.join(dir_name),
        });
    }
    Ok(tasks)
}

/// Run every subject of `index` and collect the outcomes. `groups` maps
/// merged subjects to their member keys.
pub(crate) fn run_batch(
    index: &SplitDiffusionIndex,
    groups: &PairingMap,
    config: &RunConfig,
    factory: &dyn EngineFactory,
) -> Result<BatchReport> {
    let started = Instant::now();
    let tasks = build_tasks(index, groups, &config.output_root)?;

    let width = config.workers.max(1).min(tasks.len().max(1));
    let pool = ThreadPoolBuilder::new()
        .num_threads(width)
        .thread_name(|i| format!("dwireg-worker-{i}"))
        .build()
        .map_err(|e| PipelineError::config(format!("failed to create worker pool: {e}")))?;
    tracing::info!(subjects = tasks.len(), workers = width, "dispatching batch");

    let (tx, rx) = mpsc::channel::<(String, SubjectOutcome)>();
    pool.scope(|scope| {
        for task in tasks {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let outcome = run_task(&task, config, factory);
                let _ = tx.send((task.key, outcome));
            });
        }
    });
    drop(tx);

    let mut report = BatchReport::default();
    for (key, outcome) in rx {
        report.record(key, outcome);
    }
    report.sort();

    tracing::info!(
        completed = report.completed.len(),
        cached = report.cached.len(),
        discarded = report.discarded.len(),
        failed = report.failed.len(),
        elapsed_s = started.elapsed().as_secs_f64(),
        "batch finished"
    );
    Ok(report)
}

/// Read the index, pair singletons, run the batch, and write the global
/// manifest. Only configuration problems are returned as errors.
pub(crate) fn run_pipeline(config: &RunConfig, factory: &dyn EngineFactory) -> Result<BatchReport> {
    let (source, index) = read_split_index(&config.index_path)?;
    let (index, groups) = if config.pairing {
        let paired = resolve_singletons(&index, &source, &config.uid_field);
        (paired.index, paired.groups)
    } else {
        (index, PairingMap::new())
    };

    let mut report = run_batch(&index, &groups, config, factory)?;
    propagate_results(&mut report.results, &groups);
    expand_member_keys(&mut report, &groups);

    let path = global_manifest_path(&config.output_root);
    write_global_manifest(&path, &report.results)?;
    tracing::info!(path = %path.display(), subjects = report.results.len(), "wrote global manifest");
    Ok(report)
}

/// Report merged subjects under their member keys as well.
fn expand_member_keys(report: &mut BatchReport, groups: &PairingMap) {
    let expand = |keys: &mut Vec<String>| {
        let mut extra: Vec<String> = Vec::new();
        for key in keys.iter() {
            if let Some(members) = groups.get(key) {
                extra.extend(members.iter().filter(|m| *m != key).cloned());
            }
        }
        keys.extend(extra);
        keys.sort();
    };
    expand(&mut report.completed);
    expand(&mut report.cached);
    expand(&mut report.discarded);
    expand(&mut report.failed);
}

/// Outcome counts keyed by kind, for JSON summaries.
pub(crate) fn summary(report: &BatchReport) -> BTreeMap<&'static str, usize> {
    BTreeMap::from([
        ("completed", report.completed.len()),
        ("cached", report.cached.len()),
        ("discarded", report.discarded.len()),
        ("failed", report.failed.len()),
    ])
}
