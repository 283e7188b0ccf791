// Module declarations
mod aggregate;
mod cli;
mod config;
mod dispatch;
mod engine;
mod error;
mod executor;
mod index;
mod manifest;
mod nifti;
mod pairing;
mod recover;
mod relocate;
mod resume;
mod types;
mod util;

#[cfg(test)]
mod testing;

use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::aggregate::{group_statistics, group_stats_dir, load_global_manifest};
use crate::cli::{Cli, Command, EngineArgs};
use crate::config::{
    load_file_config, resolve_engine_spec, validate_voxel_size, RunConfig, DEFAULT_VOXEL_SIZE,
};
use crate::dispatch::{run_pipeline, summary};
use crate::engine::{CommandEngineFactory, EngineFactory};
use crate::error::{PipelineError, Result};
use crate::manifest::{subject_manifest_path, write_subject_manifest};
use crate::recover::{rebuild_manifest_from_dir, repair_root};
use crate::relocate::{find_manifest_files, relocate_manifests};
use crate::resume::verify_manifest;
use crate::types::{GlobalManifest, ERRORS_DIR};
use crate::util::file_name_string;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn engine_factory(args: &EngineArgs, root: &Path) -> Result<CommandEngineFactory> {
    let file = load_file_config(args.config.as_deref(), root)?;
    CommandEngineFactory::new(&resolve_engine_spec(args, file.engine)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => {
            let config = RunConfig::from_args(&args)?;
            tracing::info!(
                index = %config.index_path.display(),
                output = %config.output_root.display(),
                strategy = config.strategy.as_str(),
                workers = config.workers,
                voxel_size = config.voxel_size,
                pairing = config.pairing,
                "starting batch"
            );
            let factory = CommandEngineFactory::new(&config.engine)?;
            let report = run_pipeline(&config, &factory)?;

            if args.group_stats && !report.results.is_empty() {
                let engine = factory.open_session("group-stats")?;
                group_statistics(
                    &report.results,
                    engine.as_ref(),
                    &group_stats_dir(&config.output_root),
                )?;
            }

            if args.json {
                print_json(&report.results)?;
            } else {
                for (kind, count) in summary(&report) {
                    println!("{kind}: {count}");
                }
            }
            if !report.failed.is_empty() {
                eprintln!(
                    "{} subject(s) failed, see {}",
                    report.failed.len(),
                    config.output_root.join(ERRORS_DIR).display()
                );
            }
            Ok(0)
        }

        Command::Aggregate {
            root,
            rescan,
            stats,
            engine,
        } => {
            let global = load_global_manifest(&root, rescan)?;
            println!("{} subjects in global manifest", global.len());
            if stats {
                let factory = engine_factory(&engine, &root)?;
                let session = factory.open_session("group-stats")?;
                let stats = group_statistics(&global, session.as_ref(), &group_stats_dir(&root))?;
                println!("{} stages aggregated", stats.len());
            }
            Ok(0)
        }

        Command::Relocate {
            old,
            new,
            mut files,
            root,
        } => {
            if let Some(root) = root {
                files.extend(find_manifest_files(&root));
            }
            if files.is_empty() {
                return Err(PipelineError::config("no manifest files given"));
            }
            for (path, count) in relocate_manifests(&files, &old, &new)? {
                println!("{}: {count} path(s) rewritten", path.display());
            }
            Ok(0)
        }

        Command::Rebuild { dir, key, write } => {
            let key = key.unwrap_or_else(|| file_name_string(&dir));
            let manifest = rebuild_manifest_from_dir(&dir)?;
            if manifest.is_empty() {
                return Err(PipelineError::config(format!(
                    "no pipeline outputs found in {}",
                    dir.display()
                )));
            }
            if write {
                let path = write_subject_manifest(&dir, &key, &manifest)?;
                println!("wrote {}", path.display());
            } else {
                let mut wrapped = GlobalManifest::new();
                wrapped.insert(key, manifest);
                print_json(&wrapped)?;
            }
            Ok(0)
        }

        Command::Repair {
            root,
            voxel_size,
            engine,
        } => {
            let file = load_file_config(engine.config.as_deref(), &root)?;
            let voxel_size =
                validate_voxel_size(voxel_size.or(file.voxel_size).unwrap_or(DEFAULT_VOXEL_SIZE))?;
            let factory = CommandEngineFactory::new(&resolve_engine_spec(&engine, file.engine)?)?;
            let report = repair_root(&root, &factory, voxel_size)?;
            println!("repaired: {}", report.repaired.len());
            println!("skipped: {}", report.skipped.len());
            Ok(0)
        }

        Command::Check { dir } => {
            let path = subject_manifest_path(&dir);
            match verify_manifest(&path) {
                Ok(manifest) => {
                    println!("complete: {} output(s)", manifest.leaf_paths().len());
                    Ok(0)
                }
                Err(err) => {
                    println!("incomplete: {err}");
                    Ok(1)
                }
            }
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) if err.is_configuration() => {
            eprintln!("{err}");
            std::process::exit(2);
        }
        Err(err) => Err(err.into()),
    }
}
