use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::RerunStrategy;

#[derive(Parser)]
#[command(name = "dwireg")]
#[command(about = "Batch registration of split diffusion-weighted MRI volumes", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// How to reach the registration engine.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct EngineArgs {
    /// Engine command (run through the shell, one process per operation)
    #[arg(long)]
    pub(crate) engine: Option<String>,
    /// Kill an engine operation after this many milliseconds (default: no limit)
    #[arg(long)]
    pub(crate) engine_timeout_ms: Option<u64>,
    /// JSON config file (default: <output>/dwireg.json when present)
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct RunArgs {
    /// Source index (JSON) mapping subject keys to split_dwi volumes
    #[arg(short = 'd', long = "input-dict")]
    pub(crate) index: PathBuf,
    /// Output root; one directory per subject is created below it
    #[arg(short, long)]
    pub(crate) output: PathBuf,
    /// Output voxel size in mm (isotropic, default 2)
    #[arg(long = "voxel-size")]
    pub(crate) voxel_size: Option<f64>,
    /// What to do with subjects that already have output
    #[arg(long, value_enum)]
    pub(crate) rerun: Option<RerunStrategy>,
    /// Subjects processed concurrently (default: available cores, 1 = sequential)
    #[arg(short = 'j', long)]
    pub(crate) workers: Option<usize>,
    /// Do not merge single-volume subjects that share a series UID
    #[arg(long)]
    pub(crate) no_pairing: bool,
    /// Metadata field holding the series UID
    #[arg(long)]
    pub(crate) uid_field: Option<String>,
    /// Also compute group mean/std images after the batch
    #[arg(long)]
    pub(crate) group_stats: bool,
    /// Print the final manifest as JSON
    #[arg(long)]
    pub(crate) json: bool,
    #[command(flatten)]
    pub(crate) engine: EngineArgs,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the registration pipeline over every subject of an index.
    Run(RunArgs),

    /// Merge per-subject manifests into __final_preproc_dict.json.
    Aggregate {
        /// Output root of a previous run
        root: PathBuf,
        /// Ignore the cached global manifest and rescan subject directories
        #[arg(long)]
        rescan: bool,
        /// Compute group mean/std images per stage and bvalue
        #[arg(long)]
        stats: bool,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Rewrite the path prefix of every entry in manifest files.
    Relocate {
        /// Prefix to replace
        #[arg(long)]
        old: String,
        /// Replacement prefix
        #[arg(long)]
        new: String,
        /// Manifest files to rewrite
        files: Vec<PathBuf>,
        /// Rewrite every manifest found under this root
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Reconstruct a subject manifest from the files in its directory.
    Rebuild {
        dir: PathBuf,
        /// Subject key (default: directory name)
        #[arg(long)]
        key: Option<String>,
        /// Write __preproc_dict.json instead of printing
        #[arg(long)]
        write: bool,
    },

    /// Finish subject directories that lack a manifest, then re-aggregate.
    Repair {
        root: PathBuf,
        /// Output voxel size in mm (isotropic, default 2)
        #[arg(long = "voxel-size")]
        voxel_size: Option<f64>,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Report whether a subject directory holds a complete manifest.
    Check { dir: PathBuf },
}
