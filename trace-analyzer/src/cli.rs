//! Command-line interface: one top-level `Opt`, CLI flags that override
//! whatever the config file set rather than replace it outright.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Algorithm;

#[derive(Debug, Parser)]
#[command(
    name = "trace-analyzer",
    version,
    about = "Per-rank online anomaly detector for instrumented-application performance traces."
)]
pub struct Opt {
    /// Path to the JSON run configuration.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Rank this process attaches to.
    #[arg(long)]
    pub rank: i32,

    /// Directory the trace stream engine reads its BP/SST files from.
    #[arg(long)]
    pub trace_dir: PathBuf,

    /// Program name used to derive the trace stream's stream name.
    #[arg(long, default_value = "unknown")]
    pub program: String,

    /// Directory provenance records are written to when no document-store
    /// sink is configured.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Address of the parameter server, e.g. `127.0.0.1:9000`. When absent,
    /// the synchroniser falls back to local-only merges for every step.
    #[arg(long)]
    pub pserver_addr: Option<String>,

    /// Override the algorithm selected in the config file.
    #[arg(long, value_enum)]
    pub ad_algorithm: Option<CliAlgorithm>,

    /// Override `analysis_step_freq` from the config file.
    #[arg(long)]
    pub analysis_step_freq: Option<u64>,

    /// `<function name> <threshold>` lines loaded into the per-function
    /// threshold-override table at startup.
    #[arg(long)]
    pub func_threshold_file: Option<PathBuf>,

    /// One function name per line, loaded into the ignore list at startup.
    #[arg(long)]
    pub func_ignore_file: Option<PathBuf>,

    /// `<counter name> <field name>` lines loaded into the monitoring
    /// watch-list at startup.
    #[arg(long)]
    pub monitoring_watchlist_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliAlgorithm {
    Sstd,
    Hbos,
    Copod,
}

impl From<CliAlgorithm> for Algorithm {
    fn from(c: CliAlgorithm) -> Self {
        match c {
            CliAlgorithm::Sstd => Algorithm::Sstd,
            CliAlgorithm::Hbos => Algorithm::Hbos,
            CliAlgorithm::Copod => Algorithm::Copod,
        }
    }
}
