//! Process entry point: parse CLI flags, load and overlay configuration,
//! build the concrete transport/sink/parameter-server implementations the
//! flags select, then run the step driver to completion.

mod assembler;
mod cli;
mod config;
mod counter_manager;
mod driver;
mod error;
mod execution_manager;
mod metadata;
mod monitoring;
mod outlier;
mod provenance;
mod sink;
mod sync;
mod trace_stream;
mod worker_pool;

use std::path::PathBuf;

use clap::Parser;

use cli::Opt;
use config::Config;
use driver::Driver;
use error::AnalysisError;
use sink::{InMemoryDocStoreSink, JsonFileSink, ProvenanceSinkClient};
use sync::{NullClient, ParamServerClient, TcpParamServerClient};
use trace_stream::{JsonDirTraceStream, TraceStream};

/// Worker count for the provenance sink's write pool; not currently
/// configurable from the CLI.
const SINK_WORKERS: usize = 2;

fn load_config(opt: &Opt) -> Result<Config, AnalysisError> {
    let mut config = match &opt.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(algorithm) = opt.ad_algorithm {
        config.ad_algorithm = algorithm.into();
    }
    if let Some(freq) = opt.analysis_step_freq {
        config.analysis_step_freq = freq;
    }
    if let Some(path) = &opt.func_threshold_file {
        config.load_threshold_overrides_file(path)?;
    }
    if let Some(path) = &opt.func_ignore_file {
        config.load_ignore_list_file(path)?;
    }
    if let Some(path) = &opt.monitoring_watchlist_file {
        config.load_monitoring_watchlist_file(path)?;
    }

    Ok(config)
}

fn build_sink(output_dir: Option<PathBuf>) -> Box<dyn ProvenanceSinkClient> {
    match output_dir {
        Some(dir) => Box::new(JsonFileSink::new(dir, SINK_WORKERS)),
        None => Box::new(InMemoryDocStoreSink::new()),
    }
}

fn build_param_client(addr: Option<String>) -> Box<dyn ParamServerClient> {
    match addr {
        Some(addr) => Box::new(TcpParamServerClient::connect(addr)),
        None => Box::new(NullClient),
    }
}

fn run() -> Result<(), AnalysisError> {
    let opt = Opt::parse();
    let config = load_config(&opt)?;

    let stream: Box<dyn TraceStream> = Box::new(JsonDirTraceStream::new(opt.trace_dir.clone()));
    let sink = build_sink(opt.output_dir.clone());
    let param_client = build_param_client(opt.pserver_addr.clone());

    let program_id: i32 = 0;
    let mut driver = Driver::new(config, opt.rank, program_id, stream, sink, param_client);

    driver.run()?;

    log::info!(
        "rank {}: {} steps, {} events, {} anomalies, {} recoverable errors",
        opt.rank,
        driver.summary.steps_completed,
        driver.summary.total_events,
        driver.summary.total_anomalies,
        driver.error_counters.total()
    );

    Ok(())
}

fn main() {
    env_logger::init();

    match run() {
        Ok(()) => std::process::exit(0),
        Err(e @ AnalysisError::Config(_)) => {
            log::error!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("fatal error: {e}");
            std::process::exit(1);
        }
    }
}
