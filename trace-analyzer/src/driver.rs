//! Step driver: sequences one step through `Fetching -> Assembling ->
//! Classifying -> Emitting -> Pruning -> Idle`, single-threaded per rank.
//! Modeled as an explicit state machine rather than ambient control flow.

use rustc_hash::{FxHashMap, FxHashSet};

use trace_model::{CombinedStats, ExecId, FunctionId, GlobalModel, Label, ProgramId, RankId, RunningStats, ThreadId, Timestamp};

use crate::assembler::{EventAssembler, GlobalIdMapper, IdentityIdMapper};
use crate::config::{Algorithm, Config, OutlierStatistic};
use crate::counter_manager::CounterManager;
use crate::error::{AnalysisError, ErrorCounters, Result};
use crate::execution_manager::ExecutionManager;
use crate::metadata::{MetadataRecord, MetadataRegistry};
use crate::monitoring::MonitoringView;
use crate::outlier::{classify_ignored, CopodModel, HbosModel, OutlierModel, SstdModel};
use crate::provenance::{
    CounterStatsRecord, GlobalFunctionStatsRecord, MetadataRecordPayload, ProvenanceGatherer, ProvenanceRecord,
};
use crate::sink::ProvenanceSinkClient;
use crate::sync::{MessageKind, MessageType, ModelSynchroniser, ParamServerClient, ParamServerMessage};
use crate::trace_stream::{StepData, TraceStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Fetching,
    Assembling,
    Classifying,
    Emitting,
    Pruning,
    Closed,
}

/// Cumulative counters surfaced in the shutdown summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub steps_completed: u64,
    pub total_events: u64,
    pub total_anomalies: u64,
    pub last_completed_step: u64,
}

fn build_outlier_model(config: &Config) -> OutlierModel {
    match config.ad_algorithm {
        Algorithm::Sstd => OutlierModel::Sstd(SstdModel::new(config.outlier_sigma)),
        Algorithm::Hbos => OutlierModel::Hbos(HbosModel::new(
            config.hbos_threshold,
            config.hbos_use_global_threshold,
            config.hbos_max_bins,
        )),
        Algorithm::Copod => OutlierModel::Copod(CopodModel::new(
            config.hbos_threshold,
            config.hbos_use_global_threshold,
            config.hbos_max_bins,
        )),
    }
}

/// Attribute keys that carry function/timer names: `"timer <id>"` or
/// `"event_type <id>"`. Malformed keys are not this attribute kind and are
/// left for other parsers (e.g. counter names).
fn parse_function_name_attribute(key: &str, value: &str) -> Option<(FunctionId, String)> {
    for prefix in ["timer ", "event_type "] {
        if let Some(id_str) = key.strip_prefix(prefix) {
            if let Ok(id) = id_str.parse::<FunctionId>() {
                return Some((id, value.to_string()));
            }
        }
    }
    None
}

pub struct Driver {
    config: Config,
    rank: RankId,
    program_id: ProgramId,

    stream: Box<dyn TraceStream>,
    sink: Box<dyn ProvenanceSinkClient>,
    param_client: Box<dyn ParamServerClient>,
    mapper: Box<dyn GlobalIdMapper>,

    assembler: EventAssembler,
    execs: ExecutionManager,
    counters: CounterManager,
    monitoring: MonitoringView,
    metadata: MetadataRegistry,
    function_names: FxHashMap<FunctionId, String>,

    outlier_model: OutlierModel,
    global_model: GlobalModel,
    local_increment: GlobalModel,
    synchroniser: ModelSynchroniser,

    /// Counter samples accumulated since the last step that contributed them
    /// to a `CombinedStats` payload, keyed by counter id.
    counter_accum: FxHashMap<trace_model::CounterId, RunningStats>,
    /// Device ids already seen for a given function, for the CUDA-JIT
    /// first-encounter workaround.
    cuda_jit_seen: FxHashSet<(FunctionId, u32)>,

    state: DriverState,
    step: u64,
    /// Union of event timestamps seen since the last Pruning phase,
    /// accumulated across steps when the analysis frequency is greater
    /// than one.
    step_window: Option<(Timestamp, Timestamp)>,
    /// Executions labelled during the most recent Classifying phase, pending
    /// provenance extraction in Emitting.
    step_classified: Vec<ExecId>,

    /// Step data fetched in Fetching, awaiting Assembling.
    pending_step: Option<StepData>,
    /// The combined stats payload built in Classifying, awaiting Emitting.
    pending_combined: Option<CombinedStats>,
    /// Metadata rows delivered this step, awaiting Emitting's "new metadata"
    /// send.
    pending_metadata: Option<Vec<MetadataRecord>>,

    pub error_counters: ErrorCounters,
    pub summary: RunSummary,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        rank: RankId,
        program_id: ProgramId,
        stream: Box<dyn TraceStream>,
        sink: Box<dyn ProvenanceSinkClient>,
        param_client: Box<dyn ParamServerClient>,
    ) -> Self {
        let outlier_model = build_outlier_model(&config);
        let synchroniser = ModelSynchroniser::new(config.global_model_sync_freq, config.net_recv_timeout());
        let execs = ExecutionManager::new(rank, config.corr_id_age_limit_steps);
        let monitoring = MonitoringView::new(config.monitoring_watchlist.clone(), None);

        Driver {
            config,
            rank,
            program_id,
            stream,
            sink,
            param_client,
            mapper: Box::new(IdentityIdMapper),
            assembler: EventAssembler::new(),
            execs,
            counters: CounterManager::new(),
            monitoring,
            metadata: MetadataRegistry::new(),
            function_names: FxHashMap::default(),
            outlier_model,
            global_model: GlobalModel::new(),
            local_increment: GlobalModel::new(),
            synchroniser,
            counter_accum: FxHashMap::default(),
            cuda_jit_seen: FxHashSet::default(),
            state: DriverState::Idle,
            step: 0,
            step_window: None,
            step_classified: Vec::new(),
            pending_step: None,
            pending_combined: None,
            pending_metadata: None,
            error_counters: ErrorCounters::default(),
            summary: RunSummary::default(),
        }
    }

    /// Run until the trace stream ends cleanly or a fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.state {
                DriverState::Idle => self.state = DriverState::Fetching,
                DriverState::Fetching => {
                    if self.fetching_phase()? {
                        self.state = DriverState::Assembling;
                    } else {
                        self.state = DriverState::Closed;
                    }
                }
                DriverState::Assembling => {
                    self.assembling_phase()?;
                    self.state = DriverState::Classifying;
                }
                DriverState::Classifying => {
                    self.classifying_phase();
                    self.state = DriverState::Emitting;
                }
                DriverState::Emitting => {
                    self.emitting_phase();
                    self.state = DriverState::Pruning;
                }
                DriverState::Pruning => {
                    self.pruning_phase();
                    self.summary.steps_completed += 1;
                    self.summary.last_completed_step = self.step;
                    self.step += 1;
                    if !self.config.interval().is_zero() {
                        std::thread::sleep(self.config.interval());
                    }
                    self.state = DriverState::Idle;
                }
                DriverState::Closed => return Ok(()),
            }
        }
    }

    /// `begin_step`/`fetch_step`/attribute refresh/`end_step`. Returns
    /// `false` at a clean end of stream.
    fn fetching_phase(&mut self) -> Result<bool> {
        if !self.stream.begin_step(self.config.parser_beginstep_timeout())? {
            return Ok(false);
        }
        let step = self.stream.fetch_step()?;
        self.stream.end_step()?;
        self.pending_step = Some(step);
        Ok(true)
    }

    fn assembling_phase(&mut self) -> Result<()> {
        let step_data = self.pending_step.take().ok_or_else(|| {
            AnalysisError::Internal("assembling_phase invoked with no fetched step data".to_string())
        })?;

        for (key, value) in &step_data.attributes {
            if let Ok((counter_id, name)) = crate::assembler::parse_counter_name_attribute(key, value) {
                self.counters.register_name(counter_id, name);
                continue;
            }
            if let Some((function_id, name)) = parse_function_name_attribute(key, value) {
                self.function_names.insert(function_id, name);
            }
        }

        let errors = self.metadata.add_data(&step_data.metadata);
        for e in errors {
            self.error_counters.record(&e);
        }
        self.pending_metadata = Some(step_data.metadata);

        self.monitoring.refresh_watched_ids(&self.counters);

        let counter_names: FxHashMap<trace_model::CounterId, String> =
            self.counters.all_names().map(|(name, id)| (id, name.to_string())).collect();

        let by_thread = self.assembler.assemble_step(
            step_data.func_events,
            step_data.comm_events,
            step_data.counter_events,
            &counter_names,
            self.mapper.as_mut(),
            self.config.override_rank,
        );

        self.execs.begin_step(self.step);
        for events in by_thread.into_values() {
            for event in &events {
                self.summary.total_events += 1;
                self.step_window = Some(match self.step_window {
                    Some((lo, hi)) => (lo.min(event.timestamp), hi.max(event.timestamp)),
                    None => (event.timestamp, event.timestamp),
                });
                if let Err(e) = self.execs.add_event(event, &mut self.counters, &self.monitoring) {
                    self.error_counters.record(&e);
                }
            }
        }

        self.monitoring.scan(&self.counters);
        Ok(())
    }

    /// Classify the `execDataMap` view on analysis steps; otherwise
    /// accumulate into the next one.
    fn classifying_phase(&mut self) {
        self.step_classified.clear();
        if self.config.analysis_step_freq == 0 || self.step % self.config.analysis_step_freq != 0 {
            return;
        }

        if self.synchroniser.should_sync(self.step, self.rank) {
            self.synchroniser
                .sync(self.param_client.as_ref(), &mut self.local_increment, &mut self.global_model);
        }

        let mut combined = trace_model::CombinedStats::new(self.step);
        let exec_map = self.execs.exec_data_map();

        for (function_id, exec_ids) in exec_map {
            let function_name = self.function_names.get(&function_id).cloned().unwrap_or_default();
            let ignored = self.config.is_ignored(&function_name);
            let override_threshold = self.config.threshold_override_for(&function_name);

            for id in exec_ids {
                let Some(iv) = self.execs.get(id) else { continue };
                let thread_id: ThreadId = iv.thread_id;
                let use_exclusive = matches!(self.config.outlier_statistic, OutlierStatistic::ExclusiveRuntime);
                let value = iv.statistic(use_exclusive);

                if ignored {
                    let verdict = classify_ignored();
                    self.execs.label(id, verdict.label, verdict.score);
                    self.step_classified.push(id);
                    continue;
                }

                if self.config.cuda_jit_workaround {
                    if let Some(binding) = self.metadata.gpu_binding(thread_id) {
                        if self.cuda_jit_seen.insert((function_id, binding.device)) {
                            self.execs.label(id, Label::Normal, 0.0);
                            self.step_classified.push(id);
                            continue;
                        }
                    }
                }

                let verdict = self.outlier_model.classify(self.global_model.get(function_id), value, override_threshold);
                if let Some(msg) = &verdict.recoverable_error {
                    self.error_counters.record(&AnalysisError::Internal(msg.clone()));
                }
                self.execs.label(id, verdict.label, verdict.score);
                self.step_classified.push(id);

                let existing = self.local_increment.get(function_id).cloned();
                let updated = self.outlier_model.update(existing, value);
                self.local_increment.0.insert(function_id, updated);

                combined.function_stats.entry(function_id).or_insert_with(RunningStats::new).push(value);
                combined.anomaly_metrics.entry(function_id).or_default().record(verdict.label == Label::Outlier);
                if verdict.label == Label::Outlier {
                    self.summary.total_anomalies += 1;
                }
            }

            if let Some(model) = self.local_increment.get_mut(function_id) {
                if let Some(local_threshold) = self.outlier_model.local_threshold(model) {
                    self.outlier_model.tighten_stored_threshold(model, local_threshold);
                }
            }
        }

        for (counter_id, stats) in self.counter_accum.drain() {
            combined.counter_stats.insert(counter_id, stats);
        }

        self.pending_combined = Some(combined);
    }

    /// Extract and send provenance for executions classified this step, plus
    /// new metadata, plus the combined stats payload.
    fn emitting_phase(&mut self) {
        let mut records: Vec<ProvenanceRecord> = Vec::new();

        if self.config.should_emit_on_step(self.step) {
            let gatherer = ProvenanceGatherer::new(&self.config);
            let (tstart, tend) = self.step_window.unwrap_or((0, 0));
            for &id in &self.step_classified {
                let Some(iv) = self.execs.get(id) else { continue };
                let function_id = iv.function_id;
                let is_anomaly = iv.label == Label::Outlier;
                let stats_snapshot = self
                    .pending_combined
                    .as_ref()
                    .and_then(|c| c.function_stats.get(&function_id))
                    .copied();
                if let Some(record) = gatherer.gather(
                    id,
                    is_anomaly,
                    &self.execs,
                    &self.metadata,
                    &self.function_names,
                    self.program_id,
                    self.step,
                    tstart,
                    tend,
                    stats_snapshot,
                ) {
                    records.push(record);
                }
            }
        }

        if let Some(new_metadata) = self.pending_metadata.take() {
            for m in new_metadata {
                records.push(ProvenanceRecord::Metadata(MetadataRecordPayload {
                    thread_id: m.thread_id,
                    key: m.key,
                    value: m.value,
                }));
            }
        }

        if let Some(combined) = self.pending_combined.as_ref() {
            for (&function_id, stats) in &combined.function_stats {
                records.push(ProvenanceRecord::GlobalFunctionStats(GlobalFunctionStatsRecord {
                    step: combined.step,
                    function_id,
                    stats: *stats,
                }));
            }
            for (&counter_id, stats) in &combined.counter_stats {
                records.push(ProvenanceRecord::CounterStats(CounterStatsRecord {
                    step: combined.step,
                    counter_id,
                    stats: *stats,
                }));
            }
        }

        if !records.is_empty() {
            self.sink.send(records);
        }

        if let Some(combined) = self.pending_combined.take() {
            match serde_json::to_vec(&combined) {
                Ok(payload) => {
                    let msg = ParamServerMessage {
                        sender_rank: self.rank,
                        receiver_rank: 0,
                        msg_type: MessageType::Add,
                        kind: MessageKind::CombinedStats,
                        step: self.step,
                        payload,
                    };
                    match serde_json::to_vec(&msg) {
                        Ok(bytes) => self.param_client.send(bytes),
                        Err(e) => log::error!("failed to serialise parameter-server envelope: {e}"),
                    }
                }
                Err(e) => log::error!("failed to serialise combined stats for step {}: {e}", self.step),
            }
        }
    }

    /// Call-list purge, counter flush, analysis-window reset.
    fn pruning_phase(&mut self) {
        let stats = self.execs.purge_call_list(self.config.anom_win_size);
        log::debug!(
            "step {}: purged {} executions, kept {} protected, {} incomplete, {} in window",
            self.step,
            stats.purged,
            stats.kept_protected,
            stats.kept_incomplete,
            stats.kept_window
        );

        for (counter_id, samples) in self.counters.flush_step() {
            let entry = self.counter_accum.entry(counter_id).or_insert_with(RunningStats::new);
            for (_, value) in samples {
                entry.push(value as f64);
            }
        }

        self.step_window = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemoryDocStoreSink;
    use crate::sync::NullClient;
    use std::fs;

    fn write_step(dir: &std::path::Path, step: u64, body: &str) {
        fs::write(dir.join(format!("{step}.json")), body).unwrap();
    }

    fn new_driver(dir: std::path::PathBuf, sink: InMemoryDocStoreSink) -> Driver {
        let mut config = Config::default();
        config.analysis_step_freq = 1;
        config.global_model_sync_freq = 1;
        Driver::new(
            config,
            0,
            0,
            Box::new(crate::trace_stream::JsonDirTraceStream::new(dir)),
            Box::new(sink),
            Box::new(NullClient),
        )
    }

    #[test]
    fn one_step_cycle_classifies_and_closes_on_end_of_stream() {
        let dir = std::env::temp_dir().join(format!("trace-analyzer-driver-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        write_step(
            &dir,
            0,
            r#"{
                "func_events": [
                    {"program_id":0,"rank_id":0,"thread_id":0,"is_entry":true,"function_id":1,"timestamp":100},
                    {"program_id":0,"rank_id":0,"thread_id":0,"is_entry":false,"function_id":1,"timestamp":150}
                ],
                "attributes": {"timer 1": "main::work"}
            }"#,
        );

        let sink = InMemoryDocStoreSink::new();
        let mut driver = new_driver(dir.clone(), sink.clone());
        driver.run().unwrap();

        assert_eq!(driver.summary.steps_completed, 1);
        assert_eq!(driver.summary.total_events, 2);
        assert!(!sink.all().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_stream_closes_immediately() {
        let dir = std::env::temp_dir().join(format!("trace-analyzer-driver-empty-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);

        let sink = InMemoryDocStoreSink::new();
        let mut driver = new_driver(dir.clone(), sink.clone());
        driver.run().unwrap();

        assert_eq!(driver.summary.steps_completed, 0);
        assert!(sink.all().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }
}
