//! For each flagged execution, assembles a self-contained record -- call
//! stack, execution window, counters, GPU context, and a statistics
//! snapshot -- for the sink. The only component that reads the metadata
//! registry.

use rustc_hash::FxHashMap;
use serde::Serialize;

use trace_model::{
    CounterId, CounterSample, ExecId, FunctionId, Label, MessageAttachment, ProgramId, RankId, RunningStats, ThreadId,
    Timestamp,
};

use crate::config::Config;
use crate::execution_manager::ExecutionManager;
use crate::metadata::MetadataRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct CallStackFrame {
    pub function_id: FunctionId,
    pub function_name: String,
    pub entry: Timestamp,
    pub exit: Timestamp,
    pub id: ExecId,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowEntry {
    pub id: ExecId,
    pub function_id: FunctionId,
    pub entry: Timestamp,
    pub exit: Timestamp,
    pub messages: Vec<MessageAttachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuContext {
    pub device: u32,
    pub context: u32,
    pub cpu_parent_id: ExecId,
    pub cpu_parent_thread: ThreadId,
    pub cpu_parent_call_stack: Vec<CallStackFrame>,
}

/// Fields common to every record kind.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub pid: ProgramId,
    pub rid: RankId,
    pub tid: ThreadId,
    pub event_id: ExecId,
    pub io_step: u64,
    pub io_step_tstart: Timestamp,
    pub io_step_tend: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecRecord {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub function_id: FunctionId,
    pub function_name: String,
    pub entry: Timestamp,
    pub exit: Timestamp,
    pub label: Label,
    pub score: f64,
    pub call_stack: Vec<CallStackFrame>,
    pub counters: Vec<CounterSample>,
    pub window: Vec<WindowEntry>,
    pub gpu_parent: Option<GpuContext>,
    pub stats_snapshot: Option<RunningStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataRecordPayload {
    pub thread_id: ThreadId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalFunctionStatsRecord {
    pub step: u64,
    pub function_id: FunctionId,
    pub stats: RunningStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterStatsRecord {
    pub step: u64,
    pub counter_id: CounterId,
    pub stats: RunningStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum ProvenanceRecord {
    Anomaly(ExecRecord),
    NormalExec(ExecRecord),
    Metadata(MetadataRecordPayload),
    GlobalFunctionStats(GlobalFunctionStatsRecord),
    CounterStats(CounterStatsRecord),
}

impl ProvenanceRecord {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProvenanceRecord::Anomaly(_) => "anomaly",
            ProvenanceRecord::NormalExec(_) => "normalexec",
            ProvenanceRecord::Metadata(_) => "metadata",
            ProvenanceRecord::GlobalFunctionStats(_) => "globalfunctionstats",
            ProvenanceRecord::CounterStats(_) => "counterstats",
        }
    }
}

pub struct ProvenanceGatherer<'a> {
    config: &'a Config,
}

impl<'a> ProvenanceGatherer<'a> {
    pub fn new(config: &'a Config) -> Self {
        ProvenanceGatherer { config }
    }

    /// Walk the interval's parent chain to the synthetic root, closest frame
    /// last, annotating each frame with whether it is itself the anomaly.
    fn call_stack(&self, execs: &ExecutionManager, id: ExecId, function_names: &FxHashMap<FunctionId, String>) -> Vec<CallStackFrame> {
        let mut frames = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let Some(iv) = execs.get(cur) else { break };
            frames.push(CallStackFrame {
                function_id: iv.function_id,
                function_name: function_names.get(&iv.function_id).cloned().unwrap_or_default(),
                entry: iv.entry_ts,
                exit: iv.exit_ts,
                id: iv.id,
                is_anomaly: iv.id == id,
            });
            cursor = iv.parent;
        }
        frames.reverse();
        frames
    }

    fn window(&self, execs: &ExecutionManager, id: ExecId) -> Vec<WindowEntry> {
        execs
            .call_window(id, self.config.anom_win_size)
            .into_iter()
            .filter_map(|wid| execs.get(wid))
            .map(|iv| WindowEntry {
                id: iv.id,
                function_id: iv.function_id,
                entry: iv.entry_ts,
                exit: iv.exit_ts,
                messages: iv.messages.clone(),
            })
            .collect()
    }

    /// Build the GPU context if `id`'s thread is a registered GPU thread: the
    /// device/context plus the CPU spawning execution's id, thread and call
    /// stack.
    fn gpu_context(
        &self,
        execs: &ExecutionManager,
        metadata: &MetadataRegistry,
        id: ExecId,
        function_names: &FxHashMap<FunctionId, String>,
    ) -> Option<GpuContext> {
        let iv = execs.get(id)?;
        let binding = metadata.gpu_binding(iv.thread_id)?;
        let cpu_parent = *iv.corr_partners.first()?;
        let cpu_iv = execs.get(cpu_parent)?;
        Some(GpuContext {
            device: binding.device,
            context: binding.context,
            cpu_parent_id: cpu_parent,
            cpu_parent_thread: cpu_iv.thread_id,
            cpu_parent_call_stack: self.call_stack(execs, cpu_parent, function_names),
        })
    }

    /// Produce the record for `id`, or `None` if its exclusive runtime is
    /// below the configured noise floor. `program_id`,
    /// `step`/window timestamps and the snapshot of global function stats at
    /// classification time are supplied by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn gather(
        &self,
        id: ExecId,
        is_anomaly: bool,
        execs: &ExecutionManager,
        metadata: &MetadataRegistry,
        function_names: &FxHashMap<FunctionId, String>,
        program_id: ProgramId,
        step: u64,
        io_step_tstart: Timestamp,
        io_step_tend: Timestamp,
        stats_snapshot: Option<RunningStats>,
    ) -> Option<ProvenanceRecord> {
        let iv = execs.get(id)?;
        if iv.exclusive_runtime < self.config.prov_min_anom_time_usec {
            return None;
        }

        let record = ExecRecord {
            envelope: Envelope {
                pid: program_id,
                rid: iv.id.rank,
                tid: iv.thread_id,
                event_id: id,
                io_step: step,
                io_step_tstart,
                io_step_tend,
            },
            function_id: iv.function_id,
            function_name: function_names.get(&iv.function_id).cloned().unwrap_or_default(),
            entry: iv.entry_ts,
            exit: iv.exit_ts,
            label: iv.label,
            score: iv.score,
            call_stack: self.call_stack(execs, id, function_names),
            counters: iv.counters.clone(),
            window: self.window(execs, id),
            gpu_parent: self.gpu_context(execs, metadata, id, function_names),
            stats_snapshot,
        };

        Some(if is_anomaly {
            ProvenanceRecord::Anomaly(record)
        } else {
            ProvenanceRecord::NormalExec(record)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_manager::CounterManager;
    use crate::monitoring::MonitoringView;
    use trace_model::{Event, EventPayload, CORRELATION_ID_COUNTER_NAME};

    fn entry(thread: u64, fid: u64, ts: u64) -> Event {
        Event::new(0, 0, thread, ts, EventPayload::Entry { function_id: fid })
    }
    fn exit(thread: u64, fid: u64, ts: u64) -> Event {
        Event::new(0, 0, thread, ts, EventPayload::Exit { function_id: fid })
    }
    fn counter(thread: u64, cid: u64, value: i64, ts: u64) -> Event {
        Event::new(0, 0, thread, ts, EventPayload::Counter { counter_id: cid, value })
    }

    #[test]
    fn gpu_context_references_cpu_call_stack() {
        let mut execs = ExecutionManager::new(0, 10);
        let mut counters = CounterManager::new();
        counters.register_name(99, CORRELATION_ID_COUNTER_NAME.to_string());
        let monitoring = MonitoringView::new(vec![], None);

        execs.add_event(&entry(0, 100, 200), &mut counters, &monitoring).unwrap();
        execs.add_event(&counter(0, 99, 999, 205), &mut counters, &monitoring).unwrap();
        execs.add_event(&exit(0, 100, 210), &mut counters, &monitoring).unwrap();

        execs.add_event(&entry(1, 200, 220), &mut counters, &monitoring).unwrap();
        execs.add_event(&counter(1, 99, 999, 225), &mut counters, &monitoring).unwrap();
        execs.add_event(&exit(1, 200, 300), &mut counters, &monitoring).unwrap();

        let mut metadata = MetadataRegistry::new();
        metadata.add_data(&[
            crate::metadata::MetadataRecord {
                thread_id: 1,
                key: "CUDA Device".to_string(),
                value: "0".to_string(),
            },
            crate::metadata::MetadataRecord {
                thread_id: 1,
                key: "CUDA Context".to_string(),
                value: "1".to_string(),
            },
        ]);

        let gpu_id = execs.thread_call_list(1)[0];
        let cpu_id = execs.thread_call_list(0)[0];

        let config = Config::default();
        let gatherer = ProvenanceGatherer::new(&config);
        let names = FxHashMap::default();
        let record = gatherer
            .gather(gpu_id, true, &execs, &metadata, &names, 0, 1, 200, 300, None)
            .unwrap();

        match record {
            ProvenanceRecord::Anomaly(rec) => {
                let gpu = rec.gpu_parent.expect("gpu context present");
                assert_eq!(gpu.cpu_parent_id, cpu_id);
                assert_eq!(gpu.cpu_parent_call_stack.last().unwrap().function_id, 100);
            }
            _ => panic!("expected Anomaly record"),
        }
    }

    #[test]
    fn short_executions_are_dropped() {
        let mut execs = ExecutionManager::new(0, 10);
        let mut counters = CounterManager::new();
        let monitoring = MonitoringView::new(vec![], None);
        execs.add_event(&entry(0, 1, 100), &mut counters, &monitoring).unwrap();
        execs.add_event(&exit(0, 1, 101), &mut counters, &monitoring).unwrap();

        let mut config = Config::default();
        config.prov_min_anom_time_usec = 1000;
        let gatherer = ProvenanceGatherer::new(&config);
        let metadata = MetadataRegistry::new();
        let names = FxHashMap::default();
        let id = execs.thread_call_list(0)[0];
        assert!(gatherer
            .gather(id, true, &execs, &metadata, &names, 0, 1, 100, 101, None)
            .is_none());
    }
}
