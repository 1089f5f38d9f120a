//! Reconstructs call-stack-structured execution intervals, attaches
//! counters and messages, matches GPU correlation ids, and ages intervals
//! out of the call list on demand.
//!
//! Intervals live in a flat arena (`Vec<ExecutionInterval>`), addressed only
//! by the stable [`ExecId`] so that cross-links (parent, children,
//! correlation partners) survive purging without dangling references.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use trace_model::{
    CommDirection, CounterSample, Event, EventPayload, ExecId, ExecutionInterval, FunctionId,
    MessageAttachment, ThreadId, CORRELATION_ID_COUNTER_NAME,
};

use crate::counter_manager::CounterManager;
use crate::error::{AnalysisError, Result};
use crate::monitoring::MonitoringView;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub purged: usize,
    pub kept_protected: usize,
    pub kept_incomplete: usize,
    pub kept_window: usize,
}

/// Correlation-id bookkeeping: a bidirectional map between a corr-id and the
/// execution that is waiting for its partner, plus an age (in steps) past
/// which an unmatched entry is given up on.
#[derive(Debug, Default)]
struct CorrelationTracker {
    pending: FxHashMap<i64, (ExecId, u64)>,
    unmatched: FxHashSet<i64>,
}

pub struct ExecutionManager {
    rank: trace_model::RankId,
    arena: FxHashMap<ExecId, ExecutionInterval>,
    open_stack: FxHashMap<ThreadId, Vec<ExecId>>,
    /// Closed intervals pending analysis/provenance, insertion-ordered.
    call_list: FxHashMap<ThreadId, VecDeque<ExecId>>,
    next_seq: u64,
    current_step: u64,
    correlation: CorrelationTracker,
    /// Functions that misuse the correlation-id counter and should not have
    /// it tracked.
    no_corr_track: FxHashSet<FunctionId>,
    /// Corr-id pending entries older than this many steps age into the
    /// diagnostic unmatched set.
    corr_age_limit_steps: u64,
}

impl ExecutionManager {
    pub fn new(rank: trace_model::RankId, corr_age_limit_steps: u64) -> Self {
        ExecutionManager {
            rank,
            arena: FxHashMap::default(),
            open_stack: FxHashMap::default(),
            call_list: FxHashMap::default(),
            next_seq: 0,
            current_step: 0,
            correlation: CorrelationTracker::default(),
            no_corr_track: FxHashSet::default(),
            corr_age_limit_steps,
        }
    }

    pub fn set_no_corr_track_functions(&mut self, functions: impl IntoIterator<Item = FunctionId>) {
        self.no_corr_track = functions.into_iter().collect();
    }

    pub fn begin_step(&mut self, step: u64) {
        self.current_step = step;
    }

    pub fn get(&self, id: ExecId) -> Option<&ExecutionInterval> {
        self.arena.get(&id)
    }

    /// Dispatch one assembled event. `counters` routes non-attachable
    /// counters (no open interval, not a correlation id); `monitoring`
    /// suppresses attachment for counters reserved as node-state monitoring.
    pub fn add_event(
        &mut self,
        event: &Event,
        counters: &mut CounterManager,
        monitoring: &MonitoringView,
    ) -> Result<()> {
        match &event.payload {
            EventPayload::Entry { function_id } => {
                self.on_entry(event.thread_id, *function_id, event.timestamp);
                Ok(())
            }
            EventPayload::Exit { function_id } => self.on_exit(event.thread_id, *function_id, event.timestamp),
            EventPayload::Comm {
                direction,
                partner_rank,
                bytes,
                tag,
            } => {
                self.on_comm(event.thread_id, event.timestamp, *direction, *partner_rank, *bytes, *tag);
                Ok(())
            }
            EventPayload::Counter { counter_id, value } => {
                self.on_counter(event.thread_id, event.timestamp, *counter_id, *value, counters, monitoring);
                Ok(())
            }
        }
    }

    fn on_entry(&mut self, thread_id: ThreadId, function_id: FunctionId, ts: u64) {
        let parent = self.open_stack.get(&thread_id).and_then(|s| s.last().copied());
        let id = ExecId::new(self.rank, self.current_step, self.next_seq);
        self.next_seq += 1;

        let interval = ExecutionInterval::open(id, thread_id, function_id, ts, parent);
        self.arena.insert(id, interval);
        if let Some(parent_id) = parent {
            if let Some(parent_iv) = self.arena.get_mut(&parent_id) {
                parent_iv.children.push(id);
            }
        }
        self.open_stack.entry(thread_id).or_default().push(id);
    }

    fn on_exit(&mut self, thread_id: ThreadId, function_id: FunctionId, ts: u64) -> Result<()> {
        let stack = self.open_stack.entry(thread_id).or_default();
        let Some(&top_id) = stack.last() else {
            return Err(AnalysisError::InvalidInput(format!(
                "Exit for function {function_id} on thread {thread_id} with no open interval"
            )));
        };
        let top_function = self.arena.get(&top_id).map(|iv| iv.function_id);
        if top_function != Some(function_id) {
            return Err(AnalysisError::InvalidInput(format!(
                "Exit function {function_id} does not match open interval's function {:?} on thread {thread_id}",
                top_function
            )));
        }
        stack.pop();

        let children_inclusive: u64 = self
            .arena
            .get(&top_id)
            .map(|iv| {
                iv.children
                    .iter()
                    .filter_map(|c| self.arena.get(c))
                    .map(|c| c.inclusive_runtime)
                    .sum()
            })
            .unwrap_or(0);

        if let Some(iv) = self.arena.get_mut(&top_id) {
            iv.close(ts, children_inclusive);
        }
        self.call_list.entry(thread_id).or_default().push_back(top_id);
        Ok(())
    }

    fn on_comm(
        &mut self,
        thread_id: ThreadId,
        ts: u64,
        direction: CommDirection,
        partner_rank: trace_model::RankId,
        bytes: u64,
        tag: u64,
    ) {
        let Some(&top_id) = self.open_stack.get(&thread_id).and_then(|s| s.last()) else {
            log::warn!("dropping {direction:?} event on thread {thread_id}: no open interval");
            return;
        };
        if let Some(iv) = self.arena.get_mut(&top_id) {
            iv.messages.push(MessageAttachment {
                timestamp: ts,
                direction,
                partner_rank,
                bytes,
                tag,
            });
        }
    }

    fn on_counter(
        &mut self,
        thread_id: ThreadId,
        ts: u64,
        counter_id: trace_model::CounterId,
        value: i64,
        counters: &mut CounterManager,
        monitoring: &MonitoringView,
    ) {
        if monitoring.is_monitoring_only(counter_id) {
            counters.record(counter_id, ts, value);
            return;
        }

        let is_corrid = counters.name_for_id(counter_id) == Some(CORRELATION_ID_COUNTER_NAME);
        let top_id = self.open_stack.get(&thread_id).and_then(|s| s.last().copied());

        if is_corrid {
            let suppressed = top_id
                .and_then(|id| self.arena.get(&id))
                .map(|iv| self.no_corr_track.contains(&iv.function_id))
                .unwrap_or(false);
            if !suppressed {
                if let Some(id) = top_id {
                    self.bind_correlation_id(value, id);
                }
            }
            return;
        }

        match top_id {
            Some(id) => {
                if let Some(iv) = self.arena.get_mut(&id) {
                    iv.counters.push(CounterSample {
                        counter_id,
                        value,
                        timestamp: ts,
                    });
                }
            }
            None => counters.record(counter_id, ts, value),
        }
    }

    /// Bind a correlation id to `exec_id`. If another execution already
    /// claimed this id, they become mutual partners; otherwise `exec_id`
    /// starts waiting for its partner.
    fn bind_correlation_id(&mut self, corr_id: i64, exec_id: ExecId) {
        match self.correlation.pending.remove(&corr_id) {
            Some((partner, _age)) if partner != exec_id => {
                if let Some(iv) = self.arena.get_mut(&exec_id) {
                    iv.corr_partners.push(partner);
                }
                if let Some(iv) = self.arena.get_mut(&partner) {
                    iv.corr_partners.push(exec_id);
                }
            }
            _ => {
                self.correlation.pending.insert(corr_id, (exec_id, self.current_step));
            }
        }
    }

    /// Age out correlation ids whose entry has outlived `corr_age_limit_steps`
    /// without a partner, moving them into the diagnostic unmatched set.
    fn age_correlation_ids(&mut self) {
        let step = self.current_step;
        let limit = self.corr_age_limit_steps;
        let expired: Vec<i64> = self
            .correlation
            .pending
            .iter()
            .filter(|(_, (_, age))| step.saturating_sub(*age) > limit)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.correlation.pending.remove(&id);
            self.correlation.unmatched.insert(id);
        }
    }

    pub fn unmatched_correlation_ids(&self) -> &FxHashSet<i64> {
        &self.correlation.unmatched
    }

    /// View of closed-but-unclassified executions, grouped by function id,
    /// for the outlier model's `classify` contract.
    pub fn exec_data_map(&self) -> FxHashMap<FunctionId, Vec<ExecId>> {
        let mut out: FxHashMap<FunctionId, Vec<ExecId>> = FxHashMap::default();
        for ids in self.call_list.values() {
            for &id in ids {
                if let Some(iv) = self.arena.get(&id) {
                    if iv.label == trace_model::Label::Unlabelled {
                        out.entry(iv.function_id).or_default().push(id);
                    }
                }
            }
        }
        out
    }

    pub fn label(&mut self, id: ExecId, label: trace_model::Label, score: f64) {
        if let Some(iv) = self.arena.get_mut(&id) {
            iv.label = label;
            iv.score = score;
        }
    }

    /// The closed intervals on `thread_id`'s call list, insertion-ordered.
    pub fn thread_call_list(&self, thread_id: ThreadId) -> Vec<ExecId> {
        self.call_list.get(&thread_id).map(|d| d.iter().copied().collect()).unwrap_or_default()
    }

    /// The interval at `id` plus up to `n` preceding and `n+1` following
    /// intervals on the same thread, insertion-ordered.
    pub fn call_window(&self, id: ExecId, n: usize) -> Vec<ExecId> {
        let Some(thread_id) = self.arena.get(&id).map(|iv| iv.thread_id) else {
            return Vec::new();
        };
        let Some(list) = self.call_list.get(&thread_id) else {
            return Vec::new();
        };
        let Some(pos) = list.iter().position(|&x| x == id) else {
            return Vec::new();
        };
        let start = pos.saturating_sub(n);
        let end = (pos + n + 1).min(list.len().saturating_sub(1));
        list.iter().skip(start).take(end - start + 1).copied().collect()
    }

    /// Remove closed intervals that are neither referenced as a parent or
    /// correlation partner of any retained interval, nor within `window` of
    /// the end of their thread's call list.
    pub fn purge_call_list(&mut self, window: usize) -> PurgeStats {
        self.age_correlation_ids();

        let mut referenced: FxHashSet<ExecId> = FxHashSet::default();
        for iv in self.arena.values() {
            if let Some(p) = iv.parent {
                referenced.insert(p);
            }
            for c in &iv.corr_partners {
                referenced.insert(*c);
            }
        }
        // Corr-ids still awaiting a partner protect their claimant too.
        for (claimant, _) in self.correlation.pending.values() {
            referenced.insert(*claimant);
        }

        let mut stats = PurgeStats::default();

        for ids in self.call_list.values_mut() {
            let len = ids.len();
            let window_start = len.saturating_sub(window);
            let mut keep = VecDeque::with_capacity(len);

            for (idx, id) in ids.drain(..).enumerate() {
                let is_open = self.arena.get(&id).map(|iv| iv.is_open()).unwrap_or(false);
                if is_open {
                    stats.kept_incomplete += 1;
                    keep.push_back(id);
                } else if idx >= window_start {
                    stats.kept_window += 1;
                    keep.push_back(id);
                } else if referenced.contains(&id) {
                    stats.kept_protected += 1;
                    keep.push_back(id);
                } else {
                    self.arena.remove(&id);
                    stats.purged += 1;
                }
            }
            *ids = keep;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_model::EventPayload;

    fn entry(thread: u64, fid: u64, ts: u64) -> Event {
        Event::new(0, 0, thread, ts, EventPayload::Entry { function_id: fid })
    }
    fn exit(thread: u64, fid: u64, ts: u64) -> Event {
        Event::new(0, 0, thread, ts, EventPayload::Exit { function_id: fid })
    }
    fn counter(thread: u64, cid: u64, value: i64, ts: u64) -> Event {
        Event::new(
            0,
            0,
            thread,
            ts,
            EventPayload::Counter {
                counter_id: cid,
                value,
            },
        )
    }

    #[test]
    fn nested_intervals_with_counter() {
        let mut mgr = ExecutionManager::new(0, 10);
        let mut counters = CounterManager::new();
        counters.register_name(7, "some_counter".to_string());
        let monitoring = MonitoringView::new(vec![], None);

        mgr.add_event(&entry(0, 12, 100), &mut counters, &monitoring).unwrap();
        mgr.add_event(&entry(0, 13, 110), &mut counters, &monitoring).unwrap();
        mgr.add_event(&counter(0, 7, 42, 115), &mut counters, &monitoring).unwrap();
        mgr.add_event(&exit(0, 13, 120), &mut counters, &monitoring).unwrap();
        mgr.add_event(&exit(0, 12, 130), &mut counters, &monitoring).unwrap();

        let list: Vec<ExecId> = mgr.call_list[&0].iter().copied().collect();
        assert_eq!(list.len(), 2);

        let inner = mgr.get(list[0]).unwrap();
        assert_eq!(inner.function_id, 13);
        assert_eq!(inner.counters.len(), 1);
        assert_eq!(inner.counters[0].value, 42);
        assert_eq!(inner.inclusive_runtime, 10);

        let outer = mgr.get(list[1]).unwrap();
        assert_eq!(outer.function_id, 12);
        assert_eq!(outer.children, vec![list[0]]);
        assert_eq!(outer.inclusive_runtime, 30);
        assert_eq!(outer.exclusive_runtime, 20);
    }

    #[test]
    fn mismatched_exit_is_recoverable_error() {
        let mut mgr = ExecutionManager::new(0, 10);
        let mut counters = CounterManager::new();
        let monitoring = MonitoringView::new(vec![], None);

        mgr.add_event(&entry(0, 1, 100), &mut counters, &monitoring).unwrap();
        let err = mgr.add_event(&exit(0, 2, 110), &mut counters, &monitoring);
        assert!(err.is_err());
        // The stack top is untouched: the real Exit for function 1 still
        // closes it correctly afterwards.
        mgr.add_event(&exit(0, 1, 120), &mut counters, &monitoring).unwrap();
        assert_eq!(mgr.call_list[&0].len(), 1);
    }

    #[test]
    fn correlation_id_pairing_across_threads() {
        let mut mgr = ExecutionManager::new(0, 10);
        let mut counters = CounterManager::new();
        counters.register_name(99, CORRELATION_ID_COUNTER_NAME.to_string());
        let monitoring = MonitoringView::new(vec![], None);

        mgr.add_event(&entry(0, 100, 200), &mut counters, &monitoring).unwrap();
        mgr.add_event(&counter(0, 99, 999, 205), &mut counters, &monitoring).unwrap();
        mgr.add_event(&exit(0, 100, 210), &mut counters, &monitoring).unwrap();

        mgr.add_event(&entry(1, 200, 220), &mut counters, &monitoring).unwrap();
        mgr.add_event(&counter(1, 99, 999, 225), &mut counters, &monitoring).unwrap();
        mgr.add_event(&exit(1, 200, 300), &mut counters, &monitoring).unwrap();

        let cpu_id = mgr.call_list[&0][0];
        let gpu_id = mgr.call_list[&1][0];
        assert_eq!(mgr.get(gpu_id).unwrap().corr_partners, vec![cpu_id]);
        assert_eq!(mgr.get(cpu_id).unwrap().corr_partners, vec![gpu_id]);
    }

    #[test]
    fn purge_retains_window_and_referenced() {
        let mut mgr = ExecutionManager::new(0, 10);
        let mut counters = CounterManager::new();
        let monitoring = MonitoringView::new(vec![], None);

        for step in 1..=2u64 {
            mgr.begin_step(step);
            for i in 0..10u64 {
                let ts = step * 1000 + i * 10;
                mgr.add_event(&entry(0, i, ts), &mut counters, &monitoring).unwrap();
                mgr.add_event(&exit(0, i, ts + 5), &mut counters, &monitoring).unwrap();
            }
        }

        let first_of_step2 = mgr.call_list[&0][10];
        let stats = mgr.purge_call_list(3);
        assert!(stats.purged > 0);
        assert!(mgr.get(first_of_step2).is_none());
        assert_eq!(mgr.call_list[&0].len(), 3);
    }
}
