//! Execution intervals: one entry per reconstructed function invocation, owned
//! in a flat arena and cross-linked only by stable identifiers — no shared
//! ownership, no raw pointers between intervals.

use serde::{Deserialize, Serialize};

use crate::event::{CommDirection, CounterId, FunctionId, RankId, ThreadId, Timestamp};

/// Stable identifier for one execution interval: the rank and step it was
/// opened on plus a monotonic per-rank counter. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecId {
    pub rank: RankId,
    pub step_of_entry: u64,
    pub seq: u64,
}

impl ExecId {
    pub fn new(rank: RankId, step_of_entry: u64, seq: u64) -> Self {
        ExecId {
            rank,
            step_of_entry,
            seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Unlabelled,
    Normal,
    Outlier,
}

impl Default for Label {
    fn default() -> Self {
        Label::Unlabelled
    }
}

/// A Send/Recv event attached to the innermost open execution at the time it
/// occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub timestamp: Timestamp,
    pub direction: CommDirection,
    pub partner_rank: RankId,
    pub bytes: u64,
    pub tag: u64,
}

/// A non-correlation-id counter sample attached to the innermost open
/// execution at the time it occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    pub counter_id: CounterId,
    pub value: i64,
    pub timestamp: Timestamp,
}

/// One reconstructed function invocation on one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInterval {
    pub id: ExecId,
    pub thread_id: ThreadId,
    pub function_id: FunctionId,
    pub entry_ts: Timestamp,
    /// `0` while the interval is still open (no matching Exit consumed yet).
    pub exit_ts: Timestamp,
    pub parent: Option<ExecId>,
    pub children: Vec<ExecId>,
    pub messages: Vec<MessageAttachment>,
    pub counters: Vec<CounterSample>,
    /// Bound via shared GPU correlation ids; see the Execution Manager's
    /// correlation bookkeeping.
    pub corr_partners: Vec<ExecId>,
    pub label: Label,
    pub score: f64,
    pub inclusive_runtime: u64,
    pub exclusive_runtime: u64,
}

impl ExecutionInterval {
    pub fn open(id: ExecId, thread_id: ThreadId, function_id: FunctionId, entry_ts: Timestamp, parent: Option<ExecId>) -> Self {
        ExecutionInterval {
            id,
            thread_id,
            function_id,
            entry_ts,
            exit_ts: 0,
            parent,
            children: Vec::new(),
            messages: Vec::new(),
            counters: Vec::new(),
            corr_partners: Vec::new(),
            label: Label::Unlabelled,
            score: 0.0,
            inclusive_runtime: 0,
            exclusive_runtime: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_ts == 0
    }

    /// Close the interval on Exit and finalize its runtimes. `children_inclusive_sum`
    /// is the sum of `inclusive_runtime` over `self.children`, computed by the
    /// caller (the Execution Manager) since this type has no arena access.
    pub fn close(&mut self, exit_ts: Timestamp, children_inclusive_sum: u64) {
        self.exit_ts = exit_ts;
        self.inclusive_runtime = exit_ts.saturating_sub(self.entry_ts);
        self.exclusive_runtime = self.inclusive_runtime.saturating_sub(children_inclusive_sum);
    }

    /// The configured statistic (§4.5) this execution contributes to the
    /// outlier model: either its exclusive or inclusive runtime.
    pub fn statistic(&self, use_exclusive: bool) -> f64 {
        if use_exclusive {
            self.exclusive_runtime as f64
        } else {
            self.inclusive_runtime as f64
        }
    }

    /// `true` if `ts` falls within `[entry_ts, exit_ts]` inclusive.
    pub fn contains_timestamp(&self, ts: Timestamp) -> bool {
        ts >= self.entry_ts && (self.is_open() || ts <= self.exit_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_computes_exclusive_from_children() {
        let mut iv = ExecutionInterval::open(ExecId::new(0, 1, 0), 0, 12, 100, None);
        iv.close(130, 10); // one child with inclusive runtime 10
        assert_eq!(iv.inclusive_runtime, 30);
        assert_eq!(iv.exclusive_runtime, 20);
    }

    #[test]
    fn open_interval_has_zero_exit_ts_and_is_open() {
        let iv = ExecutionInterval::open(ExecId::new(0, 1, 0), 0, 12, 100, None);
        assert!(iv.is_open());
        assert_eq!(iv.exit_ts, 0);
    }
}
