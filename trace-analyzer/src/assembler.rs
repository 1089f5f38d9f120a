//! Event assembler: merges the three per-step fixed-width record arrays
//! into one time-ordered, thread-partitioned event sequence, applying a
//! fixed tie-break order among events sharing a timestamp.

use rustc_hash::FxHashMap;

use trace_model::{
    CommDirection, CounterId, Event, EventPayload, FunctionId, ProgramId, RankId, ThreadId,
    Timestamp, CORRELATION_ID_COUNTER_NAME,
};

use crate::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncEventKind {
    Entry,
    Exit,
}

/// One row of the function-event array: `{program, rank, thread, event-type,
/// function-id, timestamp}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFuncEvent {
    pub program_id: ProgramId,
    pub rank_id: RankId,
    pub thread_id: ThreadId,
    pub kind: FuncEventKind,
    pub function_id: FunctionId,
    pub timestamp: Timestamp,
}

/// One row of the communication-event array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCommEvent {
    pub program_id: ProgramId,
    pub rank_id: RankId,
    pub thread_id: ThreadId,
    pub direction: CommDirection,
    pub partner_rank: RankId,
    pub bytes: u64,
    pub tag: u64,
    pub timestamp: Timestamp,
}

/// One row of the counter-event array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCounterEvent {
    pub program_id: ProgramId,
    pub rank_id: RankId,
    pub thread_id: ThreadId,
    pub counter_id: CounterId,
    pub value: i64,
    pub timestamp: Timestamp,
}

/// A client for resolving function-local ids to a global numbering, used
/// when a global-id mapping service is configured. Unseen ids are looked up
/// in one batched call per step.
pub trait GlobalIdMapper {
    fn resolve_batch(&mut self, local_ids: &[FunctionId]) -> FxHashMap<FunctionId, FunctionId>;
}

/// A mapper that performs no rewriting; used when no global-id service is
/// configured.
pub struct IdentityIdMapper;

impl GlobalIdMapper for IdentityIdMapper {
    fn resolve_batch(&mut self, local_ids: &[FunctionId]) -> FxHashMap<FunctionId, FunctionId> {
        local_ids.iter().map(|&id| (id, id)).collect()
    }
}

#[derive(Default)]
pub struct EventAssembler {
    /// Client-side cache of local id -> global id. A plain field rather than
    /// a shared handle, since the assembler itself is only ever driven from
    /// the single analysis thread.
    global_id_cache: FxHashMap<FunctionId, FunctionId>,
    /// Count of correlation-id counters that could not be paired with any
    /// entry/exit bracket within their tie group: counted and reported
    /// rather than silently dropped.
    pub unpairable_corrid_counters: u64,
}

impl EventAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one step's three raw arrays into a per-thread ordered event
    /// sequence. `override_rank`, when set, replaces every record's rank
    /// field regardless of its original value. `mapper` rewrites function
    /// ids in place when a global-id service is configured.
    pub fn assemble_step(
        &mut self,
        mut func_events: Vec<RawFuncEvent>,
        comm_events: Vec<RawCommEvent>,
        counter_events: Vec<RawCounterEvent>,
        counter_names: &FxHashMap<CounterId, String>,
        mapper: &mut dyn GlobalIdMapper,
        override_rank: Option<RankId>,
    ) -> FxHashMap<ThreadId, Vec<Event>> {
        self.rewrite_function_ids(&mut func_events, mapper);

        let mut by_thread: FxHashMap<ThreadId, ThreadStepInput> = FxHashMap::default();
        for e in func_events {
            by_thread.entry(e.thread_id).or_default().func.push(e);
        }
        for e in comm_events {
            by_thread.entry(e.thread_id).or_default().comm.push(e);
        }
        for e in counter_events {
            by_thread.entry(e.thread_id).or_default().counter.push(e);
        }

        let mut out = FxHashMap::default();
        for (thread_id, input) in by_thread {
            let events = self.assemble_thread(input, counter_names, override_rank);
            out.insert(thread_id, events);
        }
        out
    }

    fn rewrite_function_ids(&mut self, func_events: &mut [RawFuncEvent], mapper: &mut dyn GlobalIdMapper) {
        let unseen: Vec<FunctionId> = func_events
            .iter()
            .map(|e| e.function_id)
            .filter(|id| !self.global_id_cache.contains_key(id))
            .collect();
        if !unseen.is_empty() {
            let resolved = mapper.resolve_batch(&unseen);
            self.global_id_cache.extend(resolved);
        }
        for e in func_events.iter_mut() {
            if let Some(&global) = self.global_id_cache.get(&e.function_id) {
                e.function_id = global;
            }
        }
    }

    fn assemble_thread(
        &mut self,
        input: ThreadStepInput,
        counter_names: &FxHashMap<CounterId, String>,
        override_rank: Option<RankId>,
    ) -> Vec<Event> {
        let ThreadStepInput {
            mut func,
            mut comm,
            mut counter,
        } = input;

        func.sort_by_key(|e| e.timestamp);
        comm.sort_by_key(|e| e.timestamp);
        counter.sort_by_key(|e| e.timestamp);

        let mut timestamps: Vec<Timestamp> = func
            .iter()
            .map(|e| e.timestamp)
            .chain(comm.iter().map(|e| e.timestamp))
            .chain(counter.iter().map(|e| e.timestamp))
            .collect();
        timestamps.sort_unstable();
        timestamps.dedup();

        let mut fi = 0usize;
        let mut ci = 0usize;
        let mut cti = 0usize;
        let mut out = Vec::new();

        for ts in timestamps {
            let group_func: Vec<RawFuncEvent> = drain_while(&mut fi, &func, |e| e.timestamp == ts);
            let group_comm: Vec<RawCommEvent> = drain_while(&mut ci, &comm, |e| e.timestamp == ts);
            let group_counter: Vec<RawCounterEvent> = drain_while(&mut cti, &counter, |e| e.timestamp == ts);

            self.assemble_tie_group(group_func, group_comm, group_counter, counter_names, override_rank, &mut out);
        }

        out
    }

    /// Resolve one timestamp-tied group on one thread into output order:
    /// Entry brackets are matched via stack simulation; each
    /// bracket absorbs its Send/Recv/plain-Counter events, then (at most) one
    /// correlation-id counter claimed in arrival order; correlation-id
    /// counters in excess of the number of brackets are placed after all
    /// brackets (bound to whichever function opens next).
    fn assemble_tie_group(
        &mut self,
        func: Vec<RawFuncEvent>,
        comm: Vec<RawCommEvent>,
        counter: Vec<RawCounterEvent>,
        counter_names: &FxHashMap<CounterId, String>,
        override_rank: Option<RankId>,
        out: &mut Vec<Event>,
    ) {
        let mk = |program_id, rank_id, thread_id, timestamp, payload| {
            Event::new(
                program_id,
                override_rank.unwrap_or(rank_id),
                thread_id,
                timestamp,
                payload,
            )
        };

        // Stack-match entries/exits into brackets; a bracket with no exit in
        // this group stays open (its events still attach to it).
        struct Bracket {
            entry: RawFuncEvent,
            exit: Option<RawFuncEvent>,
            sends: Vec<RawCommEvent>,
            recvs: Vec<RawCommEvent>,
            plain_counters: Vec<RawCounterEvent>,
        }
        let mut brackets: Vec<Bracket> = Vec::new();
        let mut open_stack: Vec<usize> = Vec::new();

        for e in &func {
            match e.kind {
                FuncEventKind::Entry => {
                    brackets.push(Bracket {
                        entry: *e,
                        exit: None,
                        sends: Vec::new(),
                        recvs: Vec::new(),
                        plain_counters: Vec::new(),
                    });
                    open_stack.push(brackets.len() - 1);
                }
                FuncEventKind::Exit => {
                    if let Some(b) = open_stack.pop() {
                        brackets[b].exit = Some(*e);
                    }
                    // An Exit with nothing open in this group's bracket set is
                    // a cross-group close and is handled by the Execution
                    // Manager, not the assembler.
                }
            }
        }

        let (corrid_counters, plain_counters): (Vec<_>, Vec<_>) = counter
            .into_iter()
            .partition(|c| counter_names.get(&c.counter_id).map(|n| n.as_str()) == Some(CORRELATION_ID_COUNTER_NAME));

        for (i, c) in plain_counters.into_iter().enumerate() {
            let idx = i.min(brackets.len().saturating_sub(1));
            if !brackets.is_empty() {
                brackets[idx].plain_counters.push(c);
            } else {
                out.push(mk(
                    c.program_id,
                    c.rank_id,
                    c.thread_id,
                    c.timestamp,
                    EventPayload::Counter {
                        counter_id: c.counter_id,
                        value: c.value,
                    },
                ));
            }
        }
        for (i, c) in comm.into_iter().enumerate() {
            let idx = i.min(brackets.len().saturating_sub(1));
            if !brackets.is_empty() {
                match c.direction {
                    CommDirection::Send => brackets[idx].sends.push(c),
                    CommDirection::Recv => brackets[idx].recvs.push(c),
                }
            } else {
                out.push(mk(
                    c.program_id,
                    c.rank_id,
                    c.thread_id,
                    c.timestamp,
                    EventPayload::Comm {
                        direction: c.direction,
                        partner_rank: c.partner_rank,
                        bytes: c.bytes,
                        tag: c.tag,
                    },
                ));
            }
        }

        let mut trailing_corrid: Vec<RawCounterEvent> = Vec::new();
        for (i, c) in corrid_counters.into_iter().enumerate() {
            if i < brackets.len() {
                // The raw value is replayed as a normal counter event inside
                // the bracket, after any plain counters already queued there.
                brackets[i].plain_counters.push(c);
            } else {
                trailing_corrid.push(c);
            }
        }

        for b in brackets {
            out.push(mk(
                b.entry.program_id,
                b.entry.rank_id,
                b.entry.thread_id,
                b.entry.timestamp,
                EventPayload::Entry {
                    function_id: b.entry.function_id,
                },
            ));
            for s in b.sends {
                out.push(mk(
                    s.program_id,
                    s.rank_id,
                    s.thread_id,
                    s.timestamp,
                    EventPayload::Comm {
                        direction: CommDirection::Send,
                        partner_rank: s.partner_rank,
                        bytes: s.bytes,
                        tag: s.tag,
                    },
                ));
            }
            for r in b.recvs {
                out.push(mk(
                    r.program_id,
                    r.rank_id,
                    r.thread_id,
                    r.timestamp,
                    EventPayload::Comm {
                        direction: CommDirection::Recv,
                        partner_rank: r.partner_rank,
                        bytes: r.bytes,
                        tag: r.tag,
                    },
                ));
            }
            for pc in b.plain_counters {
                out.push(mk(
                    pc.program_id,
                    pc.rank_id,
                    pc.thread_id,
                    pc.timestamp,
                    EventPayload::Counter {
                        counter_id: pc.counter_id,
                        value: pc.value,
                    },
                ));
            }
            if let Some(exit) = b.exit {
                out.push(mk(
                    exit.program_id,
                    exit.rank_id,
                    exit.thread_id,
                    exit.timestamp,
                    EventPayload::Exit {
                        function_id: exit.function_id,
                    },
                ));
            }
        }

        for c in trailing_corrid {
            self.unpairable_corrid_counters += 1;
            out.push(mk(
                c.program_id,
                c.rank_id,
                c.thread_id,
                c.timestamp,
                EventPayload::Counter {
                    counter_id: c.counter_id,
                    value: c.value,
                },
            ));
        }
    }
}

#[derive(Default)]
struct ThreadStepInput {
    func: Vec<RawFuncEvent>,
    comm: Vec<RawCommEvent>,
    counter: Vec<RawCounterEvent>,
}

fn drain_while<T: Copy>(idx: &mut usize, items: &[T], pred: impl Fn(&T) -> bool) -> Vec<T> {
    let mut out = Vec::new();
    while *idx < items.len() && pred(&items[*idx]) {
        out.push(items[*idx]);
        *idx += 1;
    }
    out
}

/// Build a counter-name lookup from the attribute dictionary rows shaped like
/// `"counter <id>" -> "<name>"`. Malformed keys are recoverable and skipped.
pub fn parse_counter_name_attribute(key: &str, value: &str) -> Result<(CounterId, String), AnalysisError> {
    let id_str = key
        .strip_prefix("counter ")
        .ok_or_else(|| AnalysisError::InvalidInput(format!("not a counter attribute key: {key}")))?;
    let id: CounterId = id_str
        .parse()
        .map_err(|_| AnalysisError::InvalidInput(format!("malformed counter id in key: {key}")))?;
    Ok((id, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_names(corrid: CounterId) -> FxHashMap<CounterId, String> {
        let mut m = FxHashMap::default();
        m.insert(corrid, CORRELATION_ID_COUNTER_NAME.to_string());
        m
    }

    #[test]
    fn edge_case_ordering() {
        // Entry X, Exit X, Counter(corrid=1), next Entry Y all at ts=100.
        let func = vec![
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Entry,
                function_id: 1, // X
                timestamp: 100,
            },
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Exit,
                function_id: 1,
                timestamp: 100,
            },
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Entry,
                function_id: 2, // Y
                timestamp: 100,
            },
        ];
        let counter = vec![RawCounterEvent {
            program_id: 0,
            rank_id: 0,
            thread_id: 0,
            counter_id: 7,
            value: 1,
            timestamp: 100,
        }];

        let mut assembler = EventAssembler::new();
        let mut mapper = IdentityIdMapper;
        let result = assembler.assemble_step(func, vec![], counter, &counter_names(7), &mut mapper, None);
        let seq = &result[&0];

        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0].payload, EventPayload::Entry { function_id: 1 });
        assert_eq!(
            seq[1].payload,
            EventPayload::Counter {
                counter_id: 7,
                value: 1
            }
        );
        assert_eq!(seq[2].payload, EventPayload::Exit { function_id: 1 });
        assert_eq!(seq[3].payload, EventPayload::Entry { function_id: 2 });
    }

    #[test]
    fn plain_counter_precedes_corrid_counter_in_same_bracket() {
        // Entry X, Counter(plain=5), Counter(corrid=7), Exit X all at ts=100.
        let func = vec![
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Entry,
                function_id: 1,
                timestamp: 100,
            },
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Exit,
                function_id: 1,
                timestamp: 100,
            },
        ];
        let counter = vec![
            RawCounterEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                counter_id: 5,
                value: 42,
                timestamp: 100,
            },
            RawCounterEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                counter_id: 7,
                value: 1,
                timestamp: 100,
            },
        ];

        let mut assembler = EventAssembler::new();
        let mut mapper = IdentityIdMapper;
        let result = assembler.assemble_step(func, vec![], counter, &counter_names(7), &mut mapper, None);
        let seq = &result[&0];

        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0].payload, EventPayload::Entry { function_id: 1 });
        assert_eq!(
            seq[1].payload,
            EventPayload::Counter {
                counter_id: 5,
                value: 42
            }
        );
        assert_eq!(
            seq[2].payload,
            EventPayload::Counter {
                counter_id: 7,
                value: 1
            }
        );
        assert_eq!(seq[3].payload, EventPayload::Exit { function_id: 1 });
    }

    #[test]
    fn events_non_decreasing_in_timestamp_per_thread() {
        let func = vec![
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Entry,
                function_id: 1,
                timestamp: 100,
            },
            RawFuncEvent {
                program_id: 0,
                rank_id: 0,
                thread_id: 0,
                kind: FuncEventKind::Exit,
                function_id: 1,
                timestamp: 150,
            },
        ];
        let mut assembler = EventAssembler::new();
        let mut mapper = IdentityIdMapper;
        let result = assembler.assemble_step(func, vec![], vec![], &FxHashMap::default(), &mut mapper, None);
        let seq = &result[&0];
        let mut last = 0;
        for e in seq {
            assert!(e.timestamp >= last);
            last = e.timestamp;
        }
    }

    #[test]
    fn rank_override_replaces_every_record() {
        let func = vec![RawFuncEvent {
            program_id: 0,
            rank_id: 5,
            thread_id: 0,
            kind: FuncEventKind::Entry,
            function_id: 1,
            timestamp: 100,
        }];
        let mut assembler = EventAssembler::new();
        let mut mapper = IdentityIdMapper;
        let result = assembler.assemble_step(func, vec![], vec![], &FxHashMap::default(), &mut mapper, Some(9));
        assert_eq!(result[&0][0].rank_id, 9);
    }
}
