//! The raw event types delivered by the trace stream, before reconstruction into
//! execution intervals.

use serde::{Deserialize, Serialize};

pub type Timestamp = u64;
pub type FunctionId = u64;
pub type ThreadId = u64;
pub type RankId = i32;
pub type ProgramId = i32;
pub type CounterId = u64;

/// The counter name that carries a GPU correlation id. Counter events whose
/// name resolves to this string are routed to correlation-id bookkeeping
/// instead of per-execution attachment.
pub const CORRELATION_ID_COUNTER_NAME: &str = "Correlation ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommDirection {
    Send,
    Recv,
}

/// The variant-specific payload of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Entry {
        function_id: FunctionId,
    },
    Exit {
        function_id: FunctionId,
    },
    Comm {
        direction: CommDirection,
        partner_rank: RankId,
        bytes: u64,
        tag: u64,
    },
    Counter {
        counter_id: CounterId,
        value: i64,
    },
}

impl EventPayload {
    pub fn is_entry(&self) -> bool {
        matches!(self, EventPayload::Entry { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, EventPayload::Exit { .. })
    }

    pub fn is_comm(&self) -> bool {
        matches!(self, EventPayload::Comm { .. })
    }

    pub fn is_counter(&self) -> bool {
        matches!(self, EventPayload::Counter { .. })
    }

    pub fn function_id(&self) -> Option<FunctionId> {
        match self {
            EventPayload::Entry { function_id } | EventPayload::Exit { function_id } => {
                Some(*function_id)
            }
            _ => None,
        }
    }
}

/// One immutable record from the trace stream, already scoped to a single
/// program/rank/thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub program_id: ProgramId,
    pub rank_id: RankId,
    pub thread_id: ThreadId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        program_id: ProgramId,
        rank_id: RankId,
        thread_id: ThreadId,
        timestamp: Timestamp,
        payload: EventPayload,
    ) -> Self {
        Event {
            program_id,
            rank_id,
            thread_id,
            timestamp,
            payload,
        }
    }
}
