//! Data model for the per-rank trace-anomaly pipeline: raw events, the
//! reconstructed execution-interval arena, and the statistical outlier models
//! (running statistics, histograms) that are synchronised across ranks.
//!
//! This crate owns no I/O and spawns no threads; it is the shared vocabulary
//! between the assembler, the execution manager, the outlier model and the
//! provenance gatherer in `trace-analyzer`.

mod event;
mod execution;
mod histogram;
mod model;
mod stats;

pub use event::{
    CommDirection, CounterId, Event, EventPayload, FunctionId, ProgramId, RankId, ThreadId,
    Timestamp, CORRELATION_ID_COUNTER_NAME,
};
pub use execution::{CounterSample, ExecId, ExecutionInterval, Label, MessageAttachment};
pub use histogram::{Histogram, LEFT_OF_HISTOGRAM, RIGHT_OF_HISTOGRAM};
pub use model::{AnomalyMetrics, CombinedStats, FunctionModel, GlobalModel, ModelError};
pub use stats::RunningStats;
