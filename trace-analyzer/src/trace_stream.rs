//! The trace-stream transport, consumed here only at its interface. A real
//! BP-file/SST engine is out of scope; `JsonDirTraceStream` is a file-based
//! stand-in used for local runs and tests, reading one JSON document per step
//! from a directory.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::assembler::{RawCommEvent, RawCounterEvent, RawFuncEvent};
use crate::error::{AnalysisError, Result};

/// One step's worth of raw data plus any attribute-dictionary updates,
/// exactly the shape `begin_step`/`fetch_step` deliver.
pub struct StepData {
    pub func_events: Vec<RawFuncEvent>,
    pub comm_events: Vec<RawCommEvent>,
    pub counter_events: Vec<RawCounterEvent>,
    /// `"timer <id>"` / `"event_type <id>"` / `"counter <id>"` style attribute
    /// rows, and metadata rows keyed by thread.
    pub attributes: HashMap<String, String>,
    pub metadata: Vec<crate::metadata::MetadataRecord>,
}

pub trait TraceStream {
    /// Returns `Ok(true)` if a new step is available, `Ok(false)` at a clean
    /// end of stream, `Err(FatalIo)` on an unrecoverable timeout.
    fn begin_step(&mut self, timeout: Duration) -> Result<bool>;

    fn fetch_step(&mut self) -> Result<StepData>;

    /// Releases the step's buffer early, before analysis begins.
    fn end_step(&mut self) -> Result<()>;
}

/// Reads `<dir>/<step>.json` files in increasing step order, one call to
/// `begin_step` per file, `Ok(false)` once the next expected file is absent.
pub struct JsonDirTraceStream {
    dir: PathBuf,
    next_step: u64,
    pending: Option<StepData>,
}

#[derive(Debug, Deserialize)]
struct RawStepFile {
    func_events: Vec<RawFuncEventJson>,
    #[serde(default)]
    comm_events: Vec<RawCommEventJson>,
    #[serde(default)]
    counter_events: Vec<RawCounterEventJson>,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    metadata: Vec<MetadataRecordJson>,
}

#[derive(Debug, Deserialize)]
struct RawFuncEventJson {
    program_id: i32,
    rank_id: i32,
    thread_id: u64,
    is_entry: bool,
    function_id: u64,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RawCommEventJson {
    program_id: i32,
    rank_id: i32,
    thread_id: u64,
    is_send: bool,
    partner_rank: i32,
    bytes: u64,
    tag: u64,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RawCounterEventJson {
    program_id: i32,
    rank_id: i32,
    thread_id: u64,
    counter_id: u64,
    value: i64,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct MetadataRecordJson {
    thread_id: u64,
    key: String,
    value: String,
}

impl JsonDirTraceStream {
    pub fn new(dir: PathBuf) -> Self {
        JsonDirTraceStream {
            dir,
            next_step: 0,
            pending: None,
        }
    }

    fn step_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{step}.json"))
    }
}

impl TraceStream for JsonDirTraceStream {
    fn begin_step(&mut self, _timeout: Duration) -> Result<bool> {
        let path = self.step_path(self.next_step);
        if !path.exists() {
            return Ok(false);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| AnalysisError::FatalIo(format!("cannot read step file {path:?}: {e}")))?;
        let raw: RawStepFile = serde_json::from_str(&text)
            .map_err(|e| AnalysisError::InvalidInput(format!("malformed step file {path:?}: {e}")))?;

        use crate::assembler::FuncEventKind;
        let func_events = raw
            .func_events
            .into_iter()
            .map(|e| RawFuncEvent {
                program_id: e.program_id,
                rank_id: e.rank_id,
                thread_id: e.thread_id,
                kind: if e.is_entry { FuncEventKind::Entry } else { FuncEventKind::Exit },
                function_id: e.function_id,
                timestamp: e.timestamp,
            })
            .collect();
        let comm_events = raw
            .comm_events
            .into_iter()
            .map(|e| RawCommEvent {
                program_id: e.program_id,
                rank_id: e.rank_id,
                thread_id: e.thread_id,
                direction: if e.is_send {
                    trace_model::CommDirection::Send
                } else {
                    trace_model::CommDirection::Recv
                },
                partner_rank: e.partner_rank,
                bytes: e.bytes,
                tag: e.tag,
                timestamp: e.timestamp,
            })
            .collect();
        let counter_events = raw
            .counter_events
            .into_iter()
            .map(|e| RawCounterEvent {
                program_id: e.program_id,
                rank_id: e.rank_id,
                thread_id: e.thread_id,
                counter_id: e.counter_id,
                value: e.value,
                timestamp: e.timestamp,
            })
            .collect();
        let metadata = raw
            .metadata
            .into_iter()
            .map(|m| crate::metadata::MetadataRecord {
                thread_id: m.thread_id,
                key: m.key,
                value: m.value,
            })
            .collect();

        self.pending = Some(StepData {
            func_events,
            comm_events,
            counter_events,
            attributes: raw.attributes,
            metadata,
        });
        Ok(true)
    }

    fn fetch_step(&mut self) -> Result<StepData> {
        self.pending
            .take()
            .ok_or_else(|| AnalysisError::Internal("fetch_step called before begin_step".to_string()))
    }

    fn end_step(&mut self) -> Result<()> {
        self.next_step += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_next_step_file_ends_stream() {
        let dir = std::env::temp_dir().join(format!("trace-analyzer-stream-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        fs::write(
            dir.join("0.json"),
            r#"{"func_events":[{"program_id":0,"rank_id":0,"thread_id":0,"is_entry":true,"function_id":1,"timestamp":100}]}"#,
        )
        .unwrap();

        let mut stream = JsonDirTraceStream::new(dir.clone());
        assert!(stream.begin_step(Duration::from_secs(1)).unwrap());
        let step = stream.fetch_step().unwrap();
        assert_eq!(step.func_events.len(), 1);
        stream.end_step().unwrap();

        assert!(!stream.begin_step(Duration::from_secs(1)).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }
}
