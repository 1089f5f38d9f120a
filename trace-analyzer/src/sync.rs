//! Model synchroniser: periodic merge of the local per-step increment
//! with the global model via the parameter server, falling back to a local
//! merge when no server is configured or it is unreachable.
//!
//! The sync-staggering formula is `(step + rank) mod f == 0 || step == 0` --
//! the `step == 0` branch is not implied by the modulo alone when
//! `rank != 0`, so every rank syncs on the very first step regardless of
//! stagger.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use trace_model::{GlobalModel, RankId};

use crate::error::{AnalysisError, Result};

/// The parameter-server transport: an opaque byte-payload request/reply
/// channel. `send` is queue-backed and returns immediately;
/// `send_and_receive` is the only operation that may block the driver
/// thread, bounded by `net_recv_timeout`.
pub trait ParamServerClient: Send {
    fn send(&self, payload: Vec<u8>);
    fn send_and_receive(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;
}

/// Used when no parameter server address is configured: every `send_and_receive`
/// fails as unreachable so the synchroniser always takes its local-merge
/// fallback path.
#[derive(Debug, Default)]
pub struct NullClient;

impl ParamServerClient for NullClient {
    fn send(&self, _payload: Vec<u8>) {}

    fn send_and_receive(&self, _payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>> {
        Err(AnalysisError::TransientIo("no parameter server configured".to_string()))
    }
}

/// A length-prefixed TCP client. One background thread owns the queue-backed
/// `send` path so the driver thread never blocks on fire-and-forget sends
///.
pub struct TcpParamServerClient {
    addr: String,
    queue_tx: Option<crossbeam_channel::Sender<Vec<u8>>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl TcpParamServerClient {
    pub fn connect(addr: String) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let worker_addr = addr.clone();
        let worker = std::thread::spawn(move || {
            while let Ok(payload) = queue_rx.recv() {
                if let Err(e) = fire_and_forget(&worker_addr, &payload) {
                    log::warn!("parameter-server fire-and-forget send to {worker_addr} failed: {e}");
                }
            }
        });
        TcpParamServerClient {
            addr,
            queue_tx: Some(queue_tx),
            worker: Some(worker),
        }
    }
}

impl ParamServerClient for TcpParamServerClient {
    fn send(&self, payload: Vec<u8>) {
        if let Some(tx) = &self.queue_tx {
            let _ = tx.send(payload);
        }
    }

    fn send_and_receive(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.addr)
            .map_err(|e| AnalysisError::TransientIo(format!("connect to parameter server {}: {e}", self.addr)))?;
        stream.set_write_timeout(Some(timeout)).ok();
        stream.set_read_timeout(Some(timeout)).ok();
        write_frame(&mut stream, &payload)
            .map_err(|e| AnalysisError::TransientIo(format!("send to parameter server: {e}")))?;
        read_frame(&mut stream).map_err(|e| AnalysisError::TransientIo(format!("receive from parameter server: {e}")))
    }
}

impl Drop for TcpParamServerClient {
    /// Close the queue and wait for the sender thread's backlog to drain
    /// before exit.
    fn drop(&mut self) {
        self.queue_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

fn fire_and_forget(addr: &str, payload: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    write_frame(&mut stream, payload)
}

/// The envelope carried over the parameter-server wire protocol.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParamServerMessage {
    pub sender_rank: RankId,
    pub receiver_rank: RankId,
    pub msg_type: MessageType,
    pub kind: MessageKind,
    pub step: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageType {
    Add,
    Get,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageKind {
    FunctionIndexMap,
    Parameters,
    CombinedStats,
}

pub struct ModelSynchroniser {
    frequency: u64,
    recv_timeout: Duration,
}

impl ModelSynchroniser {
    pub fn new(frequency: u64, recv_timeout: Duration) -> Self {
        ModelSynchroniser {
            frequency: frequency.max(1),
            recv_timeout,
        }
    }

    /// Whether step `step` on rank `rank` syncs this run, per the
    /// stagger formula above.
    pub fn should_sync(&self, step: u64, rank: RankId) -> bool {
        step == 0 || (step as i64 + rank as i64).rem_euclid(self.frequency as i64) == 0
    }

    /// Merge `local_increment` into `global` via `client`, clearing the
    /// increment afterwards. Falls back to a direct local merge if the
    /// server is unreachable or returns an unparseable payload.
    pub fn sync(&self, client: &dyn ParamServerClient, local_increment: &mut GlobalModel, global: &mut GlobalModel) {
        let payload = match serde_json::to_vec(&*local_increment) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to serialise local model increment: {e}");
                local_increment.clear();
                return;
            }
        };

        match client.send_and_receive(payload, self.recv_timeout) {
            Ok(bytes) => match serde_json::from_slice::<GlobalModel>(&bytes) {
                Ok(merged) => *global = merged,
                Err(e) => {
                    log::warn!("malformed parameter-server response, falling back to local merge: {e}");
                    if let Err(merge_err) = global.merge(local_increment) {
                        log::error!("local model merge failed: {merge_err}");
                    }
                }
            },
            Err(e) => {
                log::warn!("parameter server unreachable, falling back to local merge: {e}");
                if let Err(merge_err) = global.merge(local_increment) {
                    log::error!("local model merge failed: {merge_err}");
                }
            }
        }
        local_increment.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_model::{FunctionModel, RunningStats};

    #[test]
    fn sync_staggering_across_ranks() {
        let sync = ModelSynchroniser::new(2, Duration::from_millis(0));
        // Step 0 always syncs regardless of rank, so odd ranks get an extra
        // hit on top of their five modulo-aligned steps.
        let expected = [5, 6, 5, 6];
        for rank in 0..4i32 {
            let count = (0..10u64).filter(|&step| sync.should_sync(step, rank)).count();
            assert_eq!(count, expected[rank as usize], "rank {rank}");
        }
    }

    #[test]
    fn sync_with_unreachable_server_falls_back_to_local_merge() {
        let sync = ModelSynchroniser::new(1, Duration::from_millis(10));
        let client = NullClient;
        let mut global = GlobalModel::new();
        let mut stats = RunningStats::new();
        stats.push(1.0);
        let mut increment = GlobalModel::new();
        increment.0.insert(7, FunctionModel::RunningStats(stats));

        sync.sync(&client, &mut increment, &mut global);

        assert!(increment.is_empty());
        assert_eq!(global.get(7).unwrap().as_running_stats().unwrap().count(), 1);
    }

    #[test]
    fn sync_is_idempotent_on_empty_increment() {
        let sync = ModelSynchroniser::new(1, Duration::from_millis(10));
        let client = NullClient;
        let mut global = GlobalModel::new();
        let mut stats = RunningStats::new();
        stats.push(1.0);
        global.0.insert(7, FunctionModel::RunningStats(stats));
        let before = global.clone();

        let mut empty_increment = GlobalModel::new();
        sync.sync(&client, &mut empty_increment, &mut global);

        assert_eq!(global, before);
    }
}
