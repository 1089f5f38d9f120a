//! The five error kinds, each carrying the policy for what happens when it
//! occurs: `InvalidInput` and `TransientIO` are counted and
//! logged but non-fatal; `ConfigError` is fatal at startup; `FatalIO` drains
//! the pipeline and exits cleanly; `Internal` drops the offending execution
//! from provenance but not from the model.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("fatal I/O error: {0}")]
    FatalIo(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Whether this error is survivable: logged and counted, with processing
    /// of the containing step continuing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalysisError::InvalidInput(_) | AnalysisError::TransientIo(_) | AnalysisError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Tallies of recoverable errors over the lifetime of one rank's analysis
/// process, surfaced in the shutdown summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorCounters {
    pub invalid_input: u64,
    pub transient_io: u64,
    pub internal: u64,
}

impl ErrorCounters {
    pub fn record(&mut self, err: &AnalysisError) {
        match err {
            AnalysisError::InvalidInput(msg) => {
                self.invalid_input += 1;
                log::warn!("invalid input: {msg}");
            }
            AnalysisError::TransientIo(msg) => {
                self.transient_io += 1;
                log::warn!("transient I/O error: {msg}");
            }
            AnalysisError::Internal(msg) => {
                self.internal += 1;
                log::error!("internal error: {msg}");
            }
            AnalysisError::FatalIo(msg) => {
                log::error!("fatal I/O error: {msg}");
            }
            AnalysisError::Config(msg) => {
                log::error!("configuration error: {msg}");
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.invalid_input + self.transient_io + self.internal
    }
}
