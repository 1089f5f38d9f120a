//! Per-function outlier models and the global model view that is merged
//! across ranks by the model synchroniser.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{CounterId, FunctionId};
use crate::histogram::Histogram;
use crate::stats::RunningStats;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("cannot merge a RunningStats model with a Histogram model for the same function")]
    VariantMismatch,
}

/// The per-function model payload. Which variant is populated is determined
/// once per run by the configured algorithm (SSTD uses `RunningStats`; HBOS
/// and COPOD both use `Histogram`, differing only in how they score against it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionModel {
    RunningStats(RunningStats),
    Histogram {
        histogram: Histogram,
        /// Raw samples seen since `histogram` was last rebuilt from scratch.
        /// Only ever populated on a local increment; merging into a global
        /// view folds them into the histogram and drops them.
        samples: Vec<f64>,
        /// The more-stringent-wins stored threshold used in global-threshold
        /// mode; irrelevant, and left at 0, otherwise.
        stored_threshold: f64,
    },
}

impl FunctionModel {
    pub fn empty_running_stats() -> Self {
        FunctionModel::RunningStats(RunningStats::new())
    }

    pub fn empty_histogram() -> Self {
        FunctionModel::Histogram {
            histogram: Histogram::empty(),
            samples: Vec::new(),
            stored_threshold: 0.0,
        }
    }

    pub fn as_running_stats(&self) -> Option<&RunningStats> {
        match self {
            FunctionModel::RunningStats(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn as_histogram(&self) -> Option<(&Histogram, f64)> {
        match self {
            FunctionModel::Histogram {
                histogram,
                stored_threshold,
                ..
            } => Some((histogram, *stored_threshold)),
            _ => None,
        }
    }

    /// Merge `other` into `self` in place. RunningStats merges via the
    /// parallel-merge formula; Histograms rebin onto their union domain and
    /// the stored threshold takes the larger (more stringent) value.
    pub fn merge(&mut self, other: &FunctionModel) -> Result<(), ModelError> {
        match (self, other) {
            (FunctionModel::RunningStats(a), FunctionModel::RunningStats(b)) => {
                a.merge(b);
                Ok(())
            }
            (
                FunctionModel::Histogram {
                    histogram,
                    stored_threshold,
                    ..
                },
                FunctionModel::Histogram {
                    histogram: other_hist,
                    stored_threshold: other_thresh,
                    ..
                },
            ) => {
                *histogram = histogram.merge(other_hist);
                *stored_threshold = stored_threshold.max(*other_thresh);
                Ok(())
            }
            _ => Err(ModelError::VariantMismatch),
        }
    }
}

/// A function-id -> model mapping, used both as the local increment and as
/// the global view after synchronisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel(pub FxHashMap<FunctionId, FunctionModel>);

impl GlobalModel {
    pub fn new() -> Self {
        GlobalModel(FxHashMap::default())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, function_id: FunctionId) -> Option<&FunctionModel> {
        self.0.get(&function_id)
    }

    pub fn get_mut(&mut self, function_id: FunctionId) -> Option<&mut FunctionModel> {
        self.0.get_mut(&function_id)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Pointwise merge: for each function in `other`, merge into the matching
    /// entry in `self` (inserting it verbatim if `self` has none yet).
    pub fn merge(&mut self, other: &GlobalModel) -> Result<(), ModelError> {
        for (func_id, model) in &other.0 {
            match self.0.get_mut(func_id) {
                Some(existing) => existing.merge(model)?,
                None => {
                    self.0.insert(*func_id, model.clone());
                }
            }
        }
        Ok(())
    }
}

/// Per-function counts of executions classified this step, folded into the
/// `CombinedStats` payload sent to the parameter server alongside function
/// and counter statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyMetrics {
    pub num_executions: u64,
    pub num_outliers: u64,
}

impl AnomalyMetrics {
    pub fn record(&mut self, is_outlier: bool) {
        self.num_executions += 1;
        if is_outlier {
            self.num_outliers += 1;
        }
    }

    pub fn merge(&mut self, other: &AnomalyMetrics) {
        self.num_executions += other.num_executions;
        self.num_outliers += other.num_outliers;
    }
}

/// The single combined payload sent to the parameter server once per step:
/// function statistics, counter statistics, and anomaly metrics bundled into
/// one wire message rather than three round trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedStats {
    pub step: u64,
    pub function_stats: FxHashMap<FunctionId, RunningStats>,
    pub counter_stats: FxHashMap<CounterId, RunningStats>,
    pub anomaly_metrics: FxHashMap<FunctionId, AnomalyMetrics>,
}

impl CombinedStats {
    pub fn new(step: u64) -> Self {
        CombinedStats {
            step,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_mismatched_variants_errors() {
        let mut a = FunctionModel::empty_running_stats();
        let b = FunctionModel::empty_histogram();
        assert_eq!(a.merge(&b), Err(ModelError::VariantMismatch));
    }

    #[test]
    fn global_model_merge_is_pointwise() {
        let mut global = GlobalModel::new();
        let mut local = GlobalModel::new();

        let mut rs_a = RunningStats::new();
        rs_a.push(1.0);
        global.0.insert(10, FunctionModel::RunningStats(rs_a));

        let mut rs_b = RunningStats::new();
        rs_b.push(2.0);
        local.0.insert(10, FunctionModel::RunningStats(rs_b));
        local
            .0
            .insert(20, FunctionModel::RunningStats(RunningStats::new()));

        global.merge(&local).unwrap();
        assert_eq!(global.0.len(), 2);
        assert_eq!(global.get(10).unwrap().as_running_stats().unwrap().count(), 2);
    }

    #[test]
    fn combined_stats_roundtrips_through_json() {
        let mut cs = CombinedStats::new(7);
        cs.anomaly_metrics.insert(
            42,
            AnomalyMetrics {
                num_executions: 5,
                num_outliers: 1,
            },
        );
        let json = serde_json::to_string(&cs).unwrap();
        let back: CombinedStats = serde_json::from_str(&json).unwrap();
        assert_eq!(cs, back);
    }
}
