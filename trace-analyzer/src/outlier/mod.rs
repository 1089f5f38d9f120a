//! Outlier model: three interchangeable anomaly-scoring algorithms sharing a
//! single classification contract. Represented as a tagged variant rather
//! than a trait object — the set of algorithms is closed and each carries
//! its own serialisable model state.

mod copod;
mod hbos;
mod sstd;

pub use copod::CopodModel;
pub use hbos::HbosModel;
pub use sstd::SstdModel;

use trace_model::{FunctionModel, Label};

/// The verdict for one execution: whether it is Normal or an Outlier and its
/// anomaly score. `recoverable_error`, when set, is a diagnostic the caller
/// should count and log (e.g. HBOS's degenerate non-positive-score case) —
/// the classification itself is still usable and defensively Normal.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: Label,
    pub score: f64,
    pub recoverable_error: Option<String>,
}

impl Classification {
    fn ok(label: Label, score: f64) -> Self {
        Classification {
            label,
            score,
            recoverable_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutlierModel {
    Sstd(SstdModel),
    Hbos(HbosModel),
    Copod(CopodModel),
}

impl OutlierModel {
    pub fn empty_seed(&self) -> FunctionModel {
        match self {
            OutlierModel::Sstd(m) => m.empty_seed(),
            OutlierModel::Hbos(m) => m.empty_seed(),
            OutlierModel::Copod(m) => m.empty_seed(),
        }
    }

    /// Classify `value` against the function's current global model,
    /// respecting a configured per-function override threshold and the
    /// ignore list (callers check `ignore` before calling this).
    pub fn classify(&self, model: Option<&FunctionModel>, value: f64, override_threshold: Option<f64>) -> Classification {
        match self {
            OutlierModel::Sstd(m) => m.classify(model, value, override_threshold),
            OutlierModel::Hbos(m) => m.classify(model, value, override_threshold),
            OutlierModel::Copod(m) => m.classify(model, value, override_threshold),
        }
    }

    /// Fold `value` into `model` in place (creating an empty seed first if
    /// `model` is `None`), returning the updated model for storage.
    pub fn update(&self, model: Option<FunctionModel>, value: f64) -> FunctionModel {
        match self {
            OutlierModel::Sstd(m) => m.update(model, value),
            OutlierModel::Hbos(m) => m.update(model, value),
            OutlierModel::Copod(m) => m.update(model, value),
        }
    }

    /// After local updates for a step, apply global-threshold monotonic
    /// tightening where the algorithm supports it (HBOS/COPOD only).
    pub fn tighten_stored_threshold(&self, model: &mut FunctionModel, local_threshold: f64) {
        match self {
            OutlierModel::Sstd(_) => {}
            OutlierModel::Hbos(m) => m.tighten_stored_threshold(model, local_threshold),
            OutlierModel::Copod(m) => m.tighten_stored_threshold(model, local_threshold),
        }
    }

    /// The threshold implied by `model`'s own data, ignoring any
    /// previously-stored threshold; `None` for SSTD, which has no stored
    /// threshold to tighten.
    pub fn local_threshold(&self, model: &FunctionModel) -> Option<f64> {
        match self {
            OutlierModel::Sstd(_) => None,
            OutlierModel::Hbos(m) => m.local_threshold(model),
            OutlierModel::Copod(m) => m.local_threshold(model),
        }
    }
}

/// Ignore-listed or unmodeled functions are labelled Normal with zero score
/// without consulting any algorithm.
pub fn classify_ignored() -> Classification {
    Classification::ok(Label::Normal, 0.0)
}
