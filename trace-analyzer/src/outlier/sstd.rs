//! Two-moment outlier model (SSTD): threshold at `mean ± sigma * stddev`,
//! score `|x - mean| / stddev`.

use trace_model::{FunctionModel, Label, RunningStats};

use super::Classification;

#[derive(Debug, Clone, Copy)]
pub struct SstdModel {
    pub sigma: f64,
}

impl SstdModel {
    pub fn new(sigma: f64) -> Self {
        SstdModel { sigma }
    }

    pub fn empty_seed(&self) -> FunctionModel {
        FunctionModel::empty_running_stats()
    }

    pub fn classify(&self, model: Option<&FunctionModel>, value: f64, override_threshold: Option<f64>) -> Classification {
        let sigma = override_threshold.unwrap_or(self.sigma);
        let Some(stats) = model.and_then(FunctionModel::as_running_stats) else {
            return Classification::ok(Label::Normal, 0.0);
        };
        // Fewer than 2 samples: stddev is undefined, label Normal.
        if stats.count() < 2 {
            return Classification::ok(Label::Normal, 0.0);
        }
        let stddev = stats.stddev();
        if stddev == 0.0 {
            return if value == stats.mean() {
                Classification::ok(Label::Normal, 0.0)
            } else {
                Classification::ok(Label::Outlier, f64::INFINITY)
            };
        }
        let score = (value - stats.mean()).abs() / stddev;
        let label = if score <= sigma { Label::Normal } else { Label::Outlier };
        Classification::ok(label, score)
    }

    pub fn update(&self, model: Option<FunctionModel>, value: f64) -> FunctionModel {
        let mut stats = match model {
            Some(FunctionModel::RunningStats(rs)) => rs,
            _ => RunningStats::new(),
        };
        stats.push(value);
        FunctionModel::RunningStats(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_two_samples_is_normal() {
        let model = SstdModel::new(6.0);
        let mut stats = RunningStats::new();
        stats.push(10.0);
        let seed = FunctionModel::RunningStats(stats);
        let verdict = model.classify(Some(&seed), 1000.0, None);
        assert_eq!(verdict.label, Label::Normal);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn tight_cluster_flags_outlier() {
        let model = SstdModel::new(6.0);
        let mut seed = None;
        for v in [48.0, 49.0, 50.0, 51.0, 52.0, 49.0, 50.0, 51.0] {
            seed = Some(model.update(seed, v));
        }
        let verdict = model.classify(seed.as_ref(), 500.0, None);
        assert_eq!(verdict.label, Label::Outlier);
        assert!(verdict.score > 6.0);
    }
}
