//! Copula-based outlier model (COPOD): left/right empirical-CDF tail scores
//! weighted by the histogram's skewness, with a minimum-value correction and
//! threshold derivation shared with HBOS.

use trace_model::{FunctionModel, Histogram, Label};

use super::Classification;

const EDGE_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub struct CopodModel {
    pub threshold_frac: f64,
    pub use_global_threshold: bool,
    pub max_bins: usize,
}

impl CopodModel {
    pub fn new(threshold_frac: f64, use_global_threshold: bool, max_bins: usize) -> Self {
        CopodModel {
            threshold_frac,
            use_global_threshold,
            max_bins,
        }
    }

    pub fn empty_seed(&self) -> FunctionModel {
        FunctionModel::empty_histogram()
    }

    fn sign(x: f64) -> f64 {
        if x > 0.0 {
            1.0
        } else if x < 0.0 {
            -1.0
        } else {
            0.0
        }
    }

    /// Left/right tail scores for `value`, with the minimum-value correction
    /// (CDF clamped to at least `1/N` for values at or above the observed
    /// minimum) applied before taking `-ln`.
    fn tail_scores(histogram: &Histogram, value: f64) -> (f64, f64) {
        let n = histogram.total_count().max(1) as f64;
        let min_cdf = 1.0 / n;

        let mut cdf_left = histogram.ecdf_left(value, EDGE_TOLERANCE);
        if value >= histogram.bin_edge_lower(0) {
            cdf_left = cdf_left.max(min_cdf);
        }
        let negated = histogram.negate();
        let mut cdf_right = negated.ecdf_left(-value, EDGE_TOLERANCE);
        if -value >= negated.bin_edge_lower(0) {
            cdf_right = cdf_right.max(min_cdf);
        }

        (-cdf_left.ln(), -cdf_right.ln())
    }

    /// Score range across every bin's midpoint, used identically to HBOS to
    /// derive a threshold from the observed score distribution.
    fn score_range(&self, histogram: &Histogram, skew: f64) -> (f64, f64) {
        let mut s_min = f64::INFINITY;
        let mut s_max = f64::NEG_INFINITY;
        for i in 0..histogram.num_bins() {
            if histogram.counts()[i] == 0 {
                continue;
            }
            let mid = (histogram.bin_edge_lower(i) + histogram.bin_edge_upper(i)) / 2.0;
            let s = Self::combine(Self::tail_scores(histogram, mid), skew);
            s_min = s_min.min(s);
            s_max = s_max.max(s);
        }
        if !s_min.is_finite() || !s_max.is_finite() {
            (0.0, 0.0)
        } else {
            (s_min, s_max)
        }
    }

    /// `max(avg(s_left, s_right), s_left*sign(skew-1) + s_right*sign(skew+1))`,
    /// with unit left/right weights.
    fn combine((s_left, s_right): (f64, f64), skew: f64) -> f64 {
        let avg = 0.5 * (s_left + s_right);
        let weighted = s_left * Self::sign(skew - 1.0) + s_right * Self::sign(skew + 1.0);
        avg.max(weighted)
    }

    pub fn classify(&self, model: Option<&FunctionModel>, value: f64, override_threshold: Option<f64>) -> Classification {
        let Some((histogram, stored_threshold)) = model.and_then(FunctionModel::as_histogram) else {
            return Classification::ok(Label::Normal, 0.0);
        };
        if histogram.is_empty() {
            return Classification::ok(Label::Normal, 0.0);
        }

        let skew = histogram.skewness();
        let score = Self::combine(Self::tail_scores(histogram, value), skew);
        let (s_min, s_max) = self.score_range(histogram, skew);
        let local_threshold = s_min + self.threshold_frac * (s_max - s_min);
        let threshold = override_threshold.unwrap_or(if self.use_global_threshold {
            local_threshold.max(stored_threshold)
        } else {
            local_threshold
        });

        let label = if score > threshold { Label::Outlier } else { Label::Normal };
        Classification::ok(label, score)
    }

    pub fn update(&self, model: Option<FunctionModel>, value: f64) -> FunctionModel {
        let (mut samples, stored_threshold) = match model {
            Some(FunctionModel::Histogram {
                samples,
                stored_threshold,
                ..
            }) => (samples, stored_threshold),
            _ => (Vec::new(), 0.0),
        };
        samples.push(value);
        let histogram = Histogram::generate(&samples, self.max_bins);
        FunctionModel::Histogram {
            histogram,
            samples,
            stored_threshold,
        }
    }

    /// As [`crate::outlier::hbos::HbosModel::local_threshold`], for COPOD's
    /// skewness-weighted score range.
    pub fn local_threshold(&self, model: &FunctionModel) -> Option<f64> {
        let (histogram, _) = model.as_histogram()?;
        if histogram.is_empty() {
            return None;
        }
        let skew = histogram.skewness();
        let (s_min, s_max) = self.score_range(histogram, skew);
        Some(s_min + self.threshold_frac * (s_max - s_min))
    }

    pub fn tighten_stored_threshold(&self, model: &mut FunctionModel, local_threshold: f64) {
        if let FunctionModel::Histogram { stored_threshold, .. } = model {
            *stored_threshold = stored_threshold.max(local_threshold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_model_labels_normal() {
        let model = CopodModel::new(0.99, true, 10);
        let seed = model.empty_seed();
        let verdict = model.classify(Some(&seed), 42.0, None);
        assert_eq!(verdict.label, Label::Normal);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn tight_cluster_flags_distant_outlier() {
        let model = CopodModel::new(0.9, true, 10);
        let mut seed = None;
        for i in 0..1000 {
            let v = 50.0 + ((i % 11) as f64 - 5.0);
            seed = Some(model.update(seed, v));
        }
        let verdict = model.classify(seed.as_ref(), 5000.0, None);
        assert_eq!(verdict.label, Label::Outlier);
    }

    #[test]
    fn stored_threshold_only_tightens() {
        let model = CopodModel::new(0.9, true, 10);
        let mut seed = FunctionModel::empty_histogram();
        model.tighten_stored_threshold(&mut seed, 5.0);
        model.tighten_stored_threshold(&mut seed, 2.0);
        assert_eq!(seed.as_histogram().unwrap().1, 5.0);
    }
}
