//! Histogram-based outlier model (HBOS): per-bin score `-log2(count_i/N + alpha)`,
//! threshold derived from the score range of non-empty bins.
//!
//! `alpha` and the bin-edge tolerance are fixed constants rather than config
//! knobs.

use trace_model::{FunctionModel, Histogram, Label};

use super::Classification;

/// HBOS smoothing constant, kept well below any realistic bin fraction so it
/// only matters for empty bins.
const ALPHA: f64 = 78.88e-32;
/// Fraction of a bin's width treated as "still inside" the histogram at its
/// outer edges.
const EDGE_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub struct HbosModel {
    pub threshold_frac: f64,
    pub use_global_threshold: bool,
    pub max_bins: usize,
}

impl HbosModel {
    pub fn new(threshold_frac: f64, use_global_threshold: bool, max_bins: usize) -> Self {
        HbosModel {
            threshold_frac,
            use_global_threshold,
            max_bins,
        }
    }

    pub fn empty_seed(&self) -> FunctionModel {
        FunctionModel::empty_histogram()
    }

    /// `-log2(alpha)`, the maximum score a value outside the histogram domain
    /// can receive.
    fn max_score() -> f64 {
        -ALPHA.log2()
    }

    fn bin_score(count: u64, total: u64) -> f64 {
        -((count as f64 / total as f64) + ALPHA).log2()
    }

    /// Score range `[s_min, s_max]` across non-empty bins, and whether more
    /// than one non-empty bin would have produced a non-positive score (the
    /// original's `ADOutlierHBOS::labelData` recoverable-error check).
    fn score_range(histogram: &Histogram) -> (f64, f64, bool) {
        let total = histogram.total_count();
        let mut s_min = f64::INFINITY;
        let mut s_max = f64::NEG_INFINITY;
        let mut non_positive_count = 0u32;
        for &count in histogram.counts() {
            if count == 0 {
                continue;
            }
            let s = Self::bin_score(count, total);
            if s <= 0.0 {
                non_positive_count += 1;
            }
            s_min = s_min.min(s);
            s_max = s_max.max(s);
        }
        (s_min, s_max, non_positive_count > 1)
    }

    pub fn classify(&self, model: Option<&FunctionModel>, value: f64, override_threshold: Option<f64>) -> Classification {
        let Some((histogram, stored_threshold)) = model.and_then(FunctionModel::as_histogram) else {
            return Classification::ok(Label::Normal, 0.0);
        };
        if histogram.is_empty() {
            return Classification::ok(Label::Normal, 0.0);
        }

        let (s_min, s_max, recoverable) = Self::score_range(histogram);
        let local_threshold = s_min + self.threshold_frac * (s_max - s_min);
        let threshold = override_threshold.unwrap_or(if self.use_global_threshold {
            local_threshold.max(stored_threshold)
        } else {
            local_threshold
        });

        let bin = histogram.get_bin(value, EDGE_TOLERANCE);
        let score = if bin < 0 {
            Self::max_score()
        } else {
            Self::bin_score(histogram.counts()[bin as usize], histogram.total_count())
        };

        let label = if score > threshold { Label::Outlier } else { Label::Normal };

        Classification {
            label,
            score,
            recoverable_error: if recoverable {
                Some(format!(
                    "HBOS produced non-positive scores for more than one non-empty bin ({})",
                    histogram.print_bounds()
                ))
            } else {
                None
            },
        }
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

    /// The local threshold implied by `model`'s current histogram alone
    /// (i.e. ignoring any stored/global threshold), used by the Model
    /// Synchroniser to tighten the local increment before it is merged
    /// upward.
    pub fn local_threshold(&self, model: &FunctionModel) -> Option<f64> {
        let (histogram, _) = model.as_histogram()?;
        if histogram.is_empty() {
            return None;
        }
        let (s_min, s_max, _) = Self::score_range(histogram);
        Some(s_min + self.threshold_frac * (s_max - s_min))
    }

    /// Raise the stored threshold to `local_threshold` if it is more
    /// stringent; the stored threshold only ever tightens, never loosens.
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
        let model = HbosModel::new(0.99, true, 10);
        let seed = model.empty_seed();
        let verdict = model.classify(Some(&seed), 42.0, None);
        assert_eq!(verdict.label, Label::Normal);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn tight_cluster_flags_distant_outlier() {
        let model = HbosModel::new(0.99, true, 10);
        let mut seed = None;
        for i in 0..1000 {
            let v = 50.0 + ((i % 11) as f64 - 5.0);
            seed = Some(model.update(seed, v));
        }
        let verdict = model.classify(seed.as_ref(), 500.0, None);
        assert_eq!(verdict.label, Label::Outlier);
        assert!((verdict.score - HbosModel::max_score()).abs() < 1e-6);
    }

    #[test]
    fn stored_threshold_only_tightens() {
        let model = HbosModel::new(0.99, true, 10);
        let mut seed = FunctionModel::empty_histogram();
        model.tighten_stored_threshold(&mut seed, 5.0);
        model.tighten_stored_threshold(&mut seed, 2.0);
        assert_eq!(seed.as_histogram().unwrap().1, 5.0);
        model.tighten_stored_threshold(&mut seed, 9.0);
        assert_eq!(seed.as_histogram().unwrap().1, 9.0);
    }
}
