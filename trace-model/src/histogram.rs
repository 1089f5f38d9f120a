//! Histograms over function-runtime samples, used by the HBOS and COPOD outlier
//! models. Bin width follows a variance-driven rule (`3.5 * sigma * n^(-1/3)`),
//! bounded by a configured maximum bin count.

use serde::{Deserialize, Serialize};

/// Sentinel returned by [`Histogram::get_bin`] for values outside the domain.
pub const LEFT_OF_HISTOGRAM: i64 = -1;
pub const RIGHT_OF_HISTOGRAM: i64 = -2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `bins.len() + 1` edges; `edges[i]..edges[i+1]` is the domain of `bins[i]`.
    edges: Vec<f64>,
    bins: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram {
            edges: Vec::new(),
            bins: Vec::new(),
        }
    }
}

impl Histogram {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_parts(edges: Vec<f64>, bins: Vec<u64>) -> Self {
        debug_assert_eq!(edges.len(), bins.len() + 1);
        Histogram { edges, bins }
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn counts(&self) -> &[u64] {
        &self.bins
    }

    pub fn total_count(&self) -> u64 {
        self.bins.iter().sum()
    }

    pub fn bin_edge_lower(&self, i: usize) -> f64 {
        self.edges[i]
    }

    pub fn bin_edge_upper(&self, i: usize) -> f64 {
        self.edges[i + 1]
    }

    pub fn bin_width(&self) -> f64 {
        if self.edges.len() < 2 {
            0.0
        } else {
            self.edges[1] - self.edges[0]
        }
    }

    pub fn print_bounds(&self) -> String {
        match (self.edges.first(), self.edges.last()) {
            (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
            _ => "[empty]".to_string(),
        }
    }

    /// Build a histogram from raw samples. `max_bins` bounds the bin count;
    /// the bin width is `3.5 * sigma * n^(-1/3)`, Scott's-rule-derived.
    pub fn generate(values: &[f64], max_bins: usize) -> Histogram {
        if values.is_empty() {
            return Histogram::empty();
        }
        let n = values.len() as f64;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        if (max - min).abs() < f64::EPSILON {
            // All samples identical: a single degenerate bin.
            let edges = vec![min - 0.5, max + 0.5];
            return Histogram {
                edges,
                bins: vec![values.len() as u64],
            };
        }

        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n.max(1.0);
        let sigma = variance.sqrt();

        let width = if sigma > 0.0 {
            3.5 * sigma * n.powf(-1.0 / 3.0)
        } else {
            (max - min) / max_bins.max(1) as f64
        };
        let width = if width <= 0.0 { (max - min) / max_bins.max(1) as f64 } else { width };

        let raw_nbins = ((max - min) / width).ceil() as usize;
        let nbins = raw_nbins.clamp(1, max_bins.max(1));
        let width = (max - min) / nbins as f64;

        let mut edges = Vec::with_capacity(nbins + 1);
        for i in 0..=nbins {
            edges.push(min + width * i as f64);
        }
        let mut bins = vec![0u64; nbins];
        for &v in values {
            let mut idx = ((v - min) / width) as usize;
            if idx >= nbins {
                idx = nbins - 1;
            }
            bins[idx] += 1;
        }

        Histogram { edges, bins }
    }

    /// Locate the bin containing `value`, allowing values within `tolerance`
    /// (a fraction of the bin width) of the outer edges to be clamped into the
    /// first/last bin instead of reported as out-of-domain.
    pub fn get_bin(&self, value: f64, tolerance: f64) -> i64 {
        if self.bins.is_empty() {
            return LEFT_OF_HISTOGRAM;
        }
        let width = self.bin_width();
        let lo = self.edges[0];
        let hi = *self.edges.last().unwrap();
        let slack = width * tolerance;

        if value < lo - slack {
            return LEFT_OF_HISTOGRAM;
        }
        if value > hi + slack {
            return RIGHT_OF_HISTOGRAM;
        }
        if value <= lo {
            return 0;
        }
        if value >= hi {
            return (self.bins.len() - 1) as i64;
        }
        let idx = ((value - lo) / width) as usize;
        idx.min(self.bins.len() - 1) as i64
    }

    /// Empirical CDF (left tail): the fraction of samples at or below
    /// `value`, evaluated at bin granularity with `tolerance` applied to the
    /// outer edges exactly as [`Histogram::get_bin`] does. Used by the COPOD
    /// outlier model.
    pub fn ecdf_left(&self, value: f64, tolerance: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let total = self.total_count() as f64;
        match self.get_bin(value, tolerance) {
            LEFT_OF_HISTOGRAM => 0.0,
            RIGHT_OF_HISTOGRAM => 1.0,
            bin => self.bins[..=(bin as usize)].iter().sum::<u64>() as f64 / total,
        }
    }

    /// The histogram of `-X` for a variable `X` distributed as `self`: edges
    /// negated and reversed, bins reversed to match. [`Histogram::ecdf_left`]
    /// on this gives the right-tail ECDF of the original domain.
    pub fn negate(&self) -> Histogram {
        if self.is_empty() {
            return Histogram::empty();
        }
        let edges: Vec<f64> = self.edges.iter().rev().map(|e| -e).collect();
        let bins: Vec<u64> = self.bins.iter().rev().copied().collect();
        Histogram { edges, bins }
    }

    /// Weighted mean and population skewness of the distribution the
    /// histogram approximates, treating each bin's count as concentrated at
    /// its midpoint. Used by the COPOD model to weight its left/right tail
    /// scores.
    pub fn skewness(&self) -> f64 {
        let total = self.total_count();
        if total == 0 {
            return 0.0;
        }
        let n = total as f64;
        let midpoints: Vec<f64> = (0..self.bins.len())
            .map(|i| (self.edges[i] + self.edges[i + 1]) / 2.0)
            .collect();
        let mean = midpoints
            .iter()
            .zip(&self.bins)
            .map(|(m, &c)| m * c as f64)
            .sum::<f64>()
            / n;
        let variance = midpoints
            .iter()
            .zip(&self.bins)
            .map(|(m, &c)| (m - mean).powi(2) * c as f64)
            .sum::<f64>()
            / n;
        if variance <= 0.0 {
            return 0.0;
        }
        let m3 = midpoints
            .iter()
            .zip(&self.bins)
            .map(|(m, &c)| (m - mean).powi(3) * c as f64)
            .sum::<f64>()
            / n;
        m3 / variance.powf(1.5)
    }

    /// Additive merge onto the union of both domains, rebinning each side's
    /// counts proportionally by overlap so that `total_count(merge(a,b)) ==
    /// total_count(a) + total_count(b)`.
    pub fn merge(&self, other: &Histogram) -> Histogram {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let lo = self.edges[0].min(other.edges[0]);
        let hi = self.edges.last().unwrap().max(*other.edges.last().unwrap());
        let nbins = self.bins.len().max(other.bins.len());
        let width = (hi - lo) / nbins as f64;

        let mut edges = Vec::with_capacity(nbins + 1);
        for i in 0..=nbins {
            edges.push(lo + width * i as f64);
        }
        let mut bins = vec![0u64; nbins];

        for (src_edges, src_bins) in [(&self.edges, &self.bins), (&other.edges, &other.bins)] {
            for (i, &count) in src_bins.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let (blo, bhi) = (src_edges[i], src_edges[i + 1]);
                distribute_into(&mut bins, lo, width, blo, bhi, count);
            }
        }

        Histogram { edges, bins }
    }
}

/// Spread `count` items uniformly over `[src_lo, src_hi)` into the destination
/// bins, used by [`Histogram::merge`] to rebin onto a union domain without
/// losing total count to rounding (remainder goes to the last touched bin).
fn distribute_into(dst: &mut [u64], dst_lo: f64, dst_width: f64, src_lo: f64, src_hi: f64, count: u64) {
    if dst_width <= 0.0 || dst.is_empty() {
        return;
    }
    let first = (((src_lo - dst_lo) / dst_width) as i64).clamp(0, dst.len() as i64 - 1) as usize;
    let last = ((((src_hi - dst_lo) / dst_width).ceil() as i64 - 1).clamp(0, dst.len() as i64 - 1)) as usize;
    let last = last.max(first);
    let span = (last - first + 1) as u64;
    let share = count / span;
    let remainder = count - share * span;
    for (k, slot) in dst[first..=last].iter_mut().enumerate() {
        *slot += share + if k as u64 == span - 1 { remainder } else { 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_total_count() {
        let a = Histogram::generate(&[1.0, 2.0, 3.0, 4.0, 5.0], 10);
        let b = Histogram::generate(&[10.0, 20.0, 30.0], 10);
        let merged = a.merge(&b);
        assert_eq!(merged.total_count(), a.total_count() + b.total_count());
    }

    #[test]
    fn merge_with_empty_is_identity_on_count() {
        let a = Histogram::generate(&[1.0, 2.0, 3.0], 10);
        let merged = a.merge(&Histogram::empty());
        assert_eq!(merged.total_count(), a.total_count());
    }

    #[test]
    fn get_bin_flags_out_of_domain_values() {
        let h = Histogram::generate(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 5);
        assert_eq!(h.get_bin(-1000.0, 0.0), LEFT_OF_HISTOGRAM);
        assert_eq!(h.get_bin(1000.0, 0.0), RIGHT_OF_HISTOGRAM);
        assert!(h.get_bin(4.0, 0.0) >= 0);
    }

    #[test]
    fn ecdf_left_is_monotonic_and_bounded() {
        let h = Histogram::generate(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 5);
        assert_eq!(h.ecdf_left(-1000.0, 0.0), 0.0);
        assert_eq!(h.ecdf_left(1000.0, 0.0), 1.0);
        assert!(h.ecdf_left(1.0, 0.0) <= h.ecdf_left(8.0, 0.0));
    }

    #[test]
    fn negate_reflects_ecdf() {
        let h = Histogram::generate(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 5);
        let neg = h.negate();
        // Right tail of h at x == left tail of -h at -x.
        assert!((h.ecdf_left(9.0, 0.0) - neg.ecdf_left(-9.0, 0.0)).abs() < 1e-9);
    }

    #[test]
    fn symmetric_distribution_has_near_zero_skewness() {
        let h = Histogram::generate(&[-2.0, -1.0, 0.0, 1.0, 2.0], 5);
        assert!(h.skewness().abs() < 0.5);
    }
}
