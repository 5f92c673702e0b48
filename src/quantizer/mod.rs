//! Float → small-integer feature quantization.
//!
//! Each feature carries one of three rules: a full-range linear map, a
//! custom edge set, or a discrete category set. Encoding produces a
//! signed *bin signal* per feature; values outside the observed range
//! keep encoding (clamped into the valid bin range) but raise a drift
//! flag the caller can feed back into [`Quantizer::expand_bins`].
//!
//! Scaled positions are fixed-point: a feature's range maps onto
//! `[0, 65535]` and edge positions are stored as `u16` fractions of it.
//! The serialized `scale` field is the Q16.16 count of scaled units per
//! input unit, so integer-only device code can recover positions without
//! float math.

use thiserror::Error;

use crate::{
    containers::{PackedVec, SboVec},
    dataset::{DatasetError, LabelRegistry, QuantizedDataset},
};

mod format;
mod remap;

pub use format::Z_TAU_DEFAULT;
pub use remap::RemapFilter;

/// Top of the fixed-point scaled range.
const SCALED_TOP: f64 = 65535.0;

/// Tolerance for discrete category matching.
const DISCRETE_EPSILON: f32 = 1e-6;

/// Minimum stddev before the z-score clamp engages.
const SIGMA_EPSILON: f32 = 1e-9;

/// How an old bin picks its new bin when ranges change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// The new bin with the greatest absolute overlap wins, even below
    /// half the old bin's width. Ties break to the lowest index.
    #[default]
    BestOverlap,
    /// The new bin containing the old bin's centre wins.
    Majority,
}

#[derive(Debug, Error)]
pub enum QuantizerError {
    #[error("quantization coefficient must be in 1..=8, got {0}")]
    InvalidCoefficient(u8),
    #[error("expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("feature {0}: edge positions must be strictly increasing inside the range")]
    InvalidEdges(u16),
    #[error("feature {feature}: {count} edges exceed the {max} bins of k={k}")]
    TooManyEdges {
        feature: u16,
        count: usize,
        max: usize,
        k: u8,
    },
    #[error("feature {feature}: {count} categories exceed the {max} of k={k}")]
    TooManyCategories {
        feature: u16,
        count: usize,
        max: usize,
        k: u8,
    },
    #[error("feature {0}: empty range")]
    EmptyRange(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("not a quantizer blob (bad magic)")]
    BadMagic,
    #[error("quantizer blob is corrupt: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Alloc(#[from] crate::allocator::AllocError),
}

/// Per-feature quantization rule.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureRule {
    /// Linear map of `[fmin, fmax]` onto all `2^k` bins.
    FullLinear,
    /// Explicit bin boundaries as scaled `u16` positions; the bin of a
    /// value is the index of the first greater edge, the last bin
    /// otherwise. The final edge marks the top of the range.
    CustomEdges(SboVec<u16, 16>),
    /// Unordered category set matched within [`DISCRETE_EPSILON`].
    Discrete(SboVec<f32, 8>),
}

impl FeatureRule {
    fn type_tag(&self) -> u8 {
        match self {
            FeatureRule::FullLinear => 0,
            FeatureRule::CustomEdges(_) => 1,
            FeatureRule::Discrete(_) => 2,
        }
    }
}

/// Rule plus the range state carried alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureState {
    pub rule: FeatureRule,
    pub fmin: f32,
    pub fmax: f32,
    /// Q16.16 scaled position of `fmin`.
    pub baseline: i64,
    /// Q16.16 scaled units per input unit.
    pub scale: u64,
    /// Training-time mean and stddev, present when outlier clamping is
    /// enabled.
    pub moments: Option<(f32, f32)>,
}

impl FeatureState {
    fn derive_fixed_point(fmin: f32, fmax: f32) -> (i64, u64) {
        let span = (fmax - fmin) as f64;
        let scale = (SCALED_TOP / span * 65536.0).round() as u64;
        let baseline = (fmin as f64 * scale as f64 / 65536.0).round() as i64;
        (baseline, scale)
    }

    /// Scaled position of `x` inside the feature's range, rounded the
    /// same way edge positions are so boundary values land in the upper
    /// bin.
    fn scaled(&self, x: f32) -> f64 {
        ((x - self.fmin) as f64 / (self.fmax - self.fmin) as f64 * SCALED_TOP).round()
    }

    fn rescale(&mut self, fmin: f32, fmax: f32) {
        self.fmin = fmin;
        self.fmax = fmax;
        let (baseline, scale) = Self::derive_fixed_point(fmin, fmax);
        self.baseline = baseline;
        self.scale = scale;
    }

    /// Number of bins this rule can emit for the dataset coefficient.
    fn bins(&self, k: u8) -> usize {
        match &self.rule {
            FeatureRule::FullLinear => 1 << k,
            FeatureRule::CustomEdges(edges) => edges.len(),
            FeatureRule::Discrete(categories) => categories.len(),
        }
    }
}

/// Result of one encode call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftReport {
    pub drifted: bool,
    /// First feature whose value fell outside its range.
    pub feature: Option<u16>,
    /// The offending raw value.
    pub value: f32,
}

impl DriftReport {
    fn clean() -> Self {
        DriftReport {
            drifted: false,
            feature: None,
            value: 0.0,
        }
    }
}

/// The per-dataset quantizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantizer {
    k: u8,
    features: Vec<FeatureState>,
    labels: LabelRegistry,
    /// z-score clamp threshold; `None` disables outlier handling.
    z_tau: Option<f32>,
}

impl Quantizer {
    pub fn new(k: u8) -> Result<Self, QuantizerError> {
        if !(1..=8).contains(&k) {
            return Err(QuantizerError::InvalidCoefficient(k));
        }
        Ok(Quantizer {
            k,
            features: Vec::new(),
            labels: LabelRegistry::new(),
            z_tau: None,
        })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    /// `2^k`, the number of representable bins per feature.
    pub fn groups(&self) -> u16 {
        1 << self.k
    }

    pub fn num_features(&self) -> u16 {
        self.features.len() as u16
    }

    pub fn labels(&self) -> &LabelRegistry {
        &self.labels
    }

    pub fn labels_mut(&mut self) -> &mut LabelRegistry {
        &mut self.labels
    }

    pub fn feature(&self, index: u16) -> Option<&FeatureState> {
        self.features.get(index as usize)
    }

    /// Enables z-score outlier clamping at `z_tau` standard deviations.
    pub fn set_outlier_clamp(&mut self, z_tau: f32) {
        self.z_tau = Some(z_tau);
    }

    pub fn outlier_clamp(&self) -> Option<f32> {
        self.z_tau
    }

    pub fn set_moments(&mut self, feature: u16, mean: f32, stddev: f32) {
        if let Some(state) = self.features.get_mut(feature as usize) {
            state.moments = Some((mean, stddev));
        }
    }

    /// Adds a full-range linear feature.
    pub fn add_full_linear(&mut self, fmin: f32, fmax: f32) -> Result<u16, QuantizerError> {
        let index = self.num_features();
        if fmax <= fmin {
            return Err(QuantizerError::EmptyRange(index));
        }
        let (baseline, scale) = FeatureState::derive_fixed_point(fmin, fmax);
        self.features.push(FeatureState {
            rule: FeatureRule::FullLinear,
            fmin,
            fmax,
            baseline,
            scale,
            moments: None,
        });
        Ok(index)
    }

    /// Adds a custom-edge feature from absolute edge positions.
    ///
    /// `edges` must be strictly increasing and lie in `(fmin, fmax]`;
    /// the final edge is the top boundary of the range. At most `2^k`
    /// edges (bins).
    pub fn add_custom_edges(
        &mut self,
        fmin: f32,
        fmax: f32,
        edges: &[f32],
    ) -> Result<u16, QuantizerError> {
        let index = self.num_features();
        if fmax <= fmin {
            return Err(QuantizerError::EmptyRange(index));
        }
        let max = 1usize << self.k;
        if edges.is_empty() || edges.len() > max {
            return Err(QuantizerError::TooManyEdges {
                feature: index,
                count: edges.len(),
                max,
                k: self.k,
            });
        }
        let span = (fmax - fmin) as f64;
        let mut scaled: SboVec<u16, 16> = SboVec::new();
        let mut previous: i64 = -1;
        for &edge in edges {
            if edge <= fmin || edge > fmax {
                return Err(QuantizerError::InvalidEdges(index));
            }
            let position = ((edge - fmin) as f64 / span * SCALED_TOP).round() as i64;
            if position <= previous {
                return Err(QuantizerError::InvalidEdges(index));
            }
            previous = position;
            scaled.push(position as u16);
        }
        let (baseline, scale) = FeatureState::derive_fixed_point(fmin, fmax);
        self.features.push(FeatureState {
            rule: FeatureRule::CustomEdges(scaled),
            fmin,
            fmax,
            baseline,
            scale,
            moments: None,
        });
        Ok(index)
    }

    /// Adds a discrete-category feature.
    pub fn add_discrete(&mut self, categories: &[f32]) -> Result<u16, QuantizerError> {
        let index = self.num_features();
        let max = 1usize << self.k;
        if categories.is_empty() || categories.len() > max {
            return Err(QuantizerError::TooManyCategories {
                feature: index,
                count: categories.len(),
                max,
                k: self.k,
            });
        }
        let fmin = categories.iter().copied().fold(f32::INFINITY, f32::min);
        let fmax = categories.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let (baseline, scale) = if fmax > fmin {
            FeatureState::derive_fixed_point(fmin, fmax)
        } else {
            (0, 0)
        };
        self.features.push(FeatureState {
            rule: FeatureRule::Discrete(categories.iter().copied().collect()),
            fmin,
            fmax,
            baseline,
            scale,
            moments: None,
        });
        Ok(index)
    }

    /// Raw signed bin signal of one feature. Values `< 0` or beyond the
    /// feature's bin count indicate under/overflow drift.
    fn signal(&self, state: &FeatureState, mut x: f32) -> i64 {
        if let (Some(z_tau), Some((mean, stddev))) = (self.z_tau, state.moments) {
            if stddev > SIGMA_EPSILON {
                x = x.clamp(mean - z_tau * stddev, mean + z_tau * stddev);
            }
        }
        match &state.rule {
            FeatureRule::FullLinear => {
                let bins = 1i64 << self.k;
                let width = (state.fmax - state.fmin) as f64 / bins as f64;
                let mut signal = ((x - state.fmin) as f64 / width).floor() as i64;
                // The top of the range belongs to the last bin.
                if signal == bins && x <= state.fmax {
                    signal = bins - 1;
                }
                signal
            }
            FeatureRule::CustomEdges(edges) => {
                let bins = edges.len() as i64;
                if x < state.fmin || x > state.fmax {
                    // Drift proportional to how many virtual bins the
                    // value lies beyond the range.
                    let width = (state.fmax - state.fmin) as f64 / bins as f64;
                    if x < state.fmin {
                        return ((x - state.fmin) as f64 / width).floor() as i64;
                    }
                    return (bins - 1) + ((x - state.fmax) as f64 / width).ceil() as i64;
                }
                let position = state.scaled(x);
                for (bin, &edge) in edges.iter().enumerate() {
                    if edge as f64 > position {
                        return bin as i64;
                    }
                }
                bins - 1
            }
            FeatureRule::Discrete(categories) => {
                for (bin, &category) in categories.iter().enumerate() {
                    if (x - category).abs() <= DISCRETE_EPSILON {
                        return bin as i64;
                    }
                }
                // Reserved out-of-range code.
                1 << self.k
            }
        }
    }

    /// Quantizes a feature vector into a `k`-bit packed row.
    ///
    /// Every stored value is clamped into the feature's bin range; the
    /// report carries the first drifting feature and its raw value.
    pub fn encode(&self, x: &[f32]) -> Result<(PackedVec, DriftReport), QuantizerError> {
        if x.len() != self.features.len() {
            return Err(QuantizerError::DimensionMismatch {
                expected: self.features.len(),
                got: x.len(),
            });
        }
        let mut row = PackedVec::new(self.k);
        row.reserve(x.len())?;
        let mut report = DriftReport::clean();
        for (index, (&value, state)) in x.iter().zip(&self.features).enumerate() {
            let signal = self.signal(state, value);
            let top = state.bins(self.k).max(1) as i64 - 1;
            if (signal < 0 || signal > top) && !report.drifted {
                report.drifted = true;
                report.feature = Some(index as u16);
                report.value = value;
            }
            row.push(signal.clamp(0, top) as u64)?;
        }
        Ok((row, report))
    }

    /// Widens feature ranges to absorb observed drift values and builds
    /// the remap filter old data must be passed through.
    ///
    /// Custom-edge features keep their edges' fractional positions
    /// inside the widened range; every old bin is reassigned per
    /// `policy`. Other rules widen their range and map identically.
    pub fn expand_bins(
        &mut self,
        drifts: &[(u16, f32)],
        policy: OverlapPolicy,
    ) -> Result<RemapFilter, QuantizerError> {
        let mut filter = RemapFilter::identity(self.num_features(), self.k);
        for feature in 0..self.features.len() as u16 {
            let observed: Vec<f32> = drifts
                .iter()
                .filter(|(f, _)| *f == feature)
                .map(|(_, v)| *v)
                .collect();
            if observed.is_empty() {
                continue;
            }
            let state = &mut self.features[feature as usize];
            let new_fmin = observed.iter().copied().fold(state.fmin, f32::min);
            let new_fmax = observed.iter().copied().fold(state.fmax, f32::max);
            if new_fmin == state.fmin && new_fmax == state.fmax {
                continue;
            }
            log::debug!(
                "feature {feature}: range [{}, {}] -> [{new_fmin}, {new_fmax}]",
                state.fmin,
                state.fmax
            );
            if let FeatureRule::CustomEdges(edges) = &state.rule {
                let old_bounds = absolute_bin_bounds(edges, state.fmin, state.fmax);
                // Fractional edge positions carry over into the new
                // range, so the u16 edge values stay put and only the
                // scale moves.
                let kept_edges = edges.clone();
                state.rescale(new_fmin, new_fmax);
                let new_bounds = absolute_bin_bounds(&kept_edges, new_fmin, new_fmax);
                for (old_bin, old_iv) in old_bounds.iter().enumerate() {
                    let new_bin = match policy {
                        OverlapPolicy::BestOverlap => best_overlap_bin(old_iv, &new_bounds),
                        OverlapPolicy::Majority => {
                            let centre = (old_iv.0 + old_iv.1) / 2.0;
                            containing_bin(centre, &new_bounds)
                        }
                    };
                    filter.set(feature, old_bin as u16, new_bin as u16);
                }
            } else {
                state.rescale(new_fmin, new_fmax);
            }
        }
        Ok(filter)
    }

    /// Shrinks custom-edge features whose extreme bins fell empty after
    /// FIFO trimming.
    ///
    /// Scans bin occupancy over the loaded dataset; up to two empty bins
    /// at each end collapse, provided at least one bin survives. Returns
    /// the shift-and-clamp filter to apply to the dataset, or `None`
    /// when nothing shrank.
    pub fn shrink_bins(
        &mut self,
        dataset: &QuantizedDataset,
    ) -> Result<Option<RemapFilter>, QuantizerError> {
        let mut filter = RemapFilter::identity(self.num_features(), self.k);
        let mut changed = false;
        for feature in 0..self.features.len() as u16 {
            let state = &self.features[feature as usize];
            let edges = match &state.rule {
                FeatureRule::CustomEdges(edges) => edges.clone(),
                _ => continue,
            };
            let bins = edges.len();
            let mut occupancy = vec![0usize; bins];
            for sample in 0..dataset.len() {
                let bin = dataset.get_feature(sample, feature) as usize;
                if bin < bins {
                    occupancy[bin] += 1;
                }
            }
            let low = occupancy
                .iter()
                .take_while(|&&count| count == 0)
                .count()
                .min(2);
            let high = occupancy
                .iter()
                .rev()
                .take_while(|&&count| count == 0)
                .count()
                .min(2);
            if low == 0 && high == 0 {
                continue;
            }
            if low + high >= bins {
                // Nothing left to keep; leave the feature alone.
                continue;
            }
            let bounds = absolute_bin_bounds(&edges, state.fmin, state.fmax);
            let new_fmin = bounds[low].0;
            let new_fmax = bounds[bins - high - 1].1;
            let kept = bins - low - high;
            let surviving: Vec<f32> = (low..bins - high).map(|bin| bounds[bin].1).collect();
            let span = (new_fmax - new_fmin) as f64;
            let mut scaled: SboVec<u16, 16> = SboVec::new();
            for &edge in &surviving {
                let position = (((edge - new_fmin) as f64 / span) * SCALED_TOP).round();
                scaled.push(position.clamp(0.0, SCALED_TOP) as u16);
            }
            let state = &mut self.features[feature as usize];
            state.rule = FeatureRule::CustomEdges(scaled);
            state.rescale(new_fmin, new_fmax);
            for old_bin in 0..bins {
                let shifted = (old_bin as i64 - low as i64).clamp(0, kept as i64 - 1);
                filter.set(feature, old_bin as u16, shifted as u16);
            }
            changed = true;
            log::debug!("feature {feature}: collapsed {low} low / {high} high bins");
        }
        Ok(if changed { Some(filter) } else { None })
    }
}

/// Absolute `[start, end)` interval of every bin defined by an edge set.
fn absolute_bin_bounds(edges: &SboVec<u16, 16>, fmin: f32, fmax: f32) -> Vec<(f32, f32)> {
    let span = fmax - fmin;
    let mut bounds = Vec::with_capacity(edges.len());
    let mut start = fmin;
    for &edge in edges.iter() {
        let end = fmin + (edge as f32 / SCALED_TOP as f32) * span;
        bounds.push((start, end));
        start = end;
    }
    // The final edge is the top boundary; its bin runs to fmax.
    if let Some(last) = bounds.last_mut() {
        last.1 = fmax;
    }
    bounds
}

fn best_overlap_bin(old: &(f32, f32), new_bounds: &[(f32, f32)]) -> usize {
    let mut best = 0usize;
    let mut best_overlap = f32::NEG_INFINITY;
    for (bin, new) in new_bounds.iter().enumerate() {
        let overlap = (old.1.min(new.1) - old.0.max(new.0)).max(0.0);
        if overlap > best_overlap {
            best_overlap = overlap;
            best = bin;
        }
    }
    best
}

fn containing_bin(value: f32, bounds: &[(f32, f32)]) -> usize {
    for (bin, interval) in bounds.iter().enumerate() {
        if value < interval.1 {
            return bin;
        }
    }
    bounds.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_quantizer() -> Quantizer {
        let mut q = Quantizer::new(2).unwrap();
        q.add_custom_edges(0.0, 10.0, &[2.5, 5.0, 7.5, 10.0]).unwrap();
        q
    }

    #[test]
    fn rejects_bad_coefficients() {
        assert!(matches!(
            Quantizer::new(0),
            Err(QuantizerError::InvalidCoefficient(0))
        ));
        assert!(matches!(
            Quantizer::new(9),
            Err(QuantizerError::InvalidCoefficient(9))
        ));
    }

    #[test]
    fn full_linear_truncates_and_flags_drift() {
        let mut q = Quantizer::new(3).unwrap();
        q.add_full_linear(0.0, 8.0).unwrap();
        let (row, report) = q.encode(&[3.7]).unwrap();
        assert_eq!(row.get(0), 3);
        assert!(!report.drifted);

        let (row, report) = q.encode(&[11.0]).unwrap();
        assert_eq!(row.get(0), 7);
        assert!(report.drifted);
        assert_eq!(report.feature, Some(0));
        assert_eq!(report.value, 11.0);

        let (row, report) = q.encode(&[-0.5]).unwrap();
        assert_eq!(row.get(0), 0);
        assert!(report.drifted);
    }

    #[test]
    fn custom_edges_first_greater_edge_wins() {
        let q = custom_quantizer();
        let cases = [(1.0, 0), (2.5, 1), (4.9, 1), (5.0, 2), (9.0, 3), (10.0, 3)];
        for (value, bin) in cases {
            let (row, report) = q.encode(&[value]).unwrap();
            assert_eq!(row.get(0), bin, "value {value}");
            assert!(!report.drifted, "value {value}");
        }
    }

    #[test]
    fn overflow_clamps_to_last_bin_with_drift() {
        let q = custom_quantizer();
        let (row, report) = q.encode(&[12.5]).unwrap();
        assert_eq!(row.get(0), 3);
        assert!(report.drifted);
        assert_eq!(report.feature, Some(0));
        assert_eq!(report.value, 12.5);
    }

    #[test]
    fn encode_never_exceeds_group_count() {
        let mut q = Quantizer::new(2).unwrap();
        q.add_full_linear(-5.0, 5.0).unwrap();
        q.add_custom_edges(0.0, 1.0, &[0.25, 0.5, 1.0]).unwrap();
        q.add_discrete(&[1.0, 2.0, 4.0]).unwrap();
        for value in [-100.0f32, -5.0, -0.1, 0.0, 0.3, 0.99, 3.0, 77.0] {
            let (row, _) = q.encode(&[value, value, value]).unwrap();
            for i in 0..3 {
                assert!(row.get(i) < 4, "value {value} feature {i}");
            }
        }
    }

    #[test]
    fn discrete_matches_within_tolerance() {
        let mut q = Quantizer::new(2).unwrap();
        q.add_discrete(&[1.0, 2.0, 4.0]).unwrap();
        let (row, report) = q.encode(&[2.0000005]).unwrap();
        assert_eq!(row.get(0), 1);
        assert!(!report.drifted);
        let (row, report) = q.encode(&[3.0]).unwrap();
        assert!(report.drifted);
        assert_eq!(row.get(0), 2, "clamped to last category");
    }

    #[test]
    fn z_clamp_pulls_outliers_into_range() {
        let mut q = Quantizer::new(2).unwrap();
        q.add_full_linear(0.0, 4.0).unwrap();
        q.set_outlier_clamp(2.0);
        q.set_moments(0, 2.0, 0.5);
        // Without the clamp 9.0 would overflow; with mean 2, sigma 0.5
        // and z 2 it clamps to 3.0 -> bin 3.
        let (row, report) = q.encode(&[9.0]).unwrap();
        assert_eq!(row.get(0), 3);
        assert!(!report.drifted);
    }

    #[test]
    fn expand_widens_range_and_remaps_by_overlap() {
        let mut q = custom_quantizer();
        let filter = q
            .expand_bins(&[(0, 12.5)], OverlapPolicy::BestOverlap)
            .unwrap();
        let state = q.feature(0).unwrap();
        assert_eq!(state.fmax, 12.5);
        assert_eq!(state.fmin, 0.0);
        // Bins stretched from width 2.5 to 3.125: old bin 0 [0,2.5)
        // stays in new bin 0 [0,3.125); old bin 3 [7.5,10] leans into
        // new bin 2 [6.25,9.375).
        assert_eq!(filter.map(0, 0), 0);
        assert_eq!(filter.map(0, 1), 1);
        assert_eq!(filter.map(0, 2), 1);
        assert_eq!(filter.map(0, 3), 2);
        // A later encode of the old maximum lands inside the new range.
        let (_, report) = q.encode(&[12.0]).unwrap();
        assert!(!report.drifted);
    }

    #[test]
    fn fifo_shrink_collapses_empty_extremes() {
        let mut q = custom_quantizer();
        // Resident data occupies only the top two bins.
        let mut ds = QuantizedDataset::new(1, 2);
        for bin in [2u16, 3, 2, 3, 3] {
            ds.push_row(&[bin], 0).unwrap();
        }
        let filter = q.shrink_bins(&ds).unwrap().expect("two bins collapse");
        assert_eq!(filter.map(0, 0), 0);
        assert_eq!(filter.map(0, 1), 0);
        assert_eq!(filter.map(0, 2), 0);
        assert_eq!(filter.map(0, 3), 1);
        let state = q.feature(0).unwrap();
        assert!((state.fmin - 5.0).abs() < 1e-2, "fmin {}", state.fmin);
        assert_eq!(state.fmax, 10.0);
        ds.apply_remap_filter(&filter).unwrap();
        assert_eq!(ds.get_feature(0, 0), 0);
        assert_eq!(ds.get_feature(1, 0), 1);
        // New encodes land in the shrunk bins.
        let (row, report) = q.encode(&[6.0]).unwrap();
        assert_eq!(row.get(0), 0);
        assert!(!report.drifted);
        // A second scan finds nothing left to shrink.
        assert!(q.shrink_bins(&ds).unwrap().is_none());
    }

    #[test]
    fn expand_without_new_extremes_is_identity() {
        let mut q = custom_quantizer();
        let filter = q
            .expand_bins(&[(0, 5.0)], OverlapPolicy::BestOverlap)
            .unwrap();
        assert!(filter.is_identity());
    }
}
