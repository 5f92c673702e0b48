//! Old-bin → new-bin remap filters.

use crate::containers::PackedVec;

/// Per-feature table mapping every old bin to its new bin after a
/// quantizer update.
///
/// A filter is applied to stored data exactly once; applying the
/// identity filter is a byte-for-byte no-op, and only a filter's inverse
/// (where one exists) restores the previous encoding.
pub struct RemapFilter {
    k: u8,
    tables: Vec<PackedVec>,
}

impl RemapFilter {
    /// The identity filter for `num_features` features at `k` bits.
    pub fn identity(num_features: u16, k: u8) -> Self {
        let bins = 1usize << k;
        let tables = (0..num_features)
            .map(|_| {
                let mut table = PackedVec::new(k.max(1));
                table
                    .resize(bins, 0)
                    .expect("filter tables are a few bytes");
                for bin in 0..bins {
                    table.set(bin, bin as u64);
                }
                table
            })
            .collect();
        RemapFilter { k, tables }
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn num_features(&self) -> u16 {
        self.tables.len() as u16
    }

    pub fn bins(&self) -> usize {
        1 << self.k
    }

    /// Redirects `old_bin` of `feature` to `new_bin`.
    pub fn set(&mut self, feature: u16, old_bin: u16, new_bin: u16) {
        self.tables[feature as usize].set(old_bin as usize, new_bin as u64);
    }

    /// The new bin for an old bin; out-of-range bins map to themselves
    /// clamped into range.
    pub fn map(&self, feature: u16, old_bin: u16) -> u16 {
        self.tables[feature as usize].get(old_bin as usize) as u16
    }

    /// Whether every feature maps every bin to itself.
    pub fn is_identity(&self) -> bool {
        self.tables
            .iter()
            .all(|table| table.iter().enumerate().all(|(bin, to)| bin as u64 == to))
    }

    /// The filter equivalent to applying `self` then `next`.
    pub fn compose(&self, next: &RemapFilter) -> RemapFilter {
        debug_assert_eq!(self.k, next.k);
        debug_assert_eq!(self.num_features(), next.num_features());
        let mut out = RemapFilter::identity(self.num_features(), self.k);
        for feature in 0..self.num_features() {
            for bin in 0..self.bins() as u16 {
                out.set(feature, bin, next.map(feature, self.map(feature, bin)));
            }
        }
        out
    }

    /// The inverse mapping, if this filter is a bijection on bins.
    pub fn inverse(&self) -> Option<RemapFilter> {
        let mut out = RemapFilter::identity(self.num_features(), self.k);
        for feature in 0..self.num_features() {
            let mut seen = vec![false; self.bins()];
            for bin in 0..self.bins() as u16 {
                let to = self.map(feature, bin);
                if seen[to as usize] {
                    return None;
                }
                seen[to as usize] = true;
                out.set(feature, to, bin);
            }
        }
        Some(out)
    }
}

impl std::fmt::Debug for RemapFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemapFilter")
            .field("k", &self.k)
            .field("features", &self.num_features())
            .field("identity", &self.is_identity())
            .finish()
    }
}
