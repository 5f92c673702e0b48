//! Dense multiset over small integer ids.

use crate::{
    allocator::{default_pool, AllocError, PoolHandle, RegionPolicy},
    size::Size,
};

use super::PackedVec;

/// A multiset keyed by ids in `[0, max_id]`, stored as a packed array of
/// saturating per-id counters.
///
/// Counter width is the element width of the backing [`PackedVec`]; a
/// counter stuck at its maximum absorbs further pushes without counting
/// them, so `erase` never underflows an id that saturated.
pub struct IdVec {
    counts: PackedVec,
    live: usize,
}

impl IdVec {
    /// A multiset for ids `0..=max_id` with `bits`-wide counters.
    pub fn new(max_id: u64, bits: u8) -> Result<Self, AllocError> {
        Self::new_in(max_id, bits, default_pool(), RegionPolicy::Any)
    }

    pub fn new_in(
        max_id: u64,
        bits: u8,
        pool: PoolHandle,
        policy: RegionPolicy,
    ) -> Result<Self, AllocError> {
        let mut counts = PackedVec::new_in(bits, pool, policy);
        counts.resize(max_id as usize + 1, 0)?;
        Ok(IdVec { counts, live: 0 })
    }

    pub fn max_id(&self) -> u64 {
        self.counts.len() as u64 - 1
    }

    pub fn counter_bits(&self) -> u8 {
        self.counts.bits()
    }

    /// Number of non-saturated occurrences across all ids.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn count(&self, id: u64) -> u64 {
        self.counts.get(id as usize)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.count(id) > 0
    }

    /// Adds one occurrence of `id`. Counting stops at the counter
    /// maximum; out-of-range ids are ignored.
    pub fn push(&mut self, id: u64) {
        let index = id as usize;
        match self.counts.try_get(index) {
            Some(count) if count < self.counts.mask() => {
                self.counts.set(index, count + 1);
                self.live += 1;
            }
            _ => {}
        }
    }

    /// Removes one occurrence of `id` if present.
    pub fn erase(&mut self, id: u64) -> bool {
        let index = id as usize;
        match self.counts.try_get(index) {
            Some(count) if count > 0 => {
                self.counts.set(index, count - 1);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Reallocates for a new id range, preserving counts that still fit.
    pub fn set_max_id(&mut self, max_id: u64) -> Result<(), AllocError> {
        self.counts.resize(max_id as usize + 1, 0)?;
        self.counts.fit()?;
        self.live = self.counts.iter().map(|c| c as usize).sum();
        Ok(())
    }

    /// Reallocates with a new counter width, clamping existing counts.
    pub fn set_bits(&mut self, bits: u8) -> Result<(), AllocError> {
        let mut next = PackedVec::new_in(bits, self.counts.pool(), self.counts.policy());
        next.resize(self.counts.len(), 0)?;
        for (id, count) in self.counts.iter().enumerate() {
            next.set(id, count.min(next.mask()));
        }
        self.counts = next;
        self.live = self.counts.iter().map(|c| c as usize).sum();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.counts.fill(0);
        self.live = 0;
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.counts.memory_usage()
    }

    /// Yields each present id once, in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id as u64)
    }
}

impl Size for IdVec {
    fn size(&self) -> usize {
        self.memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_count_erase() {
        let mut set = IdVec::new(15, 4).unwrap();
        set.push(3);
        set.push(3);
        set.push(9);
        assert_eq!(set.count(3), 2);
        assert_eq!(set.len(), 3);
        assert!(set.contains(9));
        assert!(set.erase(3));
        assert_eq!(set.count(3), 1);
        assert!(!set.erase(12));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn counters_saturate() {
        let mut set = IdVec::new(3, 2).unwrap();
        for _ in 0..10 {
            set.push(1);
        }
        assert_eq!(set.count(1), 3);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn iteration_is_id_ordered_and_unique() {
        let mut set = IdVec::new(31, 3).unwrap();
        for id in [9, 2, 2, 30, 17, 9] {
            set.push(id);
        }
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2, 9, 17, 30]);
    }

    #[test]
    fn rebits_clamps_counts() {
        let mut set = IdVec::new(3, 8).unwrap();
        for _ in 0..9 {
            set.push(0);
        }
        set.set_bits(2).unwrap();
        assert_eq!(set.count(0), 3);
        set.set_max_id(1).unwrap();
        assert_eq!(set.max_id(), 1);
    }
}
