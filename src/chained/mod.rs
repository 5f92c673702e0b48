//! Chained hash containers sharding entries across open-addressed
//! sub-tables.
//!
//! Keys are routed by *key range*: the fixed-seed hash is folded into
//! `[0, cset_ability)` and a small range→shard index records which shard
//! owns each range. A shard owns exactly one range, so erasing a range
//! empties a whole shard, which is then demoted to `Deleted` — allocated
//! but empty — and reused by the next range that needs a home without a
//! fresh allocation.

use std::mem;

use crate::{
    allocator::{default_pool, PoolHandle, RegionPolicy},
    checksum::StableHash,
    containers::{ContainerError, OAIter, OAMap, PackedVec, SlotState},
    size::Size,
};

/// Maximum number of shard slots a chained container may own; shard
/// indices stay one byte wide.
pub const MAX_CAP: usize = 255;

const GROW_STEP: usize = 4;
const INITIAL_CAP: usize = 4;

/// Map sharded across up to [`MAX_CAP`] inner open-addressed tables.
pub struct ChainedMap<K, V> {
    shards: Vec<Option<OAMap<K, V>>>,
    /// 2-bit state per shard slot: Empty / Used / Deleted.
    shard_flags: PackedVec,
    /// key-range → shard slot.
    range_map: OAMap<u8, u8>,
    fullness: u8,
    len: usize,
    version: u64,
    pool: PoolHandle,
    policy: RegionPolicy,
}

impl<K: StableHash, V> ChainedMap<K, V> {
    pub fn new() -> Self {
        Self::new_in(default_pool(), RegionPolicy::Any)
    }

    pub fn new_in(pool: PoolHandle, policy: RegionPolicy) -> Self {
        let mut shard_flags = PackedVec::new_in(2, pool.clone(), policy);
        // The flag array spans all possible slots up front; 2 bits per
        // slot keeps it at 64 bytes and saves growth churn.
        shard_flags
            .resize(MAX_CAP, SlotState::Empty as u64)
            .expect("flag array below any sane pool budget");
        ChainedMap {
            shards: (0..INITIAL_CAP).map(|_| None).collect(),
            shard_flags,
            range_map: OAMap::new_in(pool.clone(), policy),
            fullness: 92,
            len: 0,
            version: 0,
            pool,
            policy,
        }
    }

    /// Number of distinct key ranges at the current fullness.
    pub fn cset_ability(&self) -> u8 {
        (255u32 * self.fullness as u32 / 100) as u8
    }

    /// Folds a key into its `(range, hash)` pair.
    pub fn key_range(&self, key: &K) -> (u8, u64) {
        let hash = key.stable_hash();
        ((hash % self.cset_ability() as u64) as u8, hash)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of shards currently in state `Used`.
    pub fn chain_size(&self) -> usize {
        (0..self.shards.len())
            .filter(|&slot| self.slot_state(slot) == SlotState::Used)
            .count()
    }

    pub fn shard_slots(&self) -> usize {
        self.shards.len()
    }

    pub fn fullness(&self) -> u8 {
        self.fullness
    }

    pub fn memory_usage(&self) -> usize {
        mem::size_of::<Self>()
            + self.shard_flags.memory_usage()
            + self.range_map.memory_usage()
            + self.shards.len() * mem::size_of::<Option<OAMap<K, V>>>()
            + self
                .shards
                .iter()
                .flatten()
                .map(|shard| shard.memory_usage())
                .sum::<usize>()
    }

    fn slot_state(&self, slot: usize) -> SlotState {
        match self.shard_flags.get(slot) {
            1 => SlotState::Used,
            2 => SlotState::Deleted,
            _ => SlotState::Empty,
        }
    }

    fn set_slot_state(&mut self, slot: usize, state: SlotState) {
        self.shard_flags.set(slot, state as u64);
    }

    fn shard_for(&self, range: u8) -> Option<usize> {
        self.range_map.get(&range).map(|&slot| slot as usize)
    }

    /// Picks the slot a new range should occupy: a `Deleted` shard first
    /// (reuse without allocation), then an allocated-but-empty one, then
    /// the first bare slot.
    fn claim_slot(&mut self) -> Result<usize, ContainerError> {
        loop {
            let mut bare = None;
            for slot in 0..self.shards.len() {
                match self.slot_state(slot) {
                    SlotState::Deleted => return Ok(slot),
                    SlotState::Empty => {
                        if self.shards[slot].is_some() {
                            return Ok(slot);
                        }
                        if bare.is_none() {
                            bare = Some(slot);
                        }
                    }
                    SlotState::Used => {}
                }
            }
            if let Some(slot) = bare {
                return Ok(slot);
            }
            if self.shards.len() >= MAX_CAP {
                return Err(ContainerError::CapacityExceeded(MAX_CAP));
            }
            let grown = (self.shards.len() + GROW_STEP).min(MAX_CAP);
            self.shards.resize_with(grown, || None);
            self.version += 1;
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, ContainerError> {
        let (range, _) = self.key_range(&key);
        let slot = match self.shard_for(range) {
            Some(slot) => slot,
            None => {
                let slot = self.claim_slot()?;
                if self.shards[slot].is_none() {
                    self.shards[slot] =
                        Some(OAMap::new_in(self.pool.clone(), self.policy));
                }
                self.range_map.insert(range, slot as u8)?;
                self.set_slot_state(slot, SlotState::Used);
                self.version += 1;
                slot
            }
        };
        let shard = self.shards[slot].as_mut().expect("claimed slot has object");
        let previous = shard.insert(key, value)?;
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let (range, _) = self.key_range(key);
        let slot = self.shard_for(range)?;
        self.shards[slot].as_ref()?.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let (range, _) = self.key_range(key);
        let slot = self.shard_for(range)?;
        self.shards[slot].as_mut()?.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Removes the key. A shard left empty is demoted to `Deleted`, its
    /// range unassigned and its table compacted for reuse.
    pub fn erase(&mut self, key: &K) -> Option<V> {
        let (range, _) = self.key_range(key);
        let slot = self.shard_for(range)?;
        let shard = self.shards[slot].as_mut()?;
        let value = shard.erase(key)?;
        self.len -= 1;
        if shard.is_empty() {
            let _ = shard.fit();
            self.range_map.erase(&range);
            self.set_slot_state(slot, SlotState::Deleted);
            self.version += 1;
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        for slot in 0..self.shards.len() {
            if let Some(shard) = self.shards[slot].as_mut() {
                shard.clear();
                let _ = shard.fit();
            }
            self.set_slot_state(slot, SlotState::Deleted);
        }
        self.range_map.clear();
        self.len = 0;
        self.version += 1;
    }

    /// Iterates shard by shard; order across shards is unspecified.
    /// The iterator asserts against structural changes via the version
    /// counter.
    pub fn iter(&self) -> ChainedIter<'_, K, V> {
        ChainedIter {
            map: self,
            slot: 0,
            inner: None,
            version: self.version,
        }
    }

    #[cfg(feature = "internal-api")]
    pub fn shard_states(&self) -> Vec<SlotState> {
        (0..self.shards.len())
            .map(|slot| self.slot_state(slot))
            .collect()
    }
}

impl<K: StableHash, V: Clone> ChainedMap<K, V> {
    /// Changes the load factor, which re-folds every key into a new
    /// range space and redistributes all entries.
    ///
    /// Builds the replacement first; on failure the original is
    /// untouched. Callers are expected to set fullness before bulk
    /// insertion.
    pub fn set_fullness(&mut self, fullness: u8) -> Result<(), ContainerError> {
        if fullness == 0 || fullness > 100 {
            return Err(ContainerError::InvalidFullness(fullness));
        }
        let mut next = ChainedMap::new_in(self.pool.clone(), self.policy);
        next.fullness = fullness;
        for (key, value) in self.iter() {
            next.insert(key.clone(), value.clone())?;
        }
        next.version = self.version + 1;
        *self = next;
        Ok(())
    }
}

impl<K: StableHash, V> Default for ChainedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StableHash, V> Size for ChainedMap<K, V> {
    fn size(&self) -> usize {
        self.memory_usage()
    }
}

pub struct ChainedIter<'a, K, V> {
    map: &'a ChainedMap<K, V>,
    slot: usize,
    inner: Option<OAIter<'a, K, V>>,
    version: u64,
}

impl<'a, K: StableHash, V> Iterator for ChainedIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        assert_eq!(
            self.version, self.map.version,
            "chained container changed during iteration"
        );
        loop {
            if let Some(inner) = self.inner.as_mut() {
                if let Some(entry) = inner.next() {
                    return Some(entry);
                }
                self.inner = None;
            }
            if self.slot >= self.map.shards.len() {
                return None;
            }
            let slot = self.slot;
            self.slot += 1;
            if self.map.slot_state(slot) == SlotState::Used {
                self.inner = self.map.shards[slot].as_ref().map(|shard| shard.iter());
            }
        }
    }
}

/// Set counterpart of [`ChainedMap`].
pub struct ChainedSet<K> {
    inner: ChainedMap<K, ()>,
}

impl<K: StableHash> ChainedSet<K> {
    pub fn new() -> Self {
        ChainedSet {
            inner: ChainedMap::new(),
        }
    }

    pub fn new_in(pool: PoolHandle, policy: RegionPolicy) -> Self {
        ChainedSet {
            inner: ChainedMap::new_in(pool, policy),
        }
    }

    pub fn insert(&mut self, key: K) -> Result<bool, ContainerError> {
        Ok(self.inner.insert(key, ())?.is_none())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn erase(&mut self, key: &K) -> bool {
        self.inner.erase(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn chain_size(&self) -> usize {
        self.inner.chain_size()
    }

    pub fn set_fullness(&mut self, fullness: u8) -> Result<(), ContainerError> {
        self.inner.set_fullness(fullness)
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.memory_usage()
    }

    /// Folds a key into its `(range, hash)` pair.
    pub fn key_range(&self, key: &K) -> (u8, u64) {
        self.inner.key_range(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.inner.iter().map(|(k, _)| k)
    }

    #[cfg(feature = "internal-api")]
    pub fn shard_states(&self) -> Vec<SlotState> {
        self.inner.shard_states()
    }
}

impl<K: StableHash> Default for ChainedSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_ranges_to_single_shards() {
        let mut map = ChainedMap::new();
        for key in 0u32..200 {
            map.insert(key, key).unwrap();
        }
        assert_eq!(map.len(), 200);
        // Each assigned range owns exactly one shard.
        let ranges: Vec<u8> = map.range_map.iter().map(|(r, _)| *r).collect();
        let shards: Vec<u8> = map.range_map.iter().map(|(_, s)| *s).collect();
        let mut dedup = shards.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), shards.len(), "two ranges share a shard");
        assert_eq!(ranges.len(), map.chain_size());
        for key in 0u32..200 {
            assert_eq!(map.get(&key), Some(&key));
        }
    }

    #[test]
    fn erase_demotes_empty_shards() {
        let mut map = ChainedMap::new();
        map.insert(7u32, "seven").unwrap();
        let (range, _) = map.key_range(&7u32);
        let slot = map.shard_for(range).unwrap();
        assert_eq!(map.slot_state(slot), SlotState::Used);
        map.erase(&7u32);
        assert_eq!(map.slot_state(slot), SlotState::Deleted);
        assert!(map.shards[slot].is_some(), "object kept for reuse");
        assert_eq!(map.chain_size(), 0);
    }

    #[test]
    fn deleted_shard_is_reused_without_allocation() {
        let mut set = ChainedSet::new();
        set.set_fullness(92).unwrap();
        // Fill a handful of ranges.
        let keys: Vec<u32> = (0..500).collect();
        for &key in &keys {
            set.insert(key).unwrap();
        }
        let usage_before = set.memory_usage();
        let slots_before = set.inner.shard_slots();
        // Empty out one range completely.
        let victim_range = set.inner.key_range(&keys[0]).0;
        let victims: Vec<u32> = keys
            .iter()
            .copied()
            .filter(|k| set.inner.key_range(k).0 == victim_range)
            .collect();
        for victim in &victims {
            assert!(set.erase(victim));
        }
        // Reinsert into the same range: the Deleted shard must absorb
        // it without pushing the footprint past its pre-erase size.
        for victim in &victims {
            set.insert(*victim).unwrap();
        }
        assert_eq!(set.inner.shard_slots(), slots_before);
        assert!(set.memory_usage() <= usage_before, "reuse must not grow");
        assert_eq!(set.len(), keys.len());
    }

    #[test]
    fn iteration_yields_every_key_once() {
        let mut map = ChainedMap::new();
        for key in 0u16..300 {
            map.insert(key, ()).unwrap();
        }
        let mut seen: Vec<u16> = map.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert!(seen.iter().copied().eq(0..300));
    }

    #[test]
    fn set_fullness_redistributes() {
        let mut map: ChainedMap<u32, u32> = ChainedMap::new();
        for key in 0..100 {
            map.insert(key, key * 2).unwrap();
        }
        map.set_fullness(50).unwrap();
        assert_eq!(map.fullness(), 50);
        assert_eq!(map.len(), 100);
        for key in 0..100 {
            assert_eq!(map.get(&key), Some(&(key * 2)));
        }
    }
}
