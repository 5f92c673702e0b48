//! Open-addressed hash map and set with packed slot states.

use std::mem;

use crate::{
    allocator::{default_pool, AllocError, Grant, PoolHandle, RegionPolicy},
    checksum::StableHash,
    size::Size,
};

use super::{ContainerError, PackedVec};

/// Hard ceiling on table capacity so slot indices stay 16-bit.
pub const MAX_TABLE_CAPACITY: usize = 1 << 16;

/// Default load-factor percentage before a grow is triggered.
pub const DEFAULT_FULLNESS: u8 = 70;

const MIN_CAPACITY: usize = 8;

/// State of one table slot, packed two bits wide in a shared flag array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty = 0,
    Used = 1,
    Deleted = 2,
}

impl SlotState {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => SlotState::Used,
            2 => SlotState::Deleted,
            _ => SlotState::Empty,
        }
    }
}

/// Open-addressed hash map with linear probing.
///
/// Slot states live in a 2-bit packed flag array next to the entry
/// storage. Insertion rehashes into a doubled table once the occupied
/// slot count (tombstones included) crosses `capacity * fullness / 100`;
/// `fit()` rebuilds a smaller table once utilisation falls under a third.
/// Hashing is the crate's fixed-seed XxHash64, so slot assignment is
/// identical on every platform.
///
/// Structural changes (grow, rehash, `fit`, `clear`) bump a version
/// counter; live iterators assert against it on every advance.
pub struct OAMap<K, V> {
    flags: PackedVec,
    entries: Vec<Option<(K, V)>>,
    used: usize,
    tombstones: usize,
    fullness: u8,
    version: u64,
    pool: PoolHandle,
    policy: RegionPolicy,
    grant: Option<Grant>,
}

impl<K: StableHash, V> OAMap<K, V> {
    pub fn new() -> Self {
        Self::new_in(default_pool(), RegionPolicy::Any)
    }

    pub fn new_in(pool: PoolHandle, policy: RegionPolicy) -> Self {
        OAMap {
            flags: PackedVec::new_in(2, pool.clone(), policy),
            entries: Vec::new(),
            used: 0,
            tombstones: 0,
            fullness: DEFAULT_FULLNESS,
            version: 0,
            pool,
            policy,
            grant: None,
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn fullness(&self) -> u8 {
        self.fullness
    }

    pub fn memory_usage(&self) -> usize {
        mem::size_of::<Self>() - mem::size_of::<PackedVec>() + self.flags.memory_usage()
            + self.entries.len() * mem::size_of::<Option<(K, V)>>()
    }

    fn slot_state(&self, slot: usize) -> SlotState {
        SlotState::from_bits(self.flags.get(slot))
    }

    fn set_slot_state(&mut self, slot: usize, state: SlotState) {
        self.flags.set(slot, state as u64);
    }

    /// Occupied slots that count against the load factor.
    fn load(&self) -> usize {
        self.used + self.tombstones
    }

    fn grow_threshold(&self) -> usize {
        self.entries.len() * self.fullness as usize / 100
    }

    /// Finds `key`'s slot, or the slot an insert should take.
    ///
    /// Returns `(slot, present)`. Capacity must be non-zero.
    fn probe(&self, key: &K) -> (usize, bool) {
        debug_assert!(!self.entries.is_empty());
        let cap_mask = self.entries.len() - 1;
        let start = key.stable_hash() as usize & cap_mask;
        let mut first_tombstone = None;
        for step in 0..=cap_mask {
            let slot = (start + step) & cap_mask;
            match self.slot_state(slot) {
                SlotState::Empty => {
                    return (first_tombstone.unwrap_or(slot), false);
                }
                SlotState::Deleted => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(slot);
                    }
                }
                SlotState::Used => {
                    let (stored, _) = self.entries[slot].as_ref().expect("used slot has entry");
                    if stored == key {
                        return (slot, true);
                    }
                }
            }
        }
        // Full circle: every slot Used or Deleted. Inserts never get here
        // (growth runs first); lookups just report a miss.
        (first_tombstone.unwrap_or(0), false)
    }

    fn recharge(&mut self, new_cap: usize) -> Result<(), AllocError> {
        let new_bytes = new_cap * mem::size_of::<Option<(K, V)>>();
        match self.grant.as_mut() {
            Some(grant) => self.pool.resize(grant, new_bytes)?,
            None => {
                if new_bytes > 0 {
                    self.grant = Some(self.pool.reserve(new_bytes, self.policy)?);
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the table at `new_cap` slots, dropping tombstones.
    fn rebuild(&mut self, new_cap: usize) -> Result<(), ContainerError> {
        debug_assert!(new_cap.is_power_of_two());
        if new_cap > MAX_TABLE_CAPACITY {
            return Err(ContainerError::CapacityExceeded(MAX_TABLE_CAPACITY));
        }
        let mut next_flags = PackedVec::new_in(2, self.pool.clone(), self.policy);
        next_flags.resize(new_cap, SlotState::Empty as u64)?;
        self.recharge(new_cap)?;
        let mut next_entries: Vec<Option<(K, V)>> = (0..new_cap).map(|_| None).collect();

        let cap_mask = new_cap - 1;
        for slot in 0..self.entries.len() {
            if self.slot_state(slot) != SlotState::Used {
                continue;
            }
            let (key, value) = self.entries[slot].take().expect("used slot has entry");
            let start = key.stable_hash() as usize & cap_mask;
            let mut step = 0;
            loop {
                let target = (start + step) & cap_mask;
                if next_entries[target].is_none() {
                    next_entries[target] = Some((key, value));
                    next_flags.set(target, SlotState::Used as u64);
                    break;
                }
                step += 1;
            }
        }
        self.flags = next_flags;
        self.entries = next_entries;
        self.tombstones = 0;
        self.version += 1;
        Ok(())
    }

    /// Inserts or replaces; returns the previous value for the key.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, ContainerError> {
        if self.entries.is_empty() {
            self.rebuild(MIN_CAPACITY)?;
        } else if self.load() + 1 > self.grow_threshold() {
            self.rebuild(self.entries.len() * 2)?;
        }
        let (slot, present) = self.probe(&key);
        if present {
            let old = self.entries[slot].replace((key, value));
            return Ok(old.map(|(_, v)| v));
        }
        if self.slot_state(slot) == SlotState::Deleted {
            self.tombstones -= 1;
        }
        self.entries[slot] = Some((key, value));
        self.set_slot_state(slot, SlotState::Used);
        self.used += 1;
        Ok(None)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        if self.entries.is_empty() {
            return None;
        }
        let (slot, present) = self.probe(key);
        if present {
            self.entries[slot].as_ref().map(|(_, v)| v)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.entries.is_empty() {
            return None;
        }
        let (slot, present) = self.probe(key);
        if present {
            self.entries[slot].as_mut().map(|(_, v)| v)
        } else {
            None
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Removes the key, leaving a tombstone in its slot.
    pub fn erase(&mut self, key: &K) -> Option<V> {
        if self.entries.is_empty() {
            return None;
        }
        let (slot, present) = self.probe(key);
        if !present {
            return None;
        }
        let (_, value) = self.entries[slot].take().expect("used slot has entry");
        self.set_slot_state(slot, SlotState::Deleted);
        self.used -= 1;
        self.tombstones += 1;
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
        self.flags.fill(SlotState::Empty as u64);
        self.used = 0;
        self.tombstones = 0;
        self.version += 1;
    }

    /// Rebuilds a smaller table when utilisation dropped below a third;
    /// an empty map releases its buffers entirely. Idempotent.
    pub fn fit(&mut self) -> Result<(), ContainerError> {
        if self.used == 0 {
            self.entries = Vec::new();
            self.flags = PackedVec::new_in(2, self.pool.clone(), self.policy);
            if let Some(grant) = self.grant.take() {
                self.pool.release(grant);
            }
            self.tombstones = 0;
            self.version += 1;
            return Ok(());
        }
        if self.used * 3 < self.entries.len() {
            let target = (self.used * 100 / self.fullness as usize + 1)
                .next_power_of_two()
                .max(MIN_CAPACITY);
            if target < self.entries.len() {
                self.rebuild(target)?;
            }
        }
        Ok(())
    }

    /// Changes the load-factor percentage and rehashes.
    ///
    /// On rebuild failure the previous table and fullness survive.
    pub fn set_fullness(&mut self, fullness: u8) -> Result<(), ContainerError> {
        if fullness == 0 || fullness > 100 {
            return Err(ContainerError::InvalidFullness(fullness));
        }
        let previous = self.fullness;
        self.fullness = fullness;
        if self.entries.is_empty() {
            return Ok(());
        }
        let target = (self.used * 100 / fullness as usize + 1)
            .next_power_of_two()
            .max(MIN_CAPACITY);
        if let Err(err) = self.rebuild(target) {
            self.fullness = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn iter(&self) -> OAIter<'_, K, V> {
        OAIter {
            map: self,
            slot: 0,
            version: self.version,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    #[cfg(feature = "internal-api")]
    pub fn slot_states(&self) -> impl Iterator<Item = SlotState> + '_ {
        (0..self.entries.len()).map(move |slot| self.slot_state(slot))
    }
}

impl<K: StableHash, V> Default for OAMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StableHash, V: PartialEq> PartialEq for OAMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.used == other.used
            && self
                .iter()
                .all(|(k, v)| other.get(k).map_or(false, |o| o == v))
    }
}

impl<K: StableHash, V> Size for OAMap<K, V> {
    fn size(&self) -> usize {
        self.memory_usage()
    }
}

impl<K: StableHash + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for OAMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over live entries; panics if the table was rebuilt while it
/// was alive (possible only through internal-api raw access).
pub struct OAIter<'a, K, V> {
    map: &'a OAMap<K, V>,
    slot: usize,
    version: u64,
}

impl<'a, K: StableHash, V> Iterator for OAIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        assert_eq!(
            self.version, self.map.version,
            "container rebuilt during iteration"
        );
        while self.slot < self.map.entries.len() {
            let slot = self.slot;
            self.slot += 1;
            if self.map.slot_state(slot) == SlotState::Used {
                let (k, v) = self.map.entries[slot].as_ref().expect("used slot has entry");
                return Some((k, v));
            }
        }
        None
    }
}

/// Open-addressed hash set over [`OAMap`].
pub struct OASet<K> {
    inner: OAMap<K, ()>,
}

impl<K: StableHash> OASet<K> {
    pub fn new() -> Self {
        OASet { inner: OAMap::new() }
    }

    pub fn new_in(pool: PoolHandle, policy: RegionPolicy) -> Self {
        OASet {
            inner: OAMap::new_in(pool, policy),
        }
    }

    /// Returns true when the key was newly inserted.
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

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }

    pub fn fit(&mut self) -> Result<(), ContainerError> {
        self.inner.fit()
    }

    pub fn set_fullness(&mut self, fullness: u8) -> Result<(), ContainerError> {
        self.inner.set_fullness(fullness)
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.memory_usage()
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }
}

impl<K: StableHash> Default for OASet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn insert_get_erase() {
        let mut map = OAMap::new();
        assert_eq!(map.insert(1u32, "one").unwrap(), None);
        assert_eq!(map.insert(2u32, "two").unwrap(), None);
        assert_eq!(map.insert(1u32, "uno").unwrap(), Some("one"));
        assert_eq!(map.get(&1), Some(&"uno"));
        assert_eq!(map.erase(&1), Some("uno"));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn tombstones_do_not_break_probe_chains() {
        let mut map = OAMap::new();
        for key in 0u32..32 {
            map.insert(key, key * 10).unwrap();
        }
        for key in (0u32..32).step_by(2) {
            map.erase(&key);
        }
        for key in 0u32..32 {
            let expected = if key % 2 == 0 { None } else { Some(&(key * 10)) };
            assert_eq!(map.get(&key), expected, "key {key}");
        }
    }

    #[test]
    fn string_keys() {
        let mut map = OAMap::new();
        map.insert("setosa".to_string(), 0u8).unwrap();
        map.insert("versicolor".to_string(), 1u8).unwrap();
        assert_eq!(map.get(&"setosa".to_string()), Some(&0));
        assert!(!map.contains(&"virginica".to_string()));
    }

    #[test]
    fn fit_shrinks_sparse_tables() {
        let mut map = OAMap::new();
        for key in 0u32..1000 {
            map.insert(key, ()).unwrap();
        }
        for key in 10u32..1000 {
            map.erase(&key);
        }
        let before = map.capacity();
        map.fit().unwrap();
        assert!(map.capacity() < before);
        for key in 0u32..10 {
            assert!(map.contains(&key));
        }
    }

    #[test]
    fn set_fullness_rehashes_and_survives() {
        let mut map = OAMap::new();
        for key in 0u32..100 {
            map.insert(key, key).unwrap();
        }
        map.set_fullness(92).unwrap();
        assert_eq!(map.len(), 100);
        for key in 0u32..100 {
            assert_eq!(map.get(&key), Some(&key));
        }
        assert_eq!(
            map.set_fullness(0).unwrap_err(),
            ContainerError::InvalidFullness(0)
        );
        assert_eq!(map.fullness(), 92);
    }

    #[quickcheck]
    fn qc_size_matches_live_keys(ops: Vec<(u16, bool)>) -> bool {
        let mut map = OAMap::new();
        let mut model = std::collections::HashMap::new();
        for (key, insert) in ops {
            if insert {
                map.insert(key, key as u32).unwrap();
                model.insert(key, key as u32);
            } else {
                map.erase(&key);
                model.remove(&key);
            }
        }
        map.len() == model.len() && map.iter().count() == model.len()
    }
}
