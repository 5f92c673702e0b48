//! Array of integers stored in a runtime-chosen bit width.

use std::mem;

use bitvec::prelude::*;

use crate::{
    allocator::{default_pool, AllocError, Grant, PoolHandle, RegionPolicy},
    size::Size,
};

/// A packed integer array whose element width is a runtime value.
///
/// Elements occupy `bits` bits each (1..=64), little-endian inside a byte
/// buffer: element `i` lives at bit offset `i * bits`. Widths 1, 2, 4, 8,
/// 16 and 32 take whole-byte fast paths; the remaining widths go through
/// a bit-slice load/store.
///
/// [`PackedVec::set`] masks the value to the element width silently, and
/// the unchecked [`PackedVec::get`] clamps out-of-range indices to a safe
/// zero instead of faulting.
pub struct PackedVec {
    bits: u8,
    len: usize,
    cap: usize,
    buf: Vec<u8>,
    pool: PoolHandle,
    policy: RegionPolicy,
    grant: Option<Grant>,
}

impl PackedVec {
    /// An empty array of `bits`-wide elements on the default pool.
    ///
    /// Panics if `bits` is outside `1..=64`; the width comes from
    /// validated model constants, never raw user input.
    pub fn new(bits: u8) -> Self {
        Self::new_in(bits, default_pool(), RegionPolicy::Any)
    }

    /// An empty array charging the given pool.
    pub fn new_in(bits: u8, pool: PoolHandle, policy: RegionPolicy) -> Self {
        assert!((1..=64).contains(&bits), "element width out of range");
        PackedVec {
            bits,
            len: 0,
            cap: 0,
            buf: Vec::new(),
            pool,
            policy,
            grant: None,
        }
    }

    /// Bytes needed to hold `n` elements of `bits` width.
    pub fn payload_bytes(bits: u8, n: usize) -> usize {
        (n * bits as usize + 7) / 8
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// The mask an element value is reduced to on store.
    pub fn mask(&self) -> u64 {
        if self.bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Total footprint: header plus the packed payload buffer.
    pub fn memory_usage(&self) -> usize {
        mem::size_of::<Self>() + Self::payload_bytes(self.bits, self.cap)
    }

    fn rebuffer(&mut self, new_cap: usize) -> Result<(), AllocError> {
        let new_bytes = Self::payload_bytes(self.bits, new_cap);
        match self.grant.as_mut() {
            Some(grant) => self.pool.resize(grant, new_bytes)?,
            None => {
                if new_bytes > 0 {
                    self.grant = Some(self.pool.reserve(new_bytes, self.policy)?);
                }
            }
        }
        self.buf.resize(new_bytes, 0);
        self.cap = new_cap;
        Ok(())
    }

    /// Ensures room for at least `n` elements.
    pub fn reserve(&mut self, n: usize) -> Result<(), AllocError> {
        if n > self.cap {
            self.rebuffer(n)?;
        }
        Ok(())
    }

    /// Drops all elements, keeping capacity.
    pub fn clear(&mut self) {
        self.len = 0;
        self.buf.iter_mut().for_each(|b| *b = 0);
    }

    /// Shrinks capacity to the exact length. Idempotent.
    pub fn fit(&mut self) -> Result<(), AllocError> {
        if self.cap != self.len {
            self.rebuffer(self.len)?;
            self.buf.shrink_to_fit();
        }
        if self.len == 0 {
            if let Some(grant) = self.grant.take() {
                self.pool.release(grant);
            }
        }
        Ok(())
    }

    /// Checked read.
    pub fn try_get(&self, index: usize) -> Option<u64> {
        if index < self.len {
            Some(self.read(index))
        } else {
            None
        }
    }

    /// Unchecked read; out-of-range indices yield 0.
    pub fn get(&self, index: usize) -> u64 {
        self.try_get(index).unwrap_or(0)
    }

    fn read(&self, index: usize) -> u64 {
        let bits = self.bits as usize;
        let start = index * bits;
        match self.bits {
            8 => self.buf[index] as u64,
            16 => {
                let b = index * 2;
                u16::from_le_bytes([self.buf[b], self.buf[b + 1]]) as u64
            }
            32 => {
                let b = index * 4;
                u32::from_le_bytes([
                    self.buf[b],
                    self.buf[b + 1],
                    self.buf[b + 2],
                    self.buf[b + 3],
                ]) as u64
            }
            1 | 2 | 4 => {
                let byte = self.buf[start / 8];
                let shift = start % 8;
                (byte >> shift) as u64 & self.mask()
            }
            _ => {
                let view = self.buf.view_bits::<Lsb0>();
                view[start..start + bits].load_le::<u64>()
            }
        }
    }

    /// Writes `value & mask` at `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, value: u64) {
        if index >= self.len {
            return;
        }
        self.write(index, value & self.mask());
    }

    fn write(&mut self, index: usize, value: u64) {
        let bits = self.bits as usize;
        let start = index * bits;
        match self.bits {
            8 => self.buf[index] = value as u8,
            16 => self.buf[index * 2..index * 2 + 2].copy_from_slice(&(value as u16).to_le_bytes()),
            32 => self.buf[index * 4..index * 4 + 4].copy_from_slice(&(value as u32).to_le_bytes()),
            1 | 2 | 4 => {
                let shift = start % 8;
                let mask = self.mask() as u8;
                let byte = &mut self.buf[start / 8];
                *byte &= !(mask << shift);
                *byte |= (value as u8) << shift;
            }
            _ => {
                let view = self.buf.view_bits_mut::<Lsb0>();
                view[start..start + bits].store_le(value);
            }
        }
    }

    pub fn push(&mut self, value: u64) -> Result<(), AllocError> {
        if self.len == self.cap {
            let new_cap = if self.cap == 0 { 8 } else { self.cap * 2 };
            self.rebuffer(new_cap)?;
        }
        self.len += 1;
        self.write(self.len - 1, value & self.mask());
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        let value = self.read(self.len - 1);
        self.write(self.len - 1, 0);
        self.len -= 1;
        Some(value)
    }

    /// Overwrites every element with `value & mask`.
    ///
    /// Byte-patterned widths are filled bytewise instead of per element.
    pub fn fill(&mut self, value: u64) {
        let v = value & self.mask();
        match self.bits {
            1 | 2 | 4 | 8 => {
                let mut pattern = v as u8;
                let mut width = self.bits;
                while width < 8 {
                    pattern |= pattern << width;
                    width *= 2;
                }
                let full_bytes = self.len * self.bits as usize / 8;
                self.buf[..full_bytes].iter_mut().for_each(|b| *b = pattern);
                for index in full_bytes * 8 / self.bits as usize..self.len {
                    self.write(index, v);
                }
            }
            16 | 32 | 64 => {
                let stride = self.bits as usize / 8;
                let elem = v.to_le_bytes();
                for chunk in self.buf[..self.len * stride].chunks_exact_mut(stride) {
                    chunk.copy_from_slice(&elem[..stride]);
                }
            }
            _ => {
                for index in 0..self.len {
                    self.write(index, v);
                }
            }
        }
    }

    /// Resizes to `n` elements; new elements are `value & mask`.
    pub fn resize(&mut self, n: usize, value: u64) -> Result<(), AllocError> {
        if n > self.cap {
            self.rebuffer(n)?;
        }
        let old_len = self.len;
        self.len = n;
        let v = value & self.mask();
        for index in old_len..n {
            self.write(index, v);
        }
        if n < old_len {
            for index in n..old_len {
                self.write(index, 0);
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(move |i| self.read(i))
    }

    /// The packed payload for the first `len` elements, trailing bits of
    /// the last byte zeroed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..Self::payload_bytes(self.bits, self.len)]
    }

    /// Rebuilds an array from a packed payload, as read from storage.
    pub fn from_bytes(
        bits: u8,
        len: usize,
        bytes: &[u8],
        pool: PoolHandle,
        policy: RegionPolicy,
    ) -> Result<Self, AllocError> {
        let mut v = Self::new_in(bits, pool, policy);
        v.rebuffer(len)?;
        v.len = len;
        let payload = Self::payload_bytes(bits, len);
        v.buf[..payload.min(bytes.len())].copy_from_slice(&bytes[..payload.min(bytes.len())]);
        Ok(v)
    }

    pub(crate) fn pool(&self) -> PoolHandle {
        self.pool.clone()
    }

    pub(crate) fn policy(&self) -> RegionPolicy {
        self.policy
    }

    /// Copy with a fresh grant on the same pool.
    pub fn try_clone(&self) -> Result<Self, AllocError> {
        let mut copy = Self::new_in(self.bits, self.pool.clone(), self.policy);
        copy.rebuffer(self.cap)?;
        copy.len = self.len;
        copy.buf.copy_from_slice(&self.buf);
        Ok(copy)
    }
}

impl Size for PackedVec {
    fn size(&self) -> usize {
        self.memory_usage()
    }
}

impl PartialEq for PackedVec {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits && self.len == other.len && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for PackedVec {}

impl std::fmt::Debug for PackedVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedVec")
            .field("bits", &self.bits)
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

impl Drop for PackedVec {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            self.pool.release(grant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn set_masks_to_width() {
        for bits in [1u8, 2, 3, 4, 7, 8, 11, 16, 24, 32, 48, 64] {
            let mut v = PackedVec::new(bits);
            v.resize(16, 0).unwrap();
            for i in 0..16 {
                v.set(i, 0xDEAD_BEEF_CAFE_F00D ^ i as u64);
            }
            for i in 0..16 {
                assert_eq!(
                    v.get(i),
                    (0xDEAD_BEEF_CAFE_F00D ^ i as u64) & v.mask(),
                    "width {bits} index {i}"
                );
            }
        }
    }

    #[test]
    fn out_of_range_reads_are_clamped() {
        let mut v = PackedVec::new(4);
        v.push(9).unwrap();
        assert_eq!(v.get(0), 9);
        assert_eq!(v.get(100), 0);
        assert_eq!(v.try_get(100), None);
    }

    #[test]
    fn fill_matches_per_index_stores() {
        for bits in [1u8, 2, 4, 5, 8, 12, 16, 32] {
            let mut a = PackedVec::new(bits);
            let mut b = PackedVec::new(bits);
            a.resize(33, 0).unwrap();
            b.resize(33, 0).unwrap();
            a.fill(0x5555_5555_5555_5555);
            for i in 0..33 {
                b.set(i, 0x5555_5555_5555_5555);
            }
            assert_eq!(a, b, "width {bits}");
        }
    }

    #[test]
    fn memory_usage_tracks_payload() {
        let mut v = PackedVec::new(3);
        v.resize(100, 1).unwrap();
        v.fit().unwrap();
        let payload = (100 * 3 + 7) / 8;
        assert_eq!(v.memory_usage(), std::mem::size_of::<PackedVec>() + payload);
    }

    #[test]
    fn fit_is_idempotent() {
        let mut v = PackedVec::new(6);
        for i in 0..50 {
            v.push(i).unwrap();
        }
        v.fit().unwrap();
        let cap = v.capacity();
        let usage = v.memory_usage();
        v.fit().unwrap();
        assert_eq!(v.capacity(), cap);
        assert_eq!(v.memory_usage(), usage);
    }

    #[test]
    fn bytes_round_trip() {
        let mut v = PackedVec::new(5);
        for i in 0..20 {
            v.push(i * 3).unwrap();
        }
        let copy = PackedVec::from_bytes(
            5,
            20,
            v.as_bytes(),
            crate::allocator::default_pool(),
            RegionPolicy::Any,
        )
        .unwrap();
        assert_eq!(v, copy);
    }

    #[quickcheck]
    fn qc_store_then_load(values: Vec<u64>, bits: u8) -> bool {
        let bits = bits % 64 + 1;
        let mut v = PackedVec::new(bits);
        for &value in &values {
            v.push(value).unwrap();
        }
        values
            .iter()
            .enumerate()
            .all(|(i, &value)| v.get(i) == value & v.mask())
    }

    #[quickcheck]
    fn qc_fill_then_read(len: u8, value: u64, bits: u8) -> bool {
        let bits = bits % 64 + 1;
        let mut v = PackedVec::new(bits);
        v.resize(len as usize, 0).unwrap();
        v.fill(value);
        let mask = v.mask();
        let result = v.iter().all(|e| e == value & mask);
        result
    }
}
