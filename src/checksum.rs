//! Hashing and checksum primitives.
//!
//! Two distinct concerns live here: the deterministic, platform-independent
//! hash used by the open-addressed containers (the same key must land in
//! the same slot on a little-endian MCU and on the test host), and the
//! CRC32 used by the wire transfer protocol and file verification.

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Seed for all container hashing. Fixed so that hash values, and with
/// them shard assignments, are reproducible across platforms and runs.
const XX_SEED: u64 = 0x5148_4632; // "QHF2"

/// Hashes a byte slice with the crate-wide fixed-seed XxHash64.
pub fn xxh64(bytes: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(XX_SEED);
    h.write(bytes);
    h.finish()
}

/// Keys usable in the open-addressed and chained containers.
///
/// The hash must depend only on the key's value, never on pointer
/// identity or process state.
pub trait StableHash: Clone + PartialEq {
    fn stable_hash(&self) -> u64;
}

macro_rules! impl_stable_hash_int {
    ($($t:ty),*) => {
        $(impl StableHash for $t {
            fn stable_hash(&self) -> u64 {
                xxh64(&u64::from(*self).to_le_bytes())
            }
        })*
    };
}

impl_stable_hash_int!(u8, u16, u32, u64);

impl StableHash for usize {
    fn stable_hash(&self) -> u64 {
        xxh64(&(*self as u64).to_le_bytes())
    }
}

impl StableHash for String {
    fn stable_hash(&self) -> u64 {
        xxh64(self.as_bytes())
    }
}

impl<const N: usize> StableHash for [u8; N] {
    fn stable_hash(&self) -> u64 {
        xxh64(&self[..])
    }
}

impl StableHash for Vec<u8> {
    fn stable_hash(&self) -> u64 {
        xxh64(self)
    }
}

/// Incremental CRC32 state.
///
/// Wraps `crc32fast` so that callers accumulate over chunk payloads and
/// compare against the sender's value at end-of-session.
#[derive(Clone, Default)]
pub struct Crc32 {
    inner: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Crc32 {
            inner: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.inner.finalize()
    }

    /// One-shot CRC32 of a complete buffer.
    pub fn of(bytes: &[u8]) -> u32 {
        let mut c = Crc32::new();
        c.update(bytes);
        c.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xxh64_is_deterministic() {
        assert_eq!(xxh64(b"feature"), xxh64(b"feature"));
        assert_ne!(xxh64(b"feature"), xxh64(b"featurf"));
    }

    #[test]
    fn stable_hash_widens_consistently() {
        // The same numeric value hashes identically through every integer
        // width, so a map keyed by u8 and one keyed by u32 agree.
        assert_eq!(7u8.stable_hash(), 7u32.stable_hash());
        assert_eq!(7u16.stable_hash(), 7u64.stable_hash());
    }

    #[test]
    fn crc_incremental_matches_oneshot() {
        let data = (0u8..=255).collect::<Vec<_>>();
        let mut inc = Crc32::new();
        for chunk in data.chunks(7) {
            inc.update(chunk);
        }
        assert_eq!(inc.finalize(), Crc32::of(&data));
    }
}
