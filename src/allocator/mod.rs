//! Region-aware memory pools.
//!
//! Boards with external pseudo-static RAM carry two distinct regions with
//! very different latency and size; the pools here decide per request
//! which region serves it and keep enough bookkeeping to release the
//! bytes back to the right region. Containers take a pool handle at
//! construction so tests can substitute an exhausted or counting pool.
//!
//! Pools account *bytes*, not raw pointers: a successful [`MemPool::reserve`]
//! hands out a [`Grant`] tagged with the serving region, and every byte of
//! a container's payload is covered by exactly one grant. All accounting
//! is rounded up to [`ALLOC_ALIGN`]-byte granularity.

use std::sync::Arc;

use thiserror::Error;

mod pools;

pub use pools::{DualPool, HostPool, InternalPool};

/// Minimum accounting granularity in bytes.
pub const ALLOC_ALIGN: usize = 8;

/// The memory region a grant was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// On-chip RAM.
    Internal,
    /// Off-chip pseudo-static RAM.
    External,
}

/// Where a request may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionPolicy {
    /// Strictly on-chip RAM.
    Internal,
    /// Strictly external RAM; fails on boards without it.
    External,
    /// Prefer external RAM when present, fall back to internal silently.
    #[default]
    Any,
}

/// Allocation failures surfaced to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory: {requested} bytes requested from {region:?} region")]
    Exhausted { requested: usize, region: Region },
    #[error("external memory requested but not present on this board")]
    NoExternalMemory,
}

/// Snapshot of a pool's regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatus {
    pub free_internal: usize,
    pub largest_free_internal: usize,
    pub total_internal: usize,
    pub free_external: usize,
    pub total_external: usize,
    pub has_external: bool,
}

/// A byte reservation held against a pool.
///
/// Grants are move-only tokens; the owning container returns them via
/// [`MemPool::release`] on drop. A grant dropped without release shows up
/// as leaked bytes in [`MemPool::status`], which the accounting tests
/// check for.
#[derive(Debug)]
pub struct Grant {
    bytes: usize,
    region: Region,
}

impl Grant {
    fn new(bytes: usize, region: Region) -> Self {
        Grant { bytes, region }
    }

    /// Number of accounted bytes, alignment rounding included.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// The region this grant was served from.
    pub fn region(&self) -> Region {
        self.region
    }
}

/// Rounds a byte count up to the accounting granularity.
pub(crate) fn align_up(bytes: usize) -> usize {
    (bytes + ALLOC_ALIGN - 1) / ALLOC_ALIGN * ALLOC_ALIGN
}

/// A region-aware byte budget.
///
/// All methods take `&self`; implementations guard their counters
/// internally so a pool handle can be shared between containers.
pub trait MemPool: Send + Sync {
    /// Reserves `bytes` according to `policy`. Zero-byte requests succeed
    /// with an empty grant against the policy's preferred region.
    fn reserve(&self, bytes: usize, policy: RegionPolicy) -> Result<Grant, AllocError>;

    /// Grows or shrinks an existing grant in place, staying in its region.
    fn resize(&self, grant: &mut Grant, new_bytes: usize) -> Result<(), AllocError>;

    /// Returns the grant's bytes to its region.
    fn release(&self, grant: Grant);

    /// Current snapshot of both regions.
    fn status(&self) -> MemoryStatus;

    /// Whether this grant's memory lives in the external region.
    fn is_external(&self, grant: &Grant) -> bool {
        grant.region() == Region::External
    }
}

/// Shared handle to a pool, as stored by containers.
pub type PoolHandle = Arc<dyn MemPool>;

lazy_static::lazy_static! {
    /// Process-wide unbounded pool backing containers constructed without
    /// an explicit pool. On-target code always passes a board pool; the
    /// default exists so host-side tooling and tests stay terse.
    static ref DEFAULT_POOL: PoolHandle = Arc::new(HostPool::new());
}

/// The process-default host pool.
pub fn default_pool() -> PoolHandle {
    DEFAULT_POOL.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_granularity() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
    }

    #[test]
    fn reserve_release_restores_status() {
        let pool = InternalPool::new(4096);
        let before = pool.status();
        let grant = pool.reserve(1000, RegionPolicy::Internal).unwrap();
        assert_eq!(grant.bytes(), align_up(1000));
        assert!(pool.status().free_internal < before.free_internal);
        pool.release(grant);
        assert_eq!(pool.status(), before);
    }

    #[test]
    fn internal_pool_rejects_external_requests() {
        let pool = InternalPool::new(4096);
        assert_eq!(
            pool.reserve(16, RegionPolicy::External).unwrap_err(),
            AllocError::NoExternalMemory
        );
    }

    #[test]
    fn any_policy_falls_back_to_internal() {
        // 1 KiB of external memory: the first Any request lands external,
        // the next one silently falls back to internal.
        let pool = DualPool::new(4096, 1024);
        let a = pool.reserve(1024, RegionPolicy::Any).unwrap();
        assert_eq!(a.region(), Region::External);
        let b = pool.reserve(1024, RegionPolicy::Any).unwrap();
        assert_eq!(b.region(), Region::Internal);
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn exhaustion_reports_requested_bytes() {
        let pool = InternalPool::new(64);
        match pool.reserve(128, RegionPolicy::Internal) {
            Err(AllocError::Exhausted { requested, region }) => {
                assert_eq!(requested, 128);
                assert_eq!(region, Region::Internal);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn resize_moves_the_difference() {
        let pool = InternalPool::new(4096);
        let mut grant = pool.reserve(64, RegionPolicy::Internal).unwrap();
        pool.resize(&mut grant, 128).unwrap();
        assert_eq!(grant.bytes(), 128);
        assert_eq!(pool.status().free_internal, 4096 - 128);
        pool.resize(&mut grant, 8).unwrap();
        assert_eq!(pool.status().free_internal, 4096 - 8);
        pool.release(grant);
        assert_eq!(pool.status().free_internal, 4096);
    }
}
