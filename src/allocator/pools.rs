//! Concrete pool implementations.

use parking_lot::Mutex;

use super::{align_up, AllocError, Grant, MemPool, MemoryStatus, Region, RegionPolicy};

#[derive(Debug, Default)]
struct RegionCounter {
    total: usize,
    used: usize,
}

impl RegionCounter {
    fn new(total: usize) -> Self {
        RegionCounter { total, used: 0 }
    }

    fn free(&self) -> usize {
        self.total - self.used
    }

    fn try_take(&mut self, bytes: usize) -> bool {
        if bytes <= self.free() {
            self.used += bytes;
            true
        } else {
            false
        }
    }

    fn give_back(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.used);
        self.used = self.used.saturating_sub(bytes);
    }
}

/// Pool over on-chip RAM only. External requests always fail.
pub struct InternalPool {
    internal: Mutex<RegionCounter>,
}

impl InternalPool {
    /// A pool with `budget` bytes of internal RAM.
    pub fn new(budget: usize) -> Self {
        InternalPool {
            internal: Mutex::new(RegionCounter::new(budget)),
        }
    }
}

impl MemPool for InternalPool {
    fn reserve(&self, bytes: usize, policy: RegionPolicy) -> Result<Grant, AllocError> {
        if policy == RegionPolicy::External {
            return Err(AllocError::NoExternalMemory);
        }
        let rounded = align_up(bytes);
        if self.internal.lock().try_take(rounded) {
            Ok(Grant::new(rounded, Region::Internal))
        } else {
            Err(AllocError::Exhausted {
                requested: bytes,
                region: Region::Internal,
            })
        }
    }

    fn resize(&self, grant: &mut Grant, new_bytes: usize) -> Result<(), AllocError> {
        debug_assert_eq!(grant.region, Region::Internal);
        let rounded = align_up(new_bytes);
        let mut counter = self.internal.lock();
        if rounded >= grant.bytes {
            if !counter.try_take(rounded - grant.bytes) {
                return Err(AllocError::Exhausted {
                    requested: new_bytes,
                    region: Region::Internal,
                });
            }
        } else {
            counter.give_back(grant.bytes - rounded);
        }
        grant.bytes = rounded;
        Ok(())
    }

    fn release(&self, grant: Grant) {
        self.internal.lock().give_back(grant.bytes);
    }

    fn status(&self) -> MemoryStatus {
        let counter = self.internal.lock();
        MemoryStatus {
            free_internal: counter.free(),
            largest_free_internal: counter.free(),
            total_internal: counter.total,
            free_external: 0,
            total_external: 0,
            has_external: false,
        }
    }
}

/// Pool over internal plus external RAM.
///
/// `Any` requests are served externally first; a full external region
/// falls back to internal without surfacing the miss to the caller.
pub struct DualPool {
    internal: Mutex<RegionCounter>,
    external: Mutex<RegionCounter>,
}

impl DualPool {
    pub fn new(internal_budget: usize, external_budget: usize) -> Self {
        DualPool {
            internal: Mutex::new(RegionCounter::new(internal_budget)),
            external: Mutex::new(RegionCounter::new(external_budget)),
        }
    }
}

impl MemPool for DualPool {
    fn reserve(&self, bytes: usize, policy: RegionPolicy) -> Result<Grant, AllocError> {
        let rounded = align_up(bytes);
        let try_external = || -> Option<Grant> {
            self.external
                .lock()
                .try_take(rounded)
                .then(|| Grant::new(rounded, Region::External))
        };
        match policy {
            RegionPolicy::Internal => {
                if self.internal.lock().try_take(rounded) {
                    Ok(Grant::new(rounded, Region::Internal))
                } else {
                    Err(AllocError::Exhausted {
                        requested: bytes,
                        region: Region::Internal,
                    })
                }
            }
            RegionPolicy::External => try_external().ok_or(AllocError::Exhausted {
                requested: bytes,
                region: Region::External,
            }),
            RegionPolicy::Any => {
                if let Some(grant) = try_external() {
                    return Ok(grant);
                }
                log::trace!("external region full, serving {bytes} B internally");
                if self.internal.lock().try_take(rounded) {
                    Ok(Grant::new(rounded, Region::Internal))
                } else {
                    Err(AllocError::Exhausted {
                        requested: bytes,
                        region: Region::Internal,
                    })
                }
            }
        }
    }

    fn resize(&self, grant: &mut Grant, new_bytes: usize) -> Result<(), AllocError> {
        let counter = match grant.region {
            Region::Internal => &self.internal,
            Region::External => &self.external,
        };
        let rounded = align_up(new_bytes);
        let mut counter = counter.lock();
        if rounded >= grant.bytes {
            if !counter.try_take(rounded - grant.bytes) {
                return Err(AllocError::Exhausted {
                    requested: new_bytes,
                    region: grant.region,
                });
            }
        } else {
            counter.give_back(grant.bytes - rounded);
        }
        grant.bytes = rounded;
        Ok(())
    }

    fn release(&self, grant: Grant) {
        match grant.region {
            Region::Internal => self.internal.lock().give_back(grant.bytes),
            Region::External => self.external.lock().give_back(grant.bytes),
        }
    }

    fn status(&self) -> MemoryStatus {
        let internal = self.internal.lock();
        let external = self.external.lock();
        MemoryStatus {
            free_internal: internal.free(),
            largest_free_internal: internal.free(),
            total_internal: internal.total,
            free_external: external.free(),
            total_external: external.total,
            has_external: true,
        }
    }
}

/// Unbounded pool over the process heap, for hosts and tests.
pub struct HostPool {
    used: Mutex<usize>,
}

impl HostPool {
    pub fn new() -> Self {
        HostPool {
            used: Mutex::new(0),
        }
    }
}

impl Default for HostPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPool for HostPool {
    fn reserve(&self, bytes: usize, policy: RegionPolicy) -> Result<Grant, AllocError> {
        if policy == RegionPolicy::External {
            return Err(AllocError::NoExternalMemory);
        }
        let rounded = align_up(bytes);
        *self.used.lock() += rounded;
        Ok(Grant::new(rounded, Region::Internal))
    }

    fn resize(&self, grant: &mut Grant, new_bytes: usize) -> Result<(), AllocError> {
        let rounded = align_up(new_bytes);
        let mut used = self.used.lock();
        *used = used.saturating_sub(grant.bytes) + rounded;
        grant.bytes = rounded;
        Ok(())
    }

    fn release(&self, grant: Grant) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(grant.bytes);
    }

    fn status(&self) -> MemoryStatus {
        let used = *self.used.lock();
        MemoryStatus {
            free_internal: usize::MAX - used,
            largest_free_internal: usize::MAX - used,
            total_internal: usize::MAX,
            free_external: 0,
            total_external: 0,
            has_external: false,
        }
    }
}
