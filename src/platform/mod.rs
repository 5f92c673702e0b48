//! Platform facade: time, entropy and the debug sink.
//!
//! Everything the core needs from the outside world arrives through a
//! [`RuntimeContext`] passed to the public entry points; there is no
//! process-global state beyond the default host pool.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use crate::{
    allocator::{default_pool, DualPool, InternalPool, PoolHandle},
    checksum::xxh64,
    config::RuntimeConfiguration,
};

/// Microsecond clock.
pub trait Clock: Send + Sync {
    fn micros(&self) -> u64;
}

/// Wall-clock micros since context creation.
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        HostClock {
            origin: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn micros(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// An absolute expiry point on some clock.
#[derive(Clone)]
pub struct Deadline {
    clock: Arc<dyn Clock>,
    at_micros: u64,
}

impl Deadline {
    pub fn after(clock: Arc<dyn Clock>, micros: u64) -> Self {
        Deadline {
            at_micros: clock.micros() + micros,
            clock,
        }
    }

    pub fn expired(&self) -> bool {
        self.clock.micros() >= self.at_micros
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deadline")
            .field("at_micros", &self.at_micros)
            .finish()
    }
}

/// Diagnostic verbosity, 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DebugLevel {
    Off = 0,
    #[default]
    Status = 1,
    Debug = 2,
    /// Per-chunk and per-tree traces.
    Trace = 3,
}

impl DebugLevel {
    pub fn from_u8(level: u8) -> Self {
        match level {
            0 => DebugLevel::Off,
            1 => DebugLevel::Status,
            2 => DebugLevel::Debug,
            _ => DebugLevel::Trace,
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            DebugLevel::Off => log::LevelFilter::Off,
            DebugLevel::Status => log::LevelFilter::Info,
            DebugLevel::Debug => log::LevelFilter::Debug,
            DebugLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// The context object threaded through public entry points.
#[derive(Clone)]
pub struct RuntimeContext {
    clock: Arc<dyn Clock>,
    pool: PoolHandle,
    debug_level: DebugLevel,
}

impl RuntimeContext {
    /// Host context: wall clock and the unbounded process pool.
    pub fn host() -> Self {
        RuntimeContext {
            clock: Arc::new(HostClock::new()),
            pool: default_pool(),
            debug_level: DebugLevel::Status,
        }
    }

    /// Context with the pools a board configuration prescribes.
    pub fn from_config(config: &RuntimeConfiguration) -> Self {
        let pool: PoolHandle = if config.use_external_ram {
            Arc::new(DualPool::new(
                config.internal_ram_budget,
                config.external_ram_budget,
            ))
        } else {
            Arc::new(InternalPool::new(config.internal_ram_budget))
        };
        RuntimeContext {
            clock: Arc::new(HostClock::new()),
            pool,
            debug_level: DebugLevel::from_u8(config.debug_level),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pool(mut self, pool: PoolHandle) -> Self {
        self.pool = pool;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn micros(&self) -> u64 {
        self.clock.micros()
    }

    pub fn pool(&self) -> PoolHandle {
        self.pool.clone()
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.debug_level
    }

    /// Seed material for callers that do not pin their own RNG seed.
    pub fn entropy_seed(&self) -> u64 {
        let micros = self.clock.micros();
        xxh64(&micros.to_le_bytes()) ^ micros.rotate_left(17)
    }

    /// A deadline `micros` from now on this context's clock.
    pub fn deadline_after(&self, micros: u64) -> Deadline {
        Deadline::after(self.clock.clone(), micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_deadline() {
        let clock = Arc::new(ManualClock::new());
        let deadline = Deadline::after(clock.clone(), 100);
        assert!(!deadline.expired());
        clock.advance(99);
        assert!(!deadline.expired());
        clock.advance(1);
        assert!(deadline.expired());
    }

    #[test]
    fn debug_level_mapping() {
        assert_eq!(DebugLevel::from_u8(0), DebugLevel::Off);
        assert_eq!(DebugLevel::from_u8(3), DebugLevel::Trace);
        assert_eq!(DebugLevel::from_u8(200), DebugLevel::Trace);
        assert_eq!(
            DebugLevel::Debug.to_level_filter(),
            log::LevelFilter::Debug
        );
    }

    #[test]
    fn context_pools_follow_the_board_config() {
        let config = RuntimeConfiguration {
            use_external_ram: true,
            internal_ram_budget: 1024,
            external_ram_budget: 2048,
            ..RuntimeConfiguration::default()
        };
        let ctx = RuntimeContext::from_config(&config);
        let status = ctx.pool().status();
        assert!(status.has_external);
        assert_eq!(status.total_external, 2048);
        assert_eq!(ctx.debug_level(), DebugLevel::Status);

        let internal_only = RuntimeConfiguration {
            use_external_ram: false,
            internal_ram_budget: 1024,
            ..RuntimeConfiguration::default()
        };
        let ctx = RuntimeContext::from_config(&internal_only);
        assert!(!ctx.pool().status().has_external);
    }

    #[test]
    fn host_clock_is_monotonic() {
        let clock = HostClock::new();
        let a = clock.micros();
        let b = clock.micros();
        assert!(b >= a);
    }
}
