//! Memory-dense containers with pluggable pool accounting.
//!
//! Every container here charges its payload against a [`MemPool`]
//! handle passed at construction (or the process-default host pool), so
//! the same code runs against a 16 KiB on-chip budget and an unbounded
//! host heap. Growth doubles capacity, `fit()` shrinks to the exact
//! length, and all of them report their full footprint via
//! `memory_usage()`.

use thiserror::Error;

use crate::allocator::AllocError;

mod id_vec;
mod oa_map;
mod packed_vec;
mod pool_vec;
mod ring;
mod sbo_vec;

pub use id_vec::IdVec;
pub use oa_map::{OAIter, OAMap, OASet, SlotState, DEFAULT_FULLNESS, MAX_TABLE_CAPACITY};
pub use packed_vec::PackedVec;
pub use pool_vec::PoolVec;
pub use ring::PoolDeque;
pub use sbo_vec::SboVec;

/// Failures common to the container family.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("table capacity limit reached ({0} slots)")]
    CapacityExceeded(usize),
    #[error("fullness must be in 1..=100, got {0}")]
    InvalidFullness(u8),
}
