//! On-device quantized random-forest stack.
//!
//! This crate trains, stores, loads and executes random-forest
//! classifiers whose features are quantized to a handful of bits each,
//! on devices with kilobytes of RAM. Datasets and models larger than
//! internal memory stream through the storage facade and live in
//! bit-packed containers.
//!
//! The layers, bottom up:
//!
//! * [`allocator`] — region-aware memory pools (internal, external,
//!   host) that every container charges its payload against.
//! * [`storage`] — one file facade over flash, SD and host backends.
//! * [`containers`] / [`chained`] — packed arrays, small-buffer
//!   vectors, open-addressed and range-sharded hash tables.
//! * [`dataset`] — the bit-packed sample store with chunked CSV
//!   loading, FIFO trimming and partial-loading mode.
//! * [`quantizer`] — per-feature float→bin rules with drift detection
//!   and on-line bin expansion/shrinking via remap filters.
//! * [`forest`] — BFS bit-packed trees, the Gini trainer, bagging with
//!   out-of-bag scoring, and the `RFF1`/JSON persistence pair.
//! * [`transfer`] — the receiver half of the chunked serial transfer
//!   protocol.
//! * [`platform`] / [`config`] — the context object and runtime
//!   configuration threaded through the public entry points.
//!
//! # Example
//!
//! ```
//! use qforest_ml_stack::{
//!     dataset::QuantizedDataset,
//!     forest::{ForestConfig, RandomForest},
//!     platform::RuntimeContext,
//! };
//!
//! let mut dataset = QuantizedDataset::new(2, 2);
//! dataset.labels_mut().register("off");
//! dataset.labels_mut().register("on");
//! for i in 0..16u16 {
//!     let label = (i % 2) as u8;
//!     dataset
//!         .push_row(&[label as u16 * 3, i % 4], label)
//!         .unwrap();
//! }
//!
//! let ctx = RuntimeContext::host();
//! let config = ForestConfig {
//!     num_trees: 5,
//!     seed: Some(7),
//!     ..ForestConfig::default()
//! };
//! let mut forest = RandomForest::train(&dataset, &config, &ctx).unwrap();
//! forest.warmup().unwrap();
//! assert!(forest.best_training_score() > 0.99);
//! ```

pub mod allocator;
pub mod chained;
pub mod checksum;
pub mod config;
pub mod containers;
pub mod dataset;
pub mod forest;
pub mod platform;
pub mod quantizer;
pub mod size;
pub mod storage;
pub mod transfer;

use thiserror::Error;

pub use crate::{
    allocator::{AllocError, MemPool, MemoryStatus, PoolHandle, Region, RegionPolicy},
    chained::{ChainedMap, ChainedSet},
    config::{ConfigError, RuntimeConfiguration},
    containers::{ContainerError, IdVec, OAMap, OASet, PackedVec, PoolDeque, PoolVec, SboVec},
    dataset::{DatasetError, LabelRegistry, QuantizedDataset},
    forest::{ForestConfig, ForestError, Prediction, RandomForest},
    platform::{Deadline, DebugLevel, RuntimeContext},
    quantizer::{DriftReport, OverlapPolicy, Quantizer, QuantizerError, RemapFilter},
    storage::{FileSystem, StorageError, StorageKind},
    transfer::{TransferError, TransferReceiver},
};

/// Umbrella error for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Quantizer(#[from] QuantizerError),
    #[error(transparent)]
    Forest(#[from] ForestError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl Error {
    /// Process exit code for the CLI drivers: 1 configuration, 2 I/O,
    /// 3 verification, 4 out of memory.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Alloc(_) => 4,
            Error::Container(ContainerError::Alloc(_)) => 4,
            Error::Container(_) => 1,
            Error::Storage(_) => 2,
            Error::Dataset(err) => match err {
                DatasetError::Io(_) | DatasetError::Storage(_) => 2,
                DatasetError::Alloc(_) => 4,
                _ => 3,
            },
            Error::Quantizer(err) => match err {
                QuantizerError::Io(_) | QuantizerError::Storage(_) => 2,
                QuantizerError::Alloc(_) => 4,
                QuantizerError::InvalidCoefficient(_) => 1,
                _ => 3,
            },
            Error::Forest(err) => match err {
                ForestError::Io(_) | ForestError::Storage(_) => 2,
                ForestError::Alloc(_) => 4,
                _ => 3,
            },
            Error::Transfer(err) => match err {
                TransferError::Storage(_) | TransferError::Io(_) => 2,
                _ => 3,
            },
        }
    }
}

/// Initialises `env_logger` once for host binaries and tests.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::builder().is_test(false).try_init();
}
