//! Row-major quantized sample store.
//!
//! Rows are bit-packed back to back: sample `i` starts at bit
//! `i · F · k`, each of its `F` feature values occupying `k` bits.
//! Loading streams CSV in chunks; a dataset declared larger than its
//! RAM budget enters *partial-loading mode* and keeps only the newest
//! rows, which downgrades training to out-of-bag scoring.

use std::io::{BufRead, BufReader, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use thiserror::Error;

use crate::{
    allocator::{default_pool, AllocError, PoolHandle, RegionPolicy},
    containers::PackedVec,
    quantizer::RemapFilter,
    size::Size,
    storage::{FileSystem, OpenMode, StorageError},
};

mod labels;

pub use labels::LabelRegistry;

const MAGIC: &[u8; 4] = b"QDS1";

/// Feature counts up to this benefit from chunked loading.
pub const MAX_CHUNKED_FEATURES: usize = 1023;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("csv line {0}: malformed row")]
    Malformed(usize),
    #[error("csv line {line}: value {value} of feature {feature} exceeds {max}")]
    ValueOutOfRange {
        line: usize,
        feature: u16,
        value: u64,
        max: u64,
    },
    #[error("expected {expected} features per row, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("remap filter shape does not match the dataset")]
    FilterMismatch,
    #[error("not a dataset snapshot (bad magic)")]
    BadMagic,
    #[error("dataset snapshot is corrupt: {0}")]
    Corrupt(&'static str),
}

/// Parameters of a CSV load.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    /// Rows handled per chunk; a suspension point follows each chunk.
    pub chunk_samples: usize,
    /// Resident-row ceiling; exceeding it enters partial-loading mode.
    pub max_resident_rows: Option<usize>,
}

impl Default for LoadSpec {
    fn default() -> Self {
        LoadSpec {
            chunk_samples: 256,
            max_resident_rows: None,
        }
    }
}

/// What a load did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub rows_seen: usize,
    pub rows_resident: usize,
    pub partial: bool,
}

/// The quantized sample store.
pub struct QuantizedDataset {
    num_features: u16,
    k: u8,
    /// Feature values, `len = rows · F`, each `k` bits.
    values: PackedVec,
    /// One label id per row.
    labels: PackedVec,
    registry: LabelRegistry,
    /// Sliding-window cap; 0 means unbounded.
    window: usize,
    partial: bool,
    rows_seen: usize,
}

impl QuantizedDataset {
    pub fn new(num_features: u16, k: u8) -> Self {
        Self::new_in(num_features, k, default_pool(), RegionPolicy::Any)
    }

    pub fn new_in(num_features: u16, k: u8, pool: PoolHandle, policy: RegionPolicy) -> Self {
        assert!((1..=8).contains(&k), "quantization coefficient out of range");
        assert!(num_features > 0, "dataset needs at least one feature");
        QuantizedDataset {
            num_features,
            k,
            values: PackedVec::new_in(k, pool.clone(), policy),
            labels: PackedVec::new_in(8, pool, policy),
            registry: LabelRegistry::new(),
            window: 0,
            partial: false,
            rows_seen: 0,
        }
    }

    pub fn num_features(&self) -> u16 {
        self.num_features
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    /// Number of resident rows.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows ever pushed, trimmed ones included.
    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }

    /// Whether the store holds only a sliding tail of the data.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn num_labels(&self) -> u8 {
        self.registry.len() as u8
    }

    pub fn labels(&self) -> &LabelRegistry {
        &self.registry
    }

    pub fn labels_mut(&mut self) -> &mut LabelRegistry {
        &mut self.registry
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.values.memory_usage() + self.labels.memory_usage()
    }

    /// Caps resident rows; pushing past the cap drops the oldest row and
    /// marks the store partial.
    pub fn set_window(&mut self, rows: usize) {
        self.window = rows;
    }

    fn ensure_label(&mut self, id: u8) {
        while self.registry.len() <= id as usize {
            let name = format!("class_{}", self.registry.len());
            self.registry.register(&name);
        }
    }

    /// Appends one quantized row.
    pub fn push_row(&mut self, features: &[u16], label: u8) -> Result<(), DatasetError> {
        if features.len() != self.num_features as usize {
            return Err(DatasetError::DimensionMismatch {
                expected: self.num_features as usize,
                got: features.len(),
            });
        }
        let max = (1u64 << self.k) - 1;
        for (feature, &value) in features.iter().enumerate() {
            if value as u64 > max {
                return Err(DatasetError::ValueOutOfRange {
                    line: self.rows_seen + 1,
                    feature: feature as u16,
                    value: value as u64,
                    max,
                });
            }
        }
        if self.window > 0 && self.len() >= self.window {
            self.trim_fifo(self.window - 1)?;
            self.partial = true;
        }
        for &value in features {
            self.values.push(value as u64)?;
        }
        self.labels.push(label as u64)?;
        self.ensure_label(label);
        self.rows_seen += 1;
        Ok(())
    }

    /// One feature value of one sample. Out-of-range access reads 0.
    pub fn get_feature(&self, sample: usize, feature: u16) -> u16 {
        self.values
            .get(sample * self.num_features as usize + feature as usize) as u16
    }

    pub fn get_label(&self, sample: usize) -> u8 {
        self.labels.get(sample) as u8
    }

    pub fn label_name(&self, id: u8) -> Option<&str> {
        self.registry.name(id)
    }

    /// Uniform bootstrap draw.
    pub fn bag_sample<R: Rng>(&self, rng: &mut R) -> usize {
        rng.gen_range(0..self.len())
    }

    /// Drops the oldest rows, keeping the newest `keep_last`.
    pub fn trim_fifo(&mut self, keep_last: usize) -> Result<(), DatasetError> {
        let rows = self.len();
        if keep_last >= rows {
            return Ok(());
        }
        let drop_rows = rows - keep_last;
        let stride = self.num_features as usize;
        for index in 0..keep_last * stride {
            let value = self.values.get(drop_rows * stride + index);
            self.values.set(index, value);
        }
        for row in 0..keep_last {
            let label = self.labels.get(drop_rows + row);
            self.labels.set(row, label);
        }
        self.values.resize(keep_last * stride, 0)?;
        self.labels.resize(keep_last, 0)?;
        Ok(())
    }

    /// Rewrites every stored value through the filter, in place.
    ///
    /// Applying the identity filter leaves the packed buffer
    /// byte-for-byte unchanged.
    pub fn apply_remap_filter(&mut self, filter: &RemapFilter) -> Result<(), DatasetError> {
        if filter.num_features() != self.num_features || filter.k() != self.k {
            return Err(DatasetError::FilterMismatch);
        }
        let stride = self.num_features as usize;
        for sample in 0..self.len() {
            for feature in 0..self.num_features {
                let index = sample * stride + feature as usize;
                let old = self.values.get(index) as u16;
                let new = filter.map(feature, old);
                if new != old {
                    self.values.set(index, new as u64);
                }
            }
        }
        Ok(())
    }

    /// Iterates chunk-sized slices of the packed rows, each yielded as
    /// `(first_sample, packed bytes)`. Peak RAM is one chunk.
    pub fn chunk_iter(
        &self,
        chunk_samples: usize,
    ) -> impl Iterator<Item = (usize, Vec<u8>)> + '_ {
        let chunk_samples = chunk_samples.max(1);
        let rows = self.len();
        let stride = self.num_features as usize;
        let k = self.k;
        (0..rows).step_by(chunk_samples).map(move |start| {
            let count = chunk_samples.min(rows - start);
            let mut chunk = PackedVec::new(k);
            chunk
                .reserve(count * stride)
                .expect("chunk fits by construction");
            for index in 0..count * stride {
                chunk
                    .push(self.values.get(start * stride + index))
                    .expect("reserved above");
            }
            (start, chunk.as_bytes().to_vec())
        })
    }

    /// Streams a normalised CSV (header, then `F` integer features and
    /// an integer label id per line) into the store.
    pub fn load_csv(
        &mut self,
        fs: &mut FileSystem,
        path: &str,
        spec: &LoadSpec,
    ) -> Result<LoadReport, DatasetError> {
        if let Some(window) = spec.max_resident_rows {
            self.set_window(window);
        }
        let handle = fs.open(path, OpenMode::Read)?;
        let report = self.load_csv_reader(handle, spec)?;
        if report.partial {
            log::info!(
                "dataset {path}: partial load, {} of {} rows resident",
                report.rows_resident,
                report.rows_seen
            );
        }
        Ok(report)
    }

    fn load_csv_reader<R: Read>(
        &mut self,
        reader: R,
        spec: &LoadSpec,
    ) -> Result<LoadReport, DatasetError> {
        let reader = BufReader::new(reader);
        let mut row = Vec::with_capacity(self.num_features as usize);
        let mut in_chunk = 0usize;
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if number == 0 {
                // Header is mandatory.
                continue;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            row.clear();
            let mut fields = trimmed.split(',');
            for _ in 0..self.num_features {
                let field = fields.next().ok_or(DatasetError::Malformed(number + 1))?;
                let value: u64 = field
                    .trim()
                    .parse()
                    .map_err(|_| DatasetError::Malformed(number + 1))?;
                let max = (1u64 << self.k) - 1;
                if value > max {
                    return Err(DatasetError::ValueOutOfRange {
                        line: number + 1,
                        feature: row.len() as u16,
                        value,
                        max,
                    });
                }
                row.push(value as u16);
            }
            let label: u8 = fields
                .next()
                .ok_or(DatasetError::Malformed(number + 1))?
                .trim()
                .parse()
                .map_err(|_| DatasetError::Malformed(number + 1))?;
            if fields.next().is_some() {
                return Err(DatasetError::Malformed(number + 1));
            }
            self.push_row(&row, label)?;
            in_chunk += 1;
            if in_chunk >= spec.chunk_samples {
                // Suspension point: the cooperative caller may run its
                // watchdog between chunks.
                log::trace!("csv chunk boundary at row {}", self.rows_seen);
                in_chunk = 0;
            }
        }
        Ok(LoadReport {
            rows_seen: self.rows_seen,
            rows_resident: self.len(),
            partial: self.partial,
        })
    }

    /// Writes a `QDS1` snapshot of the resident rows.
    pub fn save(&self, fs: &mut FileSystem, path: &str) -> Result<(), DatasetError> {
        let mut handle = fs.open(path, OpenMode::Write)?;
        handle.write_all(MAGIC)?;
        handle.write_u16::<LittleEndian>(self.num_features)?;
        handle.write_u8(self.num_labels())?;
        handle.write_u8(self.k)?;
        handle.write_u32::<LittleEndian>(self.len() as u32)?;
        for (id, name) in self.registry.iter().enumerate() {
            handle.write_u8(id as u8)?;
            handle.write_u8(name.len() as u8)?;
            handle.write_all(name.as_bytes())?;
        }
        handle.write_all(self.labels.as_bytes())?;
        handle.write_all(self.values.as_bytes())?;
        handle.flush()?;
        Ok(())
    }

    /// Loads a `QDS1` snapshot.
    pub fn load(fs: &mut FileSystem, path: &str) -> Result<Self, DatasetError> {
        let mut handle = fs.open(path, OpenMode::Read)?;
        let mut magic = [0u8; 4];
        handle.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DatasetError::BadMagic);
        }
        let num_features = handle.read_u16::<LittleEndian>()?;
        let num_labels = handle.read_u8()?;
        let k = handle.read_u8()?;
        if num_features == 0 || !(1..=8).contains(&k) {
            return Err(DatasetError::Corrupt("invalid header constants"));
        }
        let rows = handle.read_u32::<LittleEndian>()? as usize;
        let available = handle.size()? as usize;
        if rows * num_features as usize / 8 > available {
            return Err(DatasetError::Corrupt("row count exceeds file size"));
        }
        let mut dataset = QuantizedDataset::new(num_features, k);
        for expected in 0..num_labels {
            let id = handle.read_u8()?;
            if id != expected {
                return Err(DatasetError::Corrupt("label ids not dense"));
            }
            let len = handle.read_u8()? as usize;
            let mut raw = vec![0u8; len];
            handle.read_exact(&mut raw)?;
            let name =
                String::from_utf8(raw).map_err(|_| DatasetError::Corrupt("label not utf-8"))?;
            dataset.registry.register(&name);
        }
        let mut label_bytes = vec![0u8; rows];
        handle.read_exact(&mut label_bytes)?;
        let value_bytes_len = PackedVec::payload_bytes(k, rows * num_features as usize);
        let mut value_bytes = vec![0u8; value_bytes_len];
        handle.read_exact(&mut value_bytes)?;
        dataset.labels =
            PackedVec::from_bytes(8, rows, &label_bytes, default_pool(), RegionPolicy::Any)?;
        dataset.values = PackedVec::from_bytes(
            k,
            rows * num_features as usize,
            &value_bytes,
            default_pool(),
            RegionPolicy::Any,
        )?;
        for row in 0..rows {
            let label = dataset.labels.get(row) as u8;
            if label as usize >= dataset.registry.len().max(1) {
                return Err(DatasetError::Corrupt("row label out of range"));
            }
        }
        dataset.rows_seen = rows;
        Ok(dataset)
    }
}

impl Size for QuantizedDataset {
    fn size(&self) -> usize {
        self.memory_usage()
    }
}
