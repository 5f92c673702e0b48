//! Forest persistence: the `RFF1` binary and its JSON side-file.
//!
//! `<base>_forest.bin`, little-endian:
//!
//! ```text
//! "RFF1" · version:u16 · reserved:u16 · T:u16
//! T × (W:u8 · N:u32 · ceil(N·W/8) packed bytes)
//! ```
//!
//! `<base>_config.json` carries the model constants and label names;
//! `<base>_quantizer.qtz` is the quantizer blob when one is attached.
//! An optional `<base>_train_log.csv` records per-tree statistics.

use std::{
    io::{Read, Write},
    sync::atomic::AtomicBool,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::LabelRegistry,
    quantizer::Quantizer,
    storage::{FileSystem, OpenMode},
};

use super::{ForestError, PackedTree, RandomForest, TreeStats};

const MAGIC: &[u8; 4] = b"RFF1";
const VERSION: u16 = 1;

/// Node-count ceiling per tree; anything above is a corrupt header.
const MAX_NODES_PER_TREE: u32 = 1 << 24;

/// The JSON side-file schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestMeta {
    pub num_features: u16,
    pub num_labels: u8,
    pub quantization_coefficient: u8,
    pub num_trees: u16,
    pub mtry: u16,
    pub max_depth: u16,
    pub min_leaf: usize,
    pub label_names: Vec<String>,
    pub oob_score: f32,
    pub best_training_score: f32,
    pub built_at: String,
}

impl RandomForest {
    fn meta(&self) -> ForestMeta {
        ForestMeta {
            num_features: self.num_features,
            num_labels: self.num_labels,
            quantization_coefficient: self.k,
            num_trees: self.num_trees(),
            mtry: self.mtry,
            max_depth: self.max_depth,
            min_leaf: self.min_leaf,
            label_names: self.labels.to_vec(),
            oob_score: self.oob_score,
            best_training_score: self.best_training_score,
            built_at: self.built_at.clone(),
        }
    }

    /// Packs the tree payloads into `writer`.
    pub fn pack<W: Write>(&self, mut writer: W) -> Result<(), ForestError> {
        writer.write_all(MAGIC)?;
        writer.write_u16::<LittleEndian>(VERSION)?;
        writer.write_u16::<LittleEndian>(0)?; // reserved
        writer.write_u16::<LittleEndian>(self.num_trees())?;
        for tree in &self.trees {
            writer.write_u8(tree.node_width())?;
            writer.write_u32::<LittleEndian>(tree.node_count())?;
            writer.write_all(tree.as_bytes())?;
        }
        Ok(())
    }

    /// Unpacks tree payloads against the constants from the side-file.
    fn unpack<R: Read>(mut reader: R, meta: &ForestMeta) -> Result<Vec<PackedTree>, ForestError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ForestError::BadMagic);
        }
        let version = reader.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(ForestError::UnsupportedVersion(version));
        }
        let _reserved = reader.read_u16::<LittleEndian>()?;
        let num_trees = reader.read_u16::<LittleEndian>()?;
        let mut trees = Vec::with_capacity(num_trees as usize);
        for _ in 0..num_trees {
            let node_width = reader.read_u8()?;
            let node_count = reader.read_u32::<LittleEndian>()?;
            // Reject nonsense headers before sizing the payload buffer.
            super::tree::NodeLayout::from_width(
                meta.num_features,
                meta.num_labels,
                meta.quantization_coefficient,
                node_width,
            )?;
            if node_count == 0 || node_count > MAX_NODES_PER_TREE {
                return Err(ForestError::CorruptTree("implausible node count"));
            }
            let payload =
                crate::containers::PackedVec::payload_bytes(node_width, node_count as usize);
            let mut bytes = vec![0u8; payload];
            reader.read_exact(&mut bytes)?;
            trees.push(PackedTree::from_bytes(
                meta.num_features,
                meta.num_labels,
                meta.quantization_coefficient,
                node_width,
                node_count,
                &bytes,
            )?);
        }
        Ok(trees)
    }

    /// Writes `<base>_forest.bin`, `<base>_config.json` and, when a
    /// quantizer is attached, `<base>_quantizer.qtz`.
    pub fn save(&self, fs: &mut FileSystem, base: &str) -> Result<(), ForestError> {
        let mut handle = fs.open(&format!("{base}_forest.bin"), OpenMode::Write)?;
        self.pack(&mut handle)?;
        handle.flush()?;
        drop(handle);

        let json = serde_json::to_vec_pretty(&self.meta())?;
        fs.write_all(&format!("{base}_config.json"), &json)?;

        if let Some(quantizer) = &self.quantizer {
            quantizer.save(fs, &format!("{base}_quantizer.qtz"))?;
        }
        log::info!("forest saved under {base} ({} trees)", self.num_trees());
        Ok(())
    }

    /// Loads a forest saved by [`RandomForest::save`].
    pub fn load(fs: &mut FileSystem, base: &str) -> Result<Self, ForestError> {
        let json = fs.read_all(&format!("{base}_config.json"))?;
        let meta: ForestMeta = serde_json::from_slice(&json)?;
        let handle = fs.open(&format!("{base}_forest.bin"), OpenMode::Read)?;
        let trees = Self::unpack(handle, &meta)?;

        let quantizer_path = format!("{base}_quantizer.qtz");
        let quantizer = if fs.exists(&quantizer_path) {
            Some(Quantizer::load(fs, &quantizer_path)?)
        } else {
            None
        };

        Ok(RandomForest {
            num_features: meta.num_features,
            num_labels: meta.num_labels,
            k: meta.quantization_coefficient,
            trees,
            labels: meta.label_names.iter().cloned().collect::<LabelRegistry>(),
            quantizer,
            mtry: meta.mtry,
            max_depth: meta.max_depth,
            min_leaf: meta.min_leaf,
            collect_votes: false,
            oob_score: meta.oob_score,
            best_training_score: meta.best_training_score,
            built_at: meta.built_at,
            stats: Vec::new(),
            warmed: false,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Appends the per-tree statistics as a CSV training log.
    pub fn write_training_log(&self, fs: &mut FileSystem, path: &str) -> Result<(), ForestError> {
        let mut handle = fs.open(path, OpenMode::Write)?;
        writeln!(handle, "tree,nodes,depth,leaves,oob_samples")?;
        for (index, stats) in self.stats.iter().enumerate() {
            let TreeStats {
                nodes,
                depth,
                leaves,
                oob_samples,
            } = stats;
            writeln!(handle, "{index},{nodes},{depth},{leaves},{oob_samples}")?;
        }
        handle.flush()?;
        Ok(())
    }
}
