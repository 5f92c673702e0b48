//! `QTZ4` binary blob packing and unpacking.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! "QTZ4" · F:u16 · groups(2^k):u16 · L:u8 · outlier:u8
//! [outlier] F × (mean:f32 · stddev:f32)
//! L × (id:u8 · len:u8 · utf8 bytes)
//! F × (type:u8 · fmin:f32 · fmax:f32 · baseline:i64 · scale:u64 · payload)
//!     payload FT_DF: —
//!     payload FT_DC: count:u8 · count × f32
//!     payload FT_CU: edge_count:u8 · edge_count × u16
//! ```

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    containers::SboVec,
    dataset::LabelRegistry,
    storage::{FileSystem, OpenMode},
};

use super::{FeatureRule, FeatureState, Quantizer, QuantizerError};

const MAGIC: &[u8; 4] = b"QTZ4";

/// Clamp threshold restored for blobs with the outlier flag set; the
/// blob format stores only the flag.
pub const Z_TAU_DEFAULT: f32 = 3.0;

impl Quantizer {
    /// Serialises the quantizer into `writer`.
    pub fn pack<W: Write>(&self, mut writer: W) -> Result<(), QuantizerError> {
        writer.write_all(MAGIC)?;
        writer.write_u16::<LittleEndian>(self.num_features())?;
        writer.write_u16::<LittleEndian>(self.groups())?;
        writer.write_u8(self.labels().len() as u8)?;
        writer.write_u8(self.outlier_clamp().is_some() as u8)?;

        if self.outlier_clamp().is_some() {
            for state in &self.features {
                let (mean, stddev) = state.moments.unwrap_or((0.0, 0.0));
                writer.write_f32::<LittleEndian>(mean)?;
                writer.write_f32::<LittleEndian>(stddev)?;
            }
        }

        for (id, name) in self.labels().iter().enumerate() {
            writer.write_u8(id as u8)?;
            writer.write_u8(name.len() as u8)?;
            writer.write_all(name.as_bytes())?;
        }

        for state in &self.features {
            writer.write_u8(state.rule.type_tag())?;
            writer.write_f32::<LittleEndian>(state.fmin)?;
            writer.write_f32::<LittleEndian>(state.fmax)?;
            writer.write_i64::<LittleEndian>(state.baseline)?;
            writer.write_u64::<LittleEndian>(state.scale)?;
            match &state.rule {
                FeatureRule::FullLinear => {}
                FeatureRule::Discrete(categories) => {
                    writer.write_u8(categories.len() as u8)?;
                    for &category in categories.iter() {
                        writer.write_f32::<LittleEndian>(category)?;
                    }
                }
                FeatureRule::CustomEdges(edges) => {
                    writer.write_u8(edges.len() as u8)?;
                    for &edge in edges.iter() {
                        writer.write_u16::<LittleEndian>(edge)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Deserialises a quantizer, verifying magic and invariants. A
    /// failed verification drops whatever was partially read.
    pub fn unpack<R: Read>(mut reader: R) -> Result<Self, QuantizerError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(QuantizerError::BadMagic);
        }
        let num_features = reader.read_u16::<LittleEndian>()?;
        let groups = reader.read_u16::<LittleEndian>()?;
        if !groups.is_power_of_two() {
            return Err(QuantizerError::Corrupt("groups not a power of two"));
        }
        let k = groups.trailing_zeros() as u8;
        if !(1..=8).contains(&k) {
            return Err(QuantizerError::InvalidCoefficient(k));
        }
        let num_labels = reader.read_u8()?;
        let outlier = reader.read_u8()? != 0;

        let mut moments = Vec::new();
        if outlier {
            for _ in 0..num_features {
                let mean = reader.read_f32::<LittleEndian>()?;
                let stddev = reader.read_f32::<LittleEndian>()?;
                moments.push((mean, stddev));
            }
        }

        let mut labels = LabelRegistry::new();
        for expected in 0..num_labels {
            let id = reader.read_u8()?;
            if id != expected {
                return Err(QuantizerError::Corrupt("label ids not dense"));
            }
            let len = reader.read_u8()? as usize;
            let mut raw = vec![0u8; len];
            reader.read_exact(&mut raw)?;
            let name = String::from_utf8(raw)
                .map_err(|_| QuantizerError::Corrupt("label name not utf-8"))?;
            labels.register(&name);
        }

        let mut features = Vec::with_capacity(num_features as usize);
        for index in 0..num_features {
            let type_tag = reader.read_u8()?;
            let fmin = reader.read_f32::<LittleEndian>()?;
            let fmax = reader.read_f32::<LittleEndian>()?;
            let baseline = reader.read_i64::<LittleEndian>()?;
            let scale = reader.read_u64::<LittleEndian>()?;
            let rule = match type_tag {
                0 => FeatureRule::FullLinear,
                2 => {
                    let count = reader.read_u8()? as usize;
                    if count == 0 || count > 1 << k {
                        return Err(QuantizerError::Corrupt("category count exceeds groups"));
                    }
                    let mut categories: SboVec<f32, 8> = SboVec::new();
                    for _ in 0..count {
                        categories.push(reader.read_f32::<LittleEndian>()?);
                    }
                    FeatureRule::Discrete(categories)
                }
                1 => {
                    let count = reader.read_u8()? as usize;
                    if count == 0 || count > 1 << k {
                        return Err(QuantizerError::Corrupt("edge count exceeds groups"));
                    }
                    let mut edges: SboVec<u16, 16> = SboVec::new();
                    let mut previous: i64 = -1;
                    for _ in 0..count {
                        let edge = reader.read_u16::<LittleEndian>()?;
                        if (edge as i64) <= previous {
                            return Err(QuantizerError::InvalidEdges(index));
                        }
                        previous = edge as i64;
                        edges.push(edge);
                    }
                    FeatureRule::CustomEdges(edges)
                }
                _ => return Err(QuantizerError::Corrupt("unknown feature rule")),
            };
            features.push(FeatureState {
                rule,
                fmin,
                fmax,
                baseline,
                scale,
                moments: if outlier {
                    Some(moments[index as usize])
                } else {
                    None
                },
            });
        }

        Ok(Quantizer {
            k,
            features,
            labels,
            z_tau: outlier.then_some(Z_TAU_DEFAULT),
        })
    }

    /// Writes the blob through the filesystem facade.
    pub fn save(&self, fs: &mut FileSystem, path: &str) -> Result<(), QuantizerError> {
        let mut handle = fs.open(path, OpenMode::Write)?;
        self.pack(&mut handle)?;
        handle.flush()?;
        Ok(())
    }

    /// Reads a blob back through the filesystem facade.
    pub fn load(fs: &mut FileSystem, path: &str) -> Result<Self, QuantizerError> {
        let handle = fs.open(path, OpenMode::Read)?;
        Self::unpack(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageConfig, StorageKind};

    fn sample_quantizer() -> Quantizer {
        let mut q = Quantizer::new(3).unwrap();
        q.add_full_linear(0.0, 8.0).unwrap();
        q.add_custom_edges(-1.0, 1.0, &[-0.5, 0.0, 0.5, 1.0]).unwrap();
        q.add_discrete(&[10.0, 20.0, 40.0]).unwrap();
        q.set_outlier_clamp(Z_TAU_DEFAULT);
        q.set_moments(0, 4.0, 1.0);
        q.set_moments(1, 0.0, 0.4);
        q.set_moments(2, 20.0, 9.0);
        q.labels_mut().register("walk");
        q.labels_mut().register("run");
        q
    }

    #[test]
    fn round_trip_preserves_everything() {
        let q = sample_quantizer();
        let mut blob = Vec::new();
        q.pack(&mut blob).unwrap();
        let restored = Quantizer::unpack(blob.as_slice()).unwrap();
        assert_eq!(q, restored);

        // Serialise → deserialise → serialise is byte-identical.
        let mut again = Vec::new();
        restored.pack(&mut again).unwrap();
        assert_eq!(blob, again);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut blob = Vec::new();
        sample_quantizer().pack(&mut blob).unwrap();
        blob[0] = b'X';
        assert!(matches!(
            Quantizer::unpack(blob.as_slice()),
            Err(QuantizerError::BadMagic)
        ));
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let mut blob = Vec::new();
        sample_quantizer().pack(&mut blob).unwrap();
        blob.truncate(blob.len() - 3);
        assert!(Quantizer::unpack(blob.as_slice()).is_err());
    }

    #[test]
    fn save_and_load_through_facade() {
        let mut fs = FileSystem::mount(StorageKind::FlashLog, &StorageConfig::default());
        let q = sample_quantizer();
        q.save(&mut fs, "/models/m.qtz").unwrap();
        let restored = Quantizer::load(&mut fs, "/models/m.qtz").unwrap();
        assert_eq!(q, restored);
    }
}
