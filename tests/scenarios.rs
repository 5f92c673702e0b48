//! End-to-end scenarios over the public API.

use std::sync::Arc;

use qforest_ml_stack::{
    allocator::InternalPool,
    chained::ChainedSet,
    dataset::{LoadSpec, QuantizedDataset},
    forest::{ForestConfig, ForestError, RandomForest},
    platform::RuntimeContext,
    quantizer::{Quantizer, RemapFilter},
    storage::{FileSystem, StorageConfig, StorageKind},
    transfer::{frames, Response, TransferReceiver},
    RegionPolicy,
};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

fn flash_fs() -> FileSystem {
    FileSystem::mount(
        StorageKind::FlashLog,
        &StorageConfig {
            flash_capacity: 4 * 1024 * 1024,
            ..StorageConfig::default()
        },
    )
}

/// 150 balanced samples of an iris-like problem: F=4, L=3, k=2.
fn iris_like(rng: &mut XorShiftRng) -> Vec<([u16; 4], u8)> {
    let mut samples = Vec::with_capacity(150);
    for i in 0..150usize {
        let class = (i % 3) as u16;
        let wiggle = rng.gen_range(0..2u16);
        let row = [
            class,
            class,
            (class + wiggle).min(3),
            rng.gen_range(0..4u16),
        ];
        samples.push((row, class as u8));
    }
    samples
}

#[test]
fn tiny_dataset_trains_accurately_and_stays_small() {
    let mut rng = XorShiftRng::seed_from_u64(42);
    let samples = iris_like(&mut rng);

    let mut train_set = QuantizedDataset::new(4, 2);
    let mut test_set = QuantizedDataset::new(4, 2);
    for name in ["setosa", "versicolor", "virginica"] {
        train_set.labels_mut().register(name);
        test_set.labels_mut().register(name);
    }
    // 70/30 split.
    for (index, (row, label)) in samples.iter().enumerate() {
        let target = if index % 10 < 7 {
            &mut train_set
        } else {
            &mut test_set
        };
        target.push_row(row, *label).unwrap();
    }

    let ctx = RuntimeContext::host();
    let config = ForestConfig {
        num_trees: 20,
        min_leaf: 1,
        seed: Some(42),
        ..ForestConfig::default()
    };
    let mut forest = RandomForest::train(&train_set, &config, &ctx).unwrap();
    forest.warmup().unwrap();

    assert!(
        forest.score(&train_set).unwrap() >= 0.99,
        "train accuracy {}",
        forest.score(&train_set).unwrap()
    );
    assert!(
        forest.score(&test_set).unwrap() >= 0.93,
        "test accuracy {}",
        forest.score(&test_set).unwrap()
    );

    let mut fs = flash_fs();
    forest.save(&mut fs, "/models/iris").unwrap();
    let bin = fs.file_size("/models/iris_forest.bin").unwrap();
    assert!(bin <= 3 * 1024, "serialized forest is {bin} B");

    // Round trip predicts identically.
    let restored = RandomForest::load(&mut fs, "/models/iris").unwrap();
    for sample in 0..test_set.len() {
        let mut row = qforest_ml_stack::PackedVec::new(2);
        for feature in 0..4u16 {
            row.push(test_set.get_feature(sample, feature) as u64)
                .unwrap();
        }
        assert_eq!(
            forest.predict_row(&row).unwrap(),
            restored.predict_row(&row).unwrap()
        );
    }
}

#[test]
fn drift_signal_reports_feature_and_value() {
    let mut quantizer = Quantizer::new(2).unwrap();
    quantizer
        .add_custom_edges(0.0, 10.0, &[2.5, 5.0, 7.5, 10.0])
        .unwrap();
    quantizer.add_full_linear(0.0, 4.0).unwrap();

    let (row, report) = quantizer.encode(&[12.5, 1.0]).unwrap();
    assert_eq!(row.get(0), 3, "clamped to the last bin");
    assert!(report.drifted);
    assert_eq!(report.feature, Some(0));
    assert_eq!(report.value, 12.5);
}

#[test]
fn shrink_style_filter_collapses_low_bins_in_place() {
    // Synthetic {0,1,2,3}^F dataset.
    let features = 3u16;
    let mut dataset = QuantizedDataset::new(features, 2);
    for a in 0..4u16 {
        for b in 0..4u16 {
            for c in 0..4u16 {
                dataset.push_row(&[a, b, c], 0).unwrap();
            }
        }
    }
    let original: Vec<Vec<u16>> = (0..dataset.len())
        .map(|s| (0..features).map(|f| dataset.get_feature(s, f)).collect())
        .collect();

    // Collapse bins 0 and 1 into 0 on every feature.
    let mut filter = RemapFilter::identity(features, 2);
    for feature in 0..features {
        filter.set(feature, 1, 0);
    }
    dataset.apply_remap_filter(&filter).unwrap();
    for (sample, row) in original.iter().enumerate() {
        for (feature, &old) in row.iter().enumerate() {
            let expected = if old <= 1 { 0 } else { old };
            assert_eq!(
                dataset.get_feature(sample, feature as u16),
                expected,
                "sample {sample} feature {feature}"
            );
        }
    }

    // The identity filter afterwards changes nothing.
    let snapshot: Vec<Vec<u16>> = (0..dataset.len())
        .map(|s| (0..features).map(|f| dataset.get_feature(s, f)).collect())
        .collect();
    dataset
        .apply_remap_filter(&RemapFilter::identity(features, 2))
        .unwrap();
    let after: Vec<Vec<u16>> = (0..dataset.len())
        .map(|s| (0..features).map(|f| dataset.get_feature(s, f)).collect())
        .collect();
    assert_eq!(snapshot, after);
}

#[test]
fn oversized_dataset_falls_back_to_partial_mode() {
    // 16 KiB of internal RAM, no external. The CSV is ~24 KiB of rows.
    let pool = Arc::new(InternalPool::new(16 * 1024));
    let mut fs = flash_fs();

    let mut csv = String::from("f0,f1,f2,f3,f4,f5,f6,f7,label\n");
    let mut rng = XorShiftRng::seed_from_u64(7);
    let rows = 1200usize;
    for i in 0..rows {
        let label = i % 2;
        for feature in 0..8 {
            let bin = if feature == 0 {
                label * 200
            } else {
                rng.gen_range(0..256)
            };
            csv.push_str(&format!("{bin},"));
        }
        csv.push_str(&format!("{label}\n"));
    }
    fs.write_all("/data/big.csv", csv.as_bytes()).unwrap();

    // A row costs 8 bytes of features plus a label byte; cap residency
    // well under the pool.
    let mut dataset =
        QuantizedDataset::new_in(8, 8, pool.clone(), RegionPolicy::Internal);
    let report = dataset
        .load_csv(
            &mut fs,
            "/data/big.csv",
            &LoadSpec {
                chunk_samples: 512,
                max_resident_rows: Some(600),
            },
        )
        .unwrap();

    assert!(report.partial);
    assert_eq!(report.rows_seen, rows);
    assert_eq!(report.rows_resident, 600);
    assert!(dataset.memory_usage() < 16 * 1024);

    let ctx = RuntimeContext::host();
    let config = ForestConfig {
        num_trees: 8,
        seed: Some(1),
        ..ForestConfig::default()
    };
    let forest = RandomForest::train(&dataset, &config, &ctx).unwrap();
    assert!(!forest.oob_score().is_nan());
    assert!(forest.oob_score() > 0.0);
    assert!(matches!(
        RandomForest::cross_validate(&dataset, 5, &config, &ctx),
        Err(ForestError::PartialMode(_))
    ));
}

#[test]
fn hundred_kilobyte_transfer_with_one_flipped_bit() {
    let mut fs = flash_fs();
    let mut receiver = TransferReceiver::new();
    let data: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    let crc = qforest_ml_stack::checksum::Crc32::of(&data);

    receiver
        .handle_frame(&mut fs, &frames::start_session())
        .unwrap();
    receiver
        .handle_frame(
            &mut fs,
            &frames::file_info("/incoming/model.bin", data.len() as u32, crc, 220),
        )
        .unwrap();

    let corrupt_chunk = 137usize;
    let mut nacks = 0usize;
    for (index, chunk) in data.chunks(220).enumerate() {
        let offset = (index * 220) as u32;
        let mut frame = frames::file_chunk(offset, chunk);
        if index == corrupt_chunk {
            let at = frame.len() - 10;
            frame[at] ^= 0x10; // single bit flip
            match receiver.handle_frame(&mut fs, &frame).unwrap() {
                Response::Nack(nacked) => {
                    assert_eq!(nacked, offset);
                    nacks += 1;
                }
                other => panic!("expected NACK, got {other:?}"),
            }
            // Sender retries the clean chunk.
            frame = frames::file_chunk(offset, chunk);
        }
        assert_eq!(
            receiver.handle_frame(&mut fs, &frame).unwrap(),
            Response::Ack(offset)
        );
    }
    assert_eq!(nacks, 1);
    assert_eq!(
        receiver
            .handle_frame(&mut fs, &frames::end_session())
            .unwrap(),
        Response::Ok
    );
    assert_eq!(
        fs.file_size("/incoming/model.bin").unwrap(),
        100 * 1024,
        "received size"
    );
    assert_eq!(fs.read_all("/incoming/model.bin").unwrap(), data);
}

#[test]
fn chained_set_reuses_deleted_shards() {
    let mut set: ChainedSet<u32> = ChainedSet::new();
    set.set_fullness(92).unwrap();

    // Keys spread over at least 10 distinct ranges.
    let keys: Vec<u32> = (0..600).collect();
    for &key in &keys {
        set.insert(key).unwrap();
    }
    assert!(set.chain_size() >= 10);
    assert_eq!(set.len(), keys.len());

    // Empty one key range completely, then reinsert it: the shard the
    // erase demoted to Deleted must absorb the reinsertion without a
    // fresh allocation, so the footprint never exceeds its pre-erase
    // size.
    let usage_before = set.memory_usage();
    let victim_range = set.key_range(&keys[0]).0;
    let erased: Vec<u32> = keys
        .iter()
        .copied()
        .filter(|key| set.key_range(key).0 == victim_range)
        .collect();
    assert!(!erased.is_empty());
    for key in &erased {
        assert!(set.erase(key));
    }
    for &key in &erased {
        set.insert(key).unwrap();
    }
    assert_eq!(set.len(), keys.len());
    assert!(
        set.memory_usage() <= usage_before,
        "reinsertion must reuse shards, not allocate"
    );

    // Every key still iterates exactly once.
    let mut seen: Vec<u32> = set.iter().copied().collect();
    seen.sort_unstable();
    assert_eq!(seen, keys);
}
