//! Single-tree training: Gini splits over quantized thresholds.

use itertools::Itertools;
use rand::{rngs::StdRng, seq::index::sample as index_sample};

use crate::{
    containers::PoolDeque, dataset::QuantizedDataset, forest::ForestError, platform::Deadline,
};

use super::tree::{NodeView, PackedTree};

pub(crate) struct TrainParams {
    pub mtry: u16,
    pub max_depth: u16,
    pub min_leaf: usize,
    pub deadline: Option<Deadline>,
}

pub(crate) struct TrainedTree {
    pub tree: PackedTree,
    pub depth: u16,
    pub leaf_count: u32,
    /// True when a deadline cut training short and the remaining
    /// frontier was finalised as leaves.
    pub partial: bool,
}

struct WorkItem {
    start: usize,
    len: usize,
    depth: u16,
}

/// Per-tree scratch, allocated once and reused for every node so the
/// per-node hot path stays allocation-free.
struct Scratch {
    /// `bins × labels` histogram, row-major by bin.
    bin_label: Vec<u32>,
    /// Per-label totals of the current node.
    totals: Vec<u32>,
    /// Left-side per-label counts while sweeping thresholds.
    left: Vec<u32>,
}

fn gini_term(counts: &[u32], n: f64) -> f64 {
    let mut sum_sq = 0.0;
    for &count in counts {
        let p = count as f64 / n;
        sum_sq += p * p;
    }
    1.0 - sum_sq
}

/// Trains one tree over the bagged sample indices.
///
/// `bag` is partitioned in place as the tree grows; the caller keeps it
/// only to know which samples were in the bag.
pub(crate) fn train_tree(
    dataset: &QuantizedDataset,
    bag: &mut [u32],
    params: &TrainParams,
    rng: &mut StdRng,
) -> Result<TrainedTree, ForestError> {
    if bag.is_empty() {
        return Err(ForestError::EmptyTrainingSet);
    }
    let num_features = dataset.num_features() as usize;
    let num_labels = dataset.num_labels().max(1) as usize;
    let groups = 1usize << dataset.k();
    let mtry = (params.mtry as usize).clamp(1, num_features);

    let mut scratch = Scratch {
        bin_label: vec![0; groups * num_labels],
        totals: vec![0; num_labels],
        left: vec![0; num_labels],
    };

    let mut work: PoolDeque<WorkItem> = PoolDeque::new();
    work.push_back(WorkItem {
        start: 0,
        len: bag.len(),
        depth: 0,
    })?;

    let mut views: Vec<NodeView> = Vec::new();
    let mut enqueued: u32 = 1;
    let mut max_depth_seen: u16 = 0;
    let mut leaf_count: u32 = 0;
    let mut expired = false;

    while let Some(item) = work.pop_front() {
        max_depth_seen = max_depth_seen.max(item.depth);
        let segment = &bag[item.start..item.start + item.len];

        scratch.totals.iter_mut().for_each(|c| *c = 0);
        for &sample in segment {
            scratch.totals[dataset.get_label(sample as usize) as usize] += 1;
        }
        let (majority, pure) = majority_label(&scratch.totals);

        if !expired {
            if let Some(deadline) = &params.deadline {
                if deadline.expired() {
                    log::warn!("tree training deadline expired, finalising frontier as leaves");
                    expired = true;
                }
            }
        }

        let terminal = expired
            || pure
            || item.depth >= params.max_depth
            || item.len <= params.min_leaf;
        if terminal {
            views.push(NodeView::Leaf { label: majority });
            leaf_count += 1;
            continue;
        }

        let best = best_split(dataset, segment, &mut scratch, mtry, rng, groups, num_labels);
        let (feature, threshold) = match best {
            Some(split) => split,
            None => {
                // No positive-gain split exists; close the node.
                views.push(NodeView::Leaf { label: majority });
                leaf_count += 1;
                continue;
            }
        };

        let mid = partition(
            &mut bag[item.start..item.start + item.len],
            dataset,
            feature,
            threshold,
        );
        debug_assert!(mid > 0 && mid < item.len, "degenerate split slipped through");

        views.push(NodeView::Split {
            feature,
            threshold,
            left: enqueued,
        });
        work.push_back(WorkItem {
            start: item.start,
            len: mid,
            depth: item.depth + 1,
        })?;
        work.push_back(WorkItem {
            start: item.start + mid,
            len: item.len - mid,
            depth: item.depth + 1,
        })?;
        enqueued += 2;
    }

    let tree = PackedTree::from_nodes(
        dataset.num_features(),
        dataset.num_labels().max(1),
        dataset.k(),
        &views,
    )?;
    Ok(TrainedTree {
        tree,
        depth: max_depth_seen,
        leaf_count,
        partial: expired,
    })
}

fn majority_label(totals: &[u32]) -> (u8, bool) {
    let mut best = 0usize;
    let mut best_count = 0u32;
    let mut live_labels = 0usize;
    for (label, &count) in totals.iter().enumerate() {
        if count > 0 {
            live_labels += 1;
        }
        if count > best_count {
            best_count = count;
            best = label;
        }
    }
    (best as u8, live_labels <= 1)
}

/// Scans `mtry` sampled features across every quantized threshold and
/// returns the best positive-gain split.
fn best_split(
    dataset: &QuantizedDataset,
    segment: &[u32],
    scratch: &mut Scratch,
    mtry: usize,
    rng: &mut StdRng,
    groups: usize,
    num_labels: usize,
) -> Option<(u16, u16)> {
    let n = segment.len() as f64;
    let parent_gini = gini_term(&scratch.totals, n);

    // Ascending feature order keeps the lowest-id winner on gain ties.
    let candidates: Vec<usize> = index_sample(rng, dataset.num_features() as usize, mtry)
        .into_iter()
        .sorted()
        .collect();

    let mut best: Option<(u16, u16)> = None;
    let mut best_gain = 0.0f64;

    for feature in candidates {
        scratch.bin_label.iter_mut().for_each(|c| *c = 0);
        for &sample in segment {
            let bin = dataset.get_feature(sample as usize, feature as u16) as usize;
            scratch.bin_label[bin * num_labels
                + dataset.get_label(sample as usize) as usize] += 1;
        }

        scratch.left.iter_mut().for_each(|c| *c = 0);
        let mut n_left = 0u32;
        // Threshold t sends bins <= t to the left; the top threshold
        // would send everything left and is skipped.
        for threshold in 0..groups - 1 {
            let row = &scratch.bin_label[threshold * num_labels..(threshold + 1) * num_labels];
            for (label, &count) in row.iter().enumerate() {
                scratch.left[label] += count;
                n_left += count;
            }
            if n_left == 0 {
                continue;
            }
            let n_right = segment.len() as u32 - n_left;
            if n_right == 0 {
                break;
            }
            let mut gini_left = 0.0;
            let mut gini_right = 0.0;
            let nl = n_left as f64;
            let nr = n_right as f64;
            for (label, &left_count) in scratch.left.iter().enumerate() {
                let right_count = scratch.totals[label] - left_count;
                let pl = left_count as f64 / nl;
                let pr = right_count as f64 / nr;
                gini_left += pl * pl;
                gini_right += pr * pr;
            }
            let weighted = nl / n * (1.0 - gini_left) + nr / n * (1.0 - gini_right);
            let gain = parent_gini - weighted;
            if gain > best_gain {
                best_gain = gain;
                best = Some((feature as u16, threshold as u16));
            }
        }
    }
    best
}

/// Two-pointer in-place partition: samples with `value <= threshold`
/// move to the front. Returns the left-side length.
fn partition(
    segment: &mut [u32],
    dataset: &QuantizedDataset,
    feature: u16,
    threshold: u16,
) -> usize {
    let mut left = 0usize;
    let mut right = segment.len();
    while left < right {
        if dataset.get_feature(segment[left] as usize, feature) <= threshold {
            left += 1;
        } else {
            right -= 1;
            segment.swap(left, right);
        }
    }
    left
}
