//! Bagged random forests over packed trees.
//!
//! Training draws one bootstrap bag per tree, trains sequentially (a
//! suspension point follows every tree), and keeps the out-of-bag
//! votes for a free validation estimate. Inference walks every tree and
//! aggregates votes without touching the heap for models with up to
//! [`STACK_VOTE_LABELS`] labels.

use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    allocator::AllocError,
    containers::{ContainerError, PackedVec},
    dataset::{DatasetError, LabelRegistry, QuantizedDataset},
    platform::RuntimeContext,
    quantizer::{DriftReport, Quantizer, QuantizerError},
    storage::StorageError,
};

mod format;
#[cfg(feature = "training")]
mod train;
mod tree;

pub use format::ForestMeta;
pub use tree::{NodeLayout, NodeView, PackedTree};

/// Label-count ceiling for the stack-allocated vote counter.
pub const STACK_VOTE_LABELS: usize = 32;

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Quantizer(#[from] QuantizerError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("config side-file error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a forest blob (bad magic)")]
    BadMagic,
    #[error("unsupported forest format version {0}")]
    UnsupportedVersion(u16),
    #[error("corrupt tree: {0}")]
    CorruptTree(&'static str),
    #[error("forest poisoned by an earlier invariant breach")]
    Poisoned,
    #[error("operation {0} requires the full dataset in RAM (partial-loading mode active)")]
    PartialMode(&'static str),
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("no quantizer attached; raw feature vectors cannot be encoded")]
    MissingQuantizer,
    #[error("cross-validation needs 2..=len folds, got {0}")]
    InvalidFolds(usize),
}

/// Training-time knobs.
#[derive(Debug, Clone)]
pub struct ForestConfig {
    pub num_trees: u16,
    /// Features sampled per node; defaults to `floor(sqrt(F))`.
    pub mtry: Option<u16>,
    pub max_depth: u16,
    pub min_leaf: usize,
    /// RNG seed; drawn from the platform entropy when absent.
    pub seed: Option<u64>,
    /// Report per-tree votes from `predict`.
    pub collect_votes: bool,
    /// Optional whole-training deadline in microseconds.
    pub train_deadline_micros: Option<u64>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            num_trees: 20,
            mtry: None,
            max_depth: 16,
            min_leaf: 1,
            seed: None,
            collect_votes: false,
            train_deadline_micros: None,
        }
    }
}

/// Per-tree training statistics, kept for the CSV training log.
#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    pub nodes: u32,
    pub depth: u16,
    pub leaves: u32,
    pub oob_samples: u32,
}

/// One inference result.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub label: u8,
    pub label_name: Option<String>,
    /// Per-label vote counts, when configured.
    pub votes: Option<Vec<u16>>,
    /// The label each tree voted, in tree order, when configured.
    pub tree_votes: Option<Vec<u8>>,
    /// Wall micros spent in quantize + walk + aggregate.
    pub micros: u64,
    /// Drift observed while quantizing the input.
    pub drift: DriftReport,
}

/// A trained (or loaded) forest plus everything needed to run it.
pub struct RandomForest {
    num_features: u16,
    num_labels: u8,
    k: u8,
    trees: Vec<PackedTree>,
    labels: LabelRegistry,
    quantizer: Option<Quantizer>,
    mtry: u16,
    max_depth: u16,
    min_leaf: usize,
    collect_votes: bool,
    oob_score: f32,
    best_training_score: f32,
    built_at: String,
    stats: Vec<TreeStats>,
    warmed: bool,
    /// Set on the first invariant breach; all later operations refuse.
    poisoned: AtomicBool,
}

impl RandomForest {
    pub fn num_trees(&self) -> u16 {
        self.trees.len() as u16
    }

    pub fn num_features(&self) -> u16 {
        self.num_features
    }

    pub fn num_labels(&self) -> u8 {
        self.num_labels
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn mtry(&self) -> u16 {
        self.mtry
    }

    pub fn labels(&self) -> &LabelRegistry {
        &self.labels
    }

    pub fn oob_score(&self) -> f32 {
        self.oob_score
    }

    pub fn best_training_score(&self) -> f32 {
        self.best_training_score
    }

    pub fn built_at(&self) -> &str {
        &self.built_at
    }

    pub fn tree_stats(&self) -> &[TreeStats] {
        &self.stats
    }

    pub fn quantizer(&self) -> Option<&Quantizer> {
        self.quantizer.as_ref()
    }

    pub fn attach_quantizer(&mut self, quantizer: Quantizer) {
        self.quantizer = Some(quantizer);
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .trees
                .iter()
                .map(|tree| tree.memory_usage())
                .sum::<usize>()
    }

    fn check_poisoned(&self) -> Result<(), ForestError> {
        if self.poisoned.load(Ordering::Relaxed) {
            Err(ForestError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Relaxed);
        log::error!("forest poisoned: refusing further inference");
    }

    /// Runs a constant inference through every tree to prime caches and
    /// pool pools before the first timed prediction. Idempotent.
    pub fn warmup(&mut self) -> Result<(), ForestError> {
        if self.warmed {
            return Ok(());
        }
        self.check_poisoned()?;
        for tree in &self.trees {
            tree.walk(|_| 0).map_err(|err| {
                self.poison();
                err
            })?;
        }
        self.warmed = true;
        log::debug!("forest warmed up over {} trees", self.trees.len());
        Ok(())
    }

    /// Walks every tree in construction order, feeding each vote to
    /// `visit`.
    fn walk_all<S: Fn(u16) -> u16 + Copy>(
        &self,
        sample: S,
        mut visit: impl FnMut(u8),
    ) -> Result<(), ForestError> {
        self.check_poisoned()?;
        for tree in &self.trees {
            let label = tree.walk(sample).map_err(|err| {
                self.poison();
                err
            })?;
            visit(label);
        }
        Ok(())
    }

    /// Aggregated majority vote; ties break to the lowest label id.
    ///
    /// The fast path counts into a stack array and never allocates;
    /// label spaces wider than [`STACK_VOTE_LABELS`] fall back to a
    /// small heap map. `counts_out` and `per_tree` are filled only when
    /// the caller asked for vote reporting.
    fn majority_vote<S: Fn(u16) -> u16 + Copy>(
        &self,
        sample: S,
        mut counts_out: Option<&mut Vec<u16>>,
        mut per_tree: Option<&mut Vec<u8>>,
    ) -> Result<u8, ForestError> {
        let num_labels = self.num_labels.max(1) as usize;
        if num_labels <= STACK_VOTE_LABELS {
            let mut counts = [0u16; STACK_VOTE_LABELS];
            self.walk_all(sample, |label| {
                counts[label as usize] += 1;
                if let Some(list) = per_tree.as_deref_mut() {
                    list.push(label);
                }
            })?;
            if let Some(out) = counts_out.as_deref_mut() {
                out.extend_from_slice(&counts[..num_labels]);
            }
            Ok(argmax_u16(&counts[..num_labels]))
        } else {
            let mut counts: FxHashMap<u8, u16> = FxHashMap::default();
            self.walk_all(sample, |label| {
                *counts.entry(label).or_default() += 1;
                if let Some(list) = per_tree.as_deref_mut() {
                    list.push(label);
                }
            })?;
            let mut dense = vec![0u16; num_labels];
            for (label, count) in counts {
                if (label as usize) < num_labels {
                    dense[label as usize] = count;
                }
            }
            let winner = argmax_u16(&dense);
            if let Some(out) = counts_out.as_deref_mut() {
                out.extend_from_slice(&dense);
            }
            Ok(winner)
        }
    }

    /// Classifies a pre-quantized row. Allocation-free for label
    /// spaces up to [`STACK_VOTE_LABELS`].
    pub fn predict_row(&self, row: &PackedVec) -> Result<u8, ForestError> {
        self.majority_vote(|feature| row.get(feature as usize) as u16, None, None)
    }

    /// Quantizes and classifies a raw feature vector.
    pub fn predict(&self, x: &[f32], ctx: &RuntimeContext) -> Result<Prediction, ForestError> {
        let started = ctx.micros();
        let quantizer = self.quantizer.as_ref().ok_or(ForestError::MissingQuantizer)?;
        let (row, drift) = quantizer.encode(x)?;
        let mut counts = self.collect_votes.then(Vec::new);
        let mut tree_votes = self
            .collect_votes
            .then(|| Vec::with_capacity(self.trees.len()));
        let label = self.majority_vote(
            |feature| row.get(feature as usize) as u16,
            counts.as_mut(),
            tree_votes.as_mut(),
        )?;
        let micros = ctx.micros() - started;
        Ok(Prediction {
            label,
            label_name: self.labels.name(label).map(str::to_string),
            votes: counts,
            tree_votes,
            micros,
            drift,
        })
    }

    /// Training-set accuracy; refused in partial-loading mode, where
    /// the resident window no longer represents the full dataset.
    pub fn score(&self, dataset: &QuantizedDataset) -> Result<f32, ForestError> {
        if dataset.is_partial() {
            return Err(ForestError::PartialMode("score"));
        }
        self.score_window(dataset)
    }

    fn score_window(&self, dataset: &QuantizedDataset) -> Result<f32, ForestError> {
        if dataset.is_empty() {
            return Err(ForestError::EmptyTrainingSet);
        }
        let mut hits = 0usize;
        for sample in 0..dataset.len() {
            let label =
                self.majority_vote(|feature| dataset.get_feature(sample, feature), None, None)?;
            if label == dataset.get_label(sample) {
                hits += 1;
            }
        }
        Ok(hits as f32 / dataset.len() as f32)
    }
}

fn argmax_u16(counts: &[u16]) -> u8 {
    let mut best = 0usize;
    let mut best_count = 0u16;
    for (label, &count) in counts.iter().enumerate() {
        if count > best_count {
            best_count = count;
            best = label;
        }
    }
    best as u8
}

#[cfg(feature = "training")]
mod training_api {
    use rand::{rngs::StdRng, SeedableRng};

    use super::train::{train_tree, TrainParams};
    use super::*;
    use crate::containers::IdVec;

    impl RandomForest {
        /// Trains a forest on the resident dataset.
        ///
        /// In partial-loading mode the trainer works on the sliding
        /// window and the reported score is the OOB estimate; the
        /// training-set score is left at the OOB value there.
        pub fn train(
            dataset: &QuantizedDataset,
            config: &ForestConfig,
            ctx: &RuntimeContext,
        ) -> Result<RandomForest, ForestError> {
            if dataset.is_empty() {
                return Err(ForestError::EmptyTrainingSet);
            }
            let n = dataset.len();
            let num_labels = dataset.num_labels().max(1);
            let mtry = config
                .mtry
                .unwrap_or_else(|| (dataset.num_features() as f32).sqrt() as u16)
                .clamp(1, dataset.num_features());
            let seed = config.seed.unwrap_or_else(|| ctx.entropy_seed());
            let mut rng = StdRng::seed_from_u64(seed);
            let deadline = config
                .train_deadline_micros
                .map(|micros| ctx.deadline_after(micros));

            let mut trees = Vec::with_capacity(config.num_trees as usize);
            let mut stats = Vec::with_capacity(config.num_trees as usize);
            let mut oob_votes = vec![0u16; n * num_labels as usize];
            let mut bag = vec![0u32; n];

            for index in 0..config.num_trees {
                // Bootstrap: n draws with replacement, counted so the
                // out-of-bag complement falls out for free.
                let mut in_bag = IdVec::new(n as u64 - 1, 4)?;
                for slot in bag.iter_mut() {
                    let draw = dataset.bag_sample(&mut rng) as u32;
                    *slot = draw;
                    in_bag.push(draw as u64);
                }
                let params = TrainParams {
                    mtry,
                    max_depth: config.max_depth,
                    min_leaf: config.min_leaf,
                    deadline: deadline.clone(),
                };
                let trained = train_tree(dataset, &mut bag, &params, &mut rng)?;

                let mut oob_samples = 0u32;
                for sample in 0..n {
                    if in_bag.contains(sample as u64) {
                        continue;
                    }
                    oob_samples += 1;
                    let label = trained
                        .tree
                        .walk(|feature| dataset.get_feature(sample, feature))?;
                    oob_votes[sample * num_labels as usize + label as usize] += 1;
                }
                stats.push(TreeStats {
                    nodes: trained.tree.node_count(),
                    depth: trained.depth,
                    leaves: trained.leaf_count,
                    oob_samples,
                });
                trees.push(trained.tree);
                // Suspension point between trees for the cooperative
                // caller.
                log::trace!(
                    "tree {index}: {} nodes, depth {}",
                    stats[index as usize].nodes,
                    stats[index as usize].depth
                );
                if trained.partial {
                    log::warn!("training deadline reached after tree {index}");
                    break;
                }
            }

            let oob_score = oob_accuracy(dataset, &oob_votes, num_labels);
            let built_at = format!(
                "unix:{}",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            );
            let mut forest = RandomForest {
                num_features: dataset.num_features(),
                num_labels,
                k: dataset.k(),
                trees,
                labels: dataset.labels().clone(),
                quantizer: None,
                mtry,
                max_depth: config.max_depth,
                min_leaf: config.min_leaf,
                collect_votes: config.collect_votes,
                oob_score,
                best_training_score: oob_score,
                built_at,
                stats,
                warmed: false,
                poisoned: AtomicBool::new(false),
            };
            if !dataset.is_partial() {
                forest.best_training_score = forest.score_window(dataset)?;
            }
            Ok(forest)
        }

        /// Mean k-fold accuracy. Requires the full dataset in RAM.
        pub fn cross_validate(
            dataset: &QuantizedDataset,
            folds: usize,
            config: &ForestConfig,
            ctx: &RuntimeContext,
        ) -> Result<f32, ForestError> {
            if dataset.is_partial() {
                return Err(ForestError::PartialMode("cross_validate"));
            }
            let n = dataset.len();
            if folds < 2 || folds > n {
                return Err(ForestError::InvalidFolds(folds));
            }
            let mut accuracy_sum = 0.0f32;
            let mut row = vec![0u16; dataset.num_features() as usize];
            for fold in 0..folds {
                let mut train_set =
                    QuantizedDataset::new(dataset.num_features(), dataset.k());
                let mut test_set =
                    QuantizedDataset::new(dataset.num_features(), dataset.k());
                for name in dataset.labels().iter() {
                    train_set.labels_mut().register(name);
                    test_set.labels_mut().register(name);
                }
                for sample in 0..n {
                    for feature in 0..dataset.num_features() {
                        row[feature as usize] = dataset.get_feature(sample, feature);
                    }
                    let target = if sample % folds == fold {
                        &mut test_set
                    } else {
                        &mut train_set
                    };
                    target.push_row(&row, dataset.get_label(sample))?;
                }
                let forest = RandomForest::train(&train_set, config, ctx)?;
                accuracy_sum += forest.score_window(&test_set)?;
            }
            Ok(accuracy_sum / folds as f32)
        }
    }

    fn oob_accuracy(dataset: &QuantizedDataset, votes: &[u16], num_labels: u8) -> f32 {
        let stride = num_labels as usize;
        let mut scored = 0usize;
        let mut hits = 0usize;
        for sample in 0..dataset.len() {
            let counts = &votes[sample * stride..(sample + 1) * stride];
            if counts.iter().all(|&count| count == 0) {
                continue;
            }
            scored += 1;
            if argmax_u16(counts) == dataset.get_label(sample) {
                hits += 1;
            }
        }
        if scored == 0 {
            0.0
        } else {
            hits as f32 / scored as f32
        }
    }
}
