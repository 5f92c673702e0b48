//! Bit-packed breadth-first decision trees.
//!
//! A tree is a dense array of fixed-width nodes, root at offset 0,
//! children placed in BFS order. The node width `W` is computed per
//! tree from the model constants and the node count, rounded up to a
//! multiple of 4 bits; the layout of the fields inside a node follows
//! deterministically from `(F, L, k, W)`, so the serialized form only
//! needs to carry `W` and `N`.
//!
//! Node encoding, least-significant bit first:
//!
//! ```text
//! split: tag=0 · feature:fb · threshold:k · left-offset:ob
//! leaf:  tag=1 · label:lb · padding
//! ```

use crate::containers::PackedVec;

use super::ForestError;

/// Bits to address `count` distinct values.
pub(crate) fn bits_for(count: u64) -> u8 {
    if count <= 2 {
        1
    } else {
        (64 - (count - 1).leading_zeros()) as u8
    }
}

/// Field widths of one packed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub feature_bits: u8,
    pub threshold_bits: u8,
    pub offset_bits: u8,
    pub label_bits: u8,
    /// Total node width `W`.
    pub node_width: u8,
}

impl NodeLayout {
    /// Minimal layout for a model with `num_features` features,
    /// `num_labels` labels, coefficient `k` and `max_nodes` nodes.
    pub fn for_model(num_features: u16, num_labels: u8, k: u8, max_nodes: u32) -> Self {
        let feature_bits = bits_for(num_features as u64);
        let threshold_bits = k;
        let offset_min = bits_for(max_nodes as u64);
        let label_bits = bits_for(num_labels as u64);
        let split_width = 1 + feature_bits + threshold_bits + offset_min;
        let leaf_width = 1 + label_bits;
        // Round up to a multiple of 4; the spare bits widen the offset
        // field.
        let node_width = (split_width.max(leaf_width) + 3) / 4 * 4;
        NodeLayout {
            feature_bits,
            threshold_bits,
            offset_bits: node_width - 1 - feature_bits - threshold_bits,
            label_bits,
            node_width,
        }
    }

    /// Reconstructs the layout of a serialized tree from its stored
    /// width.
    pub fn from_width(
        num_features: u16,
        num_labels: u8,
        k: u8,
        node_width: u8,
    ) -> Result<Self, ForestError> {
        let feature_bits = bits_for(num_features as u64);
        let threshold_bits = k;
        let label_bits = bits_for(num_labels as u64);
        if node_width as usize > 64
            || node_width < 1 + feature_bits + threshold_bits + 1
            || node_width < 1 + label_bits
        {
            return Err(ForestError::CorruptTree("node width too narrow"));
        }
        Ok(NodeLayout {
            feature_bits,
            threshold_bits,
            offset_bits: node_width - 1 - feature_bits - threshold_bits,
            label_bits,
            node_width,
        })
    }
}

/// One decoded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeView {
    Split {
        feature: u16,
        threshold: u16,
        /// BFS offset of the left child; the right child is `left + 1`.
        left: u32,
    },
    Leaf {
        label: u8,
    },
}

/// A trained tree in its packed wire form.
pub struct PackedTree {
    layout: NodeLayout,
    nodes: PackedVec,
}

impl PackedTree {
    /// Packs a BFS node list produced by the trainer.
    pub fn from_nodes(
        num_features: u16,
        num_labels: u8,
        k: u8,
        views: &[NodeView],
    ) -> Result<Self, ForestError> {
        let layout = NodeLayout::for_model(num_features, num_labels, k, views.len() as u32);
        let mut nodes = PackedVec::new(layout.node_width);
        nodes.reserve(views.len())?;
        let mut tree = PackedTree { layout, nodes };
        for &view in views {
            let raw = tree.encode(view);
            tree.nodes.push(raw)?;
        }
        tree.verify(num_features, num_labels)?;
        Ok(tree)
    }

    /// Rebuilds a tree from its packed payload.
    pub fn from_bytes(
        num_features: u16,
        num_labels: u8,
        k: u8,
        node_width: u8,
        node_count: u32,
        bytes: &[u8],
    ) -> Result<Self, ForestError> {
        let layout = NodeLayout::from_width(num_features, num_labels, k, node_width)?;
        let expected = PackedVec::payload_bytes(node_width, node_count as usize);
        if bytes.len() < expected {
            return Err(ForestError::CorruptTree("payload shorter than node count"));
        }
        let nodes = PackedVec::from_bytes(
            node_width,
            node_count as usize,
            bytes,
            crate::allocator::default_pool(),
            crate::allocator::RegionPolicy::Any,
        )?;
        let tree = PackedTree { layout, nodes };
        tree.verify(num_features, num_labels)?;
        Ok(tree)
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn node_width(&self) -> u8 {
        self.layout.node_width
    }

    /// The packed node payload, for serialization.
    pub fn as_bytes(&self) -> &[u8] {
        self.nodes.as_bytes()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.nodes.memory_usage()
    }

    fn encode(&self, view: NodeView) -> u64 {
        let l = self.layout;
        match view {
            NodeView::Leaf { label } => 1 | (label as u64) << 1,
            NodeView::Split {
                feature,
                threshold,
                left,
            } => {
                let mut raw = (feature as u64) << 1;
                raw |= (threshold as u64) << (1 + l.feature_bits);
                raw |= (left as u64) << (1 + l.feature_bits + l.threshold_bits);
                raw
            }
        }
    }

    /// Decodes the node at `offset`.
    pub fn read_node(&self, offset: u32) -> NodeView {
        let l = self.layout;
        let raw = self.nodes.get(offset as usize);
        if raw & 1 == 1 {
            NodeView::Leaf {
                label: ((raw >> 1) & mask(l.label_bits)) as u8,
            }
        } else {
            NodeView::Split {
                feature: ((raw >> 1) & mask(l.feature_bits)) as u16,
                threshold: ((raw >> (1 + l.feature_bits)) & mask(l.threshold_bits)) as u16,
                left: ((raw >> (1 + l.feature_bits + l.threshold_bits)) & mask(l.offset_bits))
                    as u32,
            }
        }
    }

    /// Checks the BFS invariants of every node.
    ///
    /// A violation marks the tree unusable; the caller discards it.
    pub fn verify(&self, num_features: u16, num_labels: u8) -> Result<(), ForestError> {
        let count = self.node_count();
        if count == 0 {
            return Err(ForestError::CorruptTree("empty tree"));
        }
        for offset in 0..count {
            match self.read_node(offset) {
                NodeView::Leaf { label } => {
                    if label as usize >= num_labels.max(1) as usize {
                        return Err(ForestError::CorruptTree("leaf label out of range"));
                    }
                }
                NodeView::Split { feature, left, .. } => {
                    if feature >= num_features {
                        return Err(ForestError::CorruptTree("split feature out of range"));
                    }
                    if left <= offset || left + 1 >= count {
                        return Err(ForestError::CorruptTree("child offset breaks BFS order"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Walks the tree for one sample.
    ///
    /// `sample` maps a feature index to its quantized value. Reads at
    /// most `depth + 1` nodes and never allocates.
    pub fn walk<S: Fn(u16) -> u16>(&self, sample: S) -> Result<u8, ForestError> {
        let count = self.node_count();
        let mut offset = 0u32;
        loop {
            match self.read_node(offset) {
                NodeView::Leaf { label } => return Ok(label),
                NodeView::Split {
                    feature,
                    threshold,
                    left,
                } => {
                    // verify() bounds offsets on load; this guards trees
                    // mutated after the fact.
                    if left <= offset || left + 1 >= count {
                        return Err(ForestError::CorruptTree("walk escaped the node array"));
                    }
                    offset = if sample(feature) <= threshold {
                        left
                    } else {
                        left + 1
                    };
                }
            }
        }
    }
}

fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl std::fmt::Debug for PackedTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedTree")
            .field("nodes", &self.node_count())
            .field("width", &self.layout.node_width)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree() -> PackedTree {
        // root splits feature 1 at threshold 2; left leaf "0", right
        // splits feature 0 at 1 into leaves "1" / "2".
        let views = [
            NodeView::Split {
                feature: 1,
                threshold: 2,
                left: 1,
            },
            NodeView::Leaf { label: 0 },
            NodeView::Split {
                feature: 0,
                threshold: 1,
                left: 3,
            },
            NodeView::Leaf { label: 1 },
            NodeView::Leaf { label: 2 },
        ];
        PackedTree::from_nodes(4, 3, 2, &views).unwrap()
    }

    #[test]
    fn width_is_a_multiple_of_four() {
        let layout = NodeLayout::for_model(4, 3, 2, 5);
        assert_eq!(layout.node_width % 4, 0);
        // tag 1 + feature 2 + threshold 2 + offset 3 = 8.
        assert_eq!(layout.node_width, 8);
        assert_eq!(layout.offset_bits, 3);
    }

    #[test]
    fn nodes_round_trip_through_packing() {
        let tree = small_tree();
        assert_eq!(
            tree.read_node(0),
            NodeView::Split {
                feature: 1,
                threshold: 2,
                left: 1
            }
        );
        assert_eq!(tree.read_node(1), NodeView::Leaf { label: 0 });
        assert_eq!(tree.read_node(4), NodeView::Leaf { label: 2 });
    }

    #[test]
    fn walk_follows_comparisons() {
        let tree = small_tree();
        // feature1 <= 2 -> leaf 0.
        assert_eq!(tree.walk(|f| [0, 1][f as usize]).unwrap(), 0);
        // feature1 > 2, feature0 <= 1 -> leaf 1.
        assert_eq!(tree.walk(|f| [1, 3][f as usize]).unwrap(), 1);
        // feature1 > 2, feature0 > 1 -> leaf 2.
        assert_eq!(tree.walk(|f| [2, 3][f as usize]).unwrap(), 2);
    }

    #[test]
    fn bytes_round_trip() {
        let tree = small_tree();
        let restored = PackedTree::from_bytes(
            4,
            3,
            2,
            tree.node_width(),
            tree.node_count(),
            tree.as_bytes(),
        )
        .unwrap();
        assert_eq!(restored.as_bytes(), tree.as_bytes());
        assert_eq!(restored.walk(|_| 0).unwrap(), tree.walk(|_| 0).unwrap());
    }

    #[test]
    fn verify_rejects_backward_offsets() {
        let views = [
            NodeView::Split {
                feature: 0,
                threshold: 1,
                left: 1,
            },
            NodeView::Leaf { label: 0 },
            NodeView::Leaf { label: 0 },
        ];
        let tree = PackedTree::from_nodes(2, 2, 2, &views).unwrap();
        let mut bytes = tree.as_bytes().to_vec();
        // Corrupt the root so its left offset reads 0.
        bytes[0] = 0;
        assert!(matches!(
            PackedTree::from_bytes(2, 2, 2, tree.node_width(), tree.node_count(), &bytes),
            Err(ForestError::CorruptTree(_))
        ));
    }

    #[test]
    fn single_leaf_tree_is_valid() {
        let tree = PackedTree::from_nodes(1, 1, 1, &[NodeView::Leaf { label: 0 }]).unwrap();
        assert_eq!(tree.walk(|_| 0).unwrap(), 0);
    }
}
