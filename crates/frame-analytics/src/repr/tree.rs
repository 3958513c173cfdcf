//! Decision tree with vector valued nodes.

use serde::{Deserialize, Serialize};

/// Structural validation errors for [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeValidationError {
    EmptyTree,
    ChildOutOfBounds { node: usize, child: usize, n_nodes: usize },
    ChildNotAfterParent { node: usize, child: usize },
    ValueLenMismatch { node: usize, expected: usize, len: usize },
}

/// Split of an internal node: `value < threshold` goes left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub feature: usize,
    pub threshold: f32,
    pub default_left: bool,
    pub gain: f64,
    pub left: usize,
    pub right: usize,
}

/// Tree node. Internal nodes keep the value a leaf at their position would
/// have, which path attributions use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub split: Option<Split>,
    pub value: Vec<f64>,
    pub number_samples: u64,
}

impl Node {
    pub fn leaf(value: Vec<f64>, number_samples: u64) -> Self {
        Self {
            split: None,
            value,
            number_samples,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.split.is_none()
    }
}

/// Nodes stored in pre-order; the root is node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Single leaf tree, used for the base score.
    pub fn constant(value: Vec<f64>, number_samples: u64) -> Self {
        Self::new(vec![Node::leaf(value, number_samples)])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn depth(&self) -> usize {
        fn depth_of(nodes: &[Node], node: usize) -> usize {
            match &nodes[node].split {
                None => 0,
                Some(split) => 1 + depth_of(nodes, split.left).max(depth_of(nodes, split.right)),
            }
        }
        if self.nodes.is_empty() { 0 } else { depth_of(&self.nodes, 0) }
    }

    /// Index of the leaf `features` falls into. Missing values follow the
    /// split's default direction.
    pub fn leaf_index(&self, features: &[f32]) -> usize {
        let mut node = 0;
        while let Some(split) = &self.nodes[node].split {
            node = if go_left(split, features) { split.left } else { split.right };
        }
        node
    }

    /// Nodes visited from the root to the leaf `features` falls into.
    pub fn path(&self, features: &[f32]) -> Vec<usize> {
        let mut path = vec![0];
        let mut node = 0;
        while let Some(split) = &self.nodes[node].split {
            node = if go_left(split, features) { split.left } else { split.right };
            path.push(node);
        }
        path
    }

    /// Add the leaf value for `features` to `output`.
    pub fn predict_into(&self, features: &[f32], output: &mut [f64]) {
        let leaf = &self.nodes[self.leaf_index(features)];
        for (out, value) in output.iter_mut().zip(&leaf.value) {
            *out += value;
        }
    }

    /// Check child indices and value lengths.
    pub fn validate(&self, n_outputs: usize) -> Result<(), TreeValidationError> {
        if self.nodes.is_empty() {
            return Err(TreeValidationError::EmptyTree);
        }
        let n_nodes = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.value.len() != n_outputs {
                return Err(TreeValidationError::ValueLenMismatch {
                    node: i,
                    expected: n_outputs,
                    len: node.value.len(),
                });
            }
            if let Some(split) = &node.split {
                for child in [split.left, split.right] {
                    if child >= n_nodes {
                        return Err(TreeValidationError::ChildOutOfBounds { node: i, child, n_nodes });
                    }
                    if child <= i {
                        return Err(TreeValidationError::ChildNotAfterParent { node: i, child });
                    }
                }
            }
        }
        Ok(())
    }
}

#[inline]
fn go_left(split: &Split, features: &[f32]) -> bool {
    match features.get(split.feature) {
        Some(value) if !value.is_nan() => *value < split.threshold,
        _ => split.default_left,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// x0 < 0.5 ? -1 : (x1 < 2 ? 1 : 2)
    pub(crate) fn two_level_tree() -> Tree {
        Tree::new(vec![
            Node {
                split: Some(Split { feature: 0, threshold: 0.5, default_left: true, gain: 4.0, left: 1, right: 2 }),
                value: vec![0.5],
                number_samples: 10,
            },
            Node::leaf(vec![-1.0], 4),
            Node {
                split: Some(Split { feature: 1, threshold: 2.0, default_left: false, gain: 1.0, left: 3, right: 4 }),
                value: vec![1.5],
                number_samples: 6,
            },
            Node::leaf(vec![1.0], 3),
            Node::leaf(vec![2.0], 3),
        ])
    }

    #[test]
    fn traversal() {
        let tree = two_level_tree();
        assert_eq!(tree.leaf_index(&[0.0, 0.0]), 1);
        assert_eq!(tree.leaf_index(&[1.0, 1.0]), 3);
        assert_eq!(tree.leaf_index(&[1.0, 3.0]), 4);
        assert_eq!(tree.path(&[1.0, 3.0]), vec![0, 2, 4]);
    }

    #[test]
    fn missing_values_follow_default() {
        let tree = two_level_tree();
        assert_eq!(tree.leaf_index(&[f32::NAN, 0.0]), 1);
        assert_eq!(tree.leaf_index(&[1.0, f32::NAN]), 4);
    }

    #[test]
    fn shape() {
        let tree = two_level_tree();
        assert_eq!(tree.n_nodes(), 5);
        assert_eq!(tree.n_leaves(), 3);
        assert_eq!(tree.depth(), 2);
        let mut out = [0.0];
        tree.predict_into(&[1.0, 3.0], &mut out);
        assert_eq!(out, [2.0]);
    }

    #[test]
    fn validation() {
        assert!(two_level_tree().validate(1).is_ok());
        assert_eq!(
            two_level_tree().validate(2),
            Err(TreeValidationError::ValueLenMismatch { node: 0, expected: 2, len: 1 })
        );
        assert_eq!(Tree::new(Vec::new()).validate(1), Err(TreeValidationError::EmptyTree));
        let mut nodes = two_level_tree().nodes().to_vec();
        if let Some(split) = nodes[2].split.as_mut() {
            split.right = 9;
        }
        assert_eq!(
            Tree::new(nodes).validate(1),
            Err(TreeValidationError::ChildOutOfBounds { node: 2, child: 9, n_nodes: 5 })
        );
    }
}
