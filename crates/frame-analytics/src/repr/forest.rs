//! Forest of trees sharing one output dimension.

use serde::{Deserialize, Serialize};

use super::tree::{Tree, TreeValidationError};
use super::visitor::ModelVisitor;

/// Structural validation errors for [`Forest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForestValidationError {
    NoOutputs,
    InvalidTree { tree_idx: usize, error: TreeValidationError },
}

/// Trees whose leaf values are summed into `n_outputs` raw scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forest {
    trees: Vec<Tree>,
    n_outputs: usize,
}

impl Forest {
    pub fn new(n_outputs: usize) -> Self {
        Self {
            trees: Vec::new(),
            n_outputs,
        }
    }

    pub fn push_tree(&mut self, tree: Tree) {
        self.trees.push(tree);
    }

    /// Drop trees beyond the first `n_trees`.
    pub fn truncate(&mut self, n_trees: usize) {
        self.trees.truncate(n_trees);
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    #[inline]
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    pub fn tree(&self, idx: usize) -> &Tree {
        &self.trees[idx]
    }

    pub fn trees(&self) -> impl Iterator<Item = &Tree> {
        self.trees.iter()
    }

    /// Sum of leaf values for one row of encoded features.
    pub fn predict_raw(&self, features: &[f32]) -> Vec<f64> {
        let mut output = vec![0.0; self.n_outputs];
        for tree in &self.trees {
            tree.predict_into(features, &mut output);
        }
        output
    }

    /// Approximate in-memory size in bytes.
    pub fn memory_usage(&self) -> u64 {
        let per_node = std::mem::size_of::<super::Node>() + self.n_outputs * std::mem::size_of::<f64>();
        self.trees
            .iter()
            .map(|tree| (tree.n_nodes() * per_node) as u64)
            .sum()
    }

    pub fn validate(&self) -> Result<(), ForestValidationError> {
        if self.n_outputs == 0 {
            return Err(ForestValidationError::NoOutputs);
        }
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            tree.validate(self.n_outputs)
                .map_err(|error| ForestValidationError::InvalidTree { tree_idx, error })?;
        }
        Ok(())
    }

    /// Replay every tree, node by node in pre-order, into `visitor`.
    pub fn accept(&self, visitor: &mut dyn ModelVisitor) {
        for tree in &self.trees {
            visitor.add_tree();
            for node in tree.nodes() {
                match &node.split {
                    Some(split) => visitor.add_node(
                        split.feature,
                        f64::from(split.threshold),
                        split.default_left,
                        &node.value,
                        split.gain,
                        node.number_samples,
                        Some(split.left),
                        Some(split.right),
                    ),
                    None => visitor.add_node(0, 0.0, false, &node.value, 0.0, node.number_samples, None, None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repr::tree::tests::two_level_tree;

    #[test]
    fn predictions_sum_trees() {
        let mut forest = Forest::new(1);
        forest.push_tree(Tree::constant(vec![0.5], 10));
        forest.push_tree(two_level_tree());
        assert_eq!(forest.predict_raw(&[1.0, 3.0]), vec![2.5]);
        assert_eq!(forest.n_trees(), 2);
        assert!(forest.memory_usage() > 0);
        forest.truncate(1);
        assert_eq!(forest.predict_raw(&[1.0, 3.0]), vec![0.5]);
    }

    #[test]
    fn validation_reports_tree_index() {
        let mut forest = Forest::new(2);
        forest.push_tree(Tree::constant(vec![0.0, 0.0], 1));
        forest.push_tree(two_level_tree());
        assert!(matches!(
            forest.validate(),
            Err(ForestValidationError::InvalidTree { tree_idx: 1, .. })
        ));
        assert_eq!(Forest::new(0).validate(), Err(ForestValidationError::NoOutputs));
    }
}
