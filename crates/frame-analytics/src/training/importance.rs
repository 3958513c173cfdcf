//! Per-row feature attributions from decision paths.
//!
//! Every split on a row's path credits the change in node value to the
//! split feature, so a row's raw prediction equals the baseline plus the
//! sum of its attributions.

use crate::repr::Forest;

#[derive(Debug, Clone, PartialEq)]
pub struct PathAttribution {
    /// Sum of tree root values, one per output.
    pub baseline: Vec<f64>,
    /// Attribution of each encoded feature, one value per output.
    pub features: Vec<Vec<f64>>,
}

impl PathAttribution {
    /// Collapse encoded feature attributions onto the input columns they
    /// were derived from.
    pub fn by_column(&self, feature_columns: &[usize], n_columns: usize) -> Vec<Vec<f64>> {
        let n_outputs = self.baseline.len();
        let mut columns = vec![vec![0.0; n_outputs]; n_columns];
        for (values, &column) in self.features.iter().zip(feature_columns) {
            if let Some(total) = columns.get_mut(column) {
                for (t, v) in total.iter_mut().zip(values) {
                    *t += v;
                }
            }
        }
        columns
    }
}

pub fn path_attribution(forest: &Forest, features: &[f32]) -> PathAttribution {
    let n_outputs = forest.n_outputs();
    let mut baseline = vec![0.0; n_outputs];
    let mut attribution = vec![vec![0.0; n_outputs]; features.len()];

    for tree in forest.trees() {
        let nodes = tree.nodes();
        for (b, v) in baseline.iter_mut().zip(&nodes[0].value) {
            *b += v;
        }
        let path = tree.path(features);
        for step in path.windows(2) {
            let (parent, child) = (&nodes[step[0]], &nodes[step[1]]);
            let Some(split) = &parent.split else { continue };
            if let Some(total) = attribution.get_mut(split.feature) {
                for ((t, c), p) in total.iter_mut().zip(&child.value).zip(&parent.value) {
                    *t += c - p;
                }
            }
        }
    }

    PathAttribution {
        baseline,
        features: attribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repr::tree::tests::two_level_tree;
    use approx::assert_relative_eq;

    #[test]
    fn attributions_sum_to_prediction() {
        let mut forest = Forest::new(1);
        forest.push_tree(two_level_tree());
        forest.push_tree(two_level_tree());
        for features in [[0.0, 0.0], [1.0, 1.0], [1.0, 3.0], [f32::NAN, 3.0]] {
            let attribution = path_attribution(&forest, &features);
            let total = attribution.baseline[0] + attribution.features.iter().map(|v| v[0]).sum::<f64>();
            assert_relative_eq!(total, forest.predict_raw(&features)[0], epsilon = 1e-12);
        }
    }

    #[test]
    fn by_column_merges_derived_features() {
        let attribution = PathAttribution {
            baseline: vec![0.0],
            features: vec![vec![1.0], vec![2.0], vec![4.0]],
        };
        assert_eq!(attribution.by_column(&[0, 1, 1], 2), vec![vec![1.0], vec![6.0]]);
    }
}
