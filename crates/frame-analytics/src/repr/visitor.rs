use crate::training::LossType;

/// Flat callback contract for exporting a trained model.
///
/// A model replays itself as: encodings in input column order, the loss
/// function, classification weights (classification only), then for each
/// tree `add_tree` followed by its nodes in pre-order.
pub trait ModelVisitor {
    /// Open a new tree; following nodes belong to it.
    fn add_tree(&mut self);

    /// Append a node to the open tree. Absent children mean a leaf.
    #[allow(clippy::too_many_arguments)]
    fn add_node(
        &mut self,
        split_feature: usize,
        split_value: f64,
        assign_missing_to_left: bool,
        node_value: &[f64],
        gain: f64,
        number_samples: u64,
        left_child: Option<usize>,
        right_child: Option<usize>,
    );

    /// Numeric input column used as is.
    fn add_identity_encoding(&mut self, input_column: usize);

    /// Indicator feature for one category of `input_column`.
    fn add_one_hot_encoding(&mut self, input_column: usize, hot_category: usize);

    /// Mean target per category id; NaN entries were not observed.
    fn add_target_mean_encoding(&mut self, input_column: usize, map: &[f64], fallback: f64);

    /// Frequency per category id; NaN entries were not observed.
    fn add_frequency_encoding(&mut self, input_column: usize, map: &[f64]);

    /// Opaque preprocessing step copied into the model verbatim.
    fn add_custom_processor(&mut self, processor: serde_json::Value);

    fn add_classification_weights(&mut self, weights: Vec<f64>);

    fn add_loss_function(&mut self, loss: LossType);
}
