//! Lengths and counts of a definition, without its values.
//!
//! Consumers read this before the full model to size their buffers. String
//! lengths are in UTF-16 code units.

use serde::Serialize;

use super::definition::{AggregateOutput, Ensemble, InferenceModelDefinition, TrainedModel, Tree};
use super::encoding::Encoding;
use crate::error::Result;
use crate::utils::utf16_len;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSizeInfo {
    pub preprocessors: Vec<EncodingSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_model_size: Option<TrainedModelSize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EncodingSize {
    #[serde(rename = "one_hot_encoding")]
    OneHot {
        field_length: usize,
        field_value_lengths: Vec<usize>,
        feature_name_lengths: Vec<usize>,
    },
    #[serde(rename = "frequency_encoding")]
    Frequency {
        field_length: usize,
        feature_name_length: usize,
        field_value_lengths: Vec<usize>,
    },
    #[serde(rename = "target_mean_encoding")]
    TargetMean {
        field_length: usize,
        feature_name_length: usize,
        field_value_lengths: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainedModelSize {
    EnsembleModelSize(EnsembleSize),
    TreeModelSize(TreeSize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleSize {
    pub tree_sizes: Vec<TreeSize>,
    pub feature_name_lengths: Vec<usize>,
    pub num_output_processor_weights: usize,
    pub num_classification_weights: usize,
    pub num_classes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeSize {
    pub num_nodes: usize,
    pub num_leaves: usize,
}

impl ModelSizeInfo {
    pub fn new(definition: &InferenceModelDefinition) -> Self {
        Self {
            preprocessors: definition
                .preprocessors()
                .iter()
                .filter_map(EncodingSize::new)
                .collect(),
            trained_model_size: definition.trained_model().map(TrainedModelSize::new),
        }
    }

    pub fn json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Tree sizes of the ensemble, or the single tree.
    pub fn tree_sizes(&self) -> Vec<TreeSize> {
        match &self.trained_model_size {
            Some(TrainedModelSize::EnsembleModelSize(ensemble)) => ensemble.tree_sizes.clone(),
            Some(TrainedModelSize::TreeModelSize(tree)) => vec![*tree],
            None => Vec::new(),
        }
    }
}

impl EncodingSize {
    /// Size of a standard encoding; custom processors have none.
    fn new(encoding: &Encoding) -> Option<Self> {
        Some(match encoding {
            Encoding::OneHot(e) => EncodingSize::OneHot {
                field_length: utf16_len(&e.field),
                field_value_lengths: e.hot_map.keys().map(|k| utf16_len(k)).collect(),
                feature_name_lengths: e.hot_map.values().map(|v| utf16_len(v)).collect(),
            },
            Encoding::Frequency(e) => EncodingSize::Frequency {
                field_length: utf16_len(&e.field),
                feature_name_length: utf16_len(&e.feature_name),
                field_value_lengths: e.frequency_map.keys().map(|k| utf16_len(k)).collect(),
            },
            Encoding::TargetMean(e) => EncodingSize::TargetMean {
                field_length: utf16_len(&e.field),
                feature_name_length: utf16_len(&e.feature_name),
                field_value_lengths: e.target_map.keys().map(|k| utf16_len(k)).collect(),
            },
            Encoding::Custom(_) => return None,
        })
    }
}

impl TrainedModelSize {
    fn new(model: &TrainedModel) -> Self {
        match model {
            TrainedModel::Tree(tree) => TrainedModelSize::TreeModelSize(TreeSize::new(tree)),
            TrainedModel::Ensemble(ensemble) => {
                TrainedModelSize::EnsembleModelSize(EnsembleSize::new(ensemble))
            }
        }
    }
}

impl EnsembleSize {
    fn new(ensemble: &Ensemble) -> Self {
        let num_classes = match &ensemble.aggregate_output {
            AggregateOutput::WeightedMode { num_classes, .. } => *num_classes,
            _ => ensemble.classification_labels.as_ref().map_or(0, Vec::len),
        };
        Self {
            tree_sizes: ensemble.trees().map(TreeSize::new).collect(),
            feature_name_lengths: ensemble.feature_names.iter().map(|n| utf16_len(n)).collect(),
            num_output_processor_weights: ensemble.aggregate_output.weights().len(),
            num_classification_weights: ensemble.classification_weights.as_ref().map_or(0, Vec::len),
            num_classes,
        }
    }
}

impl TreeSize {
    fn new(tree: &Tree) -> Self {
        Self {
            num_nodes: tree.number_nodes(),
            num_leaves: tree.number_leaves(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::definition::{NodeKind, TargetType, TreeNode};
    use crate::inference::encoding::OneHotEncoding;
    use serde_json::json;

    fn leaf(index: usize) -> TreeNode {
        TreeNode {
            node_index: index,
            number_samples: 1,
            kind: NodeKind::Leaf { leaf_value: vec![0.0] },
        }
    }

    #[test]
    fn sizes_mirror_the_definition() {
        let mut one_hot = OneHotEncoding::new("färg");
        one_hot.add_category("röd");
        one_hot.add_category("𝄞");
        let tree = Tree {
            feature_names: vec!["färg_röd".into()],
            tree_structure: vec![leaf(0)],
            target_type: TargetType::Classification,
            classification_labels: None,
        };
        let definition = InferenceModelDefinition::new(
            vec![Encoding::OneHot(one_hot), Encoding::Custom(json!({"x": {}}))],
            Some(TrainedModel::Ensemble(Ensemble {
                feature_names: vec!["färg_röd".into(), "färg_𝄞".into()],
                trained_models: vec![TrainedModel::Tree(tree.clone()), TrainedModel::Tree(tree)],
                aggregate_output: AggregateOutput::LogisticRegression { weights: vec![1.0, 1.0] },
                target_type: TargetType::Classification,
                classification_labels: Some(vec!["a".into(), "b".into()]),
                classification_weights: Some(vec![0.5, 1.5]),
            })),
        );

        let value = serde_json::to_value(definition.size_info()).unwrap();
        assert_eq!(
            value["preprocessors"],
            json!([{"one_hot_encoding": {
                "field_length": 4,
                "field_value_lengths": [3, 2],
                "feature_name_lengths": [8, 7]
            }}])
        );
        assert_eq!(
            value["trained_model_size"]["ensemble_model_size"],
            json!({
                "tree_sizes": [{"num_nodes": 1, "num_leaves": 1}, {"num_nodes": 1, "num_leaves": 1}],
                "feature_name_lengths": [8, 7],
                "num_output_processor_weights": 2,
                "num_classification_weights": 2,
                "num_classes": 2
            })
        );
    }
}
