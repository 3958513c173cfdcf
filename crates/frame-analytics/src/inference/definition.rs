//! Serializable inference model definition.
//!
//! The JSON layout is the external wire format consumers score with:
//!
//! ```json
//! {"preprocessors": [...],
//!  "trained_model": {"ensemble": {"feature_names": [...], "trained_models": [...],
//!                                 "aggregate_output": {...}, "target_type": "regression"}},
//!  "model_metadata": {...}}
//! ```

use serde::{Deserialize, Serialize};

use super::encoding::Encoding;
use super::metadata::InferenceModelMetadata;
use super::size_info::ModelSizeInfo;
use crate::error::Result;
use crate::io::{DEFAULT_CHUNK_SIZE, chunk_encoded, compress_to_base64};

// =============================================================================
// Trained Model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Regression,
    Classification,
}

/// Combines the outputs of the trees of an ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOutput {
    WeightedSum { weights: Vec<f64> },
    WeightedMode { weights: Vec<f64>, num_classes: usize },
    LogisticRegression { weights: Vec<f64> },
    Exponent { weights: Vec<f64> },
}

impl AggregateOutput {
    pub fn weights(&self) -> &[f64] {
        match self {
            AggregateOutput::WeightedSum { weights }
            | AggregateOutput::WeightedMode { weights, .. }
            | AggregateOutput::LogisticRegression { weights }
            | AggregateOutput::Exponent { weights } => weights,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Lt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub node_index: usize,
    pub number_samples: u64,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeKind {
    Split {
        split_feature: usize,
        split_gain: f64,
        threshold: f64,
        decision_type: DecisionType,
        default_left: bool,
        left_child: usize,
        right_child: usize,
    },
    Leaf {
        leaf_value: Vec<f64>,
    },
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub feature_names: Vec<String>,
    pub tree_structure: Vec<TreeNode>,
    pub target_type: TargetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_labels: Option<Vec<String>>,
}

impl Tree {
    pub fn number_nodes(&self) -> usize {
        self.tree_structure.len()
    }

    pub fn number_leaves(&self) -> usize {
        self.tree_structure.iter().filter(|n| n.is_leaf()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    pub feature_names: Vec<String>,
    pub trained_models: Vec<TrainedModel>,
    pub aggregate_output: AggregateOutput,
    pub target_type: TargetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_weights: Option<Vec<f64>>,
}

impl Ensemble {
    /// Trees of the ensemble, skipping nested ensembles.
    pub fn trees(&self) -> impl Iterator<Item = &Tree> {
        self.trained_models.iter().filter_map(|model| match model {
            TrainedModel::Tree(tree) => Some(tree),
            TrainedModel::Ensemble(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainedModel {
    Tree(Tree),
    Ensemble(Ensemble),
}

impl TrainedModel {
    pub fn target_type(&self) -> TargetType {
        match self {
            TrainedModel::Tree(tree) => tree.target_type,
            TrainedModel::Ensemble(ensemble) => ensemble.target_type,
        }
    }

    pub fn feature_names(&self) -> &[String] {
        match self {
            TrainedModel::Tree(tree) => &tree.feature_names,
            TrainedModel::Ensemble(ensemble) => &ensemble.feature_names,
        }
    }

    pub fn as_ensemble(&self) -> Option<&Ensemble> {
        match self {
            TrainedModel::Ensemble(ensemble) => Some(ensemble),
            TrainedModel::Tree(_) => None,
        }
    }
}

// =============================================================================
// Definition
// =============================================================================

/// A trained model with its preprocessing, ready for scoring elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceModelDefinition {
    pub preprocessors: Vec<Encoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trained_model: Option<TrainedModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "model_metadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<serde_json::Value>,
}

impl InferenceModelDefinition {
    pub fn new(preprocessors: Vec<Encoding>, trained_model: Option<TrainedModel>) -> Self {
        Self {
            preprocessors,
            trained_model,
            description: None,
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Embed `metadata` under `model_metadata`.
    pub fn with_metadata(mut self, metadata: &InferenceModelMetadata) -> Result<Self> {
        self.metadata = Some(metadata.to_json()?);
        Ok(self)
    }

    pub fn preprocessors(&self) -> &[Encoding] {
        &self.preprocessors
    }

    pub fn trained_model(&self) -> Option<&TrainedModel> {
        self.trained_model.as_ref()
    }

    /// Canonical JSON rendering.
    pub fn json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// gzip + base64 of [`json_string`](Self::json_string).
    pub fn json_compressed_stream(&self) -> Result<String> {
        Ok(compress_to_base64(self.json_string()?.as_bytes())?)
    }

    /// The compressed stream split into chunks of at most `chunk_size`
    /// characters, as a JSON array of strings.
    pub fn json_compressed_chunks(&self, chunk_size: usize) -> Result<serde_json::Value> {
        let chunks = chunk_encoded(&self.json_compressed_stream()?, chunk_size);
        Ok(serde_json::Value::from(chunks))
    }

    /// Compressed chunks with the default chunk size.
    pub fn compressed_chunks(&self) -> Result<Vec<String>> {
        Ok(chunk_encoded(&self.json_compressed_stream()?, DEFAULT_CHUNK_SIZE))
    }

    pub fn size_info(&self) -> ModelSizeInfo {
        ModelSizeInfo::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::decompress_chunks;
    use serde_json::json;

    fn stump() -> Tree {
        Tree {
            feature_names: vec!["x".into()],
            tree_structure: vec![
                TreeNode {
                    node_index: 0,
                    number_samples: 10,
                    kind: NodeKind::Split {
                        split_feature: 0,
                        split_gain: 2.5,
                        threshold: 0.5,
                        decision_type: DecisionType::Lt,
                        default_left: true,
                        left_child: 1,
                        right_child: 2,
                    },
                },
                TreeNode {
                    node_index: 1,
                    number_samples: 4,
                    kind: NodeKind::Leaf { leaf_value: vec![-1.0] },
                },
                TreeNode {
                    node_index: 2,
                    number_samples: 6,
                    kind: NodeKind::Leaf { leaf_value: vec![1.0] },
                },
            ],
            target_type: TargetType::Regression,
            classification_labels: None,
        }
    }

    fn definition() -> InferenceModelDefinition {
        InferenceModelDefinition::new(
            Vec::new(),
            Some(TrainedModel::Ensemble(Ensemble {
                feature_names: vec!["x".into()],
                trained_models: vec![TrainedModel::Tree(stump())],
                aggregate_output: AggregateOutput::WeightedSum { weights: vec![1.0] },
                target_type: TargetType::Regression,
                classification_labels: None,
                classification_weights: None,
            })),
        )
    }

    #[test]
    fn nodes_serialize_flat() {
        let value = serde_json::to_value(stump()).unwrap();
        assert_eq!(
            value["tree_structure"][0],
            json!({
                "node_index": 0, "number_samples": 10, "split_feature": 0, "split_gain": 2.5,
                "threshold": 0.5, "decision_type": "lt", "default_left": true,
                "left_child": 1, "right_child": 2
            })
        );
        assert_eq!(
            value["tree_structure"][1],
            json!({"node_index": 1, "number_samples": 4, "leaf_value": [-1.0]})
        );
    }

    #[test]
    fn definition_layout() {
        let value: serde_json::Value =
            serde_json::from_str(&definition().json_string().unwrap()).unwrap();
        let ensemble = &value["trained_model"]["ensemble"];
        assert_eq!(ensemble["target_type"], "regression");
        assert_eq!(ensemble["aggregate_output"], json!({"weighted_sum": {"weights": [1.0]}}));
        assert_eq!(ensemble["trained_models"][0]["tree"]["feature_names"], json!(["x"]));
        assert!(value.get("model_metadata").is_none());
        assert!(value["preprocessors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn parses_back() {
        let definition = definition().with_description("stump");
        let parsed: InferenceModelDefinition =
            serde_json::from_str(&definition.json_string().unwrap()).unwrap();
        assert_eq!(parsed, definition);
    }

    #[test]
    fn compressed_chunks_decompress_to_json() {
        let definition = definition();
        let chunks = definition.json_compressed_chunks(16).unwrap();
        let chunks: Vec<String> = serde_json::from_value(chunks).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(
            decompress_chunks(&chunks).unwrap(),
            definition.json_string().unwrap()
        );
    }
}
