use std::collections::BTreeMap;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::encoder::CategoryEncoder;
use super::importance::{PathAttribution, path_attribution};
use super::objectives::LossType;
use crate::error::{AnalysisError, Result};
use crate::repr::{Forest, ModelVisitor};

/// A trained boosted tree model together with its input encoding.
///
/// This is also the checkpoint format: it round trips through JSON and a
/// restored model can predict or be trained further. Encodings refer to
/// categories by id, so the category names of every categorical field at
/// training time are kept alongside to renumber frames seen later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTreeModel {
    pub encoder: CategoryEncoder,
    pub forest: Forest,
    pub loss: LossType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_processors: Vec<Value>,
    /// Category names by id of each categorical field, dependent variable
    /// included.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub category_names: BTreeMap<String, Vec<String>>,
}

impl BoostedTreeModel {
    pub fn new(encoder: CategoryEncoder, forest: Forest, loss: LossType) -> Self {
        Self {
            encoder,
            forest,
            loss,
            classification_weights: None,
            custom_processors: Vec::new(),
            category_names: BTreeMap::new(),
        }
    }

    /// Raw scores for one row of input columns.
    pub fn predict_raw(&self, row: ArrayView1<'_, f32>) -> Vec<f64> {
        self.forest.predict_raw(&self.encoder.encode_row(row))
    }

    /// Predicted value, or class probabilities for classification.
    pub fn predict(&self, row: ArrayView1<'_, f32>) -> Vec<f64> {
        self.loss.transform(&self.predict_raw(row))
    }

    pub fn attribution(&self, row: ArrayView1<'_, f32>) -> PathAttribution {
        path_attribution(&self.forest, &self.encoder.encode_row(row))
    }

    pub fn memory_usage(&self) -> u64 {
        self.forest.memory_usage() + (self.encoder.n_features() * std::mem::size_of::<f64>() * 4) as u64
    }

    pub fn validate(&self) -> Result<()> {
        self.forest.validate()?;
        if self.forest.n_outputs() != self.loss.n_outputs() {
            return Err(AnalysisError::runtime(format!(
                "model has {} outputs but loss {} expects {}",
                self.forest.n_outputs(),
                self.loss.name(),
                self.loss.n_outputs()
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    /// Replay the whole model into `visitor`.
    pub fn accept(&self, visitor: &mut dyn ModelVisitor) {
        for processor in &self.custom_processors {
            visitor.add_custom_processor(processor.clone());
        }
        self.encoder.accept(visitor);
        visitor.add_loss_function(self.loss);
        if let Some(weights) = &self.classification_weights {
            visitor.add_classification_weights(weights.clone());
        }
        self.forest.accept(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repr::tree::tests::two_level_tree;
    use crate::training::EncodedFeature;
    use ndarray::arr1;

    fn model() -> BoostedTreeModel {
        let encoder = CategoryEncoder::new(vec![
            EncodedFeature::Identity { column: 0 },
            EncodedFeature::Identity { column: 1 },
        ]);
        let mut forest = Forest::new(1);
        forest.push_tree(two_level_tree());
        BoostedTreeModel::new(encoder, forest, LossType::Mse)
    }

    #[test]
    fn checkpoint_round_trips() {
        let model = model();
        let restored = BoostedTreeModel::from_json(&model.to_json().unwrap()).unwrap();
        assert_eq!(restored, model);
        assert_eq!(restored.predict(arr1(&[1.0, 3.0]).view()), vec![2.0]);
    }

    #[test]
    fn checkpoint_keeps_category_names() {
        let mut named = model();
        named
            .category_names
            .insert("colour".to_string(), vec!["red".to_string(), "blue".to_string()]);
        let json = named.to_json().unwrap();
        let restored = BoostedTreeModel::from_json(&json).unwrap();
        assert_eq!(restored.category_names["colour"], ["red", "blue"]);

        let without: serde_json::Value = serde_json::from_str(&model().to_json().unwrap()).unwrap();
        assert!(without.get("category_names").is_none());
    }

    #[test]
    fn rejects_output_mismatch() {
        let mut model = model();
        model.loss = LossType::MultinomialLogistic { n_classes: 3 };
        assert!(model.validate().is_err());
    }
}
