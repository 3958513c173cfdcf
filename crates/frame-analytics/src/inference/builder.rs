//! Builds an [`InferenceModelDefinition`] from visitor callbacks.

use std::collections::{HashMap, HashSet};

use super::definition::{
    AggregateOutput, DecisionType, Ensemble, InferenceModelDefinition, NodeKind, TargetType,
    TrainedModel, Tree, TreeNode,
};
use super::encoding::{
    Encoding, FREQUENCY_SUFFIX, FrequencyEncoding, OneHotEncoding, TARGET_MEAN_SUFFIX,
    TargetMeanEncoding, derived_feature_name,
};
use crate::repr::ModelVisitor;
use crate::training::LossType;

/// Task specific parts of a model definition.
pub trait ModelTask {
    fn target_type(&self) -> TargetType;

    fn aggregate_output(&self, n_trees: usize) -> AggregateOutput;

    fn classification_labels(&self) -> Option<Vec<String>> {
        None
    }

    fn classification_weights(&self) -> Option<Vec<f64>> {
        None
    }

    fn set_loss_function(&mut self, _loss: LossType) {}

    fn set_classification_weights(&mut self, _weights: Vec<f64>) {}
}

/// Continuous target, summed trees or their exponent for log losses.
#[derive(Debug, Clone, Default)]
pub struct Regression {
    loss: Option<LossType>,
}

impl ModelTask for Regression {
    fn target_type(&self) -> TargetType {
        TargetType::Regression
    }

    fn aggregate_output(&self, n_trees: usize) -> AggregateOutput {
        let weights = vec![1.0; n_trees];
        match self.loss {
            Some(LossType::Msle) => AggregateOutput::Exponent { weights },
            _ => AggregateOutput::WeightedSum { weights },
        }
    }

    fn set_loss_function(&mut self, loss: LossType) {
        self.loss = Some(loss);
    }
}

/// Discrete target with explicit labels and per class weights.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    labels: Vec<String>,
    weights: Option<Vec<f64>>,
}

impl ModelTask for Classification {
    fn target_type(&self) -> TargetType {
        TargetType::Classification
    }

    fn aggregate_output(&self, n_trees: usize) -> AggregateOutput {
        AggregateOutput::LogisticRegression {
            weights: vec![1.0; n_trees],
        }
    }

    fn classification_labels(&self) -> Option<Vec<String>> {
        Some(self.labels.clone())
    }

    fn classification_weights(&self) -> Option<Vec<f64>> {
        self.weights.clone()
    }

    fn set_classification_weights(&mut self, weights: Vec<f64>) {
        self.weights = Some(weights);
    }
}

/// Visitor collecting trees and encodings into a definition.
///
/// Feature names are assigned in callback order, so encoded feature `i` of
/// the trained model is named `feature_names[i]`. Derived names that clash
/// with an input field or an earlier feature get a numeric suffix.
#[derive(Debug)]
pub struct InferenceModelBuilder<T> {
    task: T,
    field_names: Vec<String>,
    category_names: Vec<Vec<String>>,
    feature_names: Vec<String>,
    taken_names: HashSet<String>,
    custom_processors: Vec<Encoding>,
    encodings: Vec<Encoding>,
    one_hot: Vec<OneHotEncoding>,
    one_hot_by_column: HashMap<usize, usize>,
    trees: Vec<Vec<TreeNode>>,
}

pub type RegressionModelBuilder = InferenceModelBuilder<Regression>;
pub type ClassificationModelBuilder = InferenceModelBuilder<Classification>;

impl RegressionModelBuilder {
    /// `category_names[i]` lists the categories of input field `i`.
    pub fn new(field_names: Vec<String>, category_names: Vec<Vec<String>>) -> Self {
        Self::with_task(Regression::default(), field_names, category_names)
    }
}

impl ClassificationModelBuilder {
    /// Class labels are the categories of the dependent variable.
    pub fn new(
        field_names: Vec<String>,
        dependent_variable: usize,
        category_names: Vec<Vec<String>>,
    ) -> Self {
        let labels = category_names
            .get(dependent_variable)
            .cloned()
            .unwrap_or_default();
        Self::with_task(
            Classification {
                labels,
                weights: None,
            },
            field_names,
            category_names,
        )
    }
}

impl<T: ModelTask> InferenceModelBuilder<T> {
    pub fn with_task(task: T, field_names: Vec<String>, category_names: Vec<Vec<String>>) -> Self {
        let taken_names = field_names.iter().cloned().collect();
        Self {
            task,
            field_names,
            category_names,
            feature_names: Vec::new(),
            taken_names,
            custom_processors: Vec::new(),
            encodings: Vec::new(),
            one_hot: Vec::new(),
            one_hot_by_column: HashMap::new(),
            trees: Vec::new(),
        }
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn field(&self, column: usize) -> String {
        self.field_names
            .get(column)
            .cloned()
            .unwrap_or_else(|| format!("field_{column}"))
    }

    /// `base`, or `base_<n>` for the first free `n`, reserved for a
    /// derived feature.
    fn unique_feature_name(&mut self, base: String) -> String {
        let mut name = base.clone();
        let mut n = 1;
        while self.taken_names.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        if name != base {
            tracing::debug!(feature = %base, renamed = %name, "derived feature name already in use");
        }
        self.taken_names.insert(name.clone());
        name
    }

    /// Category names paired with the observed entries of `map`.
    fn observed<'a>(&'a self, column: usize, map: &'a [f64]) -> impl Iterator<Item = (String, f64)> + 'a {
        let names = self.category_names.get(column).map_or(&[][..], Vec::as_slice);
        map.iter()
            .zip(names)
            .filter(|(value, _)| !value.is_nan())
            .map(|(&value, name)| (name.clone(), value))
    }

    /// Finish the definition.
    pub fn build(self) -> InferenceModelDefinition {
        let mut preprocessors = self.custom_processors;
        preprocessors.extend(self.encodings);
        preprocessors.extend(self.one_hot.into_iter().map(Encoding::OneHot));

        if self.trees.is_empty() {
            return InferenceModelDefinition::new(preprocessors, None);
        }

        let target_type = self.task.target_type();
        let n_trees = self.trees.len();
        let feature_names = self.feature_names;
        let trained_models = self
            .trees
            .into_iter()
            .map(|nodes| {
                TrainedModel::Tree(Tree {
                    feature_names: feature_names.clone(),
                    tree_structure: nodes,
                    target_type,
                    classification_labels: None,
                })
            })
            .collect();

        let ensemble = Ensemble {
            feature_names,
            trained_models,
            aggregate_output: self.task.aggregate_output(n_trees),
            target_type,
            classification_labels: self.task.classification_labels(),
            classification_weights: self.task.classification_weights(),
        };
        InferenceModelDefinition::new(preprocessors, Some(TrainedModel::Ensemble(ensemble)))
    }
}

impl<T: ModelTask> ModelVisitor for InferenceModelBuilder<T> {
    fn add_tree(&mut self) {
        self.trees.push(Vec::new());
    }

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
    ) {
        if self.trees.is_empty() {
            tracing::warn!("node added before any tree, opening one");
            self.trees.push(Vec::new());
        }
        let Some(nodes) = self.trees.last_mut() else {
            return;
        };
        let kind = match (left_child, right_child) {
            (Some(left_child), Some(right_child)) => NodeKind::Split {
                split_feature,
                split_gain: gain,
                threshold: split_value,
                decision_type: DecisionType::Lt,
                default_left: assign_missing_to_left,
                left_child,
                right_child,
            },
            _ => NodeKind::Leaf {
                leaf_value: node_value.to_vec(),
            },
        };
        nodes.push(TreeNode {
            node_index: nodes.len(),
            number_samples,
            kind,
        });
    }

    fn add_identity_encoding(&mut self, input_column: usize) {
        let field = self.field(input_column);
        self.feature_names.push(field);
    }

    fn add_one_hot_encoding(&mut self, input_column: usize, hot_category: usize) {
        let Some(category) = self
            .category_names
            .get(input_column)
            .and_then(|names| names.get(hot_category))
            .cloned()
        else {
            tracing::warn!(input_column, hot_category, "one-hot category out of range");
            return;
        };
        let field = self.field(input_column);
        let feature_name = self.unique_feature_name(derived_feature_name(&field, &category));
        let index = *self
            .one_hot_by_column
            .entry(input_column)
            .or_insert_with(|| {
                self.one_hot.push(OneHotEncoding::new(field));
                self.one_hot.len() - 1
            });
        let feature_name = self.one_hot[index].add_category_as(&category, feature_name);
        self.feature_names.push(feature_name);
    }

    fn add_target_mean_encoding(&mut self, input_column: usize, map: &[f64], fallback: f64) {
        let field = self.field(input_column);
        let feature_name = self.unique_feature_name(derived_feature_name(&field, TARGET_MEAN_SUFFIX));
        let target_map = self.observed(input_column, map).collect();
        self.feature_names.push(feature_name.clone());
        self.encodings.push(Encoding::TargetMean(TargetMeanEncoding {
            field,
            feature_name,
            target_map,
            default_value: fallback,
        }));
    }

    fn add_frequency_encoding(&mut self, input_column: usize, map: &[f64]) {
        let field = self.field(input_column);
        let feature_name = self.unique_feature_name(derived_feature_name(&field, FREQUENCY_SUFFIX));
        let frequency_map = self.observed(input_column, map).collect();
        self.feature_names.push(feature_name.clone());
        self.encodings.push(Encoding::Frequency(FrequencyEncoding {
            field,
            feature_name,
            frequency_map,
        }));
    }

    fn add_custom_processor(&mut self, processor: serde_json::Value) {
        self.custom_processors.push(Encoding::Custom(processor));
    }

    fn add_classification_weights(&mut self, weights: Vec<f64>) {
        self.task.set_classification_weights(weights);
    }

    fn add_loss_function(&mut self, loss: LossType) {
        self.task.set_loss_function(loss);
    }
}
