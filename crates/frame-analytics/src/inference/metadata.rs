//! Model metadata: feature importance, hyperparameters and training facts.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;

/// How class labels are typed when written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionFieldType {
    #[default]
    String,
    Int,
    Bool,
}

impl PredictionFieldType {
    /// Render a class label with this type, falling back to a string when
    /// the label does not parse.
    pub fn to_json(self, label: &str) -> Value {
        match self {
            PredictionFieldType::String => json!(label),
            PredictionFieldType::Int => label
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| label.parse::<f64>().map(|v| Value::from(v as i64)))
                .unwrap_or_else(|_| json!(label)),
            PredictionFieldType::Bool => match label {
                "true" | "1" => json!(true),
                "false" | "0" => json!(false),
                _ => json!(label),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperparameterValue {
    Unsigned(u64),
    Double(f64),
}

/// A hyperparameter and how much it mattered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterImportance {
    pub name: String,
    pub value: HyperparameterValue,
    pub absolute_importance: f64,
    pub relative_importance: f64,
    pub supplied: bool,
}

/// Running mean of |x| with min and max of x.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ImportanceAccumulator {
    count: u64,
    mean_magnitude: f64,
    min: f64,
    max: f64,
}

impl Default for ImportanceAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            mean_magnitude: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl ImportanceAccumulator {
    fn add(&mut self, value: f64) {
        self.count += 1;
        self.mean_magnitude += (value.abs() - self.mean_magnitude) / self.count as f64;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn to_json(self) -> Value {
        json!({"mean_magnitude": self.mean_magnitude, "min": self.min, "max": self.max})
    }
}

/// Metadata accumulated during and after training.
#[derive(Debug, Clone, Default)]
pub struct InferenceModelMetadata {
    column_names: Vec<String>,
    class_values: Vec<String>,
    prediction_field_type: PredictionFieldType,
    total_importance: Vec<Vec<ImportanceAccumulator>>,
    baseline: Vec<f64>,
    hyperparameters: Vec<HyperparameterImportance>,
    num_train_rows: usize,
    loss_gap: f64,
    num_data_summarization_rows: usize,
    trained_model_memory_usage: u64,
}

impl InferenceModelMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the input fields importances are reported for.
    pub fn set_column_names(&mut self, column_names: Vec<String>) {
        self.total_importance = vec![Vec::new(); column_names.len()];
        self.column_names = column_names;
    }

    pub fn set_class_values(&mut self, class_values: Vec<String>) {
        self.class_values = class_values;
    }

    pub fn set_prediction_field_type(&mut self, field_type: PredictionFieldType) {
        self.prediction_field_type = field_type;
    }

    /// Accumulate one row's importance of field `column`.
    ///
    /// `values` holds one value per model output: a single value for
    /// regression and binary classification, one per class otherwise.
    pub fn add_to_feature_importance(&mut self, column: usize, values: &[f64]) {
        let Some(accumulators) = self.total_importance.get_mut(column) else {
            return;
        };
        if accumulators.len() < values.len() {
            accumulators.resize(values.len(), ImportanceAccumulator::default());
        }
        for (accumulator, &value) in accumulators.iter_mut().zip(values) {
            accumulator.add(value);
        }
    }

    pub fn set_feature_importance_baseline(&mut self, baseline: Vec<f64>) {
        self.baseline = baseline;
    }

    pub fn set_hyperparameter_importance(&mut self, hyperparameters: Vec<HyperparameterImportance>) {
        self.hyperparameters = hyperparameters;
    }

    pub fn set_num_train_rows(&mut self, rows: usize) {
        self.num_train_rows = rows;
    }

    pub fn set_loss_gap(&mut self, loss_gap: f64) {
        self.loss_gap = loss_gap;
    }

    pub fn set_num_data_summarization_rows(&mut self, rows: usize) {
        self.num_data_summarization_rows = rows;
    }

    pub fn set_trained_model_memory_usage(&mut self, bytes: u64) {
        self.trained_model_memory_usage = bytes;
    }

    pub fn num_train_rows(&self) -> usize {
        self.num_train_rows
    }

    pub fn hyperparameters(&self) -> &[HyperparameterImportance] {
        &self.hyperparameters
    }

    fn is_classification(&self) -> bool {
        !self.class_values.is_empty()
    }

    fn class_name(&self, class: usize) -> Value {
        self.prediction_field_type
            .to_json(self.class_values.get(class).map_or("", String::as_str))
    }

    /// Per class values for a binary model storing only the positive class.
    fn expand_binary(&self, values: &[f64]) -> Vec<f64> {
        if self.class_values.len() == 2 && values.len() == 1 {
            vec![-values[0], values[0]]
        } else {
            values.to_vec()
        }
    }

    // =========================================================================
    // JSON
    // =========================================================================

    fn total_feature_importance_json(&self) -> Value {
        let mut entries = Vec::new();
        for (name, accumulators) in self.column_names.iter().zip(&self.total_importance) {
            if accumulators.iter().all(|a| a.count == 0) {
                continue;
            }
            if !self.is_classification() {
                entries.push(json!({
                    "feature_name": name,
                    "importance": accumulators[0].to_json(),
                }));
                continue;
            }
            let accumulators = if self.class_values.len() == 2 && accumulators.len() == 1 {
                // The negative class mirrors the positive one.
                let positive = accumulators[0];
                let negative = ImportanceAccumulator {
                    min: -positive.max,
                    max: -positive.min,
                    ..positive
                };
                vec![negative, positive]
            } else {
                accumulators.clone()
            };
            let classes: Vec<Value> = accumulators
                .iter()
                .enumerate()
                .map(|(class, accumulator)| {
                    json!({"class_name": self.class_name(class), "importance": accumulator.to_json()})
                })
                .collect();
            entries.push(json!({"feature_name": name, "classes": classes}));
        }
        Value::Array(entries)
    }

    fn baseline_json(&self) -> Option<Value> {
        if self.baseline.is_empty() {
            return None;
        }
        if !self.is_classification() {
            return Some(json!({"baseline": self.baseline[0]}));
        }
        let classes: Vec<Value> = self
            .expand_binary(&self.baseline)
            .iter()
            .enumerate()
            .map(|(class, baseline)| json!({"class_name": self.class_name(class), "baseline": baseline}))
            .collect();
        Some(json!({"classes": classes}))
    }

    fn hyperparameters_json(&self) -> Value {
        self.hyperparameters
            .iter()
            .map(|h| {
                let mut entry = json!({"name": h.name, "value": h.value, "supplied": h.supplied});
                if !h.supplied {
                    entry["absolute_importance"] = json!(h.absolute_importance);
                    entry["relative_importance"] = json!(h.relative_importance);
                }
                entry
            })
            .collect()
    }

    /// Body of the `model_metadata` document.
    pub fn to_json(&self) -> Result<Value> {
        let mut metadata = json!({
            "total_feature_importance": self.total_feature_importance_json(),
            "hyperparameters": self.hyperparameters_json(),
            "train_properties": {
                "num_train_rows": self.num_train_rows,
                "loss_gap": self.loss_gap,
                "trained_model_memory_usage": self.trained_model_memory_usage,
            },
            "data_summarization": {
                "num_data_summarization_rows": self.num_data_summarization_rows,
            },
        });
        if let Some(baseline) = self.baseline_json() {
            metadata["feature_importance_baseline"] = baseline;
        }
        Ok(metadata)
    }

    pub fn json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&json!({"model_metadata": self.to_json()?}))?)
    }
}
