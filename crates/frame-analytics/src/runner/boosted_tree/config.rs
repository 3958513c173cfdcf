//! Parameters of the boosted tree analyses.
//!
//! `analysis.parameters` is first read into [`RawParameters`], where every
//! optional key stays optional so explicitly supplied hyperparameters can be
//! told apart from defaults, then resolved into a [`BoostedTreeConfig`].

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AnalysisError, Result};
use crate::inference::{HyperparameterImportance, HyperparameterValue, PredictionFieldType};
use crate::instrumentation::{HyperparametersRecord, TrainingKind};
use crate::runner::parse_parameters;
use crate::training::{BoostingParams, LossType};

const DEFAULT_TRAINING_PERCENT: f64 = 100.0;
const DEFAULT_NUM_CLASSES: usize = 2;
const DEFAULT_HUBER_DELTA: f64 = 1.0;
const DEFAULT_OPTIMIZATION_ROUNDS: usize = 3;

/// What the run does with the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostedTreeTask {
    /// Fit encodings and train a new model.
    #[default]
    Train,
    /// Add trees to a restored model.
    Update,
    /// Predict with a restored model.
    Predict,
    /// Fit encodings only.
    Encode,
}

impl BoostedTreeTask {
    pub fn needs_restored_model(self) -> bool {
        matches!(self, BoostedTreeTask::Update | BoostedTreeTask::Predict)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionLoss {
    #[default]
    Mse,
    Msle,
    Huber,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassAssignmentObjective {
    MaximizeAccuracy,
    #[default]
    MaximizeMinimumRecall,
    Custom,
}

impl ClassAssignmentObjective {
    pub fn name(self) -> &'static str {
        match self {
            ClassAssignmentObjective::MaximizeAccuracy => "maximize_accuracy",
            ClassAssignmentObjective::MaximizeMinimumRecall => "maximize_minimum_recall",
            ClassAssignmentObjective::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassWeight {
    pub class: Value,
    pub weight: f64,
}

/// `analysis.parameters` as supplied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawParameters {
    pub dependent_variable: Option<String>,
    pub prediction_field_name: Option<String>,
    pub alpha: Option<f64>,
    pub lambda: Option<f64>,
    pub gamma: Option<f64>,
    pub eta: Option<f64>,
    pub eta_growth_rate_per_tree: Option<f64>,
    pub soft_tree_depth_limit: Option<f64>,
    pub soft_tree_depth_tolerance: Option<f64>,
    pub downsample_factor: Option<f64>,
    pub max_trees: Option<usize>,
    pub feature_bag_fraction: Option<f64>,
    pub num_top_feature_importance_values: Option<usize>,
    pub training_percent: Option<f64>,
    pub randomize_seed: Option<u64>,
    pub early_stopping_enabled: Option<bool>,
    pub max_optimization_rounds_per_hyperparameter: Option<usize>,
    pub bayesian_optimisation_restarts: Option<usize>,
    pub data_summarization_fraction: Option<f64>,
    pub previous_train_loss_gap: Option<f64>,
    pub previous_train_num_rows: Option<usize>,
    pub feature_processors: Option<Vec<Value>>,
    pub task: Option<BoostedTreeTask>,
    // Regression only.
    pub loss_function: Option<RegressionLoss>,
    pub loss_function_parameter: Option<f64>,
    // Classification only.
    pub num_classes: Option<usize>,
    pub num_top_classes: Option<i64>,
    pub prediction_field_type: Option<PredictionFieldType>,
    pub class_assignment_objective: Option<ClassAssignmentObjective>,
    pub classification_weights: Option<Vec<ClassWeight>>,
}

/// Task specific configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskConfig {
    Regression {
        loss_function: RegressionLoss,
        loss_function_parameter: Option<f64>,
    },
    Classification {
        num_classes: usize,
        /// Negative means every class.
        num_top_classes: i64,
        prediction_field_type: PredictionFieldType,
        class_assignment_objective: ClassAssignmentObjective,
        classification_weights: Vec<(String, f64)>,
    },
}

/// Resolved boosted tree configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BoostedTreeConfig {
    pub dependent_variable: String,
    pub prediction_field_name: String,
    pub boosting: BoostingParams,
    /// Hyperparameters given explicitly.
    pub supplied: Vec<&'static str>,
    pub num_top_feature_importance_values: usize,
    pub training_percent: f64,
    pub early_stopping_enabled: bool,
    pub max_optimization_rounds_per_hyperparameter: usize,
    pub bayesian_optimisation_restarts: Option<usize>,
    pub data_summarization_fraction: f64,
    pub previous_train_loss_gap: Option<f64>,
    pub previous_train_num_rows: Option<usize>,
    pub feature_processors: Vec<Value>,
    pub task: BoostedTreeTask,
    pub task_config: TaskConfig,
}

impl BoostedTreeConfig {
    pub fn parse(kind: TrainingKind, analysis: &str, parameters: &Value) -> Result<Self> {
        let raw: RawParameters = parse_parameters(analysis, parameters)?;
        Self::resolve(kind, raw)
    }

    pub fn resolve(kind: TrainingKind, raw: RawParameters) -> Result<Self> {
        let dependent_variable = raw
            .dependent_variable
            .clone()
            .ok_or_else(|| AnalysisError::configuration("missing required parameter 'dependent_variable'"))?;
        let task_config = match kind {
            TrainingKind::Regression => regression_config(&raw)?,
            TrainingKind::Classification => classification_config(&raw)?,
        };

        let defaults = BoostingParams::default();
        let mut supplied = Vec::new();
        let mut pick = |name: &'static str, value: Option<f64>, default: f64| {
            if value.is_some() {
                supplied.push(name);
            }
            value.unwrap_or(default)
        };
        let alpha = pick("alpha", raw.alpha, defaults.alpha);
        let downsample_factor = pick("downsample_factor", raw.downsample_factor, defaults.downsample_factor);
        let eta = pick("eta", raw.eta, defaults.eta);
        let eta_growth_rate_per_tree = pick(
            "eta_growth_rate_per_tree",
            raw.eta_growth_rate_per_tree,
            defaults.eta_growth_rate_per_tree,
        );
        let feature_bag_fraction = pick(
            "feature_bag_fraction",
            raw.feature_bag_fraction,
            defaults.feature_bag_fraction,
        );
        let gamma = pick("gamma", raw.gamma, defaults.gamma);
        let lambda = pick("lambda", raw.lambda, defaults.lambda);
        let soft_tree_depth_limit = pick(
            "soft_tree_depth_limit",
            raw.soft_tree_depth_limit,
            defaults.soft_tree_depth_limit,
        );
        let soft_tree_depth_tolerance = pick(
            "soft_tree_depth_tolerance",
            raw.soft_tree_depth_tolerance,
            defaults.soft_tree_depth_tolerance,
        );
        if raw.max_trees.is_some() {
            supplied.push("max_trees");
        }
        supplied.sort_unstable();

        let early_stopping_enabled = raw.early_stopping_enabled.unwrap_or(true);
        let boosting = BoostingParams::builder()
            .alpha(alpha)
            .lambda(lambda)
            .gamma(gamma)
            .eta(eta)
            .eta_growth_rate_per_tree(eta_growth_rate_per_tree)
            .soft_tree_depth_limit(soft_tree_depth_limit)
            .soft_tree_depth_tolerance(soft_tree_depth_tolerance)
            .downsample_factor(downsample_factor)
            .feature_bag_fraction(feature_bag_fraction)
            .max_trees(raw.max_trees.unwrap_or(defaults.max_trees))
            .maybe_early_stopping_rounds(early_stopping_enabled.then_some(EARLY_STOPPING_ROUNDS))
            .seed(raw.randomize_seed.unwrap_or(defaults.seed))
            .build()?;

        let training_percent = raw.training_percent.unwrap_or(DEFAULT_TRAINING_PERCENT);
        if !(training_percent > 0.0 && training_percent <= 100.0) {
            return Err(AnalysisError::configuration(format!(
                "training_percent must be in (0, 100], got {training_percent}"
            )));
        }
        let data_summarization_fraction = raw.data_summarization_fraction.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&data_summarization_fraction) {
            return Err(AnalysisError::configuration(format!(
                "data_summarization_fraction must be in [0, 1], got {data_summarization_fraction}"
            )));
        }

        Ok(Self {
            prediction_field_name: raw
                .prediction_field_name
                .clone()
                .unwrap_or_else(|| format!("{dependent_variable}_prediction")),
            dependent_variable,
            boosting,
            supplied,
            num_top_feature_importance_values: raw.num_top_feature_importance_values.unwrap_or(0),
            training_percent,
            early_stopping_enabled,
            max_optimization_rounds_per_hyperparameter: raw
                .max_optimization_rounds_per_hyperparameter
                .unwrap_or(DEFAULT_OPTIMIZATION_ROUNDS),
            bayesian_optimisation_restarts: raw.bayesian_optimisation_restarts,
            data_summarization_fraction,
            previous_train_loss_gap: raw.previous_train_loss_gap,
            previous_train_num_rows: raw.previous_train_num_rows,
            feature_processors: raw.feature_processors.unwrap_or_default(),
            task: raw.task.unwrap_or_default(),
            task_config,
        })
    }

    pub fn kind(&self) -> TrainingKind {
        match self.task_config {
            TaskConfig::Regression { .. } => TrainingKind::Regression,
            TaskConfig::Classification { .. } => TrainingKind::Classification,
        }
    }

    /// Loss for regression, or for `n_classes` observed classes.
    pub fn loss(&self, n_classes: usize) -> LossType {
        match &self.task_config {
            TaskConfig::Regression { loss_function, loss_function_parameter } => match loss_function {
                RegressionLoss::Mse => LossType::Mse,
                RegressionLoss::Msle => LossType::Msle,
                RegressionLoss::Huber => LossType::PseudoHuber {
                    delta: loss_function_parameter.unwrap_or(DEFAULT_HUBER_DELTA),
                },
            },
            TaskConfig::Classification { .. } if n_classes <= 2 => LossType::BinomialLogistic,
            TaskConfig::Classification { .. } => LossType::MultinomialLogistic { n_classes },
        }
    }

    pub fn num_classes(&self) -> Option<usize> {
        match self.task_config {
            TaskConfig::Classification { num_classes, .. } => Some(num_classes),
            TaskConfig::Regression { .. } => None,
        }
    }

    /// Hyperparameters for the training statistics document.
    pub fn hyperparameters_record(&self) -> HyperparametersRecord {
        let b = &self.boosting;
        HyperparametersRecord {
            alpha: b.alpha,
            lambda: b.lambda,
            gamma: b.gamma,
            eta: b.eta,
            eta_growth_rate_per_tree: b.eta_growth_rate_per_tree,
            soft_tree_depth_limit: b.soft_tree_depth_limit,
            soft_tree_depth_tolerance: b.soft_tree_depth_tolerance,
            downsample_factor: b.downsample_factor,
            feature_bag_fraction: b.feature_bag_fraction,
            max_trees: b.max_trees,
            class_assignment_objective: match &self.task_config {
                TaskConfig::Classification { class_assignment_objective, .. } => {
                    Some(class_assignment_objective.name().to_string())
                }
                TaskConfig::Regression { .. } => None,
            },
            max_optimization_rounds_per_hyperparameter: self.max_optimization_rounds_per_hyperparameter,
        }
    }

    /// Hyperparameters for the model metadata. No search runs, so none
    /// carries importance.
    pub fn hyperparameter_importance(&self) -> Vec<HyperparameterImportance> {
        let b = &self.boosting;
        let entry = |name: &'static str, value: HyperparameterValue| HyperparameterImportance {
            name: name.to_string(),
            value,
            absolute_importance: 0.0,
            relative_importance: 0.0,
            supplied: self.supplied.contains(&name),
        };
        vec![
            entry("alpha", HyperparameterValue::Double(b.alpha)),
            entry("downsample_factor", HyperparameterValue::Double(b.downsample_factor)),
            entry("eta", HyperparameterValue::Double(b.eta)),
            entry("eta_growth_rate_per_tree", HyperparameterValue::Double(b.eta_growth_rate_per_tree)),
            entry("feature_bag_fraction", HyperparameterValue::Double(b.feature_bag_fraction)),
            entry("gamma", HyperparameterValue::Double(b.gamma)),
            entry("lambda", HyperparameterValue::Double(b.lambda)),
            entry("max_trees", HyperparameterValue::Unsigned(b.max_trees as u64)),
            entry("soft_tree_depth_limit", HyperparameterValue::Double(b.soft_tree_depth_limit)),
            entry("soft_tree_depth_tolerance", HyperparameterValue::Double(b.soft_tree_depth_tolerance)),
        ]
    }
}

/// Rounds without validation improvement before training stops.
pub const EARLY_STOPPING_ROUNDS: usize = 5;

fn reject_present(analysis: &str, names: &[(&str, bool)]) -> Result<()> {
    match names.iter().find(|(_, present)| *present) {
        Some((name, _)) => Err(AnalysisError::configuration(format!(
            "parameter '{name}' is not valid for {analysis}"
        ))),
        None => Ok(()),
    }
}

fn regression_config(raw: &RawParameters) -> Result<TaskConfig> {
    reject_present("regression", &[
        ("num_classes", raw.num_classes.is_some()),
        ("num_top_classes", raw.num_top_classes.is_some()),
        ("prediction_field_type", raw.prediction_field_type.is_some()),
        ("class_assignment_objective", raw.class_assignment_objective.is_some()),
        ("classification_weights", raw.classification_weights.is_some()),
    ])?;
    if let Some(parameter) = raw.loss_function_parameter {
        if !(parameter > 0.0) {
            return Err(AnalysisError::configuration(format!(
                "loss_function_parameter must be positive, got {parameter}"
            )));
        }
    }
    Ok(TaskConfig::Regression {
        loss_function: raw.loss_function.unwrap_or_default(),
        loss_function_parameter: raw.loss_function_parameter,
    })
}

fn classification_config(raw: &RawParameters) -> Result<TaskConfig> {
    reject_present("classification", &[
        ("loss_function", raw.loss_function.is_some()),
        ("loss_function_parameter", raw.loss_function_parameter.is_some()),
    ])?;
    let num_classes = raw.num_classes.unwrap_or(DEFAULT_NUM_CLASSES);
    if num_classes < 2 {
        return Err(AnalysisError::configuration(format!(
            "num_classes must be at least 2, got {num_classes}"
        )));
    }
    let objective = raw.class_assignment_objective.unwrap_or_default();
    let weights: Vec<(String, f64)> = raw
        .classification_weights
        .iter()
        .flatten()
        .map(|w| (class_label(&w.class), w.weight))
        .collect();
    if objective == ClassAssignmentObjective::Custom && weights.is_empty() {
        return Err(AnalysisError::configuration(
            "class_assignment_objective 'custom' requires classification_weights",
        ));
    }
    if let Some((class, weight)) = weights.iter().find(|(_, w)| !(*w >= 0.0)) {
        return Err(AnalysisError::configuration(format!(
            "classification weight of '{class}' must be non-negative, got {weight}"
        )));
    }
    Ok(TaskConfig::Classification {
        num_classes,
        num_top_classes: raw.num_top_classes.unwrap_or(0),
        prediction_field_type: raw.prediction_field_type.unwrap_or_default(),
        class_assignment_objective: objective,
        classification_weights: weights,
    })
}

/// Class labels as they appear in the frame.
pub fn class_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_and_supplied_flags() {
        let config = BoostedTreeConfig::parse(
            TrainingKind::Regression,
            "regression",
            &json!({"dependent_variable": "y", "eta": 0.3, "max_trees": 7}),
        )
        .unwrap();
        assert_eq!(config.prediction_field_name, "y_prediction");
        assert_eq!(config.boosting.eta, 0.3);
        assert_eq!(config.boosting.max_trees, 7);
        assert_eq!(config.supplied, vec!["eta", "max_trees"]);
        assert_eq!(config.loss(0), LossType::Mse);
        assert_eq!(config.task, BoostedTreeTask::Train);
        let importance = config.hyperparameter_importance();
        assert!(importance.iter().find(|h| h.name == "eta").unwrap().supplied);
        assert!(!importance.iter().find(|h| h.name == "lambda").unwrap().supplied);
    }

    #[test]
    fn rejects_bad_and_foreign_parameters() {
        for parameters in [
            json!({}),
            json!({"dependent_variable": "y", "unknown": 1}),
            json!({"dependent_variable": "y", "eta": 2.0}),
            json!({"dependent_variable": "y", "num_classes": 3}),
            json!({"dependent_variable": "y", "training_percent": 0}),
            json!({"dependent_variable": "y", "loss_function": "quantile"}),
        ] {
            let error = BoostedTreeConfig::parse(TrainingKind::Regression, "regression", &parameters).unwrap_err();
            assert!(error.is_configuration(), "{parameters}: {error}");
        }
        let error = BoostedTreeConfig::parse(
            TrainingKind::Classification,
            "classification",
            &json!({"dependent_variable": "y", "class_assignment_objective": "custom"}),
        )
        .unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn classification_settings() {
        let config = BoostedTreeConfig::parse(
            TrainingKind::Classification,
            "classification",
            &json!({
                "dependent_variable": "label",
                "num_classes": 3,
                "num_top_classes": -1,
                "prediction_field_type": "int",
                "class_assignment_objective": "custom",
                "classification_weights": [{"class": 0, "weight": 0.5}, {"class": "1", "weight": 2.0}],
            }),
        )
        .unwrap();
        assert_eq!(config.kind(), TrainingKind::Classification);
        assert_eq!(config.loss(3), LossType::MultinomialLogistic { n_classes: 3 });
        assert_eq!(config.loss(2), LossType::BinomialLogistic);
        let TaskConfig::Classification { classification_weights, num_top_classes, .. } = &config.task_config else {
            panic!("expected classification");
        };
        assert_eq!(*num_top_classes, -1);
        assert_eq!(classification_weights, &vec![("0".to_string(), 0.5), ("1".to_string(), 2.0)]);
    }

    #[test]
    fn huber_uses_the_loss_parameter() {
        let config = BoostedTreeConfig::parse(
            TrainingKind::Regression,
            "regression",
            &json!({"dependent_variable": "y", "loss_function": "huber", "loss_function_parameter": 2.5}),
        )
        .unwrap();
        assert_eq!(config.loss(0), LossType::PseudoHuber { delta: 2.5 });
    }
}
