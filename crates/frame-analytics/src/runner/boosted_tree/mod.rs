//! Boosted tree regression and classification runners.
//!
//! Both analyses share one runner: they differ in the loss, the extra
//! output columns, the row results and the model builder used to export
//! the trained model.

mod config;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

pub use config::{
    BoostedTreeConfig, BoostedTreeTask, ClassAssignmentObjective, ClassWeight, EARLY_STOPPING_ROUNDS,
    RawParameters, RegressionLoss, TaskConfig,
};

use super::{AnalysisRunner, FrameShape, RunnerCore, RunnerFactory, RunnerSettings};
use crate::data::{DataFrame, RowMask};
use crate::error::{AnalysisError, Result};
use crate::inference::{
    ClassificationModelBuilder, DataSummarization, InferenceModelDefinition, InferenceModelMetadata,
    PredictionFieldType, RegressionModelBuilder,
};
use crate::instrumentation::{AnalysisStats, TimingStats, TrainingKind, TrainingStats};
use crate::repr::Forest;
use crate::training::{
    BoostedTreeModel, BoostedTreeTrainer, CategoryEncoder, EncoderSettings, LossType, TrainingData,
    path_attribution,
};
use crate::utils::Parallelism;

pub const REGRESSION: &str = "regression";
pub const CLASSIFICATION: &str = "classification";
pub const TASK_FEATURE_SELECTION: &str = "feature_selection";
pub const TASK_FINAL_TRAINING: &str = "final_training";

const SLICE_CAPACITY: usize = 10_000;
/// Encoded features per input column, on average.
const ENCODING_EXPANSION: u64 = 3;
const NODE_BYTES: u64 = 64;

// =============================================================================
// Factories
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct RegressionRunnerFactory;

impl RunnerFactory for RegressionRunnerFactory {
    fn name(&self) -> &'static str {
        REGRESSION
    }

    fn make_runner(&self, settings: &RunnerSettings, parameters: &Value) -> Result<Box<dyn AnalysisRunner>> {
        let config = BoostedTreeConfig::parse(TrainingKind::Regression, REGRESSION, parameters)?;
        Ok(Box::new(BoostedTreeRunner::new(settings, config)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationRunnerFactory;

impl RunnerFactory for ClassificationRunnerFactory {
    fn name(&self) -> &'static str {
        CLASSIFICATION
    }

    fn make_runner(&self, settings: &RunnerSettings, parameters: &Value) -> Result<Box<dyn AnalysisRunner>> {
        let config = BoostedTreeConfig::parse(TrainingKind::Classification, CLASSIFICATION, parameters)?;
        Ok(Box::new(BoostedTreeRunner::new(settings, config)))
    }
}

// =============================================================================
// Runner
// =============================================================================

#[derive(Debug)]
pub struct BoostedTreeRunner {
    core: RunnerCore,
    config: BoostedTreeConfig,
    dependent_column: usize,
    model: Option<BoostedTreeModel>,
    training_rows: RowMask,
    class_labels: Vec<String>,
    class_weights: Vec<f64>,
    metadata: InferenceModelMetadata,
    summarization_rows: Vec<usize>,
}

impl BoostedTreeRunner {
    pub fn new(settings: &RunnerSettings, config: BoostedTreeConfig) -> Self {
        Self {
            core: RunnerCore::new(settings),
            config,
            dependent_column: 0,
            model: None,
            training_rows: RowMask::none(0),
            class_labels: Vec::new(),
            class_weights: Vec::new(),
            metadata: InferenceModelMetadata::new(),
            summarization_rows: Vec::new(),
        }
    }

    pub fn config(&self) -> &BoostedTreeConfig {
        &self.config
    }

    /// The trained (or restored) model once the run finished.
    pub fn model(&self) -> Option<&BoostedTreeModel> {
        self.model.as_ref()
    }

    pub fn class_weights(&self) -> &[f64] {
        &self.class_weights
    }

    fn is_classification(&self) -> bool {
        self.config.kind() == TrainingKind::Classification
    }

    fn find_dependent_column(&self, frame: &DataFrame) -> Result<usize> {
        let column = frame.column_index(&self.config.dependent_variable)?;
        if column >= frame.number_input_columns() {
            return Err(AnalysisError::runtime(format!(
                "dependent variable '{}' is not an input column",
                self.config.dependent_variable
            )));
        }
        Ok(column)
    }

    fn feature_columns(&self, frame: &DataFrame) -> Vec<usize> {
        (0..frame.number_input_columns())
            .filter(|&c| c != self.dependent_column)
            .collect()
    }

    fn restore(&self) -> Result<Option<BoostedTreeModel>> {
        let mut searcher = (self.core.settings().restore_searcher_supplier)();
        let model = searcher
            .latest()?
            .map(|document| BoostedTreeModel::from_json(&document))
            .transpose()?;
        if model.is_some() {
            tracing::info!(job_id = %self.core.settings().job_id, "restored boosted tree state");
        }
        Ok(model)
    }

    /// Renumber the frame's categories to the ids `model` was trained with.
    fn align_to_model(&self, frame: &mut DataFrame, model: &BoostedTreeModel) -> Result<()> {
        for (field, names) in &model.category_names {
            let column = frame.column_index(field)?;
            let unseen = frame
                .categories(column)
                .names()
                .iter()
                .filter(|name| !names.contains(*name))
                .count();
            if unseen > 0 {
                tracing::warn!(field = %field, unseen, "categories unseen in training are treated as missing");
            }
            frame.align_categories(column, names)?;
        }
        Ok(())
    }

    /// Categories of every categorical input field, by id.
    fn category_names_of(frame: &DataFrame) -> std::collections::BTreeMap<String, Vec<String>> {
        (0..frame.number_input_columns())
            .filter(|&column| frame.is_categorical(column))
            .map(|column| {
                (
                    frame.input_column_names()[column].clone(),
                    frame.categories(column).names().to_vec(),
                )
            })
            .collect()
    }

    fn persist(&self, model: &BoostedTreeModel) -> Result<()> {
        let mut persister = (self.core.settings().persister_supplier)();
        persister.add_document(&model.to_json()?)
    }

    /// Labelled rows split into training and held out rows.
    fn split_rows(&self, targets: &[f64], rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
        let fraction = self.config.training_percent / 100.0;
        let mut train = Vec::new();
        let mut validation = Vec::new();
        for (row, target) in targets.iter().enumerate() {
            if target.is_nan() {
                continue;
            }
            if fraction >= 1.0 || rng.random::<f64>() < fraction {
                train.push(row);
            } else {
                validation.push(row);
            }
        }
        (train, validation)
    }

    fn fit_encoder(
        &self,
        frame: &DataFrame,
        train_rows: &[usize],
        targets: &[f64],
        loss: LossType,
    ) -> CategoryEncoder {
        let n_columns = frame.number_input_columns();
        let columns = self.feature_columns(frame);
        let categorical: Vec<bool> = (0..n_columns).map(|c| frame.is_categorical(c)).collect();
        let category_counts: Vec<usize> = (0..n_columns).map(|c| frame.categories(c).len()).collect();
        let train_targets: Vec<f64> = train_rows.iter().map(|&r| targets[r]).collect();
        CategoryEncoder::fit(
            frame.input_values(),
            train_rows,
            &train_targets,
            &EncoderSettings {
                columns: &columns,
                categorical: &categorical,
                category_counts: &category_counts,
                target_mean: loss.n_outputs() == 1,
            },
        )
    }

    fn train(
        &self,
        model: &mut BoostedTreeModel,
        data: &TrainingData<'_>,
        rng: &mut StdRng,
        parallelism: Parallelism,
    ) -> (f64, Option<f64>) {
        let instrumentation = self.instrumentation().clone();
        instrumentation.start_new_progress_monitored_task(TASK_FINAL_TRAINING);

        let mut params = self.config.boosting.clone();
        let initial = (model.forest.n_trees() > 0).then(|| model.forest.clone());
        if self.config.task == BoostedTreeTask::Train {
            if let Some(forest) = &initial {
                params.max_trees = params.max_trees.saturating_sub(forest.n_trees().saturating_sub(1));
            }
        }
        let total = params.max_trees.max(1) as f64;

        let kind = self.config.kind();
        let record = self.config.hyperparameters_record();
        instrumentation.update_stats(|stats| {
            *stats = AnalysisStats::Training(TrainingStats {
                hyperparameters: record,
                ..TrainingStats::new(kind, model.loss.name())
            })
        });

        let trainer = BoostedTreeTrainer::new(model.loss, params);
        let outcome = trainer.train(data, initial, rng, parallelism, |report| {
            instrumentation.update_progress(1.0 / total);
            let elapsed_time = instrumentation.elapsed_millis();
            instrumentation.update_stats(|stats| {
                if let AnalysisStats::Training(training) = stats {
                    training.iteration = report.iteration + 1;
                    training.timing_stats = TimingStats {
                        elapsed_time,
                        iteration_time: Some(report.elapsed.as_millis() as u64),
                    };
                    training.add_fold_loss(0, report.validation_loss.unwrap_or(report.train_loss));
                }
            });
        });
        let remaining = 1.0 - instrumentation.progress();
        if remaining > 0.0 {
            instrumentation.update_progress(remaining);
        }
        tracing::debug!(
            job_id = %self.core.settings().job_id,
            iterations = outcome.iterations,
            trees = outcome.forest.n_trees(),
            train_loss = outcome.train_loss,
            "boosted tree training finished"
        );

        model.forest = outcome.forest;
        (outcome.train_loss, outcome.validation_loss)
    }

    fn compute_class_weights(&self, labels: &[String], targets: &[f64], train_rows: &[usize]) -> Result<Vec<f64>> {
        let TaskConfig::Classification { class_assignment_objective, classification_weights, .. } =
            &self.config.task_config
        else {
            return Ok(Vec::new());
        };
        let n = labels.len();
        match class_assignment_objective {
            ClassAssignmentObjective::MaximizeAccuracy => Ok(vec![1.0; n]),
            ClassAssignmentObjective::MaximizeMinimumRecall => {
                let mut counts = vec![0usize; n];
                for &row in train_rows {
                    if let Some(count) = counts.get_mut(targets[row] as usize) {
                        *count += 1;
                    }
                }
                let total = train_rows.len().max(1) as f64;
                Ok(counts
                    .iter()
                    .map(|&count| {
                        let prior = count as f64 / total;
                        if prior > 0.0 { 1.0 / (n as f64 * prior) } else { 1.0 }
                    })
                    .collect())
            }
            ClassAssignmentObjective::Custom => labels
                .iter()
                .map(|label| {
                    classification_weights
                        .iter()
                        .find(|(class, _)| class == label)
                        .map(|&(_, weight)| weight)
                        .ok_or_else(|| {
                            AnalysisError::configuration(format!("no classification weight for class '{label}'"))
                        })
                })
                .collect(),
        }
    }

    /// Write predictions into the extra columns, partition by partition.
    fn write_predictions(
        &self,
        frame: &mut DataFrame,
        model: &BoostedTreeModel,
        encoded: &Array2<f32>,
        parallelism: Parallelism,
    ) -> Result<()> {
        let base = frame.number_input_columns();
        let rows = frame.number_rows();
        for range in self.execution_strategy().partitions(rows) {
            let predictions: Vec<Vec<f64>> = parallelism.maybe_par_map(range.clone(), |row| {
                model.loss.transform(&model.forest.predict_raw(&encoded.row(row).to_vec()))
            });
            for (row, prediction) in range.zip(predictions) {
                if self.is_classification() {
                    let class = predicted_class(&prediction, &self.class_weights);
                    frame.set_value(row, base, class as f32)?;
                    frame.set_value(row, base + 1, prediction[class] as f32)?;
                    for (c, p) in prediction.iter().enumerate() {
                        frame.set_value(row, base + 2 + c, *p as f32)?;
                    }
                } else {
                    frame.set_value(row, base, prediction[0] as f32)?;
                }
            }
        }
        Ok(())
    }

    fn accumulate_feature_importance(
        &mut self,
        model: &BoostedTreeModel,
        encoded: &Array2<f32>,
        train_rows: &[usize],
        n_columns: usize,
        parallelism: Parallelism,
    ) {
        if self.config.num_top_feature_importance_values == 0 || model.forest.n_trees() == 0 {
            return;
        }
        let feature_columns = model.encoder.feature_columns();
        let attributions = parallelism.maybe_par_map(train_rows.to_vec(), |row| {
            path_attribution(&model.forest, &encoded.row(row).to_vec())
        });
        if let Some(first) = attributions.first() {
            self.metadata.set_feature_importance_baseline(first.baseline.clone());
        }
        for attribution in &attributions {
            for (column, values) in attribution.by_column(&feature_columns, n_columns).iter().enumerate() {
                if column != self.dependent_column {
                    self.metadata.add_to_feature_importance(column, values);
                }
            }
        }
    }

    fn choose_summarization_rows(&self, train_rows: &[usize], rng: &mut StdRng) -> Vec<usize> {
        let fraction = match (self.config.task, self.config.data_summarization_fraction) {
            (BoostedTreeTask::Encode, f) if f == 0.0 => 1.0,
            (_, f) => f,
        };
        if fraction <= 0.0 || train_rows.is_empty() {
            return Vec::new();
        }
        let rows: Vec<usize> = train_rows
            .iter()
            .copied()
            .filter(|_| fraction >= 1.0 || rng.random::<f64>() < fraction)
            .collect();
        if rows.is_empty() { vec![train_rows[0]] } else { rows }
    }

    fn label_json(&self, class: usize) -> Value {
        let label = self.class_labels.get(class).map(String::as_str).unwrap_or_default();
        self.prediction_field_type().to_json(label)
    }

    fn prediction_field_type(&self) -> PredictionFieldType {
        match self.config.task_config {
            TaskConfig::Classification { prediction_field_type, .. } => prediction_field_type,
            TaskConfig::Regression { .. } => PredictionFieldType::String,
        }
    }

    fn feature_importance_json(&self, frame: &DataFrame, model: &BoostedTreeModel, row: usize) -> Vec<Value> {
        let attribution = model.attribution(frame.row(row));
        let n_columns = frame.number_input_columns();
        let by_column = attribution.by_column(&model.encoder.feature_columns(), n_columns);
        let mut ranked: Vec<(usize, f64)> = by_column
            .iter()
            .enumerate()
            .filter(|&(column, _)| column != self.dependent_column)
            .map(|(column, values)| (column, values.iter().map(|v| v.abs()).sum::<f64>()))
            .filter(|&(_, magnitude)| magnitude > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.config.num_top_feature_importance_values);

        let names = frame.input_column_names();
        ranked
            .into_iter()
            .map(|(column, _)| {
                let values = &by_column[column];
                if !self.is_classification() {
                    return json!({"feature_name": names[column], "importance": values[0]});
                }
                let n_classes = self.class_labels.len();
                let per_class = if n_classes == 2 && values.len() == 1 {
                    vec![-values[0], values[0]]
                } else {
                    values.clone()
                };
                let classes: Vec<Value> = per_class
                    .iter()
                    .enumerate()
                    .map(|(class, importance)| {
                        json!({"class_name": self.label_json(class), "importance": importance})
                    })
                    .collect();
                json!({"feature_name": names[column], "classes": classes})
            })
            .collect()
    }
}

/// Class with the highest weighted probability, lowest index on ties.
fn predicted_class(probabilities: &[f64], weights: &[f64]) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (class, p) in probabilities.iter().enumerate() {
        let score = weights.get(class).copied().unwrap_or(1.0) * p;
        if score > best_score {
            best = class;
            best_score = score;
        }
    }
    best
}

impl AnalysisRunner for BoostedTreeRunner {
    fn core(&self) -> &RunnerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RunnerCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        match self.config.kind() {
            TrainingKind::Regression => REGRESSION,
            TrainingKind::Classification => CLASSIFICATION,
        }
    }

    fn number_extra_columns(&self) -> usize {
        match self.config.num_classes() {
            Some(n_classes) => 2 + n_classes,
            None => 1,
        }
    }

    fn data_frame_slice_capacity(&self) -> usize {
        self.execution_strategy().max_rows_per_partition.clamp(1, SLICE_CAPACITY)
    }

    fn estimate_bookkeeping_memory_usage(&self, shape: &FrameShape) -> u64 {
        let rows = shape.total_rows as u64;
        let outputs = match self.config.num_classes() {
            Some(n) if n > 2 => n as u64,
            _ => 1,
        };
        let encoded = rows * shape.columns as u64 * std::mem::size_of::<f32>() as u64 * ENCODING_EXPANSION;
        let gradients = rows * outputs * std::mem::size_of::<f64>() as u64 * 3;
        let depth = (self.config.boosting.max_depth() as u32 + 1).min(20);
        let nodes_per_tree = (1u64 << depth).min(2 * rows.max(1));
        let forest = (self.config.boosting.max_trees as u64 + 1)
            * nodes_per_tree
            * (NODE_BYTES + outputs * std::mem::size_of::<f64>() as u64);
        let scratch = shape.threads.max(1) as u64 * shape.partition_rows as u64 * 16;
        encoded + gradients + forest + scratch
    }

    fn validate(&self, frame: &DataFrame) -> Result<()> {
        let settings = self.core.settings();
        if frame.number_input_columns() != settings.cols {
            return Err(AnalysisError::runtime(format!(
                "expected {} input columns, frame has {}",
                settings.cols,
                frame.number_input_columns()
            )));
        }
        let dependent = self.find_dependent_column(frame)?;
        if frame.number_input_columns() < 2 {
            return Err(AnalysisError::runtime("no feature columns besides the dependent variable"));
        }
        match (self.config.kind(), frame.is_categorical(dependent)) {
            (TrainingKind::Classification, false) => Err(AnalysisError::runtime(format!(
                "classification needs a categorical dependent variable, '{}' is numeric",
                self.config.dependent_variable
            ))),
            (TrainingKind::Regression, true) => Err(AnalysisError::runtime(format!(
                "regression needs a numeric dependent variable, '{}' is categorical",
                self.config.dependent_variable
            ))),
            _ => Ok(()),
        }
    }

    fn rows_to_write_mask(&self, frame: &DataFrame) -> RowMask {
        match self.config.task {
            BoostedTreeTask::Encode => RowMask::none(frame.number_rows()),
            _ => RowMask::all(frame.number_rows()),
        }
    }

    fn write_one_row(&self, frame: &DataFrame, row: usize) -> Result<Value> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| AnalysisError::runtime("no model to write results for"))?;
        let base = frame.number_input_columns();
        let field = &self.config.prediction_field_name;
        let mut results = serde_json::Map::new();

        if let TaskConfig::Classification { num_top_classes, .. } = self.config.task_config {
            let n_classes = self.class_labels.len();
            let class = frame.value(row, base) as usize;
            let probabilities: Vec<f64> = (0..n_classes)
                .map(|c| f64::from(frame.value(row, base + 2 + c)))
                .collect();
            let weight = |c: usize| self.class_weights.get(c).copied().unwrap_or(1.0);
            results.insert(field.clone(), self.label_json(class));
            results.insert("prediction_probability".into(), json!(probabilities[class]));
            results.insert("prediction_score".into(), json!(weight(class) * probabilities[class]));
            if num_top_classes != 0 {
                let mut ranked: Vec<usize> = (0..n_classes).collect();
                ranked.sort_by(|&a, &b| {
                    (weight(b) * probabilities[b]).total_cmp(&(weight(a) * probabilities[a])).then(a.cmp(&b))
                });
                if num_top_classes > 0 {
                    ranked.truncate(num_top_classes as usize);
                }
                let top: Vec<Value> = ranked
                    .into_iter()
                    .map(|c| {
                        json!({
                            "class_name": self.label_json(c),
                            "class_probability": probabilities[c],
                            "class_score": weight(c) * probabilities[c],
                        })
                    })
                    .collect();
                results.insert("top_classes".into(), Value::Array(top));
            }
        } else {
            results.insert(field.clone(), json!(f64::from(frame.value(row, base))));
        }

        if self.config.num_top_feature_importance_values > 0 {
            let importance = self.feature_importance_json(frame, model, row);
            if !importance.is_empty() {
                results.insert("feature_importance".into(), Value::Array(importance));
            }
        }
        results.insert("is_training".into(), json!(self.training_rows.contains(row)));
        Ok(Value::Object(results))
    }

    fn run_impl(&mut self, frame: &mut DataFrame, parallelism: Parallelism) -> Result<()> {
        let instrumentation = self.instrumentation().clone();
        self.dependent_column = self.find_dependent_column(frame)?;
        let dependent = self.dependent_column;

        let restored = self.restore()?;
        if self.config.task.needs_restored_model() && restored.is_none() {
            return Err(AnalysisError::runtime(format!(
                "task {:?} needs a restored model but none was found",
                self.config.task
            )));
        }

        if let Some(model) = &restored {
            self.align_to_model(frame, model)?;
        }
        let trained_labels = restored
            .as_ref()
            .and_then(|model| model.category_names.get(&self.config.dependent_variable));
        let labels: Vec<String> = match trained_labels {
            Some(labels) if self.is_classification() => labels.clone(),
            _ => frame.categories(dependent).names().to_vec(),
        };
        if let Some(num_classes) = self.config.num_classes() {
            if labels.len() < 2 {
                return Err(AnalysisError::runtime(format!(
                    "classification needs at least two classes, found {}",
                    labels.len()
                )));
            }
            if labels.len() > num_classes {
                return Err(AnalysisError::runtime(format!(
                    "found {} classes but num_classes is {num_classes}",
                    labels.len()
                )));
            }
        }
        let loss = match &restored {
            Some(model) => model.loss,
            None => self.config.loss(labels.len()),
        };

        let mut rng = StdRng::seed_from_u64(self.config.boosting.seed);
        let n_labels = labels.len();
        let is_classification = self.is_classification();
        let targets: Vec<f64> = frame
            .column(dependent)
            .iter()
            .map(|&v| match f64::from(v) {
                class if is_classification && class >= n_labels as f64 => f64::NAN,
                target => target,
            })
            .collect();
        let (train_rows, validation_rows) = self.split_rows(&targets, &mut rng);
        if train_rows.is_empty() && self.config.task != BoostedTreeTask::Predict {
            return Err(AnalysisError::runtime("no rows with a value for the dependent variable"));
        }
        self.training_rows = RowMask::from_fn(frame.number_rows(), |row| train_rows.binary_search(&row).is_ok());

        instrumentation.start_new_progress_monitored_task(TASK_FEATURE_SELECTION);
        let mut model = match restored {
            Some(model) => model,
            None => {
                let encoder = self.fit_encoder(frame, &train_rows, &targets, loss);
                let mut model = BoostedTreeModel::new(encoder, Forest::new(loss.n_outputs()), loss);
                model.category_names = Self::category_names_of(frame);
                model
            }
        };
        if !self.config.feature_processors.is_empty() {
            model.custom_processors = self.config.feature_processors.clone();
        }
        let encoded = model.encoder.encode(frame.input_values());
        let encoded_bytes = (encoded.len() * std::mem::size_of::<f32>()) as i64;
        instrumentation.update_memory_usage(encoded_bytes);
        instrumentation.update_progress(1.0);

        let mut losses = (None, None);
        if matches!(self.config.task, BoostedTreeTask::Train | BoostedTreeTask::Update) {
            let data = TrainingData {
                features: encoded.view(),
                targets: &targets,
                train_rows: &train_rows,
                validation_rows: if self.config.early_stopping_enabled { &validation_rows[..] } else { &[] },
            };
            let (train_loss, validation_loss) = self.train(&mut model, &data, &mut rng, parallelism);
            losses = (Some(train_loss), validation_loss);
        }

        if self.is_classification() {
            self.class_labels = labels.clone();
            self.class_weights = self.compute_class_weights(&labels, &targets, &train_rows)?;
            model.classification_weights = Some(self.class_weights.clone());
        }
        model.validate()?;
        instrumentation.update_memory_usage(model.memory_usage() as i64);

        if self.config.task != BoostedTreeTask::Encode {
            self.write_predictions(frame, &model, &encoded, parallelism)?;
        }
        if matches!(self.config.task, BoostedTreeTask::Train | BoostedTreeTask::Update) {
            self.persist(&model)?;
        }

        self.metadata.set_column_names(frame.input_column_names().to_vec());
        if self.is_classification() {
            self.metadata.set_class_values(labels);
            self.metadata.set_prediction_field_type(self.prediction_field_type());
        }
        self.metadata.set_hyperparameter_importance(self.config.hyperparameter_importance());
        self.metadata.set_num_train_rows(match self.config.task {
            BoostedTreeTask::Train | BoostedTreeTask::Update => train_rows.len(),
            _ => self.config.previous_train_num_rows.unwrap_or(0),
        });
        self.metadata.set_loss_gap(match losses {
            (Some(train), Some(validation)) => (validation - train).max(0.0),
            _ => self.config.previous_train_loss_gap.unwrap_or(0.0),
        });
        self.metadata.set_trained_model_memory_usage(model.memory_usage());
        self.accumulate_feature_importance(&model, &encoded, &train_rows, frame.number_input_columns(), parallelism);
        self.summarization_rows = self.choose_summarization_rows(&train_rows, &mut rng);
        self.metadata.set_num_data_summarization_rows(self.summarization_rows.len());

        instrumentation.update_memory_usage(-encoded_bytes);
        self.model = Some(model);
        instrumentation.flush("")?;
        Ok(())
    }

    fn inference_model_definition(
        &self,
        field_names: &[String],
        category_names: &[Vec<String>],
    ) -> Result<Option<InferenceModelDefinition>> {
        let Some(model) = &self.model else {
            return Ok(None);
        };
        let definition = if self.is_classification() {
            let mut category_names = category_names.to_vec();
            if let Some(labels) = category_names.get_mut(self.dependent_column) {
                labels.clone_from(&self.class_labels);
            }
            let mut builder =
                ClassificationModelBuilder::new(field_names.to_vec(), self.dependent_column, category_names);
            model.accept(&mut builder);
            builder.build()
        } else {
            let mut builder = RegressionModelBuilder::new(field_names.to_vec(), category_names.to_vec());
            model.accept(&mut builder);
            builder.build()
        };
        Ok(Some(definition.with_metadata(&self.metadata)?))
    }

    fn inference_model_metadata(&self) -> Option<InferenceModelMetadata> {
        self.model.as_ref().map(|_| self.metadata.clone())
    }

    fn data_summarization(&self, frame: &DataFrame) -> Option<DataSummarization> {
        if self.summarization_rows.is_empty() {
            return None;
        }
        let n_columns = frame.number_input_columns();
        let column_names = frame.input_column_names().to_vec();
        let encodings = match self.inference_model_definition(&column_names, &frame.category_names()) {
            Ok(Some(definition)) => definition.preprocessors().to_vec(),
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::error!(%error, "failed to build encodings for data summarization");
                return None;
            }
        };
        let data = self
            .summarization_rows
            .iter()
            .map(|&row| {
                (0..n_columns)
                    .map(|column| {
                        if frame.is_categorical(column) {
                            frame.category_of(row, column).map_or(Value::Null, |name| json!(name))
                        } else {
                            let value = frame.value(row, column);
                            if value.is_nan() { Value::Null } else { json!(f64::from(value)) }
                        }
                    })
                    .collect()
            })
            .collect();
        Some(DataSummarization {
            num_columns: n_columns,
            categorical_column_names: (0..n_columns)
                .filter(|&c| frame.is_categorical(c))
                .map(|c| column_names[c].clone())
                .collect(),
            column_names,
            data,
            encodings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStateStore;
    use crate::runner::RunnerState;
    use approx::assert_relative_eq;

    fn regression_frame(rows: usize) -> DataFrame {
        regression_frame_in(0..rows)
    }

    /// Rows `order` of the regression data; the doc hash is the row number.
    fn regression_frame_in(order: impl IntoIterator<Item = usize>) -> DataFrame {
        let mut frame = DataFrame::new(
            vec!["x".into(), "colour".into(), "target".into()],
            &["colour".to_string()],
            "",
        );
        for i in order {
            let colour = ["red", "green", "blue"][i % 3];
            let target = i as f64 + if colour == "red" { 25.0 } else { 0.0 };
            frame
                .parse_and_write_row(&[i.to_string(), colour.to_string(), target.to_string()], i as i32)
                .unwrap();
        }
        frame
    }

    fn classification_frame(rows: usize) -> DataFrame {
        classification_frame_in(0..rows)
    }

    fn classification_frame_in(order: impl IntoIterator<Item = usize>) -> DataFrame {
        let mut frame = DataFrame::new(vec!["x".into(), "label".into()], &["label".to_string()], "");
        for i in order {
            let label = if i % 10 < 3 { "yes" } else { "no" };
            frame.parse_and_write_row(&[i.to_string(), label.to_string()], i as i32).unwrap();
        }
        frame
    }

    fn regression_runner(settings: &RunnerSettings, parameters: Value) -> BoostedTreeRunner {
        let config = BoostedTreeConfig::parse(TrainingKind::Regression, REGRESSION, &parameters).unwrap();
        BoostedTreeRunner::new(settings, config)
    }

    fn classification_runner(settings: &RunnerSettings, parameters: Value) -> BoostedTreeRunner {
        let config = BoostedTreeConfig::parse(TrainingKind::Classification, CLASSIFICATION, &parameters).unwrap();
        BoostedTreeRunner::new(settings, config)
    }

    #[test]
    fn regression_learns_the_trend() {
        let settings = RunnerSettings::new("job", 120, 3, 1 << 30);
        let mut runner = regression_runner(
            &settings,
            json!({"dependent_variable": "target", "max_trees": 40, "num_top_feature_importance_values": 2}),
        );
        let mut frame = regression_frame(120);
        runner.validate(&frame).unwrap();
        runner.run(&mut frame).unwrap();

        assert_eq!(runner.core().state(), RunnerState::Finished);
        assert!(runner.instrumentation().finished());
        assert_relative_eq!(runner.instrumentation().progress(), 1.0, epsilon = 0.01);
        assert!(frame.value(110, 3) > frame.value(10, 3));
        assert!(frame.value(30, 3) > frame.value(31, 3));

        let results = runner.write_one_row(&frame, 5).unwrap();
        assert!(results["target_prediction"].is_f64());
        assert_eq!(results["is_training"], json!(true));
        let importance = results["feature_importance"].as_array().unwrap();
        assert!(!importance.is_empty() && importance.len() <= 2);
        assert!(importance.iter().all(|f| f["feature_name"] != "target"));
    }

    #[test]
    fn regression_definition_carries_encodings_and_metadata() {
        let settings = RunnerSettings::new("job", 120, 3, 1 << 30);
        let mut runner = regression_runner(
            &settings,
            json!({"dependent_variable": "target", "max_trees": 5, "data_summarization_fraction": 0.5}),
        );
        let mut frame = regression_frame(120);
        runner.run(&mut frame).unwrap();

        let definition = runner
            .inference_model_definition(frame.input_column_names(), &frame.category_names())
            .unwrap()
            .unwrap();
        assert_eq!(definition.preprocessors().len(), 3);
        assert!(definition.metadata.is_some());

        let summarization = runner.data_summarization(&frame).unwrap();
        assert_eq!(summarization.num_columns, 3);
        assert_eq!(summarization.categorical_column_names, vec!["colour".to_string()]);
        assert!(!summarization.data.is_empty());
        assert_eq!(summarization.encodings.len(), 3);
    }

    #[test]
    fn classification_score_is_weighted_probability() {
        let settings = RunnerSettings::new("job", 100, 2, 1 << 30);
        let mut runner = classification_runner(
            &settings,
            json!({"dependent_variable": "label", "max_trees": 10, "num_top_classes": -1}),
        );
        let mut frame = classification_frame(100);
        runner.validate(&frame).unwrap();
        runner.run(&mut frame).unwrap();

        let weights = runner.class_weights().to_vec();
        assert_eq!(weights.len(), 2);
        for row in [0, 3, 57] {
            let results = runner.write_one_row(&frame, row).unwrap();
            let label = results["label_prediction"].as_str().unwrap();
            let class = frame.categories(1).id(label).unwrap();
            let probability = results["prediction_probability"].as_f64().unwrap();
            let score = results["prediction_score"].as_f64().unwrap();
            assert_relative_eq!(score, weights[class] * probability, epsilon = 1e-6);
            assert_eq!(results["top_classes"].as_array().unwrap().len(), 2);
        }
    }

    #[test]
    fn minimum_recall_weights_favour_the_rare_class() {
        let settings = RunnerSettings::new("job", 100, 2, 1 << 30);
        let mut runner = classification_runner(&settings, json!({"dependent_variable": "label", "max_trees": 2}));
        let mut frame = classification_frame(100);
        runner.run(&mut frame).unwrap();

        let yes = frame.categories(1).id("yes").unwrap();
        let no = frame.categories(1).id("no").unwrap();
        assert!(runner.class_weights()[yes] > runner.class_weights()[no]);
    }

    #[test]
    fn custom_objective_needs_a_weight_for_every_class() {
        let settings = RunnerSettings::new("job", 100, 2, 1 << 30);
        let mut runner = classification_runner(
            &settings,
            json!({
                "dependent_variable": "label",
                "max_trees": 2,
                "class_assignment_objective": "custom",
                "classification_weights": [{"class": "yes", "weight": 2.0}]
            }),
        );
        let mut frame = classification_frame(100);
        let error = runner.run(&mut frame).unwrap_err();
        assert!(error.is_configuration());
        assert_eq!(runner.core().state(), RunnerState::Failed);
        assert!(!runner.instrumentation().finished());
    }

    #[test]
    fn predict_without_a_restored_model_fails() {
        let settings = RunnerSettings::new("job", 60, 3, 1 << 30);
        let mut runner = regression_runner(&settings, json!({"dependent_variable": "target", "task": "predict"}));
        let mut frame = regression_frame(60);
        assert!(runner.run(&mut frame).is_err());
        assert_eq!(runner.core().state(), RunnerState::Failed);
    }

    #[test]
    fn update_extends_the_persisted_forest() {
        let store = MemoryStateStore::new();
        let mut settings = RunnerSettings::new("job", 60, 3, 1 << 30);
        settings.persister_supplier = store.persister_supplier();
        settings.restore_searcher_supplier = store.restore_searcher_supplier();

        let mut runner = regression_runner(&settings, json!({"dependent_variable": "target", "max_trees": 3}));
        runner.run(&mut regression_frame(60)).unwrap();
        let trained = runner.model().unwrap().forest.n_trees();
        assert_eq!(store.documents().len(), 1);

        let mut updater = regression_runner(
            &settings,
            json!({"dependent_variable": "target", "max_trees": 2, "task": "update", "early_stopping_enabled": false}),
        );
        updater.run(&mut regression_frame(60)).unwrap();
        assert_eq!(updater.model().unwrap().forest.n_trees(), trained + 2);
        assert_eq!(store.documents().len(), 2);
    }

    fn persisting_settings(store: &MemoryStateStore, rows: usize, cols: usize) -> RunnerSettings {
        let mut settings = RunnerSettings::new("job", rows, cols, 1 << 30);
        settings.persister_supplier = store.persister_supplier();
        settings.restore_searcher_supplier = store.restore_searcher_supplier();
        settings
    }

    /// Output column `column` of every row, keyed by doc hash.
    fn outputs_by_doc(frame: &DataFrame, column: usize) -> std::collections::BTreeMap<i32, f32> {
        (0..frame.number_rows())
            .map(|row| (frame.doc_hash(row), frame.value(row, column)))
            .collect()
    }

    #[test]
    fn restored_regression_model_matches_categories_by_name() {
        let store = MemoryStateStore::new();
        let settings = persisting_settings(&store, 60, 3);
        let mut trainer = regression_runner(&settings, json!({"dependent_variable": "target", "max_trees": 10}));
        let mut trained_frame = regression_frame(60);
        trainer.run(&mut trained_frame).unwrap();
        let trained_definition = trainer
            .inference_model_definition(trained_frame.input_column_names(), &trained_frame.category_names())
            .unwrap()
            .unwrap();

        // Reversed rows see "blue" first, so fresh ids would differ.
        let mut reversed = regression_frame_in((0..60).rev());
        assert_eq!(reversed.categories(1).name(0), Some("blue"));
        let mut predictor = regression_runner(&settings, json!({"dependent_variable": "target", "task": "predict"}));
        predictor.run(&mut reversed).unwrap();
        assert_eq!(reversed.categories(1).names(), trained_frame.categories(1).names());

        let expected = outputs_by_doc(&trained_frame, 3);
        for (doc, prediction) in outputs_by_doc(&reversed, 3) {
            assert_relative_eq!(prediction, expected[&doc], epsilon = 1e-4);
        }
        let restored_definition = predictor
            .inference_model_definition(reversed.input_column_names(), &reversed.category_names())
            .unwrap()
            .unwrap();
        assert_eq!(restored_definition.preprocessors(), trained_definition.preprocessors());
    }

    #[test]
    fn restored_classifier_keeps_its_class_labels() {
        let store = MemoryStateStore::new();
        let settings = persisting_settings(&store, 100, 2);
        let mut trainer = classification_runner(&settings, json!({"dependent_variable": "label", "max_trees": 5}));
        let mut trained_frame = classification_frame(100);
        trainer.run(&mut trained_frame).unwrap();

        let mut reversed = classification_frame_in((0..100).rev());
        assert_eq!(reversed.categories(1).name(0), Some("no"));
        let mut predictor =
            classification_runner(&settings, json!({"dependent_variable": "label", "task": "predict"}));
        predictor.run(&mut reversed).unwrap();

        let labels = trained_frame.categories(1).names().to_vec();
        assert_eq!(predictor.class_labels, labels);
        let rows_by_doc: std::collections::BTreeMap<i32, usize> =
            (0..100).map(|row| (reversed.doc_hash(row), row)).collect();
        for row in [0, 3, 42, 97] {
            let expected = trainer.write_one_row(&trained_frame, row).unwrap();
            let actual = predictor
                .write_one_row(&reversed, rows_by_doc[&trained_frame.doc_hash(row)])
                .unwrap();
            assert_eq!(actual["label_prediction"], expected["label_prediction"]);
            assert_relative_eq!(
                actual["prediction_probability"].as_f64().unwrap(),
                expected["prediction_probability"].as_f64().unwrap(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn encode_task_writes_no_rows() {
        let settings = RunnerSettings::new("job", 30, 3, 1 << 30);
        let mut runner = regression_runner(&settings, json!({"dependent_variable": "target", "task": "encode"}));
        let mut frame = regression_frame(30);
        runner.run(&mut frame).unwrap();

        assert_eq!(runner.rows_to_write_mask(&frame).count(), 0);
        assert_eq!(runner.model().unwrap().forest.n_trees(), 0);
        assert_eq!(runner.data_summarization(&frame).unwrap().data.len(), 30);
    }

    #[test]
    fn validation_checks_the_dependent_variable() {
        let settings = RunnerSettings::new("job", 30, 3, 1 << 30);
        let frame = regression_frame(30);

        let runner = regression_runner(&settings, json!({"dependent_variable": "colour"}));
        assert!(runner.validate(&frame).is_err());
        let runner = classification_runner(&settings, json!({"dependent_variable": "target"}));
        assert!(runner.validate(&frame).is_err());
        let runner = regression_runner(&settings, json!({"dependent_variable": "missing"}));
        assert!(runner.validate(&frame).is_err());
    }

    #[test]
    fn extra_columns_follow_the_task() {
        let settings = RunnerSettings::new("job", 30, 3, 1 << 30);
        let regression = regression_runner(&settings, json!({"dependent_variable": "target"}));
        assert_eq!(regression.number_extra_columns(), 1);
        let classification = classification_runner(&settings, json!({"dependent_variable": "label", "num_classes": 3}));
        assert_eq!(classification.number_extra_columns(), 5);
    }
}
