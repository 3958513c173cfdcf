//! Unsupervised outlier detection with nearest neighbour methods.
//!
//! Every point is scored by one or more methods over its `k` nearest
//! neighbours. Raw method scores are mapped to [0, 1] so that the
//! `1 - outlier_fraction` quantile lands at 0.5, and the ensemble averages
//! the mapped scores.

use std::time::Instant;

use bon::Builder;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    AnalysisRunner, FrameShape, RunnerCore, RunnerFactory, RunnerSettings, parse_parameters,
};
use crate::data::{DataFrame, RowMask};
use crate::error::{AnalysisError, Result};
use crate::instrumentation::{AnalysisStats, OutlierParametersRecord, OutliersStats, TimingStats};
use crate::training::ParamsError;
use crate::utils::Parallelism;

pub const ANALYSIS_NAME: &str = "outlier_detection";
pub const TASK_COMPUTING_OUTLIERS: &str = "computing_outliers";

const MIN_NEIGHBOURS: usize = 5;
const MAX_NEIGHBOURS: usize = 100;
const SLICE_CAPACITY: usize = 10_000;
/// Steepness of the raw score to probability map.
const SCORE_STEEPNESS: f64 = 4.0;

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    Lof,
    Ldof,
    DistanceKthNn,
    DistanceKnn,
    #[default]
    Ensemble,
}

impl OutlierMethod {
    const SINGLE: [OutlierMethod; 4] = [
        OutlierMethod::Lof,
        OutlierMethod::Ldof,
        OutlierMethod::DistanceKthNn,
        OutlierMethod::DistanceKnn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OutlierMethod::Lof => "lof",
            OutlierMethod::Ldof => "ldof",
            OutlierMethod::DistanceKthNn => "distance_kth_nn",
            OutlierMethod::DistanceKnn => "distance_knn",
            OutlierMethod::Ensemble => "ensemble",
        }
    }

    /// The single methods this method combines.
    pub fn components(self) -> Vec<OutlierMethod> {
        match self {
            OutlierMethod::Ensemble => Self::SINGLE.to_vec(),
            method => vec![method],
        }
    }
}

/// Outlier detection parameters.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
#[serde(default, deny_unknown_fields)]
pub struct OutlierParams {
    #[builder(default)]
    pub method: OutlierMethod,
    /// Zero picks a value from the number of rows.
    #[builder(default = 0)]
    pub n_neighbors: usize,
    #[builder(default = true)]
    pub compute_feature_influence: bool,
    /// Rows scoring below this get no feature influence.
    #[builder(default = 0.1)]
    pub feature_influence_threshold: f64,
    #[builder(default = 0.05)]
    pub outlier_fraction: f64,
    #[builder(default = true)]
    pub standardization_enabled: bool,
}

impl Default for OutlierParams {
    fn default() -> Self {
        Self::builder().__build_internal()
    }
}

impl<S: outlier_params_builder::IsComplete> OutlierParamsBuilder<S> {
    pub fn build(self) -> Result<OutlierParams, ParamsError> {
        let params = self.__build_internal();
        params.validate()?;
        Ok(params)
    }
}

impl OutlierParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if !(0.0..=1.0).contains(&self.feature_influence_threshold) {
            return Err(ParamsError::Invalid(format!(
                "feature_influence_threshold must be in [0, 1], got {}",
                self.feature_influence_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.outlier_fraction) {
            return Err(ParamsError::Invalid(format!(
                "outlier_fraction must be in [0, 1), got {}",
                self.outlier_fraction
            )));
        }
        Ok(())
    }

    /// Neighbours used for `rows` points.
    pub fn neighbours(&self, rows: usize) -> usize {
        let k = if self.n_neighbors > 0 {
            self.n_neighbors
        } else {
            ((rows as f64).sqrt() / 2.0).round().clamp(MIN_NEIGHBOURS as f64, MAX_NEIGHBOURS as f64) as usize
        };
        k.min(rows.saturating_sub(1))
    }

    fn record(&self, rows: usize) -> OutlierParametersRecord {
        OutlierParametersRecord {
            n_neighbors: self.neighbours(rows),
            methods: self.method.components().iter().map(|m| m.name().to_string()).collect(),
            compute_feature_influence: self.compute_feature_influence,
            feature_influence_threshold: self.feature_influence_threshold,
            outlier_fraction: self.outlier_fraction,
            standardization_enabled: self.standardization_enabled,
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct OutliersRunnerFactory;

impl RunnerFactory for OutliersRunnerFactory {
    fn name(&self) -> &'static str {
        ANALYSIS_NAME
    }

    fn make_runner(&self, settings: &RunnerSettings, parameters: &Value) -> Result<Box<dyn AnalysisRunner>> {
        let params: OutlierParams = parse_parameters(ANALYSIS_NAME, parameters)?;
        params.validate()?;
        Ok(Box::new(OutliersRunner::new(settings, params)))
    }
}

#[derive(Debug)]
pub struct OutliersRunner {
    core: RunnerCore,
    params: OutlierParams,
}

impl OutliersRunner {
    pub fn new(settings: &RunnerSettings, params: OutlierParams) -> Self {
        Self {
            core: RunnerCore::new(settings),
            params,
        }
    }

    pub fn params(&self) -> &OutlierParams {
        &self.params
    }

    fn score_column(&self, frame: &DataFrame) -> usize {
        frame.number_input_columns()
    }
}

impl AnalysisRunner for OutliersRunner {
    fn core(&self) -> &RunnerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RunnerCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        ANALYSIS_NAME
    }

    fn number_extra_columns(&self) -> usize {
        if self.params.compute_feature_influence {
            1 + self.core.settings().cols
        } else {
            1
        }
    }

    fn data_frame_slice_capacity(&self) -> usize {
        self.execution_strategy().max_rows_per_partition.clamp(1, SLICE_CAPACITY)
    }

    fn estimate_bookkeeping_memory_usage(&self, shape: &FrameShape) -> u64 {
        let k = self.params.neighbours(shape.total_rows) as u64;
        let dims = self.core.settings().cols as u64;
        let methods = self.params.method.components().len() as u64;
        let points = shape.total_rows as u64 * dims * std::mem::size_of::<f32>() as u64;
        let neighbours = shape.total_rows as u64 * k * (std::mem::size_of::<usize>() + std::mem::size_of::<f64>()) as u64;
        let scores = shape.total_rows as u64 * methods * std::mem::size_of::<f64>() as u64;
        points + neighbours + scores
    }

    fn validate(&self, frame: &DataFrame) -> Result<()> {
        if frame.number_input_columns() != self.core.settings().cols {
            return Err(AnalysisError::runtime(format!(
                "expected {} input columns, frame has {}",
                self.core.settings().cols,
                frame.number_input_columns()
            )));
        }
        if let Some(column) = (0..frame.number_input_columns()).find(|&c| frame.is_categorical(c)) {
            return Err(AnalysisError::runtime(format!(
                "outlier detection needs numeric fields, '{}' is categorical",
                frame.column_names()[column]
            )));
        }
        Ok(())
    }

    fn rows_to_write_mask(&self, frame: &DataFrame) -> RowMask {
        RowMask::all(frame.number_rows())
    }

    fn write_one_row(&self, frame: &DataFrame, row: usize) -> Result<Value> {
        let score_column = self.score_column(frame);
        let score = f64::from(frame.value(row, score_column));
        let mut results = json!({ "outlier_score": score });
        if self.params.compute_feature_influence && score >= self.params.feature_influence_threshold {
            let influences: Vec<Value> = frame
                .input_column_names()
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    json!({
                        "feature_name": name,
                        "influence": f64::from(frame.value(row, score_column + 1 + i)),
                    })
                })
                .collect();
            results["feature_influence"] = Value::Array(influences);
        }
        Ok(results)
    }

    fn run_impl(&mut self, frame: &mut DataFrame, parallelism: Parallelism) -> Result<()> {
        let started = Instant::now();
        let instrumentation = self.instrumentation().clone();
        let rows = frame.number_rows();
        instrumentation.update_stats(|stats| {
            *stats = AnalysisStats::Outliers(OutliersStats {
                parameters: self.params.record(rows),
                timing_stats: TimingStats::default(),
            })
        });
        instrumentation.start_new_progress_monitored_task(TASK_COMPUTING_OUTLIERS);

        let points = prepare_points(frame, self.params.standardization_enabled);
        let k = self.params.neighbours(rows);
        let strategy = self.execution_strategy();
        let n_partitions = strategy.number_partitions.max(1) as f64;

        let bookkeeping = self.estimate_bookkeeping_memory_usage(&FrameShape {
            total_rows: rows,
            partition_rows: strategy.max_rows_per_partition,
            columns: frame.number_columns(),
            partitions: strategy.number_partitions,
            threads: self.core.settings().threads,
        }) as i64;
        instrumentation.update_memory_usage(bookkeeping);

        let mut neighbours = Vec::with_capacity(rows);
        for range in strategy.partitions(rows) {
            neighbours.extend(parallelism.maybe_par_map(range, |i| nearest_neighbours(&points, i, k)));
            instrumentation.update_progress(0.5 / n_partitions);
        }

        let methods = self.params.method.components();
        let mut scores = vec![0.0; rows];
        for method in &methods {
            let raw = method_scores(*method, &points, &neighbours, parallelism);
            for (score, p) in scores.iter_mut().zip(normalise(&raw, self.params.outlier_fraction)) {
                *score += p / methods.len() as f64;
            }
            instrumentation.update_progress(0.25 / methods.len() as f64);
        }

        let score_column = self.score_column(frame);
        let compute_influence = self.params.compute_feature_influence;
        let threshold = self.params.feature_influence_threshold;
        for range in strategy.partitions(rows) {
            let influences: Vec<Option<Vec<f64>>> = parallelism.maybe_par_map(range.clone(), |i| {
                (compute_influence && scores[i] >= threshold)
                    .then(|| feature_influence(&points, i, &neighbours[i]))
            });
            for (i, influence) in range.zip(influences) {
                frame.set_value(i, score_column, scores[i] as f32)?;
                for (j, value) in influence.into_iter().flatten().enumerate() {
                    frame.set_value(i, score_column + 1 + j, value as f32)?;
                }
            }
            instrumentation.update_progress(0.25 / n_partitions);
        }

        instrumentation.update_memory_usage(-bookkeeping);
        let elapsed = started.elapsed().as_millis() as u64;
        instrumentation.update_stats(|stats| {
            if let AnalysisStats::Outliers(outliers) = stats {
                outliers.timing_stats.elapsed_time = elapsed;
            }
        });
        instrumentation.flush("")?;
        Ok(())
    }
}

// =============================================================================
// Scoring
// =============================================================================

/// Input columns with missing values replaced by the column mean, optionally
/// standardized.
fn prepare_points(frame: &DataFrame, standardize: bool) -> Array2<f64> {
    let mut points = frame.input_values().mapv(f64::from);
    for mut column in points.axis_iter_mut(Axis(1)) {
        let present: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        let n = present.len().max(1) as f64;
        let mean = present.iter().sum::<f64>() / n;
        let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let scale = if standardize && variance > 0.0 { variance.sqrt() } else { 1.0 };
        let shift = if standardize { mean } else { 0.0 };
        column.mapv_inplace(|v| if v.is_nan() { mean } else { v });
        column.mapv_inplace(|v| (v - shift) / scale);
    }
    points
}

fn distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// The `k` nearest other points as `(index, distance)`, nearest first.
fn nearest_neighbours(points: &Array2<f64>, i: usize, k: usize) -> Vec<(usize, f64)> {
    let query = points.row(i);
    let mut all: Vec<(usize, f64)> = points
        .outer_iter()
        .enumerate()
        .filter(|&(j, _)| j != i)
        .map(|(j, point)| (j, distance(query, point)))
        .collect();
    all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    all.truncate(k);
    all
}

fn kth_distance(neighbours: &[(usize, f64)]) -> f64 {
    neighbours.last().map_or(0.0, |&(_, d)| d)
}

fn mean_distance(neighbours: &[(usize, f64)]) -> f64 {
    if neighbours.is_empty() {
        return 0.0;
    }
    neighbours.iter().map(|&(_, d)| d).sum::<f64>() / neighbours.len() as f64
}

fn method_scores(
    method: OutlierMethod,
    points: &Array2<f64>,
    neighbours: &[Vec<(usize, f64)>],
    parallelism: Parallelism,
) -> Vec<f64> {
    let rows = neighbours.len();
    match method {
        OutlierMethod::DistanceKthNn => neighbours.iter().map(|n| kth_distance(n)).collect(),
        OutlierMethod::DistanceKnn => neighbours.iter().map(|n| mean_distance(n)).collect(),
        OutlierMethod::Lof => {
            let reach = |i: usize| -> f64 {
                let n = &neighbours[i];
                if n.is_empty() {
                    return 0.0;
                }
                let mean = n
                    .iter()
                    .map(|&(j, d)| d.max(kth_distance(&neighbours[j])))
                    .sum::<f64>()
                    / n.len() as f64;
                if mean > 0.0 { 1.0 / mean } else { f64::INFINITY }
            };
            let density: Vec<f64> = parallelism.maybe_par_map(0..rows, reach);
            (0..rows)
                .map(|i| {
                    let n = &neighbours[i];
                    if n.is_empty() || !density[i].is_finite() {
                        return 1.0;
                    }
                    let ratio = n
                        .iter()
                        .map(|&(j, _)| density[j].min(f64::MAX))
                        .sum::<f64>()
                        / n.len() as f64;
                    ratio / density[i]
                })
                .collect()
        }
        OutlierMethod::Ldof => parallelism.maybe_par_map(0..rows, |i| {
            let n = &neighbours[i];
            if n.len() < 2 {
                return 0.0;
            }
            let mut inner = 0.0;
            for (a, &(p, _)) in n.iter().enumerate() {
                for &(q, _) in &n[a + 1..] {
                    inner += distance(points.row(p), points.row(q));
                }
            }
            let pairs = (n.len() * (n.len() - 1) / 2) as f64;
            let inner = inner / pairs;
            if inner > 0.0 { mean_distance(n) / inner } else { 0.0 }
        }),
        OutlierMethod::Ensemble => vec![0.0; rows],
    }
}

/// Map raw scores to [0, 1]; the `1 - outlier_fraction` quantile maps to 0.5.
fn normalise(raw: &[f64], outlier_fraction: f64) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<f64> = raw.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return vec![0.0; raw.len()];
    }
    sorted.sort_by(f64::total_cmp);
    let quantile = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];
    let median = quantile(0.5);
    let cutoff = quantile(1.0 - outlier_fraction);
    let spread = (cutoff - median).max(f64::EPSILON * median.abs().max(1.0));
    raw.iter()
        .map(|&s| {
            if s.is_nan() {
                0.0
            } else {
                1.0 / (1.0 + (-SCORE_STEEPNESS * (s - cutoff) / spread).exp())
            }
        })
        .collect()
}

/// Share of the squared distance to the neighbours contributed by each
/// feature.
fn feature_influence(points: &Array2<f64>, i: usize, neighbours: &[(usize, f64)]) -> Vec<f64> {
    let dims = points.ncols();
    let mut totals = vec![0.0; dims];
    for &(j, _) in neighbours {
        for (d, total) in totals.iter_mut().enumerate() {
            *total += (points[[i, d]] - points[[j, d]]).powi(2);
        }
    }
    let sum: f64 = totals.iter().sum();
    if sum > 0.0 {
        totals.iter_mut().for_each(|t| *t /= sum);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn clustered_frame() -> DataFrame {
        let mut frame = DataFrame::new(vec!["x".into(), "y".into()], &[], "\0");
        for i in 0..50 {
            let (x, y) = ((i % 7) as f64 * 0.1, (i % 5) as f64 * 0.1);
            frame.parse_and_write_row(&[x.to_string(), y.to_string()], i).unwrap();
        }
        frame.parse_and_write_row(&["10".to_string(), "0.2".to_string()], 50).unwrap();
        frame
    }

    fn runner(method: OutlierMethod) -> OutliersRunner {
        let settings = RunnerSettings::new("job", 51, 2, 1 << 30);
        let params = OutlierParams::builder().method(method).n_neighbors(5).build().unwrap();
        OutliersRunner::new(&settings, params)
    }

    #[rstest]
    #[case(OutlierMethod::Lof)]
    #[case(OutlierMethod::Ldof)]
    #[case(OutlierMethod::DistanceKthNn)]
    #[case(OutlierMethod::DistanceKnn)]
    #[case(OutlierMethod::Ensemble)]
    fn isolated_point_scores_highest(#[case] method: OutlierMethod) {
        let mut frame = clustered_frame();
        let mut runner = runner(method);
        runner.run(&mut frame).unwrap();

        let scores: Vec<f64> = (0..51).map(|r| f64::from(frame.value(r, 2))).collect();
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        let (max_row, _) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(max_row, 50);
        assert!(runner.instrumentation().finished());
        assert_relative_eq!(runner.instrumentation().progress(), 1.0, epsilon = 0.01);
    }

    #[test]
    fn feature_influence_points_at_the_deviating_feature() {
        let mut frame = clustered_frame();
        let mut runner = runner(OutlierMethod::Ensemble);
        runner.run(&mut frame).unwrap();

        let results = runner.write_one_row(&frame, 50).unwrap();
        let influence = results["feature_influence"].as_array().unwrap();
        assert_eq!(influence.len(), 2);
        assert_eq!(influence[0]["feature_name"], "x");
        assert!(influence[0]["influence"].as_f64().unwrap() > 0.9);
    }

    #[test]
    fn parameters_reject_unknown_keys_and_bad_values() {
        let settings = RunnerSettings::new("job", 10, 2, 1 << 20);
        assert!(
            OutliersRunnerFactory
                .make_runner(&settings, &json!({"method": "lof", "bogus": 1}))
                .unwrap_err()
                .is_configuration()
        );
        assert!(
            OutliersRunnerFactory
                .make_runner(&settings, &json!({"outlier_fraction": 1.5}))
                .unwrap_err()
                .is_configuration()
        );
        let runner = OutliersRunnerFactory
            .make_runner(&settings, &json!({"method": "distance_kth_nn", "compute_feature_influence": false}))
            .unwrap();
        assert_eq!(runner.number_extra_columns(), 1);
    }

    #[test]
    fn categorical_inputs_fail_validation() {
        let frame = DataFrame::new(vec!["x".into(), "c".into()], &["c".to_string()], "\0");
        assert!(runner(OutlierMethod::Lof).validate(&frame).is_err());
    }

    #[test]
    fn normalise_centres_the_cutoff() {
        let raw: Vec<f64> = (0..=100).map(f64::from).collect();
        let scores = normalise(&raw, 0.05);
        assert_relative_eq!(scores[95], 0.5, epsilon = 1e-12);
        assert!(scores[100] > 0.5 && scores[0] < 0.01);
    }
}
