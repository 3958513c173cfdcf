//! Test helpers: job specification factory, synthetic rows and a mock
//! runner.
//!
//! Public so integration tests and downstream hosts can build jobs the same
//! way the crate's own tests do.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};

use crate::analyzer::{CONTROL_FIELD_NAME, DataFrameAnalyzer, RUN_ANALYSIS};
use crate::data::{DataFrame, RowMask};
use crate::error::Result;
use crate::persist::{
    PersisterSupplier, RestoreSearcherSupplier, noop_persister_supplier, noop_restore_searcher_supplier,
};
use crate::runner::{AnalysisRunner, FrameShape, RunnerCore, RunnerFactory, RunnerRegistry, RunnerSettings};
use crate::spec::AnalysisSpecification;
use crate::utils::Parallelism;

pub const MOCK_ANALYSIS: &str = "test";
const MOCK_STEPS: usize = 31;
const MOCK_SLICE_CAPACITY: usize = 10_000;
const DEFAULT_MOCK_SEED: u64 = 42;

// =============================================================================
// Mock runner
// =============================================================================

/// Runner which only sleeps and reports progress.
#[derive(Debug)]
pub struct MockRunner {
    core: RunnerCore,
    rng: StdRng,
}

impl MockRunner {
    pub fn new(settings: &RunnerSettings, rng: StdRng) -> Self {
        Self {
            core: RunnerCore::new(settings),
            rng,
        }
    }
}

impl AnalysisRunner for MockRunner {
    fn core(&self) -> &RunnerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RunnerCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        MOCK_ANALYSIS
    }

    fn number_extra_columns(&self) -> usize {
        2
    }

    fn data_frame_slice_capacity(&self) -> usize {
        MOCK_SLICE_CAPACITY
    }

    fn estimate_bookkeeping_memory_usage(&self, _shape: &FrameShape) -> u64 {
        0
    }

    fn validate(&self, _frame: &DataFrame) -> Result<()> {
        Ok(())
    }

    fn rows_to_write_mask(&self, frame: &DataFrame) -> RowMask {
        RowMask::all(frame.number_rows())
    }

    fn write_one_row(&self, _frame: &DataFrame, _row: usize) -> Result<Value> {
        Ok(json!({}))
    }

    fn run_impl(&mut self, _frame: &mut DataFrame, _parallelism: Parallelism) -> Result<()> {
        let instrumentation = self.instrumentation().clone();
        for _ in 0..MOCK_STEPS {
            let wait = self.rng.random_range(1..=20);
            std::thread::sleep(Duration::from_millis(wait));
            instrumentation.update_progress(1.0 / MOCK_STEPS as f64);
        }
        Ok(())
    }
}

/// Makes [`MockRunner`]s whose sleeps are drawn from `seed`.
#[derive(Debug, Clone, Copy)]
pub struct MockRunnerFactory {
    seed: u64,
}

impl MockRunnerFactory {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl RunnerFactory for MockRunnerFactory {
    fn name(&self) -> &'static str {
        MOCK_ANALYSIS
    }

    fn make_runner(&self, settings: &RunnerSettings, _parameters: &Value) -> Result<Box<dyn AnalysisRunner>> {
        Ok(Box::new(MockRunner::new(settings, StdRng::seed_from_u64(self.seed))))
    }
}

/// The standard runners plus the mock runner.
pub fn testing_registry(seed: u64) -> RunnerRegistry {
    RunnerRegistry::standard().with(MockRunnerFactory::new(seed))
}

// =============================================================================
// Specification factory
// =============================================================================

/// Builds job specifications for tests.
///
/// Defaults to a valid outlier detection job over 100 rows and 3 columns.
pub struct SpecificationFactory {
    job_id: String,
    rows: usize,
    cols: usize,
    memory_limit: u64,
    threads: usize,
    temp_dir: String,
    results_field: String,
    missing_field_value: Option<String>,
    categorical_fields: Vec<String>,
    disk_usage_allowed: bool,
    analysis: String,
    parameters: Map<String, Value>,
    persister_supplier: PersisterSupplier,
    restore_searcher_supplier: RestoreSearcherSupplier,
    mock_seed: u64,
}

impl Default for SpecificationFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecificationFactory {
    pub fn new() -> Self {
        Self {
            job_id: "testJob".to_string(),
            rows: 100,
            cols: 3,
            memory_limit: 100_000_000,
            threads: 1,
            temp_dir: ".".to_string(),
            results_field: "ml".to_string(),
            missing_field_value: None,
            categorical_fields: Vec::new(),
            disk_usage_allowed: true,
            analysis: "outlier_detection".to_string(),
            parameters: Map::new(),
            persister_supplier: noop_persister_supplier(),
            restore_searcher_supplier: noop_restore_searcher_supplier(),
            mock_seed: DEFAULT_MOCK_SEED,
        }
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn cols(mut self, cols: usize) -> Self {
        self.cols = cols;
        self
    }

    pub fn memory_limit(mut self, memory_limit: u64) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn temp_dir(mut self, temp_dir: impl Into<String>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn results_field(mut self, results_field: impl Into<String>) -> Self {
        self.results_field = results_field.into();
        self
    }

    pub fn missing_field_value(mut self, missing: impl Into<String>) -> Self {
        self.missing_field_value = Some(missing.into());
        self
    }

    pub fn categorical_fields(mut self, fields: Vec<String>) -> Self {
        self.categorical_fields = fields;
        self
    }

    pub fn disk_usage_allowed(mut self, allowed: bool) -> Self {
        self.disk_usage_allowed = allowed;
        self
    }

    pub fn analysis(mut self, name: impl Into<String>) -> Self {
        self.analysis = name.into();
        self
    }

    /// Set one `analysis.parameters` entry.
    pub fn parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// A regression job predicting `dependent_variable`.
    pub fn regression(self, dependent_variable: &str) -> Self {
        self.analysis("regression").parameter("dependent_variable", dependent_variable)
    }

    /// A classification job predicting `dependent_variable`.
    pub fn classification(self, dependent_variable: &str) -> Self {
        self.analysis("classification").parameter("dependent_variable", dependent_variable)
    }

    pub fn persistence(
        mut self,
        persister_supplier: PersisterSupplier,
        restore_searcher_supplier: RestoreSearcherSupplier,
    ) -> Self {
        self.persister_supplier = persister_supplier;
        self.restore_searcher_supplier = restore_searcher_supplier;
        self
    }

    /// Seed of the mock runner's sleeps.
    pub fn mock_seed(mut self, seed: u64) -> Self {
        self.mock_seed = seed;
        self
    }

    pub fn to_value(&self) -> Value {
        let mut specification = json!({
            "job_id": self.job_id,
            "rows": self.rows,
            "cols": self.cols,
            "memory_limit": self.memory_limit,
            "threads": self.threads,
            "temp_dir": self.temp_dir,
            "results_field": self.results_field,
            "categorical_fields": self.categorical_fields,
            "disk_usage_allowed": self.disk_usage_allowed,
            "analysis": {"name": self.analysis},
        });
        if let Some(missing) = &self.missing_field_value {
            specification["missing_field_value"] = json!(missing);
        }
        if !self.parameters.is_empty() {
            specification["analysis"]["parameters"] = Value::Object(self.parameters.clone());
        }
        specification
    }

    pub fn json(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse the job against the standard runners plus the mock runner.
    pub fn specification(self) -> AnalysisSpecification {
        AnalysisSpecification::with_registry(
            &self.json(),
            &testing_registry(self.mock_seed),
            self.persister_supplier,
            self.restore_searcher_supplier,
        )
    }
}

// =============================================================================
// Records
// =============================================================================

/// `names` followed by the two control field names.
pub fn control_names(names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.to_string())
        .chain(std::iter::repeat_n(CONTROL_FIELD_NAME.to_string(), 2))
        .collect()
}

/// A data record: `values`, the document hash and an empty control message.
pub fn data_record(values: &[&str], doc_hash: i32) -> Vec<String> {
    values
        .iter()
        .map(|value| value.to_string())
        .chain([doc_hash.to_string(), String::new()])
        .collect()
}

/// The record which runs the analysis for a job with `cols` input fields.
pub fn run_record(cols: usize) -> Vec<String> {
    std::iter::repeat_n(String::new(), cols + 1)
        .chain([RUN_ANALYSIS.to_string()])
        .collect()
}

/// Rows of string values with their field names.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticRows {
    pub field_names: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl SyntheticRows {
    pub fn number_rows(&self) -> usize {
        self.records.len()
    }

    pub fn number_columns(&self) -> usize {
        self.field_names.len()
    }

    /// Stream every record into `analyzer`; `false` if any was rejected.
    pub fn feed(&self, analyzer: &mut DataFrameAnalyzer) -> bool {
        let names: Vec<&str> = self.field_names.iter().map(String::as_str).collect();
        let names = control_names(&names);
        self.records.iter().enumerate().all(|(row, record)| {
            let values: Vec<&str> = record.iter().map(String::as_str).collect();
            analyzer.handle_record(&names, &data_record(&values, row as i32))
        })
    }

    /// Stream every record then the run control message.
    pub fn feed_and_run(&self, analyzer: &mut DataFrameAnalyzer) -> bool {
        let names: Vec<&str> = self.field_names.iter().map(String::as_str).collect();
        self.feed(analyzer) && analyzer.handle_record(&control_names(&names), &run_record(names.len()))
    }

    /// The rows written straight into a frame.
    pub fn to_data_frame(&self, categorical_fields: &[String]) -> Result<DataFrame> {
        let mut frame = DataFrame::new(self.field_names.clone(), categorical_fields, "");
        for (row, record) in self.records.iter().enumerate() {
            frame.parse_and_write_row(record, row as i32)?;
        }
        Ok(frame)
    }
}

fn format_value(value: f64) -> String {
    format!("{value:.6}")
}

/// `numeric_col`, `categorical_col` and `target_col` where the target is a
/// linear function of the numeric column plus a per category offset.
pub fn regression_rows(rows: usize, seed: u64) -> SyntheticRows {
    let mut rng = StdRng::seed_from_u64(seed);
    let categories = ["foo", "bar", "baz"];
    let offsets = [0.0, 5.0, -3.0];
    let records = (0..rows)
        .map(|_| {
            let x = rng.random::<f64>() * 10.0;
            let category = rng.random_range(0..categories.len());
            let noise = (rng.random::<f64>() - 0.5) * 0.1;
            let target = 2.0 * x + offsets[category] + noise;
            vec![format_value(x), categories[category].to_string(), format_value(target)]
        })
        .collect();
    SyntheticRows {
        field_names: vec!["numeric_col".into(), "categorical_col".into(), "target_col".into()],
        records,
    }
}

/// `x`, `y` and a `label` of `"a"`, `"b"` or `"c"` by region of the plane.
pub fn classification_rows(rows: usize, seed: u64) -> SyntheticRows {
    let mut rng = StdRng::seed_from_u64(seed);
    let records = (0..rows)
        .map(|_| {
            let x = rng.random::<f64>();
            let y = rng.random::<f64>();
            let label = if x < 0.4 {
                "a"
            } else if y < 0.5 {
                "b"
            } else {
                "c"
            };
            vec![format_value(x), format_value(y), label.to_string()]
        })
        .collect();
    SyntheticRows {
        field_names: vec!["x".into(), "y".into(), "label".into()],
        records,
    }
}

/// `rows` points clustered around the origin followed by `outliers` points
/// far along the first axis.
pub fn outlier_rows(rows: usize, outliers: usize, cols: usize, seed: u64) -> SyntheticRows {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records: Vec<Vec<String>> = (0..rows)
        .map(|_| (0..cols).map(|_| format_value(rng.random::<f64>() - 0.5)).collect())
        .collect();
    records.extend((0..outliers).map(|i| {
        (0..cols)
            .map(|c| format_value(if c == 0 { 20.0 + i as f64 } else { 0.0 }))
            .collect()
    }));
    SyntheticRows {
        field_names: (0..cols).map(|c| format!("c{c}")).collect(),
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_defaults_are_valid() {
        let specification = SpecificationFactory::new().specification();
        assert!(specification.is_valid());
        assert_eq!(specification.runner().unwrap().name(), "outlier_detection");
    }

    #[test]
    fn mock_analysis_is_only_in_the_testing_registry() {
        let factory = SpecificationFactory::new().analysis(MOCK_ANALYSIS);
        assert!(!AnalysisSpecification::new(&factory.json()).is_valid());
        let specification = factory.specification();
        let runner = specification.runner().unwrap();
        assert_eq!(runner.number_extra_columns(), 2);
        assert_eq!(runner.data_frame_slice_capacity(), MOCK_SLICE_CAPACITY);
    }

    #[test]
    fn records_carry_control_fields() {
        assert_eq!(control_names(&["a"]), vec!["a", ".", "."]);
        assert_eq!(data_record(&["1"], 3), vec!["1", "3", ""]);
        assert_eq!(run_record(2), vec!["", "", "", "$"]);
    }

    #[test]
    fn synthetic_rows_are_reproducible() {
        assert_eq!(regression_rows(20, 7), regression_rows(20, 7));
        assert_ne!(regression_rows(20, 7), regression_rows(20, 8));
        let frame = regression_rows(20, 7)
            .to_data_frame(&["categorical_col".to_string()])
            .unwrap();
        assert_eq!(frame.number_rows(), 20);
        assert!(frame.categories(1).len() <= 3);
    }

    #[test]
    fn mock_runner_progress_reaches_one() {
        let settings = RunnerSettings::new("job", 4, 1, 1 << 20);
        let mut runner = MockRunner::new(&settings, StdRng::seed_from_u64(1));
        let mut frame = DataFrame::new(vec!["x".into()], &[], "");
        frame.parse_and_write_row(&["1"], 0).unwrap();
        runner.run(&mut frame).unwrap();
        let instrumentation = runner.instrumentation();
        assert!(instrumentation.finished());
        assert_eq!(frame.number_columns(), 3);
    }
}
