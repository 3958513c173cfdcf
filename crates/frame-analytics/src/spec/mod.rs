//! Job specification.
//!
//! The specification is the JSON header a host sends before any data:
//!
//! ```json
//! {
//!   "job_id": "job", "rows": 1000, "cols": 3, "memory_limit": 30000000,
//!   "threads": 2, "temp_dir": "/tmp", "results_field": "ml",
//!   "categorical_fields": ["c"], "disk_usage_allowed": true,
//!   "analysis": {"name": "regression", "parameters": {"dependent_variable": "y"}}
//! }
//! ```
//!
//! Parsing selects the runner from a [`RunnerRegistry`] and plans its
//! execution. A specification which fails to parse is kept around in an
//! invalid state so hosts can report it; it never owns a runner.

use serde::Deserialize;
use serde_json::Value;

use crate::data::DataFrame;
use crate::error::{AnalysisError, Result};
use crate::persist::{
    PersisterSupplier, RestoreSearcherSupplier, noop_persister_supplier, noop_restore_searcher_supplier,
};
use crate::runner::{AnalysisRunner, MemoryUsageEstimate, RunnerRegistry, RunnerSettings};

pub const DEFAULT_RESULTS_FIELD: &str = "ml";
pub const DEFAULT_MISSING_FIELD_VALUE: &str = "\0";
pub const DEFAULT_TEMP_DIR: &str = ".";

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpecification {
    #[serde(default)]
    job_id: String,
    rows: usize,
    cols: usize,
    memory_limit: u64,
    #[serde(default = "default_threads")]
    threads: usize,
    #[serde(default = "default_temp_dir")]
    temp_dir: String,
    #[serde(default = "default_results_field")]
    results_field: String,
    #[serde(default = "default_missing_field_value")]
    missing_field_value: String,
    #[serde(default)]
    categorical_fields: Vec<String>,
    #[serde(default = "default_disk_usage_allowed")]
    disk_usage_allowed: bool,
    analysis: RawAnalysis,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalysis {
    name: String,
    #[serde(default)]
    parameters: Value,
}

fn default_threads() -> usize {
    1
}

fn default_temp_dir() -> String {
    DEFAULT_TEMP_DIR.to_string()
}

fn default_results_field() -> String {
    DEFAULT_RESULTS_FIELD.to_string()
}

fn default_missing_field_value() -> String {
    DEFAULT_MISSING_FIELD_VALUE.to_string()
}

fn default_disk_usage_allowed() -> bool {
    true
}

// =============================================================================
// AnalysisSpecification
// =============================================================================

/// A parsed job and the runner it selected.
#[derive(Debug)]
pub struct AnalysisSpecification {
    settings: RunnerSettings,
    missing_field_value: String,
    analysis_name: String,
    parameters: Value,
    runner: Option<Box<dyn AnalysisRunner>>,
    error: Option<AnalysisError>,
}

impl AnalysisSpecification {
    /// Parse `json` against the standard runners with no-op persistence.
    ///
    /// Never fails: check [`is_valid`](Self::is_valid) before running.
    pub fn new(json: &str) -> Self {
        Self::with_registry(
            json,
            RunnerRegistry::global(),
            noop_persister_supplier(),
            noop_restore_searcher_supplier(),
        )
    }

    /// Parse `json` against the standard runners with the given persistence.
    pub fn with_persistence(
        json: &str,
        persister_supplier: PersisterSupplier,
        restore_searcher_supplier: RestoreSearcherSupplier,
    ) -> Self {
        Self::with_registry(
            json,
            RunnerRegistry::global(),
            persister_supplier,
            restore_searcher_supplier,
        )
    }

    /// Parse `json` against `registry`, recording any failure instead of
    /// returning it.
    pub fn with_registry(
        json: &str,
        registry: &RunnerRegistry,
        persister_supplier: PersisterSupplier,
        restore_searcher_supplier: RestoreSearcherSupplier,
    ) -> Self {
        match Self::parse(json, registry, persister_supplier, restore_searcher_supplier) {
            Ok(specification) => specification,
            Err(error) => {
                tracing::error!(%error, "invalid analysis specification");
                Self::invalid(error)
            }
        }
    }

    /// Parse `json` against `registry`.
    pub fn parse(
        json: &str,
        registry: &RunnerRegistry,
        persister_supplier: PersisterSupplier,
        restore_searcher_supplier: RestoreSearcherSupplier,
    ) -> Result<Self> {
        let raw: RawSpecification =
            serde_json::from_str(json).map_err(|error| AnalysisError::configuration(error.to_string()))?;

        for (name, value) in [
            ("rows", raw.rows as u64),
            ("cols", raw.cols as u64),
            ("memory_limit", raw.memory_limit),
            ("threads", raw.threads as u64),
        ] {
            if value == 0 {
                return Err(AnalysisError::configuration(format!("'{name}' must be positive")));
            }
        }

        let settings = RunnerSettings {
            job_id: raw.job_id,
            rows: raw.rows,
            cols: raw.cols,
            memory_limit: raw.memory_limit,
            threads: raw.threads,
            results_field: raw.results_field,
            categorical_fields: raw.categorical_fields,
            disk_usage_allowed: raw.disk_usage_allowed,
            temp_dir: raw.temp_dir,
            persister_supplier,
            restore_searcher_supplier,
        };
        let runner = registry.make_runner(&raw.analysis.name, &settings, &raw.analysis.parameters)?;
        tracing::debug!(
            job_id = %settings.job_id,
            analysis = %raw.analysis.name,
            rows = settings.rows,
            cols = settings.cols,
            threads = settings.threads,
            "parsed analysis specification"
        );

        Ok(Self {
            settings,
            missing_field_value: raw.missing_field_value,
            analysis_name: raw.analysis.name,
            parameters: raw.analysis.parameters,
            runner: Some(runner),
            error: None,
        })
    }

    fn invalid(error: AnalysisError) -> Self {
        Self {
            settings: RunnerSettings::new("", 0, 0, 0),
            missing_field_value: DEFAULT_MISSING_FIELD_VALUE.to_string(),
            analysis_name: String::new(),
            parameters: Value::Null,
            runner: None,
            error: Some(error),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// Why the specification is invalid.
    pub fn error(&self) -> Option<&AnalysisError> {
        self.error.as_ref()
    }

    pub fn job_id(&self) -> &str {
        &self.settings.job_id
    }

    pub fn number_rows(&self) -> usize {
        self.settings.rows
    }

    pub fn number_columns(&self) -> usize {
        self.settings.cols
    }

    pub fn memory_limit(&self) -> u64 {
        self.settings.memory_limit
    }

    pub fn number_threads(&self) -> usize {
        self.settings.threads
    }

    pub fn temporary_directory(&self) -> &str {
        &self.settings.temp_dir
    }

    pub fn results_field(&self) -> &str {
        &self.settings.results_field
    }

    pub fn missing_field_value(&self) -> &str {
        &self.missing_field_value
    }

    pub fn categorical_field_names(&self) -> &[String] {
        &self.settings.categorical_fields
    }

    pub fn disk_usage_allowed(&self) -> bool {
        self.settings.disk_usage_allowed
    }

    pub fn analysis_name(&self) -> &str {
        &self.analysis_name
    }

    pub fn analysis_parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn persister_supplier(&self) -> &PersisterSupplier {
        &self.settings.persister_supplier
    }

    pub fn restore_searcher_supplier(&self) -> &RestoreSearcherSupplier {
        &self.settings.restore_searcher_supplier
    }

    /// The runner; `None` iff the specification is invalid.
    pub fn runner(&self) -> Option<&dyn AnalysisRunner> {
        self.runner.as_deref()
    }

    pub fn runner_mut(&mut self) -> Option<&mut (dyn AnalysisRunner + 'static)> {
        self.runner.as_deref_mut()
    }

    /// An empty frame for the input `column_names` of this job.
    pub fn make_data_frame(&self, column_names: Vec<String>) -> DataFrame {
        DataFrame::new(
            column_names,
            &self.settings.categorical_fields,
            self.missing_field_value.as_str(),
        )
    }

    /// Memory the job needs with and without disk spill; zero when invalid.
    pub fn estimate_memory_usage(&self) -> MemoryUsageEstimate {
        self.runner
            .as_ref()
            .map(|runner| runner.estimate_memory_usage())
            .unwrap_or_default()
    }

    /// Fail if the job cannot fit the memory limit in the allowed mode.
    pub fn check_memory_limit(&self) -> Result<MemoryUsageEstimate> {
        let estimate = self.estimate_memory_usage();
        let required = if self.settings.disk_usage_allowed {
            estimate.with_disk
        } else {
            estimate.without_disk
        };
        if required > self.settings.memory_limit {
            tracing::warn!(
                job_id = %self.settings.job_id,
                required,
                limit = self.settings.memory_limit,
                disk_usage_allowed = self.settings.disk_usage_allowed,
                "estimated memory exceeds the limit"
            );
            return Err(AnalysisError::ResourceExceeded {
                required,
                limit: self.settings.memory_limit,
            });
        }
        Ok(estimate)
    }
}
