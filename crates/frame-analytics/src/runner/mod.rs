//! Analysis runners and the registry selecting them by name.
//!
//! A runner is created by a [`RunnerFactory`] while the specification is
//! parsed, plans its execution strategy immediately and then runs exactly
//! once against a [`DataFrame`].

pub mod boosted_tree;
pub mod outliers;
mod registry;
mod strategy;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::data::{DataFrame, RowMask};
use crate::error::{AnalysisError, Result};
use crate::inference::{DataSummarization, InferenceModelDefinition, InferenceModelMetadata};
use crate::instrumentation::Instrumentation;
use crate::io::ConcurrentLineWriter;
use crate::persist::{
    PersisterSupplier, RestoreSearcherSupplier, noop_persister_supplier,
    noop_restore_searcher_supplier,
};
use crate::utils::{Parallelism, run_with_threads};

pub use registry::{RunnerFactory, RunnerRegistry};
pub use strategy::{ExecutionStrategy, FrameShape, MemoryUsageEstimate, PlanningInput};

// =============================================================================
// Settings
// =============================================================================

/// The parts of a specification every runner needs.
#[derive(Clone)]
pub struct RunnerSettings {
    pub job_id: String,
    pub rows: usize,
    pub cols: usize,
    pub memory_limit: u64,
    pub threads: usize,
    pub results_field: String,
    pub categorical_fields: Vec<String>,
    pub disk_usage_allowed: bool,
    pub temp_dir: String,
    pub persister_supplier: PersisterSupplier,
    pub restore_searcher_supplier: RestoreSearcherSupplier,
}

impl std::fmt::Debug for RunnerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerSettings")
            .field("job_id", &self.job_id)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("memory_limit", &self.memory_limit)
            .field("threads", &self.threads)
            .field("results_field", &self.results_field)
            .field("categorical_fields", &self.categorical_fields)
            .field("disk_usage_allowed", &self.disk_usage_allowed)
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

impl RunnerSettings {
    /// Settings with no-op persistence.
    pub fn new(job_id: impl Into<String>, rows: usize, cols: usize, memory_limit: u64) -> Self {
        Self {
            job_id: job_id.into(),
            rows,
            cols,
            memory_limit,
            threads: 1,
            results_field: "ml".to_string(),
            categorical_fields: Vec::new(),
            disk_usage_allowed: true,
            temp_dir: ".".to_string(),
            persister_supplier: noop_persister_supplier(),
            restore_searcher_supplier: noop_restore_searcher_supplier(),
        }
    }

    fn planning_input(&self, extra_columns: usize) -> PlanningInput {
        PlanningInput {
            rows: self.rows,
            columns: self.cols + extra_columns,
            threads: self.threads,
            memory_limit: self.memory_limit,
            disk_usage_allowed: self.disk_usage_allowed,
        }
    }
}

/// Deserialize `analysis.parameters`; absent parameters mean all defaults.
pub(crate) fn parse_parameters<T: DeserializeOwned>(analysis: &str, parameters: &Value) -> Result<T> {
    let parameters = match parameters {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(parameters)
        .map_err(|error| AnalysisError::configuration(format!("{analysis} parameters: {error}")))
}

// =============================================================================
// Runner core
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Planned,
    Running,
    Finished,
    Failed,
}

/// State shared by every runner variant.
#[derive(Debug)]
pub struct RunnerCore {
    settings: RunnerSettings,
    instrumentation: Arc<Instrumentation>,
    strategy: Option<ExecutionStrategy>,
    state: RunnerState,
}

impl RunnerCore {
    pub fn new(settings: &RunnerSettings) -> Self {
        Self {
            instrumentation: Arc::new(Instrumentation::new(
                settings.job_id.clone(),
                settings.memory_limit,
            )),
            settings: settings.clone(),
            strategy: None,
            state: RunnerState::Created,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// The planned strategy, or everything in memory before planning.
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
            .unwrap_or_else(|| ExecutionStrategy::in_memory(self.settings.rows))
    }
}

// =============================================================================
// Runner trait
// =============================================================================

/// One analysis over a data frame.
///
/// Implementors provide the variant specific hooks; planning, the run state
/// machine and row result framing are shared.
pub trait AnalysisRunner: Send {
    fn core(&self) -> &RunnerCore;

    fn core_mut(&mut self) -> &mut RunnerCore;

    /// Registered analysis name.
    fn name(&self) -> &'static str;

    /// Columns the runner appends to the frame for its output.
    fn number_extra_columns(&self) -> usize;

    /// Rows the host should buffer per frame slice.
    fn data_frame_slice_capacity(&self) -> usize;

    /// Memory the analysis needs beyond the frame itself.
    fn estimate_bookkeeping_memory_usage(&self, shape: &FrameShape) -> u64;

    /// Final check of the frame before running.
    fn validate(&self, frame: &DataFrame) -> Result<()>;

    fn rows_to_write_mask(&self, frame: &DataFrame) -> RowMask;

    /// Results of one row, written under the results field.
    fn write_one_row(&self, frame: &DataFrame, row: usize) -> Result<Value>;

    /// The analysis itself.
    fn run_impl(&mut self, frame: &mut DataFrame, parallelism: Parallelism) -> Result<()>;

    fn inference_model_definition(
        &self,
        _field_names: &[String],
        _category_names: &[Vec<String>],
    ) -> Result<Option<InferenceModelDefinition>> {
        Ok(None)
    }

    fn inference_model_metadata(&self) -> Option<InferenceModelMetadata> {
        None
    }

    fn data_summarization(&self, _frame: &DataFrame) -> Option<DataSummarization> {
        None
    }

    // =========================================================================
    // Provided
    // =========================================================================

    fn instrumentation(&self) -> &Arc<Instrumentation> {
        self.core().instrumentation()
    }

    fn execution_strategy(&self) -> ExecutionStrategy {
        self.core().strategy()
    }

    fn extra_column_names(&self) -> Vec<String> {
        let field = &self.core().settings().results_field;
        (0..self.number_extra_columns())
            .map(|i| format!("{field}.{i}"))
            .collect()
    }

    fn finished(&self) -> bool {
        self.core().state() == RunnerState::Finished
    }

    /// Choose between in-memory and partitioned execution.
    fn compute_and_save_execution_strategy(&mut self) {
        let input = self.core().settings().planning_input(self.number_extra_columns());
        let strategy = input.plan(|shape| self.estimate_bookkeeping_memory_usage(shape));
        if !strategy.in_main_memory() {
            tracing::info!(
                job_id = %self.core().settings().job_id,
                partitions = strategy.number_partitions,
                rows_per_partition = strategy.max_rows_per_partition,
                "running with partitioned data frame"
            );
        }
        let core = self.core_mut();
        core.strategy = Some(strategy);
        core.state = RunnerState::Planned;
    }

    fn estimate_memory_usage(&self) -> MemoryUsageEstimate {
        self.core()
            .settings()
            .planning_input(self.number_extra_columns())
            .estimate(|shape| self.estimate_bookkeeping_memory_usage(shape))
    }

    /// Run the analysis once on a pool of the configured size.
    fn run(&mut self, frame: &mut DataFrame) -> Result<()> {
        match self.core().state() {
            RunnerState::Planned => {}
            RunnerState::Created => self.compute_and_save_execution_strategy(),
            state => {
                return Err(AnalysisError::runtime(format!(
                    "runner '{}' cannot run in state {state:?}",
                    self.name()
                )));
            }
        }
        if frame.number_columns() == frame.number_input_columns() {
            frame.resize_columns(&self.extra_column_names());
        }

        let job_id = self.core().settings().job_id.clone();
        tracing::info!(%job_id, analysis = self.name(), rows = frame.number_rows(), "starting analysis");
        self.core_mut().state = RunnerState::Running;

        let threads = self.core().settings().threads;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_with_threads(threads, |parallelism| self.run_impl(frame, parallelism))
        }))
        .unwrap_or_else(|payload| {
            Err(AnalysisError::runtime(format!(
                "analysis panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        match result {
            Ok(()) => {
                self.core_mut().state = RunnerState::Finished;
                self.instrumentation().set_to_finished();
                tracing::info!(%job_id, analysis = self.name(), "analysis finished");
                Ok(())
            }
            Err(error) => {
                self.core_mut().state = RunnerState::Failed;
                self.instrumentation().stop_monitoring();
                tracing::error!(%job_id, analysis = self.name(), %error, "analysis failed");
                Err(error)
            }
        }
    }

    /// Write `{"row_results": ...}` for `row`.
    fn write_row_results(&self, frame: &DataFrame, row: usize, writer: &ConcurrentLineWriter) -> Result<()> {
        let results = self.write_one_row(frame, row)?;
        let field = &self.core().settings().results_field;
        writer.write(&json!({
            "row_results": {
                "checksum": frame.doc_hash(row),
                "results": { field.as_str(): results },
            }
        }))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

impl std::fmt::Debug for dyn AnalysisRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisRunner")
            .field("name", &self.name())
            .field("state", &self.core().state())
            .finish()
    }
}
