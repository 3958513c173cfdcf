//! frame-analytics: data frame analyses with portable model output.
//!
//! A job is described by a JSON specification. The specification selects a
//! runner (outlier detection, boosted tree regression or classification),
//! plans memory and threads for it and owns it for the lifetime of the job.
//! Rows are streamed into a [`DataFrame`] by the [`DataFrameAnalyzer`], the
//! runner executes while its [`Instrumentation`] reports progress and memory
//! on a monitor thread, and the trained model is converted into an
//! [`InferenceModelDefinition`] by visiting it with a model builder.
//!
//! # Key Types
//!
//! - [`AnalysisSpecification`] - parsed job configuration and runner owner
//! - [`AnalysisRunner`] - variant specific execution over a data frame
//! - [`Instrumentation`] - concurrent progress, memory and statistics
//! - [`InferenceModelDefinition`] - serializable trained model artifact
//! - [`RegressionModelBuilder`] / [`ClassificationModelBuilder`] - visitors
//!   producing definitions

pub mod analyzer;
pub mod data;
pub mod error;
pub mod inference;
pub mod instrumentation;
pub mod io;
pub mod persist;
pub mod repr;
pub mod runner;
pub mod spec;
pub mod testing;
pub mod training;
pub mod utils;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use analyzer::DataFrameAnalyzer;
pub use data::DataFrame;
pub use error::AnalysisError;
pub use inference::{
    ClassificationModelBuilder, InferenceModelDefinition, InferenceModelMetadata,
    RegressionModelBuilder,
};
pub use instrumentation::Instrumentation;
pub use runner::{AnalysisRunner, ExecutionStrategy, RunnerFactory, RunnerRegistry};
pub use spec::AnalysisSpecification;
pub use utils::{Parallelism, run_with_threads};
