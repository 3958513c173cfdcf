//! Row protocol driver.
//!
//! The host streams records as parallel field name and value vectors. The
//! last two fields of every record are control fields named `"."`: the
//! document hash and a control message. Records with an empty control
//! message are data; the control message `"$"` runs the analysis and writes
//! its results.

use serde_json::json;

use crate::data::DataFrame;
use crate::error::{AnalysisError, Result};
use crate::instrumentation::monitor;
use crate::io::ConcurrentLineWriter;
use crate::runner::AnalysisRunner;
use crate::spec::AnalysisSpecification;

pub const CONTROL_FIELD_NAME: &str = ".";
pub const RUN_ANALYSIS: &str = "$";
const CONTROL_FIELDS: usize = 2;

/// Feeds records into a data frame and runs the specified analysis on it.
#[derive(Debug)]
pub struct DataFrameAnalyzer {
    specification: AnalysisSpecification,
    writer: ConcurrentLineWriter,
    frame: Option<DataFrame>,
    has_run: bool,
}

impl DataFrameAnalyzer {
    pub fn new(specification: AnalysisSpecification, writer: ConcurrentLineWriter) -> Self {
        if !specification.is_valid() {
            tracing::error!("analyzer created with an invalid specification, records will be rejected");
        }
        Self {
            specification,
            writer,
            frame: None,
            has_run: false,
        }
    }

    pub fn specification(&self) -> &AnalysisSpecification {
        &self.specification
    }

    pub fn data_frame(&self) -> Option<&DataFrame> {
        self.frame.as_ref()
    }

    /// Write the host's memory usage estimate document.
    pub fn write_memory_usage_estimate(&self) -> Result<()> {
        let estimate = self.specification.estimate_memory_usage();
        self.writer
            .write(&json!({ "memory_usage_estimation_result": estimate.to_json() }))
    }

    /// Handle one record; `false` if it was rejected.
    pub fn handle_record<S: AsRef<str>>(&mut self, field_names: &[S], field_values: &[S]) -> bool {
        match self.try_handle_record(field_names, field_values) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(job_id = %self.specification.job_id(), %error, "rejected record");
                false
            }
        }
    }

    fn try_handle_record<S: AsRef<str>>(&mut self, field_names: &[S], field_values: &[S]) -> Result<()> {
        if !self.specification.is_valid() {
            return Err(AnalysisError::configuration("the analysis specification is invalid"));
        }
        if self.has_run {
            return Err(AnalysisError::runtime("the analysis has already run"));
        }
        let n = field_values.len();
        if n < CONTROL_FIELDS || field_names.len() != n {
            return Err(AnalysisError::runtime(format!(
                "expected matching names and values with two control fields, got {} names and {n} values",
                field_names.len()
            )));
        }
        if field_names[n - CONTROL_FIELDS..]
            .iter()
            .any(|name| name.as_ref() != CONTROL_FIELD_NAME)
        {
            return Err(AnalysisError::runtime("the last two fields must be control fields"));
        }

        let control = field_values[n - 1].as_ref();
        if !control.is_empty() {
            return match control {
                RUN_ANALYSIS => self.run(),
                other => Err(AnalysisError::runtime(format!("unrecognised control message '{other}'"))),
            };
        }

        let values = &field_values[..n - CONTROL_FIELDS];
        if values.len() != self.specification.number_columns() {
            return Err(AnalysisError::runtime(format!(
                "expected {} fields, got {}",
                self.specification.number_columns(),
                values.len()
            )));
        }
        let doc_hash = field_values[n - CONTROL_FIELDS].as_ref().parse::<i32>().unwrap_or_else(|_| {
            tracing::warn!(
                value = field_values[n - CONTROL_FIELDS].as_ref(),
                "document hash is not an integer"
            );
            0
        });

        let specification = &self.specification;
        let frame = self.frame.get_or_insert_with(|| {
            let names = field_names[..n - CONTROL_FIELDS]
                .iter()
                .map(|name| name.as_ref().to_string())
                .collect();
            specification.make_data_frame(names)
        });
        if frame.number_rows() >= self.specification.number_rows() {
            return Err(AnalysisError::runtime(format!(
                "received more than the {} rows expected",
                self.specification.number_rows()
            )));
        }
        frame.parse_and_write_row(values, doc_hash)?;
        Ok(())
    }

    /// Run the analysis over the received rows and write every result
    /// document.
    pub fn run(&mut self) -> Result<()> {
        if self.has_run {
            return Err(AnalysisError::runtime("the analysis has already run"));
        }
        self.specification.check_memory_limit()?;
        let job_id = self.specification.job_id().to_string();
        let Some(runner) = self.specification.runner_mut() else {
            return Err(AnalysisError::configuration("the analysis specification is invalid"));
        };
        let Some(frame) = self.frame.as_mut() else {
            return Err(AnalysisError::runtime("no rows were received"));
        };
        self.has_run = true;
        runner.validate(frame)?;

        let instrumentation = runner.instrumentation().clone();
        instrumentation.set_writer(self.writer.clone());
        let writer = &self.writer;
        std::thread::scope(|scope| {
            scope.spawn(|| monitor(&instrumentation, writer));
            runner.run(frame)
        })?;

        write_results(runner, frame, writer)?;
        tracing::info!(%job_id, rows = frame.number_rows(), "wrote analysis results");
        Ok(())
    }
}

fn write_results(runner: &dyn AnalysisRunner, frame: &DataFrame, writer: &ConcurrentLineWriter) -> Result<()> {
    for row in runner.rows_to_write_mask(frame).rows() {
        runner.write_row_results(frame, row, writer)?;
    }

    let field_names = frame.input_column_names();
    if let Some(definition) = runner.inference_model_definition(field_names, &frame.category_names())? {
        writer.write(&json!({ "model_size_info": definition.size_info() }))?;
        let chunks = definition.compressed_chunks()?;
        for (doc_num, chunk) in chunks.iter().enumerate() {
            writer.write(&json!({
                "compressed_inference_model": {
                    "doc_num": doc_num,
                    "definition": chunk,
                    "eos": doc_num + 1 == chunks.len(),
                }
            }))?;
        }
    }
    if let Some(metadata) = runner.inference_model_metadata() {
        writer.write(&json!({ "model_metadata": metadata.to_json()? }))?;
    }
    if let Some(summarization) = runner.data_summarization(frame) {
        let chunks = summarization.compressed_chunks()?;
        for (doc_num, chunk) in chunks.iter().enumerate() {
            writer.write(&json!({
                "compressed_data_summarization": {
                    "doc_num": doc_num,
                    "data_summarization": chunk,
                    "eos": doc_num + 1 == chunks.len(),
                }
            }))?;
        }
    }
    Ok(())
}
