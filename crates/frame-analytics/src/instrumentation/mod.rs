//! Live progress, memory and statistics of a running analysis.
//!
//! The analysis thread updates counters through `&Instrumentation`; the
//! monitor thread (see [`monitor`]) reads them and writes JSON lines. Memory
//! and progress are atomics, the task name and statistics sit behind locks.

mod monitor;
pub mod stats;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::io::ConcurrentLineWriter;

pub use monitor::{MONITOR_INTERVAL, monitor};
pub use stats::{
    AnalysisStats, HyperparametersRecord, OutlierParametersRecord, OutliersStats, TimingStats,
    TrainingKind, TrainingStats,
};

/// Task name before any task starts.
pub const NO_TASK: &str = "";

/// Resolution of reported progress.
const PROGRESS_SCALE: u64 = 1024;
/// Fixed point scale of the progress counter. Updates are accumulated at
/// this finer scale so rounding never drifts past one reported step.
const PROGRESS_UNITS: u64 = 1 << 32;
const UNITS_PER_STEP: u64 = PROGRESS_UNITS / PROGRESS_SCALE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Ok,
    HardLimit,
}

/// Progress, memory and statistics of one analysis.
#[derive(Debug)]
pub struct Instrumentation {
    job_id: String,
    memory_limit: i64,
    memory: AtomicI64,
    peak_memory: AtomicI64,
    hard_limit: AtomicBool,
    fractional_progress: AtomicU64,
    finished: AtomicBool,
    monitoring_stopped: AtomicBool,
    task: Mutex<String>,
    stats: Mutex<AnalysisStats>,
    writer: Mutex<Option<ConcurrentLineWriter>>,
    started: Instant,
}

impl Instrumentation {
    /// `memory_limit` of zero disables the hard limit check.
    pub fn new(job_id: impl Into<String>, memory_limit: u64) -> Self {
        Self {
            job_id: job_id.into(),
            memory_limit: i64::try_from(memory_limit).unwrap_or(i64::MAX),
            memory: AtomicI64::new(0),
            peak_memory: AtomicI64::new(0),
            hard_limit: AtomicBool::new(false),
            fractional_progress: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            monitoring_stopped: AtomicBool::new(false),
            task: Mutex::new(NO_TASK.to_string()),
            stats: Mutex::new(AnalysisStats::None),
            writer: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Add `delta` bytes to the current usage and track the peak.
    pub fn update_memory_usage(&self, delta: i64) {
        let memory = self.memory.fetch_add(delta, Ordering::AcqRel) + delta;
        if memory < 0 {
            tracing::error!(job_id = %self.job_id, memory, "memory usage is negative");
            return;
        }
        self.peak_memory.fetch_max(memory, Ordering::AcqRel);
        if self.memory_limit > 0
            && memory > self.memory_limit
            && !self.hard_limit.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                job_id = %self.job_id,
                memory,
                limit = self.memory_limit,
                "memory usage exceeds the hard limit"
            );
        }
    }

    /// Peak memory usage in bytes.
    pub fn memory(&self) -> i64 {
        self.peak_memory.load(Ordering::Acquire)
    }

    pub fn current_memory(&self) -> i64 {
        self.memory.load(Ordering::Acquire)
    }

    pub fn memory_status(&self) -> MemoryStatus {
        if self.hard_limit.load(Ordering::Acquire) {
            MemoryStatus::HardLimit
        } else {
            MemoryStatus::Ok
        }
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Start a new task and reset its progress to zero.
    ///
    /// Callers serialize task transitions with progress updates.
    pub fn start_new_progress_monitored_task(&self, task: &str) {
        let mut current = self.task.lock();
        *current = task.to_string();
        self.fractional_progress.store(0, Ordering::Release);
    }

    pub fn task(&self) -> String {
        self.task.lock().clone()
    }

    /// Add `fraction` of the current task to the progress.
    ///
    /// Any positive fraction counts for at least one unit. The counter
    /// saturates instead of wrapping.
    pub fn update_progress(&self, fraction: f64) {
        if fraction.is_nan() || fraction <= 0.0 {
            return;
        }
        let units = ((fraction * PROGRESS_UNITS as f64).round() as u64).max(1);
        let _ = self
            .fractional_progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |progress| {
                Some(progress.saturating_add(units))
            });
    }

    /// Progress of the current task in `[0, 1]`, rounded to the nearest
    /// 1/1024; 1 once finished.
    pub fn progress(&self) -> f64 {
        if self.finished() {
            return 1.0;
        }
        let units = self.fractional_progress.load(Ordering::Acquire).min(PROGRESS_UNITS);
        let steps = (units + UNITS_PER_STEP / 2) / UNITS_PER_STEP;
        steps as f64 / PROGRESS_SCALE as f64
    }

    pub fn percentage_progress(&self) -> u32 {
        (100.0 * self.progress()).floor() as u32
    }

    pub fn reset_progress(&self) {
        self.fractional_progress.store(0, Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }

    pub fn set_to_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ask the monitor loop to exit without the run having finished.
    pub fn stop_monitoring(&self) {
        self.monitoring_stopped.store(true, Ordering::Release);
    }

    pub(crate) fn monitoring_stopped(&self) -> bool {
        self.monitoring_stopped.load(Ordering::Acquire)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Mutate the analysis statistics under the stats lock.
    pub fn update_stats<R>(&self, f: impl FnOnce(&mut AnalysisStats) -> R) -> R {
        f(&mut self.stats.lock())
    }

    pub fn stats(&self) -> AnalysisStats {
        self.stats.lock().clone()
    }

    /// Milliseconds since construction.
    pub fn elapsed_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Bind the writer used by [`flush`](Self::flush).
    pub fn set_writer(&self, writer: ConcurrentLineWriter) {
        *self.writer.lock() = Some(writer);
    }

    /// Write memory and analysis statistics now.
    ///
    /// Does nothing until a writer is bound.
    pub fn flush(&self, tag: &str) -> Result<()> {
        let Some(writer) = self.writer.lock().clone() else {
            return Ok(());
        };
        let timestamp = timestamp_millis();
        self.write_memory(&writer, timestamp)?;
        self.write_analysis_stats(&writer, timestamp, tag)
    }

    pub fn write_memory(&self, writer: &ConcurrentLineWriter, timestamp: u64) -> Result<()> {
        writer.write(&json!({
            "analytics_memory_usage": {
                "job_id": self.job_id,
                "timestamp": timestamp,
                "peak_usage_bytes": self.memory(),
                "status": self.memory_status(),
            }
        }))
    }

    pub fn write_progress(&self, writer: &ConcurrentLineWriter, task: &str, progress: u32) -> Result<()> {
        writer.write(&json!({
            "phase_progress": {
                "phase": task,
                "progress_percent": progress,
            }
        }))
    }

    fn write_analysis_stats(&self, writer: &ConcurrentLineWriter, timestamp: u64, tag: &str) -> Result<()> {
        let stats = self.stats.lock().clone();
        let Some(name) = stats.document_name() else {
            return Ok(());
        };
        let mut body = match &stats {
            AnalysisStats::None => return Ok(()),
            AnalysisStats::Outliers(outliers) => serde_json::to_value(outliers)?,
            AnalysisStats::Training(training) => serde_json::to_value(training)?,
        };
        if let Some(object) = body.as_object_mut() {
            object.insert("job_id".into(), json!(self.job_id));
            object.insert("timestamp".into(), json!(timestamp));
            if !tag.is_empty() {
                object.insert("tag".into(), json!(tag));
            }
        }
        writer.write(&json!({ "analysis_stats": { name: body } }))
    }
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn memory_tracks_peak() {
        let instrumentation = Instrumentation::new("job", 0);
        instrumentation.update_memory_usage(100);
        instrumentation.update_memory_usage(50);
        instrumentation.update_memory_usage(-120);
        assert_eq!(instrumentation.memory(), 150);
        assert_eq!(instrumentation.current_memory(), 30);
        assert_eq!(instrumentation.memory_status(), MemoryStatus::Ok);
    }

    #[test]
    fn memory_hard_limit() {
        let instrumentation = Instrumentation::new("job", 100);
        instrumentation.update_memory_usage(101);
        assert_eq!(instrumentation.memory_status(), MemoryStatus::HardLimit);
    }

    #[test]
    fn new_task_resets_progress() {
        let instrumentation = Instrumentation::new("job", 0);
        instrumentation.start_new_progress_monitored_task("a");
        instrumentation.update_progress(0.5);
        assert_abs_diff_eq!(instrumentation.progress(), 0.5, epsilon = 1.0 / 1024.0);
        instrumentation.start_new_progress_monitored_task("b");
        assert_eq!(instrumentation.progress(), 0.0);
        assert_eq!(instrumentation.task(), "b");
    }

    #[test]
    fn progress_is_clamped_and_finished_is_complete() {
        let instrumentation = Instrumentation::new("job", 0);
        instrumentation.update_progress(0.75);
        instrumentation.update_progress(0.75);
        assert_eq!(instrumentation.progress(), 1.0);
        instrumentation.reset_progress();
        instrumentation.update_progress(-1.0);
        assert_eq!(instrumentation.progress(), 0.0);
        instrumentation.set_to_finished();
        assert_eq!(instrumentation.progress(), 1.0);
        assert_eq!(instrumentation.percentage_progress(), 100);
    }

    #[test]
    fn power_of_two_fractions_are_exact() {
        let instrumentation = Instrumentation::new("job", 0);
        for _ in 0..8 {
            instrumentation.update_progress(0.125);
        }
        assert_eq!(instrumentation.progress(), 1.0);
        assert!(!instrumentation.finished());
    }

    #[test]
    fn flush_writes_memory_and_stats() {
        let buffer = SharedBuffer::new();
        let instrumentation = Instrumentation::new("job", 0);
        instrumentation.flush("ignored").unwrap();
        assert!(buffer.documents().is_empty());

        instrumentation.set_writer(ConcurrentLineWriter::new(buffer.clone()));
        instrumentation.update_memory_usage(2048);
        instrumentation.update_stats(|stats| {
            *stats = AnalysisStats::Training(TrainingStats::new(TrainingKind::Regression, "mse"));
        });
        instrumentation.flush("final").unwrap();

        let docs = buffer.documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["analytics_memory_usage"]["peak_usage_bytes"], 2048);
        assert_eq!(docs[0]["analytics_memory_usage"]["status"], "ok");
        let stats = &docs[1]["analysis_stats"]["regression_stats"];
        assert_eq!(stats["job_id"], "job");
        assert_eq!(stats["tag"], "final");
        assert_eq!(stats["validation_loss"]["loss_type"], "mse");
    }

    proptest! {
        #[test]
        fn fractions_summing_to_one_complete(n in 1usize..5_000) {
            let instrumentation = Instrumentation::new("job", 0);
            for _ in 0..n {
                instrumentation.update_progress(1.0 / n as f64);
            }
            prop_assert!((instrumentation.progress() - 1.0).abs() <= 1.0 / 1024.0);
            prop_assert!(instrumentation.progress() <= 1.0);
        }

        #[test]
        fn partial_progress_stays_within_one_step(
            fractions in proptest::collection::vec(1e-6f64..0.01, 1..2_000)
        ) {
            let instrumentation = Instrumentation::new("job", 0);
            let mut expected = 0.0;
            for &fraction in &fractions {
                instrumentation.update_progress(fraction);
                expected += fraction;
            }
            let expected = f64::min(expected, 1.0);
            prop_assert!((instrumentation.progress() - expected).abs() <= 1.0 / 1024.0);
        }
    }
}
