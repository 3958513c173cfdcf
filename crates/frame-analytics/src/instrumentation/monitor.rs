use std::time::Duration;

use super::{Instrumentation, timestamp_millis};
use crate::io::ConcurrentLineWriter;

/// Longest sleep between polls.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Report progress and memory until the analysis finishes.
///
/// Polls with a backoff from 1 ms up to [`MONITOR_INTERVAL`], writing a
/// progress line whenever the task changes or its percentage increases and
/// a memory line whenever the peak grows. Once `finished()` is observed the
/// final progress and memory are written. Exits without the final write if
/// [`Instrumentation::stop_monitoring`] is called first.
pub fn monitor(instrumentation: &Instrumentation, writer: &ConcurrentLineWriter) {
    let mut last_task = super::NO_TASK.to_string();
    let mut last_progress = 0;
    let mut last_memory = 0;
    let mut wait = Duration::from_millis(1);

    while !instrumentation.finished() {
        if instrumentation.monitoring_stopped() {
            return;
        }
        std::thread::sleep(wait.min(MONITOR_INTERVAL));
        wait = (wait * 2).min(MONITOR_INTERVAL);

        let task = instrumentation.task();
        let progress = instrumentation.percentage_progress();
        if task != last_task || progress > last_progress {
            report(instrumentation.write_progress(writer, &task, progress));
            last_task = task;
            last_progress = progress;
        }
        let memory = instrumentation.memory();
        if memory > last_memory {
            report(instrumentation.write_memory(writer, timestamp_millis()));
            last_memory = memory;
        }
    }

    let task = instrumentation.task();
    report(instrumentation.write_progress(writer, &task, instrumentation.percentage_progress()));
    report(instrumentation.write_memory(writer, timestamp_millis()));
}

fn report(result: crate::error::Result<()>) {
    if let Err(error) = result {
        tracing::error!(%error, "failed to write instrumentation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;
    use std::time::Instant;

    #[test]
    fn writes_progress_and_exits_after_finish() {
        let buffer = SharedBuffer::new();
        let writer = ConcurrentLineWriter::new(buffer.clone());
        let instrumentation = Instrumentation::new("job", 0);

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| monitor(&instrumentation, &writer));
            instrumentation.start_new_progress_monitored_task("training");
            for _ in 0..4 {
                instrumentation.update_progress(0.25);
                instrumentation.update_memory_usage(10);
                std::thread::sleep(Duration::from_millis(5));
            }
            instrumentation.set_to_finished();
            let finished_at = Instant::now();
            handle.join().unwrap();
            assert!(finished_at.elapsed() < MONITOR_INTERVAL * 3);
        });

        let docs = buffer.documents();
        let progress: Vec<_> = docs
            .iter()
            .filter_map(|d| d.get("phase_progress"))
            .collect();
        assert!(!progress.is_empty());
        let last = progress.last().unwrap();
        assert_eq!(last["phase"], "training");
        assert_eq!(last["progress_percent"], 100);
        let percents: Vec<u64> = progress
            .iter()
            .filter(|p| p["phase"] == "training")
            .map(|p| p["progress_percent"].as_u64().unwrap())
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(docs.last().unwrap().get("analytics_memory_usage").is_some());
    }

    #[test]
    fn stop_skips_the_final_write() {
        let buffer = SharedBuffer::new();
        let writer = ConcurrentLineWriter::new(buffer.clone());
        let instrumentation = Instrumentation::new("job", 0);
        instrumentation.stop_monitoring();
        monitor(&instrumentation, &writer);
        assert!(buffer.documents().is_empty());
    }
}
