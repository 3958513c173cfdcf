//! In-memory versus partitioned execution planning.

use serde::Serialize;

use crate::data::DataFrame;
use crate::utils::bytes_to_kb;

/// Shape a runner estimates its bookkeeping memory for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub total_rows: usize,
    /// Rows resident at once.
    pub partition_rows: usize,
    /// Input plus extra columns.
    pub columns: usize,
    pub partitions: usize,
    pub threads: usize,
}

/// How a runner walks the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionStrategy {
    pub number_partitions: usize,
    pub max_rows_per_partition: usize,
}

impl ExecutionStrategy {
    pub fn in_memory(rows: usize) -> Self {
        Self {
            number_partitions: 1,
            max_rows_per_partition: rows,
        }
    }

    pub fn in_main_memory(&self) -> bool {
        self.number_partitions == 1
    }

    /// Row ranges of the partitions covering `rows` rows.
    pub fn partitions(&self, rows: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
        let step = self.max_rows_per_partition.max(1);
        (0..rows).step_by(step).map(move |start| start..(start + step).min(rows))
    }
}

/// Inputs to execution planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanningInput {
    pub rows: usize,
    pub columns: usize,
    pub threads: usize,
    pub memory_limit: u64,
    pub disk_usage_allowed: bool,
}

impl PlanningInput {
    /// Most partitions worth using: about `sqrt(rows)` when spilling is
    /// allowed.
    pub fn max_partitions(&self) -> usize {
        if self.disk_usage_allowed {
            ((self.rows as f64).sqrt().round() as usize).max(1)
        } else {
            1
        }
    }

    fn shape(&self, partitions: usize) -> FrameShape {
        FrameShape {
            total_rows: self.rows,
            partition_rows: self.rows.div_ceil(partitions.max(1)),
            columns: self.columns,
            partitions,
            threads: self.threads,
        }
    }

    /// Frame plus bookkeeping bytes with `partitions` partitions.
    pub fn memory_usage(&self, partitions: usize, bookkeeping: impl Fn(&FrameShape) -> u64) -> u64 {
        let shape = self.shape(partitions);
        DataFrame::estimate_memory_usage(shape.partition_rows, shape.columns) + bookkeeping(&shape)
    }

    /// Double the partition count from one until the job fits in the
    /// memory limit or no more partitions are allowed.
    pub fn plan(&self, bookkeeping: impl Fn(&FrameShape) -> u64) -> ExecutionStrategy {
        let max_partitions = self.max_partitions();
        let mut partitions = 1;
        while partitions < max_partitions && self.memory_usage(partitions, &bookkeeping) > self.memory_limit {
            partitions = (partitions * 2).min(max_partitions);
        }
        ExecutionStrategy {
            number_partitions: partitions,
            max_rows_per_partition: self.rows.div_ceil(partitions),
        }
    }

    pub fn estimate(&self, bookkeeping: impl Fn(&FrameShape) -> u64) -> MemoryUsageEstimate {
        if self.rows == 0 {
            return MemoryUsageEstimate::default();
        }
        let spill = PlanningInput {
            disk_usage_allowed: true,
            ..*self
        };
        MemoryUsageEstimate {
            without_disk: self.memory_usage(1, &bookkeeping),
            with_disk: self.memory_usage(spill.max_partitions(), &bookkeeping),
        }
    }
}

/// Bytes needed with the whole frame resident and with one partition
/// resident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsageEstimate {
    pub without_disk: u64,
    pub with_disk: u64,
}

impl MemoryUsageEstimate {
    /// The document reported to the host, in whole kilobytes.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "expected_memory_without_disk": format!("{}kb", bytes_to_kb(self.without_disk)),
            "expected_memory_with_disk": format!("{}kb", bytes_to_kb(self.with_disk)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn input(rows: usize, memory_limit: u64, disk_usage_allowed: bool) -> PlanningInput {
        PlanningInput {
            rows,
            columns: 4,
            threads: 1,
            memory_limit,
            disk_usage_allowed,
        }
    }

    #[rstest]
    #[case(10_000, u64::MAX, true, 1)]
    #[case(10_000, 1, false, 1)]
    #[case(10_000, 1, true, 100)]
    #[case(10_000, 50_000, true, 4)]
    fn plans_partitions(#[case] rows: usize, #[case] limit: u64, #[case] disk: bool, #[case] expected: usize) {
        let strategy = input(rows, limit, disk).plan(|_| 0);
        assert_eq!(strategy.number_partitions, expected);
        assert_eq!(strategy.max_rows_per_partition, rows.div_ceil(expected));
        assert_eq!(strategy.in_main_memory(), expected == 1);
    }

    #[test]
    fn partitions_cover_all_rows() {
        let strategy = ExecutionStrategy {
            number_partitions: 3,
            max_rows_per_partition: 4,
        };
        let ranges: Vec<_> = strategy.partitions(10).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn estimate_reports_both_numbers() {
        let estimate = input(10_000, 0, false).estimate(|shape| shape.partition_rows as u64);
        assert_eq!(estimate.without_disk, 10_000 * 20 + 10_000);
        assert_eq!(estimate.with_disk, 100 * 20 + 100);
        assert_eq!(
            estimate.to_json(),
            serde_json::json!({
                "expected_memory_without_disk": "206kb",
                "expected_memory_with_disk": "3kb",
            })
        );
        assert_eq!(input(0, 0, true).estimate(|_| 100), MemoryUsageEstimate::default());
    }
}
