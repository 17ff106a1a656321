//! Aggregate statistics over one run's worker results.

use super::{Operation, WorkerResult};
use crate::config::ExecutionMode;
use serde::Serialize;

/// mean/median/min/max over a sample
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    /// Summarize `values`; all zero when empty.
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Summary::default();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        Summary {
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
            min: sorted[0],
            max: sorted[n - 1],
        }
    }
}

/// One row of benchmark output.
///
/// Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub operation: Operation,
    pub file_size_mb: u64,
    pub client_pool_size: usize,
    pub server_pool_size: usize,
    pub executor_type: ExecutionMode,
    pub success_count: usize,
    pub fail_count: usize,
    pub avg_duration: f64,
    pub median_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub avg_throughput: f64,
    pub median_throughput: f64,
    pub min_throughput: f64,
    pub max_throughput: f64,
    pub timestamp: String,
}

/// Parameters identifying a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunKey {
    pub operation: Operation,
    pub file_size_mb: u64,
    pub client_pool_size: usize,
    pub server_pool_size: usize,
    pub executor: ExecutionMode,
}

impl RunRecord {
    /// Aggregate results; only successful results feed the distributions.
    pub fn from_results(key: RunKey, results: &[WorkerResult]) -> Self {
        let ok: Vec<&WorkerResult> = results.iter().filter(|r| r.is_ok()).collect();
        let durations: Vec<f64> = ok.iter().map(|r| r.duration).collect();
        let throughputs: Vec<f64> = ok.iter().map(|r| r.throughput).collect();
        let duration = Summary::of(&durations);
        let throughput = Summary::of(&throughputs);

        RunRecord {
            operation: key.operation,
            file_size_mb: key.file_size_mb,
            client_pool_size: key.client_pool_size,
            server_pool_size: key.server_pool_size,
            executor_type: key.executor,
            success_count: ok.len(),
            fail_count: results.len() - ok.len(),
            avg_duration: duration.mean,
            median_duration: duration.median,
            min_duration: duration.min,
            max_duration: duration.max,
            avg_throughput: throughput.mean,
            median_throughput: throughput.median,
            min_throughput: throughput.min,
            max_throughput: throughput.max,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;

    fn result(worker_id: usize, duration: f64, ok: bool) -> WorkerResult {
        WorkerResult {
            worker_id,
            operation: Operation::Upload,
            file_size: if ok { 1000 } else { 0 },
            duration,
            throughput: if ok { 1000.0 / duration } else { 0.0 },
            status: if ok { Status::Ok } else { Status::Error },
            error: if ok { String::new() } else { "boom".to_string() },
        }
    }

    fn key() -> RunKey {
        RunKey {
            operation: Operation::Upload,
            file_size_mb: 10,
            client_pool_size: 4,
            server_pool_size: 5,
            executor: ExecutionMode::Thread,
        }
    }

    #[test]
    fn test_summary_odd() {
        let s = Summary::of(&[3.0, 1.0, 2.0]);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.median, 2.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 3.0);
    }

    #[test]
    fn test_summary_even_median() {
        let s = Summary::of(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(s.median, 2.5);
        assert_eq!(s.mean, 2.5);
    }

    #[test]
    fn test_summary_empty() {
        assert_eq!(Summary::of(&[]), Summary::default());
    }

    #[test]
    fn test_record_ignores_failures_in_distributions() {
        let results = vec![
            result(0, 1.0, true),
            result(1, 2.0, true),
            result(2, 50.0, false),
            result(3, 4.0, true),
        ];
        let record = RunRecord::from_results(key(), &results);

        assert_eq!(record.success_count, 3);
        assert_eq!(record.fail_count, 1);
        assert_eq!(record.max_duration, 4.0);
        assert_eq!(record.min_duration, 1.0);
        assert_eq!(record.median_duration, 2.0);
        assert_eq!(record.max_throughput, 1000.0);
        assert_eq!(record.server_pool_size, 5);
    }

    #[test]
    fn test_record_all_failed() {
        let results = vec![result(0, 1.0, false), result(1, 1.0, false)];
        let record = RunRecord::from_results(key(), &results);
        assert_eq!(record.success_count, 0);
        assert_eq!(record.fail_count, 2);
        assert_eq!(record.avg_duration, 0.0);
        assert_eq!(record.avg_throughput, 0.0);
    }
}
