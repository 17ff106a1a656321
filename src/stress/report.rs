//! Benchmark result persistence.

use super::stats::RunRecord;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default output name for a session finishing now.
pub fn default_output(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    dir.join(format!("stress_results_{}.csv", stamp))
}

/// Write all records as CSV rows under a header of field names.
///
/// Returns `Ok(false)` without touching the filesystem when there is
/// nothing to write.
pub fn save_csv(records: &[RunRecord], path: &Path) -> Result<bool, csv::Error> {
    if records.is_empty() {
        return Ok(false);
    }

    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = records.len(), "Saved results");
    Ok(true)
}

/// Log one record in a readable, aligned form.
pub fn log_record(record: &RunRecord) {
    info!(
        operation = %record.operation,
        file_size_mb = record.file_size_mb,
        client_pool = record.client_pool_size,
        server_pool = record.server_pool_size,
        executor = %record.executor_type,
        success = record.success_count,
        fail = record.fail_count,
        avg_duration_s = %format!("{:.3}", record.avg_duration),
        median_duration_s = %format!("{:.3}", record.median_duration),
        avg_mib_s = %format!("{:.2}", record.avg_throughput / 1024.0 / 1024.0),
        "Run complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::stress::stats::RunKey;
    use crate::stress::Operation;

    #[test]
    fn test_save_csv_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let key = RunKey {
            operation: Operation::Download,
            file_size_mb: 50,
            client_pool_size: 5,
            server_pool_size: 1,
            executor: ExecutionMode::Process,
        };
        let records = vec![
            RunRecord::from_results(key, &[]),
            RunRecord::from_results(key, &[]),
        ];

        assert!(save_csv(&records, &path).unwrap());

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "operation,file_size_mb,client_pool_size,server_pool_size,executor_type,\
             success_count,fail_count,avg_duration,median_duration,min_duration,max_duration,\
             avg_throughput,median_throughput,min_throughput,max_throughput,timestamp"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("download,50,5,1,process,0,0,"));
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn test_save_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.csv");
        assert!(!save_csv(&[], &path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_default_output_name() {
        let path = default_output(Path::new("results"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("stress_results_"));
        assert!(name.ends_with(".csv"));
    }
}
