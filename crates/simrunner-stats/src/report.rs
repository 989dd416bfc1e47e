//! Report model and percentile math.

use bson::{doc, Document};
use serde::Serialize;

/// Value at percentile `p` (0..=100) of a sorted slice, using the
/// `ceil(p/100 * n)`-th order statistic (1-indexed, clamped).
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Batch size statistics over one interval.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct BatchStats {
    pub mean: f64,
    pub min: u64,
    pub max: u64,
}

/// One workload's metrics over one reporting interval.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub workload: String,
    /// Interval end, UTC.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub interval_ms: u64,
    pub ops: u64,
    pub ops_per_second: f64,
    pub records: u64,
    pub records_per_second: f64,
    pub mean_duration_ms: f64,
    /// (percentile, duration ms) pairs, in configuration order.
    pub duration_percentiles: Vec<(f64, f64)>,
    pub batch: BatchStats,
    /// Share of the interval the workload's workers spent inside store
    /// operations, in percent of total worker time.
    pub utilization_pct: f64,
}

impl WorkloadReport {
    /// BSON rendering used by the Mongo sink and the report query surface.
    pub fn to_document(&self) -> Document {
        let percentiles: Document = self
            .duration_percentiles
            .iter()
            .map(|(p, v)| (format!("p{}", *p as u64), bson::Bson::Double(*v)))
            .collect();
        doc! {
            "workload": &self.workload,
            "timestamp": bson::DateTime::from_chrono(self.timestamp),
            "interval ms": self.interval_ms as i64,
            "ops": self.ops as i64,
            "ops per second": self.ops_per_second,
            "records": self.records as i64,
            "records per second": self.records_per_second,
            "mean duration ms": self.mean_duration_ms,
            "duration percentiles": percentiles,
            "mean batch size": self.batch.mean,
            "min batch size": self.batch.min as i64,
            "max batch size": self.batch.max as i64,
            "client utilization pct": self.utilization_pct,
        }
    }

    /// One-line human rendering for the log sink.
    pub fn to_log_line(&self) -> String {
        let percentiles = self
            .duration_percentiles
            .iter()
            .map(|(p, v)| format!("p{}={v:.1}ms", *p as u64))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{}: {} ops ({:.1}/s), {} records ({:.1}/s), mean {:.1}ms {}, util {:.1}%",
            self.workload,
            self.ops,
            self.ops_per_second,
            self.records,
            self.records_per_second,
            self.mean_duration_ms,
            percentiles,
            self.utilization_pct,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_order_statistic() {
        let sorted = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&sorted, 50.0), 30.0);
        assert_eq!(percentile(&sorted, 95.0), 50.0);
        assert_eq!(percentile(&sorted, 100.0), 50.0);
        assert_eq!(percentile(&sorted, 1.0), 10.0);
    }

    #[test]
    fn test_percentile_edge_cases() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.0], 50.0), 7.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_report_document_keys() {
        let report = WorkloadReport {
            workload: "w".to_string(),
            timestamp: chrono::Utc::now(),
            interval_ms: 1000,
            ops: 10,
            ops_per_second: 10.0,
            records: 20,
            records_per_second: 20.0,
            mean_duration_ms: 1.5,
            duration_percentiles: vec![(50.0, 1.0), (95.0, 3.0)],
            batch: BatchStats {
                mean: 2.0,
                min: 1,
                max: 3,
            },
            utilization_pct: 42.0,
        };
        let doc = report.to_document();
        assert_eq!(doc.get_str("workload").unwrap(), "w");
        assert_eq!(doc.get_i64("ops").unwrap(), 10);
        let percentiles = doc.get_document("duration percentiles").unwrap();
        assert_eq!(percentiles.get_f64("p50").unwrap(), 1.0);
        assert_eq!(percentiles.get_f64("p95").unwrap(), 3.0);
    }
}
