//! Streaming statistics engine.
//!
//! Workers record one message per operation on an unbounded channel; a
//! single consumer task owns all mutable state, so recording never blocks
//! the worker loops. A periodic tick swaps the accumulation buffers out and
//! turns them into [`WorkloadReport`]s.

use crate::report::{percentile, BatchStats, WorkloadReport};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Ticks closer together than this produce implausible rates; their
/// snapshot is discarded and the buffers keep accumulating.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Completed reports are retained this long for the query surface.
const RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("stats engine is stopped")]
    EngineStopped,
}

enum Message {
    Record {
        workload: String,
        duration_ms: f64,
        records: u64,
        batch: u64,
    },
    Tick {
        reply: oneshot::Sender<Vec<WorkloadReport>>,
    },
    ReportsSince {
        since: DateTime<Utc>,
        reply: oneshot::Sender<Vec<WorkloadReport>>,
    },
}

/// Cloneable front end to the engine task.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl StatsHandle {
    /// Record one completed operation. Never blocks.
    pub fn record(
        &self,
        workload: impl Into<String>,
        duration: Duration,
        records: u64,
        batch: u64,
    ) {
        let _ = self.tx.send(Message::Record {
            workload: workload.into(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            records,
            batch,
        });
    }

    /// Close the current interval and return its reports.
    pub async fn tick(&self) -> Result<Vec<WorkloadReport>, StatsError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Tick { reply })
            .map_err(|_| StatsError::EngineStopped)?;
        rx.await.map_err(|_| StatsError::EngineStopped)
    }

    /// Retained reports with a timestamp at or after `since`.
    pub async fn reports_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkloadReport>, StatsError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::ReportsSince { since, reply })
            .map_err(|_| StatsError::EngineStopped)?;
        rx.await.map_err(|_| StatsError::EngineStopped)
    }

    /// Every retained report.
    pub async fn all_reports(&self) -> Result<Vec<WorkloadReport>, StatsError> {
        self.reports_since(DateTime::<Utc>::MIN_UTC).await
    }
}

#[derive(Default)]
struct Buffer {
    durations_ms: Vec<f64>,
    records: u64,
    batches: Vec<u64>,
}

struct Engine {
    percentiles: Vec<f64>,
    buffers: HashMap<String, Buffer>,
    history: BTreeMap<i64, Vec<WorkloadReport>>,
    last_tick: Instant,
}

/// Start the engine task; `percentiles` configures the duration
/// percentiles of every report.
pub fn start(percentiles: Vec<f64>) -> StatsHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut engine = Engine {
        percentiles,
        buffers: HashMap::new(),
        history: BTreeMap::new(),
        last_tick: Instant::now(),
    };
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            engine.handle(message);
        }
        debug!("stats engine stopped");
    });
    StatsHandle { tx }
}

impl Engine {
    fn handle(&mut self, message: Message) {
        match message {
            Message::Record {
                workload,
                duration_ms,
                records,
                batch,
            } => {
                let buffer = self.buffers.entry(workload).or_default();
                buffer.durations_ms.push(duration_ms);
                buffer.records += records;
                buffer.batches.push(batch);
            }
            Message::Tick { reply } => {
                let _ = reply.send(self.tick());
            }
            Message::ReportsSince { since, reply } => {
                let cutoff = since.timestamp_millis();
                let reports = self
                    .history
                    .range(cutoff..)
                    .flat_map(|(_, reports)| reports.iter().cloned())
                    .collect();
                let _ = reply.send(reports);
            }
        }
    }

    fn tick(&mut self) -> Vec<WorkloadReport> {
        let elapsed = self.last_tick.elapsed();
        if elapsed < MIN_INTERVAL {
            debug!("discarding stats snapshot after {elapsed:?}");
            return Vec::new();
        }
        self.last_tick = Instant::now();

        let timestamp = Utc::now();
        let interval_ms = elapsed.as_millis() as u64;
        let interval_s = elapsed.as_secs_f64();

        let mut reports = Vec::with_capacity(self.buffers.len());
        for (workload, mut buffer) in std::mem::take(&mut self.buffers) {
            if buffer.durations_ms.is_empty() {
                continue;
            }
            buffer
                .durations_ms
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let ops = buffer.durations_ms.len() as u64;
            let busy_ms: f64 = buffer.durations_ms.iter().sum();
            let duration_percentiles = self
                .percentiles
                .iter()
                .map(|p| (*p, percentile(&buffer.durations_ms, *p)))
                .collect();

            reports.push(WorkloadReport {
                workload,
                timestamp,
                interval_ms,
                ops,
                ops_per_second: ops as f64 / interval_s,
                records: buffer.records,
                records_per_second: buffer.records as f64 / interval_s,
                mean_duration_ms: busy_ms / ops as f64,
                duration_percentiles,
                batch: batch_stats(&buffer.batches),
                utilization_pct: busy_ms / interval_ms as f64 * 100.0,
            });
        }

        self.history
            .insert(timestamp.timestamp_millis(), reports.clone());
        let cutoff = timestamp.timestamp_millis() - RETENTION.as_millis() as i64;
        self.history.retain(|ts, _| *ts >= cutoff);

        reports
    }
}

fn batch_stats(batches: &[u64]) -> BatchStats {
    if batches.is_empty() {
        return BatchStats::default();
    }
    BatchStats {
        mean: batches.iter().sum::<u64>() as f64 / batches.len() as f64,
        min: *batches.iter().min().unwrap_or(&0),
        max: *batches.iter().max().unwrap_or(&0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tick_aggregates_and_resets() {
        let handle = start(vec![50.0, 95.0]);
        for ms in [10, 20, 30, 40, 50] {
            handle.record("w", Duration::from_millis(ms), 2, 1);
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let reports = handle.tick().await.unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.ops, 5);
        assert_eq!(report.records, 10);
        assert_eq!(report.duration_percentiles[0], (50.0, 30.0));
        assert_eq!(report.duration_percentiles[1], (95.0, 50.0));
        assert!((report.mean_duration_ms - 30.0).abs() < 1e-9);

        // buffers were swapped out, nothing accrues to the next interval
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(handle.tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fast_tick_is_discarded() {
        let handle = start(vec![50.0]);
        handle.record("w", Duration::from_millis(10), 1, 1);
        assert!(handle.tick().await.unwrap().is_empty());

        // the records survive the discarded snapshot
        tokio::time::sleep(Duration::from_millis(120)).await;
        let reports = handle.tick().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ops, 1);
    }

    #[tokio::test]
    async fn test_reports_since_filters_history() {
        let handle = start(vec![50.0]);
        handle.record("w", Duration::from_millis(5), 1, 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.tick().await.unwrap();

        let all = handle.all_reports().await.unwrap();
        assert_eq!(all.len(), 1);
        let none = handle
            .reports_since(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_batch_stats() {
        let stats = batch_stats(&[1, 3, 5]);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 5);
        assert!((stats.mean - 3.0).abs() < 1e-9);
        assert_eq!(batch_stats(&[]), BatchStats::default());
    }
}
