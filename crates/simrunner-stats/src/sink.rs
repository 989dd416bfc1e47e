//! Report sinks.

use crate::report::WorkloadReport;
use async_trait::async_trait;
use simrunner_store::{DocumentCollection, StoreError};
use std::sync::Arc;
use tracing::{info, warn};

/// Destination for the reports of one tick.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, reports: &[WorkloadReport]);
}

/// Writes one log line per workload report.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn publish(&self, reports: &[WorkloadReport]) {
        for report in reports {
            info!("{}", report.to_log_line());
        }
    }
}

/// Inserts serialized reports into a store collection.
pub struct MongoSink {
    collection: Arc<dyn DocumentCollection>,
}

impl MongoSink {
    pub fn new(collection: Arc<dyn DocumentCollection>) -> Self {
        Self { collection }
    }

    async fn insert(&self, reports: &[WorkloadReport]) -> Result<(), StoreError> {
        let docs = reports.iter().map(WorkloadReport::to_document).collect();
        self.collection.insert_many(docs, false).await?;
        Ok(())
    }
}

#[async_trait]
impl ReportSink for MongoSink {
    async fn publish(&self, reports: &[WorkloadReport]) {
        if reports.is_empty() {
            return;
        }
        // report persistence never fails the run
        if let Err(e) = self.insert(reports).await {
            warn!("cannot persist reports to {}: {e}", self.collection.namespace());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::BatchStats;
    use simrunner_store::memory::MemoryStore;
    use simrunner_store::{DocumentStore, FindOptions};

    fn report(workload: &str) -> WorkloadReport {
        WorkloadReport {
            workload: workload.to_string(),
            timestamp: chrono::Utc::now(),
            interval_ms: 1000,
            ops: 1,
            ops_per_second: 1.0,
            records: 1,
            records_per_second: 1.0,
            mean_duration_ms: 1.0,
            duration_percentiles: vec![(50.0, 1.0)],
            batch: BatchStats::default(),
            utilization_pct: 1.0,
        }
    }

    #[tokio::test]
    async fn test_mongo_sink_inserts_documents() {
        let store = MemoryStore::new();
        let collection = store.collection("monitor", "reports");
        let sink = MongoSink::new(Arc::clone(&collection));

        sink.publish(&[report("a"), report("b")]).await;

        let stored = collection
            .find(bson::doc! {}, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].get_str("workload").unwrap(), "a");
    }

    #[tokio::test]
    async fn test_mongo_sink_swallows_store_errors() {
        let store = MemoryStore::new();
        let collection = store.collection("monitor", "reports");
        let sink = MongoSink::new(collection);
        store.fail_next(1);
        // must not panic or propagate
        sink.publish(&[report("a")]).await;
    }
}
