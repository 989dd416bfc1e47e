//! Document store abstraction for the simrunner load simulator.
//!
//! Workloads drive a [`DocumentCollection`] and never see the underlying
//! driver. Two implementations exist: [`mongo::MongoStore`] over the MongoDB
//! async driver, and [`memory::MemoryStore`], an in-process store with
//! equality-based filtering used by tests and `memory://` dry runs.

pub mod error;
pub mod memory;
pub mod mongo;

pub use error::StoreError;

use async_trait::async_trait;
use bson::{Bson, Document};
use std::sync::Arc;

/// Read options for [`DocumentCollection::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

/// An update is either a modifier document (`$set`, `$inc`, ...) or an
/// aggregation pipeline.
#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Document(Document),
    Pipeline(Vec<Document>),
}

/// One model of a mixed bulk write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertOne(Document),
    UpdateOne {
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
}

/// Counters reported by write operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

impl WriteOutcome {
    /// Number of records the operation touched, for throughput accounting.
    pub fn records(&self) -> u64 {
        self.modified + self.upserted
    }
}

/// Collection creation options applied at template initialization.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Capped collection size in bytes.
    pub capped_size: Option<u64>,
    pub timeseries: Option<TimeseriesSpec>,
    pub expire_after_seconds: Option<u64>,
}

impl CreateOptions {
    pub fn is_default(&self) -> bool {
        self.capped_size.is_none() && self.timeseries.is_none() && self.expire_after_seconds.is_none()
    }
}

/// Native time-series collection parameters.
#[derive(Debug, Clone)]
pub struct TimeseriesSpec {
    pub time_field: String,
    pub meta_field: Option<String>,
    /// `seconds`, `minutes` or `hours`.
    pub granularity: Option<String>,
}

/// A connected document store, handing out collection handles.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn collection(&self, database: &str, name: &str) -> Arc<dyn DocumentCollection>;

    async fn collection_exists(&self, database: &str, name: &str) -> Result<bool, StoreError>;

    async fn create_collection(
        &self,
        database: &str,
        name: &str,
        options: &CreateOptions,
    ) -> Result<(), StoreError>;
}

/// One named collection of BSON documents.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// `database.collection`, for logs.
    fn namespace(&self) -> String;

    async fn insert_one(&self, doc: Document) -> Result<(), StoreError>;

    /// Returns the number of documents inserted.
    async fn insert_many(&self, docs: Vec<Document>, ordered: bool) -> Result<u64, StoreError>;

    async fn find(
        &self,
        filter: Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn update_one(
        &self,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError>;

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError>;

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError>;

    /// Returns the number of documents deleted.
    async fn delete_one(&self, filter: Document) -> Result<u64, StoreError>;

    async fn delete_many(&self, filter: Document) -> Result<u64, StoreError>;

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, StoreError>;

    /// Mixed bulk write; returns the number of documents touched.
    async fn bulk_write(&self, ops: Vec<WriteOp>, ordered: bool) -> Result<u64, StoreError>;

    /// Up to `limit` distinct values of the dotted `path` across the
    /// collection, used by the remembrance preload.
    async fn distinct_sample(&self, path: &str, limit: usize) -> Result<Vec<Bson>, StoreError>;

    async fn create_index(&self, keys: Document) -> Result<(), StoreError>;

    /// Drop the backing collection. Named so it cannot be mistaken for
    /// `Drop` glue when called through `Arc<dyn DocumentCollection>`.
    async fn drop_collection(&self) -> Result<(), StoreError>;
}

/// Scheme used by the in-memory store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Connect to a store by connection string. `memory://` yields the
/// in-process store, anything else goes to the MongoDB driver.
pub async fn connect(uri: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
    if uri.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(memory::MemoryStore::new()));
    }
    Ok(Arc::new(mongo::MongoStore::connect(uri).await?))
}
