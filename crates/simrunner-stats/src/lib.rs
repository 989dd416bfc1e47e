//! Streaming workload statistics for the simrunner load simulator.
//!
//! Workers push one record per operation into the [`engine`]; a periodic
//! tick produces per-workload [`report::WorkloadReport`]s that go to one or
//! more [`sink::ReportSink`]s and stay queryable for an hour.

pub mod engine;
pub mod report;
pub mod sink;

pub use engine::{start, StatsError, StatsHandle};
pub use report::{percentile, BatchStats, WorkloadReport};
pub use sink::{LogSink, MongoSink, ReportSink};
