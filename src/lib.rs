//! simrunner: a synthetic load simulator for document stores.
//!
//! A YAML configuration declares *templates* (randomized document shapes
//! backed by the `simrunner-generator` compiler) and *workloads* (paced
//! worker loops driving one operation each against a template's collection).
//! Throughput and latency percentiles are collected per workload by the
//! `simrunner-stats` engine and published on a fixed interval.
//!
//! Embedders extend the simulator two ways:
//!
//! - custom value generators, registered in a
//!   [`simrunner_generator::GeneratorRegistry`] and referenced from
//!   templates as `%custom` expressions with a `name` parameter;
//! - custom operations, registered in a [`registry::RunnerRegistry`] and
//!   referenced from workloads as `op: custom` with `params.name`.
//!
//! ```no_run
//! use simrunner::config::RunConfig;
//! use simrunner::registry::RunnerRegistry;
//! use simrunner::runner::SimRunner;
//! use simrunner_generator::GeneratorRegistry;
//!
//! # async fn demo(yaml: &str) -> anyhow::Result<()> {
//! let config = RunConfig::parse(yaml)?;
//! let runner = SimRunner::new(
//!     config,
//!     GeneratorRegistry::default(),
//!     RunnerRegistry::default(),
//! )
//! .await?;
//! runner.start().await
//! # }
//! ```

pub mod config;
pub mod registry;
pub mod runner;
pub mod template;
pub mod workload;

pub use config::RunConfig;
pub use registry::{CustomRunner, RunnerRegistry};
pub use runner::SimRunner;
pub use template::Template;
pub use workload::Workload;
