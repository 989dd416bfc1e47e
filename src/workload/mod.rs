//! Workloads: named groups of paced worker loops driving one operation
//! against one template's collection.

pub mod ops;
pub mod timeseries;

use crate::config::{VariablesScope, WorkloadConfig};
use crate::registry::RunnerRegistry;
use crate::template::{as_document, Template};
use anyhow::Context;
use bson::Document;
use ops::Operation;
use simrunner_generator::compiler::Generator;
use simrunner_generator::spec::yaml_to_bson;
use simrunner_generator::GenContext;
use simrunner_stats::StatsHandle;
use simrunner_store::DocumentCollection;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Workload {
    name: String,
    op: String,
    params: Document,
    template: Arc<Template>,
    collection: Arc<dyn DocumentCollection>,
    variables: Option<Arc<dyn Generator>>,
    scope: VariablesScope,
    threads: u32,
    batch: usize,
    pace: Duration,
    start_delay: Duration,
    stop_iterations: Option<u64>,
    stop_duration: Option<Duration>,
    stats: StatsHandle,
    runners: RunnerRegistry,
}

impl Workload {
    /// Build one workload bound to one template instance. The workload name
    /// picks up the template's instance suffix so fanned-out workloads
    /// report separately.
    pub fn build(
        config: &WorkloadConfig,
        template: Arc<Template>,
        stats: StatsHandle,
        runners: RunnerRegistry,
    ) -> anyhow::Result<Self> {
        let name = match template.instance() {
            Some(i) => format!("{}_{i}", config.name),
            None => config.name.clone(),
        };

        let params = match &config.params {
            Some(value) => {
                let value = yaml_to_bson(value)
                    .with_context(|| format!("workload '{name}': invalid params"))?;
                match value {
                    bson::Bson::Document(doc) => doc,
                    other => anyhow::bail!("workload '{name}': params must be a mapping, got {other:?}"),
                }
            }
            None => Document::new(),
        };

        let variables = match &config.variables {
            Some(spec) => {
                let spec = yaml_to_bson(spec)
                    .with_context(|| format!("workload '{name}': invalid variables"))?;
                Some(
                    template
                        .compile(&spec)
                        .with_context(|| format!("workload '{name}': cannot compile variables"))?,
                )
            }
            None => None,
        };

        let collection = template.collection();
        let workload = Self {
            name,
            op: config.op.clone(),
            params,
            template,
            collection,
            variables,
            scope: config.variables_scope,
            threads: config.threads,
            batch: config.batch as usize,
            pace: Duration::from_millis(config.pace),
            start_delay: Duration::from_millis(config.start_delay),
            stop_iterations: config.stop_after.as_ref().and_then(|s| s.iterations()),
            stop_duration: config
                .stop_after
                .as_ref()
                .and_then(|s| s.duration_millis())
                .map(Duration::from_millis),
            stats,
            runners,
        };

        // surface bad op parameters now rather than in the first iteration
        workload.build_operation()?;
        Ok(workload)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn collection(&self) -> Arc<dyn DocumentCollection> {
        Arc::clone(&self.collection)
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn refresh_per_operation(&self) -> bool {
        self.scope == VariablesScope::Operation
    }

    /// Push one completed operation to the stats engine.
    pub fn record(&self, records: u64, duration: Duration) {
        self.stats.record(&self.name, duration, records, records);
    }

    /// Generate the workload's variable scope for one scope unit.
    pub fn scope_variables(&self, ctx: &mut GenContext) -> Document {
        match &self.variables {
            Some(tree) => as_document(tree.generate(ctx)),
            None => Document::new(),
        }
    }

    fn build_operation(&self) -> anyhow::Result<Operation> {
        Operation::build(&self.op, &self.params, &self.template, &self.runners)
            .with_context(|| format!("workload '{}'", self.name))
    }

    /// Spawn one task per worker. Each worker owns its operation instance,
    /// so per-worker operation state (time-series clocks) is not shared.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        info!("starting workload {} ({} workers)", self.name, self.threads);
        let mut handles = Vec::with_capacity(self.threads as usize);
        for worker in 0..self.threads {
            let op = self.build_operation()?;
            let workload = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                workload.worker_loop(worker, op).await;
            }));
        }
        Ok(handles)
    }

    async fn worker_loop(&self, worker: u32, mut op: Operation) {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut ctx = GenContext::new(self.template.state(), self.name.clone(), worker);
        let mut busy = Duration::ZERO;

        loop {
            // per-operation scoping installs fresh variables inside the op
            let saved = (!self.refresh_per_operation())
                .then(|| {
                    let vars = self.scope_variables(&mut ctx);
                    ctx.install_variables(vars)
                })
                .flatten();

            let result = op.execute(self, &mut ctx).await;

            // teardown is unconditional: a failed iteration must not leak
            // its variables into the next one
            ctx.restore_variables(saved);

            let duration = match result {
                Ok(duration) => duration,
                Err(e) => {
                    error!("workload {} worker {worker}: iteration failed: {e:#}", self.name);
                    Duration::ZERO
                }
            };

            busy += duration;
            ctx.iteration += 1;
            if self.should_stop(ctx.iteration, busy) {
                info!(
                    "workload {} worker {worker} stopping after {} iterations",
                    self.name, ctx.iteration
                );
                break;
            }

            if !self.pace.is_zero() {
                tokio::time::sleep(pace_sleep(self.pace, duration)).await;
            }
        }
    }

    /// `busy` is the sum of observed operation durations so far; pacing
    /// sleeps and startup delay do not count against a duration limit.
    fn should_stop(&self, iterations: u64, busy: Duration) -> bool {
        if let Some(limit) = self.stop_iterations {
            if iterations >= limit {
                return true;
            }
        }
        if let Some(limit) = self.stop_duration {
            if busy >= limit {
                return true;
            }
        }
        false
    }
}

/// Remaining sleep after an iteration that took `observed` out of a `pace`
/// millisecond budget.
pub fn pace_sleep(pace: Duration, observed: Duration) -> Duration {
    pace.saturating_sub(observed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use simrunner_generator::registry::GeneratorRegistry;
    use simrunner_store::memory::MemoryStore;

    fn duration_bounded_workload() -> Workload {
        let config: RunConfig = serde_yaml::from_str(
            r#"
connectionString: memory://
templates:
  - name: items
    database: test
    collection: items
    template:
      sku: { "%natural": { min: 0, max: 100 } }
workloads:
  - name: w
    template: items
    op: insert
    pace: 100
    stopAfter: { duration: 50 }
"#,
        )
        .unwrap();
        let template = Arc::new(
            Template::build(
                &config.templates[0],
                None,
                Arc::new(MemoryStore::new()),
                GeneratorRegistry::default(),
            )
            .unwrap(),
        );
        Workload::build(
            &config.workloads[0],
            template,
            simrunner_stats::start(vec![50.0]),
            RunnerRegistry::default(),
        )
        .unwrap()
    }

    /// A duration limit counts accumulated operation time, not wall clock,
    /// so pacing sleeps never run the budget down.
    #[tokio::test]
    async fn test_duration_stop_ignores_wall_clock() {
        let workload = duration_bounded_workload();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!workload.should_stop(5, Duration::from_millis(10)));
        assert!(workload.should_stop(5, Duration::from_millis(50)));
        assert!(workload.should_stop(5, Duration::from_millis(80)));
    }

    #[test]
    fn test_pace_sleep_arithmetic() {
        assert_eq!(
            pace_sleep(Duration::from_millis(100), Duration::from_millis(30)),
            Duration::from_millis(70)
        );
        assert_eq!(
            pace_sleep(Duration::from_millis(100), Duration::from_millis(250)),
            Duration::ZERO
        );
    }
}
