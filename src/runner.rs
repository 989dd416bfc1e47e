//! Top-level orchestration: build templates and workloads from a validated
//! configuration, initialize the store, run the workers and the periodic
//! reporting tick.

use crate::config::RunConfig;
use crate::registry::RunnerRegistry;
use crate::template::Template;
use crate::workload::Workload;
use anyhow::Context;
use simrunner_generator::registry::GeneratorRegistry;
use simrunner_stats::{LogSink, MongoSink, ReportSink, StatsHandle, WorkloadReport};
use simrunner_store::DocumentStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct SimRunner {
    store: Arc<dyn DocumentStore>,
    templates: Vec<Arc<Template>>,
    workloads: Vec<Arc<Workload>>,
    stats: StatsHandle,
    sinks: Vec<Arc<dyn ReportSink>>,
    report_interval: Duration,
    http_port: Option<u16>,
    /// Every workload stops on its own, so the run has a natural end.
    bounded: bool,
}

impl SimRunner {
    pub async fn new(
        config: RunConfig,
        generators: GeneratorRegistry,
        runners: RunnerRegistry,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = simrunner_store::connect(&config.connection_string)
            .await
            .context("cannot connect to the document store")?;
        let stats = simrunner_stats::start(config.report_percentiles.clone());

        // template instances fan out before workloads bind to them
        let mut by_base: HashMap<String, Vec<Arc<Template>>> = HashMap::new();
        let mut templates = Vec::new();
        for template_config in &config.templates {
            let instances: Vec<Option<u32>> = match template_config.instances {
                Some(n) => (0..n).map(Some).collect(),
                None => vec![None],
            };
            for instance in instances {
                let template = Arc::new(Template::build(
                    template_config,
                    instance,
                    Arc::clone(&store),
                    generators.clone(),
                )?);
                by_base
                    .entry(template_config.name.clone())
                    .or_default()
                    .push(Arc::clone(&template));
                templates.push(template);
            }
        }

        let mut workloads = Vec::new();
        for workload_config in config.workloads.iter().filter(|w| !w.disabled) {
            let bound = by_base
                .get(&workload_config.template)
                .with_context(|| format!("unknown template '{}'", workload_config.template))?;
            for template in bound {
                workloads.push(Arc::new(Workload::build(
                    workload_config,
                    Arc::clone(template),
                    stats.clone(),
                    runners.clone(),
                )?));
            }
        }

        let mut sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(LogSink)];
        if let Some(reporter) = &config.mongo_reporter {
            sinks.push(Arc::new(MongoSink::new(
                store.collection(&reporter.database, &reporter.collection),
            )));
        }

        Ok(Self {
            store,
            templates,
            workloads,
            stats,
            sinks,
            report_interval: Duration::from_millis(config.report_interval),
            http_port: config.http.as_ref().map(|h| h.port),
            bounded: config.all_workloads_bounded(),
        })
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Initialize every template, start every workload and report on the
    /// configured interval. Returns once all workloads have stopped, or
    /// never when any of them is unbounded.
    pub async fn start(&self) -> anyhow::Result<()> {
        for template in &self.templates {
            template
                .initialize()
                .await
                .with_context(|| format!("cannot initialize template '{}'", template.name()))?;
        }

        if let Some(port) = self.http_port {
            warn!("http is configured (port {port}) but this build exposes reports through the stats engine only");
        }

        let mut handles = Vec::new();
        for workload in &self.workloads {
            handles.extend(workload.start()?);
        }
        info!("{} workloads running", self.workloads.len());

        if !self.bounded {
            loop {
                tokio::time::sleep(self.report_interval).await;
                self.tick_and_publish().await?;
            }
        }

        // bounded run: report in the background and wait for the workers
        let reporter = {
            let stats = self.stats.clone();
            let sinks = self.sinks.clone();
            let interval = self.report_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match stats.tick().await {
                        Ok(reports) => publish(&sinks, &reports).await,
                        Err(_) => break,
                    }
                }
            })
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker task failed: {e}");
            }
        }
        reporter.abort();

        // close out the last interval
        self.tick_and_publish().await?;
        info!("all workloads stopped");
        Ok(())
    }

    async fn tick_and_publish(&self) -> anyhow::Result<()> {
        let reports = self.stats.tick().await?;
        publish(&self.sinks, &reports).await;
        Ok(())
    }
}

async fn publish(sinks: &[Arc<dyn ReportSink>], reports: &[WorkloadReport]) {
    if reports.is_empty() {
        return;
    }
    for sink in sinks {
        sink.publish(reports).await;
    }
}
