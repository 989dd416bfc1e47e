//! Named-factory registry for custom runners.
//!
//! Custom operation implementations are registered under a name before the
//! configuration is parsed; a workload with `op: custom` names one of them
//! in `params.name`. Unknown names are a startup configuration error.

use crate::workload::ops::OpOutcome;
use crate::workload::Workload;
use async_trait::async_trait;
use bson::Document;
use simrunner_generator::GenContext;
use std::collections::HashMap;
use std::sync::Arc;

/// One iteration of a custom workload. Implementations execute whatever
/// they want against the workload's collection and report how many records
/// they touched and how long the store interaction took.
#[async_trait]
pub trait CustomRunner: Send + Sync {
    async fn run(&self, workload: &Workload, ctx: &mut GenContext) -> anyhow::Result<OpOutcome>;
}

/// Factory building a runner from the raw workload params.
pub type RunnerFactory =
    Arc<dyn Fn(&Document) -> anyhow::Result<Arc<dyn CustomRunner>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct RunnerRegistry {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Document) -> anyhow::Result<Arc<dyn CustomRunner>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, name: &str, params: &Document) -> anyhow::Result<Arc<dyn CustomRunner>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown custom runner '{name}'"))?;
        factory(params)
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
