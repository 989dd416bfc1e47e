//! Per-worker generation context and shared template state.

use crate::dictionary::DictionaryStore;
use crate::remember::RemembranceStore;
use bson::{Bson, Document};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// State shared by all workers generating against the same template:
/// remembered values and dictionaries. Both tolerate concurrent readers and
/// writers; the latest append may or may not be visible to a concurrent
/// sampler, which is acceptable.
#[derive(Debug, Default)]
pub struct TemplateState {
    pub remembrances: RemembranceStore,
    pub dictionaries: DictionaryStore,
}

impl TemplateState {
    pub fn new(remembrances: RemembranceStore, dictionaries: DictionaryStore) -> Self {
        Self {
            remembrances,
            dictionaries,
        }
    }
}

/// Mutable per-worker scratch state threaded through the generation call path.
///
/// Each worker loop owns exactly one context. Generators never hold mutable
/// state of their own; everything iteration-scoped (RNG, variable scope,
/// per-worker sequence, iteration counter) lives here, so compiled trees stay
/// shareable.
pub struct GenContext {
    pub rng: StdRng,
    workload: String,
    worker: u32,
    /// Completed iterations of the owning worker loop.
    pub iteration: u64,
    worker_sequence: i64,
    variables: Option<Document>,
    state: Arc<TemplateState>,
}

impl GenContext {
    pub fn new(state: Arc<TemplateState>, workload: impl Into<String>, worker: u32) -> Self {
        Self::with_rng(state, workload, worker, StdRng::from_os_rng())
    }

    /// Context with an explicit RNG, for deterministic tests.
    pub fn with_rng(
        state: Arc<TemplateState>,
        workload: impl Into<String>,
        worker: u32,
        rng: StdRng,
    ) -> Self {
        Self {
            rng,
            workload: workload.into(),
            worker,
            iteration: 0,
            worker_sequence: 0,
            variables: None,
            state,
        }
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    pub fn worker(&self) -> u32 {
        self.worker
    }

    pub fn state(&self) -> &TemplateState {
        &self.state
    }

    pub fn shared_state(&self) -> Arc<TemplateState> {
        Arc::clone(&self.state)
    }

    /// Monotonic counter private to this worker.
    pub fn next_worker_sequence(&mut self) -> i64 {
        let n = self.worker_sequence;
        self.worker_sequence += 1;
        n
    }

    /// Look up a variable in the current scope.
    pub fn variable(&self, name: &str) -> Option<&Bson> {
        self.variables.as_ref().and_then(|vars| vars.get(name))
    }

    pub fn variables(&self) -> Option<&Document> {
        self.variables.as_ref()
    }

    /// Install a freshly generated variable scope, merging any enclosing
    /// scope over it: a name already set by an outer caller wins over the
    /// inner value. Returns the previous scope; the caller must hand it back
    /// to [`GenContext::restore_variables`] on every exit path.
    #[must_use = "the previous scope must be restored on every exit path"]
    pub fn install_variables(&mut self, mut generated: Document) -> Option<Document> {
        let previous = self.variables.take();
        if let Some(outer) = &previous {
            for (key, value) in outer {
                generated.insert(key.clone(), value.clone());
            }
        }
        self.variables = Some(generated);
        previous
    }

    /// Restore the scope saved by [`GenContext::install_variables`].
    pub fn restore_variables(&mut self, previous: Option<Document>) {
        self.variables = previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn ctx() -> GenContext {
        GenContext::new(Arc::new(TemplateState::default()), "test", 0)
    }

    #[test]
    fn test_worker_sequence_is_monotonic() {
        let mut ctx = ctx();
        assert_eq!(ctx.next_worker_sequence(), 0);
        assert_eq!(ctx.next_worker_sequence(), 1);
        assert_eq!(ctx.next_worker_sequence(), 2);
    }

    #[test]
    fn test_outer_scope_wins_over_inner() {
        let mut ctx = ctx();
        let saved = ctx.install_variables(doc! { "a": 1, "b": 2 });
        let inner = ctx.install_variables(doc! { "a": 99, "c": 3 });

        assert_eq!(ctx.variable("a"), Some(&bson::Bson::Int32(1)));
        assert_eq!(ctx.variable("c"), Some(&bson::Bson::Int32(3)));

        ctx.restore_variables(inner);
        assert_eq!(ctx.variable("a"), Some(&bson::Bson::Int32(1)));
        assert_eq!(ctx.variable("b"), Some(&bson::Bson::Int32(2)));
        ctx.restore_variables(saved);
        assert!(ctx.variables().is_none());
    }

    #[test]
    fn test_restore_clears_scope() {
        let mut ctx = ctx();
        let saved = ctx.install_variables(doc! { "x": true });
        assert!(ctx.variable("x").is_some());
        ctx.restore_variables(saved);
        assert!(ctx.variable("x").is_none());
    }
}
