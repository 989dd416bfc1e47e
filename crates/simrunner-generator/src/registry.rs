//! Named-factory registry for custom generators.
//!
//! Replaces reflective class loading: custom generator implementations are
//! registered under a name before the configuration is compiled, and an
//! unknown name is a configuration error rather than a silent no-op.

use crate::compiler::{CompileError, Generator};
use bson::Document;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory building a generator from the raw (uncompiled) `%custom` params.
pub type GeneratorFactory =
    Arc<dyn Fn(&Document) -> Result<Arc<dyn Generator>, CompileError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    factories: HashMap<String, GeneratorFactory>,
}

impl GeneratorRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Document) -> Result<Arc<dyn Generator>, CompileError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(
        &self,
        name: &str,
        params: &Document,
    ) -> Result<Arc<dyn Generator>, CompileError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CompileError::UnknownCustomGenerator(name.to_string()))?;
        factory(params)
    }
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Bson};

    struct Fixed;
    impl Generator for Fixed {
        fn generate(&self, _ctx: &mut crate::GenContext) -> Bson {
            Bson::String("fixed".to_string())
        }
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let registry = GeneratorRegistry::default();
        let err = registry.build("nope", &doc! {}).err().unwrap();
        assert!(matches!(err, CompileError::UnknownCustomGenerator(_)));
    }

    #[test]
    fn test_registered_factory_is_used() {
        let mut registry = GeneratorRegistry::default();
        registry.register("fixed", |_params| Ok(Arc::new(Fixed) as Arc<dyn Generator>));
        assert!(registry.contains("fixed"));
        assert!(registry.build("fixed", &doc! {}).is_ok());
    }
}
