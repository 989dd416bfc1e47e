//! A template binds one compiled document spec to one store collection,
//! together with its remembered fields, dictionaries and creation options.

use crate::config::{CreateOptionsConfig, DictionaryConfig, DictionarySource, TemplateConfig};
use anyhow::{bail, Context};
use bson::{Bson, Document};
use simrunner_generator::compiler::{Compiler, Generator};
use simrunner_generator::dictionary::{load_json_file, load_text_file};
use simrunner_generator::path::unwind;
use simrunner_generator::registry::GeneratorRegistry;
use simrunner_generator::remember::{RememberField, DEFAULT_PRELOAD};
use simrunner_generator::spec::yaml_to_bson;
use simrunner_generator::{GenContext, RemembranceStore, TemplateState};
use simrunner_store::{CreateOptions, DocumentCollection, DocumentStore, FindOptions, TimeseriesSpec};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Template {
    name: String,
    database: String,
    collection_name: String,
    drop: bool,
    /// Instance index of a fanned-out template, `None` for plain ones.
    instance: Option<u32>,

    store: Arc<dyn DocumentStore>,
    collection: Arc<dyn DocumentCollection>,

    compiler: Compiler,
    tree: Arc<dyn Generator>,
    variables: Option<Arc<dyn Generator>>,
    state: Arc<TemplateState>,

    indexes: Vec<Document>,
    dictionaries: Vec<(String, DictionarySpec)>,
    create_options: CreateOptions,
}

enum DictionarySpec {
    Inline(Vec<Bson>),
    TextFile(String),
    JsonFile(String),
    Collection {
        database: String,
        collection: String,
        filter: Arc<dyn Generator>,
        limit: usize,
        attribute: String,
    },
}

impl Template {
    /// Build one template instance from its configuration. `instance` is the
    /// fan-out index when the config declares `instances`.
    pub fn build(
        config: &TemplateConfig,
        instance: Option<u32>,
        store: Arc<dyn DocumentStore>,
        custom: GeneratorRegistry,
    ) -> anyhow::Result<Self> {
        let (name, collection_name) = match instance {
            Some(i) => (
                format!("{}_{i}", config.name),
                format!("{}_{i}", config.collection),
            ),
            None => (config.name.clone(), config.collection.clone()),
        };

        let remember = config
            .remember
            .iter()
            .map(|entry| {
                let entry = yaml_to_bson(entry)?;
                RememberField::parse(&entry)
            })
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("template '{name}': invalid remember entry"))?;
        let state = Arc::new(TemplateState::new(
            RemembranceStore::new(remember),
            Default::default(),
        ));

        let compiler = Compiler::new(custom);
        let spec = yaml_to_bson(&config.template)
            .with_context(|| format!("template '{name}': invalid template spec"))?;
        let tree = compiler
            .compile(&spec)
            .with_context(|| format!("template '{name}': cannot compile template"))?;
        let variables = match &config.variables {
            Some(spec) => {
                let spec = yaml_to_bson(spec)
                    .with_context(|| format!("template '{name}': invalid variables spec"))?;
                Some(
                    compiler
                        .compile(&spec)
                        .with_context(|| format!("template '{name}': cannot compile variables"))?,
                )
            }
            None => None,
        };

        let indexes = config
            .indexes
            .iter()
            .map(|index| match yaml_to_bson(index)? {
                Bson::Document(keys) => Ok(keys),
                other => Err(anyhow::anyhow!("index spec must be a document, got {other:?}")),
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("template '{name}': invalid index"))?;

        let dictionaries = config
            .dictionaries
            .iter()
            .map(|(dict_name, dict)| {
                let spec = parse_dictionary(dict, &config.database, &compiler)
                    .with_context(|| format!("template '{name}': dictionary '{dict_name}'"))?;
                Ok((dict_name.clone(), spec))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let collection = store.collection(&config.database, &collection_name);

        Ok(Self {
            name,
            database: config.database.clone(),
            collection_name,
            drop: config.drop,
            instance,
            store,
            collection,
            compiler,
            tree,
            variables,
            state,
            indexes,
            dictionaries,
            create_options: convert_create_options(config.create_options.as_ref()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> Option<u32> {
        self.instance
    }

    pub fn collection(&self) -> Arc<dyn DocumentCollection> {
        Arc::clone(&self.collection)
    }

    pub fn state(&self) -> Arc<TemplateState> {
        Arc::clone(&self.state)
    }

    /// Compile a workload-supplied spec (filter, update, pipeline slot)
    /// through this template's memoized compiler.
    pub fn compile(&self, spec: &Bson) -> anyhow::Result<Arc<dyn Generator>> {
        Ok(self.compiler.compile(spec)?)
    }

    /// Prepare the backing collection: drop if asked, create with options,
    /// preload remembered fields, create indexes, load dictionaries.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!(
            "initializing collection {}.{} for template {}",
            self.database, self.collection_name, self.name
        );

        let existed = self
            .store
            .collection_exists(&self.database, &self.collection_name)
            .await?;
        if self.drop && existed {
            self.collection.drop_collection().await?;
            info!("dropped collection {}", self.collection.namespace());
        }
        if !existed || self.drop {
            self.store
                .create_collection(&self.database, &self.collection_name, &self.create_options)
                .await?;
        }

        self.preload_remembered_fields().await?;

        for keys in &self.indexes {
            self.collection.create_index(keys.clone()).await?;
        }
        if !self.indexes.is_empty() {
            info!("created {} indexes", self.indexes.len());
        }

        self.load_dictionaries().await?;
        Ok(())
    }

    async fn preload_remembered_fields(&self) -> anyhow::Result<()> {
        for spec in self.state.remembrances.specs().to_vec() {
            if !spec.preload {
                info!("skip preloading remembered field {}", spec.name);
                continue;
            }
            let values = if spec.is_simple() {
                self.collection
                    .distinct_sample(&spec.field, spec.number)
                    .await?
            } else {
                self.preload_compound(&spec).await?
            };
            let loaded = values.len();
            self.state.remembrances.append(&spec.name, values);
            info!("preloaded {loaded} values for remembered field {} (refer as #{})", spec.name, spec.name);
        }
        Ok(())
    }

    /// Distinct projections of the compound paths, via a grouped aggregation
    /// keyed by the sanitized path names.
    async fn preload_compound(&self, spec: &RememberField) -> anyhow::Result<Vec<Bson>> {
        let mut key = Document::new();
        for path in &spec.compound {
            key.insert(path.replace('.', "_"), format!("${path}"));
        }
        let pipeline = vec![
            bson::doc! { "$group": { "_id": key } },
            bson::doc! { "$limit": spec.number as i64 },
        ];
        let groups = self.collection.aggregate(pipeline).await?;
        Ok(groups
            .into_iter()
            .filter_map(|mut group| group.remove("_id"))
            .flat_map(unwind)
            .filter(|v| !matches!(v, Bson::Null))
            .collect())
    }

    async fn load_dictionaries(&self) -> anyhow::Result<()> {
        for (name, spec) in &self.dictionaries {
            let values = match spec {
                DictionarySpec::Inline(values) => values.clone(),
                DictionarySpec::TextFile(path) => read_file(name, path, load_text_file),
                DictionarySpec::JsonFile(path) => read_file(name, path, load_json_file),
                DictionarySpec::Collection {
                    database,
                    collection,
                    filter,
                    limit,
                    attribute,
                } => {
                    self.load_collection_dictionary(database, collection, filter, *limit, attribute)
                        .await
                        .with_context(|| format!("cannot load dictionary '{name}'"))?
                }
            };
            info!("loaded dictionary {name} ({} entries)", values.len());
            self.state.dictionaries.insert(name.clone(), values);
        }
        Ok(())
    }

    async fn load_collection_dictionary(
        &self,
        database: &str,
        collection: &str,
        filter: &Arc<dyn Generator>,
        limit: usize,
        attribute: &str,
    ) -> anyhow::Result<Vec<Bson>> {
        let source = self.store.collection(database, collection);
        let mut ctx = GenContext::new(self.state(), self.name.clone(), 0);
        let filter = as_document(filter.generate(&mut ctx));

        let mut projection = bson::doc! { attribute: 1 };
        if attribute != "_id" {
            projection.insert("_id", 0);
        }
        let options = FindOptions {
            projection: Some(projection),
            limit: Some(limit as i64),
            ..Default::default()
        };
        let docs = source.find(filter, &options).await?;
        Ok(docs
            .into_iter()
            .map(|doc| doc.get(attribute).cloned().unwrap_or(Bson::Null))
            .collect())
    }

    /// Generate one document: install the template's variable scope under
    /// any scope the caller already holds, generate, extract remembered
    /// fields, restore the caller's scope.
    pub fn generate(&self, ctx: &mut GenContext) -> Document {
        let vars = self.generate_variables(ctx);
        let saved = ctx.install_variables(vars);
        let doc = as_document(self.tree.generate(ctx));
        self.state.remembrances.extract_from(&doc);
        ctx.restore_variables(saved);
        doc
    }

    fn generate_variables(&self, ctx: &mut GenContext) -> Document {
        match &self.variables {
            Some(tree) => as_document(tree.generate(ctx)),
            None => Document::new(),
        }
    }
}

/// Non-document generation output in a document slot degrades to empty.
pub fn as_document(value: Bson) -> Document {
    match value {
        Bson::Document(doc) => doc,
        other => {
            warn!("expected a document, got {other:?}");
            Document::new()
        }
    }
}

fn read_file(name: &str, path: &str, load: fn(&Path) -> std::io::Result<Vec<Bson>>) -> Vec<Bson> {
    match load(Path::new(path)) {
        Ok(values) => values,
        Err(e) => {
            warn!("cannot read dictionary '{name}' from {path}: {e}");
            Vec::new()
        }
    }
}

fn parse_dictionary(
    config: &DictionaryConfig,
    default_database: &str,
    compiler: &Compiler,
) -> anyhow::Result<DictionarySpec> {
    match config {
        DictionaryConfig::Inline(values) => {
            let values = values
                .iter()
                .map(yaml_to_bson)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DictionarySpec::Inline(values))
        }
        DictionaryConfig::Source(source) => parse_dictionary_source(source, default_database, compiler),
    }
}

fn parse_dictionary_source(
    source: &DictionarySource,
    default_database: &str,
    compiler: &Compiler,
) -> anyhow::Result<DictionarySpec> {
    match source.kind() {
        "text" => Ok(DictionarySpec::TextFile(require_file(source)?)),
        "json" => Ok(DictionarySpec::JsonFile(require_file(source)?)),
        "collection" => {
            let Some(collection) = source.collection.clone() else {
                bail!("collection dictionaries need a 'collection'");
            };
            let filter = match &source.query {
                Some(query) => yaml_to_bson(query)?,
                None => Bson::Document(Document::new()),
            };
            Ok(DictionarySpec::Collection {
                database: source
                    .db
                    .clone()
                    .unwrap_or_else(|| default_database.to_string()),
                collection,
                filter: compiler.compile(&filter)?,
                limit: source.limit.unwrap_or(DEFAULT_PRELOAD),
                attribute: source
                    .attribute
                    .clone()
                    .unwrap_or_else(|| "_id".to_string()),
            })
        }
        other => bail!("unknown dictionary type '{other}'"),
    }
}

fn require_file(source: &DictionarySource) -> anyhow::Result<String> {
    source
        .file
        .clone()
        .ok_or_else(|| anyhow::anyhow!("file dictionaries need a 'file'"))
}

fn convert_create_options(config: Option<&CreateOptionsConfig>) -> CreateOptions {
    let Some(config) = config else {
        return CreateOptions::default();
    };
    CreateOptions {
        capped_size: if config.capped { config.size } else { None },
        timeseries: config.timeseries.as_ref().map(|ts| TimeseriesSpec {
            time_field: ts.time_field.clone(),
            meta_field: ts.meta_field.clone(),
            granularity: ts.granularity.clone(),
        }),
        expire_after_seconds: config.expire_after_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrunner_store::memory::MemoryStore;

    fn template_config(yaml: &str) -> TemplateConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn build(yaml: &str, store: Arc<MemoryStore>) -> Template {
        Template::build(
            &template_config(yaml),
            None,
            store,
            GeneratorRegistry::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_preload_respects_cap() {
        let store = Arc::new(MemoryStore::new());
        let coll = store.collection("test", "items");
        for v in ["a", "b", "c"] {
            coll.insert_one(bson::doc! { "sku": v }).await.unwrap();
        }

        let template = build(
            r##"
name: items
database: test
collection: items
template:
  sku: "#sku"
remember:
  - { field: sku, number: 2 }
"##,
            store,
        );
        template.initialize().await.unwrap();
        assert_eq!(template.state().remembrances.len("sku"), 2);
    }

    #[tokio::test]
    async fn test_generate_extracts_remembered_fields() {
        let store = Arc::new(MemoryStore::new());
        let template = build(
            r#"
name: items
database: test
collection: items
template:
  sku: { "%natural": { min: 0, max: 10 } }
remember:
  - sku
"#,
            store,
        );
        template.initialize().await.unwrap();

        let mut ctx = GenContext::new(template.state(), "t", 0);
        let doc = template.generate(&mut ctx);
        assert!(doc.contains_key("sku"));
        assert_eq!(template.state().remembrances.len("sku"), 1);
    }

    #[tokio::test]
    async fn test_template_variables_are_scoped_per_document() {
        let store = Arc::new(MemoryStore::new());
        let template = build(
            r##"
name: orders
database: test
collection: orders
template:
  a: "#v"
  b: "#v"
variables:
  v: { "%natural": { min: 0, max: 1000000 } }
"##,
            store,
        );

        let mut ctx = GenContext::new(template.state(), "t", 0);
        let doc = template.generate(&mut ctx);
        // one scope per document: both slots see the same draw
        assert_eq!(doc.get("a"), doc.get("b"));
        // and the scope does not leak out of generate()
        assert!(ctx.variables().is_none());
    }

    #[tokio::test]
    async fn test_inline_dictionary_is_loaded() {
        let store = Arc::new(MemoryStore::new());
        let template = build(
            r#"
name: items
database: test
collection: items
template:
  color: { "%dictionary": { name: colors } }
dictionaries:
  colors: [red, green, blue]
"#,
            store,
        );
        template.initialize().await.unwrap();
        assert!(template.state().dictionaries.contains("colors"));
    }

    #[tokio::test]
    async fn test_collection_dictionary_projects_attribute() {
        let store = Arc::new(MemoryStore::new());
        let coll = store.collection("test", "series");
        coll.insert_one(bson::doc! { "label": "s1" }).await.unwrap();
        coll.insert_one(bson::doc! { "label": "s2" }).await.unwrap();

        let template = build(
            r#"
name: items
database: test
collection: items
template:
  series: { "%dictionary": { name: series } }
dictionaries:
  series:
    type: collection
    collection: series
    attribute: label
"#,
            store,
        );
        template.initialize().await.unwrap();
        let entries = template.state().dictionaries.entries("series").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&Bson::String("s1".to_string())));
    }

    #[test]
    fn test_instance_suffixes_name_and_collection() {
        let config = template_config(
            r#"
name: items
database: test
collection: items
instances: 3
template:
  x: 1
"#,
        );
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let template = Template::build(
            &config,
            Some(2),
            Arc::clone(&store),
            GeneratorRegistry::default(),
        )
        .unwrap();
        assert_eq!(template.name(), "items_2");
        assert_eq!(template.collection().namespace(), "test.items_2");
    }
}
