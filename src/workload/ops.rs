//! The operations a workload can run. Each execution generates its
//! parameter documents fresh, runs against the collection, reports
//! (records, duration) to the stats engine and returns the observed
//! duration for pacing.

use crate::registry::RunnerRegistry;
use crate::template::{as_document, Template};
use crate::workload::timeseries::TimeSeriesOp;
use crate::workload::Workload;
use anyhow::{bail, Context};
use bson::{Bson, Document};
use rand::Rng;
use simrunner_generator::compiler::Generator;
use simrunner_generator::GenContext;
use simrunner_store::{FindOptions, UpdateSpec, WriteOp};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one custom runner execution.
pub struct OpOutcome {
    pub records: u64,
    pub duration: Duration,
}

/// Compiled update slot: modifier document or aggregation pipeline.
pub enum UpdateTree {
    Document(Arc<dyn Generator>),
    Pipeline(Vec<Arc<dyn Generator>>),
}

impl UpdateTree {
    fn generate(&self, ctx: &mut GenContext) -> UpdateSpec {
        match self {
            UpdateTree::Document(tree) => UpdateSpec::Document(gen_doc(tree, ctx)),
            UpdateTree::Pipeline(trees) => {
                UpdateSpec::Pipeline(trees.iter().map(|t| gen_doc(t, ctx)).collect())
            }
        }
    }
}

pub enum Operation {
    Insert {
        ordered: bool,
    },
    Find {
        filter: Arc<dyn Generator>,
        sort: Option<Document>,
        projection: Option<Document>,
        limit: Option<i64>,
        random_skip: bool,
    },
    Update {
        many: bool,
        filter: Arc<dyn Generator>,
        update: UpdateTree,
        upsert: bool,
        ordered: bool,
    },
    Delete {
        many: bool,
        filter: Arc<dyn Generator>,
    },
    /// Replacement document generated from the `update` param, `_id` stripped.
    ReplaceOne {
        filter: Arc<dyn Generator>,
        replacement: Arc<dyn Generator>,
        upsert: bool,
        ordered: bool,
    },
    /// Replacement is a fresh template document, `_id` stripped.
    ReplaceWithNew {
        filter: Arc<dyn Generator>,
        upsert: bool,
        ordered: bool,
    },
    Aggregate {
        pipeline: Vec<Arc<dyn Generator>>,
    },
    TimeSeries(TimeSeriesOp),
    Custom(Arc<dyn crate::registry::CustomRunner>),
}

impl Operation {
    pub fn build(
        op: &str,
        params: &Document,
        template: &Template,
        runners: &RunnerRegistry,
    ) -> anyhow::Result<Self> {
        match op {
            "insert" => Ok(Operation::Insert {
                ordered: params.get_bool("ordered").unwrap_or(false),
            }),
            "find" => {
                let limit = param_i64(params, "limit");
                Ok(Operation::Find {
                    filter: compile_filter(params, template)?,
                    sort: param_doc(params, "sort"),
                    projection: param_doc(params, "project"),
                    limit: limit.filter(|l| *l >= 0),
                    random_skip: params.get_bool("skip").unwrap_or(false),
                })
            }
            "updateOne" | "updateMany" => Ok(Operation::Update {
                many: op == "updateMany",
                filter: compile_filter(params, template)?,
                update: compile_update(params, template)?,
                upsert: params.get_bool("upsert").unwrap_or(false),
                ordered: params.get_bool("ordered").unwrap_or(false),
            }),
            "deleteOne" | "deleteMany" => Ok(Operation::Delete {
                many: op == "deleteMany",
                filter: compile_filter(params, template)?,
            }),
            "replaceOne" => {
                let replacement = match params.get("update") {
                    Some(Bson::Document(_)) => compile_slot(params, "update", template)?,
                    Some(other) => bail!("replaceOne update must be a document, got {other:?}"),
                    None => bail!("replaceOne needs an 'update' param"),
                };
                Ok(Operation::ReplaceOne {
                    filter: compile_filter(params, template)?,
                    replacement,
                    upsert: params.get_bool("upsert").unwrap_or(false),
                    ordered: params.get_bool("ordered").unwrap_or(false),
                })
            }
            "replaceWithNew" => Ok(Operation::ReplaceWithNew {
                filter: compile_filter(params, template)?,
                upsert: params.get_bool("upsert").unwrap_or(false),
                ordered: params.get_bool("ordered").unwrap_or(false),
            }),
            "aggregate" => {
                let Some(Bson::Array(stages)) = params.get("pipeline") else {
                    bail!("aggregate needs a 'pipeline' list param");
                };
                let pipeline = stages
                    .iter()
                    .map(|stage| template.compile(stage))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(Operation::Aggregate { pipeline })
            }
            "timeseries" => Ok(Operation::TimeSeries(TimeSeriesOp::build(
                params, template, false,
            )?)),
            "bucketTimeseries" => Ok(Operation::TimeSeries(TimeSeriesOp::build(
                params, template, true,
            )?)),
            "custom" => {
                let name = params
                    .get_str("name")
                    .context("custom op needs a 'name' param")?;
                Ok(Operation::Custom(runners.build(name, params)?))
            }
            other => bail!("unknown op '{other}'"),
        }
    }

    pub async fn execute(
        &mut self,
        w: &Workload,
        ctx: &mut GenContext,
    ) -> anyhow::Result<Duration> {
        match self {
            Operation::Insert { ordered } => insert(w, ctx, *ordered).await,
            Operation::Find {
                filter,
                sort,
                projection,
                limit,
                random_skip,
            } => find(w, ctx, filter, sort, projection, *limit, *random_skip).await,
            Operation::Update {
                many,
                filter,
                update,
                upsert,
                ordered,
            } => update_op(w, ctx, *many, filter, update, *upsert, *ordered).await,
            Operation::Delete { many, filter } => delete(w, ctx, *many, filter).await,
            Operation::ReplaceOne {
                filter,
                replacement,
                upsert,
                ordered,
            } => replace_one(w, ctx, filter, replacement, *upsert, *ordered).await,
            Operation::ReplaceWithNew {
                filter,
                upsert,
                ordered,
            } => replace_with_new(w, ctx, filter, *upsert, *ordered).await,
            Operation::Aggregate { pipeline } => aggregate(w, ctx, pipeline).await,
            Operation::TimeSeries(op) => op.execute(w, ctx).await,
            Operation::Custom(runner) => {
                let runner = Arc::clone(runner);
                let outcome = runner.run(w, ctx).await?;
                w.record(outcome.records, outcome.duration);
                Ok(outcome.duration)
            }
        }
    }
}

fn compile_filter(params: &Document, template: &Template) -> anyhow::Result<Arc<dyn Generator>> {
    match params.get("filter") {
        Some(spec @ Bson::Document(_)) => Ok(template.compile(spec)?),
        Some(other) => bail!("filter must be a document, got {other:?}"),
        None => Ok(template.compile(&Bson::Document(Document::new()))?),
    }
}

fn compile_slot(
    params: &Document,
    key: &str,
    template: &Template,
) -> anyhow::Result<Arc<dyn Generator>> {
    let spec = params
        .get(key)
        .with_context(|| format!("missing '{key}' param"))?;
    template.compile(spec)
}

fn compile_update(params: &Document, template: &Template) -> anyhow::Result<UpdateTree> {
    match params.get("update") {
        Some(spec @ Bson::Document(_)) => Ok(UpdateTree::Document(template.compile(spec)?)),
        Some(Bson::Array(stages)) => {
            let trees = stages
                .iter()
                .map(|stage| template.compile(stage))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(UpdateTree::Pipeline(trees))
        }
        Some(other) => bail!("update must be a document or pipeline, got {other:?}"),
        None => bail!("missing 'update' param"),
    }
}

fn param_doc(params: &Document, key: &str) -> Option<Document> {
    params.get_document(key).ok().cloned()
}

fn param_i64(params: &Document, key: &str) -> Option<i64> {
    match params.get(key)? {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

fn gen_doc(tree: &Arc<dyn Generator>, ctx: &mut GenContext) -> Document {
    as_document(tree.generate(ctx))
}

/// Run `f` under a fresh workload variable scope when the workload is
/// configured for per-operation scoping; otherwise the iteration-level
/// scope installed by the worker loop stays in effect.
fn with_op_scope<T>(
    w: &Workload,
    ctx: &mut GenContext,
    f: impl FnOnce(&mut GenContext) -> T,
) -> T {
    if !w.refresh_per_operation() {
        return f(ctx);
    }
    let vars = w.scope_variables(ctx);
    let saved = ctx.install_variables(vars);
    let out = f(ctx);
    ctx.restore_variables(saved);
    out
}

async fn insert(w: &Workload, ctx: &mut GenContext, ordered: bool) -> anyhow::Result<Duration> {
    let collection = w.collection();
    if w.batch() == 0 {
        let doc = with_op_scope(w, ctx, |ctx| w.template().generate(ctx));
        let start = Instant::now();
        collection.insert_one(doc).await?;
        let duration = start.elapsed();
        w.record(1, duration);
        return Ok(duration);
    }

    let docs: Vec<Document> = (0..w.batch())
        .map(|_| with_op_scope(w, ctx, |ctx| w.template().generate(ctx)))
        .collect();
    let start = Instant::now();
    let inserted = collection.insert_many(docs, ordered).await?;
    let duration = start.elapsed();
    w.record(inserted, duration);
    Ok(duration)
}

#[allow(clippy::too_many_arguments)]
async fn find(
    w: &Workload,
    ctx: &mut GenContext,
    filter: &Arc<dyn Generator>,
    sort: &Option<Document>,
    projection: &Option<Document>,
    limit: Option<i64>,
    random_skip: bool,
) -> anyhow::Result<Duration> {
    let filter = with_op_scope(w, ctx, |ctx| gen_doc(filter, ctx));
    let skip = match (limit, random_skip) {
        // random page: skip a few limit-sized pages into the result
        (Some(limit), true) => Some(ctx.rng.random_range(0..10u64) * limit.max(0) as u64),
        _ => None,
    };
    let options = FindOptions {
        sort: sort.clone(),
        projection: projection.clone(),
        limit,
        skip,
    };

    let start = Instant::now();
    let docs = w.collection().find(filter, &options).await?;
    let duration = start.elapsed();
    w.record(docs.len() as u64, duration);
    Ok(duration)
}

async fn update_op(
    w: &Workload,
    ctx: &mut GenContext,
    many: bool,
    filter: &Arc<dyn Generator>,
    update: &UpdateTree,
    upsert: bool,
    ordered: bool,
) -> anyhow::Result<Duration> {
    let collection = w.collection();
    if w.batch() == 0 {
        let (filter, update) =
            with_op_scope(w, ctx, |ctx| (gen_doc(filter, ctx), update.generate(ctx)));
        let start = Instant::now();
        let outcome = if many {
            collection.update_many(filter, update, upsert).await?
        } else {
            collection.update_one(filter, update, upsert).await?
        };
        let duration = start.elapsed();
        w.record(outcome.matched + outcome.upserted, duration);
        return Ok(duration);
    }

    let models: Vec<WriteOp> = (0..w.batch())
        .map(|_| {
            with_op_scope(w, ctx, |ctx| {
                let filter = gen_doc(filter, ctx);
                let update = update.generate(ctx);
                if many {
                    WriteOp::UpdateMany {
                        filter,
                        update,
                        upsert,
                    }
                } else {
                    WriteOp::UpdateOne {
                        filter,
                        update,
                        upsert,
                    }
                }
            })
        })
        .collect();
    let batch = models.len() as u64;
    let start = Instant::now();
    collection.bulk_write(models, ordered).await?;
    let duration = start.elapsed();
    w.record(batch, duration);
    Ok(duration)
}

async fn delete(
    w: &Workload,
    ctx: &mut GenContext,
    many: bool,
    filter: &Arc<dyn Generator>,
) -> anyhow::Result<Duration> {
    let filter = with_op_scope(w, ctx, |ctx| gen_doc(filter, ctx));
    let collection = w.collection();
    let start = Instant::now();
    let deleted = if many {
        collection.delete_many(filter).await?
    } else {
        collection.delete_one(filter).await?
    };
    let duration = start.elapsed();
    w.record(deleted, duration);
    Ok(duration)
}

async fn replace_one(
    w: &Workload,
    ctx: &mut GenContext,
    filter: &Arc<dyn Generator>,
    replacement: &Arc<dyn Generator>,
    upsert: bool,
    ordered: bool,
) -> anyhow::Result<Duration> {
    let collection = w.collection();
    if w.batch() == 0 {
        let (filter, mut doc) =
            with_op_scope(w, ctx, |ctx| (gen_doc(filter, ctx), gen_doc(replacement, ctx)));
        doc.remove("_id");
        let start = Instant::now();
        let outcome = collection.replace_one(filter, doc, upsert).await?;
        let duration = start.elapsed();
        w.record(outcome.matched + outcome.upserted, duration);
        return Ok(duration);
    }

    let models = replace_models(w, ctx, filter, |ctx| gen_doc(replacement, ctx), upsert);
    let batch = models.len() as u64;
    let start = Instant::now();
    collection.bulk_write(models, ordered).await?;
    let duration = start.elapsed();
    w.record(batch, duration);
    Ok(duration)
}

async fn replace_with_new(
    w: &Workload,
    ctx: &mut GenContext,
    filter: &Arc<dyn Generator>,
    upsert: bool,
    ordered: bool,
) -> anyhow::Result<Duration> {
    let collection = w.collection();
    if w.batch() == 0 {
        let (filter, mut doc) = with_op_scope(w, ctx, |ctx| {
            (gen_doc(filter, ctx), w.template().generate(ctx))
        });
        doc.remove("_id");
        let start = Instant::now();
        let outcome = collection.replace_one(filter, doc, upsert).await?;
        let duration = start.elapsed();
        w.record(outcome.records(), duration);
        return Ok(duration);
    }

    let models = replace_models(w, ctx, filter, |ctx| w.template().generate(ctx), upsert);
    let start = Instant::now();
    let touched = collection.bulk_write(models, ordered).await?;
    let duration = start.elapsed();
    w.record(touched, duration);
    Ok(duration)
}

fn replace_models(
    w: &Workload,
    ctx: &mut GenContext,
    filter: &Arc<dyn Generator>,
    mut replacement: impl FnMut(&mut GenContext) -> Document,
    upsert: bool,
) -> Vec<WriteOp> {
    (0..w.batch())
        .map(|_| {
            with_op_scope(w, ctx, |ctx| {
                let filter = gen_doc(filter, ctx);
                let mut doc = replacement(ctx);
                doc.remove("_id");
                WriteOp::ReplaceOne {
                    filter,
                    replacement: doc,
                    upsert,
                }
            })
        })
        .collect()
}

async fn aggregate(
    w: &Workload,
    ctx: &mut GenContext,
    pipeline: &[Arc<dyn Generator>],
) -> anyhow::Result<Duration> {
    let stages = with_op_scope(w, ctx, |ctx| {
        pipeline.iter().map(|t| gen_doc(t, ctx)).collect::<Vec<_>>()
    });
    let start = Instant::now();
    let results = w.collection().aggregate(stages).await?;
    let duration = start.elapsed();
    w.record(results.len() as u64, duration);
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunConfig, WorkloadConfig};
    use crate::template::Template;
    use simrunner_generator::registry::GeneratorRegistry;
    use simrunner_stats::StatsHandle;
    use simrunner_store::memory::MemoryStore;
    use simrunner_store::DocumentStore;
    use std::sync::Arc;

    const BASE: &str = r#"
connectionString: memory://
templates:
  - name: items
    database: test
    collection: items
    template:
      sku: { "%natural": { min: 0, max: 1000000 } }
      qty: { "%integer": { min: 1, max: 10 } }
workloads: []
"#;

    async fn workload_for(op_yaml: &str, store: Arc<MemoryStore>) -> (Arc<Workload>, StatsHandle) {
        let config: RunConfig = serde_yaml::from_str(BASE).unwrap();
        let template = Arc::new(
            Template::build(
                &config.templates[0],
                None,
                store,
                GeneratorRegistry::default(),
            )
            .unwrap(),
        );
        template.initialize().await.unwrap();

        let workload: WorkloadConfig = serde_yaml::from_str(op_yaml).unwrap();
        let stats = simrunner_stats::start(vec![50.0]);
        let workload = Workload::build(
            &workload,
            template,
            stats.clone(),
            crate::registry::RunnerRegistry::default(),
        )
        .unwrap();
        (Arc::new(workload), stats)
    }

    async fn run_once(workload: &Arc<Workload>) {
        let mut op = workload.build_operation().unwrap();
        let mut ctx = GenContext::new(workload.template().state(), workload.name().to_string(), 0);
        op.execute(workload, &mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_batch_writes_batch_documents() {
        let store = Arc::new(MemoryStore::new());
        let (workload, _stats) = workload_for(
            "{ name: w, template: items, op: insert, batch: 7 }",
            Arc::clone(&store),
        )
        .await;
        run_once(&workload).await;

        let docs = store
            .collection("test", "items")
            .find(bson::doc! {}, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(docs.len(), 7);
    }

    #[tokio::test]
    async fn test_update_one_upserts() {
        let store = Arc::new(MemoryStore::new());
        let (workload, _stats) = workload_for(
            r#"
name: w
template: items
op: updateOne
params:
  filter: { sku: 42 }
  update: { "$set": { seen: true } }
  upsert: true
"#,
            Arc::clone(&store),
        )
        .await;
        run_once(&workload).await;

        let docs = store
            .collection("test", "items")
            .find(bson::doc! { "sku": 42 }, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_bool("seen").unwrap(), true);
    }

    #[tokio::test]
    async fn test_replace_with_new_strips_generated_id() {
        let store = Arc::new(MemoryStore::new());
        let coll = store.collection("test", "items");
        coll.insert_one(bson::doc! { "_id": 1, "sku": 5 }).await.unwrap();

        let (workload, _stats) = workload_for(
            r#"
name: w
template: items
op: replaceWithNew
params:
  filter: {}
"#,
            Arc::clone(&store),
        )
        .await;
        run_once(&workload).await;

        let docs = coll.find(bson::doc! {}, &FindOptions::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        // the original _id survives the replacement
        assert_eq!(docs[0].get_i32("_id").unwrap(), 1);
        assert!(docs[0].contains_key("qty"));
    }

    #[tokio::test]
    async fn test_find_counts_matching_documents() {
        let store = Arc::new(MemoryStore::new());
        let coll = store.collection("test", "items");
        for i in 0..4 {
            coll.insert_one(bson::doc! { "sku": i }).await.unwrap();
        }

        let (workload, stats) = workload_for(
            "{ name: w, template: items, op: find, params: { filter: {} } }",
            Arc::clone(&store),
        )
        .await;
        run_once(&workload).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let reports = stats.tick().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].records, 4);
    }

    #[tokio::test]
    async fn test_missing_update_param_fails_at_build() {
        let store = Arc::new(MemoryStore::new());
        let config: RunConfig = serde_yaml::from_str(BASE).unwrap();
        let template = Arc::new(
            Template::build(
                &config.templates[0],
                None,
                store,
                GeneratorRegistry::default(),
            )
            .unwrap(),
        );
        let workload: WorkloadConfig =
            serde_yaml::from_str("{ name: w, template: items, op: updateOne }").unwrap();
        let err = Workload::build(
            &workload,
            template,
            simrunner_stats::start(vec![50.0]),
            crate::registry::RunnerRegistry::default(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("w"));
    }
}
