//! Tick-based time-series ingestion.
//!
//! Every iteration is one tick: advance (or evaluate) the timestamp base,
//! pick a set of series from a dictionary, generate one measurement per
//! series and write them through a small pool of concurrent jobs, waiting
//! for all of them before the tick ends. The bucketed variant upserts each
//! measurement into a pre-aggregated bucket document instead of inserting.

use crate::template::Template;
use crate::workload::Workload;
use anyhow::{bail, Context};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::Rng;
use simrunner_generator::compiler::Generator;
use simrunner_generator::GenContext;
use simrunner_store::{DocumentCollection, UpdateSpec, WriteOp};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum Selection {
    All,
    /// Evaluated per tick; must come out as an integer.
    Random(Arc<dyn Generator>),
}

#[derive(Clone)]
struct BucketSpec {
    size: i64,
    count_field: String,
}

pub struct TimeSeriesOp {
    time_field: String,
    meta_field: String,
    /// Internal clock, advanced by `step` every tick. `None` when the
    /// timestamp comes from the `value` expression instead.
    current: Option<DateTime<Utc>>,
    step_ms: i64,
    value: Option<Arc<dyn Generator>>,
    stop: Option<DateTime<Utc>>,
    jitter_ms: i64,
    dictionary: String,
    selection: Selection,
    workers: usize,
    bucket: Option<BucketSpec>,
}

impl TimeSeriesOp {
    pub fn build(params: &Document, template: &Template, bucketed: bool) -> anyhow::Result<Self> {
        let time = params
            .get_document("time")
            .context("timeseries needs a 'time' param")?;
        let meta = params
            .get_document("meta")
            .context("timeseries needs a 'meta' param")?;

        let current = time.get("start").and_then(parse_date);
        let value = match time.get("value") {
            Some(spec) => Some(template.compile(spec)?),
            None => None,
        };
        if current.is_none() && value.is_none() {
            bail!("timeseries needs either time.start or time.value");
        }

        let selection = match meta.get("generate") {
            None => Selection::All,
            Some(Bson::String(s)) if s == "all" => Selection::All,
            Some(Bson::Document(spec)) if spec.contains_key("random") => {
                let count = spec.get("random").unwrap_or(&Bson::Null);
                Selection::Random(template.compile(count)?)
            }
            Some(other) => bail!("unsupported meta.generate option {other:?}"),
        };

        let bucket = bucketed.then(|| BucketSpec {
            size: int_param(params, "bucketSize").unwrap_or(100),
            count_field: params
                .get_str("countField")
                .unwrap_or("count")
                .to_string(),
        });

        Ok(Self {
            time_field: time
                .get_str("timeField")
                .context("timeseries needs time.timeField")?
                .to_string(),
            meta_field: meta
                .get_str("metaField")
                .context("timeseries needs meta.metaField")?
                .to_string(),
            current,
            step_ms: int_param(time, "step").unwrap_or(1000),
            value,
            stop: time.get("stop").and_then(parse_date),
            jitter_ms: int_param(time, "jitter").unwrap_or(0),
            dictionary: meta
                .get_str("dictionary")
                .context("timeseries needs meta.dictionary")?
                .to_string(),
            selection,
            workers: int_param(params, "workers").unwrap_or(1).max(1) as usize,
            bucket,
        })
    }

    pub async fn execute(
        &mut self,
        w: &Workload,
        ctx: &mut GenContext,
    ) -> anyhow::Result<Duration> {
        let base = self.next_base(ctx)?;

        if let Some(stop) = self.stop {
            if base > stop {
                debug!("workload {} has run beyond its stop date", w.name());
                return Ok(Duration::ZERO);
            }
        }

        let series = self.select_series(w, ctx)?;

        let mut docs = Vec::with_capacity(series.len());
        for meta_val in series {
            let mut doc = w.template().generate(ctx);
            doc.insert(self.meta_field.clone(), meta_val);
            doc.insert(
                self.time_field.clone(),
                Bson::DateTime(bson::DateTime::from_chrono(self.jittered(base, &mut ctx.rng))),
            );
            docs.push(doc);
        }

        self.write_tick(w, docs).await
    }

    /// Evaluate or advance the timestamp base for this tick.
    fn next_base(&mut self, ctx: &mut GenContext) -> anyhow::Result<DateTime<Utc>> {
        if let Some(tree) = &self.value {
            let value = tree.generate(ctx);
            match &value {
                Bson::DateTime(dt) => return Ok(dt.to_chrono()),
                Bson::Int64(millis) => return Ok(millis_to_date(*millis)?),
                Bson::Int32(millis) => return Ok(millis_to_date(i64::from(*millis))?),
                other => warn!("time.value resolved to {other:?}, falling back to the clock"),
            }
        }
        let Some(current) = self.current else {
            bail!("no usable timestamp: time.value did not resolve and no time.start is set");
        };
        let advanced = current + chrono::Duration::milliseconds(self.step_ms);
        self.current = Some(advanced);
        Ok(advanced)
    }

    fn select_series(&self, w: &Workload, ctx: &mut GenContext) -> anyhow::Result<Vec<Bson>> {
        let all = w
            .template()
            .state()
            .dictionaries
            .entries(&self.dictionary)
            .with_context(|| format!("series dictionary '{}' not found", self.dictionary))?;

        match &self.selection {
            Selection::All => Ok(all.as_ref().clone()),
            Selection::Random(tree) => {
                let count = match tree.generate(ctx) {
                    Bson::Int32(n) => i64::from(n),
                    Bson::Int64(n) => n,
                    other => bail!("meta.generate.random must evaluate to an integer, got {other:?}"),
                };
                let count = count.clamp(0, all.len() as i64) as usize;
                let picked = rand::seq::index::sample(&mut ctx.rng, all.len(), count);
                Ok(picked.iter().map(|i| all[i].clone()).collect())
            }
        }
    }

    fn jittered(&self, base: DateTime<Utc>, rng: &mut StdRng) -> DateTime<Utc> {
        if self.jitter_ms <= 0 {
            return base;
        }
        let offset = chrono::Duration::milliseconds(rng.random_range(0..self.jitter_ms));
        if rng.random_bool(0.5) {
            base + offset
        } else {
            base - offset
        }
    }

    /// Fan the tick's documents out over the job pool and wait for every
    /// write to land before returning.
    async fn write_tick(&self, w: &Workload, docs: Vec<Document>) -> anyhow::Result<Duration> {
        let single = w.batch() == 0;
        let chunks: Vec<Vec<Document>> = if single {
            docs.into_iter().map(|d| vec![d]).collect()
        } else {
            docs.chunks(w.batch()).map(<[Document]>::to_vec).collect()
        };

        let collection = w.collection();
        let stats = w.stats.clone();
        let name = w.name().to_string();

        let started = Instant::now();
        let results: Vec<anyhow::Result<()>> = stream::iter(chunks.into_iter().map(|chunk| {
            let collection = Arc::clone(&collection);
            let stats = stats.clone();
            let name = name.clone();
            let bucket = self.bucket.clone();
            let meta_field = self.meta_field.clone();
            let time_field = self.time_field.clone();
            async move {
                let start = Instant::now();
                let records = match &bucket {
                    None => {
                        if single {
                            for doc in chunk {
                                collection.insert_one(doc).await?;
                            }
                            1
                        } else {
                            collection.insert_many(chunk, false).await?
                        }
                    }
                    Some(spec) => {
                        write_buckets(&*collection, chunk, spec, &meta_field, &time_field, single)
                            .await?
                    }
                };
                stats.record(&name, start.elapsed(), records, records);
                Ok(())
            }
        }))
        .buffer_unordered(self.workers)
        .collect()
        .await;

        for result in results {
            result?;
        }
        Ok(started.elapsed())
    }
}

/// Upsert each measurement into its series' current bucket: push the
/// record, maintain min/max timestamps, count it, and roll over to a new
/// bucket once the count condition stops matching.
async fn write_buckets(
    collection: &dyn DocumentCollection,
    chunk: Vec<Document>,
    spec: &BucketSpec,
    meta_field: &str,
    time_field: &str,
    single: bool,
) -> anyhow::Result<u64> {
    let count = chunk.len() as u64;
    let mut models = Vec::with_capacity(chunk.len());
    for mut measurement in chunk {
        let meta = measurement.remove(meta_field).unwrap_or(Bson::Null);
        let ts = measurement.get(time_field).cloned().unwrap_or(Bson::Null);

        let mut filter = Document::new();
        filter.insert(meta_field, meta);
        filter.insert(spec.count_field.clone(), doc! { "$lt": spec.size });

        let mut update = doc! {
            "$push": { "records": measurement },
            "$set": { "maxDate": ts.clone() },
            "$setOnInsert": { "minDate": ts },
        };
        let mut inc = Document::new();
        inc.insert(spec.count_field.clone(), 1_i64);
        update.insert("$inc", inc);

        if single {
            collection
                .update_one(filter, UpdateSpec::Document(update), true)
                .await?;
        } else {
            models.push(WriteOp::UpdateOne {
                filter,
                update: UpdateSpec::Document(update),
                upsert: true,
            });
        }
    }
    if !models.is_empty() {
        collection.bulk_write(models, true).await?;
    }
    Ok(count)
}

fn parse_date(value: &Bson) -> Option<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Some(dt.to_chrono()),
        Bson::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

fn millis_to_date(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow::anyhow!("{millis} is out of range for a timestamp"))
}

fn int_param(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}
