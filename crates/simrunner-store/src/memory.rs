//! In-process store used by tests and `memory://` dry runs.
//!
//! Filters support equality on (dotted) paths plus the comparison operators
//! the runners actually emit (`$lt`, `$lte`, `$gt`, `$gte`, `$ne`, `$in`).
//! Updates support the modifier operators (`$set`, `$inc`, `$push`, `$min`,
//! `$max`, `$unset`, `$setOnInsert`); pipeline updates are not supported.

use crate::error::StoreError;
use crate::{
    CreateOptions, DocumentCollection, DocumentStore, FindOptions, UpdateSpec, WriteOp,
    WriteOutcome,
};
use async_trait::async_trait;
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CollectionData {
    docs: Mutex<Vec<Document>>,
    created: AtomicBool,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<(String, String), Arc<CollectionData>>>,
    /// Remaining operations that fail with [`StoreError::Injected`].
    failures: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` collection operations fail, for error-path tests.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, AtomicOrdering::SeqCst);
    }

    fn data(&self, database: &str, name: &str) -> Arc<CollectionData> {
        let mut collections = self.collections.lock().expect("memory store lock poisoned");
        Arc::clone(
            collections
                .entry((database.to_string(), name.to_string()))
                .or_default(),
        )
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn collection(&self, database: &str, name: &str) -> Arc<dyn DocumentCollection> {
        Arc::new(MemoryCollection {
            data: self.data(database, name),
            namespace: format!("{database}.{name}"),
            failures: Arc::clone(&self.failures),
        })
    }

    async fn collection_exists(&self, database: &str, name: &str) -> Result<bool, StoreError> {
        let data = self.data(database, name);
        Ok(data.created.load(AtomicOrdering::SeqCst)
            || !data.docs.lock().expect("memory store lock poisoned").is_empty())
    }

    async fn create_collection(
        &self,
        database: &str,
        name: &str,
        _options: &CreateOptions,
    ) -> Result<(), StoreError> {
        self.data(database, name)
            .created
            .store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

pub struct MemoryCollection {
    data: Arc<CollectionData>,
    namespace: String,
    failures: Arc<AtomicUsize>,
}

impl MemoryCollection {
    fn check_failure(&self) -> Result<(), StoreError> {
        let remaining = self.failures.load(AtomicOrdering::SeqCst);
        if remaining > 0
            && self
                .failures
                .compare_exchange(
                    remaining,
                    remaining - 1,
                    AtomicOrdering::SeqCst,
                    AtomicOrdering::SeqCst,
                )
                .is_ok()
        {
            return Err(StoreError::Injected);
        }
        Ok(())
    }

    fn with_docs<T>(&self, f: impl FnOnce(&mut Vec<Document>) -> T) -> T {
        let mut docs = self.data.docs.lock().expect("memory store lock poisoned");
        f(&mut docs)
    }

    fn apply_update_spec(
        target: &mut Document,
        update: &UpdateSpec,
        inserting: bool,
    ) -> Result<bool, StoreError> {
        match update {
            UpdateSpec::Document(modifiers) => apply_modifiers(target, modifiers, inserting),
            UpdateSpec::Pipeline(_) => Err(StoreError::Unsupported(
                "pipeline updates are not supported by the memory store".to_string(),
            )),
        }
    }

    fn upsert_base(filter: &Document) -> Document {
        // equality fields of the filter seed the new document
        let mut base = Document::new();
        for (key, value) in filter {
            if !matches!(value, Bson::Document(d) if d.keys().any(|k| k.starts_with('$'))) {
                set_path(&mut base, key, value.clone());
            }
        }
        if !base.contains_key("_id") {
            base.insert("_id", bson::oid::ObjectId::new());
        }
        base
    }

    fn update_matching(
        &self,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
        many: bool,
    ) -> Result<WriteOutcome, StoreError> {
        self.with_docs(|docs| {
            let mut result = WriteOutcome::default();
            for doc in docs.iter_mut() {
                if !matches(doc, &filter) {
                    continue;
                }
                result.matched += 1;
                if Self::apply_update_spec(doc, &update, false)? {
                    result.modified += 1;
                }
                if !many {
                    break;
                }
            }
            if result.matched == 0 && upsert {
                let mut fresh = Self::upsert_base(&filter);
                Self::apply_update_spec(&mut fresh, &update, true)?;
                docs.push(fresh);
                result.upserted = 1;
            }
            Ok(result)
        })
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn insert_one(&self, mut doc: Document) -> Result<(), StoreError> {
        self.check_failure()?;
        if !doc.contains_key("_id") {
            doc.insert("_id", bson::oid::ObjectId::new());
        }
        self.data.created.store(true, AtomicOrdering::SeqCst);
        self.with_docs(|docs| docs.push(doc));
        Ok(())
    }

    async fn insert_many(&self, docs: Vec<Document>, _ordered: bool) -> Result<u64, StoreError> {
        self.check_failure()?;
        let count = docs.len() as u64;
        self.data.created.store(true, AtomicOrdering::SeqCst);
        self.with_docs(|existing| {
            for mut doc in docs {
                if !doc.contains_key("_id") {
                    doc.insert("_id", bson::oid::ObjectId::new());
                }
                existing.push(doc);
            }
        });
        Ok(count)
    }

    async fn find(
        &self,
        filter: Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.check_failure()?;
        let mut found: Vec<Document> = self.with_docs(|docs| {
            docs.iter().filter(|d| matches(d, &filter)).cloned().collect()
        });

        if let Some(sort) = &options.sort {
            found.sort_by(|a, b| compare_by(a, b, sort));
        }
        let skip = options.skip.unwrap_or(0) as usize;
        if skip > 0 {
            found = found.into_iter().skip(skip).collect();
        }
        if let Some(limit) = options.limit {
            found.truncate(limit.max(0) as usize);
        }
        if let Some(projection) = &options.projection {
            for doc in &mut found {
                project(doc, projection);
            }
        }
        Ok(found)
    }

    async fn update_one(
        &self,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError> {
        self.check_failure()?;
        self.update_matching(filter, update, upsert, false)
    }

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError> {
        self.check_failure()?;
        self.update_matching(filter, update, upsert, true)
    }

    async fn replace_one(
        &self,
        filter: Document,
        mut replacement: Document,
        upsert: bool,
    ) -> Result<WriteOutcome, StoreError> {
        self.check_failure()?;
        self.with_docs(|docs| {
            if let Some(existing) = docs.iter_mut().find(|d| matches(d, &filter)) {
                if let Some(id) = existing.get("_id").cloned() {
                    replacement.insert("_id", id);
                }
                *existing = replacement;
                return Ok(WriteOutcome {
                    matched: 1,
                    modified: 1,
                    upserted: 0,
                });
            }
            if upsert {
                if !replacement.contains_key("_id") {
                    replacement.insert("_id", bson::oid::ObjectId::new());
                }
                docs.push(replacement);
                return Ok(WriteOutcome {
                    matched: 0,
                    modified: 0,
                    upserted: 1,
                });
            }
            Ok(WriteOutcome::default())
        })
    }

    async fn delete_one(&self, filter: Document) -> Result<u64, StoreError> {
        self.check_failure()?;
        self.with_docs(|docs| {
            match docs.iter().position(|d| matches(d, &filter)) {
                Some(index) => {
                    docs.remove(index);
                    Ok(1)
                }
                None => Ok(0),
            }
        })
    }

    async fn delete_many(&self, filter: Document) -> Result<u64, StoreError> {
        self.check_failure()?;
        self.with_docs(|docs| {
            let before = docs.len();
            docs.retain(|d| !matches(d, &filter));
            Ok((before - docs.len()) as u64)
        })
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, StoreError> {
        self.check_failure()?;
        let mut current: Vec<Document> = self.with_docs(|docs| docs.clone());
        for stage in &pipeline {
            let Some((name, spec)) = stage.iter().next() else {
                continue;
            };
            match (name.as_str(), spec) {
                ("$match", Bson::Document(filter)) => {
                    current.retain(|d| matches(d, filter));
                }
                ("$limit", value) => {
                    let limit = value.as_i64().or(value.as_i32().map(i64::from)).unwrap_or(0);
                    current.truncate(limit.max(0) as usize);
                }
                ("$sort", Bson::Document(sort)) => {
                    current.sort_by(|a, b| compare_by(a, b, sort));
                }
                ("$group", Bson::Document(group)) => {
                    current = group_distinct(&current, group)?;
                }
                (other, _) => {
                    return Err(StoreError::Unsupported(format!(
                        "aggregation stage {other} is not supported by the memory store"
                    )))
                }
            }
        }
        Ok(current)
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>, _ordered: bool) -> Result<u64, StoreError> {
        self.check_failure()?;
        let mut touched = 0;
        for op in ops {
            touched += match op {
                WriteOp::InsertOne(doc) => {
                    self.with_docs(|docs| {
                        let mut doc = doc;
                        if !doc.contains_key("_id") {
                            doc.insert("_id", bson::oid::ObjectId::new());
                        }
                        docs.push(doc);
                    });
                    1
                }
                WriteOp::UpdateOne {
                    filter,
                    update,
                    upsert,
                } => self
                    .update_matching(filter, update, upsert, false)?
                    .records(),
                WriteOp::UpdateMany {
                    filter,
                    update,
                    upsert,
                } => self.update_matching(filter, update, upsert, true)?.records(),
                WriteOp::ReplaceOne {
                    filter,
                    replacement,
                    upsert,
                } => self.replace_one(filter, replacement, upsert).await?.records(),
            };
        }
        Ok(touched)
    }

    async fn distinct_sample(&self, path: &str, limit: usize) -> Result<Vec<Bson>, StoreError> {
        self.check_failure()?;
        let mut seen = Vec::new();
        self.with_docs(|docs| {
            'outer: for doc in docs.iter() {
                let Some(value) = get_path(doc, path) else {
                    continue;
                };
                let values = match value {
                    Bson::Array(items) => items,
                    other => vec![other],
                };
                for v in values {
                    if matches!(v, Bson::Null) || seen.contains(&v) {
                        continue;
                    }
                    seen.push(v);
                    if seen.len() >= limit {
                        break 'outer;
                    }
                }
            }
        });
        Ok(seen)
    }

    async fn create_index(&self, _keys: Document) -> Result<(), StoreError> {
        Ok(())
    }

    async fn drop_collection(&self) -> Result<(), StoreError> {
        self.data.created.store(false, AtomicOrdering::SeqCst);
        self.with_docs(|docs| docs.clear());
        Ok(())
    }
}

/// Value at a dotted path, descending through sub-documents only.
fn get_path(doc: &Document, path: &str) -> Option<Bson> {
    let mut current = Bson::Document(doc.clone());
    for segment in path.split('.') {
        match current {
            Bson::Document(d) => current = d.get(segment)?.clone(),
            _ => return None,
        }
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment, value);
            return;
        }
        if !matches!(current.get(segment), Some(Bson::Document(_))) {
            current.insert(segment, Document::new());
        }
        let Some(Bson::Document(next)) = current.get_mut(segment) else {
            return;
        };
        current = next;
    }
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| {
        let actual = get_path(doc, key);
        match condition {
            Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, operand)| {
                    matches_operator(actual.as_ref(), op, operand)
                })
            }
            expected => actual.as_ref().is_some_and(|a| bson_eq(a, expected)),
        }
    })
}

/// Equality with MongoDB's numeric coercion: `Int32(5)`, `Int64(5)` and
/// `Double(5.0)` are the same value.
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match compare(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

fn matches_operator(actual: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    match op {
        "$ne" => !actual.is_some_and(|a| bson_eq(a, operand)),
        "$in" => match operand {
            Bson::Array(candidates) => {
                actual.is_some_and(|a| candidates.iter().any(|c| bson_eq(c, a)))
            }
            _ => false,
        },
        "$exists" => {
            let wanted = matches!(operand, Bson::Boolean(true)) || operand.as_i64() == Some(1);
            actual.is_some() == wanted
        }
        "$lt" | "$lte" | "$gt" | "$gte" => {
            let Some(actual) = actual else {
                return false;
            };
            let Some(ordering) = compare(actual, operand) else {
                return false;
            };
            match op {
                "$lt" => ordering == Ordering::Less,
                "$lte" => ordering != Ordering::Greater,
                "$gt" => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }
        }
        _ => false,
    }
}

/// BSON ordering over the types the simulator compares.
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        _ => None,
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

fn compare_by(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (key, direction) in sort {
        let av = get_path(a, key);
        let bv = get_path(b, key);
        let ordering = match (av, bv) {
            (Some(x), Some(y)) => compare(&x, &y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        let descending = matches!(direction, Bson::Int32(n) if *n < 0)
            || matches!(direction, Bson::Int64(n) if *n < 0)
            || matches!(direction, Bson::Double(d) if *d < 0.0);
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn truthy(value: &Bson) -> bool {
    !matches!(
        value,
        Bson::Int32(0) | Bson::Int64(0) | Bson::Double(0.0) | Bson::Boolean(false)
    )
}

fn project(doc: &mut Document, projection: &Document) {
    let inclusion = projection
        .iter()
        .any(|(key, value)| key != "_id" && truthy(value));
    if inclusion {
        let keep: Vec<&String> = projection
            .iter()
            .filter(|(_, value)| truthy(value))
            .map(|(key, _)| key)
            .collect();
        let id_excluded =
            matches!(projection.get("_id"), Some(value) if !truthy(value));
        let keys: Vec<String> = doc.keys().cloned().collect();
        for key in keys {
            let is_id = key == "_id";
            if keep.iter().any(|k| **k == key) || (is_id && !id_excluded) {
                continue;
            }
            doc.remove(&key);
        }
    } else {
        for (key, _) in projection {
            doc.remove(key);
        }
    }
}

fn apply_modifiers(
    target: &mut Document,
    modifiers: &Document,
    inserting: bool,
) -> Result<bool, StoreError> {
    if modifiers.keys().any(|k| !k.starts_with('$')) {
        return Err(StoreError::Malformed(
            "update document must only contain modifier operators".to_string(),
        ));
    }
    let mut changed = false;
    for (op, spec) in modifiers {
        let Bson::Document(fields) = spec else {
            return Err(StoreError::Malformed(format!(
                "modifier {op} expects a document"
            )));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(target, path, value.clone());
                    changed = true;
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(target, path, value.clone());
                        changed = true;
                    }
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    if target.remove(path).is_some() {
                        changed = true;
                    }
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = get_path(target, path).as_ref().and_then(numeric).unwrap_or(0.0);
                    let delta = numeric(delta).unwrap_or(0.0);
                    let next = current + delta;
                    // stay integral when both sides are
                    let value = if next.fract() == 0.0 && delta.fract() == 0.0 {
                        Bson::Int64(next as i64)
                    } else {
                        Bson::Double(next)
                    };
                    set_path(target, path, value);
                    changed = true;
                }
            }
            "$push" => {
                for (path, value) in fields {
                    let mut items = match get_path(target, path) {
                        Some(Bson::Array(items)) => items,
                        _ => Vec::new(),
                    };
                    items.push(value.clone());
                    set_path(target, path, Bson::Array(items));
                    changed = true;
                }
            }
            "$min" => {
                for (path, value) in fields {
                    let replace = match get_path(target, path) {
                        Some(current) => {
                            compare(value, &current) == Some(Ordering::Less)
                        }
                        None => true,
                    };
                    if replace {
                        set_path(target, path, value.clone());
                        changed = true;
                    }
                }
            }
            "$max" => {
                for (path, value) in fields {
                    let replace = match get_path(target, path) {
                        Some(current) => {
                            compare(value, &current) == Some(Ordering::Greater)
                        }
                        None => true,
                    };
                    if replace {
                        set_path(target, path, value.clone());
                        changed = true;
                    }
                }
            }
            other => {
                return Err(StoreError::Unsupported(format!(
                    "update operator {other} is not supported by the memory store"
                )))
            }
        }
    }
    Ok(changed)
}

fn group_distinct(docs: &[Document], group: &Document) -> Result<Vec<Document>, StoreError> {
    let Some(id_spec) = group.get("_id") else {
        return Err(StoreError::Malformed("$group needs an _id".to_string()));
    };
    if group.len() > 1 {
        return Err(StoreError::Unsupported(
            "$group accumulators are not supported by the memory store".to_string(),
        ));
    }
    let mut seen: Vec<Bson> = Vec::new();
    match id_spec {
        Bson::String(path) => {
            let Some(path) = path.strip_prefix('$') else {
                return Err(StoreError::Malformed(
                    "$group _id must start with '$'".to_string(),
                ));
            };
            for doc in docs {
                let value = get_path(doc, path).unwrap_or(Bson::Null);
                let values = match value {
                    Bson::Array(items) => items,
                    other => vec![other],
                };
                for v in values {
                    if !seen.contains(&v) {
                        seen.push(v);
                    }
                }
            }
        }
        // compound key: {out_key: "$path", ...}
        Bson::Document(spec) => {
            for doc in docs {
                let mut key = Document::new();
                for (out, path) in spec {
                    let Bson::String(path) = path else {
                        return Err(StoreError::Unsupported(
                            "$group compound _id entries must be field paths".to_string(),
                        ));
                    };
                    let path = path.strip_prefix('$').ok_or_else(|| {
                        StoreError::Malformed("$group _id paths must start with '$'".to_string())
                    })?;
                    key.insert(out.clone(), get_path(doc, path).unwrap_or(Bson::Null));
                }
                let key = Bson::Document(key);
                if !seen.contains(&key) {
                    seen.push(key);
                }
            }
        }
        _ => {
            return Err(StoreError::Unsupported(
                "$group _id must be a field path or a document of field paths".to_string(),
            ))
        }
    }
    Ok(seen
        .into_iter()
        .map(|v| {
            let mut d = Document::new();
            d.insert("_id", v);
            d
        })
        .collect())
}
