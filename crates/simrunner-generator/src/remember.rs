//! Remembered fields: values observed in generated documents, retained for
//! later random reference by other documents.

use crate::path::{descend, segments, unwind};
use crate::spec::SpecError;
use bson::{Bson, Document};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Default number of distinct values preloaded per field at startup.
pub const DEFAULT_PRELOAD: usize = 1_000_000;

/// Configuration of one remembered field.
///
/// Either a single dotted `field` path or a `compound` list of paths; compound
/// trumps field. The name defaults to the path with dots replaced by
/// underscores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberField {
    pub field: String,
    pub compound: Vec<String>,
    pub name: String,
    pub preload: bool,
    /// Preload limit (number of distinct values sampled from the store).
    pub number: usize,
    /// Runtime retention cap; appends beyond it are dropped.
    pub cap: usize,
}

impl RememberField {
    pub fn simple(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: sanitize(&field),
            field,
            compound: Vec::new(),
            preload: true,
            number: DEFAULT_PRELOAD,
            cap: DEFAULT_PRELOAD,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.compound.is_empty()
    }

    /// Parse a remember entry: either a bare path string or a document with
    /// `field`/`compound`, `name`, `preload`, `number`, `cap`.
    pub fn parse(spec: &Bson) -> Result<Self, SpecError> {
        match spec {
            Bson::String(field) => Ok(Self::simple(field.clone())),
            Bson::Document(doc) => Self::parse_document(doc),
            other => Err(SpecError::InvalidRemember(format!(
                "expected string or document, got {other:?}"
            ))),
        }
    }

    fn parse_document(doc: &Document) -> Result<Self, SpecError> {
        let compound: Vec<String> = match doc.get_array("compound") {
            Ok(paths) => paths
                .iter()
                .map(|p| match p {
                    Bson::String(s) => Ok(s.clone()),
                    other => Err(SpecError::InvalidRemember(format!(
                        "compound path must be a string, got {other:?}"
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Err(_) => Vec::new(),
        };

        // compound specs ignore the single-path field
        let field = doc.get_str("field").unwrap_or_default().to_string();
        if compound.is_empty() && field.is_empty() {
            return Err(SpecError::InvalidRemember(
                "needs either 'field' or 'compound'".to_string(),
            ));
        }

        let name = match doc.get_str("name") {
            Ok(name) => name.to_string(),
            Err(_) if compound.is_empty() => sanitize(&field),
            Err(_) => {
                return Err(SpecError::InvalidRemember(
                    "compound remember fields need an explicit 'name'".to_string(),
                ))
            }
        };

        let number = read_usize(doc, "number").unwrap_or(DEFAULT_PRELOAD);
        let cap = read_usize(doc, "cap").unwrap_or(number);

        Ok(Self {
            field,
            compound,
            name,
            preload: doc.get_bool("preload").unwrap_or(true),
            number,
            cap,
        })
    }
}

fn read_usize(doc: &Document, key: &str) -> Option<usize> {
    match doc.get(key)? {
        Bson::Int32(n) if *n >= 0 => Some(*n as usize),
        Bson::Int64(n) if *n >= 0 => Some(*n as usize),
        _ => None,
    }
}

fn sanitize(path: &str) -> String {
    path.replace('.', "_")
}

/// Extract the values a remembered field retains from one generated document.
///
/// Simple paths descend and flatten one level per array crossed, dropping
/// nulls. Compound specs extract each path independently and produce the
/// cartesian product of the per-path value lists as small documents keyed by
/// sanitized path; a document missing any path yields no records at all.
pub fn extract(doc: &Document, field: &RememberField) -> Vec<Bson> {
    let input = Bson::Document(doc.clone());
    if field.is_simple() {
        return flatten_path(&input, &field.field);
    }

    let per_path: Vec<(String, Vec<Bson>)> = field
        .compound
        .iter()
        .map(|path| (sanitize(path), flatten_path(&input, path)))
        .collect();

    if per_path.iter().any(|(_, values)| values.is_empty()) {
        return Vec::new();
    }

    cartesian(&per_path)
        .into_iter()
        .map(Bson::Document)
        .collect()
}

fn flatten_path(input: &Bson, path: &str) -> Vec<Bson> {
    unwind(descend(input, &segments(path)))
        .into_iter()
        .filter(|v| !matches!(v, Bson::Null))
        .collect()
}

/// Cartesian product of `{a: [1, 2], b: [3, 4]}`-shaped per-path value lists
/// into `[{a: 1, b: 3}, {a: 1, b: 4}, {a: 2, b: 3}, {a: 2, b: 4}]`.
fn cartesian(fields: &[(String, Vec<Bson>)]) -> Vec<Document> {
    let mut records = vec![Document::new()];
    for (key, values) in fields {
        let mut next = Vec::with_capacity(records.len() * values.len());
        for record in &records {
            for value in values {
                let mut expanded = record.clone();
                expanded.insert(key.clone(), value.clone());
                next.push(expanded);
            }
        }
        records = next;
    }
    records
}

struct FieldValues {
    values: RwLock<Vec<Bson>>,
    cap: usize,
}

/// Concurrently appendable, concurrently samplable collections of remembered
/// values, one per configured field.
///
/// The set of fields is fixed at construction, so lookups never contend;
/// each field's list takes a read lock to sample and a write lock to append.
#[derive(Default)]
pub struct RemembranceStore {
    fields: BTreeMap<String, FieldValues>,
    specs: Vec<RememberField>,
}

impl std::fmt::Debug for RemembranceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemembranceStore")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RemembranceStore {
    pub fn new(specs: Vec<RememberField>) -> Self {
        let fields = specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    FieldValues {
                        values: RwLock::new(Vec::new()),
                        cap: spec.cap,
                    },
                )
            })
            .collect();
        Self { fields, specs }
    }

    pub fn specs(&self) -> &[RememberField] {
        &self.specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self, name: &str) -> usize {
        self.fields
            .get(name)
            .map(|f| f.values.read().expect("remembrance lock poisoned").len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Uniformly random element of the named collection, or `None` when the
    /// collection is empty or unknown.
    pub fn sample<R: Rng>(&self, name: &str, rng: &mut R) -> Option<Bson> {
        let field = self.fields.get(name)?;
        let values = field.values.read().expect("remembrance lock poisoned");
        if values.is_empty() {
            return None;
        }
        Some(values[rng.random_range(0..values.len())].clone())
    }

    /// Append observed values to the named collection, up to its cap.
    pub fn append(&self, name: &str, incoming: Vec<Bson>) {
        let Some(field) = self.fields.get(name) else {
            return;
        };
        let mut values = field.values.write().expect("remembrance lock poisoned");
        let room = field.cap.saturating_sub(values.len());
        values.extend(incoming.into_iter().take(room));
    }

    /// Run extraction for every configured field over a generated document.
    pub fn extract_from(&self, doc: &Document) {
        for spec in &self.specs {
            let values = extract(doc, spec);
            if !values.is_empty() {
                self.append(&spec.name, values);
            }
        }
    }
}
