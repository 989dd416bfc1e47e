//! Recursive compilation of template specs into generator trees.

use crate::context::GenContext;
use crate::generators;
use crate::generators::text;
use crate::path::{descend, segments};
use crate::registry::GeneratorRegistry;
use crate::spec::{operator_expression, spec_key, OPERATOR_MARKER, REFERENCE_MARKER};
use bson::{Bson, Document};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Error raised while compiling a spec. Only structural problems that must
/// fail the run at startup surface here; malformed operator parameters
/// degrade to null at generation time instead.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("unknown custom generator: {0}")]
    UnknownCustomGenerator(String),

    #[error("%custom requires a literal 'name' parameter")]
    MissingCustomName,

    #[error("custom generator {name}: {message}")]
    InvalidCustomParams { name: String, message: String },
}

/// A unit of the generator tree: produces one value per invocation.
pub trait Generator: Send + Sync {
    fn generate(&self, ctx: &mut GenContext) -> Bson;

    /// Downcast hook used by operators that index into a compiled list
    /// without generating all of it (e.g. `%oneOf`).
    fn as_list(&self) -> Option<&ListGenerator> {
        None
    }
}

/// Ordered (key, sub-generator) pairs compiled from a literal document.
pub struct DocumentGenerator {
    entries: Vec<(String, Arc<dyn Generator>)>,
}

impl DocumentGenerator {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn generate_document(&self, ctx: &mut GenContext) -> Document {
        let mut doc = Document::new();
        for (key, gen) in &self.entries {
            doc.insert(key.clone(), gen.generate(ctx));
        }
        doc
    }

    /// Generate the value of a single entry; `Null` when the key is absent.
    pub fn sub_generate(&self, key: &str, ctx: &mut GenContext) -> Bson {
        match self.sub(key) {
            Some(gen) => gen.generate(ctx),
            None => Bson::Null,
        }
    }

    pub fn sub(&self, key: &str) -> Option<&Arc<dyn Generator>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, gen)| gen)
    }
}

impl Generator for DocumentGenerator {
    fn generate(&self, ctx: &mut GenContext) -> Bson {
        Bson::Document(self.generate_document(ctx))
    }
}

/// Fixed-shape list: compiled element specs, order and length preserved.
pub struct ListGenerator {
    items: Vec<Arc<dyn Generator>>,
}

impl ListGenerator {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn generate_at(&self, index: usize, ctx: &mut GenContext) -> Bson {
        match self.items.get(index) {
            Some(gen) => gen.generate(ctx),
            None => Bson::Null,
        }
    }
}

impl Generator for ListGenerator {
    fn generate(&self, ctx: &mut GenContext) -> Bson {
        Bson::Array(self.items.iter().map(|gen| gen.generate(ctx)).collect())
    }

    fn as_list(&self) -> Option<&ListGenerator> {
        Some(self)
    }
}

struct Constant(Bson);

impl Generator for Constant {
    fn generate(&self, _ctx: &mut GenContext) -> Bson {
        self.0.clone()
    }
}

/// `#head.tail` reference: resolved at generation time against the current
/// variable scope first, then remembered fields, then dictionaries.
struct Reference {
    head: String,
    tail: Vec<String>,
}

impl Generator for Reference {
    fn generate(&self, ctx: &mut GenContext) -> Bson {
        let resolved = if let Some(value) = ctx.variable(&self.head) {
            value.clone()
        } else if ctx.state().remembrances.contains(&self.head) {
            let state = ctx.shared_state();
            state
                .remembrances
                .sample(&self.head, &mut ctx.rng)
                .unwrap_or(Bson::Null)
        } else if ctx.state().dictionaries.contains(&self.head) {
            let state = ctx.shared_state();
            state
                .dictionaries
                .sample(&self.head, &mut ctx.rng)
                .unwrap_or(Bson::Null)
        } else {
            debug!("reference not resolved: {}", self.head);
            return Bson::Null;
        };

        match &resolved {
            Bson::Document(_) if !self.tail.is_empty() => {
                let tail: Vec<&str> = self.tail.iter().map(String::as_str).collect();
                descend(&resolved, &tail)
            }
            _ => resolved,
        }
    }
}

/// `##name` compatibility form: variable-only lookup, no path descent.
struct VariableOnly {
    name: String,
}

impl Generator for VariableOnly {
    fn generate(&self, ctx: &mut GenContext) -> Bson {
        ctx.variable(&self.name).cloned().unwrap_or(Bson::Null)
    }
}

/// Operator generator: a named operation over lazily generated parameters.
struct OpGenerator {
    op: Op,
    params: Arc<DocumentGenerator>,
}

enum Op {
    ObjectId,
    Bool,
    Integer,
    Natural,
    Long,
    Double,
    Decimal,
    Gaussian,
    Product,
    Sum,
    Abs,
    Mod,
    Sequence,
    WorkerSequence,
    WorkerNumber,
    WorkloadName,
    Iteration,
    StringConcat,
    ToString,
    StringTemplate,
    Now,
    Date,
    Time,
    PlusDate,
    CeilDate,
    FloorDate,
    ExtractDate,
    Binary,
    UuidString,
    UuidBinary,
    Array,
    OneOf,
    KeyValueMap,
    Dictionary,
    DictionaryConcat,
    DictionaryAt,
    LongLat,
    CoordLine,
    Descend,
    Head,
    ArrayElemAt,
    /// Resolved text-catalogue bridge (e.g. `%name.firstName`).
    Text(text::TextFn),
}

impl Generator for OpGenerator {
    fn generate(&self, ctx: &mut GenContext) -> Bson {
        let params = &self.params;
        match &self.op {
            Op::ObjectId => generators::ids::object_id(),
            Op::Bool => generators::ids::boolean(ctx),
            Op::Integer => generators::numeric::integer(params, ctx),
            Op::Natural => generators::numeric::natural(params, ctx),
            Op::Long => generators::numeric::long(params, ctx),
            Op::Double => generators::numeric::double(params, ctx),
            Op::Decimal => generators::numeric::decimal(params, ctx),
            Op::Gaussian => generators::numeric::gaussian(params, ctx),
            Op::Product => generators::numeric::product(params, ctx),
            Op::Sum => generators::numeric::sum(params, ctx),
            Op::Abs => generators::numeric::abs(params, ctx),
            Op::Mod => generators::numeric::modulo(params, ctx),
            Op::Sequence => generators::ids::sequence(),
            Op::WorkerSequence => generators::ids::worker_sequence(ctx),
            Op::WorkerNumber => Bson::Int32(ctx.worker() as i32),
            Op::WorkloadName => Bson::String(ctx.workload().to_string()),
            Op::Iteration => Bson::Int64(ctx.iteration as i64),
            Op::StringConcat => generators::strings::concat(params, ctx),
            Op::ToString => generators::strings::to_string(params, ctx),
            Op::StringTemplate => generators::strings::template(params, ctx),
            Op::Now => generators::dates::now(),
            Op::Date => generators::dates::date(params, ctx),
            Op::Time => generators::dates::time(ctx),
            Op::PlusDate => generators::dates::plus_date(params, ctx),
            Op::CeilDate => generators::dates::ceil_date(params, ctx),
            Op::FloorDate => generators::dates::floor_date(params, ctx),
            Op::ExtractDate => generators::dates::extract_date(params, ctx),
            Op::Binary => generators::ids::binary(params, ctx),
            Op::UuidString => generators::ids::uuid_string(),
            Op::UuidBinary => generators::ids::uuid_binary(),
            Op::Array => generators::arrays::array(params, ctx),
            Op::OneOf => generators::arrays::one_of(params, ctx),
            Op::KeyValueMap => generators::arrays::key_value_map(params, ctx),
            Op::Dictionary => generators::dict::dictionary(params, ctx),
            Op::DictionaryConcat => generators::dict::dictionary_concat(params, ctx),
            Op::DictionaryAt => generators::dict::dictionary_at(params, ctx),
            Op::LongLat => generators::geo::long_lat(params, ctx),
            Op::CoordLine => generators::geo::coord_line(params, ctx),
            Op::Descend => generators::arrays::descend_into(params, ctx),
            Op::Head => generators::arrays::head(params, ctx),
            Op::ArrayElemAt => generators::arrays::elem_at(params, ctx),
            Op::Text(producer) => producer(&mut ctx.rng),
        }
    }
}

/// Compiles template specs into generator trees, memoizing compiled trees by
/// spec identity so the same filter/update/template spec compiles once.
#[derive(Default)]
pub struct Compiler {
    custom: GeneratorRegistry,
    cache: Mutex<HashMap<String, Arc<dyn Generator>>>,
}

impl Compiler {
    pub fn new(custom: GeneratorRegistry) -> Self {
        Self {
            custom,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compile a spec, reusing a previously compiled tree for the same spec.
    pub fn compile(&self, spec: &Bson) -> Result<Arc<dyn Generator>, CompileError> {
        let key = spec_key(spec);
        if let Some(compiled) = self.cache.lock().expect("compiler cache poisoned").get(&key) {
            return Ok(Arc::clone(compiled));
        }
        // Compiled outside the lock: compilation is pure, so a concurrent
        // duplicate just overwrites the entry with an equivalent tree.
        let compiled = self.compile_value(spec)?;
        self.cache
            .lock()
            .expect("compiler cache poisoned")
            .insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn compile_value(&self, value: &Bson) -> Result<Arc<dyn Generator>, CompileError> {
        match value {
            Bson::String(s) => self.compile_string(s, value),
            Bson::Document(doc) => match operator_expression(doc) {
                Some((op, params)) => self.compile_operator(op, params),
                None => Ok(Arc::new(self.compile_document(doc)?)),
            },
            Bson::Array(items) => {
                let compiled = items
                    .iter()
                    .map(|item| self.compile_value(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(ListGenerator { items: compiled }))
            }
            other => Ok(Arc::new(Constant(other.clone()))),
        }
    }

    fn compile_string(
        &self,
        s: &str,
        original: &Bson,
    ) -> Result<Arc<dyn Generator>, CompileError> {
        if let Some(name) = s.strip_prefix("##") {
            // variable-only lookup, kept for backward compatibility
            return Ok(Arc::new(VariableOnly {
                name: name.to_string(),
            }));
        }
        if let Some(reference) = s.strip_prefix(REFERENCE_MARKER) {
            let mut parts = segments(reference).into_iter();
            let head = parts.next().unwrap_or_default().to_string();
            let tail = parts.map(str::to_string).collect();
            return Ok(Arc::new(Reference { head, tail }));
        }
        if s.starts_with(OPERATOR_MARKER) {
            return self.operator(s, DocumentGenerator::empty());
        }
        Ok(Arc::new(Constant(original.clone())))
    }

    fn compile_operator(
        &self,
        name: &str,
        params: &Bson,
    ) -> Result<Arc<dyn Generator>, CompileError> {
        if name == "%custom" {
            return self.compile_custom(params);
        }
        let params = match params {
            Bson::Document(doc) => self.compile_document(doc)?,
            other => {
                warn!("operator {name} parameters must be a document, got {other:?}");
                return Ok(Arc::new(Constant(Bson::Null)));
            }
        };
        self.operator(name, params)
    }

    fn compile_custom(&self, params: &Bson) -> Result<Arc<dyn Generator>, CompileError> {
        let params = match params {
            Bson::Document(doc) => doc,
            _ => return Err(CompileError::MissingCustomName),
        };
        let name = params
            .get_str("name")
            .map_err(|_| CompileError::MissingCustomName)?;
        self.custom.build(name, params)
    }

    fn compile_document(&self, doc: &Document) -> Result<DocumentGenerator, CompileError> {
        let entries = doc
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.compile_value(value)?)))
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(DocumentGenerator { entries })
    }

    fn operator(
        &self,
        name: &str,
        params: DocumentGenerator,
    ) -> Result<Arc<dyn Generator>, CompileError> {
        // dotted names dispatch on their first segment (%name.firstName)
        let head = name.split('.').next().unwrap_or(name);
        let op = match head {
            "%objectid" => Op::ObjectId,
            "%bool" | "%boolean" => Op::Bool,
            "%integer" | "%number" => Op::Integer,
            "%natural" => Op::Natural,
            "%long" => Op::Long,
            "%double" => Op::Double,
            "%decimal" => Op::Decimal,
            "%gaussian" => Op::Gaussian,
            "%product" => Op::Product,
            "%sum" => Op::Sum,
            "%abs" => Op::Abs,
            "%mod" => Op::Mod,
            "%sequence" => Op::Sequence,
            "%workerSequence" | "%threadSequence" => Op::WorkerSequence,
            "%workerNumber" | "%threadNumber" => Op::WorkerNumber,
            "%workloadName" => Op::WorkloadName,
            "%iteration" => Op::Iteration,
            "%stringConcat" => Op::StringConcat,
            "%toString" => Op::ToString,
            "%stringTemplate" => Op::StringTemplate,
            "%now" => Op::Now,
            "%date" => Op::Date,
            "%time" => Op::Time,
            "%plusDate" => Op::PlusDate,
            "%ceilDate" => Op::CeilDate,
            "%floorDate" => Op::FloorDate,
            "%extractDate" => Op::ExtractDate,
            "%binary" => Op::Binary,
            "%uuidString" => Op::UuidString,
            "%uuidBinary" => Op::UuidBinary,
            "%array" => Op::Array,
            "%oneOf" => Op::OneOf,
            "%keyValueMap" => Op::KeyValueMap,
            "%dictionary" => Op::Dictionary,
            "%dictionaryConcat" => Op::DictionaryConcat,
            "%dictionaryAt" => Op::DictionaryAt,
            "%longlat" => Op::LongLat,
            "%coordLine" => Op::CoordLine,
            "%descend" => Op::Descend,
            "%head" => Op::Head,
            "%arrayElemAt" => Op::ArrayElemAt,
            _ => {
                // anything else goes through the text-catalogue bridge
                return Ok(match text::bridge(name) {
                    Some(producer) => Arc::new(OpGenerator {
                        op: Op::Text(producer),
                        params: Arc::new(params),
                    }),
                    None => {
                        warn!("cannot map operator {name}, echoing its name");
                        Arc::new(Constant(Bson::String(name.to_string())))
                    }
                });
            }
        };
        Ok(Arc::new(OpGenerator {
            op,
            params: Arc::new(params),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TemplateState;
    use crate::dictionary::DictionaryStore;
    use crate::remember::{RememberField, RemembranceStore};
    use bson::{bson, doc};

    fn ctx_with(state: TemplateState) -> GenContext {
        GenContext::new(Arc::new(state), "test", 3)
    }

    fn ctx() -> GenContext {
        ctx_with(TemplateState::default())
    }

    #[test]
    fn test_literal_scalars_compile_to_constants() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        let gen = compiler.compile(&bson!(42)).unwrap();
        assert_eq!(gen.generate(&mut ctx), Bson::Int32(42));
        let gen = compiler.compile(&bson!("plain")).unwrap();
        assert_eq!(gen.generate(&mut ctx), bson!("plain"));
    }

    #[test]
    fn test_document_preserves_insertion_order() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        let gen = compiler
            .compile(&bson!({ "z": 1, "a": 2, "m": 3 }))
            .unwrap();
        let Bson::Document(doc) = gen.generate(&mut ctx) else {
            panic!("expected a document");
        };
        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_list_length_is_fixed() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        let gen = compiler
            .compile(&bson!([1, { "%integer": { "min": 0, "max": 5 } }, "x"]))
            .unwrap();
        for _ in 0..10 {
            let Bson::Array(items) = gen.generate(&mut ctx) else {
                panic!("expected an array");
            };
            assert_eq!(items.len(), 3);
        }
    }

    #[test]
    fn test_multi_key_percent_document_is_literal() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        let gen = compiler
            .compile(&bson!({ "%integer": 1, "other": 2 }))
            .unwrap();
        let Bson::Document(doc) = gen.generate(&mut ctx) else {
            panic!("expected a document");
        };
        // "%integer" with non-document params degrades to null, but the
        // outer shape stays a two-entry literal document
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get("other"), Some(&Bson::Int32(2)));
    }

    #[test]
    fn test_reference_prefers_variables_over_stores() {
        let remembrances = RemembranceStore::new(vec![RememberField::simple("x")]);
        remembrances.append("x", vec![bson!("remembered")]);
        let dictionaries = DictionaryStore::default();
        dictionaries.insert("x", vec![bson!("dictionary")]);

        let compiler = Compiler::default();
        let gen = compiler.compile(&bson!("#x")).unwrap();

        let mut ctx = ctx_with(TemplateState::new(remembrances, dictionaries));
        let saved = ctx.install_variables(doc! { "x": "variable" });
        assert_eq!(gen.generate(&mut ctx), bson!("variable"));
        ctx.restore_variables(saved);
        assert_eq!(gen.generate(&mut ctx), bson!("remembered"));
    }

    #[test]
    fn test_reference_falls_back_to_dictionary() {
        let dictionaries = DictionaryStore::default();
        dictionaries.insert("colors", vec![bson!("red")]);
        let compiler = Compiler::default();
        let gen = compiler.compile(&bson!("#colors")).unwrap();
        let mut ctx = ctx_with(TemplateState::new(
            RemembranceStore::default(),
            dictionaries,
        ));
        assert_eq!(gen.generate(&mut ctx), bson!("red"));
    }

    #[test]
    fn test_unresolved_reference_is_null() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        let gen = compiler.compile(&bson!("#nothing")).unwrap();
        assert_eq!(gen.generate(&mut ctx), Bson::Null);
    }

    #[test]
    fn test_reference_descends_into_documents() {
        let mut ctx = ctx();
        let saved = ctx.install_variables(doc! { "order": { "lines": [ { "sku": "a" }, { "sku": "b" } ] } });
        let compiler = Compiler::default();
        let gen = compiler.compile(&bson!("#order.lines.sku")).unwrap();
        assert_eq!(gen.generate(&mut ctx), bson!(["a", "b"]));
        ctx.restore_variables(saved);
    }

    #[test]
    fn test_double_marker_skips_descent() {
        let mut ctx = ctx();
        let saved = ctx.install_variables(doc! { "a.b": 7 });
        let compiler = Compiler::default();
        let gen = compiler.compile(&bson!("##a.b")).unwrap();
        assert_eq!(gen.generate(&mut ctx), Bson::Int32(7));
        ctx.restore_variables(saved);
    }

    #[test]
    fn test_compile_is_memoized() {
        let compiler = Compiler::default();
        let spec = bson!({ "a": { "%integer": { "min": 0, "max": 9 } } });
        let first = compiler.compile(&spec).unwrap();
        let second = compiler.compile(&spec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_custom_generator_fails_compilation() {
        let compiler = Compiler::default();
        let err = compiler
            .compile(&bson!({ "%custom": { "name": "missing" } }))
            .err()
            .unwrap();
        assert!(matches!(err, CompileError::UnknownCustomGenerator(_)));
    }

    #[test]
    fn test_unmapped_operator_echoes_its_name() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        let gen = compiler.compile(&bson!("%frob.nicate")).unwrap();
        assert_eq!(gen.generate(&mut ctx), bson!("%frob.nicate"));
    }

    #[test]
    fn test_worker_context_operators() {
        let compiler = Compiler::default();
        let mut ctx = ctx();
        ctx.iteration = 12;
        let gen = compiler
            .compile(&bson!({ "wl": "%workloadName", "w": "%workerNumber", "i": "%iteration" }))
            .unwrap();
        let Bson::Document(doc) = gen.generate(&mut ctx) else {
            panic!("expected a document");
        };
        assert_eq!(doc.get_str("wl").unwrap(), "test");
        assert_eq!(doc.get_i32("w").unwrap(), 3);
        assert_eq!(doc.get_i64("i").unwrap(), 12);
    }
}
