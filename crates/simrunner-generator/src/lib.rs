//! Template compiler and generator tree for the simrunner load simulator.
//!
//! A template spec is an ordered BSON document in which every value is either
//! a literal, a nested document, a list, an operator expression (a single-key
//! map whose key starts with `%`), or a reference string (starting with `#`).
//! The [`Compiler`] turns such a spec into a tree of [`Generator`]s that
//! produce one randomized value per call.
//!
//! # Architecture
//!
//! ```text
//! template spec (BSON)
//!        │
//!        ▼
//! ┌──────────────┐      ┌────────────────────┐
//! │   Compiler   │─────▶│   Generator tree   │
//! │  (memoized)  │      │  doc / list / op   │
//! └──────────────┘      └─────────┬──────────┘
//!                                 │ generate(ctx)
//!                                 ▼
//!                     Bson value (one per call)
//! ```
//!
//! Generation is driven through a per-worker [`GenContext`] carrying the RNG,
//! the worker identity, the current variable scope, and a shared handle to the
//! template's [`RemembranceStore`] and [`DictionaryStore`]. Compiled trees are
//! stateless apart from that context, so one tree is safely shared by all
//! workers of a workload.
//!
//! # Example
//!
//! ```rust
//! use bson::bson;
//! use simrunner_generator::{Compiler, GenContext, Generator, TemplateState};
//! use std::sync::Arc;
//!
//! let compiler = Compiler::default();
//! let spec = bson!({ "age": { "%integer": { "min": 18, "max": 99 } } });
//! let tree = compiler.compile(&spec).unwrap();
//!
//! let mut ctx = GenContext::new(Arc::new(TemplateState::default()), "demo", 0);
//! let doc = tree.generate(&mut ctx);
//! println!("generated: {doc}");
//! ```

pub mod compiler;
pub mod context;
pub mod dictionary;
pub mod generators;
pub mod path;
pub mod registry;
pub mod remember;
pub mod spec;

// Re-exports for convenience
pub use compiler::{CompileError, Compiler, DocumentGenerator, Generator, ListGenerator};
pub use context::{GenContext, TemplateState};
pub use dictionary::DictionaryStore;
pub use registry::GeneratorRegistry;
pub use remember::{RememberField, RemembranceStore};
pub use spec::{SpecError, OPERATOR_MARKER, REFERENCE_MARKER};
