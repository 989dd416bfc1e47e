//! Dictionary-backed operators.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::{doc_i64, render};
use bson::Bson;
use rand::Rng;
use tracing::{error, warn};

/// `%dictionary`: a uniformly random entry of the dictionary `name`.
pub fn dictionary(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let Ok(name) = p.get_str("name") else {
        error!("missing dictionary name");
        return Bson::String(String::new());
    };
    let name = name.to_string();
    let state = ctx.shared_state();
    match state.dictionaries.sample(&name, &mut ctx.rng) {
        Some(entry) => entry,
        None => {
            warn!("could not find dictionary {name}");
            Bson::Null
        }
    }
}

/// `%dictionaryConcat`: `length` random entries of dictionary `from`,
/// rendered and joined with `sep`.
pub fn dictionary_concat(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let (Ok(from), Some(length)) = (p.get_str("from"), doc_i64(&p, "length")) else {
        warn!("%dictionaryConcat needs 'from' and 'length'");
        return Bson::Null;
    };
    let from = from.to_string();
    let sep = p.get_str("sep").unwrap_or("").to_string();

    let state = ctx.shared_state();
    let mut parts = Vec::with_capacity(length.max(0) as usize);
    for _ in 0..length.max(0) {
        match state.dictionaries.sample(&from, &mut ctx.rng) {
            Some(entry) => parts.push(render(&entry)),
            None => {
                warn!("could not find dictionary {from}");
                return Bson::Null;
            }
        }
    }
    Bson::String(parts.join(&sep))
}

/// `%dictionaryAt`: the entry of dictionary `from` at index `at`, wrapping
/// around the dictionary length.
pub fn dictionary_at(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let (Ok(from), Some(at)) = (p.get_str("from"), doc_i64(&p, "at")) else {
        warn!("%dictionaryAt needs 'from' and 'at'");
        return Bson::Null;
    };
    match ctx.state().dictionaries.at(from, at) {
        Some(entry) => entry,
        None => {
            warn!("could not find dictionary {from}");
            Bson::Null
        }
    }
}
