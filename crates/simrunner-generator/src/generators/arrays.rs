//! Array and structural operators.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::{render, to_i64};
use crate::path::{descend, segments};
use bson::{Bson, Document};
use rand::Rng;
use tracing::{debug, warn};

fn sub_i64(params: &DocumentGenerator, key: &str, ctx: &mut GenContext) -> Option<i64> {
    let value = params.sub_generate(key, ctx);
    to_i64(&value)
}

/// `%array`: `size` elements of `of`, or a uniform count in `[min, max]`
/// when `size` is absent. Both bounds are inclusive so `min: 5, max: 5`
/// yields exactly five elements.
pub fn array(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let min = sub_i64(params, "min", ctx).unwrap_or(0);
    let max = sub_i64(params, "max", ctx).unwrap_or(10).max(min);
    let size = match sub_i64(params, "size", ctx) {
        Some(size) => size.max(0),
        None => ctx.rng.random_range(min..=max),
    };
    let mut result = Vec::with_capacity(size as usize);
    for _ in 0..size {
        result.push(params.sub_generate("of", ctx));
    }
    Bson::Array(result)
}

/// `%oneOf`: pick one entry of the compiled `options` list, generating only
/// the chosen entry. An optional `weights` list biases the draw; missing
/// weights count as 1, extra weights are ignored.
pub fn one_of(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let Some(options) = params.sub("options").and_then(|gen| gen.as_list()) else {
        warn!("%oneOf needs an 'options' array");
        return Bson::Null;
    };
    if options.is_empty() {
        return Bson::Null;
    }
    let size = options.len();

    let index = match params.sub_generate("weights", ctx) {
        Bson::Array(weights) => {
            let mut expanded: Vec<i64> = weights
                .iter()
                .take(size)
                .map(|w| to_i64(w).unwrap_or(1).max(0))
                .collect();
            expanded.resize(size, 1);

            let total: i64 = expanded.iter().sum();
            if total <= 0 {
                ctx.rng.random_range(0..size)
            } else {
                let mut roll = ctx.rng.random_range(0..total);
                let mut picked = size - 1;
                for (i, weight) in expanded.iter().enumerate() {
                    if roll < *weight {
                        picked = i;
                        break;
                    }
                    roll -= weight;
                }
                picked
            }
        }
        _ => ctx.rng.random_range(0..size),
    };

    options.generate_at(index, ctx)
}

const KEY_RETRY_LIMIT: usize = 100;

/// `%keyValueMap`: a document of `key`/`value` pairs, sized uniformly in
/// `[min, max]`. Duplicate keys are re-drawn; a key generator that cannot
/// produce enough distinct keys yields a smaller map.
pub fn key_value_map(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let min = sub_i64(params, "min", ctx).unwrap_or(0);
    let max = sub_i64(params, "max", ctx).unwrap_or(10).max(min);
    let size = ctx.rng.random_range(min..=max);

    let mut result = Document::new();
    'entries: for _ in 0..size {
        let mut key = render(&params.sub_generate("key", ctx));
        let mut retries = 0;
        while result.contains_key(&key) {
            retries += 1;
            if retries > KEY_RETRY_LIMIT {
                debug!("%keyValueMap key space exhausted after {} entries", result.len());
                break 'entries;
            }
            key = render(&params.sub_generate("key", ctx));
        }
        let value = params.sub_generate("value", ctx);
        result.insert(key, value);
    }
    Bson::Document(result)
}

/// `%descend`: extract `path` from the generated `in` value. Non-document
/// inputs pass through unchanged.
pub fn descend_into(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let Some(input) = p.get("in") else {
        return Bson::Null;
    };
    match input {
        Bson::Document(_) => {
            let Ok(path) = p.get_str("path") else {
                warn!("%descend needs a 'path' string");
                return Bson::Null;
            };
            descend(input, &segments(path))
        }
        other => {
            debug!("%descend target is not a document, ignoring path");
            other.clone()
        }
    }
}

/// `%head`: the first element of an array-like value. Strings yield their
/// first character, binary values and object ids their first byte.
pub fn head(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    match p.get("of") {
        Some(Bson::Array(items)) => items.first().cloned().unwrap_or(Bson::Null),
        Some(Bson::String(s)) => s
            .chars()
            .next()
            .map(|c| Bson::String(c.to_string()))
            .unwrap_or(Bson::Null),
        Some(Bson::Binary(bin)) => bin
            .bytes
            .first()
            .map(|b| Bson::Int32(*b as i32))
            .unwrap_or(Bson::Null),
        Some(Bson::ObjectId(oid)) => Bson::Int32(oid.bytes()[0] as i32),
        _ => {
            debug!("%head input is not array-like");
            Bson::Null
        }
    }
}

/// `%arrayElemAt`: element `at` (default 0) of the `from` array; out of
/// bounds yields null.
pub fn elem_at(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let Some(Bson::Array(items)) = p.get("from") else {
        debug!("%arrayElemAt 'from' parameter not provided");
        return Bson::Null;
    };
    let at = super::doc_i64(&p, "at").unwrap_or(0);
    if at < 0 {
        return Bson::Null;
    }
    items.get(at as usize).cloned().unwrap_or(Bson::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::context::TemplateState;
    use bson::bson;
    use std::sync::Arc;

    fn ctx() -> GenContext {
        GenContext::new(Arc::new(TemplateState::default()), "test", 0)
    }

    fn generate(spec: Bson, ctx: &mut GenContext) -> Bson {
        Compiler::default().compile(&spec).unwrap().generate(ctx)
    }

    #[test]
    fn test_array_bounds_are_inclusive() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%array": { "min": 5, "max": 5, "of": 1 } }))
            .unwrap();
        for _ in 0..100 {
            let Bson::Array(items) = gen.generate(&mut ctx) else {
                panic!("expected an array");
            };
            assert_eq!(items.len(), 5);
        }
    }

    #[test]
    fn test_array_size_overrides_bounds() {
        let mut ctx = ctx();
        let value = generate(
            bson!({ "%array": { "min": 1, "max": 2, "size": 7, "of": "x" } }),
            &mut ctx,
        );
        let Bson::Array(items) = value else {
            panic!("expected an array");
        };
        assert_eq!(items.len(), 7);
        assert!(items.iter().all(|v| v == &bson!("x")));
    }

    #[test]
    fn test_one_of_picks_an_option() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%oneOf": { "options": ["a", "b", "c"] } }))
            .unwrap();
        for _ in 0..100 {
            let value = gen.generate(&mut ctx);
            assert!([bson!("a"), bson!("b"), bson!("c")].contains(&value));
        }
    }

    #[test]
    fn test_one_of_zero_weight_excludes_option() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%oneOf": {
                "options": ["never", "always"],
                "weights": [0, 1],
            } }))
            .unwrap();
        for _ in 0..100 {
            assert_eq!(gen.generate(&mut ctx), bson!("always"));
        }
    }

    #[test]
    fn test_one_of_short_weights_pad_with_one() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%oneOf": {
                "options": ["a", "b"],
                "weights": [0],
            } }))
            .unwrap();
        for _ in 0..50 {
            assert_eq!(gen.generate(&mut ctx), bson!("b"));
        }
    }

    #[test]
    fn test_key_value_map_keys_are_unique() {
        let mut ctx = ctx();
        let value = generate(
            bson!({ "%keyValueMap": {
                "min": 3, "max": 3,
                "key": { "%stringTemplate": { "template": "k-&&&&&&" } },
                "value": 1,
            } }),
            &mut ctx,
        );
        let Bson::Document(map) = value else {
            panic!("expected a document");
        };
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_key_value_map_constant_key_degrades() {
        let mut ctx = ctx();
        let value = generate(
            bson!({ "%keyValueMap": {
                "min": 5, "max": 5,
                "key": "same",
                "value": true,
            } }),
            &mut ctx,
        );
        let Bson::Document(map) = value else {
            panic!("expected a document");
        };
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_descend_extracts_path() {
        let mut ctx = ctx();
        assert_eq!(
            generate(
                bson!({ "%descend": { "in": { "a": { "b": 3 } }, "path": "a.b" } }),
                &mut ctx
            ),
            Bson::Int32(3)
        );
        assert_eq!(
            generate(
                bson!({ "%descend": { "in": 9, "path": "a" } }),
                &mut ctx
            ),
            Bson::Int32(9)
        );
    }

    #[test]
    fn test_head_variants() {
        let mut ctx = ctx();
        assert_eq!(
            generate(bson!({ "%head": { "of": [7, 8] } }), &mut ctx),
            Bson::Int32(7)
        );
        assert_eq!(
            generate(bson!({ "%head": { "of": "word" } }), &mut ctx),
            bson!("w")
        );
        assert_eq!(
            generate(bson!({ "%head": { "of": 1.5 } }), &mut ctx),
            Bson::Null
        );
    }

    #[test]
    fn test_elem_at() {
        let mut ctx = ctx();
        assert_eq!(
            generate(
                bson!({ "%arrayElemAt": { "from": [10, 20, 30], "at": 1 } }),
                &mut ctx
            ),
            Bson::Int32(20)
        );
        assert_eq!(
            generate(
                bson!({ "%arrayElemAt": { "from": [10], "at": 5 } }),
                &mut ctx
            ),
            Bson::Null
        );
        assert_eq!(
            generate(bson!({ "%arrayElemAt": { "from": [10] } }), &mut ctx),
            Bson::Int32(10)
        );
    }
}
