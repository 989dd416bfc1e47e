//! Numeric operators: bounded draws, gaussian, and arithmetic folds.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::{doc_f64, doc_i32, doc_i64, to_f64, to_i64};
use bson::Bson;
use rand::Rng;
use std::str::FromStr;
use tracing::warn;

/// `%integer`: uniform i32 in `[min, max)`, defaulting to the full range.
pub fn integer(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let min = doc_i32(&p, "min").unwrap_or(i32::MIN);
    let max = doc_i32(&p, "max").unwrap_or(i32::MAX);
    if min >= max {
        return Bson::Int32(min);
    }
    Bson::Int32(ctx.rng.random_range(min..max))
}

/// `%natural`: like `%integer` but never negative by default.
pub fn natural(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let min = doc_i32(&p, "min").unwrap_or(0);
    let max = doc_i32(&p, "max").unwrap_or(i32::MAX);
    if min >= max {
        return Bson::Int32(min);
    }
    Bson::Int32(ctx.rng.random_range(min..max))
}

/// `%long`: uniform i64 in `[min, max)`.
pub fn long(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let min = doc_i64(&p, "min").unwrap_or(i64::MIN);
    let max = doc_i64(&p, "max").unwrap_or(i64::MAX);
    if min >= max {
        return Bson::Int64(min);
    }
    Bson::Int64(ctx.rng.random_range(min..max))
}

/// `%double`: uniform double in `[min, max)`, optionally rounded to
/// `decimals` places.
pub fn double(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let min = doc_f64(&p, "min").unwrap_or(0.0);
    let max = doc_f64(&p, "max").unwrap_or(f64::MAX);
    let mut result = if min >= max {
        min
    } else {
        ctx.rng.random_range(min..max)
    };
    if let Some(decimals) = doc_i32(&p, "decimals") {
        let factor = 10f64.powi(decimals);
        result = (result * factor).round() / factor;
    }
    Bson::Double(result)
}

/// `%decimal`: a Decimal128 with a uniform integer part in `[min, max)` and
/// up to six random fractional digits.
pub fn decimal(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let min = doc_i64(&p, "min").unwrap_or(i64::MIN);
    let max = doc_i64(&p, "max").unwrap_or(i64::MAX);
    let before = if min >= max {
        min
    } else {
        ctx.rng.random_range(min..max)
    };
    let after: i64 = ctx.rng.random_range(0..1_000_000);
    match bson::Decimal128::from_str(&format!("{before}.{after}")) {
        Ok(decimal) => Bson::Decimal128(decimal),
        Err(_) => Bson::Null,
    }
}

/// `%gaussian`: normal draw with `mean` and `sd`, emitted as `double` (the
/// default), or rounded to `int`/`long` per `type`.
pub fn gaussian(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let (Some(mean), Some(sd)) = (doc_f64(&p, "mean"), doc_f64(&p, "sd")) else {
        warn!("%gaussian needs numeric 'mean' and 'sd'");
        return Bson::Null;
    };
    let value = standard_normal(ctx) * sd + mean;
    match p.get_str("type").unwrap_or("double") {
        "int" => Bson::Int32(value.round() as i32),
        "long" => Bson::Int64(value.round() as i64),
        _ => Bson::Double(value),
    }
}

// Box-Muller on two uniform draws.
fn standard_normal(ctx: &mut GenContext) -> f64 {
    let u1: f64 = ctx.rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = ctx.rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// `%product`: fold the `of` list by multiplication; `type` is `long`
/// (default) or `double`.
pub fn product(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    fold(params, ctx, |a, b| a * b, |a, b| a * b)
}

/// `%sum`: fold the `of` list by addition; `type` as for `%product`.
pub fn sum(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    fold(params, ctx, |a, b| a + b, |a, b| a + b)
}

fn fold(
    params: &DocumentGenerator,
    ctx: &mut GenContext,
    long_op: fn(i64, i64) -> i64,
    double_op: fn(f64, f64) -> f64,
) -> Bson {
    let p = params.generate_document(ctx);
    let Ok(of) = p.get_array("of") else {
        warn!("numeric fold needs an 'of' array");
        return Bson::Null;
    };
    match p.get_str("type").unwrap_or("long") {
        "double" => {
            let values: Vec<f64> = of.iter().filter_map(to_f64).collect();
            Bson::Double(
                values
                    .into_iter()
                    .reduce(double_op)
                    .unwrap_or(0.0),
            )
        }
        _ => {
            let values: Vec<i64> = of.iter().filter_map(to_i64).collect();
            Bson::Int64(values.into_iter().reduce(long_op).unwrap_or(0))
        }
    }
}

/// `%abs`: absolute value, preserving the input's numeric type.
pub fn abs(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    match p.get("of") {
        Some(Bson::Int32(n)) => Bson::Int32(n.wrapping_abs()),
        Some(Bson::Int64(n)) => Bson::Int64(n.wrapping_abs()),
        Some(Bson::Double(d)) => Bson::Double(d.abs()),
        _ => {
            warn!("%abs needs a numeric 'of'");
            Bson::Null
        }
    }
}

/// `%mod`: `of % by` over i64.
pub fn modulo(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let (Some(of), Some(by)) = (doc_i64(&p, "of"), doc_i64(&p, "by")) else {
        warn!("%mod needs numeric 'of' and 'by'");
        return Bson::Null;
    };
    if by == 0 {
        warn!("%mod by zero");
        return Bson::Null;
    }
    Bson::Int64(of % by)
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
    fn test_integer_stays_in_range() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%integer": { "min": 10, "max": 20 } }))
            .unwrap();
        for _ in 0..10_000 {
            let Bson::Int32(n) = gen.generate(&mut ctx) else {
                panic!("expected an i32");
            };
            assert!((10..20).contains(&n));
        }
    }

    #[test]
    fn test_natural_defaults_to_non_negative() {
        let mut ctx = ctx();
        let gen = Compiler::default().compile(&bson!("%natural")).unwrap();
        for _ in 0..1_000 {
            let Bson::Int32(n) = gen.generate(&mut ctx) else {
                panic!("expected an i32");
            };
            assert!(n >= 0);
        }
    }

    #[test]
    fn test_long_range() {
        let mut ctx = ctx();
        for _ in 0..10_000 {
            let value = generate(
                bson!({ "%long": { "min": -5i64, "max": 5i64 } }),
                &mut ctx,
            );
            let Bson::Int64(n) = value else {
                panic!("expected an i64");
            };
            assert!((-5..5).contains(&n));
        }
    }

    #[test]
    fn test_double_decimals_rounding() {
        let mut ctx = ctx();
        let value = generate(
            bson!({ "%double": { "min": 0.0, "max": 10.0, "decimals": 2 } }),
            &mut ctx,
        );
        let Bson::Double(d) = value else {
            panic!("expected a double");
        };
        assert!((d * 100.0 - (d * 100.0).round()).abs() < 1e-9);
    }

    #[test]
    fn test_gaussian_typed_output() {
        let mut ctx = ctx();
        let value = generate(
            bson!({ "%gaussian": { "mean": 100.0, "sd": 0.0, "type": "int" } }),
            &mut ctx,
        );
        assert_eq!(value, Bson::Int32(100));
        let value = generate(
            bson!({ "%gaussian": { "mean": 7.0, "sd": 0.0, "type": "long" } }),
            &mut ctx,
        );
        assert_eq!(value, Bson::Int64(7));
    }

    #[test]
    fn test_gaussian_missing_params_is_null() {
        let mut ctx = ctx();
        assert_eq!(generate(bson!({ "%gaussian": {} }), &mut ctx), Bson::Null);
    }

    #[test]
    fn test_sum_and_product() {
        let mut ctx = ctx();
        assert_eq!(
            generate(bson!({ "%sum": { "of": [1, 2, 3] } }), &mut ctx),
            Bson::Int64(6)
        );
        assert_eq!(
            generate(
                bson!({ "%product": { "of": [2.0, 3.0], "type": "double" } }),
                &mut ctx
            ),
            Bson::Double(6.0)
        );
        assert_eq!(
            generate(bson!({ "%sum": { "of": [] } }), &mut ctx),
            Bson::Int64(0)
        );
    }

    #[test]
    fn test_abs_preserves_type() {
        let mut ctx = ctx();
        assert_eq!(
            generate(bson!({ "%abs": { "of": -4 } }), &mut ctx),
            Bson::Int32(4)
        );
        assert_eq!(
            generate(bson!({ "%abs": { "of": -4.5 } }), &mut ctx),
            Bson::Double(4.5)
        );
    }

    #[test]
    fn test_mod() {
        let mut ctx = ctx();
        assert_eq!(
            generate(bson!({ "%mod": { "of": 17, "by": 5 } }), &mut ctx),
            Bson::Int64(2)
        );
        assert_eq!(
            generate(bson!({ "%mod": { "of": 17, "by": 0 } }), &mut ctx),
            Bson::Null
        );
    }
}
