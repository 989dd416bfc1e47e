//! String operators.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::render;
use bson::Bson;
use rand::Rng;
use tracing::{error, warn};

/// `%stringConcat`: render and join the `of` list with `sep` (default empty).
pub fn concat(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let sep = p.get_str("sep").unwrap_or("");
    let Ok(of) = p.get_array("of") else {
        warn!("%stringConcat needs an 'of' array");
        return Bson::String(String::new());
    };
    Bson::String(
        of.iter()
            .map(render)
            .collect::<Vec<_>>()
            .join(sep),
    )
}

/// `%toString`: plain-text rendering of `of`; datetimes come out as
/// millisecond-precision ISO-8601.
pub fn to_string(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let rendered = match p.get("of") {
        None | Some(Bson::Null) => String::new(),
        Some(Bson::DateTime(dt)) => dt
            .to_chrono()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string(),
        Some(other) => render(other),
    };
    Bson::String(rendered)
}

const DIGITS: &[u8] = b"0123456789";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// `%stringTemplate`: expand a mask where `&` is a random digit, `?` a
/// random lowercase letter and `!` a random uppercase letter; every other
/// character is copied through.
pub fn template(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let Ok(mask) = p.get_str("template") else {
        error!("missing template in {p:?}");
        return Bson::String("---MISSING VALUE---".to_string());
    };
    let mut out = String::with_capacity(mask.len());
    for c in mask.chars() {
        let picked = match c {
            '&' => DIGITS[ctx.rng.random_range(0..DIGITS.len())] as char,
            '?' => LOWER[ctx.rng.random_range(0..LOWER.len())] as char,
            '!' => UPPER[ctx.rng.random_range(0..UPPER.len())] as char,
            other => other,
        };
        out.push(picked);
    }
    Bson::String(out)
}
