//! Date and time operators. All calendar math is UTC.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::doc_date;
use bson::Bson;
use chrono::{Datelike, Timelike};
use rand::Rng;
use tracing::warn;

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Millisecond width of a truncation unit. Month and year are not
/// fixed-width, so truncation stops at days.
fn unit_millis(unit: &str) -> Option<i64> {
    match unit.to_ascii_lowercase().as_str() {
        "year" | "month" => None,
        "day" => Some(MILLIS_PER_DAY),
        "hour" => Some(MILLIS_PER_HOUR),
        "minute" => Some(MILLIS_PER_MINUTE),
        _ => Some(MILLIS_PER_SECOND),
    }
}

/// `%now`
pub fn now() -> Bson {
    Bson::DateTime(bson::DateTime::now())
}

/// `%date`: uniform datetime between `min` (default epoch) and `max`
/// (default ten years from now), optionally truncated to `truncate`.
pub fn date(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let from = doc_date(&p, "min")
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0);
    let to = doc_date(&p, "max")
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| bson::DateTime::now().timestamp_millis() + 3650 * MILLIS_PER_DAY);

    let mut millis = if from >= to {
        from
    } else {
        ctx.rng.random_range(from..to)
    };
    if let Ok(unit) = p.get_str("truncate") {
        if let Some(width) = unit_millis(unit) {
            millis = millis.div_euclid(width) * width;
        }
    }
    Bson::DateTime(bson::DateTime::from_millis(millis))
}

/// `%time`: a wall-clock time as an unpadded `H:M:S` string.
pub fn time(ctx: &mut GenContext) -> Bson {
    Bson::String(format!(
        "{}:{}:{}",
        ctx.rng.random_range(0..24),
        ctx.rng.random_range(0..60),
        ctx.rng.random_range(0..60)
    ))
}

/// `%plusDate`: `base` shifted by `plus` units.
pub fn plus_date(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let (Some(base), Some(plus)) = (doc_date(&p, "base"), super::doc_i64(&p, "plus")) else {
        warn!("%plusDate needs 'base' and 'plus'");
        return Bson::Null;
    };
    let unit = p.get_str("unit").unwrap_or("second");
    let Some(width) = unit_millis(unit) else {
        warn!("%plusDate cannot shift by unit {unit}");
        return Bson::Null;
    };
    Bson::DateTime(bson::DateTime::from_millis(
        base.timestamp_millis() + plus * width,
    ))
}

/// `%ceilDate`: `base` rounded up to the next `unit` boundary (default day).
pub fn ceil_date(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    truncate_to_unit(params, ctx, "%ceilDate", 1)
}

/// `%floorDate`: `base` rounded down to its `unit` boundary (default day).
pub fn floor_date(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    truncate_to_unit(params, ctx, "%floorDate", 0)
}

fn truncate_to_unit(
    params: &DocumentGenerator,
    ctx: &mut GenContext,
    op: &str,
    offset_units: i64,
) -> Bson {
    let p = params.generate_document(ctx);
    let Some(base) = doc_date(&p, "base") else {
        warn!("{op} needs a 'base' datetime");
        return Bson::Null;
    };
    let unit = p.get_str("unit").unwrap_or("day");
    let Some(width) = unit_millis(unit) else {
        warn!("{op} cannot truncate to unit {unit}");
        return Bson::Null;
    };
    let floored = base.timestamp_millis().div_euclid(width) * width;
    Bson::DateTime(bson::DateTime::from_millis(floored + offset_units * width))
}

/// `%extractDate`: one calendar component of a datetime. The parameter
/// document's first key names the component; an unrecognized key yields the
/// epoch second.
pub fn extract_date(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let Some(key) = p.keys().next().cloned() else {
        warn!("%extractDate found with empty argument");
        return Bson::Null;
    };
    let Some(base) = doc_date(&p, &key) else {
        warn!("%extractDate component {key} is not a datetime");
        return Bson::Null;
    };
    let utc = base.to_chrono();
    match key.as_str() {
        "second" => Bson::Int32(utc.second() as i32),
        "minute" => Bson::Int32(utc.minute() as i32),
        "hour" => Bson::Int32(utc.hour() as i32),
        "day" => Bson::Int32(utc.day() as i32),
        "month" => Bson::Int32(utc.month() as i32),
        "year" => Bson::Int32(utc.year()),
        _ => Bson::Int64(utc.timestamp()),
    }
}
