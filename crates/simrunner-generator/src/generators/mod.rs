//! Operator implementations, grouped by family.
//!
//! Every function takes the compiled parameter document and the per-worker
//! context. Malformed parameters degrade to `Bson::Null` with a log line
//! rather than aborting the iteration; compilation already rejected the
//! structurally invalid shapes.

pub mod arrays;
pub mod dates;
pub mod dict;
pub mod geo;
pub mod ids;
pub mod numeric;
pub mod strings;
pub mod text;

use bson::{Bson, Document};

/// Numeric coercion across the integer widths and doubles.
pub(crate) fn to_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

pub(crate) fn to_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) => Some(*d as i64),
        _ => None,
    }
}

pub(crate) fn doc_f64(doc: &Document, key: &str) -> Option<f64> {
    doc.get(key).and_then(to_f64)
}

pub(crate) fn doc_i64(doc: &Document, key: &str) -> Option<i64> {
    doc.get(key).and_then(to_i64)
}

pub(crate) fn doc_i32(doc: &Document, key: &str) -> Option<i32> {
    doc_i64(doc, key).map(|n| n as i32)
}

/// Date parameter: either a generated datetime or an ISO-8601 string.
pub(crate) fn doc_date(doc: &Document, key: &str) -> Option<bson::DateTime> {
    match doc.get(key)? {
        Bson::DateTime(dt) => Some(*dt),
        Bson::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| bson::DateTime::from_chrono(dt)),
        _ => None,
    }
}

/// Plain-text rendering used by the string operators. Unlike the `Display`
/// impl on `Bson` this does not quote strings.
pub(crate) fn render(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(d) => d.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .unwrap_or_else(|_| dt.to_string()),
        Bson::Null => String::new(),
        other => other.to_string(),
    }
}
