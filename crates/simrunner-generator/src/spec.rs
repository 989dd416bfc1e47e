//! Template spec markers and conversions.

use bson::{Bson, Document};

/// Prefix selecting a named operator, e.g. `%integer` or `%name.firstName`.
pub const OPERATOR_MARKER: char = '%';

/// Prefix of a reference string, e.g. `#customerId` or `#order.lines.sku`.
pub const REFERENCE_MARKER: char = '#';

/// Error raised while parsing or converting a template spec.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// The YAML value cannot be represented as BSON (e.g. non-string map key).
    #[error("spec is not representable as a document: {0}")]
    NotADocument(String),

    /// Malformed remember-field entry.
    #[error("invalid remember field: {0}")]
    InvalidRemember(String),
}

/// Convert a parsed YAML value into BSON.
///
/// Run configuration files are YAML; template, filter and update specs
/// embedded in them become BSON before compilation.
pub fn yaml_to_bson(value: &serde_yaml::Value) -> Result<Bson, SpecError> {
    let json = serde_json::to_value(value).map_err(|e| SpecError::NotADocument(e.to_string()))?;
    Bson::try_from(json).map_err(|e| SpecError::NotADocument(e.to_string()))
}

/// Canonical identity key of a spec, used to memoize compiled trees.
///
/// Two structurally equal specs compile to interchangeable generators, so a
/// canonical rendering is a sound cache key. Compilation is pure; a duplicate
/// concurrent compile simply overwrites the cache entry with an equivalent one.
pub fn spec_key(spec: &Bson) -> String {
    format!("{spec:?}")
}

/// An operator expression is a document with exactly one entry whose key
/// starts with the operator marker. Any other shape is a literal sub-document.
pub fn operator_expression(doc: &Document) -> Option<(&str, &Bson)> {
    if doc.len() != 1 {
        return None;
    }
    let (key, value) = doc.iter().next()?;
    key.starts_with(OPERATOR_MARKER).then(|| (key.as_str(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    #[test]
    fn test_single_percent_key_is_expression() {
        let doc = bson!({ "%integer": { "min": 0 } });
        let doc = doc.as_document().unwrap();
        let (op, _) = operator_expression(doc).unwrap();
        assert_eq!(op, "%integer");
    }

    #[test]
    fn test_multi_key_document_is_literal() {
        let doc = bson!({ "%integer": { "min": 0 }, "other": 1 });
        assert!(operator_expression(doc.as_document().unwrap()).is_none());
    }

    #[test]
    fn test_plain_document_is_literal() {
        let doc = bson!({ "integer": { "min": 0 } });
        assert!(operator_expression(doc.as_document().unwrap()).is_none());
    }

    #[test]
    fn test_yaml_to_bson_round_trip() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("a: 1\nb: [x, y]\nc:\n  d: 2.5").unwrap();
        let bson = yaml_to_bson(&yaml).unwrap();
        let doc = bson.as_document().unwrap();
        // small integers land as Int32 through the serde_json intermediate
        assert_eq!(doc.get_i32("a").ok(), Some(1));
        assert_eq!(doc.get_array("b").unwrap().len(), 2);
        assert_eq!(
            doc.get_document("c").unwrap().get_f64("d").ok(),
            Some(2.5)
        );
    }

    #[test]
    fn test_spec_key_distinguishes_specs() {
        let a = bson!({ "%integer": { "min": 0, "max": 5 } });
        let b = bson!({ "%integer": { "min": 0, "max": 6 } });
        assert_ne!(spec_key(&a), spec_key(&b));
        assert_eq!(spec_key(&a), spec_key(&a.clone()));
    }
}
