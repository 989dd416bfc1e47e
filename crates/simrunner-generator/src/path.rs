//! Dotted-path descent and array flattening over BSON values.

use bson::Bson;

/// Descend into `value` along `path`, field by field.
///
/// Arrays encountered along the way explode the result: the remaining path is
/// applied element-wise and the results are collected into an array, one level
/// per array crossed. A missing field resolves to `Bson::Null`. Descent stops
/// early at any non-document leaf.
pub fn descend(value: &Bson, path: &[&str]) -> Bson {
    let Some((head, tail)) = path.split_first() else {
        return value.clone();
    };

    match value {
        Bson::Document(doc) => match doc.get(head) {
            None | Some(Bson::Null) => Bson::Null,
            Some(Bson::Array(items)) => Bson::Array(
                items
                    .iter()
                    .map(|item| descend_from(item, tail))
                    .collect(),
            ),
            Some(sub) => descend_from(sub, tail),
        },
        // leaf node, return where we are
        other => other.clone(),
    }
}

// After the head is resolved, the tail still has to be applied to whatever we
// found, including nested arrays.
fn descend_from(value: &Bson, tail: &[&str]) -> Bson {
    if tail.is_empty() {
        return value.clone();
    }
    match value {
        Bson::Array(items) => {
            Bson::Array(items.iter().map(|item| descend_from(item, tail)).collect())
        }
        other => descend(other, tail),
    }
}

/// Recursively flatten nested arrays into a flat list of scalar values.
///
/// `[[1, 2], [3]]` unwinds to `1, 2, 3`. Non-array input unwinds to a
/// single-element list.
pub fn unwind(value: Bson) -> Vec<Bson> {
    match value {
        Bson::Array(items) => items.into_iter().flat_map(unwind).collect(),
        other => vec![other],
    }
}

/// Split a dotted path into its segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('.').collect()
}
