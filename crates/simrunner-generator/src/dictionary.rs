//! Named dictionaries: pre-loaded lists of candidate values for generators.

use bson::Bson;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Dictionaries are loaded once at template initialization and read-only
/// afterwards. The store itself allows late insertion because
/// collection-backed dictionaries are filled after the remembrance preload
/// (their query may reference remembered values).
#[derive(Debug, Default)]
pub struct DictionaryStore {
    dictionaries: RwLock<BTreeMap<String, Arc<Vec<Bson>>>>,
}

impl DictionaryStore {
    pub fn insert(&self, name: impl Into<String>, values: Vec<Bson>) {
        self.dictionaries
            .write()
            .expect("dictionary lock poisoned")
            .insert(name.into(), Arc::new(values));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dictionaries
            .read()
            .expect("dictionary lock poisoned")
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.dictionaries
            .read()
            .expect("dictionary lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries of the named dictionary, or `None` if unknown.
    pub fn entries(&self, name: &str) -> Option<Arc<Vec<Bson>>> {
        self.dictionaries
            .read()
            .expect("dictionary lock poisoned")
            .get(name)
            .cloned()
    }

    /// Uniformly random entry of the named dictionary.
    pub fn sample<R: Rng>(&self, name: &str, rng: &mut R) -> Option<Bson> {
        let entries = self.entries(name)?;
        if entries.is_empty() {
            return None;
        }
        Some(entries[rng.random_range(0..entries.len())].clone())
    }

    /// Entry at `index % len`, for index-based draws.
    pub fn at(&self, name: &str, index: i64) -> Option<Bson> {
        let entries = self.entries(name)?;
        if entries.is_empty() {
            return None;
        }
        Some(entries[index.rem_euclid(entries.len() as i64) as usize].clone())
    }
}

/// Load a newline-delimited text dictionary.
pub fn load_text_file(path: &Path) -> std::io::Result<Vec<Bson>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(|line| Bson::String(line.to_string()))
        .collect())
}

/// Load a structured JSON dictionary of the form `{ "data": [ ... ] }`.
pub fn load_json_file(path: &Path) -> std::io::Result<Vec<Bson>> {
    let content = std::fs::read_to_string(path)?;
    let json: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();
    data.into_iter()
        .map(|v| {
            Bson::try_from(v)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sample_unknown_dictionary() {
        let store = DictionaryStore::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(store.sample("colors", &mut rng).is_none());
    }

    #[test]
    fn test_sample_draws_from_entries() {
        let store = DictionaryStore::default();
        store.insert("colors", vec![bson!("red"), bson!("green")]);
        let mut rng = StdRng::seed_from_u64(1);
        let drawn = store.sample("colors", &mut rng).unwrap();
        assert!(drawn == bson!("red") || drawn == bson!("green"));
    }

    #[test]
    fn test_at_wraps_around() {
        let store = DictionaryStore::default();
        store.insert("nums", vec![bson!(0), bson!(1), bson!(2)]);
        assert_eq!(store.at("nums", 4), Some(bson!(1)));
        assert_eq!(store.at("nums", 0), Some(bson!(0)));
    }
}
