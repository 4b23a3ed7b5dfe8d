//! Composite-key B-tree index: equality and ordered range scans, with
//! optional uniqueness enforcement.

use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

const KEY_SEPARATOR: char = '\u{1}';

/// Encodes field values into a composite key. The separator is a control
/// character that cannot appear in JSON string values typed by users.
pub fn encode_key(values: &[JsonValue]) -> String {
    values
        .iter()
        .map(json_to_sortable_string)
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string())
}

fn json_to_sortable_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => format!("{:020}", n.as_f64().unwrap_or(0.0) as i64),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
pub struct BTreeIndex {
    unique: bool,
    entries: RwLock<BTreeMap<String, HashSet<String>>>,
}

impl BTreeIndex {
    pub fn new(unique: bool) -> Self {
        Self {
            unique,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, key: &str, doc_id: &str) -> DbResult<()> {
        let mut entries = self.entries.write().unwrap();
        let bucket = entries.entry(key.to_string()).or_default();
        if self.unique && !bucket.is_empty() && !bucket.contains(doc_id) {
            return Err(DbError::conflict(format!(
                "unique index violation for key '{key}'"
            )));
        }
        bucket.insert(doc_id.to_string());
        Ok(())
    }

    pub fn remove(&self, key: &str, doc_id: &str) {
        let mut entries = self.entries.write().unwrap();
        if let Some(bucket) = entries.get_mut(key) {
            bucket.remove(doc_id);
            if bucket.is_empty() {
                entries.remove(key);
            }
        }
    }

    pub fn lookup_eq(&self, key: &str) -> Vec<String> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Inclusive range scan over the composite key's lexicographic order.
    pub fn lookup_range(&self, lower: Option<&str>, upper: Option<&str>) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        let range = match (lower, upper) {
            (Some(l), Some(u)) => entries.range(l.to_string()..=u.to_string()),
            (Some(l), None) => entries.range(l.to_string()..),
            (None, Some(u)) => entries.range(..=u.to_string()),
            (None, None) => entries.range(..),
        };
        range.flat_map(|(_, bucket)| bucket.iter().cloned()).collect()
    }

    pub fn cardinality(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_lookup_returns_matching_ids() {
        let idx = BTreeIndex::new(false);
        idx.insert(&encode_key(&[json!("alice")]), "doc1").unwrap();
        idx.insert(&encode_key(&[json!("alice")]), "doc2").unwrap();
        let mut hits = idx.lookup_eq(&encode_key(&[json!("alice")]));
        hits.sort();
        assert_eq!(hits, vec!["doc1", "doc2"]);
    }

    #[test]
    fn unique_index_rejects_a_second_distinct_document() {
        let idx = BTreeIndex::new(true);
        idx.insert("k1", "doc1").unwrap();
        assert!(idx.insert("k1", "doc2").is_err());
    }

    #[test]
    fn unique_index_allows_reinserting_the_same_document() {
        let idx = BTreeIndex::new(true);
        idx.insert("k1", "doc1").unwrap();
        assert!(idx.insert("k1", "doc1").is_ok());
    }

    #[test]
    fn range_scan_respects_bounds() {
        let idx = BTreeIndex::new(false);
        idx.insert("a", "doc_a").unwrap();
        idx.insert("m", "doc_m").unwrap();
        idx.insert("z", "doc_z").unwrap();
        let hits = idx.lookup_range(Some("b"), Some("y"));
        assert_eq!(hits, vec!["doc_m".to_string()]);
    }

    #[test]
    fn remove_drops_empty_buckets() {
        let idx = BTreeIndex::new(false);
        idx.insert("k1", "doc1").unwrap();
        idx.remove("k1", "doc1");
        assert_eq!(idx.cardinality(), 0);
    }
}
