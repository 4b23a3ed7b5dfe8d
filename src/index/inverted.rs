//! Inverted index: tokenized postings for containment queries.

use dashmap::DashMap;
use std::collections::HashSet;

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: DashMap<String, HashSet<String>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_document(&self, doc_id: &str, text: &str) {
        for token in tokenize(text) {
            self.postings.entry(token).or_default().insert(doc_id.to_string());
        }
    }

    pub fn remove_document(&self, doc_id: &str, text: &str) {
        for token in tokenize(text) {
            if let Some(mut bucket) = self.postings.get_mut(&token) {
                bucket.remove(doc_id);
            }
        }
    }

    pub fn contains(&self, term: &str) -> Vec<String> {
        let needle = term.to_lowercase();
        self.postings
            .get(&needle)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.postings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_lookup_finds_indexed_documents() {
        let idx = InvertedIndex::new();
        idx.index_document("doc1", "the quick brown fox");
        idx.index_document("doc2", "a slow brown turtle");
        let mut hits = idx.contains("brown");
        hits.sort();
        assert_eq!(hits, vec!["doc1", "doc2"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let idx = InvertedIndex::new();
        idx.index_document("doc1", "Brown Fox");
        assert_eq!(idx.contains("brown"), vec!["doc1"]);
    }

    #[test]
    fn remove_document_clears_its_postings() {
        let idx = InvertedIndex::new();
        idx.index_document("doc1", "brown fox");
        idx.remove_document("doc1", "brown fox");
        assert!(idx.contains("brown").is_empty());
    }
}
