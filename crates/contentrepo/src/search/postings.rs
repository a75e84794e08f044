//! In-memory inverted index with BM25 scoring.

use std::collections::BTreeMap;
use std::ops::Bound;

use fnv::{FnvHashMap, FnvHashSet};
use thin_vec::ThinVec;

use super::analyzer::tokenize;
use super::document::{DocKey, SearchDocument};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Debug, Default)]
pub(crate) struct Postings {
    /// term -> document -> weighted term frequency
    terms: BTreeMap<String, FnvHashMap<DocKey, u32>>,
    /// Distinct terms per document, for removal.
    doc_terms: FnvHashMap<DocKey, ThinVec<String>>,
    doc_lengths: FnvHashMap<DocKey, u32>,
    total_length: u64,
}

impl Postings {
    /// Indexes `document`, counting title terms `title_boost` times.
    pub fn insert(&mut self, document: &SearchDocument, title_boost: u32) {
        let key = document.key();
        self.remove(&key);

        let mut frequencies: FnvHashMap<String, u32> = FnvHashMap::default();
        let mut length = 0u32;
        for (text, is_title) in document.texts() {
            let weight = if is_title { title_boost.max(1) } else { 1 };
            for term in tokenize(text) {
                *frequencies.entry(term).or_default() += weight;
                length += weight;
            }
        }

        let mut distinct = ThinVec::with_capacity(frequencies.len());
        for (term, frequency) in frequencies {
            self.terms
                .entry(term.clone())
                .or_default()
                .insert(key.clone(), frequency);
            distinct.push(term);
        }
        self.doc_terms.insert(key.clone(), distinct);
        self.doc_lengths.insert(key, length);
        self.total_length += u64::from(length);
    }

    pub fn remove(&mut self, key: &DocKey) {
        let Some(terms) = self.doc_terms.remove(key) else {
            return;
        };
        for term in terms {
            if let Some(documents) = self.terms.get_mut(&term) {
                documents.remove(key);
                if documents.is_empty() {
                    self.terms.remove(&term);
                }
            }
        }
        if let Some(length) = self.doc_lengths.remove(key) {
            self.total_length -= u64::from(length);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn doc_count(&self) -> usize {
        self.doc_lengths.len()
    }

    fn average_length(&self) -> f64 {
        if self.doc_lengths.is_empty() {
            return 0.0;
        }
        self.total_length as f64 / self.doc_lengths.len() as f64
    }

    /// Vocabulary terms a query term stands for.
    fn expand<'a>(&'a self, term: &'a str, wildcard: bool) -> Vec<&'a str> {
        if !wildcard {
            if self.terms.contains_key(term) {
                return vec![term];
            }
            return Vec::new();
        }
        self.terms
            .range::<str, _>((Bound::Included(term), Bound::Unbounded))
            .map(|(candidate, _)| candidate.as_str())
            .take_while(|candidate| candidate.starts_with(term))
            .collect()
    }

    /// Documents containing every query term.
    pub fn matching(&self, terms: &[String], wildcard: bool) -> FnvHashSet<DocKey> {
        let mut matched: Option<FnvHashSet<DocKey>> = None;
        for term in terms {
            let mut documents = FnvHashSet::default();
            for expanded in self.expand(term, wildcard) {
                if let Some(postings) = self.terms.get(expanded) {
                    documents.extend(postings.keys().cloned());
                }
            }
            matched = Some(match matched {
                Some(previous) => previous.intersection(&documents).cloned().collect(),
                None => documents,
            });
            if matched.as_ref().is_some_and(|documents| documents.is_empty()) {
                break;
            }
        }
        matched.unwrap_or_default()
    }

    /// BM25 relevance of `key` for the query terms.
    pub fn score(&self, key: &DocKey, terms: &[String], wildcard: bool) -> f64 {
        let Some(length) = self.doc_lengths.get(key) else {
            return 0.0;
        };
        let total = self.doc_count() as f64;
        let length_norm = 1.0 - BM25_B + BM25_B * f64::from(*length) / self.average_length().max(1.0);

        let mut score = 0.0;
        for term in terms {
            for expanded in self.expand(term, wildcard) {
                let Some(postings) = self.terms.get(expanded) else {
                    continue;
                };
                let Some(frequency) = postings.get(key) else {
                    continue;
                };
                let df = postings.len() as f64;
                let idf = ((total - df + 0.5) / (df + 0.5)).ln_1p().max(0.0);
                let tf = f64::from(*frequency);
                score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * length_norm);
            }
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceUri};

    fn document(id: &str, title: &str, subject: &str) -> SearchDocument {
        let resource = Resource::page(ResourceUri::new("demo").with_id(id))
            .with_title("en", title)
            .with_subject(subject);
        SearchDocument::from_resource(&resource).expect("document")
    }

    #[test]
    fn matching_requires_every_term() {
        let mut postings = Postings::default();
        postings.insert(&document("a", "Rust news", "tech"), 1);
        postings.insert(&document("b", "Football news", "sports"), 1);

        let both = postings.matching(&["news".to_string()], false);
        assert_eq!(both.len(), 2);
        let rust = postings.matching(&["rust".to_string(), "news".to_string()], false);
        assert_eq!(rust.into_iter().collect::<Vec<_>>(), vec![DocKey::new("a", 0)]);
        assert!(postings
            .matching(&["rust".to_string(), "sports".to_string()], false)
            .is_empty());
    }

    #[test]
    fn wildcard_expands_prefixes() {
        let mut postings = Postings::default();
        postings.insert(&document("a", "Football", "sports"), 1);
        postings.insert(&document("b", "Footnotes", "books"), 1);
        postings.insert(&document("c", "Fortune", "books"), 1);

        assert_eq!(postings.matching(&["foot".to_string()], true).len(), 2);
        assert!(postings.matching(&["foot".to_string()], false).is_empty());
    }

    #[test]
    fn title_boost_raises_score() {
        let mut postings = Postings::default();
        postings.insert(&document("a", "Rust", "other"), 3);
        postings.insert(&document("b", "Other", "rust"), 3);
        postings.insert(&document("c", "Unrelated", "misc"), 3);

        let terms = ["rust".to_string()];
        let in_title = postings.score(&DocKey::new("a", 0), &terms, false);
        let in_subject = postings.score(&DocKey::new("b", 0), &terms, false);
        assert!(in_title > in_subject, "{in_title} <= {in_subject}");
    }

    #[test]
    fn reinsert_and_remove_keep_statistics() {
        let mut postings = Postings::default();
        postings.insert(&document("a", "One two", "x"), 1);
        postings.insert(&document("a", "Three", "y"), 1);
        assert_eq!(postings.doc_count(), 1);
        assert!(postings.matching(&["one".to_string()], false).is_empty());

        postings.remove(&DocKey::new("a", 0));
        assert_eq!(postings.doc_count(), 0);
        assert_eq!(postings.total_length, 0);
        assert!(postings.terms.is_empty());
    }
}
