//! Search layer over the resources of a site.
//!
//! This module provides:
//! - `SearchIndex`, the document store and query entry point
//! - query evaluation with BM25 relevance, recency ranking and access rules
//! - snapshot persistence of the indexed documents

mod analyzer;
mod document;
mod engine;
mod manager;
mod persistence;
mod postings;

pub use document::{DocKey, SearchDocument};
pub use engine::{SearchResult, SearchResultItem};
pub use manager::SearchIndex;
pub use persistence::{SEARCH_DIR, SEARCH_SNAPSHOT_FILE, SEARCH_SNAPSHOT_VERSION};
