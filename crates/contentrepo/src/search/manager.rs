//! SearchIndex - document store and query entry point for one site.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;

use super::document::{DocKey, SearchDocument};
use super::engine::{execute, SearchResult, SearchState};
use super::persistence::{
    load_snapshot, write_snapshot, SnapshotLoad, SEARCH_DIR, SEARCH_SNAPSHOT_FILE,
};
use crate::config::SearchConfig;
use crate::error::{RepositoryError, Result};
use crate::query::SearchQuery;
use crate::resource::{normalize_path, Resource, ResourceUri};

/// Full-text and field search over the resources of one site.
///
/// Documents live in memory and are written to a snapshot below
/// `<root>/search/` after every change (or on [`SearchIndex::flush`] when
/// `flush_on_write` is off). Queries share a read lock; changes, `clear`
/// and `close` take the write lock.
#[derive(Debug)]
pub struct SearchIndex {
    site: String,
    snapshot_path: PathBuf,
    config: SearchConfig,
    state: RwLock<Option<SearchState>>,
    dirty: AtomicBool,
    needs_rebuild: AtomicBool,
}

impl SearchIndex {
    pub fn open(root: &Path, site: &str, config: SearchConfig) -> Result<Self> {
        let started = Instant::now();
        let snapshot_path = root.join(SEARCH_DIR).join(SEARCH_SNAPSHOT_FILE);
        let (documents, needs_rebuild) = match load_snapshot(&snapshot_path, site) {
            SnapshotLoad::Loaded(documents) => (documents, false),
            SnapshotLoad::Missing => (Vec::new(), true),
            SnapshotLoad::Invalid => {
                log::warn!(
                    "search snapshot {} is unusable, index needs a rebuild",
                    snapshot_path.display()
                );
                (Vec::new(), true)
            }
        };
        let state = SearchState::from_documents(documents, config.title_boost);

        log::info!(
            "search index open site={} documents={} needs_rebuild={} load_ms={}",
            site,
            state.documents.len(),
            needs_rebuild,
            started.elapsed().as_millis()
        );

        Ok(Self {
            site: site.to_string(),
            snapshot_path,
            config,
            state: RwLock::new(Some(state)),
            dirty: AtomicBool::new(false),
            needs_rebuild: AtomicBool::new(needs_rebuild),
        })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    /// True when no usable snapshot was found on open and nothing has been
    /// flushed since.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    fn closed(&self) -> RepositoryError {
        RepositoryError::Closed(format!("search index {}", self.site))
    }

    fn check_site(&self, site: &str) -> Result<()> {
        if site != self.site {
            return Err(RepositoryError::InvalidInput(format!(
                "site {site} does not match search index site {}",
                self.site
            )));
        }
        Ok(())
    }

    /// Applies `change` under the write lock and persists the result.
    fn modify<T>(&self, change: impl FnOnce(&mut SearchState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| self.closed())?;
        let outcome = change(state)?;
        self.dirty.store(true, Ordering::Release);
        if self.config.flush_on_write {
            self.persist(state)?;
        }
        Ok(outcome)
    }

    fn persist(&self, state: &SearchState) -> Result<()> {
        write_snapshot(
            &self.snapshot_path,
            &self.site,
            state.documents.values(),
            self.config.compression_level,
        )?;
        self.dirty.store(false, Ordering::Release);
        self.needs_rebuild.store(false, Ordering::Release);
        Ok(())
    }

    /// Indexes a resource version, replacing an existing document for it.
    pub fn add(&self, resource: &Resource) -> Result<()> {
        self.check_site(resource.uri.site())?;
        let document = SearchDocument::from_resource(resource)?;
        let title_boost = self.config.title_boost;
        self.modify(|state| {
            if state.insert(document, title_boost).is_some() {
                log::debug!("replaced search document for {}", resource.uri);
            }
            Ok(())
        })
    }

    /// Replaces the document of a resource version entirely.
    pub fn update(&self, resource: &Resource) -> Result<()> {
        self.add(resource)
    }

    fn resolve(state: &SearchState, uri: &ResourceUri) -> Option<DocKey> {
        match (uri.id(), uri.path()) {
            (Some(id), _) => Some(DocKey::new(id, uri.version())),
            (None, Some(path)) => state
                .documents
                .values()
                .find(|document| {
                    document.version == uri.version() && document.path.as_deref() == Some(path)
                })
                .map(SearchDocument::key),
            (None, None) => None,
        }
    }

    /// Removes one version. Returns false if it was not indexed.
    pub fn delete(&self, uri: &ResourceUri) -> Result<bool> {
        self.check_site(uri.site())?;
        self.modify(|state| {
            Ok(Self::resolve(state, uri)
                .and_then(|key| state.remove(&key))
                .is_some())
        })
    }

    /// Points every version of the resource at `new_path`.
    ///
    /// Returns the number of documents changed.
    pub fn move_to(&self, uri: &ResourceUri, new_path: &str) -> Result<usize> {
        self.check_site(uri.site())?;
        let new_path = normalize_path(new_path)?;
        let title_boost = self.config.title_boost;
        self.modify(|state| {
            let Some(key) = Self::resolve(state, uri) else {
                return Ok(0);
            };
            let mut moved = 0;
            for key in state.versions_of(&key.id) {
                if let Some(mut document) = state.remove(&key) {
                    document.path = Some(new_path.clone());
                    state.insert(document, title_boost);
                    moved += 1;
                }
            }
            Ok(moved)
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.modify(|state| {
            state.clear();
            Ok(())
        })?;
        log::info!("cleared search index site={}", self.site);
        Ok(())
    }

    /// Replaces every document with the given resources in one write.
    pub fn rebuild<'a>(&self, resources: impl IntoIterator<Item = &'a Resource>) -> Result<usize> {
        let mut documents = Vec::new();
        for resource in resources {
            self.check_site(resource.uri.site())?;
            documents.push(SearchDocument::from_resource(resource)?);
        }
        let title_boost = self.config.title_boost;
        let count = documents.len();
        self.modify(|state| {
            *state = SearchState::from_documents(documents, title_boost);
            Ok(())
        })?;
        log::info!("rebuilt search index site={} documents={count}", self.site);
        Ok(count)
    }

    /// Runs `query` and returns the requested page of hits.
    pub fn get_by_query(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.check_site(query.site())?;
        query.validate()?;
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.closed())?;
        let result = execute(state, query, self.config.recency_window_days, Utc::now())?;
        log::debug!(
            "search site={} hits={} returned={} time_ms={}",
            self.site,
            result.document_count,
            result.items.len(),
            result.search_time_ms
        );
        Ok(result)
    }

    /// The indexed document of one resource version.
    pub fn document(&self, uri: &ResourceUri) -> Result<Option<SearchDocument>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(Self::resolve(state, uri).and_then(|key| state.documents.get(&key).cloned()))
    }

    /// Keys of every indexed document.
    pub fn keys(&self) -> Result<Vec<DocKey>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(state.documents.keys().cloned().collect())
    }

    /// Number of indexed documents (resource versions).
    pub fn size(&self) -> Result<usize> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(state.documents.len())
    }

    /// Writes the snapshot if anything changed since the last write.
    pub fn flush(&self) -> Result<()> {
        let guard = self.state.write();
        let state = guard.as_ref().ok_or_else(|| self.closed())?;
        if self.dirty.load(Ordering::Acquire) || self.needs_rebuild() {
            self.persist(state)?;
        }
        Ok(())
    }

    /// Flushes and drops the documents. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        if let Some(state) = guard.take() {
            if self.dirty.load(Ordering::Acquire) {
                self.persist(&state)?;
            }
            log::debug!("closed search index site={}", self.site);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Pagelet, User, LIVE, WORK};
    use tempfile::TempDir;

    const SITE: &str = "demo";

    fn open(temp: &TempDir) -> SearchIndex {
        SearchIndex::open(temp.path(), SITE, SearchConfig::default()).expect("open")
    }

    fn page(id: &str, path: &str) -> Resource {
        Resource::page(ResourceUri::new(SITE).with_id(id).with_path(path))
    }

    fn subject_query(subject: &str) -> SearchQuery {
        let mut query = SearchQuery::for_site(SITE);
        query.with_subject(subject);
        query
    }

    #[test]
    fn update_adds_and_removes_subjects() {
        let temp = TempDir::new().expect("tempdir");
        let index = open(&temp);
        let resource = page("p1", "/news").with_subject("old");
        index.add(&resource).expect("add");
        assert_eq!(index.get_by_query(&subject_query("old")).expect("q").document_count, 1);

        let mut updated = resource.clone();
        updated.subjects.clear();
        updated.subjects.insert("fresh".to_string());
        index.update(&updated).expect("update");

        assert_eq!(index.get_by_query(&subject_query("fresh")).expect("q").document_count, 1);
        assert_eq!(index.get_by_query(&subject_query("old")).expect("q").document_count, 0);
        assert_eq!(index.size().expect("size"), 1);
    }

    #[test]
    fn pagelet_property_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let index = open(&temp);
        let resource = page("p1", "/news");
        index.add(&resource).expect("add");

        let with_property = resource.clone().with_pagelet(
            "main",
            Pagelet::new("text", "title").with_property("style", "bold"),
        );
        index.update(&with_property).expect("update");

        let mut query = SearchQuery::for_site(SITE);
        query
            .with_pagelet("text", "title")
            .in_composer("main")
            .expect("composer")
            .and_property("style", "bold")
            .expect("property");
        assert_eq!(index.get_by_query(&query).expect("query").document_count, 1);

        index.update(&resource).expect("update");
        assert_eq!(index.get_by_query(&query).expect("query").document_count, 0);
    }

    #[test]
    fn delete_and_move() {
        let temp = TempDir::new().expect("tempdir");
        let index = open(&temp);
        let live = page("p1", "/a");
        index.add(&live).expect("add");
        let mut work = live.clone();
        work.uri = work.uri.for_version(WORK);
        index.add(&work).expect("add work");

        assert_eq!(
            index
                .move_to(&ResourceUri::new(SITE).with_id("p1"), "/b")
                .expect("move"),
            2
        );
        let mut query = SearchQuery::for_site(SITE);
        query.with_path("/b").expect("path");
        assert_eq!(index.get_by_query(&query).expect("query").document_count, 2);

        let by_path = ResourceUri::new(SITE).with_path("/b").with_version(WORK);
        assert!(index.delete(&by_path).expect("delete"));
        assert!(!index.delete(&by_path).expect("delete again"));
        assert_eq!(index.keys().expect("keys"), vec![DocKey::new("p1", LIVE)]);
    }

    #[test]
    fn documents_survive_reopen() {
        let temp = TempDir::new().expect("tempdir");
        {
            let index = open(&temp);
            assert!(index.needs_rebuild());
            index
                .add(&page("p1", "/a").with_creator(User::new("amelie"), Utc::now()))
                .expect("add");
            assert!(!index.needs_rebuild());
            index.close().expect("close");
            assert!(matches!(index.size(), Err(RepositoryError::Closed(_))));
        }
        let index = open(&temp);
        assert!(!index.needs_rebuild());
        let mut query = SearchQuery::for_site(SITE);
        query.with_creator("amelie");
        assert_eq!(index.get_by_query(&query).expect("query").document_count, 1);
    }

    #[test]
    fn deferred_flush_writes_on_demand() {
        let temp = TempDir::new().expect("tempdir");
        let config = SearchConfig {
            flush_on_write: false,
            ..SearchConfig::default()
        };
        let index = SearchIndex::open(temp.path(), SITE, config.clone()).expect("open");
        index.add(&page("p1", "/a")).expect("add");
        assert!(!temp.path().join(SEARCH_DIR).join(SEARCH_SNAPSHOT_FILE).exists());
        index.flush().expect("flush");

        let reopened = SearchIndex::open(temp.path(), SITE, config).expect("reopen");
        assert_eq!(reopened.size().expect("size"), 1);
    }

    #[test]
    fn foreign_site_query_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let index = open(&temp);
        let query = SearchQuery::for_site("elsewhere");
        assert!(matches!(
            index.get_by_query(&query),
            Err(RepositoryError::InvalidInput(_))
        ));
    }

    #[test]
    fn unfinished_range_is_rejected_before_search() {
        let temp = TempDir::new().expect("tempdir");
        let index = open(&temp);
        index.add(&page("p1", "/news")).expect("add");
        let mut query = SearchQuery::for_site(SITE);
        query
            .with_creation_date_between(Utc::now())
            .expect("between");
        assert!(matches!(
            index.get_by_query(&query),
            Err(RepositoryError::IllegalState(_))
        ));
    }

    #[test]
    fn clear_empties_the_index() {
        let temp = TempDir::new().expect("tempdir");
        let index = open(&temp);
        index.add(&page("p1", "/a")).expect("add");
        index.clear().expect("clear");
        assert_eq!(index.size().expect("size"), 0);
    }
}
