//! Query evaluation over the in-memory document set.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::analyzer::query_terms;
use super::document::{DocKey, SearchDocument};
use super::postings::Postings;
use crate::error::Result;
use crate::query::{text_matches, DateField, Order, SearchQuery, SortField};
use crate::resource::{path_is_within, ResourceFlags, SecurityPrincipal, SimplePrincipal};

/// Candidate count above which filtering and scoring run on the rayon pool.
const PARALLEL_THRESHOLD: usize = 2048;

/// One hit of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub id: String,
    pub path: Option<String>,
    pub version: u64,
    pub resource_type: String,
    pub title: Option<String>,
    /// Full-text relevance (1.0 without a text query).
    pub relevance: f64,
    /// Relevance after recency weighting; equal to `relevance` otherwise.
    pub score: f64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// One page of hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Number of hits before pagination.
    pub document_count: usize,
    pub offset: usize,
    pub limit: Option<usize>,
    pub items: Vec<SearchResultItem>,
    pub search_time_ms: u64,
}

/// Documents of one site plus the inverted index over them.
#[derive(Debug, Default)]
pub(crate) struct SearchState {
    pub documents: BTreeMap<DocKey, SearchDocument>,
    pub postings: Postings,
}

impl SearchState {
    pub fn from_documents(documents: Vec<SearchDocument>, title_boost: u32) -> Self {
        let mut state = Self::default();
        for document in documents {
            state.insert(document, title_boost);
        }
        state
    }

    pub fn insert(&mut self, document: SearchDocument, title_boost: u32) -> Option<SearchDocument> {
        self.postings.insert(&document, title_boost);
        self.documents.insert(document.key(), document)
    }

    pub fn remove(&mut self, key: &DocKey) -> Option<SearchDocument> {
        self.postings.remove(key);
        self.documents.remove(key)
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.postings.clear();
    }

    /// Keys of every version of `id`.
    pub fn versions_of(&self, id: &str) -> Vec<DocKey> {
        self.documents
            .range(DocKey::new(id, 0)..=DocKey::new(id, u64::MAX))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Weight in (0, 1] that halves after `window_days`.
pub(crate) fn recency_factor(
    last_change: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_days: f64,
) -> f64 {
    let Some(last_change) = last_change else {
        return 0.0;
    };
    let age_days = (now - last_change).num_seconds().max(0) as f64 / 86_400.0;
    1.0 / (1.0 + age_days / window_days.max(f64::EPSILON))
}

fn matches_filters(
    document: &SearchDocument,
    query: &SearchQuery,
    principal: &dyn SecurityPrincipal,
) -> Result<bool> {
    if !document.flags.contains(ResourceFlags::INDEXED) {
        return Ok(false);
    }
    if query.id.as_ref().is_some_and(|id| &document.id != id)
        || query.version.is_some_and(|version| document.version != version)
        || query
            .path
            .as_ref()
            .is_some_and(|path| document.path.as_ref() != Some(path))
    {
        return Ok(false);
    }
    if let Some(prefix) = &query.path_prefix {
        match &document.path {
            Some(path) if path_is_within(path, prefix) => {}
            _ => return Ok(false),
        }
    }
    if !query.types.is_empty() && !query.types.contains(&document.resource_type) {
        return Ok(false);
    }
    if query.without_types.contains(&document.resource_type) {
        return Ok(false);
    }
    if query
        .template
        .as_ref()
        .is_some_and(|template| document.template.as_ref() != Some(template))
    {
        return Ok(false);
    }
    if query
        .language
        .as_ref()
        .is_some_and(|language| !document.languages.contains(language))
    {
        return Ok(false);
    }
    if !query.subjects.is_subset(&document.subjects) {
        return Ok(false);
    }

    let user_mismatch = |wanted: &Option<String>, actual: &Option<String>| {
        wanted.as_ref().is_some_and(|wanted| actual.as_ref() != Some(wanted))
    };
    if user_mismatch(&query.creator, &document.creator)
        || user_mismatch(&query.modifier, &document.modifier)
        || user_mismatch(&query.publisher, &document.publisher)
        || user_mismatch(&query.lock_owner, &document.lock_owner)
    {
        return Ok(false);
    }
    if let Some(author) = &query.author {
        if !document.authors().any(|login| login == author) {
            return Ok(false);
        }
    }

    if let Some(filename) = &query.filename {
        if !document
            .content
            .iter()
            .any(|content| content.filename.eq_ignore_ascii_case(filename))
        {
            return Ok(false);
        }
    }
    if let Some(mimetype) = &query.mimetype {
        if !document
            .content
            .iter()
            .any(|content| content.mimetype.eq_ignore_ascii_case(mimetype))
        {
            return Ok(false);
        }
    }

    for (field, filter) in &query.dates {
        if !filter.matches(document.date(*field)) {
            return Ok(false);
        }
    }

    for (name, value) in &query.elements {
        let found = document.pagelets.iter().any(|pagelet| {
            pagelet
                .elements
                .get(name)
                .is_some_and(|text| text.iter().any(|(_, text)| text_matches(text, value)))
        });
        if !found {
            return Ok(false);
        }
    }
    for (name, value) in &query.properties {
        if !document
            .pagelets
            .iter()
            .any(|pagelet| pagelet.properties.get(name) == Some(value))
        {
            return Ok(false);
        }
    }
    for criterion in &query.pagelets {
        if !document.pagelets.iter().any(|pagelet| criterion.matches(pagelet)) {
            return Ok(false);
        }
    }

    if let Some(action) = &query.action {
        return document.security.evaluate(principal, action);
    }
    Ok(true)
}

struct Hit<'a> {
    document: &'a SearchDocument,
    relevance: f64,
    score: f64,
}

fn sort_date(field: SortField) -> Option<DateField> {
    match field {
        SortField::Relevance => None,
        SortField::CreationDate => Some(DateField::Creation),
        SortField::ModificationDate => Some(DateField::Modification),
        SortField::PublishingDate => Some(DateField::Publishing),
    }
}

fn compare_hits(a: &Hit<'_>, b: &Hit<'_>, sort: (SortField, Order)) -> Ordering {
    let by_score = b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
    let primary = match sort_date(sort.0) {
        None => by_score,
        Some(field) => {
            // Documents without the date go last in either order.
            let by_date = match (a.document.date(field), b.document.date(field)) {
                (Some(a), Some(b)) => match sort.1 {
                    Order::Ascending => a.cmp(&b),
                    Order::Descending => b.cmp(&a),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_date.then(by_score)
        }
    };
    primary
        .then_with(|| a.document.id.cmp(&b.document.id))
        .then_with(|| a.document.version.cmp(&b.document.version))
}

struct Evaluator<'a> {
    state: &'a SearchState,
    query: &'a SearchQuery,
    principal: &'a dyn SecurityPrincipal,
    text: Option<(Vec<String>, bool)>,
    recency_window_days: f64,
    now: DateTime<Utc>,
}

impl<'a> Evaluator<'a> {
    fn hit(&self, document: &'a SearchDocument) -> Result<Option<Hit<'a>>> {
        if !matches_filters(document, self.query, self.principal)? {
            return Ok(None);
        }
        let relevance = match &self.text {
            Some((terms, wildcard)) => self.state.postings.score(&document.key(), terms, *wildcard),
            None => 1.0,
        };
        let score = if self.query.recency_priority {
            relevance * recency_factor(document.last_change(), self.now, self.recency_window_days)
        } else {
            relevance
        };
        Ok(Some(Hit {
            document,
            relevance,
            score,
        }))
    }
}

/// Evaluates `query` against `state`.
pub(crate) fn execute(
    state: &SearchState,
    query: &SearchQuery,
    recency_window_days: f64,
    now: DateTime<Utc>,
) -> Result<SearchResult> {
    let started = Instant::now();
    let anonymous = SimplePrincipal::anonymous();
    let principal: &dyn SecurityPrincipal = match &query.principal {
        Some(principal) => principal.as_ref(),
        None => &anonymous,
    };

    // A text query without any terms matches nothing.
    let text = query
        .text
        .as_ref()
        .map(|text| (query_terms(&text.text), text.wildcard));

    let candidates: Vec<&SearchDocument> = match &text {
        Some((terms, wildcard)) => {
            let matched = state.postings.matching(terms, *wildcard);
            state
                .documents
                .iter()
                .filter(|(key, _)| matched.contains(*key))
                .map(|(_, document)| document)
                .collect()
        }
        None => state.documents.values().collect(),
    };

    let evaluator = Evaluator {
        state,
        query,
        principal,
        text,
        recency_window_days,
        now,
    };
    let evaluated: Vec<Option<Hit<'_>>> = if candidates.len() > PARALLEL_THRESHOLD {
        candidates
            .par_iter()
            .map(|document| evaluator.hit(*document))
            .collect::<Result<_>>()?
    } else {
        candidates
            .iter()
            .map(|document| evaluator.hit(*document))
            .collect::<Result<_>>()?
    };
    let mut hits = evaluated.into_iter().flatten().collect::<Vec<_>>();
    hits.sort_by(|a, b| compare_hits(a, b, query.sort));

    let title_languages = query
        .language
        .iter()
        .chain(&query.site_languages)
        .collect::<Vec<_>>();
    let document_count = hits.len();
    let items = hits
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .map(|hit| SearchResultItem {
            id: hit.document.id.clone(),
            path: hit.document.path.clone(),
            version: hit.document.version,
            resource_type: hit.document.resource_type.clone(),
            title: hit.document.title_in(&title_languages),
            relevance: hit.relevance,
            score: hit.score,
            modified_at: hit.document.modified_at,
        })
        .collect();

    Ok(SearchResult {
        document_count,
        offset: query.offset,
        limit: query.limit,
        items,
        search_time_ms: started.elapsed().as_millis() as u64,
    })
}
