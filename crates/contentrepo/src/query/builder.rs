//! Fluent search query.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::criteria::{DateField, DateFilter, Order, PageletCriterion, SortField, TextQuery};
use crate::error::{RepositoryError, Result};
use crate::resource::{normalize_path, Language, SecurityPrincipal, SiteContext, TemplateRef};

/// Structured query against a site's search index.
///
/// Setters accumulate criteria, all of which have to match. Calls that
/// depend on an earlier call (`and` after a `..._between`, pagelet details
/// after `with_pagelet`) fail immediately with `IllegalState` and leave the
/// query as it was.
#[derive(Clone)]
pub struct SearchQuery {
    pub(crate) site: String,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: usize,
    pub(crate) text: Option<TextQuery>,
    pub(crate) elements: Vec<(String, String)>,
    pub(crate) properties: Vec<(String, String)>,
    pub(crate) language: Option<Language>,
    /// Title languages of result items, default language first.
    pub(crate) site_languages: Vec<Language>,
    pub(crate) subjects: BTreeSet<String>,
    pub(crate) author: Option<String>,
    pub(crate) creator: Option<String>,
    pub(crate) modifier: Option<String>,
    pub(crate) publisher: Option<String>,
    pub(crate) lock_owner: Option<String>,
    pub(crate) dates: BTreeMap<DateField, DateFilter>,
    pending_range: Option<DateField>,
    pub(crate) id: Option<String>,
    pub(crate) version: Option<u64>,
    pub(crate) path: Option<String>,
    pub(crate) path_prefix: Option<String>,
    pub(crate) template: Option<String>,
    pub(crate) pagelets: Vec<PageletCriterion>,
    pub(crate) types: BTreeSet<String>,
    pub(crate) without_types: BTreeSet<String>,
    pub(crate) filename: Option<String>,
    pub(crate) mimetype: Option<String>,
    pub(crate) action: Option<String>,
    pub(crate) principal: Option<Arc<dyn SecurityPrincipal>>,
    pub(crate) recency_priority: bool,
    pub(crate) sort: (SortField, Order),
}

impl fmt::Debug for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchQuery")
            .field("site", &self.site)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("text", &self.text)
            .field("subjects", &self.subjects)
            .field("dates", &self.dates)
            .field("path_prefix", &self.path_prefix)
            .field("pagelets", &self.pagelets)
            .field("types", &self.types)
            .field("action", &self.action)
            .field(
                "principal",
                &self.principal.as_ref().map(|principal| principal.login()),
            )
            .field("recency_priority", &self.recency_priority)
            .field("sort", &self.sort)
            .finish_non_exhaustive()
    }
}

impl SearchQuery {
    /// Query for `site`; result titles prefer the site's languages.
    pub fn new(site: &dyn SiteContext) -> Self {
        let mut query = Self::for_site(site.identifier());
        query.site_languages.push(site.default_language());
        for language in site.languages() {
            if !query.site_languages.contains(&language) {
                query.site_languages.push(language);
            }
        }
        query
    }

    pub fn for_site(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            limit: None,
            offset: 0,
            text: None,
            elements: Vec::new(),
            properties: Vec::new(),
            language: None,
            site_languages: Vec::new(),
            subjects: BTreeSet::new(),
            author: None,
            creator: None,
            modifier: None,
            publisher: None,
            lock_owner: None,
            dates: BTreeMap::new(),
            pending_range: None,
            id: None,
            version: None,
            path: None,
            path_prefix: None,
            template: None,
            pagelets: Vec::new(),
            types: BTreeSet::new(),
            without_types: BTreeSet::new(),
            filename: None,
            mimetype: None,
            action: None,
            principal: None,
            recency_priority: false,
            sort: (SortField::Relevance, Order::Descending),
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_recency_priority(&self) -> bool {
        self.recency_priority
    }

    pub fn sort(&self) -> (SortField, Order) {
        self.sort
    }

    pub fn with_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(&mut self, offset: usize) -> &mut Self {
        self.offset = offset;
        self
    }

    /// Matches resources containing every term of `text`.
    pub fn with_text(&mut self, text: impl Into<String>, wildcard: bool) -> &mut Self {
        self.text = Some(TextQuery {
            text: text.into(),
            wildcard,
        });
        self
    }

    /// Matches resources with a pagelet element `name` equal to `value`.
    pub fn with_element(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.elements.push((name.into(), value.into()));
        self
    }

    /// Matches resources with a pagelet property `name` set to `value`.
    pub fn with_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    pub fn with_language(&mut self, language: impl Into<Language>) -> &mut Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.subjects.insert(subject.into());
        self
    }

    /// Matches the creator, the modifier or the owner of any pagelet.
    pub fn with_author(&mut self, login: impl Into<String>) -> &mut Self {
        self.author = Some(login.into());
        self
    }

    pub fn with_creator(&mut self, login: impl Into<String>) -> &mut Self {
        self.creator = Some(login.into());
        self
    }

    pub fn with_modifier(&mut self, login: impl Into<String>) -> &mut Self {
        self.modifier = Some(login.into());
        self
    }

    pub fn with_publisher(&mut self, login: impl Into<String>) -> &mut Self {
        self.publisher = Some(login.into());
        self
    }

    pub fn with_lock_owner(&mut self, login: impl Into<String>) -> &mut Self {
        self.lock_owner = Some(login.into());
        self
    }

    fn set_exact_date(&mut self, field: DateField, date: DateTime<Utc>) -> &mut Self {
        if self.pending_range == Some(field) {
            self.pending_range = None;
        }
        self.dates.insert(field, DateFilter::Exact(date));
        self
    }

    fn open_range(&mut self, field: DateField, from: DateTime<Utc>) -> Result<&mut Self> {
        if let Some(pending) = self.pending_range {
            return Err(RepositoryError::IllegalState(format!(
                "{pending} range is still waiting for its end date"
            )));
        }
        self.dates
            .insert(field, DateFilter::Between { from, to: None });
        self.pending_range = Some(field);
        Ok(self)
    }

    pub fn with_creation_date(&mut self, date: DateTime<Utc>) -> &mut Self {
        self.set_exact_date(DateField::Creation, date)
    }

    pub fn with_modification_date(&mut self, date: DateTime<Utc>) -> &mut Self {
        self.set_exact_date(DateField::Modification, date)
    }

    pub fn with_publishing_date(&mut self, date: DateTime<Utc>) -> &mut Self {
        self.set_exact_date(DateField::Publishing, date)
    }

    /// Starts a creation date range; finish it with [`SearchQuery::and`].
    pub fn with_creation_date_between(&mut self, from: DateTime<Utc>) -> Result<&mut Self> {
        self.open_range(DateField::Creation, from)
    }

    pub fn with_modification_date_between(&mut self, from: DateTime<Utc>) -> Result<&mut Self> {
        self.open_range(DateField::Modification, from)
    }

    pub fn with_publishing_date_between(&mut self, from: DateTime<Utc>) -> Result<&mut Self> {
        self.open_range(DateField::Publishing, from)
    }

    /// Sets the end of the range opened by the last `..._between` call.
    pub fn and(&mut self, to: DateTime<Utc>) -> Result<&mut Self> {
        let Some(field) = self.pending_range else {
            return Err(RepositoryError::IllegalState(
                "and() needs a preceding date range".to_string(),
            ));
        };
        let Some(DateFilter::Between { from, .. }) = self.dates.get(&field).copied() else {
            return Err(RepositoryError::IllegalState(format!(
                "no open {field} range"
            )));
        };
        if to < from {
            return Err(RepositoryError::IllegalState(format!(
                "{field} range ends at {to} before it starts at {from}"
            )));
        }
        self.dates
            .insert(field, DateFilter::Between { from, to: Some(to) });
        self.pending_range = None;
        Ok(self)
    }

    pub fn with_identifier(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_version(&mut self, version: u64) -> &mut Self {
        self.version = Some(version);
        self
    }

    pub fn with_path(&mut self, path: &str) -> Result<&mut Self> {
        self.path = Some(normalize_path(path)?);
        Ok(self)
    }

    /// Matches the resource at `prefix` and everything below it.
    pub fn with_path_prefix(&mut self, prefix: &str) -> Result<&mut Self> {
        self.path_prefix = Some(normalize_path(prefix)?);
        Ok(self)
    }

    pub fn with_template(&mut self, template: &(impl TemplateRef + ?Sized)) -> &mut Self {
        self.template = Some(template.identifier().to_string());
        self
    }

    /// Starts a pagelet criterion refined by the `in_composer`,
    /// `at_position`, `and_property` and `and_element` calls that follow.
    pub fn with_pagelet(&mut self, module: impl Into<String>, id: impl Into<String>) -> &mut Self {
        self.pagelets.push(PageletCriterion::new(module, id));
        self
    }

    fn current_pagelet(&mut self, call: &str) -> Result<&mut PageletCriterion> {
        self.pagelets.last_mut().ok_or_else(|| {
            RepositoryError::IllegalState(format!("{call}() needs a preceding with_pagelet()"))
        })
    }

    pub fn in_composer(&mut self, composer: impl Into<String>) -> Result<&mut Self> {
        self.current_pagelet("in_composer")?.composer = Some(composer.into());
        Ok(self)
    }

    pub fn at_position(&mut self, position: usize) -> Result<&mut Self> {
        let pagelet = self.current_pagelet("at_position")?;
        if pagelet.composer.is_none() {
            return Err(RepositoryError::IllegalState(
                "at_position() needs a preceding in_composer()".to_string(),
            ));
        }
        pagelet.position = Some(position);
        Ok(self)
    }

    pub fn and_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self> {
        self.current_pagelet("and_property")?
            .properties
            .push((name.into(), value.into()));
        Ok(self)
    }

    pub fn and_element(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self> {
        self.current_pagelet("and_element")?
            .elements
            .push((name.into(), value.into()));
        Ok(self)
    }

    pub fn with_types<I, S>(&mut self, types: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn without_types<I, S>(&mut self, types: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.without_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_filename(&mut self, filename: impl Into<String>) -> &mut Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mimetype(&mut self, mimetype: impl Into<String>) -> &mut Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    /// Only returns resources the query's principal may perform `action` on.
    pub fn with_action(&mut self, action: impl Into<String>) -> &mut Self {
        self.action = Some(action.into());
        self
    }

    /// Principal checked by [`SearchQuery::with_action`]; anonymous if unset.
    pub fn with_principal(&mut self, principal: Arc<dyn SecurityPrincipal>) -> &mut Self {
        self.principal = Some(principal);
        self
    }

    /// Ranks recently created or modified resources higher.
    pub fn with_recency_priority(&mut self) -> &mut Self {
        self.recency_priority = true;
        self
    }

    pub fn sort_by_publishing_date(&mut self, order: Order) -> &mut Self {
        self.sort = (SortField::PublishingDate, order);
        self
    }

    pub fn sort_by_creation_date(&mut self, order: Order) -> &mut Self {
        self.sort = (SortField::CreationDate, order);
        self
    }

    pub fn sort_by_modification_date(&mut self, order: Order) -> &mut Self {
        self.sort = (SortField::ModificationDate, order);
        self
    }

    /// Checks that the query is complete enough to run.
    ///
    /// A `..._between` range still waiting for its [`SearchQuery::and`] is an
    /// `IllegalState`.
    pub fn validate(&self) -> Result<()> {
        match self.pending_range {
            Some(field) => Err(RepositoryError::IllegalState(format!(
                "{field} range has no end date, call and() before searching"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Site;
    use chrono::TimeZone;

    fn query() -> SearchQuery {
        SearchQuery::new(&Site::new("demo", "en"))
    }

    fn day(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0)
            .single()
            .expect("date")
    }

    #[test]
    fn range_needs_between_first() {
        let mut query = query();
        assert!(matches!(
            query.and(day(1)),
            Err(RepositoryError::IllegalState(_))
        ));
    }

    #[test]
    fn range_end_before_start_fails() {
        let mut query = query();
        query
            .with_creation_date_between(day(20))
            .expect("between");
        assert!(matches!(
            query.and(day(10)),
            Err(RepositoryError::IllegalState(_))
        ));

        // The range is still open for a valid end date.
        query.and(day(25)).expect("and");
        assert_eq!(
            query.dates.get(&DateField::Creation),
            Some(&DateFilter::Between {
                from: day(20),
                to: Some(day(25))
            })
        );
    }

    #[test]
    fn and_twice_fails() {
        let mut query = query();
        query
            .with_publishing_date_between(day(1))
            .expect("between")
            .and(day(2))
            .expect("and");
        assert!(matches!(
            query.and(day(3)),
            Err(RepositoryError::IllegalState(_))
        ));
    }

    #[test]
    fn exact_then_and_fails() {
        let mut query = query();
        query.with_creation_date(day(5));
        assert!(query.and(day(6)).is_err());
    }

    #[test]
    fn unfinished_range_fails_validation() {
        let mut query = query();
        query.validate().expect("empty query");
        query
            .with_creation_date_between(day(1))
            .expect("between");
        assert!(matches!(
            query.validate(),
            Err(RepositoryError::IllegalState(_))
        ));
        query.and(day(2)).expect("and");
        query.validate().expect("closed range");
    }

    #[test]
    fn site_languages_start_with_the_default() {
        let query = SearchQuery::new(&Site::new("demo", "de").with_language("en"));
        assert_eq!(query.site(), "demo");
        assert_eq!(
            query.site_languages,
            vec![Language::new("de"), Language::new("en")]
        );
        assert!(SearchQuery::for_site("demo").site_languages.is_empty());
    }

    #[test]
    fn template_accepts_any_template_ref() {
        let mut query = query();
        query.with_template("article");
        assert_eq!(query.template.as_deref(), Some("article"));
        query.with_template(&String::from("home"));
        assert_eq!(query.template.as_deref(), Some("home"));
    }

    #[test]
    fn second_range_waits_for_first() {
        let mut query = query();
        query
            .with_creation_date_between(day(1))
            .expect("between");
        assert!(query.with_modification_date_between(day(2)).is_err());
    }

    #[test]
    fn last_date_call_wins_per_field() {
        let mut query = query();
        query
            .with_creation_date_between(day(1))
            .expect("between");
        query.with_creation_date(day(9));
        assert_eq!(
            query.dates.get(&DateField::Creation),
            Some(&DateFilter::Exact(day(9)))
        );
        // The exact date closed the pending range.
        query
            .with_modification_date_between(day(2))
            .expect("between");
    }

    #[test]
    fn pagelet_details_need_pagelet() {
        let mut query = query();
        assert!(query.in_composer("main").is_err());
        assert!(query.and_property("a", "b").is_err());
        assert!(query.and_element("a", "b").is_err());
        assert!(query.at_position(0).is_err());

        query.with_pagelet("text", "title");
        assert!(query.at_position(0).is_err());
        query
            .in_composer("main")
            .expect("composer")
            .at_position(1)
            .expect("position")
            .and_property("level", "1")
            .expect("property");
        let criterion = &query.pagelets[0];
        assert_eq!(criterion.composer.as_deref(), Some("main"));
        assert_eq!(criterion.position, Some(1));
        assert_eq!(criterion.properties.len(), 1);
    }

    #[test]
    fn subjects_accumulate_without_duplicates() {
        let mut query = query();
        query
            .with_subject("sports")
            .with_subject("news")
            .with_subject("sports");
        assert_eq!(query.subjects.len(), 2);
    }

    #[test]
    fn paths_are_normalized() {
        let mut query = query();
        query.with_path_prefix("news/").expect("prefix");
        assert_eq!(query.path_prefix.as_deref(), Some("/news"));
        assert!(query.with_path("").is_err());
    }
}
