//! Criteria values accumulated by [`super::SearchQuery`].

use std::fmt;

use chrono::{DateTime, Utc};

use crate::resource::Pagelet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Order {
    Ascending,
    #[default]
    Descending,
}

/// What a result page is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortField {
    #[default]
    Relevance,
    CreationDate,
    ModificationDate,
    PublishingDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DateField {
    Creation,
    Modification,
    Publishing,
}

impl DateField {
    pub fn name(self) -> &'static str {
        match self {
            Self::Creation => "creation date",
            Self::Modification => "modification date",
            Self::Publishing => "publishing date",
        }
    }
}

impl fmt::Display for DateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A constraint on one date field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    /// Matches any instant on the same UTC calendar day.
    Exact(DateTime<Utc>),
    /// Inclusive range. A missing end is open.
    Between {
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    },
}

impl DateFilter {
    pub fn matches(&self, value: Option<DateTime<Utc>>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match *self {
            Self::Exact(day) => value.date_naive() == day.date_naive(),
            Self::Between { from, to } => value >= from && to.map_or(true, |to| value <= to),
        }
    }
}

/// Free text to match against every text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextQuery {
    pub text: String,
    /// Treat every term as a prefix.
    pub wildcard: bool,
}

/// Constraints on one pagelet of a page.
///
/// All constraints have to hold for the same pagelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageletCriterion {
    pub module: String,
    pub id: String,
    pub composer: Option<String>,
    pub position: Option<usize>,
    pub properties: Vec<(String, String)>,
    pub elements: Vec<(String, String)>,
}

impl PageletCriterion {
    pub fn new(module: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            id: id.into(),
            composer: None,
            position: None,
            properties: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn matches(&self, pagelet: &Pagelet) -> bool {
        pagelet.module == self.module
            && pagelet.id == self.id
            && self
                .composer
                .as_ref()
                .map_or(true, |composer| &pagelet.composer == composer)
            && self.position.map_or(true, |position| pagelet.position == position)
            && self
                .properties
                .iter()
                .all(|(name, value)| pagelet.properties.get(name) == Some(value))
            && self.elements.iter().all(|(name, value)| {
                pagelet
                    .elements
                    .get(name)
                    .is_some_and(|text| text.iter().any(|(_, text)| text_matches(text, value)))
            })
    }
}

/// Case-insensitive match of an element value, ignoring surrounding space.
pub(crate) fn text_matches(stored: &str, wanted: &str) -> bool {
    stored.trim().to_lowercase() == wanted.trim().to_lowercase()
}
