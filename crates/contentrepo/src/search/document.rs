//! Denormalized search view of one resource version.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::DateField;
use crate::resource::{
    AccessRules, Language, LocalizedText, Pagelet, Resource, ResourceContent, ResourceFlags, User,
};

/// Identity of a search document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub id: String,
    pub version: u64,
}

impl DocKey {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    pub version: u64,
    pub path: Option<String>,
    pub resource_type: String,
    pub title: LocalizedText,
    pub description: LocalizedText,
    pub coverage: LocalizedText,
    pub rights: LocalizedText,
    pub subjects: BTreeSet<String>,
    pub creator: Option<String>,
    pub modifier: Option<String>,
    pub publisher: Option<String>,
    pub lock_owner: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub template: Option<String>,
    pub flags: ResourceFlags,
    pub languages: BTreeSet<Language>,
    pub pagelets: Vec<Pagelet>,
    pub content: Vec<ResourceContent>,
    pub security: AccessRules,
}

fn login(user: Option<&User>) -> Option<String> {
    user.map(|user| user.login.clone())
}

impl SearchDocument {
    /// Copies every searchable field out of `resource`.
    pub fn from_resource(resource: &Resource) -> Result<Self> {
        let id = resource.uri.require_id()?.to_string();
        Ok(Self {
            id,
            version: resource.uri.version(),
            path: resource.uri.path().map(str::to_string),
            resource_type: resource.resource_type().to_string(),
            title: resource.title.clone(),
            description: resource.description.clone(),
            coverage: resource.coverage.clone(),
            rights: resource.rights.clone(),
            subjects: resource.subjects.clone(),
            creator: login(resource.creator.as_ref()),
            modifier: login(resource.modifier.as_ref()),
            publisher: login(resource.publisher.as_ref()),
            lock_owner: login(resource.lock_owner.as_ref()),
            created_at: resource.created_at,
            modified_at: resource.modified_at,
            published_at: resource.published_at,
            template: resource.template.clone(),
            flags: resource.flags,
            languages: resource.languages(),
            pagelets: resource.pagelets.clone(),
            content: resource.content.clone(),
            security: resource.security.clone(),
        })
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(&self.id, self.version)
    }

    pub fn date(&self, field: DateField) -> Option<DateTime<Utc>> {
        match field {
            DateField::Creation => self.created_at,
            DateField::Modification => self.modified_at,
            DateField::Publishing => self.published_at,
        }
    }

    /// Date the resource last changed, used for recency ranking.
    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.modified_at.or(self.created_at)
    }

    /// Text indexed for full-text search as `(text, is_title)`.
    pub fn texts(&self) -> Vec<(&str, bool)> {
        let mut texts = Vec::new();
        texts.extend(self.title.iter().map(|(_, text)| (text, true)));
        for field in [&self.description, &self.coverage, &self.rights] {
            texts.extend(field.iter().map(|(_, text)| (text, false)));
        }
        texts.extend(self.subjects.iter().map(|subject| (subject.as_str(), false)));
        for pagelet in &self.pagelets {
            for element in pagelet.elements.values() {
                texts.extend(element.iter().map(|(_, text)| (text, false)));
            }
            texts.extend(pagelet.properties.values().map(|value| (value.as_str(), false)));
        }
        texts.extend(
            self.content
                .iter()
                .map(|content| (content.filename.as_str(), false)),
        );
        texts
    }

    /// Creator, modifier and every pagelet owner.
    pub fn authors(&self) -> impl Iterator<Item = &str> {
        self.creator
            .as_deref()
            .into_iter()
            .chain(self.modifier.as_deref())
            .chain(
                self.pagelets
                    .iter()
                    .filter_map(|pagelet| pagelet.owner.as_ref().map(|owner| owner.login.as_str())),
            )
    }

    /// Title in the first of `languages` that has one, else in any language.
    pub fn title_in(&self, languages: &[&Language]) -> Option<String> {
        languages
            .iter()
            .find_map(|language| self.title.get(language))
            .or_else(|| self.title.iter().next().map(|(_, text)| text))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceUri;
    use chrono::TimeZone;

    #[test]
    fn document_copies_searchable_fields() {
        let at = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).single().expect("date");
        let resource = Resource::page(
            ResourceUri::new("demo")
                .with_id("p1")
                .with_path("/a")
                .with_version(1),
        )
        .with_title("de", "Nachrichten")
        .with_subject("sport")
        .with_creator(User::new("amelie"), at)
        .with_pagelet(
            "main",
            Pagelet::new("text", "body")
                .with_owner(User::new("bert"))
                .with_element("text", "de", "Hallo"),
        );

        let document = SearchDocument::from_resource(&resource).expect("document");
        assert_eq!(document.key(), DocKey::new("p1", 1));
        assert_eq!(document.creator.as_deref(), Some("amelie"));
        assert_eq!(document.last_change(), Some(at));
        assert_eq!(document.authors().collect::<Vec<_>>(), vec!["amelie", "bert"]);
        assert_eq!(
            document.title_in(&[&Language::new("en")]).as_deref(),
            Some("Nachrichten")
        );
        assert!(document.texts().contains(&("Hallo", false)));
        assert!(document.texts().contains(&("Nachrichten", true)));
    }

    #[test]
    fn document_needs_identifier() {
        let resource = Resource::page(ResourceUri::new("demo").with_path("/a"));
        assert!(SearchDocument::from_resource(&resource).is_err());
    }
}
