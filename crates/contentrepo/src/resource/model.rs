//! Typed resource records as handed to the indexes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::TemplateRef;
use super::security::AccessRules;
use super::uri::ResourceUri;

/// Resource type used for pages.
pub const PAGE_TYPE: &str = "page";

/// Resource type used for generic files.
pub const FILE_TYPE: &str = "file";

/// Resource type used for images.
pub const IMAGE_TYPE: &str = "image";

/// Lowercase ISO language code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Language(String);

impl Language {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_lowercase())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Language {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text available in one or more languages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText(BTreeMap<Language, String>);

impl LocalizedText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, language: impl Into<Language>, text: impl Into<String>) -> Self {
        self.set(language, text);
        self
    }

    pub fn set(&mut self, language: impl Into<Language>, text: impl Into<String>) {
        self.0.insert(language.into(), text.into());
    }

    pub fn get(&self, language: &Language) -> Option<&str> {
        self.0.get(language).map(String::as_str)
    }

    /// Returns the text in `language`, falling back to any available language.
    pub fn get_or_any(&self, language: &Language) -> Option<&str> {
        self.get(language)
            .or_else(|| self.0.values().next().map(String::as_str))
    }

    pub fn languages(&self) -> impl Iterator<Item = &Language> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Language, &str)> {
        self.0.iter().map(|(language, text)| (language, text.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub name: Option<String>,
}

impl User {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ResourceFlags: u8 {
        /// Featured in listings and teasers.
        const PROMOTED = 1;
        /// Visible to search.
        const INDEXED = 1 << 1;
    }
}

/// A content unit placed in a composer region of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagelet {
    pub module: String,
    pub id: String,
    pub composer: String,
    pub position: usize,
    pub owner: Option<User>,
    pub properties: BTreeMap<String, String>,
    pub elements: BTreeMap<String, LocalizedText>,
}

impl Pagelet {
    pub fn new(module: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            id: id.into(),
            composer: String::new(),
            position: 0,
            owner: None,
            properties: BTreeMap::new(),
            elements: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_element(
        mut self,
        name: impl Into<String>,
        language: impl Into<Language>,
        value: impl Into<String>,
    ) -> Self {
        self.elements
            .entry(name.into())
            .or_default()
            .set(language, value);
        self
    }

    pub fn with_owner(mut self, owner: User) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// Binary content attached to a resource (one per language at most).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub language: Option<Language>,
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: ResourceUri,
    pub title: LocalizedText,
    pub description: LocalizedText,
    pub coverage: LocalizedText,
    pub rights: LocalizedText,
    pub subjects: BTreeSet<String>,
    pub creator: Option<User>,
    pub modifier: Option<User>,
    pub publisher: Option<User>,
    pub lock_owner: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub publish_until: Option<DateTime<Utc>>,
    pub template: Option<String>,
    pub flags: ResourceFlags,
    pub pagelets: Vec<Pagelet>,
    pub content: Vec<ResourceContent>,
    pub security: AccessRules,
}

impl Resource {
    /// Creates an empty resource of the given type at `uri`.
    pub fn new(resource_type: &str, uri: ResourceUri) -> Self {
        Self {
            uri: uri.with_type(resource_type),
            title: LocalizedText::new(),
            description: LocalizedText::new(),
            coverage: LocalizedText::new(),
            rights: LocalizedText::new(),
            subjects: BTreeSet::new(),
            creator: None,
            modifier: None,
            publisher: None,
            lock_owner: None,
            created_at: None,
            modified_at: None,
            published_at: None,
            publish_until: None,
            template: None,
            flags: ResourceFlags::INDEXED,
            pagelets: Vec::new(),
            content: Vec::new(),
            security: AccessRules::default(),
        }
    }

    pub fn page(uri: ResourceUri) -> Self {
        Self::new(PAGE_TYPE, uri)
    }

    pub fn file(uri: ResourceUri) -> Self {
        Self::new(FILE_TYPE, uri)
    }

    pub fn resource_type(&self) -> &str {
        self.uri.resource_type().unwrap_or(PAGE_TYPE)
    }

    pub fn with_title(mut self, language: impl Into<Language>, title: impl Into<String>) -> Self {
        self.title.set(language, title);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.insert(subject.into());
        self
    }

    pub fn with_creator(mut self, creator: User, at: DateTime<Utc>) -> Self {
        self.creator = Some(creator);
        self.created_at = Some(at);
        self
    }

    pub fn with_modifier(mut self, modifier: User, at: DateTime<Utc>) -> Self {
        self.modifier = Some(modifier);
        self.modified_at = Some(at);
        self
    }

    pub fn with_publisher(mut self, publisher: User, at: DateTime<Utc>) -> Self {
        self.publisher = Some(publisher);
        self.published_at = Some(at);
        self
    }

    pub fn with_template(mut self, template: &(impl TemplateRef + ?Sized)) -> Self {
        self.template = Some(template.identifier().to_string());
        self
    }

    pub fn with_security(mut self, security: AccessRules) -> Self {
        self.security = security;
        self
    }

    pub fn with_content(mut self, content: ResourceContent) -> Self {
        self.content.push(content);
        self
    }

    /// Appends a pagelet to the end of `composer`.
    pub fn with_pagelet(mut self, composer: impl Into<String>, mut pagelet: Pagelet) -> Self {
        let composer = composer.into();
        pagelet.position = self
            .pagelets
            .iter()
            .filter(|existing| existing.composer == composer)
            .count();
        pagelet.composer = composer;
        self.pagelets.push(pagelet);
        self
    }

    /// All languages the resource has content in.
    pub fn languages(&self) -> BTreeSet<Language> {
        let mut languages = BTreeSet::new();
        for text in [&self.title, &self.description, &self.coverage, &self.rights] {
            languages.extend(text.languages().cloned());
        }
        for pagelet in &self.pagelets {
            for element in pagelet.elements.values() {
                languages.extend(element.languages().cloned());
            }
        }
        languages.extend(self.content.iter().filter_map(|c| c.language.clone()));
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_are_lowercased() {
        assert_eq!(Language::new(" DE ").code(), "de");
        assert_eq!(Language::from("En"), Language::new("en"));
    }

    #[test]
    fn localized_text_fallback() {
        let text = LocalizedText::new().with("de", "Hallo");
        assert_eq!(text.get(&Language::new("en")), None);
        assert_eq!(text.get_or_any(&Language::new("en")), Some("Hallo"));
    }

    #[test]
    fn pagelets_are_positioned_per_composer() {
        let resource = Resource::page(ResourceUri::new("demo").with_path("/a"))
            .with_pagelet("main", Pagelet::new("text", "title"))
            .with_pagelet("main", Pagelet::new("text", "paragraph"))
            .with_pagelet("side", Pagelet::new("news", "teaser"));

        let positions = resource
            .pagelets
            .iter()
            .map(|p| (p.composer.as_str(), p.position))
            .collect::<Vec<_>>();
        assert_eq!(positions, vec![("main", 0), ("main", 1), ("side", 0)]);
    }

    #[test]
    fn languages_are_collected_from_all_fields() {
        let resource = Resource::page(ResourceUri::new("demo").with_path("/a"))
            .with_title("en", "Hello")
            .with_pagelet(
                "main",
                Pagelet::new("text", "title").with_element("title", "fr", "Bonjour"),
            )
            .with_content(ResourceContent {
                language: Some(Language::new("it")),
                filename: "a.pdf".to_string(),
                mimetype: "application/pdf".to_string(),
                size: 12,
            });

        let codes = resource
            .languages()
            .iter()
            .map(|l| l.code().to_string())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["en", "fr", "it"]);
    }

    #[test]
    fn new_resources_are_indexed_by_default() {
        let resource = Resource::file(ResourceUri::new("demo"));
        assert!(resource.flags.contains(ResourceFlags::INDEXED));
        assert_eq!(resource.resource_type(), FILE_TYPE);
    }
}
