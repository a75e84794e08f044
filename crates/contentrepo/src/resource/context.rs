//! Narrow capabilities the indexes need from their surroundings.

use super::model::Language;

/// The site a repository belongs to.
pub trait SiteContext: Send + Sync {
    fn identifier(&self) -> &str;

    fn default_language(&self) -> Language;

    fn languages(&self) -> Vec<Language> {
        vec![self.default_language()]
    }
}

/// Anything that names a page template.
pub trait TemplateRef {
    fn identifier(&self) -> &str;
}

impl TemplateRef for str {
    fn identifier(&self) -> &str {
        self
    }
}

impl TemplateRef for String {
    fn identifier(&self) -> &str {
        self.as_str()
    }
}

/// A site described by plain values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    identifier: String,
    languages: Vec<Language>,
}

impl Site {
    pub fn new(identifier: impl Into<String>, default_language: impl Into<Language>) -> Self {
        Self {
            identifier: identifier.into(),
            languages: vec![default_language.into()],
        }
    }

    pub fn with_language(mut self, language: impl Into<Language>) -> Self {
        let language = language.into();
        if !self.languages.contains(&language) {
            self.languages.push(language);
        }
        self
    }
}

impl SiteContext for Site {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn default_language(&self) -> Language {
        self.languages[0].clone()
    }

    fn languages(&self) -> Vec<Language> {
        self.languages.clone()
    }
}
