//! Resource identity: `(site, path, id, version)`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

/// Version number of the published state of a resource.
pub const LIVE: u64 = 0;

/// Version number of the in-progress edit state of a resource.
pub const WORK: u64 = 1;

/// Returns a human readable name for a version number.
pub fn version_name(version: u64) -> String {
    match version {
        LIVE => "live".to_string(),
        WORK => "work".to_string(),
        other => other.to_string(),
    }
}

/// Points at one version of a resource.
///
/// Either the identifier or the path may be missing: lookups fall back to
/// whichever one is present, with the identifier taking precedence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceUri {
    site: String,
    id: Option<String>,
    path: Option<String>,
    version: u64,
    resource_type: Option<String>,
}

impl ResourceUri {
    /// Creates a uri for the live version of an unidentified resource.
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            id: None,
            path: None,
            version: LIVE,
            resource_type: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.id = (!id.trim().is_empty()).then(|| id.trim().to_string());
        self
    }

    /// Sets the path, normalizing separators.
    ///
    /// Invalid paths (empty or containing NUL bytes) clear the path.
    pub fn with_path(mut self, path: impl AsRef<str>) -> Self {
        self.path = normalize_path(path.as_ref()).ok();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Returns a copy of this uri pointing at another version.
    pub fn for_version(&self, version: u64) -> Self {
        self.clone().with_version(version)
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    /// Returns the identifier or an `InvalidInput` error naming the uri.
    pub fn require_id(&self) -> Result<&str> {
        self.id()
            .ok_or_else(|| RepositoryError::InvalidInput(format!("uri {self} has no identifier")))
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.site)?;
        match (&self.path, &self.id) {
            (Some(path), Some(id)) => write!(f, "{path}#{id}")?,
            (Some(path), None) => write!(f, "{path}")?,
            (None, Some(id)) => write!(f, "#{id}")?,
            (None, None) => write!(f, "?")?,
        }
        write!(f, "@{}", version_name(self.version))
    }
}

/// Normalizes a slash-delimited resource path.
///
/// The result always starts with `/`, has no duplicate separators and no
/// trailing separator unless it is the root itself.
pub fn normalize_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RepositoryError::InvalidInput(
            "resource path must not be empty".to_string(),
        ));
    }
    if trimmed.contains('\0') {
        return Err(RepositoryError::InvalidInput(format!(
            "resource path contains a NUL byte: {trimmed:?}"
        )));
    }

    let segments = trimmed
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    Ok(format!("/{}", segments.join("/")))
}

/// Number of segments below the root (`/` is 0, `/a/b` is 2).
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|segment| !segment.is_empty()).count()
}

/// Returns true if `path` equals `prefix` or lies below it.
pub fn path_is_within(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}
